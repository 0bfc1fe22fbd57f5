use crate::cgroup::Cgroup;
use crate::error::{RuntimeError, RuntimeResult};
use crate::utils::constants::FREEZER_DEADLINE_MS;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

/// A cgroup controller. Singleton per name, handed out by `subsystem()`.
#[derive(Debug)]
pub struct Subsystem {
    name: String,
}

static SUBSYSTEMS: OnceLock<Mutex<HashMap<String, Arc<Subsystem>>>> = OnceLock::new();

fn subsystems() -> MutexGuard<'static, HashMap<String, Arc<Subsystem>>> {
    SUBSYSTEMS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Get or insert the singleton for a controller name.
pub fn subsystem(name: &str) -> Arc<Subsystem> {
    let mut map = subsystems();
    map.entry(name.to_string())
        .or_insert_with(|| Arc::new(Subsystem { name: name.to_string() }))
        .clone()
}

impl Subsystem {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Subsystem {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

/// Typed knob setters for the memory controller.
pub struct MemorySubsystem;

#[allow(dead_code)] // Knob surface exceeds what the start pipeline sets
impl MemorySubsystem {
    pub fn set_limit(cg: &Cgroup, bytes: u64) -> RuntimeResult<()> {
        cg.set_knob("memory.limit_in_bytes", &bytes.to_string(), false)
    }

    pub fn set_guarantee(cg: &Cgroup, bytes: u64) -> RuntimeResult<()> {
        cg.set_knob("memory.low_limit_in_bytes", &bytes.to_string(), false)
    }

    pub fn use_hierarchy(cg: &Cgroup) -> RuntimeResult<()> {
        cg.set_knob("memory.use_hierarchy", "1", false)
    }

    pub fn usage(cg: &Cgroup) -> RuntimeResult<u64> {
        let raw = cg.get_knob("memory.usage_in_bytes")?;
        raw.trim()
            .parse()
            .map_err(|_| RuntimeError::invalid_value("memory.usage_in_bytes: bad value"))
    }
}

/// Typed knob setters for the cpu controller.
pub struct CpuSubsystem;

#[allow(dead_code)]
impl CpuSubsystem {
    pub fn set_shares(cg: &Cgroup, shares: u64) -> RuntimeResult<()> {
        cg.set_knob("cpu.shares", &shares.to_string(), false)
    }

    /// Hard cap as a fraction of one cpu: quota/period microseconds.
    pub fn set_quota(cg: &Cgroup, quota_us: i64, period_us: u64) -> RuntimeResult<()> {
        cg.set_knob("cpu.cfs_period_us", &period_us.to_string(), false)?;
        cg.set_knob("cpu.cfs_quota_us", &quota_us.to_string(), false)
    }
}

/// net_cls tags packets with a classid consumed by the tc cgroup filter.
pub struct NetClsSubsystem;

impl NetClsSubsystem {
    pub fn set_classid(cg: &Cgroup, classid: u32) -> RuntimeResult<()> {
        cg.set_knob("net_cls.classid", &classid.to_string(), false)
    }
}

pub struct BlkioSubsystem;

#[allow(dead_code)]
impl BlkioSubsystem {
    pub fn set_weight(cg: &Cgroup, weight: u16) -> RuntimeResult<()> {
        cg.set_knob("blkio.weight", &weight.to_string(), false)
    }
}

pub struct DevicesSubsystem;

#[allow(dead_code)]
impl DevicesSubsystem {
    /// Rule syntax is the kernel's: "type major:minor access".
    pub fn allow(cg: &Cgroup, rule: &str) -> RuntimeResult<()> {
        cg.set_knob("devices.allow", rule, false)
    }

    pub fn deny(cg: &Cgroup, rule: &str) -> RuntimeResult<()> {
        cg.set_knob("devices.deny", rule, false)
    }
}

const FREEZER_FROZEN: &str = "FROZEN";
const FREEZER_THAWED: &str = "THAWED";

/// Freezer state machine: write the target state, then poll the read-back
/// until it settles or the deadline expires.
pub struct FreezerSubsystem;

#[allow(dead_code)]
impl FreezerSubsystem {
    pub fn freeze(cg: &Cgroup) -> RuntimeResult<()> {
        Self::set_state(cg, FREEZER_FROZEN)
    }

    pub fn thaw(cg: &Cgroup) -> RuntimeResult<()> {
        Self::set_state(cg, FREEZER_THAWED)
    }

    pub fn is_frozen(cg: &Cgroup) -> bool {
        cg.get_knob("freezer.state")
            .map(|s| s.trim() == FREEZER_FROZEN)
            .unwrap_or(false)
    }

    fn set_state(cg: &Cgroup, target: &str) -> RuntimeResult<()> {
        cg.set_knob("freezer.state", target, false)?;

        let deadline = Instant::now() + Duration::from_millis(FREEZER_DEADLINE_MS);
        loop {
            let state = cg.get_knob("freezer.state")?;
            if state.trim() == target {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RuntimeError::transient(format!(
                    "freezer({}): stuck in {} while reaching {}",
                    cg.path().display(),
                    state.trim(),
                    target
                )));
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singletons_per_name() {
        let a = subsystem("memory");
        let b = subsystem("memory");
        let c = subsystem("freezer");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.name(), "memory");
    }

    #[test]
    fn subsystem_equality_is_by_name() {
        let a = Subsystem { name: "cpu".into() };
        let b = Subsystem { name: "cpu".into() };
        let c = Subsystem { name: "blkio".into() };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
