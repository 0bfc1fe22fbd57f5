use crate::error::{RuntimeError, RuntimeResult};
use std::fs;

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: i32,
}

#[repr(C)]
#[derive(Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// Capability bitset applied to a task before exec: one 64-bit word each
/// for effective, permitted and inheritable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub effective: u64,
    pub permitted: u64,
    pub inheritable: u64,
}

#[allow(dead_code)] // Bitset surface used by spec-level callers and tests
impl Capabilities {
    /// All three words share the same bitset, which is how task specs
    /// express their capability set.
    pub fn all_same(bits: u64) -> Self {
        Capabilities {
            effective: bits,
            permitted: bits,
            inheritable: bits,
        }
    }

    pub fn has(&self, cap: u8) -> bool {
        self.permitted & (1u64 << cap) != 0
    }

    pub fn set(&mut self, cap: u8) {
        let bit = 1u64 << cap;
        self.effective |= bit;
        self.permitted |= bit;
        self.inheritable |= bit;
    }

    pub fn clear(&mut self, cap: u8) {
        let bit = !(1u64 << cap);
        self.effective &= bit;
        self.permitted &= bit;
        self.inheritable &= bit;
    }
}

/// Highest capability number supported by the running kernel.
pub fn last_cap() -> RuntimeResult<u8> {
    let data = fs::read_to_string("/proc/sys/kernel/cap_last_cap").map_err(RuntimeError::from)?;
    data.trim().parse::<u8>().map_err(|_| {
        RuntimeError::invalid_value("last_cap(/proc/sys/kernel/cap_last_cap): bad value")
    })
}

/// Drop every bounding-set capability outside `caps.permitted`, then install
/// the three-word set with one capset call (V3 header, two data words).
pub fn apply_capabilities(caps: &Capabilities) -> RuntimeResult<()> {
    let last = last_cap()?;
    for cap in 0..=last {
        if !caps.has(cap) {
            let ret = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) };
            if ret != 0 {
                return Err(RuntimeError::from_errno(
                    nix::errno::Errno::last(),
                    format!("prctl(PR_CAPBSET_DROP, {})", cap),
                ));
            }
        }
    }

    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let data = [
        CapUserData {
            effective: caps.effective as u32,
            permitted: caps.permitted as u32,
            inheritable: caps.inheritable as u32,
        },
        CapUserData {
            effective: (caps.effective >> 32) as u32,
            permitted: (caps.permitted >> 32) as u32,
            inheritable: (caps.inheritable >> 32) as u32,
        },
    ];

    let ret = unsafe { libc::syscall(libc::SYS_capset, &header, data.as_ptr()) };
    if ret != 0 {
        return Err(RuntimeError::from_errno(
            nix::errno::Errno::last(),
            format!("capset({:#x})", caps.permitted),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitset_ops() {
        let mut caps = Capabilities::all_same(0);
        assert!(!caps.has(12));
        caps.set(12);
        assert!(caps.has(12));
        assert_eq!(caps.effective, 1 << 12);
        caps.clear(12);
        assert!(!caps.has(12));
        assert_eq!(caps.inheritable, 0);
    }

    #[test]
    fn word_split_covers_high_caps() {
        // Cap 38 (CAP_PERFMON) lands in the second capset data word.
        let caps = Capabilities::all_same(1u64 << 38);
        assert_eq!((caps.permitted >> 32) as u32, 1 << 6);
        assert_eq!(caps.permitted as u32, 0);
    }

    #[test]
    fn last_cap_is_sane() {
        if let Ok(last) = last_cap() {
            assert!(last >= 30, "kernel reports suspicious cap_last_cap {}", last);
        }
    }
}
