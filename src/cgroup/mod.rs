// Cgroup controller graph: a process-wide registry of (controller-set, path)
// nodes shared across containers by reference.

pub mod subsystem;

use crate::error::{RuntimeError, RuntimeResult};
use crate::utils::console::ConsoleLogger;
use crate::utils::constants::{
    CGROUP_REMOVE_PERIOD_MS, CGROUP_REMOVE_RETRIES, CGROUP_TMPFS,
};
use crate::utils::mounts::{Mount, MountSnapshot};
use crate::utils::process::{retry_busy, ProcessUtils};
use crate::utils::strings::{comma_list, lines_to_pids};
use nix::mount::MsFlags;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

/// Controllers this runtime knows how to mount and walk.
pub const SUPPORTED_CONTROLLERS: &[&str] = &[
    "cpuset",
    "cpu",
    "cpuacct",
    "memory",
    "devices",
    "freezer",
    "net_cls",
    "net_prio",
    "blkio",
    "perf_event",
    "hugetlb",
];

const CGROUP_DIR_MODE: u32 = 0o755;

/// Registry identity: controller set (comma list, sorted) plus the path
/// relative to the controller-set root.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CgroupKey {
    controllers: String,
    path: String,
}

static REGISTRY: OnceLock<Mutex<HashMap<CgroupKey, Weak<Cgroup>>>> = OnceLock::new();

fn registry() -> MutexGuard<'static, HashMap<CgroupKey, Weak<Cgroup>>> {
    REGISTRY
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One control group. Roots own the controller set and mountpoint; children
/// chain to their parent by strong reference, while parents only hold weak
/// references down, so drop order never cycles.
pub struct Cgroup {
    name: String,
    parent: Option<Arc<Cgroup>>,
    controllers: Vec<String>,
    mountpoint: PathBuf,
    children: Mutex<Vec<Weak<Cgroup>>>,
}

impl Cgroup {
    /// Get or create the root node for a controller set, mounted at the
    /// conventional holder path.
    pub fn root(controllers: &[&str]) -> Arc<Cgroup> {
        let mut set: Vec<String> = controllers.iter().map(|s| s.to_string()).collect();
        set.sort();
        let mountpoint = PathBuf::from(CGROUP_TMPFS).join(comma_list(&set));
        Self::root_at(set, mountpoint)
    }

    /// Root node for a controller set with an explicit mountpoint, used when
    /// rediscovering live mounts at restart.
    pub fn root_at(controllers: Vec<String>, mountpoint: PathBuf) -> Arc<Cgroup> {
        let key = CgroupKey {
            controllers: comma_list(&controllers),
            path: "/".to_string(),
        };
        let mut reg = registry();
        if let Some(existing) = reg.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        let root = Arc::new(Cgroup {
            name: "/".to_string(),
            parent: None,
            controllers,
            mountpoint,
            children: Mutex::new(Vec::new()),
        });
        reg.insert(key, Arc::downgrade(&root));
        root
    }

    /// Get or create a child node. At most one live object exists per
    /// identity; a second lookup returns the same shared owner.
    pub fn child(self: &Arc<Cgroup>, name: &str) -> Arc<Cgroup> {
        let key = CgroupKey {
            controllers: comma_list(self.root_controllers()),
            path: format!("{}/{}", self.relative_path().trim_end_matches('/'), name),
        };
        let mut reg = registry();
        if let Some(existing) = reg.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        let child = Arc::new(Cgroup {
            name: name.to_string(),
            parent: Some(self.clone()),
            controllers: Vec::new(),
            mountpoint: PathBuf::new(),
            children: Mutex::new(Vec::new()),
        });
        reg.insert(key, Arc::downgrade(&child));
        if let Ok(mut children) = self.children.lock() {
            children.retain(|w| w.upgrade().is_some());
            children.push(Arc::downgrade(&child));
        }
        child
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn root_node(self: &Arc<Cgroup>) -> Arc<Cgroup> {
        let mut node = self.clone();
        while let Some(parent) = node.parent.clone() {
            node = parent;
        }
        node
    }

    /// Controller names of the owning root.
    pub fn root_controllers(self: &Arc<Cgroup>) -> Vec<String> {
        self.root_node().controllers.clone()
    }

    /// Path relative to the controller-set root, "/" for the root itself.
    pub fn relative_path(&self) -> String {
        match &self.parent {
            None => "/".to_string(),
            Some(parent) => {
                let base = parent.relative_path();
                if base == "/" {
                    format!("/{}", self.name)
                } else {
                    format!("{}/{}", base, self.name)
                }
            }
        }
    }

    /// Absolute filesystem path under the controller mount.
    pub fn path(&self) -> PathBuf {
        match &self.parent {
            None => self.mountpoint.clone(),
            Some(parent) => parent.path().join(&self.name),
        }
    }

    fn root_mount(&self) -> Mount {
        let options: BTreeSet<String> = self.controllers.iter().cloned().collect();
        Mount::new("cgroup", self.path(), "cgroup", MsFlags::empty(), options)
    }

    /// Create this node. Roots mount the tmpfs holder (when absent) and the
    /// per-set cgroup filesystem; an equal existing mount makes either step
    /// a no-op. Children mkdir after recursively creating the parent.
    pub fn create(self: &Arc<Cgroup>) -> RuntimeResult<()> {
        if self.is_root() {
            let snapshot = MountSnapshot::take()?;
            let holder = Mount::new(
                "cgroup",
                CGROUP_TMPFS,
                "tmpfs",
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                BTreeSet::from(["mode=755".to_string()]),
            );
            let own = self.root_mount();
            if snapshot.contains(&own) {
                return Ok(());
            }
            if snapshot.find_target(&PathBuf::from(CGROUP_TMPFS)).is_none() {
                fs::create_dir_all(CGROUP_TMPFS).map_err(RuntimeError::from)?;
                holder.mount()?;
            }
            fs::create_dir_all(self.path()).map_err(RuntimeError::from)?;
            own.mount()?;
        } else {
            if let Some(parent) = &self.parent {
                parent.create()?;
            }
            let path = self.path();
            if !path.exists() {
                use std::os::unix::fs::PermissionsExt;
                fs::create_dir(&path).map_err(RuntimeError::from)?;
                let _ = fs::set_permissions(&path, fs::Permissions::from_mode(CGROUP_DIR_MODE));
            }
        }
        Ok(())
    }

    /// Remove this node. Non-roots first empty the `tasks` file by killing
    /// every listed pid, with linear backoff, then rmdir under the shared
    /// busy-retry helper. Roots unmount.
    pub fn remove(self: &Arc<Cgroup>) -> RuntimeResult<()> {
        if self.is_root() {
            return self.root_mount().umount();
        }

        for attempt in 0..CGROUP_REMOVE_RETRIES {
            let tasks = self.tasks()?;
            if tasks.is_empty() {
                break;
            }
            ConsoleLogger::debug(&format!(
                "Cgroup {} still holds {} task(s), killing",
                self.path().display(),
                tasks.len()
            ));
            self.kill(Signal::SIGKILL)?;
            // Linear backoff inside the 5-50ms band.
            let pause = 5 + (45 * attempt as u64) / CGROUP_REMOVE_RETRIES as u64;
            std::thread::sleep(std::time::Duration::from_millis(pause));
        }

        let path = self.path();
        retry_busy(CGROUP_REMOVE_RETRIES, CGROUP_REMOVE_PERIOD_MS, || {
            match fs::remove_dir(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(RuntimeError::from(e)),
            }
        })
    }

    /// Deliver a signal to every task currently in this cgroup. Root
    /// cgroups are never killed.
    pub fn kill(self: &Arc<Cgroup>, signal: Signal) -> RuntimeResult<()> {
        if self.is_root() {
            return Ok(());
        }
        for pid in self.tasks()? {
            let _ = ProcessUtils::send_signal(Pid::from_raw(pid), signal);
        }
        Ok(())
    }

    pub fn tasks(&self) -> RuntimeResult<Vec<i32>> {
        lines_to_pids(&self.get_knob("tasks")?)
    }

    pub fn processes(&self) -> RuntimeResult<Vec<i32>> {
        lines_to_pids(&self.get_knob("cgroup.procs")?)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks().map(|t| t.is_empty()).unwrap_or(true)
    }

    /// Attach a process. Attaching to a root is a no-op: every process is
    /// born in the root hierarchy anyway.
    pub fn attach(&self, pid: Pid) -> RuntimeResult<()> {
        if self.is_root() {
            return Ok(());
        }
        self.set_knob("cgroup.procs", &pid.to_string(), true)
    }

    pub fn get_knob(&self, knob: &str) -> RuntimeResult<String> {
        let path = self.path().join(knob);
        fs::read_to_string(&path).map_err(|e| {
            RuntimeError::from_errno(
                nix::errno::Errno::from_i32(e.raw_os_error().unwrap_or(0)),
                format!("read({})", path.display()),
            )
        })
    }

    pub fn set_knob(&self, knob: &str, value: &str, append: bool) -> RuntimeResult<()> {
        use std::io::Write;
        let path = self.path().join(knob);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .append(append)
            .open(&path)
            .map_err(|e| {
                RuntimeError::from_errno(
                    nix::errno::Errno::from_i32(e.raw_os_error().unwrap_or(0)),
                    format!("open({})", path.display()),
                )
            })?;
        file.write_all(value.as_bytes()).map_err(|e| {
            RuntimeError::from_errno(
                nix::errno::Errno::from_i32(e.raw_os_error().unwrap_or(0)),
                format!("write({}, {})", path.display(), value),
            )
        })
    }

    /// Walk the on-disk subtree, registering every directory found and
    /// returning the nodes depth-first with self last.
    pub fn find_children(self: &Arc<Cgroup>) -> RuntimeResult<Vec<Arc<Cgroup>>> {
        let mut found = Vec::new();
        let entries = match fs::read_dir(self.path()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                found.push(self.clone());
                return Ok(found);
            }
            Err(e) => return Err(RuntimeError::from(e)),
        };
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                let child = self.child(&entry.file_name().to_string_lossy());
                found.extend(child.find_children()?);
            }
        }
        found.push(self.clone());
        Ok(found)
    }
}

impl Drop for Cgroup {
    fn drop(&mut self) {
        let key = CgroupKey {
            controllers: match &self.parent {
                None => comma_list(&self.controllers),
                Some(parent) => {
                    let mut node = parent.clone();
                    while let Some(next) = node.parent.clone() {
                        node = next;
                    }
                    comma_list(&node.controllers)
                }
            },
            path: self.relative_path(),
        };
        let mut reg = registry();
        // Only drop the key if the weak pointer actually expired; a fresh
        // object may already have replaced it.
        if let Some(weak) = reg.get(&key) {
            if weak.upgrade().is_none() {
                reg.remove(&key);
            }
        }
    }
}

impl PartialEq for Cgroup {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl std::fmt::Debug for Cgroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cgroup")
            .field("path", &self.path())
            .field("root", &self.is_root())
            .finish()
    }
}

/// The cgroup hierarchies currently mounted, discovered from the mount
/// table. Used at restart to re-register nodes that survived a crash.
pub struct CgroupSnapshot {
    pub roots: Vec<Arc<Cgroup>>,
    pub cgroups: Vec<Arc<Cgroup>>,
    pub subsystems: HashMap<String, Arc<subsystem::Subsystem>>,
}

impl CgroupSnapshot {
    pub fn take() -> RuntimeResult<Self> {
        let mounts = MountSnapshot::take()?;
        Self::from_mounts(&mounts)
    }

    pub fn from_mounts(mounts: &MountSnapshot) -> RuntimeResult<Self> {
        let mut snapshot = CgroupSnapshot {
            roots: Vec::new(),
            cgroups: Vec::new(),
            subsystems: HashMap::new(),
        };
        for mount in mounts.mounts() {
            if mount.fstype != "cgroup" {
                continue;
            }
            let mut controllers: Vec<String> = mount
                .options
                .iter()
                .filter(|opt| SUPPORTED_CONTROLLERS.contains(&opt.as_str()))
                .cloned()
                .collect();
            if controllers.is_empty() {
                continue;
            }
            controllers.sort();
            for name in &controllers {
                snapshot
                    .subsystems
                    .insert(name.clone(), subsystem::subsystem(name));
            }
            let root = Cgroup::root_at(controllers, mount.target.clone());
            snapshot.cgroups.extend(root.find_children()?);
            snapshot.roots.push(root);
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_returns_shared_owner() {
        let root = Cgroup::root(&["memory", "testone"]);
        let a = root.child("box-1");
        let b = root.child("box-1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(Arc::strong_count(&a), 2);
    }

    #[test]
    fn identity_separates_controller_sets() {
        let mem = Cgroup::root(&["memory", "testtwo"]);
        let cpu = Cgroup::root(&["cpu", "testtwo"]);
        let a = mem.child("box");
        let b = cpu.child("box");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.relative_path(), b.relative_path());
    }

    #[test]
    fn expired_entries_are_replaced() {
        let root = Cgroup::root(&["freezer", "testthree"]);
        let first = root.child("gone");
        let first_path = first.path();
        drop(first);
        let second = root.child("gone");
        assert_eq!(second.path(), first_path);
    }

    #[test]
    fn paths_chain_through_parents() {
        let root = Cgroup::root(&["cpu", "cpuacct", "testfour"]);
        let leaf = root.child("warren").child("ct-7");
        assert_eq!(leaf.relative_path(), "/warren/ct-7");
        assert!(leaf
            .path()
            .to_string_lossy()
            .ends_with("cpu,cpuacct,testfour/warren/ct-7"));
        assert!(!leaf.is_root());
        assert!(root.is_root());
    }

    #[test]
    fn controller_sets_are_sorted() {
        let root = Cgroup::root(&["net_cls", "cpu"]);
        assert_eq!(root.root_controllers(), vec!["cpu", "net_cls"]);
    }

    #[test]
    fn snapshot_registers_known_controllers() {
        let sample = "\
30 22 0:25 / /sys/fs/cgroup rw,nosuid shared:8 - tmpfs tmpfs rw,mode=755
33 30 0:28 / /sys/fs/cgroup/memory rw,nosuid,relatime shared:11 - cgroup cgroup rw,memory
34 30 0:29 / /sys/fs/cgroup/weird rw shared:12 - cgroup cgroup rw,name=systemd";
        let mounts = MountSnapshot::parse(sample);
        // The on-disk walk of / will not find our fake paths; point the
        // parse at mounts only.
        let snapshot = CgroupSnapshot::from_mounts(&mounts).unwrap();
        assert_eq!(snapshot.roots.len(), 1);
        assert_eq!(snapshot.roots[0].root_controllers(), vec!["memory"]);
        assert!(snapshot.subsystems.contains_key("memory"));
        assert!(!snapshot.subsystems.contains_key("name=systemd"));
    }
}
