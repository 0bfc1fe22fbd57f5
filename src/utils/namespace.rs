use crate::error::{RuntimeError, RuntimeResult};
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, Pid};
use std::os::unix::io::RawFd;

/// An open descriptor on another process's namespace file, good for setns
/// until dropped.
#[derive(Debug)]
pub struct NamespaceFd {
    fd: RawFd,
    nstype: CloneFlags,
    name: &'static str,
}

#[allow(dead_code)]
impl NamespaceFd {
    pub fn open(pid: Pid, name: &'static str, nstype: CloneFlags) -> RuntimeResult<Self> {
        let path = format!("/proc/{}/ns/{}", pid, name);
        let fd = open(path.as_str(), OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
            .map_err(|e| RuntimeError::from_errno(e, format!("open({})", path)))?;
        Ok(NamespaceFd { fd, nstype, name })
    }

    /// Move the calling thread into this namespace.
    pub fn enter(&self) -> RuntimeResult<()> {
        setns(self.fd, self.nstype)
            .map_err(|e| RuntimeError::from_errno(e, format!("setns({})", self.name)))
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for NamespaceFd {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}

/// Held descriptors for every namespace of a process. The launcher takes a
/// snapshot of the parent before forking so the child can re-enter them
/// instead of unsharing.
#[derive(Debug, Default)]
pub struct NamespaceSnapshot {
    pub mnt: Option<NamespaceFd>,
    pub net: Option<NamespaceFd>,
    pub pid: Option<NamespaceFd>,
    pub ipc: Option<NamespaceFd>,
    pub uts: Option<NamespaceFd>,
    pub user: Option<NamespaceFd>,
}

#[allow(dead_code)] // Entry path is exercised when tasks join existing namespaces
impl NamespaceSnapshot {
    /// Open every namespace of `pid` that the kernel exposes. A missing
    /// namespace file (older kernel) is skipped, anything else propagates.
    pub fn open(pid: Pid) -> RuntimeResult<Self> {
        let mut snapshot = NamespaceSnapshot::default();
        snapshot.mnt = Self::try_open(pid, "mnt", CloneFlags::CLONE_NEWNS)?;
        snapshot.net = Self::try_open(pid, "net", CloneFlags::CLONE_NEWNET)?;
        snapshot.pid = Self::try_open(pid, "pid", CloneFlags::CLONE_NEWPID)?;
        snapshot.ipc = Self::try_open(pid, "ipc", CloneFlags::CLONE_NEWIPC)?;
        snapshot.uts = Self::try_open(pid, "uts", CloneFlags::CLONE_NEWUTS)?;
        snapshot.user = Self::try_open(pid, "user", CloneFlags::CLONE_NEWUSER)?;
        Ok(snapshot)
    }

    fn try_open(
        pid: Pid,
        name: &'static str,
        nstype: CloneFlags,
    ) -> RuntimeResult<Option<NamespaceFd>> {
        match NamespaceFd::open(pid, name, nstype) {
            Ok(fd) => Ok(Some(fd)),
            Err(e) if e.kind == crate::error::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Enter every held namespace. User first, then mount, then the rest:
    /// entering mnt drops access to /proc of the old root, so descriptors
    /// must already be open.
    pub fn enter(&self) -> RuntimeResult<()> {
        if let Some(user) = &self.user {
            user.enter()?;
        }
        if let Some(mnt) = &self.mnt {
            mnt.enter()?;
        }
        for ns in [&self.net, &self.pid, &self.ipc, &self.uts].into_iter().flatten() {
            ns.enter()?;
        }
        Ok(())
    }

    /// Descriptors the child must keep open across the stdio sweep.
    pub fn raw_fds(&self) -> Vec<RawFd> {
        [&self.mnt, &self.net, &self.pid, &self.ipc, &self.uts, &self.user]
            .into_iter()
            .flatten()
            .map(|ns| ns.raw_fd())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn snapshot_of_self_holds_descriptors() {
        let snapshot = NamespaceSnapshot::open(getpid()).unwrap();
        // mnt and net exist on any kernel this runtime supports
        assert!(snapshot.mnt.is_some());
        assert!(snapshot.net.is_some());
        assert!(snapshot.raw_fds().len() >= 2);
    }

    #[test]
    fn missing_process_is_not_found() {
        let err = NamespaceFd::open(Pid::from_raw(i32::MAX - 1), "net", CloneFlags::CLONE_NEWNET)
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }
}
