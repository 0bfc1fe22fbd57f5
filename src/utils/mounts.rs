use crate::error::{RuntimeError, RuntimeResult};
use crate::utils::strings::comma_list;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// One mount: source, mountpoint, filesystem type, flag bitmask and the
/// per-fs option set. Two mounts are equal when all four match.
#[derive(Debug, Clone)]
pub struct Mount {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
    pub flags: MsFlags,
    pub options: BTreeSet<String>,
}

impl PartialEq for Mount {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
            && self.target == other.target
            && self.fstype == other.fstype
            && self.options == other.options
    }
}

impl Eq for Mount {}

impl Mount {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<PathBuf>,
        fstype: impl Into<String>,
        flags: MsFlags,
        options: BTreeSet<String>,
    ) -> Self {
        Mount {
            source: source.into(),
            target: target.into(),
            fstype: fstype.into(),
            flags,
            options,
        }
    }

    /// Perform the mount. Option set is passed as comma-separated fs data.
    pub fn mount(&self) -> RuntimeResult<()> {
        let data = comma_list(&self.options);
        let data = if data.is_empty() {
            None
        } else {
            Some(data.as_str())
        };
        mount(
            Some(self.source.as_str()),
            &self.target,
            Some(self.fstype.as_str()),
            self.flags,
            data,
        )
        .map_err(|e| {
            RuntimeError::from_errno(
                e,
                format!("mount({}, {}, {})", self.source, self.target.display(), self.fstype),
            )
        })
    }

    pub fn umount(&self) -> RuntimeResult<()> {
        umount2(&self.target, MntFlags::empty()).map_err(|e| {
            RuntimeError::from_errno(e, format!("umount({})", self.target.display()))
        })
    }

    /// Parse one /proc/self/mountinfo line.
    ///
    /// Format: `id parent maj:min root mountpoint mount-opts [tags...] -
    /// fstype source super-opts`.
    fn parse_line(line: &str) -> Option<Mount> {
        let mut parts = line.split_whitespace();
        let _id = parts.next()?;
        let _parent = parts.next()?;
        let _dev = parts.next()?;
        let _root = parts.next()?;
        let target = PathBuf::from(parts.next()?);
        let mount_opts = parts.next()?;

        // Skip optional tags until the separator.
        let mut rest = parts.skip_while(|p| *p != "-");
        rest.next()?; // the "-" itself
        let fstype = rest.next()?.to_string();
        let source = rest.next()?.to_string();
        let super_opts = rest.next().unwrap_or("");

        let mut flags = MsFlags::empty();
        let mut options = BTreeSet::new();
        for opt in mount_opts.split(',').chain(super_opts.split(',')) {
            match opt {
                "rw" | "" => {}
                "ro" => flags |= MsFlags::MS_RDONLY,
                "nosuid" => flags |= MsFlags::MS_NOSUID,
                "nodev" => flags |= MsFlags::MS_NODEV,
                "noexec" => flags |= MsFlags::MS_NOEXEC,
                "noatime" => flags |= MsFlags::MS_NOATIME,
                "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
                "relatime" => flags |= MsFlags::MS_RELATIME,
                "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
                other => {
                    options.insert(other.to_string());
                }
            }
        }

        Some(Mount {
            source,
            target,
            fstype,
            flags,
            options,
        })
    }
}

/// Ordered snapshot of /proc/self/mountinfo.
pub struct MountSnapshot {
    mounts: Vec<Mount>,
}

impl MountSnapshot {
    pub fn take() -> RuntimeResult<Self> {
        let data = fs::read_to_string("/proc/self/mountinfo").map_err(RuntimeError::from)?;
        Ok(Self::parse(&data))
    }

    pub fn parse(data: &str) -> Self {
        MountSnapshot {
            mounts: data.lines().filter_map(Mount::parse_line).collect(),
        }
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    pub fn contains(&self, mount: &Mount) -> bool {
        self.mounts.iter().any(|m| m == mount)
    }

    pub fn find_target(&self, target: &Path) -> Option<&Mount> {
        self.mounts.iter().find(|m| m.target == target)
    }
}

/// Bind-mount `source` onto `target`; read-only bindings need a second
/// remount pass because MS_RDONLY is ignored on the initial bind.
pub fn bind_mount(source: &Path, target: &Path, read_only: bool) -> RuntimeResult<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| {
        RuntimeError::from_errno(
            e,
            format!("mount({}, {}, bind)", source.display(), target.display()),
        )
    })?;

    if read_only {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| {
            RuntimeError::from_errno(e, format!("remount({}, ro)", target.display()))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 26 0:20 / /sys rw,nosuid,nodev,noexec,relatime shared:2 - sysfs sysfs rw
26 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw,errors=remount-ro
30 22 0:25 / /sys/fs/cgroup rw,nosuid,nodev,noexec shared:8 - tmpfs tmpfs ro,mode=755
33 30 0:28 / /sys/fs/cgroup/cpu,cpuacct rw,nosuid,nodev,noexec,relatime shared:11 - cgroup cgroup rw,cpu,cpuacct
40 26 0:34 / /data rw,relatime shared:20 master:1 - ext4 /dev/loop3 rw";

    #[test]
    fn parses_mountinfo() {
        let snapshot = MountSnapshot::parse(SAMPLE);
        assert_eq!(snapshot.mounts().len(), 5);

        let root = snapshot.find_target(Path::new("/")).unwrap();
        assert_eq!(root.source, "/dev/sda1");
        assert_eq!(root.fstype, "ext4");
        assert!(root.options.contains("errors=remount-ro"));
    }

    #[test]
    fn optional_tags_are_skipped() {
        let snapshot = MountSnapshot::parse(SAMPLE);
        let data = snapshot.find_target(Path::new("/data")).unwrap();
        assert_eq!(data.source, "/dev/loop3");
        assert_eq!(data.fstype, "ext4");
    }

    #[test]
    fn cgroup_controllers_land_in_options() {
        let snapshot = MountSnapshot::parse(SAMPLE);
        let cg = snapshot
            .find_target(Path::new("/sys/fs/cgroup/cpu,cpuacct"))
            .unwrap();
        assert_eq!(cg.fstype, "cgroup");
        assert!(cg.options.contains("cpu"));
        assert!(cg.options.contains("cpuacct"));
    }

    #[test]
    fn equality_ignores_flags_but_not_options() {
        let a = Mount::new(
            "cgroup",
            "/sys/fs/cgroup/memory",
            "cgroup",
            MsFlags::empty(),
            BTreeSet::from(["memory".to_string()]),
        );
        let mut b = a.clone();
        b.flags = MsFlags::MS_NOSUID;
        assert_eq!(a, b);
        b.options.insert("cpu".to_string());
        assert_ne!(a, b);
    }

    #[test]
    fn snapshot_contains() {
        let snapshot = MountSnapshot::parse(SAMPLE);
        let probe = Mount::new(
            "cgroup",
            "/sys/fs/cgroup/cpu,cpuacct",
            "cgroup",
            MsFlags::empty(),
            BTreeSet::from(["cpu".to_string(), "cpuacct".to_string()]),
        );
        assert!(snapshot.contains(&probe));
    }
}
