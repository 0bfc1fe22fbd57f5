// Volume storage backends. Dispatch is a tagged variant: every backend
// implements the same six operations against the owning volume's data.

use crate::error::{RuntimeError, RuntimeResult};
use crate::utils::command::CommandExecutor;
use crate::utils::console::ConsoleLogger;
use crate::utils::constants::{MAX_LOOP_VOLUME_BYTES, MIN_LOOP_VOLUME_BYTES};
use crate::utils::mounts::{bind_mount, Mount};
use crate::volume::Volume;
use nix::mount::MsFlags;
use nix::sys::statvfs::statvfs;
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;
const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_SET_CAPACITY: libc::c_ulong = 0x4C07;

/// Filesystem usage as reported to clients and the guarantee checker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatFs {
    pub space_used: u64,
    pub space_available: u64,
    pub inode_used: u64,
    pub inode_available: u64,
}

pub fn stat_path(path: &Path) -> RuntimeResult<StatFs> {
    let stat = statvfs(path)
        .map_err(|e| RuntimeError::from_errno(e, format!("statvfs({})", path.display())))?;
    let frsize = stat.fragment_size() as u64;
    Ok(StatFs {
        space_used: (stat.blocks() as u64).saturating_sub(stat.blocks_free() as u64) * frsize,
        space_available: stat.blocks_available() as u64 * frsize,
        inode_used: (stat.files() as u64).saturating_sub(stat.files_free() as u64),
        inode_available: stat.files_available() as u64,
    })
}

/// The storage backend of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Dir,
    Plain,
    Loop,
    Overlay,
    Tmpfs,
    HugeTmpfs,
    Rbd,
    Lvm,
    Quota,
}

impl BackendKind {
    pub fn from_name(name: &str) -> RuntimeResult<Self> {
        match name {
            "dir" | "" => Ok(BackendKind::Dir),
            "plain" => Ok(BackendKind::Plain),
            "loop" => Ok(BackendKind::Loop),
            "overlay" => Ok(BackendKind::Overlay),
            "tmpfs" => Ok(BackendKind::Tmpfs),
            "hugetmpfs" => Ok(BackendKind::HugeTmpfs),
            "rbd" => Ok(BackendKind::Rbd),
            "lvm" => Ok(BackendKind::Lvm),
            "quota" => Ok(BackendKind::Quota),
            other => Err(RuntimeError::invalid_value(format!(
                "backend({}): unknown backend",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Dir => "dir",
            BackendKind::Plain => "plain",
            BackendKind::Loop => "loop",
            BackendKind::Overlay => "overlay",
            BackendKind::Tmpfs => "tmpfs",
            BackendKind::HugeTmpfs => "hugetmpfs",
            BackendKind::Rbd => "rbd",
            BackendKind::Lvm => "lvm",
            BackendKind::Quota => "quota",
        }
    }

    /// Validate the spec against what this backend can express.
    pub fn configure(&self, volume: &Volume) -> RuntimeResult<()> {
        match self {
            BackendKind::Dir | BackendKind::Plain | BackendKind::Quota => {
                if !volume.layers.is_empty() {
                    return Err(RuntimeError::invalid_value(format!(
                        "backend({}): layers are not supported",
                        self.name()
                    )));
                }
                Ok(())
            }
            BackendKind::Overlay => {
                if volume.layers.is_empty() {
                    return Err(RuntimeError::invalid_value(
                        "backend(overlay): no layers given",
                    ));
                }
                Ok(())
            }
            BackendKind::Loop => {
                if volume.space_limit < MIN_LOOP_VOLUME_BYTES
                    || volume.space_limit > MAX_LOOP_VOLUME_BYTES
                {
                    return Err(RuntimeError::invalid_value(format!(
                        "backend(loop): space_limit {} outside [{}, {}]",
                        volume.space_limit, MIN_LOOP_VOLUME_BYTES, MAX_LOOP_VOLUME_BYTES
                    )));
                }
                Ok(())
            }
            BackendKind::Tmpfs | BackendKind::HugeTmpfs => {
                if volume.space_limit == 0 {
                    return Err(RuntimeError::invalid_value(format!(
                        "backend({}): space_limit is required",
                        self.name()
                    )));
                }
                Ok(())
            }
            BackendKind::Rbd | BackendKind::Lvm => {
                if volume.device_name.is_empty() {
                    return Err(RuntimeError::invalid_value(format!(
                        "backend({}): device_name is required",
                        self.name()
                    )));
                }
                Ok(())
            }
        }
    }

    /// Idempotent build: on success the volume is mounted at its host path.
    pub fn build(&self, volume: &mut Volume) -> RuntimeResult<()> {
        fs::create_dir_all(&volume.path).map_err(RuntimeError::from)?;
        match self {
            BackendKind::Dir => bind_mount(&volume.storage, &volume.path, volume.read_only),
            BackendKind::Plain => {
                fs::create_dir_all(&volume.storage).map_err(RuntimeError::from)?;
                apply_ownership(volume, &volume.storage)?;
                bind_mount(&volume.storage, &volume.path, volume.read_only)
            }
            BackendKind::Quota => {
                fs::create_dir_all(&volume.storage).map_err(RuntimeError::from)?;
                apply_ownership(volume, &volume.storage)?;
                apply_project_quota(volume)?;
                bind_mount(&volume.storage, &volume.path, volume.read_only)
            }
            BackendKind::Loop => build_loop(volume),
            BackendKind::Overlay => build_overlay(volume),
            BackendKind::Tmpfs => build_tmpfs(volume, "tmpfs"),
            BackendKind::HugeTmpfs => build_tmpfs(volume, "hugetlbfs"),
            BackendKind::Rbd => build_rbd(volume),
            BackendKind::Lvm => build_lvm(volume),
        }
    }

    /// Unmount and drop the backing resources.
    pub fn delete(&self, volume: &mut Volume) -> RuntimeResult<()> {
        let umount_result = umount_volume(&volume.path);
        match self {
            BackendKind::Dir | BackendKind::Plain | BackendKind::Quota => umount_result,
            BackendKind::Tmpfs | BackendKind::HugeTmpfs => umount_result,
            BackendKind::Overlay => {
                umount_result?;
                if !volume.keep_storage {
                    let _ = fs::remove_dir_all(volume.internal_path.join("upper"));
                    let _ = fs::remove_dir_all(volume.internal_path.join("work"));
                }
                Ok(())
            }
            BackendKind::Loop => {
                umount_result?;
                if volume.loop_dev >= 0 {
                    detach_loop(volume.loop_dev)?;
                    volume.loop_dev = -1;
                }
                if !volume.keep_storage {
                    let _ = fs::remove_file(&volume.storage);
                }
                Ok(())
            }
            BackendKind::Rbd => {
                umount_result?;
                CommandExecutor::run_checked("rbd", &["unmap", &volume.device_name])?;
                Ok(())
            }
            BackendKind::Lvm => {
                umount_result?;
                CommandExecutor::run_checked("lvremove", &["-f", &volume.device_name])?;
                Ok(())
            }
        }
    }

    pub fn stat_fs(&self, volume: &Volume) -> RuntimeResult<StatFs> {
        stat_path(&volume.path)
    }

    /// Re-apply space and inode limits on a live volume.
    pub fn resize(
        &self,
        volume: &mut Volume,
        space_limit: u64,
        inode_limit: u64,
    ) -> RuntimeResult<()> {
        match self {
            BackendKind::Loop => {
                resize_loop(volume, space_limit)?;
                volume.space_limit = space_limit;
                volume.inode_limit = inode_limit;
                Ok(())
            }
            BackendKind::Tmpfs | BackendKind::HugeTmpfs => {
                let fstype = if *self == BackendKind::Tmpfs {
                    "tmpfs"
                } else {
                    "hugetlbfs"
                };
                let mount = Mount::new(
                    fstype,
                    volume.path.clone(),
                    fstype,
                    MsFlags::MS_REMOUNT,
                    BTreeSet::from([format!("size={}", space_limit)]),
                );
                mount.mount()?;
                volume.space_limit = space_limit;
                volume.inode_limit = inode_limit;
                Ok(())
            }
            BackendKind::Quota => {
                volume.space_limit = space_limit;
                volume.inode_limit = inode_limit;
                apply_project_quota(volume)
            }
            _ => Err(RuntimeError::invalid_value(format!(
                "resize({}): backend does not support limits",
                self.name()
            ))),
        }
    }

    /// Pool entry this volume reserves in its place, when any.
    pub fn claim_place(&self, volume: &Volume) -> Option<String> {
        match self {
            BackendKind::Loop => Some(format!("loop:{}", volume.id)),
            BackendKind::Lvm | BackendKind::Rbd => {
                Some(format!("{}:{}", self.name(), volume.device_name))
            }
            _ => None,
        }
    }
}

fn umount_volume(path: &Path) -> RuntimeResult<()> {
    match nix::mount::umount2(path, nix::mount::MntFlags::empty()) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => Ok(()), // not mounted
        Err(e) => Err(RuntimeError::from_errno(e, format!("umount({})", path.display()))),
    }
}

fn apply_ownership(volume: &Volume, path: &Path) -> RuntimeResult<()> {
    if !volume.owner_user.is_empty() {
        let user = nix::unistd::User::from_name(&volume.owner_user)
            .map_err(|e| RuntimeError::from_errno(e, format!("getpwnam({})", volume.owner_user)))?
            .ok_or_else(|| {
                RuntimeError::not_found(format!("getpwnam({})", volume.owner_user))
            })?;
        let gid = if volume.owner_group.is_empty() {
            user.gid
        } else {
            nix::unistd::Group::from_name(&volume.owner_group)
                .map_err(|e| {
                    RuntimeError::from_errno(e, format!("getgrnam({})", volume.owner_group))
                })?
                .ok_or_else(|| {
                    RuntimeError::not_found(format!("getgrnam({})", volume.owner_group))
                })?
                .gid
        };
        nix::unistd::chown(path, Some(user.uid), Some(gid))
            .map_err(|e| RuntimeError::from_errno(e, format!("chown({})", path.display())))?;
    }
    if volume.permissions != 0 {
        fs::set_permissions(path, fs::Permissions::from_mode(volume.permissions))
            .map_err(RuntimeError::from)?;
    }
    Ok(())
}

/// Project quota management is delegated to e2fsprogs tooling.
fn apply_project_quota(volume: &Volume) -> RuntimeResult<()> {
    let project = volume.raw_id.as_str();
    let storage = volume.storage.to_string_lossy().to_string();
    CommandExecutor::run_checked("chattr", &["+P", "-p", project, &storage])?;
    if volume.space_limit > 0 {
        let blocks = (volume.space_limit / 1024).to_string();
        let inodes = volume.inode_limit.to_string();
        CommandExecutor::run_checked(
            "setquota",
            &["-P", project, "0", &blocks, "0", &inodes, &storage],
        )?;
    }
    Ok(())
}

/// Allocate a free loop device and attach the backing file to it.
fn attach_loop(backing: &Path) -> RuntimeResult<i32> {
    let control = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/loop-control")
        .map_err(RuntimeError::from)?;
    let index = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE) };
    if index < 0 {
        return Err(RuntimeError::from_errno(
            nix::errno::Errno::last(),
            "ioctl(/dev/loop-control, LOOP_CTL_GET_FREE)",
        ));
    }

    let device = format!("/dev/loop{}", index);
    let loop_file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&device)
        .map_err(RuntimeError::from)?;
    let backing_file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(backing)
        .map_err(RuntimeError::from)?;
    let ret = unsafe {
        libc::ioctl(
            loop_file.as_raw_fd(),
            LOOP_SET_FD,
            backing_file.as_raw_fd(),
        )
    };
    if ret < 0 {
        return Err(RuntimeError::from_errno(
            nix::errno::Errno::last(),
            format!("ioctl({}, LOOP_SET_FD)", device),
        ));
    }
    Ok(index)
}

pub fn detach_loop(index: i32) -> RuntimeResult<()> {
    let device = format!("/dev/loop{}", index);
    let loop_file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&device)
        .map_err(RuntimeError::from)?;
    let ret = unsafe { libc::ioctl(loop_file.as_raw_fd(), LOOP_CLR_FD, 0) };
    if ret < 0 {
        return Err(RuntimeError::from_errno(
            nix::errno::Errno::last(),
            format!("ioctl({}, LOOP_CLR_FD)", device),
        ));
    }
    Ok(())
}

fn build_loop(volume: &mut Volume) -> RuntimeResult<()> {
    if volume.loop_dev >= 0 {
        // Already attached; build is idempotent.
        return Ok(());
    }

    if !volume.storage.exists() {
        if let Some(parent) = volume.storage.parent() {
            fs::create_dir_all(parent).map_err(RuntimeError::from)?;
        }
        let file = fs::File::create(&volume.storage).map_err(RuntimeError::from)?;
        file.set_len(volume.space_limit).map_err(RuntimeError::from)?;
        drop(file);

        let storage = volume.storage.to_string_lossy().to_string();
        CommandExecutor::run_checked("mkfs.ext4", &["-F", "-F", &storage])?;
    }

    let index = attach_loop(&volume.storage)?;
    let device = format!("/dev/loop{}", index);
    let mut flags = MsFlags::empty();
    if volume.read_only {
        flags |= MsFlags::MS_RDONLY;
    }
    let mount = Mount::new(device.clone(), volume.path.clone(), "ext4", flags, BTreeSet::new());
    if let Err(e) = mount.mount() {
        let _ = detach_loop(index);
        return Err(e);
    }
    volume.loop_dev = index;
    ConsoleLogger::debug(&format!(
        "Loop volume {} attached at {}",
        volume.path.display(),
        device
    ));
    Ok(())
}

fn resize_loop(volume: &mut Volume, space_limit: u64) -> RuntimeResult<()> {
    if space_limit < volume.space_limit {
        return Err(RuntimeError::invalid_value(
            "resize(loop): shrinking is not supported",
        ));
    }
    let file = fs::OpenOptions::new()
        .write(true)
        .open(&volume.storage)
        .map_err(RuntimeError::from)?;
    file.set_len(space_limit).map_err(RuntimeError::from)?;

    if volume.loop_dev >= 0 {
        let device = format!("/dev/loop{}", volume.loop_dev);
        let loop_file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device)
            .map_err(RuntimeError::from)?;
        let ret = unsafe { libc::ioctl(loop_file.as_raw_fd(), LOOP_SET_CAPACITY, 0) };
        if ret < 0 {
            return Err(RuntimeError::from_errno(
                nix::errno::Errno::last(),
                format!("ioctl({}, LOOP_SET_CAPACITY)", device),
            ));
        }
        CommandExecutor::run_checked("resize2fs", &[&device])?;
    }
    Ok(())
}

fn build_overlay(volume: &mut Volume) -> RuntimeResult<()> {
    let upper = volume.internal_path.join("upper");
    let work = volume.internal_path.join("work");
    fs::create_dir_all(&upper).map_err(RuntimeError::from)?;
    fs::create_dir_all(&work).map_err(RuntimeError::from)?;

    // overlayfs wants the top layer first; the spec orders bottom -> top.
    let lower: Vec<&str> = volume.layers.iter().rev().map(String::as_str).collect();
    let options = BTreeSet::from([
        format!("lowerdir={}", lower.join(":")),
        format!("upperdir={}", upper.display()),
        format!("workdir={}", work.display()),
    ]);

    let mut flags = MsFlags::empty();
    if volume.read_only {
        flags |= MsFlags::MS_RDONLY;
    }
    Mount::new("overlay", volume.path.clone(), "overlay", flags, options).mount()
}

fn build_tmpfs(volume: &mut Volume, fstype: &str) -> RuntimeResult<()> {
    let options = BTreeSet::from([format!("size={}", volume.space_limit)]);
    Mount::new(
        fstype,
        volume.path.clone(),
        fstype,
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        options,
    )
    .mount()
}

fn build_rbd(volume: &mut Volume) -> RuntimeResult<()> {
    let mapped = CommandExecutor::run_checked("rbd", &["map", &volume.device_name])?;
    let device = mapped.stdout.trim().to_string();
    let mut flags = MsFlags::empty();
    if volume.read_only {
        flags |= MsFlags::MS_RDONLY;
    }
    Mount::new(device, volume.path.clone(), "ext4", flags, BTreeSet::new()).mount()
}

fn build_lvm(volume: &mut Volume) -> RuntimeResult<()> {
    let (group, name) = volume
        .device_name
        .split_once('/')
        .ok_or_else(|| {
            RuntimeError::invalid_value(format!(
                "backend(lvm): device_name {} is not group/name",
                volume.device_name
            ))
        })?;
    let device = format!("/dev/{}/{}", group, name);

    if !Path::new(&device).exists() {
        let size = format!("{}b", volume.space_limit);
        CommandExecutor::run_checked("lvcreate", &["-y", "-L", &size, "-n", name, group])?;
        CommandExecutor::run_checked("mkfs.ext4", &["-F", "-F", &device])?;
    }
    Mount::new(device, volume.path.clone(), "ext4", MsFlags::empty(), BTreeSet::new()).mount()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{Volume, VolumeState};
    use std::path::PathBuf;

    fn volume(backend: BackendKind) -> Volume {
        let mut v = Volume::empty_for_tests();
        v.backend = backend;
        v
    }

    #[test]
    fn backend_names_round_trip() {
        for name in [
            "dir", "plain", "loop", "overlay", "tmpfs", "hugetmpfs", "rbd", "lvm", "quota",
        ] {
            assert_eq!(BackendKind::from_name(name).unwrap().name(), name);
        }
        assert_eq!(BackendKind::from_name("").unwrap(), BackendKind::Dir);
        assert!(BackendKind::from_name("zram").is_err());
    }

    #[test]
    fn configure_enforces_backend_rules() {
        let mut v = volume(BackendKind::Loop);
        assert!(BackendKind::Loop.configure(&v).is_err()); // no space limit
        v.space_limit = 16 << 20;
        assert!(BackendKind::Loop.configure(&v).is_ok());

        let mut v = volume(BackendKind::Overlay);
        assert!(BackendKind::Overlay.configure(&v).is_err()); // no layers
        v.layers.push("/place/layers/base".to_string());
        assert!(BackendKind::Overlay.configure(&v).is_ok());

        let mut v = volume(BackendKind::Dir);
        v.layers.push("/some/layer".to_string());
        assert!(BackendKind::Dir.configure(&v).is_err());

        let mut v = volume(BackendKind::Rbd);
        assert!(BackendKind::Rbd.configure(&v).is_err()); // no device
        v.device_name = "pool/image".to_string();
        assert!(BackendKind::Rbd.configure(&v).is_ok());
    }

    #[test]
    fn resize_rejected_where_unsupported() {
        let mut v = volume(BackendKind::Dir);
        let err = BackendKind::Dir.resize(&mut v, 1 << 20, 0).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidValue);
    }

    #[test]
    fn claim_place_names_pool_entries() {
        let mut v = volume(BackendKind::Loop);
        v.id = "v-9".to_string();
        assert_eq!(BackendKind::Loop.claim_place(&v).unwrap(), "loop:v-9");

        let mut v = volume(BackendKind::Lvm);
        v.device_name = "vg0/data".to_string();
        assert_eq!(BackendKind::Lvm.claim_place(&v).unwrap(), "lvm:vg0/data");

        assert!(BackendKind::Dir.claim_place(&volume(BackendKind::Dir)).is_none());
    }

    #[test]
    fn stat_path_reports_usage() {
        let stat = stat_path(&PathBuf::from("/")).unwrap();
        assert!(stat.space_used > 0);
        assert!(stat.inode_used > 0);
    }

    #[test]
    fn fresh_volume_state() {
        let v = Volume::empty_for_tests();
        assert_eq!(v.state, VolumeState::Initial);
        assert_eq!(v.loop_dev, -1);
    }
}
