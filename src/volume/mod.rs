// Volume manager: a process-wide registry of volumes keyed by host path,
// links binding them into containers, and persistence of every state
// transition to the KV store.

pub mod backend;
pub mod store;

use crate::error::{ErrorKind, RuntimeError, RuntimeResult};
use crate::utils::console::ConsoleLogger;
use crate::utils::constants::DEFAULT_PLACE;
use crate::utils::mounts::{bind_mount, MountSnapshot};
use crate::utils::strings::parse_size_with_unit;
use crate::volume::backend::{BackendKind, StatFs};
use crate::volume::store::{VolumeRecord, VolumeStore};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Initial,
    Building,
    Ready,
    Tuning,
    Unlinked,
    ToDestroy,
    Destroying,
    Destroyed,
    Error,
}

impl VolumeState {
    pub fn name(&self) -> &'static str {
        match self {
            VolumeState::Initial => "INITIAL",
            VolumeState::Building => "BUILDING",
            VolumeState::Ready => "READY",
            VolumeState::Tuning => "TUNING",
            VolumeState::Unlinked => "UNLINKED",
            VolumeState::ToDestroy => "TO-DESTROY",
            VolumeState::Destroying => "DESTROYING",
            VolumeState::Destroyed => "DESTROYED",
            VolumeState::Error => "ERROR",
        }
    }

    pub fn from_name(name: &str) -> RuntimeResult<Self> {
        match name {
            "INITIAL" => Ok(VolumeState::Initial),
            "BUILDING" => Ok(VolumeState::Building),
            "READY" => Ok(VolumeState::Ready),
            "TUNING" => Ok(VolumeState::Tuning),
            "UNLINKED" => Ok(VolumeState::Unlinked),
            "TO-DESTROY" => Ok(VolumeState::ToDestroy),
            "DESTROYING" => Ok(VolumeState::Destroying),
            "DESTROYED" => Ok(VolumeState::Destroyed),
            "ERROR" => Ok(VolumeState::Error),
            other => Err(RuntimeError::invalid_value(format!(
                "volume_state({}): unknown state",
                other
            ))),
        }
    }
}

/// The binding of a volume into a container at a target path.
#[derive(Debug, Clone)]
pub struct VolumeLink {
    pub container: String,
    /// path in container namespace
    pub target: PathBuf,
    /// mounted path in host namespace
    pub host_target: PathBuf,
    pub read_only: bool,
    pub required: bool,
    pub busy: bool,
    seq: u64,
}

#[derive(Debug, Clone)]
pub struct Volume {
    pub id: String,
    pub raw_id: String,
    pub path: PathBuf,
    pub internal_path: PathBuf,
    pub backend: BackendKind,
    pub state: VolumeState,
    pub storage: PathBuf,
    pub keep_storage: bool,
    pub auto_path: bool,
    pub read_only: bool,
    pub layers: Vec<String>,
    pub space_limit: u64,
    pub inode_limit: u64,
    pub space_guarantee: u64,
    pub inode_guarantee: u64,
    pub claimed_space: u64,
    pub loop_dev: i32,
    pub device_name: String,
    pub place: PathBuf,
    pub place_key: String,
    pub owner_user: String,
    pub owner_group: String,
    pub permissions: u32,
    pub creator: String,
    pub private: String,
    pub labels: HashMap<String, String>,
    pub links: Vec<VolumeLink>,
    pub build_time: u64,
    pub change_time: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Volume {
    fn to_record(&self) -> VolumeRecord {
        VolumeRecord {
            id: self.id.clone(),
            path: self.path.to_string_lossy().to_string(),
            backend: self.backend.name().to_string(),
            ready: self.state == VolumeState::Ready,
            build_time: self.build_time,
            change_time: self.change_time,
            state: self.state.name().to_string(),
            private: self.private.clone(),
            labels: self.labels.clone(),
            raw_id: self.raw_id.clone(),
            containers: self.links.iter().map(|l| l.container.clone()).collect(),
            loop_dev: self.loop_dev,
            auto_path: self.auto_path,
            target_container: String::new(),
            owner_container: String::new(),
            owner_user: self.owner_user.clone(),
            owner_group: self.owner_group.clone(),
            creator: self.creator.clone(),
            user: self.owner_user.clone(),
            group: self.owner_group.clone(),
            permissions: format!("{:o}", self.permissions),
            storage: self.storage.to_string_lossy().to_string(),
            layers: self.layers.clone(),
            read_only: self.read_only,
            space_limit: self.space_limit,
            inode_limit: self.inode_limit,
            space_guarantee: self.space_guarantee,
            inode_guarantee: self.inode_guarantee,
            place: self.place.to_string_lossy().to_string(),
            place_key: self.place_key.clone(),
            device_name: self.device_name.clone(),
        }
    }

    fn from_record(record: &VolumeRecord) -> RuntimeResult<Volume> {
        let backend = BackendKind::from_name(&record.backend)?;
        let state = VolumeState::from_name(&record.state)?;
        let path = PathBuf::from(&record.path);
        let internal_path = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| path.clone());
        Ok(Volume {
            id: record.id.clone(),
            raw_id: record.raw_id.clone(),
            path,
            internal_path,
            backend,
            state,
            storage: PathBuf::from(&record.storage),
            keep_storage: !record.storage.is_empty() && !record.auto_path,
            auto_path: record.auto_path,
            read_only: record.read_only,
            layers: record.layers.clone(),
            space_limit: record.space_limit,
            inode_limit: record.inode_limit,
            space_guarantee: record.space_guarantee,
            inode_guarantee: record.inode_guarantee,
            claimed_space: record.space_limit,
            loop_dev: record.loop_dev,
            device_name: record.device_name.clone(),
            place: PathBuf::from(&record.place),
            place_key: record.place_key.clone(),
            owner_user: record.owner_user.clone(),
            owner_group: record.owner_group.clone(),
            permissions: u32::from_str_radix(&record.permissions, 8).unwrap_or(0o775),
            creator: record.creator.clone(),
            private: record.private.clone(),
            labels: record.labels.clone(),
            links: Vec::new(),
            build_time: record.build_time,
            change_time: record.change_time,
        })
    }

    #[cfg(test)]
    pub fn empty_for_tests() -> Volume {
        Volume {
            id: String::new(),
            raw_id: "0".to_string(),
            path: PathBuf::new(),
            internal_path: PathBuf::new(),
            backend: BackendKind::Dir,
            state: VolumeState::Initial,
            storage: PathBuf::new(),
            keep_storage: false,
            auto_path: false,
            read_only: false,
            layers: Vec::new(),
            space_limit: 0,
            inode_limit: 0,
            space_guarantee: 0,
            inode_guarantee: 0,
            claimed_space: 0,
            loop_dev: -1,
            device_name: String::new(),
            place: PathBuf::new(),
            place_key: String::new(),
            owner_user: String::new(),
            owner_group: String::new(),
            permissions: 0,
            creator: String::new(),
            private: String::new(),
            labels: HashMap::new(),
            links: Vec::new(),
            build_time: 0,
            change_time: 0,
        }
    }
}

/// Creation request, as it arrives from a client.
#[derive(Debug, Clone, Default)]
pub struct VolumeSpec {
    pub path: Option<PathBuf>,
    pub backend: String,
    pub storage: String,
    pub layers: Vec<String>,
    pub read_only: bool,
    pub space_limit: u64,
    pub inode_limit: u64,
    pub space_guarantee: u64,
    pub inode_guarantee: u64,
    pub place: Option<PathBuf>,
    pub owner_user: String,
    pub owner_group: String,
    pub permissions: u32,
    pub creator: String,
    pub private: String,
    pub labels: HashMap<String, String>,
}

impl VolumeSpec {
    /// Build a spec from the client's string property map. Size-bearing
    /// values accept the K/M/G suffixes; unknown properties are rejected.
    pub fn from_config(config: &HashMap<String, String>) -> RuntimeResult<VolumeSpec> {
        let mut spec = VolumeSpec::default();
        for (key, value) in config {
            match key.as_str() {
                "path" => spec.path = Some(PathBuf::from(value)),
                "backend" => spec.backend = value.clone(),
                "storage" => spec.storage = value.clone(),
                "layers" => {
                    spec.layers = value
                        .split(';')
                        .filter(|l| !l.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "read_only" => spec.read_only = parse_config_bool(key, value)?,
                "space_limit" => spec.space_limit = parse_size_with_unit(value)?,
                "inode_limit" => spec.inode_limit = parse_size_with_unit(value)?,
                "space_guarantee" => spec.space_guarantee = parse_size_with_unit(value)?,
                "inode_guarantee" => spec.inode_guarantee = parse_size_with_unit(value)?,
                "place" => spec.place = Some(PathBuf::from(value)),
                "user" => spec.owner_user = value.clone(),
                "group" => spec.owner_group = value.clone(),
                "permissions" => {
                    spec.permissions = u32::from_str_radix(value, 8).map_err(|_| {
                        RuntimeError::invalid_value(format!(
                            "volume_config(permissions={}): bad octal mode",
                            value
                        ))
                    })?;
                }
                "creator" => spec.creator = value.clone(),
                "private" => spec.private = value.clone(),
                "labels" => {
                    for pair in value.split(';').filter(|p| !p.is_empty()) {
                        let (k, v) = pair.split_once('=').ok_or_else(|| {
                            RuntimeError::invalid_value(format!(
                                "volume_config(labels): bad entry {}",
                                pair
                            ))
                        })?;
                        spec.labels.insert(k.to_string(), v.to_string());
                    }
                }
                other => {
                    return Err(RuntimeError::invalid_value(format!(
                        "volume_config({}): unknown property",
                        other
                    )))
                }
            }
        }
        Ok(spec)
    }
}

fn parse_config_bool(key: &str, value: &str) -> RuntimeResult<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        other => Err(RuntimeError::invalid_value(format!(
            "volume_config({}={}): bad boolean",
            key, other
        ))),
    }
}

struct VolumesState {
    volumes: HashMap<PathBuf, Volume>,
    /// host target path of a link -> owning volume path
    links: HashMap<PathBuf, PathBuf>,
    next_seq: u64,
}

/// Two paths conflict when one is a prefix of the other (or they are the
/// same): mounting over a subpath of another volume is forbidden.
fn paths_conflict(a: &Path, b: &Path) -> bool {
    a == b || a.starts_with(b) || b.starts_with(a)
}

/// Process-wide volume registry. The single mutex covers the maps and
/// every volume's state and links; long backend operations run on a copy
/// and re-check state after reacquisition.
pub struct VolumeManager {
    state: Mutex<VolumesState>,
    store: VolumeStore,
}

#[allow(dead_code)] // Volume API surface; the RPC server drives the rest
impl VolumeManager {
    pub fn new(store: VolumeStore) -> Self {
        VolumeManager {
            state: Mutex::new(VolumesState {
                volumes: HashMap::new(),
                links: HashMap::new(),
                next_seq: 1,
            }),
            store,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VolumesState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_conflicts(state: &VolumesState, path: &Path) -> RuntimeResult<()> {
        for existing in state.volumes.keys() {
            if paths_conflict(path, existing) {
                return Err(RuntimeError::exists(format!(
                    "volume_create({}): conflicts with volume {}",
                    path.display(),
                    existing.display()
                )));
            }
        }
        for link_target in state.links.keys() {
            if paths_conflict(path, link_target) {
                return Err(RuntimeError::exists(format!(
                    "volume_create({}): conflicts with link {}",
                    path.display(),
                    link_target.display()
                )));
            }
        }
        Ok(())
    }

    /// Reject a guarantee the place cannot cover: existing guarantees in
    /// the same place plus the request must fit into the free space.
    fn check_guarantee(
        state: &VolumesState,
        place: &Path,
        space_guarantee: u64,
        inode_guarantee: u64,
    ) -> RuntimeResult<()> {
        if space_guarantee == 0 && inode_guarantee == 0 {
            return Ok(());
        }
        let stat = backend::stat_path(place)?;
        let mut space_total = space_guarantee;
        let mut inode_total = inode_guarantee;
        for volume in state.volumes.values() {
            if volume.place == place {
                space_total += volume.space_guarantee;
                inode_total += volume.inode_guarantee;
            }
        }
        if space_total > stat.space_available || inode_total > stat.inode_available {
            return Err(RuntimeError::no_space(format!(
                "volume_guarantee({}): {} bytes / {} inodes requested, {} / {} available",
                place.display(),
                space_total,
                inode_total,
                stat.space_available,
                stat.inode_available
            )));
        }
        Ok(())
    }

    /// Build a new volume: validate, register it in INITIAL, then drive
    /// INITIAL -> BUILDING -> READY, persisting every step. A failed build
    /// destroys the half-built volume and drops its KV entry.
    pub async fn create(&self, spec: VolumeSpec) -> RuntimeResult<PathBuf> {
        let backend = BackendKind::from_name(&spec.backend)?;
        let id = uuid::Uuid::new_v4().to_string();
        let place = spec.place.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_PLACE));

        let internal_path = place.join("volumes").join(&id);
        let auto_path = spec.path.is_none();
        let path = spec
            .path
            .clone()
            .unwrap_or_else(|| internal_path.join("volume"));
        let keep_storage = !spec.storage.is_empty();
        let storage = if keep_storage {
            PathBuf::from(&spec.storage)
        } else if backend == BackendKind::Loop {
            internal_path.join("loop.img")
        } else {
            internal_path.join("storage")
        };

        let mut volume = Volume {
            id: id.clone(),
            raw_id: id.split('-').next().unwrap_or("0").to_string(),
            path: path.clone(),
            internal_path,
            backend,
            state: VolumeState::Initial,
            storage,
            keep_storage,
            auto_path,
            read_only: spec.read_only,
            layers: spec.layers.clone(),
            space_limit: spec.space_limit,
            inode_limit: spec.inode_limit,
            space_guarantee: spec.space_guarantee,
            inode_guarantee: spec.inode_guarantee,
            claimed_space: 0,
            loop_dev: -1,
            device_name: spec.storage.clone(),
            place: place.clone(),
            place_key: String::new(),
            owner_user: spec.owner_user.clone(),
            owner_group: spec.owner_group.clone(),
            permissions: if spec.permissions == 0 { 0o775 } else { spec.permissions },
            creator: spec.creator.clone(),
            private: spec.private.clone(),
            labels: spec.labels.clone(),
            links: Vec::new(),
            build_time: 0,
            change_time: now_secs(),
        };
        if matches!(backend, BackendKind::Rbd | BackendKind::Lvm) {
            volume.device_name = spec.storage.clone();
            volume.storage = volume.internal_path.join("storage");
            volume.keep_storage = true;
        }
        backend.configure(&volume)?;
        if let Some(key) = backend.claim_place(&volume) {
            volume.place_key = key;
            volume.claimed_space = volume.space_limit;
        }

        // Register in INITIAL under the lock, then persist.
        let record = {
            let mut state = self.lock();
            Self::check_conflicts(&state, &path)?;
            Self::check_guarantee(&state, &place, spec.space_guarantee, spec.inode_guarantee)?;
            state.volumes.insert(path.clone(), volume.clone());
            volume.to_record()
        };
        if let Err(e) = self.store.save_volume(&record).await {
            let mut state = self.lock();
            state.volumes.remove(&path);
            return Err(store_error(e));
        }

        // BUILDING
        let building = {
            let mut state = self.lock();
            if let Some(v) = state.volumes.get_mut(&path) {
                v.state = VolumeState::Building;
                v.change_time = now_secs();
                volume = v.clone();
            }
            volume.to_record()
        };
        self.store.save_volume(&building).await.map_err(store_error)?;

        // The build itself runs without the volumes lock.
        let (built, result) = tokio::task::spawn_blocking(move || {
            let mut v = volume;
            let backend = v.backend;
            let result = backend.build(&mut v);
            (v, result)
        })
        .await
        .map_err(|e| RuntimeError::new(ErrorKind::Unknown, format!("volume_build: {}", e)))?;

        match result {
            Ok(()) => {
                let record = {
                    let mut state = self.lock();
                    let v = state.volumes.get_mut(&path).ok_or_else(|| {
                        RuntimeError::not_found(format!(
                            "volume_create({}): removed during build",
                            path.display()
                        ))
                    })?;
                    v.loop_dev = built.loop_dev;
                    v.state = VolumeState::Ready;
                    v.build_time = now_secs();
                    v.change_time = v.build_time;
                    v.to_record()
                };
                self.store.save_volume(&record).await.map_err(store_error)?;
                ConsoleLogger::success(&format!("Volume {} is ready", path.display()));
                Ok(path)
            }
            Err(e) => {
                ConsoleLogger::error(&format!(
                    "Volume {} build failed: {}",
                    path.display(),
                    e
                ));
                let record = {
                    let mut state = self.lock();
                    if let Some(v) = state.volumes.get_mut(&path) {
                        v.state = VolumeState::Error;
                        v.loop_dev = built.loop_dev;
                        v.change_time = now_secs();
                        Some(v.to_record())
                    } else {
                        None
                    }
                };
                if let Some(record) = record {
                    let _ = self.store.save_volume(&record).await;
                }
                // Auto-destroy the half-built volume.
                let mut broken = built;
                let _ = tokio::task::spawn_blocking(move || {
                    let backend = broken.backend;
                    let r = backend.delete(&mut broken);
                    (broken, r)
                })
                .await;
                {
                    let mut state = self.lock();
                    state.volumes.remove(&path);
                }
                let _ = self
                    .store
                    .remove_volume(&path.to_string_lossy())
                    .await;
                Err(e)
            }
        }
    }

    /// Bind a READY volume into a container. When the container is already
    /// running (`mount_now`), the host path is bind-mounted onto the
    /// resolved target in the container's filesystem.
    pub async fn link_volume(
        &self,
        volume_path: &Path,
        container: &str,
        target: &Path,
        host_target: &Path,
        read_only: bool,
        required: bool,
        mount_now: bool,
    ) -> RuntimeResult<()> {
        let (source, link_read_only, record) = {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            let volume = state.volumes.get_mut(volume_path).ok_or_else(|| {
                RuntimeError::not_found(format!("volume_link({})", volume_path.display()))
            })?;
            if volume.state != VolumeState::Ready {
                return Err(RuntimeError::busy(format!(
                    "volume_link({}): volume is {}",
                    volume_path.display(),
                    volume.state.name()
                )));
            }
            if volume
                .links
                .iter()
                .any(|l| l.container == container && l.target == target)
            {
                return Err(RuntimeError::exists(format!(
                    "volume_link({}, {})",
                    volume_path.display(),
                    container
                )));
            }
            // A read-only volume stays read-only no matter what the link
            // asks for; the mount below must match the recorded link.
            let link_read_only = read_only || volume.read_only;
            volume.links.push(VolumeLink {
                container: container.to_string(),
                target: target.to_path_buf(),
                host_target: host_target.to_path_buf(),
                read_only: link_read_only,
                required,
                busy: false,
                seq,
            });
            let source = volume.path.clone();
            let record = volume.to_record();
            state
                .links
                .insert(host_target.to_path_buf(), volume_path.to_path_buf());
            (source, link_read_only, record)
        };

        if mount_now {
            if let Err(e) = mount_link(&source, host_target, link_read_only) {
                let mut state = self.lock();
                state.links.remove(host_target);
                if let Some(volume) = state.volumes.get_mut(volume_path) {
                    volume
                        .links
                        .retain(|l| !(l.container == container && l.target == target));
                }
                return Err(e);
            }
        }
        self.store.save_volume(&record).await.map_err(store_error)?;
        Ok(())
    }

    /// Remove one link. When the last link goes away and the volume does
    /// not keep its storage, it is switched to TO-DESTROY and returned in
    /// `unlinked` for batched teardown outside the volumes lock.
    pub async fn unlink_volume(
        &self,
        volume_path: &Path,
        container: &str,
        target: Option<&Path>,
        strict: bool,
        unlinked: &mut Vec<PathBuf>,
    ) -> RuntimeResult<()> {
        let (removed, record) = {
            let mut state = self.lock();
            let volume = state.volumes.get_mut(volume_path).ok_or_else(|| {
                RuntimeError::not_found(format!("volume_unlink({})", volume_path.display()))
            })?;

            let matches = |l: &VolumeLink| {
                l.container == container && target.map(|t| l.target == t).unwrap_or(true)
            };
            if strict && volume.links.iter().any(|l| matches(l) && l.busy) {
                return Err(RuntimeError::busy(format!(
                    "volume_unlink({}): link is busy",
                    volume_path.display()
                )));
            }
            let removed: Vec<VolumeLink> =
                volume.links.iter().filter(|l| matches(l)).cloned().collect();
            if removed.is_empty() {
                return Err(RuntimeError::not_found(format!(
                    "volume_unlink({}, {})",
                    volume_path.display(),
                    container
                )));
            }
            volume.links.retain(|l| !matches(l));

            if volume.links.is_empty() && !volume.keep_storage {
                volume.state = VolumeState::ToDestroy;
                unlinked.push(volume.path.clone());
            } else if volume.links.is_empty() {
                volume.state = VolumeState::Unlinked;
            }
            volume.change_time = now_secs();
            let record = volume.to_record();
            for link in &removed {
                state.links.remove(&link.host_target);
            }
            (removed, record)
        };

        for link in removed.iter().rev() {
            umount_link(&link.host_target);
        }
        self.store.save_volume(&record).await.map_err(store_error)?;
        Ok(())
    }

    /// Drop every link a container holds, newest first, collecting volumes
    /// scheduled for destruction.
    pub async fn unlink_all_volumes(
        &self,
        container: &str,
        unlinked: &mut Vec<PathBuf>,
    ) -> RuntimeResult<()> {
        let mut targets: Vec<(u64, PathBuf, PathBuf)> = {
            let state = self.lock();
            state
                .volumes
                .values()
                .flat_map(|v| {
                    v.links
                        .iter()
                        .filter(|l| l.container == container)
                        .map(|l| (l.seq, v.path.clone(), l.target.clone()))
                })
                .collect()
        };
        targets.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, volume_path, target) in targets {
            self.unlink_volume(&volume_path, container, Some(&target), false, unlinked)
                .await?;
        }
        Ok(())
    }

    /// Tear down every volume collected by the unlink calls.
    pub async fn destroy_unlinked(&self, unlinked: Vec<PathBuf>) -> RuntimeResult<()> {
        for path in unlinked {
            self.destroy(&path).await?;
        }
        Ok(())
    }

    /// Destroy one volume: TO-DESTROY -> DESTROYING -> DESTROYED, backend
    /// teardown between the persisted transitions.
    pub async fn destroy(&self, path: &Path) -> RuntimeResult<()> {
        let volume = {
            let mut state = self.lock();
            let volume = match state.volumes.get_mut(path) {
                Some(v) => v,
                None => return Ok(()),
            };
            volume.state = VolumeState::Destroying;
            volume.change_time = now_secs();
            volume.clone()
        };
        self.store
            .save_volume(&volume.to_record())
            .await
            .map_err(store_error)?;

        let (mut done, result) = tokio::task::spawn_blocking(move || {
            let mut v = volume;
            let backend = v.backend;
            let result = backend.delete(&mut v);
            (v, result)
        })
        .await
        .map_err(|e| RuntimeError::new(ErrorKind::Unknown, format!("volume_destroy: {}", e)))?;
        if let Err(e) = result {
            ConsoleLogger::warning(&format!(
                "Volume {} teardown left residue: {}",
                path.display(),
                e
            ));
        }
        done.state = VolumeState::Destroyed;

        {
            let mut state = self.lock();
            state.volumes.remove(path);
            state.links.retain(|_, v| v != path);
        }
        self.store
            .remove_volume(&path.to_string_lossy())
            .await
            .map_err(store_error)?;
        ConsoleLogger::info(&format!("Volume {} destroyed", path.display()));
        Ok(())
    }

    /// Re-apply limits on a READY volume.
    pub async fn tune(&self, path: &Path, space_limit: u64, inode_limit: u64) -> RuntimeResult<()> {
        let volume = {
            let mut state = self.lock();
            let volume = state.volumes.get_mut(path).ok_or_else(|| {
                RuntimeError::not_found(format!("volume_tune({})", path.display()))
            })?;
            if volume.state != VolumeState::Ready {
                return Err(RuntimeError::busy(format!(
                    "volume_tune({}): volume is {}",
                    path.display(),
                    volume.state.name()
                )));
            }
            volume.state = VolumeState::Tuning;
            volume.clone()
        };
        self.store
            .save_volume(&volume.to_record())
            .await
            .map_err(store_error)?;

        let (tuned, result) = tokio::task::spawn_blocking(move || {
            let mut v = volume;
            let backend = v.backend;
            let result = backend.resize(&mut v, space_limit, inode_limit);
            (v, result)
        })
        .await
        .map_err(|e| RuntimeError::new(ErrorKind::Unknown, format!("volume_tune: {}", e)))?;

        let record = {
            let mut state = self.lock();
            if let Some(v) = state.volumes.get_mut(path) {
                v.state = VolumeState::Ready;
                if result.is_ok() {
                    v.space_limit = tuned.space_limit;
                    v.inode_limit = tuned.inode_limit;
                }
                v.change_time = now_secs();
                Some(v.to_record())
            } else {
                None
            }
        };
        if let Some(record) = record {
            self.store.save_volume(&record).await.map_err(store_error)?;
        }
        result
    }

    pub fn stat_fs(&self, path: &Path) -> RuntimeResult<StatFs> {
        let volume = {
            let state = self.lock();
            state
                .volumes
                .get(path)
                .cloned()
                .ok_or_else(|| RuntimeError::not_found(format!("volume_stat({})", path.display())))?
        };
        volume.backend.stat_fs(&volume)
    }

    /// Find the link mounted at a host path.
    pub fn resolve_link(&self, host_path: &Path) -> Option<(PathBuf, String)> {
        let state = self.lock();
        let volume_path = state.links.get(host_path)?.clone();
        let container = state
            .volumes
            .get(&volume_path)?
            .links
            .iter()
            .find(|l| l.host_target == host_path)?
            .container
            .clone();
        Some((volume_path, container))
    }

    pub fn list(&self) -> Vec<(PathBuf, VolumeState)> {
        let state = self.lock();
        state
            .volumes
            .values()
            .map(|v| (v.path.clone(), v.state))
            .collect()
    }

    /// Crash recovery: rehydrate every persisted volume. A READY volume
    /// whose host path is still present in the mount table stays READY;
    /// everything else is scheduled for destruction, which also reclaims
    /// leaked loop devices through the backend teardown.
    pub async fn restore_all(&self) -> RuntimeResult<()> {
        let records = self.store.load_volumes().await.map_err(store_error)?;
        let snapshot = MountSnapshot::take()?;
        let mut doomed = Vec::new();

        for record in &records {
            let mut volume = match Volume::from_record(record) {
                Ok(v) => v,
                Err(e) => {
                    ConsoleLogger::warning(&format!(
                        "Dropping unreadable volume record {}: {}",
                        record.path, e
                    ));
                    let _ = self.store.remove_volume(&record.path).await;
                    continue;
                }
            };

            let alive = volume.state == VolumeState::Ready
                && snapshot.find_target(&volume.path).is_some();
            if !alive {
                volume.state = VolumeState::ToDestroy;
                doomed.push(volume.path.clone());
            }
            ConsoleLogger::debug(&format!(
                "Restored volume {} in state {}",
                volume.path.display(),
                volume.state.name()
            ));
            let mut state = self.lock();
            state.volumes.insert(volume.path.clone(), volume);
        }

        let restored = records.len() - doomed.len();
        if !doomed.is_empty() {
            ConsoleLogger::warning(&format!(
                "Destroying {} volume(s) that did not survive restart",
                doomed.len()
            ));
            self.destroy_unlinked(doomed).await?;
        }
        ConsoleLogger::info(&format!("Restored {} volume(s) from the KV store", restored));
        Ok(())
    }
}

fn store_error(e: store::StoreError) -> RuntimeError {
    RuntimeError::new(ErrorKind::Unknown, format!("volumes_kv: {}", e))
}

fn mount_link(source: &Path, host_target: &Path, read_only: bool) -> RuntimeResult<()> {
    if let Some(parent) = host_target.parent() {
        std::fs::create_dir_all(parent).map_err(RuntimeError::from)?;
    }
    if !host_target.exists() {
        std::fs::create_dir_all(host_target).map_err(RuntimeError::from)?;
    }
    bind_mount(source, host_target, read_only)
}

fn umount_link(host_target: &Path) {
    use nix::mount::{umount2, MntFlags};
    if umount2(host_target, MntFlags::empty()).is_err() {
        // Lazy detach as fallback; a vanished mount is fine.
        let _ = umount2(host_target, MntFlags::MNT_DETACH);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    async fn manager() -> VolumeManager {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = VolumeStore::new(pool);
        store.initialize_schema().await.unwrap();
        VolumeManager::new(store)
    }

    fn insert_ready(manager: &VolumeManager, path: &str, keep_storage: bool) {
        let mut volume = Volume::empty_for_tests();
        volume.path = PathBuf::from(path);
        volume.state = VolumeState::Ready;
        volume.keep_storage = keep_storage;
        let mut state = manager.lock();
        state.volumes.insert(volume.path.clone(), volume);
    }

    #[test]
    fn config_map_parses_sizes_with_units() {
        let config = HashMap::from([
            ("backend".to_string(), "loop".to_string()),
            ("space_limit".to_string(), "16M".to_string()),
            ("space_guarantee".to_string(), "1G".to_string()),
            ("inode_limit".to_string(), "4096".to_string()),
            ("read_only".to_string(), "true".to_string()),
            ("permissions".to_string(), "0775".to_string()),
            ("layers".to_string(), "/l/base;/l/app".to_string()),
            ("labels".to_string(), "team=infra;tier=db".to_string()),
        ]);
        let spec = VolumeSpec::from_config(&config).unwrap();
        assert_eq!(spec.backend, "loop");
        assert_eq!(spec.space_limit, 16 << 20);
        assert_eq!(spec.space_guarantee, 1 << 30);
        assert_eq!(spec.inode_limit, 4096);
        assert!(spec.read_only);
        assert_eq!(spec.permissions, 0o775);
        assert_eq!(spec.layers, vec!["/l/base", "/l/app"]);
        assert_eq!(spec.labels.get("tier").unwrap(), "db");
    }

    #[test]
    fn config_map_rejects_bad_values() {
        for (key, value) in [
            ("space_limit", "abc"),
            ("read_only", "maybe"),
            ("permissions", "rwxr"),
            ("labels", "no-equals"),
            ("placement", "/x"),
        ] {
            let config = HashMap::from([(key.to_string(), value.to_string())]);
            let err = VolumeSpec::from_config(&config).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidValue, "{}={}", key, value);
        }
        // Suffix fall-through: an unknown trailing character is not an
        // error, the leading integer wins.
        let config = HashMap::from([("space_limit".to_string(), "5z".to_string())]);
        assert_eq!(VolumeSpec::from_config(&config).unwrap().space_limit, 5);
    }

    #[tokio::test]
    async fn read_only_volume_forces_link_read_only() {
        let manager = manager().await;
        {
            let mut volume = Volume::empty_for_tests();
            volume.path = PathBuf::from("/vols/ro");
            volume.state = VolumeState::Ready;
            volume.read_only = true;
            let mut state = manager.lock();
            state.volumes.insert(volume.path.clone(), volume);
        }
        manager
            .link_volume(
                Path::new("/vols/ro"),
                "ct-ro",
                Path::new("/data"),
                Path::new("/rootfs/ct-ro/data"),
                false,
                false,
                false,
            )
            .await
            .unwrap();
        let state = manager.lock();
        let volume = state.volumes.get(Path::new("/vols/ro")).unwrap();
        assert!(volume.links[0].read_only);
    }

    #[test]
    fn state_names_round_trip() {
        for state in [
            VolumeState::Initial,
            VolumeState::Building,
            VolumeState::Ready,
            VolumeState::Tuning,
            VolumeState::Unlinked,
            VolumeState::ToDestroy,
            VolumeState::Destroying,
            VolumeState::Destroyed,
            VolumeState::Error,
        ] {
            assert_eq!(VolumeState::from_name(state.name()).unwrap(), state);
        }
        assert_eq!(VolumeState::ToDestroy.name(), "TO-DESTROY");
        assert!(VolumeState::from_name("HALF-BUILT").is_err());
    }

    #[test]
    fn path_conflicts() {
        assert!(paths_conflict(Path::new("/place/v1"), Path::new("/place/v1")));
        assert!(paths_conflict(Path::new("/place/v1/sub"), Path::new("/place/v1")));
        assert!(paths_conflict(Path::new("/place/v1"), Path::new("/place/v1/sub")));
        assert!(!paths_conflict(Path::new("/place/v1"), Path::new("/place/v10")));
        assert!(!paths_conflict(Path::new("/a"), Path::new("/b")));
    }

    #[tokio::test]
    async fn link_accounting_and_unlink_list() {
        let manager = manager().await;
        insert_ready(&manager, "/vols/data", false);

        manager
            .link_volume(
                Path::new("/vols/data"),
                "ct-1",
                Path::new("/data"),
                Path::new("/rootfs/ct-1/data"),
                false,
                false,
                false,
            )
            .await
            .unwrap();

        // Double link of the same target is rejected.
        let err = manager
            .link_volume(
                Path::new("/vols/data"),
                "ct-1",
                Path::new("/data"),
                Path::new("/rootfs/ct-1/data"),
                false,
                false,
                false,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Exists);

        assert_eq!(
            manager.resolve_link(Path::new("/rootfs/ct-1/data")),
            Some((PathBuf::from("/vols/data"), "ct-1".to_string()))
        );

        let mut unlinked = Vec::new();
        manager
            .unlink_volume(Path::new("/vols/data"), "ct-1", None, false, &mut unlinked)
            .await
            .unwrap();
        // Last link gone + no KeepStorage: scheduled for destruction.
        assert_eq!(unlinked, vec![PathBuf::from("/vols/data")]);
        let state = manager.lock();
        assert_eq!(
            state.volumes.get(Path::new("/vols/data")).unwrap().state,
            VolumeState::ToDestroy
        );
        assert!(state.links.is_empty());
    }

    #[tokio::test]
    async fn keep_storage_volume_is_not_scheduled() {
        let manager = manager().await;
        insert_ready(&manager, "/vols/keep", true);
        manager
            .link_volume(
                Path::new("/vols/keep"),
                "ct-2",
                Path::new("/mnt"),
                Path::new("/rootfs/ct-2/mnt"),
                false,
                false,
                false,
            )
            .await
            .unwrap();

        let mut unlinked = Vec::new();
        manager
            .unlink_volume(Path::new("/vols/keep"), "ct-2", None, false, &mut unlinked)
            .await
            .unwrap();
        assert!(unlinked.is_empty());
        let state = manager.lock();
        assert_eq!(
            state.volumes.get(Path::new("/vols/keep")).unwrap().state,
            VolumeState::Unlinked
        );
    }

    #[tokio::test]
    async fn unlink_all_walks_lifo() {
        let manager = manager().await;
        insert_ready(&manager, "/vols/a", true);
        insert_ready(&manager, "/vols/b", true);

        for (volume, target) in [("/vols/a", "/a"), ("/vols/b", "/b")] {
            manager
                .link_volume(
                    Path::new(volume),
                    "ct-3",
                    Path::new(target),
                    &PathBuf::from(format!("/rootfs/ct-3{}", target)),
                    false,
                    false,
                    false,
                )
                .await
                .unwrap();
        }

        let mut unlinked = Vec::new();
        manager.unlink_all_volumes("ct-3", &mut unlinked).await.unwrap();
        let state = manager.lock();
        assert!(state
            .volumes
            .values()
            .all(|v| v.links.iter().all(|l| l.container != "ct-3")));
    }

    #[tokio::test]
    async fn linking_requires_ready_state() {
        let manager = manager().await;
        {
            let mut volume = Volume::empty_for_tests();
            volume.path = PathBuf::from("/vols/building");
            volume.state = VolumeState::Building;
            let mut state = manager.lock();
            state.volumes.insert(volume.path.clone(), volume);
        }
        let err = manager
            .link_volume(
                Path::new("/vols/building"),
                "ct",
                Path::new("/x"),
                Path::new("/rootfs/x"),
                false,
                false,
                false,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Busy);
    }

    #[tokio::test]
    async fn guarantee_is_checked_against_place() {
        let manager = manager().await;
        let state = manager.lock();
        // An absurd guarantee can never fit.
        let err =
            VolumeManager::check_guarantee(&state, Path::new("/"), u64::MAX / 2, 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoSpace);
        // Zero guarantees always pass without touching statvfs.
        assert!(VolumeManager::check_guarantee(&state, Path::new("/nonexistent"), 0, 0).is_ok());
    }

    #[tokio::test]
    async fn conflict_check_covers_links() {
        let manager = manager().await;
        insert_ready(&manager, "/vols/base", false);
        let mut state = manager.lock();
        state
            .links
            .insert(PathBuf::from("/rootfs/ct/base"), PathBuf::from("/vols/base"));
        assert!(VolumeManager::check_conflicts(&state, Path::new("/vols/base/nested")).is_err());
        assert!(VolumeManager::check_conflicts(&state, Path::new("/rootfs/ct/base/sub")).is_err());
        assert!(VolumeManager::check_conflicts(&state, Path::new("/elsewhere")).is_ok());
    }
}
