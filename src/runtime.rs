// The daemon's explicit context: volume registry, container table, KV
// store and crash recovery. Replaces process-global mutable state with one
// owner passed around by reference.

use crate::cgroup::CgroupSnapshot;
use crate::container::{Container, ContainerSpec, ContainerState};
use crate::error::{ErrorKind, RuntimeError, RuntimeResult};
use crate::utils::console::ConsoleLogger;
use crate::utils::constants::CGROUP_PREFIX;
use crate::utils::process::ProcessUtils;
use crate::volume::store::VolumeStore;
use crate::volume::{VolumeManager, VolumeSpec};
use nix::sys::signal::Signal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub default_place: PathBuf,
    pub bridge: String,
}

impl RuntimeConfig {
    pub fn at(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir: PathBuf = data_dir.into();
        RuntimeConfig {
            db_path: data_dir.join("warren.db"),
            default_place: data_dir.join("volumes"),
            bridge: crate::utils::constants::DEFAULT_BRIDGE.to_string(),
            data_dir,
        }
    }
}

pub struct Runtime {
    pub config: RuntimeConfig,
    pub volumes: VolumeManager,
    store: VolumeStore,
    containers: std::sync::Mutex<HashMap<String, Arc<Mutex<Container>>>>,
    next_class_id: AtomicU16,
}

#[allow(dead_code)] // Container API surface; the RPC server drives the rest
impl Runtime {
    pub async fn new(config: RuntimeConfig) -> RuntimeResult<Arc<Runtime>> {
        std::fs::create_dir_all(&config.data_dir).map_err(RuntimeError::from)?;
        std::fs::create_dir_all(&config.default_place).map_err(RuntimeError::from)?;

        let pool = Self::connect(&config.db_path).await?;
        let store = VolumeStore::new(pool.clone());
        store.initialize_schema().await.map_err(|e| {
            RuntimeError::new(ErrorKind::Unknown, format!("schema_init: {}", e))
        })?;

        Ok(Arc::new(Runtime {
            config,
            volumes: VolumeManager::new(VolumeStore::new(pool.clone())),
            store,
            containers: std::sync::Mutex::new(HashMap::new()),
            // Class minors 1 and 2 are the root and default classes.
            next_class_id: AtomicU16::new(3),
        }))
    }

    async fn connect(db_path: &Path) -> RuntimeResult<SqlitePool> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| {
                RuntimeError::new(
                    ErrorKind::Unknown,
                    format!("sqlite_connect({}): {}", db_path.display(), e),
                )
            })
    }

    fn container(&self, name: &str) -> RuntimeResult<Arc<Mutex<Container>>> {
        let containers = self
            .containers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        containers
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::not_found(format!("container({})", name)))
    }

    pub fn allocate_class_id(&self) -> u16 {
        self.next_class_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn create_container(self: &Arc<Self>, spec: ContainerSpec) -> RuntimeResult<String> {
        spec.validate()?;
        let name = spec.name.clone();
        let container = Container::new(spec, self.allocate_class_id());
        let row = container.row();
        {
            let mut containers = self
                .containers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if containers.contains_key(&name) {
                return Err(RuntimeError::exists(format!("container({})", name)));
            }
            containers.insert(name.clone(), Arc::new(Mutex::new(container)));
        }
        self.store
            .save_container(&row)
            .await
            .map_err(|e| RuntimeError::new(ErrorKind::Unknown, format!("container_save: {}", e)))?;
        Ok(name)
    }

    /// Start a container. The launcher blocks its thread for the duration
    /// of the stage protocol, so the work runs on the blocking pool.
    pub async fn start_container(self: &Arc<Self>, name: &str) -> RuntimeResult<()> {
        let slot = self.container(name)?;
        let mut guard = slot.clone().lock_owned().await;
        let result = tokio::task::spawn_blocking(move || {
            let start_result = guard.start();
            (guard, start_result)
        })
        .await
        .map_err(|e| RuntimeError::new(ErrorKind::Unknown, format!("container_start: {}", e)))?;

        let (guard, start_result) = result;
        let row = guard.row();
        drop(guard);
        self.store
            .save_container(&row)
            .await
            .map_err(|e| RuntimeError::new(ErrorKind::Unknown, format!("container_save: {}", e)))?;

        if start_result.is_ok() {
            self.spawn_exit_observer(name.to_string(), slot);
        }
        start_result
    }

    /// Observe the task's exit with a non-blocking reap loop and move the
    /// container to DEAD when it goes.
    fn spawn_exit_observer(self: &Arc<Self>, name: String, slot: Arc<Mutex<Container>>) {
        let runtime = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let mut container = slot.lock().await;
                if container.state() != ContainerState::Running {
                    return;
                }
                let wpid = match container.wait_pid() {
                    Some(pid) => ProcessUtils::i32_to_pid(pid),
                    None => return,
                };
                match ProcessUtils::try_wait(wpid) {
                    Ok(None) => continue,
                    Ok(Some(status)) => {
                        container.on_task_exit(crate::launcher::encode_wait_status(status));
                        let row = container.row();
                        drop(container);
                        if let Err(e) = runtime.store.save_container(&row).await {
                            ConsoleLogger::warning(&format!(
                                "Failed to persist exit of {}: {}",
                                name, e
                            ));
                        }
                        return;
                    }
                    Err(_) if ProcessUtils::is_process_running(wpid) => {
                        // Not our child (adopted after restart); fall back
                        // to liveness polling.
                        continue;
                    }
                    Err(_) => {
                        container.on_task_exit(-1);
                        let row = container.row();
                        drop(container);
                        if let Err(e) = runtime.store.save_container(&row).await {
                            ConsoleLogger::warning(&format!(
                                "Failed to persist exit of {}: {}",
                                name, e
                            ));
                        }
                        return;
                    }
                }
            }
        });
    }

    pub async fn stop_container(self: &Arc<Self>, name: &str) -> RuntimeResult<()> {
        let slot = self.container(name)?;
        let guard = slot.clone().lock_owned().await;
        let (guard, result) = tokio::task::spawn_blocking(move || {
            let mut guard = guard;
            let result = guard.stop();
            (guard, result)
        })
        .await
        .map_err(|e| RuntimeError::new(ErrorKind::Unknown, format!("container_stop: {}", e)))?;
        let row = guard.row();
        drop(guard);
        self.store
            .save_container(&row)
            .await
            .map_err(|e| RuntimeError::new(ErrorKind::Unknown, format!("container_save: {}", e)))?;
        result
    }

    pub async fn kill_container(self: &Arc<Self>, name: &str, signal: Signal) -> RuntimeResult<()> {
        let slot = self.container(name)?;
        let container = slot.lock().await;
        container.kill(signal)
    }

    /// Destroy from any state: stop the task, unlink every volume (LIFO),
    /// tear down the unlinked ones, drop the persisted row.
    pub async fn destroy_container(self: &Arc<Self>, name: &str) -> RuntimeResult<()> {
        let slot = self.container(name)?;
        let guard = slot.clone().lock_owned().await;
        let (guard, result) = tokio::task::spawn_blocking(move || {
            let mut guard = guard;
            let result = guard.destroy();
            (guard, result)
        })
        .await
        .map_err(|e| RuntimeError::new(ErrorKind::Unknown, format!("container_destroy: {}", e)))?;
        let id = guard.id.clone();
        drop(guard);
        result?;

        let mut unlinked = Vec::new();
        self.volumes.unlink_all_volumes(name, &mut unlinked).await?;
        self.volumes.destroy_unlinked(unlinked).await?;

        {
            let mut containers = self
                .containers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            containers.remove(name);
        }
        self.store
            .remove_container(&id)
            .await
            .map_err(|e| RuntimeError::new(ErrorKind::Unknown, format!("container_remove: {}", e)))?;
        ConsoleLogger::info(&format!("Container {} destroyed", name));
        Ok(())
    }

    pub async fn create_volume(self: &Arc<Self>, mut spec: VolumeSpec) -> RuntimeResult<PathBuf> {
        if spec.place.is_none() {
            spec.place = Some(self.config.default_place.clone());
        }
        self.volumes.create(spec).await
    }

    /// Volume creation as requests arrive: a string property map with
    /// K/M/G-suffixed size values.
    pub async fn create_volume_from_config(
        self: &Arc<Self>,
        config: &HashMap<String, String>,
    ) -> RuntimeResult<PathBuf> {
        self.create_volume(VolumeSpec::from_config(config)?).await
    }

    /// Restart recovery: rehydrate volumes from the KV store, re-register
    /// surviving cgroup hierarchies, then reconcile persisted containers
    /// against live pids.
    pub async fn restore(self: &Arc<Self>) -> RuntimeResult<()> {
        self.volumes.restore_all().await?;

        let snapshot = CgroupSnapshot::take()?;
        ConsoleLogger::debug(&format!(
            "Registered {} cgroup node(s) from {} hierarchy root(s)",
            snapshot.cgroups.len(),
            snapshot.roots.len()
        ));

        let rows = self
            .store
            .load_containers()
            .await
            .map_err(|e| RuntimeError::new(ErrorKind::Unknown, format!("container_load: {}", e)))?;
        let mut known = HashSet::new();
        for row in rows {
            known.insert(row.name.clone());
            let state = ContainerState::from_name(&row.state).unwrap_or(ContainerState::Dead);
            let alive = row
                .pid
                .map(|pid| ProcessUtils::is_process_running(ProcessUtils::i32_to_pid(pid)))
                .unwrap_or(false);
            if state == ContainerState::Running && alive {
                // The task survived the daemon restart: adopt it so stop,
                // kill and destroy keep working, and watch its exit.
                let pid = row.pid.unwrap_or(-1);
                let adopted =
                    Container::adopt(&row.name, pid, self.allocate_class_id());
                let slot = Arc::new(Mutex::new(adopted));
                {
                    let mut containers = self
                        .containers
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    containers.insert(row.name.clone(), slot.clone());
                }
                self.spawn_exit_observer(row.name.clone(), slot);
                ConsoleLogger::info(&format!(
                    "Reattached to running container {} (pid {})",
                    row.name, pid
                ));
                continue;
            }
            if matches!(
                state,
                ContainerState::Running | ContainerState::Starting | ContainerState::Stopping
            ) {
                let mut dead = row.clone();
                dead.state = "dead".to_string();
                dead.exit_code = Some(-1);
                if let Err(e) = self.store.save_container(&dead).await {
                    ConsoleLogger::warning(&format!(
                        "Failed to mark {} dead after restart: {}",
                        row.name, e
                    ));
                }
            }
        }

        self.reap_orphan_cgroups(&snapshot, &known);
        Ok(())
    }

    /// Remove container leaf cgroups whose owner is gone.
    fn reap_orphan_cgroups(&self, snapshot: &CgroupSnapshot, known: &HashSet<String>) {
        for root in &snapshot.roots {
            let subtree = root.child(CGROUP_PREFIX);
            let leaves = match subtree.find_children() {
                Ok(leaves) => leaves,
                Err(_) => continue,
            };
            for leaf in leaves {
                if leaf.name() == CGROUP_PREFIX || known.contains(leaf.name()) {
                    continue;
                }
                ConsoleLogger::warning(&format!(
                    "Removing orphaned cgroup {}",
                    leaf.path().display()
                ));
                if let Err(e) = leaf.remove() {
                    ConsoleLogger::warning(&format!(
                        "Orphaned cgroup {} stays: {}",
                        leaf.path().display(),
                        e
                    ));
                }
            }
        }
    }

    pub fn container_states(&self) -> Vec<(String, String)> {
        let containers = self
            .containers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut out = Vec::with_capacity(containers.len());
        for (name, slot) in containers.iter() {
            if let Ok(container) = slot.try_lock() {
                out.push((name.clone(), container.state().name().to_string()));
            } else {
                out.push((name.clone(), "busy".to_string()));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn runtime() -> Arc<Runtime> {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig::at(dir.path());
        // Leak the tempdir so the database outlives the handle.
        std::mem::forget(dir);
        Runtime::new(config).await.unwrap()
    }

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            command: vec!["/bin/true".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn config_paths_derive_from_data_dir() {
        let config = RuntimeConfig::at("/var/lib/warren");
        assert_eq!(config.db_path, PathBuf::from("/var/lib/warren/warren.db"));
        assert_eq!(
            config.default_place,
            PathBuf::from("/var/lib/warren/volumes")
        );
    }

    #[tokio::test]
    async fn container_registry_rejects_duplicates() {
        let runtime = runtime().await;
        runtime.create_container(spec("web")).await.unwrap();
        let err = runtime.create_container(spec("web")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Exists);

        let states = runtime.container_states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0], ("web".to_string(), "stopped".to_string()));
    }

    #[tokio::test]
    async fn class_ids_are_unique_and_skip_reserved() {
        let runtime = runtime().await;
        let first = runtime.allocate_class_id();
        let second = runtime.allocate_class_id();
        assert!(first >= 3);
        assert_eq!(second, first + 1);
    }

    #[tokio::test]
    async fn unknown_container_is_not_found() {
        let runtime = runtime().await;
        let err = runtime.start_container("ghost").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
