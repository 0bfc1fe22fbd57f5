// Container state machine: glues cgroups, network, volumes and the task
// launcher, driving STOPPED -> STARTING -> RUNNING -> STOPPING ->
// (DEAD | STOPPED).

use crate::cgroup::subsystem::{
    CpuSubsystem, FreezerSubsystem, MemorySubsystem, NetClsSubsystem,
};
use crate::cgroup::Cgroup;
use crate::error::{RuntimeError, RuntimeResult};
use crate::launcher::{self, BindEntry, RlimitEntry, Task, TaskEnv, TaskExitStatus};
use crate::network::netlink::NetlinkHandle;
use crate::network::shaping::{tc_handle, tc_root_handle, TrafficShaper};
use crate::network::NetCfg;
use crate::utils::caps::Capabilities;
use crate::utils::console::ConsoleLogger;
use crate::utils::constants::{CGROUP_PREFIX, HTB_DEFAULT_CLASS};
use crate::utils::process::ProcessUtils;
use crate::volume::store::ContainerRow;
use nix::sys::signal::Signal;
use nix::unistd::{Gid, Uid};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Dead,
}

impl ContainerState {
    pub fn name(&self) -> &'static str {
        match self {
            ContainerState::Stopped => "stopped",
            ContainerState::Starting => "starting",
            ContainerState::Running => "running",
            ContainerState::Stopping => "stopping",
            ContainerState::Dead => "dead",
        }
    }

    pub fn from_name(name: &str) -> RuntimeResult<Self> {
        match name {
            "stopped" => Ok(ContainerState::Stopped),
            "starting" => Ok(ContainerState::Starting),
            "running" => Ok(ContainerState::Running),
            "stopping" => Ok(ContainerState::Stopping),
            "dead" => Ok(ContainerState::Dead),
            other => Err(RuntimeError::invalid_value(format!(
                "container_state({}): unknown state",
                other
            ))),
        }
    }
}

/// Declarative container description submitted by a client.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub root: PathBuf,
    pub root_rdonly: bool,
    pub environ: Vec<(String, String)>,
    pub hostname: String,
    pub bind_dns: bool,
    pub binds: Vec<BindEntry>,
    pub net: NetCfg,
    pub user: String,
    pub group: String,
    pub caps: Option<u64>,
    pub rlimits: Vec<(String, u64, u64)>,
    pub controllers: Vec<String>,
    pub memory_limit: u64,
    pub memory_guarantee: u64,
    pub cpu_shares: u64,
    /// Bandwidth of the container class in bytes per second; zero means
    /// no shaping.
    pub net_rate: u64,
    pub net_ceil: u64,
    pub net_prio: u32,
    pub isolate: bool,
    pub triple_fork: bool,
    pub quadro_fork: bool,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl Default for ContainerSpec {
    fn default() -> Self {
        ContainerSpec {
            name: String::new(),
            command: Vec::new(),
            cwd: PathBuf::from("/"),
            root: PathBuf::new(),
            root_rdonly: false,
            environ: Vec::new(),
            hostname: String::new(),
            bind_dns: false,
            binds: Vec::new(),
            net: NetCfg::default(),
            user: String::new(),
            group: String::new(),
            caps: None,
            rlimits: Vec::new(),
            controllers: vec![
                "memory".to_string(),
                "cpu".to_string(),
                "cpuacct".to_string(),
                "freezer".to_string(),
                "net_cls".to_string(),
            ],
            memory_limit: 0,
            memory_guarantee: 0,
            cpu_shares: 0,
            net_rate: 0,
            net_ceil: 0,
            net_prio: 3,
            isolate: true,
            triple_fork: false,
            quadro_fork: false,
            stdout_path: PathBuf::from("/dev/null"),
            stderr_path: PathBuf::from("/dev/null"),
        }
    }
}

impl ContainerSpec {
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(RuntimeError::invalid_value(format!(
                "container_spec({}): bad name",
                self.name
            )));
        }
        if self.command.is_empty() {
            return Err(RuntimeError::invalid_value(format!(
                "container_spec({}): empty command",
                self.name
            )));
        }
        self.net.validate().map_err(RuntimeError::from)?;
        for (name, _, _) in &self.rlimits {
            if launcher::rlimit_resource_from_name(name).is_none() {
                return Err(RuntimeError::invalid_value(format!(
                    "container_spec({}): unknown rlimit {}",
                    self.name, name
                )));
            }
        }
        Ok(())
    }
}

pub struct Container {
    pub id: String,
    pub spec: ContainerSpec,
    state: ContainerState,
    task: Option<Task>,
    leaf_cgroups: Vec<Arc<Cgroup>>,
    exit_status: TaskExitStatus,
    /// Minor id of the container's HTB class; also its net_cls classid.
    class_id: u16,
    shaped_devices: Vec<String>,
}

impl Container {
    pub fn new(spec: ContainerSpec, class_id: u16) -> Container {
        Container {
            id: uuid::Uuid::new_v4().to_string(),
            spec,
            state: ContainerState::Stopped,
            task: None,
            leaf_cgroups: Vec::new(),
            exit_status: TaskExitStatus::default(),
            class_id,
            shaped_devices: Vec::new(),
        }
    }

    /// Rebuild a handle for a task that survived a daemon restart. The
    /// original spec died with the old process image; lifecycle control
    /// (stop, kill, destroy, exit observation) still works through the
    /// recorded pids.
    pub fn adopt(name: &str, pid: i32, class_id: u16) -> Container {
        let mut container = Container::new(
            ContainerSpec {
                name: name.to_string(),
                command: vec!["<adopted>".to_string()],
                ..Default::default()
            },
            class_id,
        );
        container.state = ContainerState::Running;
        container.task = Some(Task {
            pid: ProcessUtils::i32_to_pid(pid),
            vpid: 1,
            wpid: ProcessUtils::i32_to_pid(pid),
        });
        container
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    #[allow(dead_code)]
    pub fn exit_status(&self) -> &TaskExitStatus {
        &self.exit_status
    }

    pub fn task_pid(&self) -> Option<i32> {
        self.task.as_ref().map(|t| t.pid.as_raw())
    }

    pub fn wait_pid(&self) -> Option<i32> {
        self.task.as_ref().map(|t| t.wpid.as_raw())
    }

    pub fn row(&self) -> ContainerRow {
        ContainerRow {
            id: self.id.clone(),
            name: self.spec.name.clone(),
            state: self.state.name().to_string(),
            pid: self.task_pid(),
            exit_code: self.exit_status.status,
            start_error: self.exit_status.error.as_ref().map(|e| e.to_string()),
        }
    }

    /// One leaf cgroup per configured controller, created under the
    /// runtime's subtree and loaded with the spec's typed limits.
    fn prepare_cgroups(&mut self) -> RuntimeResult<()> {
        self.leaf_cgroups.clear();
        for controller in &self.spec.controllers {
            let leaf = Cgroup::root(&[controller.as_str()])
                .child(CGROUP_PREFIX)
                .child(&self.spec.name);
            leaf.create()?;

            match controller.as_str() {
                "memory" => {
                    if self.spec.memory_limit > 0 {
                        MemorySubsystem::set_limit(&leaf, self.spec.memory_limit)?;
                    }
                    if self.spec.memory_guarantee > 0 {
                        MemorySubsystem::set_guarantee(&leaf, self.spec.memory_guarantee)?;
                    }
                }
                "cpu" => {
                    if self.spec.cpu_shares > 0 {
                        CpuSubsystem::set_shares(&leaf, self.spec.cpu_shares)?;
                    }
                }
                "net_cls" => {
                    NetClsSubsystem::set_classid(&leaf, tc_handle(1, self.class_id))?;
                }
                _ => {}
            }
            self.leaf_cgroups.push(leaf);
        }
        Ok(())
    }

    fn remove_cgroups(&mut self) {
        for cg in self.leaf_cgroups.drain(..) {
            if let Err(e) = cg.remove() {
                ConsoleLogger::warning(&format!(
                    "Leaving cgroup {} behind: {}",
                    cg.path().display(),
                    e
                ));
            }
        }
    }

    fn resolve_credentials(&self) -> RuntimeResult<(Option<Uid>, Option<Gid>)> {
        if self.spec.user.is_empty() {
            return Ok((None, None));
        }
        let user = nix::unistd::User::from_name(&self.spec.user)
            .map_err(|e| RuntimeError::from_errno(e, format!("getpwnam({})", self.spec.user)))?
            .ok_or_else(|| RuntimeError::not_found(format!("getpwnam({})", self.spec.user)))?;
        let gid = if self.spec.group.is_empty() {
            user.gid
        } else {
            nix::unistd::Group::from_name(&self.spec.group)
                .map_err(|e| {
                    RuntimeError::from_errno(e, format!("getgrnam({})", self.spec.group))
                })?
                .ok_or_else(|| RuntimeError::not_found(format!("getgrnam({})", self.spec.group)))?
                .gid
        };
        Ok((Some(user.uid), Some(gid)))
    }

    fn build_task_env(&self) -> RuntimeResult<TaskEnv> {
        let (uid, gid) = self.resolve_credentials()?;
        let mut rlimits = Vec::with_capacity(self.spec.rlimits.len());
        for (name, soft, hard) in &self.spec.rlimits {
            // validate() guarantees resolution succeeds
            if let Some(resource) = launcher::rlimit_resource_from_name(name) {
                rlimits.push(RlimitEntry {
                    resource,
                    soft: *soft,
                    hard: *hard,
                });
            }
        }

        Ok(TaskEnv {
            container: self.spec.name.clone(),
            command: self.spec.command.clone(),
            cwd: self.spec.cwd.clone(),
            root: self.spec.root.clone(),
            root_rdonly: self.spec.root_rdonly,
            environ: self.spec.environ.clone(),
            isolate: self.spec.isolate,
            triple_fork: self.spec.triple_fork,
            quadro_fork: self.spec.quadro_fork,
            stdin_path: PathBuf::from("/dev/null"),
            stdout_path: self.spec.stdout_path.clone(),
            stderr_path: self.spec.stderr_path.clone(),
            parent_ns: None,
            rlimits,
            hostname: self.spec.hostname.clone(),
            set_etc_hostname: !self.spec.hostname.is_empty(),
            bind_dns: self.spec.bind_dns,
            bind_map: self.spec.binds.clone(),
            net: self.spec.net.clone(),
            net_up: self.spec.net.is_new_netns(),
            loop_dev: -1,
            cgroups: self.leaf_cgroups.clone(),
            uid,
            gid,
            caps: self.spec.caps.map(Capabilities::all_same),
        })
    }

    /// Install the container's HTB class and cgroup filter on the host
    /// side of each veth it owns.
    fn setup_shaping(&mut self) -> RuntimeResult<()> {
        if self.spec.net_rate == 0 {
            return Ok(());
        }
        let peers: Vec<String> = match &self.spec.net {
            NetCfg::NewNetNs(cfg) => cfg.veth.iter().map(|v| v.peer.clone()).collect(),
            _ => Vec::new(),
        };
        for peer in peers {
            let mut shaper = TrafficShaper::open(&peer).map_err(RuntimeError::from)?;
            let root = tc_handle(1, 0);
            match shaper.add_htb(tc_root_handle(), root, HTB_DEFAULT_CLASS as u32) {
                Ok(()) => {}
                Err(e) if matches!(&e, crate::network::error::NetworkError::Message { errno, .. } if *errno == libc::EEXIST) => {}
                Err(e) => return Err(e.into()),
            }
            shaper
                .add_class(
                    root,
                    tc_handle(1, self.class_id),
                    self.spec.net_prio,
                    self.spec.net_rate,
                    self.spec.net_ceil,
                )
                .map_err(RuntimeError::from)?;
            shaper
                .add_cgroup_filter(root, tc_handle(1, self.class_id))
                .map_err(RuntimeError::from)?;
            self.shaped_devices.push(peer);
        }
        Ok(())
    }

    fn teardown_network(&mut self) {
        for device in std::mem::take(&mut self.shaped_devices) {
            if let Ok(mut shaper) = TrafficShaper::open(&device) {
                let root = tc_handle(1, 0);
                let _ = shaper.remove_cgroup_filter(root, tc_handle(1, self.class_id));
                let _ = shaper.remove_class(root, tc_handle(1, self.class_id));
            }
        }

        // Host-side veth ends vanish with the netns, but remove them
        // explicitly in case the namespace lingers.
        let peers: Vec<String> = match &self.spec.net {
            NetCfg::NewNetNs(cfg) => cfg.veth.iter().map(|v| v.peer.clone()).collect(),
            _ => Vec::new(),
        };
        if !peers.is_empty() {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .enable_time()
                .build();
            if let Ok(runtime) = runtime {
                runtime.block_on(async {
                    if let Ok(handle) = NetlinkHandle::new() {
                        for peer in peers {
                            let _ = handle.remove_link(&peer).await;
                        }
                    }
                });
            }
        }
    }

    /// Drive STOPPED -> STARTING -> RUNNING. A failure lands back in
    /// STOPPED with the error recorded in the exit status.
    pub fn start(&mut self) -> RuntimeResult<()> {
        if self.state != ContainerState::Stopped {
            return Err(RuntimeError::busy(format!(
                "container_start({}): container is {}",
                self.spec.name,
                self.state.name()
            )));
        }
        self.spec.validate()?;
        self.state = ContainerState::Starting;
        self.exit_status = TaskExitStatus::default();

        let result = self
            .prepare_cgroups()
            .and_then(|()| self.build_task_env())
            .and_then(launcher::start)
            .and_then(|task| {
                self.task = Some(task);
                self.setup_shaping()
            });

        match result {
            Ok(()) => {
                self.state = ContainerState::Running;
                ConsoleLogger::success(&format!(
                    "Container {} running (pid {})",
                    self.spec.name,
                    self.task_pid().unwrap_or(-1)
                ));
                Ok(())
            }
            Err(e) => {
                self.exit_status.error = Some(e.clone());
                self.teardown_network();
                self.remove_cgroups();
                self.task = None;
                self.state = ContainerState::Stopped;
                Err(e)
            }
        }
    }

    pub fn kill(&self, signal: Signal) -> RuntimeResult<()> {
        match &self.task {
            Some(task) if self.state == ContainerState::Running => {
                ProcessUtils::send_signal(task.pid, signal)
            }
            _ => Err(RuntimeError::invalid_value(format!(
                "container_kill({}): container is {}",
                self.spec.name,
                self.state.name()
            ))),
        }
    }

    /// Record a task exit observed by the reaper.
    pub fn on_task_exit(&mut self, status: i32) {
        if self.state == ContainerState::Running || self.state == ContainerState::Starting {
            self.exit_status.status = Some(status);
            self.state = ContainerState::Dead;
            ConsoleLogger::info(&format!(
                "Container {} exited with status {}",
                self.spec.name, status
            ));
        }
    }

    /// Stop a running or dead container: freeze, kill the whole group,
    /// thaw, release the cgroups and network.
    pub fn stop(&mut self) -> RuntimeResult<()> {
        match self.state {
            ContainerState::Running | ContainerState::Starting | ContainerState::Dead => {}
            _ => {
                return Err(RuntimeError::invalid_value(format!(
                    "container_stop({}): container is {}",
                    self.spec.name,
                    self.state.name()
                )))
            }
        }
        self.state = ContainerState::Stopping;

        if let Some(freezer) = self
            .leaf_cgroups
            .iter()
            .find(|cg| cg.root_controllers().contains(&"freezer".to_string()))
            .cloned()
        {
            // Freeze so the group cannot fork while we deliver SIGKILL.
            if let Err(e) = FreezerSubsystem::freeze(&freezer) {
                ConsoleLogger::warning(&format!(
                    "Freezing {} failed, killing unfrozen: {}",
                    self.spec.name, e
                ));
            }
            let _ = freezer.kill(Signal::SIGKILL);
            if let Err(e) = FreezerSubsystem::thaw(&freezer) {
                ConsoleLogger::warning(&format!("Thawing {} failed: {}", self.spec.name, e));
            }
        } else if let Some(task) = &self.task {
            let _ = ProcessUtils::send_signal(task.pid, Signal::SIGKILL);
        }

        if let Some(task) = self.task.take() {
            let _ = ProcessUtils::wait_for_exit(task.wpid);
        }
        self.teardown_network();
        self.remove_cgroups();
        self.state = ContainerState::Stopped;
        ConsoleLogger::info(&format!("Container {} stopped", self.spec.name));
        Ok(())
    }

    /// Destroy from any state. Volumes are unlinked by the runtime before
    /// this is called.
    pub fn destroy(&mut self) -> RuntimeResult<()> {
        match self.state {
            ContainerState::Running | ContainerState::Starting | ContainerState::Dead => {
                self.stop()?;
            }
            ContainerState::Stopping | ContainerState::Stopped => {
                self.teardown_network();
                self.remove_cgroups();
            }
        }
        self.state = ContainerState::Stopped;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            command: vec!["/bin/true".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn state_names_round_trip() {
        for state in [
            ContainerState::Stopped,
            ContainerState::Starting,
            ContainerState::Running,
            ContainerState::Stopping,
            ContainerState::Dead,
        ] {
            assert_eq!(ContainerState::from_name(state.name()).unwrap(), state);
        }
        assert!(ContainerState::from_name("paused").is_err());
    }

    #[test]
    fn spec_validation() {
        assert!(spec("web").validate().is_ok());

        let mut bad = spec("web");
        bad.command.clear();
        assert!(bad.validate().is_err());

        let mut bad = spec("we/b");
        bad.command = vec!["/bin/true".to_string()];
        assert!(bad.validate().is_err());

        let mut bad = spec("web");
        bad.rlimits.push(("sockets".to_string(), 1, 1));
        assert!(bad.validate().is_err());

        let mut ok = spec("web");
        ok.rlimits.push(("nofile".to_string(), 1024, 4096));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn fresh_container_is_stopped() {
        let container = Container::new(spec("idle"), 3);
        assert_eq!(container.state(), ContainerState::Stopped);
        assert!(container.task_pid().is_none());
        assert!(container.exit_status().error.is_none());
    }

    #[test]
    fn kill_requires_running() {
        let container = Container::new(spec("idle"), 3);
        assert!(container.kill(Signal::SIGTERM).is_err());
    }

    #[test]
    fn exit_recorded_only_while_running() {
        let mut container = Container::new(spec("worker"), 4);
        container.on_task_exit(0);
        assert_eq!(container.state(), ContainerState::Stopped);

        container.state = ContainerState::Running;
        container.on_task_exit(137);
        assert_eq!(container.state(), ContainerState::Dead);
        assert_eq!(container.exit_status().status, Some(137));
    }

    #[test]
    fn row_reflects_state() {
        let mut container = Container::new(spec("db"), 5);
        container.state = ContainerState::Dead;
        container.exit_status.status = Some(1);
        let row = container.row();
        assert_eq!(row.state, "dead");
        assert_eq!(row.exit_code, Some(1));
        assert_eq!(row.name, "db");
    }

    #[test]
    fn start_requires_stopped() {
        let mut container = Container::new(spec("dup"), 6);
        container.state = ContainerState::Running;
        let err = container.start().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Busy);
    }
}
