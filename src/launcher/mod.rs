// Task launcher: the staged fork pipeline that moves a command into its
// namespaces, filesystem, cgroups and credentials, with every stage
// reported to the daemon over the launcher socket.

pub mod protocol;

use crate::cgroup::Cgroup;
use crate::error::{ErrorKind, RuntimeError, RuntimeResult};
use crate::launcher::protocol::{
    report_pair, Frame, ReportSocket, STAGE_CONFIGURED, STAGE_INIT, STAGE_MASTER,
    STAGE_NAMESPACES, STAGE_PORTAL,
};
use crate::network::{configure_inside_netns, setup_parent_side, NetCfg};
use crate::utils::caps::{apply_capabilities, Capabilities};
use crate::utils::console::ConsoleLogger;
use crate::utils::constants::LAUNCHER_STAGE_TIMEOUT_S;
use crate::utils::mounts::bind_mount;
use crate::utils::namespace::NamespaceSnapshot;
use crate::utils::process::ProcessUtils;
use nix::fcntl::{open, OFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::Signal;
use nix::sys::stat::Mode;
use nix::sys::wait::WaitStatus;
use nix::unistd::{
    chdir, chroot, close, dup2, execvpe, fork, getpid, pivot_root, sethostname, setgid,
    setgroups, setsid, setuid, ForkResult, Gid, Pid, Uid,
};
use std::ffi::CString;
use std::fs;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One bind mount requested by the container spec.
#[derive(Debug, Clone)]
pub struct BindEntry {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub read_only: bool,
}

/// One resource limit applied before anything else runs in the child.
#[derive(Debug, Clone)]
pub struct RlimitEntry {
    pub resource: Resource,
    pub soft: u64,
    pub hard: u64,
}

pub fn rlimit_resource_from_name(name: &str) -> Option<Resource> {
    match name {
        "as" => Some(Resource::RLIMIT_AS),
        "core" => Some(Resource::RLIMIT_CORE),
        "cpu" => Some(Resource::RLIMIT_CPU),
        "data" => Some(Resource::RLIMIT_DATA),
        "fsize" => Some(Resource::RLIMIT_FSIZE),
        "memlock" => Some(Resource::RLIMIT_MEMLOCK),
        "nofile" => Some(Resource::RLIMIT_NOFILE),
        "nproc" => Some(Resource::RLIMIT_NPROC),
        "stack" => Some(Resource::RLIMIT_STACK),
        _ => None,
    }
}

/// Immutable task descriptor handed to the launcher. The container state
/// machine owns it exclusively.
pub struct TaskEnv {
    pub container: String,
    pub command: Vec<String>,
    pub cwd: PathBuf,
    /// Root filesystem in the parent mount namespace; empty means no pivot.
    pub root: PathBuf,
    pub root_rdonly: bool,
    pub environ: Vec<(String, String)>,
    /// Unshare fresh namespaces instead of entering `parent_ns`.
    pub isolate: bool,
    pub triple_fork: bool,
    pub quadro_fork: bool,
    pub stdin_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub parent_ns: Option<NamespaceSnapshot>,
    pub rlimits: Vec<RlimitEntry>,
    pub hostname: String,
    pub set_etc_hostname: bool,
    pub bind_dns: bool,
    pub bind_map: Vec<BindEntry>,
    pub net: NetCfg,
    pub net_up: bool,
    /// Loop device backing the root volume, when there is one.
    pub loop_dev: i32,
    pub cgroups: Vec<Arc<Cgroup>>,
    pub uid: Option<Uid>,
    pub gid: Option<Gid>,
    pub caps: Option<Capabilities>,
}

impl Default for TaskEnv {
    fn default() -> Self {
        TaskEnv {
            container: String::new(),
            command: Vec::new(),
            cwd: PathBuf::from("/"),
            root: PathBuf::new(),
            root_rdonly: false,
            environ: Vec::new(),
            isolate: true,
            triple_fork: false,
            quadro_fork: false,
            stdin_path: PathBuf::from("/dev/null"),
            stdout_path: PathBuf::from("/dev/null"),
            stderr_path: PathBuf::from("/dev/null"),
            parent_ns: None,
            rlimits: Vec::new(),
            hostname: String::new(),
            set_etc_hostname: false,
            bind_dns: false,
            bind_map: Vec::new(),
            net: NetCfg::Inherited,
            net_up: false,
            loop_dev: -1,
            cgroups: Vec::new(),
            uid: None,
            gid: None,
            caps: None,
        }
    }
}

/// Start outcome: either the task never launched (`error`) or it ran and
/// the wait status is meaningful.
#[derive(Debug, Clone, Default)]
pub struct TaskExitStatus {
    pub error: Option<RuntimeError>,
    pub status: Option<i32>,
}

/// A started task as the daemon tracks it: the pid to signal, the virtual
/// pid inside the namespace, and the pid to wait for.
#[derive(Debug)]
pub struct Task {
    pub pid: Pid,
    pub vpid: i32,
    pub wpid: Pid,
}

pub fn encode_wait_status(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => -1,
    }
}

fn stage_timeout_ms() -> i32 {
    (LAUNCHER_STAGE_TIMEOUT_S * 1000) as i32
}

/// Launch a task. Runs in the calling thread: forks the master child,
/// drives the stage protocol, and reaps the master before returning.
pub fn start(env: TaskEnv) -> RuntimeResult<Task> {
    let (mut master_sock, sock) = report_pair()?;

    let master_pid = match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            drop(sock);
            child
        }
        Ok(ForkResult::Child) => {
            drop(master_sock);
            master_child(env, sock);
        }
        Err(e) => return Err(RuntimeError::from_errno(e, "fork(master)")),
    };

    match drive_stages(&env_summary(&env), &env, &mut master_sock, master_pid) {
        Ok(task) => Ok(task),
        Err(e) => {
            let _ = ProcessUtils::send_signal(master_pid, Signal::SIGKILL);
            let _ = ProcessUtils::wait_for_exit(master_pid);
            Err(e)
        }
    }
}

fn env_summary(env: &TaskEnv) -> String {
    format!("{}({})", env.container, env.command.join(" "))
}

/// Parent half of the stage protocol.
fn drive_stages(
    what: &str,
    env: &TaskEnv,
    master_sock: &mut ReportSocket,
    master_pid: Pid,
) -> RuntimeResult<Task> {
    let timeout = stage_timeout_ms();

    expect_pid(master_sock, STAGE_MASTER, timeout)?;
    master_sock.send_go()?;

    let ns_pid = expect_pid(master_sock, STAGE_NAMESPACES, timeout)?;

    // The child sits in its fresh netns now; create and push the links in
    // from our side before authorizing the next stage.
    if env.net.is_new_netns() && env.isolate {
        parent_network_setup(&env.net, ns_pid)?;
    }
    master_sock.send_go()?;

    let init_pid = expect_pid(master_sock, STAGE_INIT, timeout)?;
    let vpid = if env.triple_fork || env.quadro_fork {
        expect_pid(master_sock, STAGE_PORTAL, timeout)?
    } else {
        1
    };

    expect_configured(master_sock, timeout).map_err(|e| {
        ConsoleLogger::error(&format!("Task {} failed to configure: {}", what, e));
        let _ = ProcessUtils::send_signal(ProcessUtils::i32_to_pid(init_pid), Signal::SIGKILL);
        e
    })?;
    master_sock.send_go()?;

    // The master has done its job; reap it so the init reparents to us.
    ProcessUtils::wait_for_exit(master_pid)?;

    ConsoleLogger::debug(&format!(
        "Task {} started: init pid {}, vpid {}",
        what, init_pid, vpid
    ));
    Ok(Task {
        pid: ProcessUtils::i32_to_pid(init_pid),
        vpid,
        wpid: ProcessUtils::i32_to_pid(init_pid),
    })
}

fn expect_pid(sock: &mut ReportSocket, stage: u32, timeout: i32) -> RuntimeResult<i32> {
    match sock.recv_frame(timeout)? {
        Frame::Pid { stage: s, pid } if s == stage => Ok(pid),
        Frame::Pid { stage: s, pid } => Err(RuntimeError::socket(format!(
            "stage_protocol: got stage {} pid {} while waiting for stage {}",
            s, pid, stage
        ))),
        Frame::Error { errno, message, .. } => {
            Err(RuntimeError::with_errno(ErrorKind::Unknown, errno, message))
        }
    }
}

fn expect_configured(sock: &mut ReportSocket, timeout: i32) -> RuntimeResult<()> {
    match sock.recv_frame(timeout)? {
        Frame::Pid { stage, .. } if stage == STAGE_CONFIGURED => Ok(()),
        Frame::Pid { stage, pid } => Err(RuntimeError::socket(format!(
            "stage_protocol: unexpected stage {} pid {}",
            stage, pid
        ))),
        Frame::Error { errno, message, .. } => {
            Err(RuntimeError::with_errno(ErrorKind::Unknown, errno, message))
        }
    }
}

/// The parent-side network setup is async (rtnetlink); the launcher thread
/// drives it on a private runtime.
fn parent_network_setup(net: &NetCfg, child_pid: i32) -> RuntimeResult<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .map_err(RuntimeError::from)?;
    runtime
        .block_on(setup_parent_side(net, child_pid))
        .map_err(RuntimeError::from)
}

// ---------------------------------------------------------------------------
// Child side. Everything below runs post-fork and must only _exit.
// ---------------------------------------------------------------------------

/// Leaf cgroup attach descriptors, opened before the filesystem pivot cuts
/// us off from the controller mounts.
struct CgroupAttacher {
    fds: Vec<RawFd>,
}

impl CgroupAttacher {
    fn open(cgroups: &[Arc<Cgroup>]) -> RuntimeResult<Self> {
        let mut fds = Vec::with_capacity(cgroups.len());
        for cg in cgroups {
            let path = cg.path().join("cgroup.procs");
            let fd = open(
                path.as_path(),
                OFlag::O_WRONLY | OFlag::O_CLOEXEC,
                Mode::empty(),
            )
            .map_err(|e| RuntimeError::from_errno(e, format!("open({})", path.display())))?;
            fds.push(fd);
        }
        Ok(CgroupAttacher { fds })
    }

    /// Write our pid into every leaf. Runs again in each fork stage so the
    /// reaper barriers are accounted alongside the command.
    fn attach_self(&self) -> RuntimeResult<()> {
        let pid = format!("{}", getpid());
        for fd in &self.fds {
            nix::unistd::write(*fd, pid.as_bytes())
                .map_err(|e| RuntimeError::from_errno(e, format!("write(cgroup.procs, {})", pid)))?;
        }
        Ok(())
    }
}

impl Drop for CgroupAttacher {
    fn drop(&mut self) {
        for fd in &self.fds {
            let _ = close(*fd);
        }
    }
}

fn abort(sock: &ReportSocket, stage: u32, error: RuntimeError) -> ! {
    let _ = sock.send_frame(&Frame::Error {
        stage,
        errno: error.errno.unwrap_or(0),
        message: error.message,
    });
    unsafe { libc::_exit(1) }
}

/// First fork stage: new session, death pact with the daemon, namespace
/// entry, then the init fork.
fn master_child(env: TaskEnv, mut sock: ReportSocket) -> ! {
    if let Err(e) = setsid() {
        abort(&sock, STAGE_MASTER, RuntimeError::from_errno(e, "setsid()"));
    }
    unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) };

    if let Err(e) = sock.send_frame(&Frame::Pid {
        stage: STAGE_MASTER,
        pid: getpid().as_raw(),
    }) {
        abort(&sock, STAGE_MASTER, e);
    }
    if let Err(e) = sock.recv_go(stage_timeout_ms()) {
        abort(&sock, STAGE_MASTER, e);
    }

    if env.isolate {
        let mut flags = CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWPID;
        if env.net.is_new_netns() {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if let Err(e) = unshare(flags) {
            abort(
                &sock,
                STAGE_NAMESPACES,
                RuntimeError::from_errno(e, format!("unshare({:?})", flags)),
            );
        }
    } else if let Some(parent_ns) = &env.parent_ns {
        if let Err(e) = parent_ns.enter() {
            abort(&sock, STAGE_NAMESPACES, e);
        }
    }

    if let Err(e) = sock.send_frame(&Frame::Pid {
        stage: STAGE_NAMESPACES,
        pid: getpid().as_raw(),
    }) {
        abort(&sock, STAGE_NAMESPACES, e);
    }
    if let Err(e) = sock.recv_go(stage_timeout_ms()) {
        abort(&sock, STAGE_NAMESPACES, e);
    }

    // Attach descriptors must exist before the pivot hides the controller
    // mounts from us.
    let attacher = match CgroupAttacher::open(&env.cgroups) {
        Ok(a) => a,
        Err(e) => abort(&sock, STAGE_INIT, e),
    };

    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            let result = sock.send_frame(&Frame::Pid {
                stage: STAGE_INIT,
                pid: child.as_raw(),
            });
            if result.is_err() {
                let _ = ProcessUtils::send_signal(child, Signal::SIGKILL);
                unsafe { libc::_exit(1) };
            }
            // The init reparents to the daemon once we are gone.
            unsafe { libc::_exit(0) };
        }
        Ok(ForkResult::Child) => init_stage(env, sock, attacher),
        Err(e) => abort(&sock, STAGE_INIT, RuntimeError::from_errno(e, "fork(init)")),
    }
}

/// Pid 1 of the container. With triple/quadro fork it stays behind as a
/// reaper barrier; otherwise it becomes the command itself.
fn init_stage(env: TaskEnv, sock: ReportSocket, attacher: CgroupAttacher) -> ! {
    if !(env.triple_fork || env.quadro_fork) {
        child_workflow(env, sock, attacher);
    }

    // Reparent barrier: own session, accounted in the container cgroups.
    if let Err(e) = setsid() {
        abort(&sock, STAGE_PORTAL, RuntimeError::from_errno(e, "setsid()"));
    }
    if let Err(e) = attacher.attach_self() {
        abort(&sock, STAGE_PORTAL, e);
    }

    let quadro = env.quadro_fork;
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            if sock
                .send_frame(&Frame::Pid {
                    stage: STAGE_PORTAL,
                    pid: child.as_raw(),
                })
                .is_err()
            {
                let _ = ProcessUtils::send_signal(child, Signal::SIGKILL);
                unsafe { libc::_exit(1) };
            }
            reap_and_exit(child);
        }
        Ok(ForkResult::Child) => {
            if quadro {
                // One more barrier, plain fork.
                match unsafe { fork() } {
                    Ok(ForkResult::Parent { child }) => reap_and_exit(child),
                    Ok(ForkResult::Child) => child_workflow(env, sock, attacher),
                    Err(e) => abort(
                        &sock,
                        STAGE_PORTAL,
                        RuntimeError::from_errno(e, "fork(quadro)"),
                    ),
                }
            }
            child_workflow(env, sock, attacher)
        }
        Err(e) => abort(
            &sock,
            STAGE_PORTAL,
            RuntimeError::from_errno(e, "fork(portal)"),
        ),
    }
}

/// Wait for the next stage down and forward its exit status.
fn reap_and_exit(child: Pid) -> ! {
    let status = match ProcessUtils::wait_for_exit(child) {
        Ok(status) => encode_wait_status(status),
        Err(_) => 1,
    };
    unsafe { libc::_exit(status.max(0)) }
}

/// The ten configuration steps, in order, each error framed back to the
/// daemon before exit.
fn child_workflow(env: TaskEnv, mut sock: ReportSocket, attacher: CgroupAttacher) -> ! {
    macro_rules! step {
        ($result:expr) => {
            if let Err(e) = $result {
                abort(&sock, STAGE_CONFIGURED, e);
            }
        };
    }

    step!(apply_rlimits(&env.rlimits));
    step!(prepare_rootfs(&env));
    step!(enter_rootfs(&env));
    step!(apply_hostname(&env));
    step!(attacher.attach_self());
    drop(attacher);
    if env.net_up {
        step!(configure_inside_netns(&env.net).map_err(RuntimeError::from));
    }
    step!(reopen_stdio(&env, sock.raw_fd()));
    if let Some(caps) = &env.caps {
        step!(apply_capabilities(caps));
    }
    step!(drop_privileges(&env));

    if let Err(e) = sock.send_frame(&Frame::Pid {
        stage: STAGE_CONFIGURED,
        pid: getpid().as_raw(),
    }) {
        abort(&sock, STAGE_CONFIGURED, e);
    }
    if let Err(e) = sock.recv_go(stage_timeout_ms()) {
        abort(&sock, STAGE_CONFIGURED, e);
    }

    step!(chdir(&env.cwd).map_err(|e| {
        RuntimeError::from_errno(e, format!("chdir({})", env.cwd.display()))
    }));
    let error = exec_command(&env);
    abort(&sock, STAGE_CONFIGURED, error);
}

fn apply_rlimits(rlimits: &[RlimitEntry]) -> RuntimeResult<()> {
    for limit in rlimits {
        setrlimit(limit.resource, limit.soft, limit.hard).map_err(|e| {
            RuntimeError::from_errno(
                e,
                format!("setrlimit({:?}, {}, {})", limit.resource, limit.soft, limit.hard),
            )
        })?;
    }
    Ok(())
}

/// Stage the root filesystem while the old root is still reachable: loop
/// or bind mount of the root itself, then the DNS and user bind mounts.
fn prepare_rootfs(env: &TaskEnv) -> RuntimeResult<()> {
    if env.root.as_os_str().is_empty() {
        return Ok(());
    }

    // Keep mount events out of the parent namespace.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| RuntimeError::from_errno(e, "mount(/, MS_PRIVATE)"))?;

    if env.loop_dev >= 0 {
        let device = format!("/dev/loop{}", env.loop_dev);
        mount(
            Some(device.as_str()),
            &env.root,
            Some("ext4"),
            MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|e| {
            RuntimeError::from_errno(e, format!("mount({}, {})", device, env.root.display()))
        })?;
    } else {
        bind_mount(&env.root, &env.root, false)?;
    }

    if env.bind_dns {
        for file in ["/etc/resolv.conf", "/etc/hosts"] {
            let dest = env.root.join(&file[1..]);
            if Path::new(file).exists() && dest.exists() {
                bind_mount(Path::new(file), &dest, true)?;
            }
        }
    }

    for bind in &env.bind_map {
        let rel = bind.dest.strip_prefix("/").unwrap_or(&bind.dest);
        let dest = env.root.join(rel);
        if !dest.exists() {
            if bind.source.is_dir() {
                fs::create_dir_all(&dest).map_err(RuntimeError::from)?;
            } else if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(RuntimeError::from)?;
                fs::File::create(&dest).map_err(RuntimeError::from)?;
            }
        }
        bind_mount(&bind.source, &dest, bind.read_only)?;
    }
    Ok(())
}

/// Swap into the staged root, remount read-only when asked, and give the
/// container fresh proc and sys mounts.
fn enter_rootfs(env: &TaskEnv) -> RuntimeResult<()> {
    if env.root.as_os_str().is_empty() {
        return Ok(());
    }

    if env.isolate {
        chdir(&env.root)
            .map_err(|e| RuntimeError::from_errno(e, format!("chdir({})", env.root.display())))?;
        pivot_root(".", ".").map_err(|e| {
            RuntimeError::from_errno(e, format!("pivot_root({})", env.root.display()))
        })?;
        umount2(".", MntFlags::MNT_DETACH)
            .map_err(|e| RuntimeError::from_errno(e, "umount2(old_root)"))?;
        chdir("/").map_err(|e| RuntimeError::from_errno(e, "chdir(/)"))?;
    } else {
        chroot(&env.root)
            .map_err(|e| RuntimeError::from_errno(e, format!("chroot({})", env.root.display())))?;
        chdir("/").map_err(|e| RuntimeError::from_errno(e, "chdir(/)"))?;
    }

    if env.root_rdonly {
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| RuntimeError::from_errno(e, "remount(/, ro)"))?;
    }

    if Path::new("/proc").exists() {
        mount(
            Some("proc"),
            "/proc",
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            None::<&str>,
        )
        .map_err(|e| RuntimeError::from_errno(e, "mount(/proc)"))?;
    }
    if Path::new("/sys").exists() {
        mount(
            Some("sysfs"),
            "/sys",
            Some("sysfs"),
            MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            None::<&str>,
        )
        .map_err(|e| RuntimeError::from_errno(e, "mount(/sys)"))?;
    }
    Ok(())
}

fn apply_hostname(env: &TaskEnv) -> RuntimeResult<()> {
    if env.hostname.is_empty() {
        return Ok(());
    }
    sethostname(&env.hostname)
        .map_err(|e| RuntimeError::from_errno(e, format!("sethostname({})", env.hostname)))?;
    if env.set_etc_hostname && Path::new("/etc/hostname").exists() {
        fs::write("/etc/hostname", format!("{}\n", env.hostname)).map_err(RuntimeError::from)?;
    }
    Ok(())
}

/// Reopen the three standard descriptors onto the configured paths, then
/// close every other inherited descriptor except the report socket.
fn reopen_stdio(env: &TaskEnv, keep_fd: RawFd) -> RuntimeResult<()> {
    let stdin = open(
        env.stdin_path.as_path(),
        OFlag::O_RDONLY,
        Mode::empty(),
    )
    .map_err(|e| RuntimeError::from_errno(e, format!("open({})", env.stdin_path.display())))?;
    let stdout = open(
        env.stdout_path.as_path(),
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND,
        Mode::from_bits_truncate(0o644),
    )
    .map_err(|e| RuntimeError::from_errno(e, format!("open({})", env.stdout_path.display())))?;
    let stderr = open(
        env.stderr_path.as_path(),
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND,
        Mode::from_bits_truncate(0o644),
    )
    .map_err(|e| RuntimeError::from_errno(e, format!("open({})", env.stderr_path.display())))?;

    for (fd, target) in [(stdin, 0), (stdout, 1), (stderr, 2)] {
        dup2(fd, target).map_err(|e| RuntimeError::from_errno(e, format!("dup2({})", target)))?;
        if fd > 2 {
            let _ = close(fd);
        }
    }

    close_extra_fds(&[keep_fd]);
    Ok(())
}

/// Close every descriptor above stderr that is not whitelisted.
fn close_extra_fds(keep: &[RawFd]) {
    let entries = match fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries,
        Err(_) => return,
    };
    let mut fds: Vec<RawFd> = entries
        .flatten()
        .filter_map(|e| e.file_name().to_string_lossy().parse::<RawFd>().ok())
        .collect();
    fds.sort_unstable();
    for fd in fds {
        if fd > 2 && !keep.contains(&fd) {
            let _ = close(fd);
        }
    }
}

/// setgroups, setgid, setuid, in that order.
fn drop_privileges(env: &TaskEnv) -> RuntimeResult<()> {
    if let Some(gid) = env.gid {
        setgroups(&[gid]).map_err(|e| RuntimeError::from_errno(e, format!("setgroups({})", gid)))?;
        setgid(gid).map_err(|e| RuntimeError::from_errno(e, format!("setgid({})", gid)))?;
    }
    if let Some(uid) = env.uid {
        setuid(uid).map_err(|e| RuntimeError::from_errno(e, format!("setuid({})", uid)))?;
    }
    Ok(())
}

fn exec_command(env: &TaskEnv) -> RuntimeError {
    let argv: Vec<CString> = env
        .command
        .iter()
        .filter_map(|arg| CString::new(arg.as_str()).ok())
        .collect();
    if argv.is_empty() {
        return RuntimeError::invalid_value("exec(): empty command");
    }
    let envp: Vec<CString> = env
        .environ
        .iter()
        .filter_map(|(k, v)| CString::new(format!("{}={}", k, v)).ok())
        .collect();

    match execvpe(&argv[0], &argv, &envp) {
        Ok(_) => unreachable!(),
        Err(e) => RuntimeError::from_errno(e, format!("execvpe({})", env.command.join(" "))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::WaitStatus;

    #[test]
    fn wait_status_encoding() {
        assert_eq!(
            encode_wait_status(WaitStatus::Exited(Pid::from_raw(1), 0)),
            0
        );
        assert_eq!(
            encode_wait_status(WaitStatus::Exited(Pid::from_raw(1), 42)),
            42
        );
        assert_eq!(
            encode_wait_status(WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false)),
            128 + 9
        );
    }

    #[test]
    fn rlimit_names() {
        assert_eq!(
            rlimit_resource_from_name("nofile"),
            Some(Resource::RLIMIT_NOFILE)
        );
        assert_eq!(
            rlimit_resource_from_name("core"),
            Some(Resource::RLIMIT_CORE)
        );
        assert!(rlimit_resource_from_name("sockets").is_none());
    }

    #[test]
    fn default_env_is_inert() {
        let env = TaskEnv::default();
        assert!(env.command.is_empty());
        assert!(env.isolate);
        assert_eq!(env.loop_dev, -1);
        assert_eq!(env.stdin_path, PathBuf::from("/dev/null"));
        assert!(matches!(env.net, NetCfg::Inherited));
    }

    // Fork-based start() is exercised through the container state machine
    // in integration environments; the protocol itself is covered in
    // protocol.rs.
}
