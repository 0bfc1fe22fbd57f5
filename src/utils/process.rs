use crate::error::{ErrorKind, RuntimeError, RuntimeResult};
use crate::utils::console::ConsoleLogger;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Retry `f` while it keeps failing with EBUSY, sleeping `period_ms`
/// between attempts. Non-busy errors stop the loop immediately.
pub fn retry_busy<T, F>(times: u32, period_ms: u64, mut f: F) -> RuntimeResult<T>
where
    F: FnMut() -> RuntimeResult<T>,
{
    let times = times.max(1);
    let mut last = None;
    for attempt in 0..times {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_busy() => {
                if attempt + 1 < times {
                    thread::sleep(Duration::from_millis(period_ms));
                }
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| RuntimeError::busy("retry_busy: attempts exhausted")))
}

/// Retry `f` until it succeeds or `times` attempts have been made.
#[allow(dead_code)]
pub fn retry_failed<T, F>(times: u32, period_ms: u64, mut f: F) -> RuntimeResult<T>
where
    F: FnMut() -> RuntimeResult<T>,
{
    let times = times.max(1);
    let mut last = None;
    for attempt in 0..times {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt + 1 < times {
                    thread::sleep(Duration::from_millis(period_ms));
                }
                last = Some(e);
            }
        }
    }
    Err(last.expect("retry_failed ran at least once"))
}

pub struct ProcessUtils;

impl ProcessUtils {
    pub fn pid_to_i32(pid: Pid) -> i32 {
        pid.as_raw()
    }

    pub fn i32_to_pid(pid: i32) -> Pid {
        Pid::from_raw(pid)
    }

    /// Check process existence with a null signal.
    pub fn is_process_running(pid: Pid) -> bool {
        signal::kill(pid, None).is_ok()
    }

    pub fn send_signal(pid: Pid, sig: Signal) -> RuntimeResult<()> {
        signal::kill(pid, sig)
            .map_err(|e| RuntimeError::from_errno(e, format!("kill({}, {:?})", pid, sig)))
    }

    /// waitpid with EINTR retry. Returns the raw wait status.
    pub fn wait_for_exit(pid: Pid) -> RuntimeResult<WaitStatus> {
        loop {
            match waitpid(pid, None) {
                Ok(status) => return Ok(status),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    return Err(RuntimeError::from_errno(e, format!("waitpid({})", pid)));
                }
            }
        }
    }

    /// Non-blocking reap, used by the exit observers.
    pub fn try_wait(pid: Pid) -> RuntimeResult<Option<WaitStatus>> {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => Ok(Some(status)),
            Err(nix::errno::Errno::EINTR) => Ok(None),
            Err(e) => Err(RuntimeError::from_errno(e, format!("waitpid({})", pid))),
        }
    }
}

/// Daemon pidfile: a single line holding the pid.
pub struct Pidfile {
    path: String,
}

impl Pidfile {
    pub fn new(path: impl Into<String>) -> Self {
        Pidfile { path: path.into() }
    }

    pub fn write(&self) -> RuntimeResult<()> {
        fs::write(&self.path, format!("{}\n", std::process::id())).map_err(RuntimeError::from)
    }

    #[allow(dead_code)] // Used by the daemon control commands
    pub fn read(&self) -> RuntimeResult<Pid> {
        let data = fs::read_to_string(&self.path).map_err(RuntimeError::from)?;
        let pid: i32 = data.trim().parse().map_err(|_| {
            RuntimeError::new(
                ErrorKind::InvalidValue,
                format!("pidfile_read({}): bad pid", self.path),
            )
        })?;
        Ok(Pid::from_raw(pid))
    }

    pub fn remove(&self) {
        if Path::new(&self.path).exists() {
            if let Err(e) = fs::remove_file(&self.path) {
                ConsoleLogger::warning(&format!("Failed to remove pidfile {}: {}", self.path, e));
            }
        }
    }
}

/// Lower the daemon's own OOM score so container workloads die first.
pub fn set_oom_score_adj(value: i32) -> RuntimeResult<()> {
    fs::write("/proc/self/oom_score_adj", format!("{}\n", value)).map_err(RuntimeError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn retry_busy_stops_on_other_errors() {
        let calls = AtomicU32::new(0);
        let result: RuntimeResult<()> = retry_busy(5, 1, || {
            calls.fetch_add(1, Ordering::Relaxed);
            Err(RuntimeError::not_found("rmdir(x)"))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn retry_busy_retries_ebusy() {
        let calls = AtomicU32::new(0);
        let result = retry_busy(4, 1, || {
            if calls.fetch_add(1, Ordering::Relaxed) < 2 {
                Err(RuntimeError::from_errno(nix::errno::Errno::EBUSY, "rmdir(x)"))
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn retry_busy_exhausts() {
        let calls = AtomicU32::new(0);
        let result: RuntimeResult<()> = retry_busy(3, 1, || {
            calls.fetch_add(1, Ordering::Relaxed);
            Err(RuntimeError::busy("rmdir(x)"))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn retry_failed_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = retry_failed(10, 1, || {
            if calls.fetch_add(1, Ordering::Relaxed) < 1 {
                Err(RuntimeError::transient("probe"))
            } else {
                Ok(42u32)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn pidfile_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warren.pid");
        let pidfile = Pidfile::new(path.to_string_lossy().to_string());
        pidfile.write().unwrap();
        assert_eq!(
            pidfile.read().unwrap(),
            Pid::from_raw(std::process::id() as i32)
        );
        pidfile.remove();
        assert!(!path.exists());
    }
}
