use serde::{Deserialize, Serialize};
use std::fmt;

/// Error classification shared by every subsystem and carried over the
/// launcher's parent/child socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Unknown,
    InvalidValue,
    Busy,
    NoSpace,
    Permission,
    NotFound,
    Exists,
    SocketError,
    SocketTimeout,
    Transient,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidValue => "InvalidValue",
            ErrorKind::Busy => "Busy",
            ErrorKind::NoSpace => "NoSpace",
            ErrorKind::Permission => "Permission",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Exists => "Exists",
            ErrorKind::SocketError => "SocketError",
            ErrorKind::SocketTimeout => "SocketTimeout",
            ErrorKind::Transient => "Transient",
        };
        write!(f, "{}", name)
    }
}

/// Runtime error: a kind, an optional OS errno and a message formed as
/// `operation(args)`. No backtraces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub errno: Option<i32>,
    pub message: String,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        RuntimeError {
            kind,
            errno: None,
            message: message.into(),
        }
    }

    pub fn with_errno(kind: ErrorKind, errno: i32, message: impl Into<String>) -> Self {
        RuntimeError {
            kind,
            errno: Some(errno),
            message: message.into(),
        }
    }

    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidValue, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Exists, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, message)
    }

    pub fn no_space(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoSpace, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn socket(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SocketError, message)
    }

    pub fn socket_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SocketTimeout, message)
    }

    /// Map an OS error from a named operation into the taxonomy.
    pub fn from_errno(errno: nix::errno::Errno, operation: impl Into<String>) -> Self {
        let kind = match errno {
            nix::errno::Errno::EBUSY => ErrorKind::Busy,
            nix::errno::Errno::ENOSPC | nix::errno::Errno::EDQUOT => ErrorKind::NoSpace,
            nix::errno::Errno::EACCES | nix::errno::Errno::EPERM => ErrorKind::Permission,
            nix::errno::Errno::ENOENT | nix::errno::Errno::ESRCH | nix::errno::Errno::ENODEV => {
                ErrorKind::NotFound
            }
            nix::errno::Errno::EEXIST => ErrorKind::Exists,
            nix::errno::Errno::EINVAL => ErrorKind::InvalidValue,
            _ => ErrorKind::Unknown,
        };
        RuntimeError {
            kind,
            errno: Some(errno as i32),
            message: operation.into(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.kind == ErrorKind::Busy || self.errno == Some(nix::errno::Errno::EBUSY as i32)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errno {
            Some(errno) => write!(f, "{}: {} (errno {})", self.kind, self.message, errno),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<std::io::Error> for RuntimeError {
    fn from(e: std::io::Error) -> Self {
        let errno = e.raw_os_error();
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
            std::io::ErrorKind::AlreadyExists => ErrorKind::Exists,
            std::io::ErrorKind::TimedOut => ErrorKind::SocketTimeout,
            _ => ErrorKind::Unknown,
        };
        RuntimeError {
            kind,
            errno,
            message: e.to_string(),
        }
    }
}

impl From<nix::errno::Errno> for RuntimeError {
    fn from(e: nix::errno::Errno) -> Self {
        RuntimeError::from_errno(e, e.desc())
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_classification() {
        let err = RuntimeError::from_errno(nix::errno::Errno::EBUSY, "rmdir(/sys/fs/cgroup/x)");
        assert_eq!(err.kind, ErrorKind::Busy);
        assert!(err.is_busy());

        let err = RuntimeError::from_errno(nix::errno::Errno::ENOENT, "open(/proc/1/ns/net)");
        assert_eq!(err.kind, ErrorKind::NotFound);

        let err = RuntimeError::from_errno(nix::errno::Errno::EDQUOT, "write(file)");
        assert_eq!(err.kind, ErrorKind::NoSpace);
    }

    #[test]
    fn wire_round_trip() {
        let err = RuntimeError::with_errno(ErrorKind::Permission, 13, "mount(proc)");
        let json = serde_json::to_string(&err).unwrap();
        let back: RuntimeError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, ErrorKind::Permission);
        assert_eq!(back.errno, Some(13));
        assert_eq!(back.message, "mount(proc)");
    }

    #[test]
    fn display_includes_errno() {
        let err = RuntimeError::with_errno(ErrorKind::Busy, 16, "rmdir(x)");
        assert_eq!(err.to_string(), "Busy: rmdir(x) (errno 16)");
    }
}
