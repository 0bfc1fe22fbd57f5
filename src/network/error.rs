use crate::error::{ErrorKind, RuntimeError};
use std::fmt;

/// Network-specific error carrying the underlying errno (when one exists)
/// and the route of the failed operation.
#[derive(Debug)]
pub enum NetworkError {
    /// rtnetlink operation failed
    Netlink { operation: String, source: rtnetlink::Error },
    /// Raw netlink message was rejected by the kernel
    Message { operation: String, errno: i32 },
    /// System I/O error
    Io(std::io::Error),
    /// Input validation failed
    Validation(String),
    /// Link, class or filter not found
    NotFound(String),
    /// Link already exists
    AlreadyExists(String),
    /// More than one candidate link where exactly one was expected
    Ambiguous(String),
}

impl NetworkError {
    pub fn netlink(operation: impl Into<String>, source: rtnetlink::Error) -> Self {
        NetworkError::Netlink {
            operation: operation.into(),
            source,
        }
    }

    pub fn message(operation: impl Into<String>, errno: i32) -> Self {
        NetworkError::Message {
            operation: operation.into(),
            errno,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, NetworkError::Message { errno, .. } if *errno == libc::EBUSY)
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Netlink { operation, source } => {
                write!(f, "{}: netlink error: {}", operation, source)
            }
            NetworkError::Message { operation, errno } => {
                write!(f, "{}: kernel refused message (errno {})", operation, errno)
            }
            NetworkError::Io(e) => write!(f, "io error: {}", e),
            NetworkError::Validation(msg) => write!(f, "validation error: {}", msg),
            NetworkError::NotFound(msg) => write!(f, "not found: {}", msg),
            NetworkError::AlreadyExists(msg) => write!(f, "already exists: {}", msg),
            NetworkError::Ambiguous(msg) => write!(f, "ambiguous: {}", msg),
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<std::io::Error> for NetworkError {
    fn from(e: std::io::Error) -> Self {
        NetworkError::Io(e)
    }
}

impl From<NetworkError> for RuntimeError {
    fn from(e: NetworkError) -> Self {
        let (kind, errno) = match &e {
            NetworkError::Message { errno, .. } if *errno == libc::EBUSY => {
                (ErrorKind::Busy, Some(*errno))
            }
            NetworkError::Message { errno, .. } if *errno == libc::EEXIST => {
                (ErrorKind::Exists, Some(*errno))
            }
            NetworkError::Message { errno, .. } if *errno == libc::ENOENT => {
                (ErrorKind::NotFound, Some(*errno))
            }
            NetworkError::Message { errno, .. } => (ErrorKind::Unknown, Some(*errno)),
            NetworkError::Io(io) => (ErrorKind::Unknown, io.raw_os_error()),
            NetworkError::Validation(_) | NetworkError::Ambiguous(_) => {
                (ErrorKind::InvalidValue, None)
            }
            NetworkError::NotFound(_) => (ErrorKind::NotFound, None),
            NetworkError::AlreadyExists(_) => (ErrorKind::Exists, None),
            NetworkError::Netlink { .. } => (ErrorKind::Unknown, None),
        };
        RuntimeError {
            kind,
            errno,
            message: e.to_string(),
        }
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;
