use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StackfsError>;

#[derive(Error, Debug)]
pub enum StackfsError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("IO error: {0}")]
    Io(io::Error),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl StackfsError {
    /// Map the error to the libc errno a kernel-facing caller would report.
    pub fn errno(&self) -> i32 {
        match self {
            StackfsError::NotFound(_) => libc::ENOENT,
            StackfsError::PermissionDenied(_) => libc::EACCES,
            StackfsError::InvalidState(_) | StackfsError::Config(_) | StackfsError::Json(_) => {
                libc::EINVAL
            }
            StackfsError::ResourceExhausted(_) => libc::ENOSPC,
            StackfsError::Io(e) => io_error_to_libc(e),
            StackfsError::Busy(_) => libc::EBUSY,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, StackfsError::Busy(_))
    }
}

impl From<io::Error> for StackfsError {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) if code == libc::ENOSPC || code == libc::ENOMEM || code == libc::EFBIG => {
                StackfsError::ResourceExhausted(err.to_string())
            }
            _ if err.kind() == io::ErrorKind::OutOfMemory => {
                StackfsError::ResourceExhausted(err.to_string())
            }
            _ => StackfsError::Io(err),
        }
    }
}

impl From<serde_json::Error> for StackfsError {
    fn from(err: serde_json::Error) -> Self {
        StackfsError::Json(err.to_string())
    }
}

/// Map std::io::Error to the closest libc error code.
pub(crate) fn io_error_to_libc(e: &io::Error) -> i32 {
    if let Some(code) = e.raw_os_error() {
        return code;
    }

    match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => libc::EINVAL,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::WriteZero => libc::ENOSPC,
        io::ErrorKind::OutOfMemory => libc::ENOMEM,
        io::ErrorKind::WouldBlock => libc::EAGAIN,
        io::ErrorKind::Unsupported => libc::ENOTSUP,
        _ => libc::EIO,
    }
}
