//! Error types for cascache

use std::io;

use thiserror::Error;

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for cache operations
#[derive(Debug, Error)]
pub enum Error {
    /// Object, transaction file or transaction directory is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Write attempted while the cache is read-only or draining
    #[error("Cache is read-only")]
    ReadOnly,

    /// Operation on a closed or never valid descriptor
    #[error("Bad descriptor")]
    BadDescriptor,

    /// Cache root cannot host a cache
    #[error("Invalid cache root: {0}")]
    InvalidRoot(String),

    /// Malformed object identifier
    #[error("Invalid object id: {0}")]
    InvalidId(String),

    /// Malformed configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Any other I/O failure, surfaced verbatim
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl Error {
    /// Classify an OS error into the cache error taxonomy.
    pub fn from_io(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOENT) => Error::NotFound(err.to_string()),
            Some(libc::EBADF) => Error::BadDescriptor,
            Some(libc::EROFS) => Error::ReadOnly,
            _ if err.kind() == io::ErrorKind::NotFound => Error::NotFound(err.to_string()),
            _ => Error::Io(err),
        }
    }

    /// Capture `errno` of the last failed libc call.
    pub(crate) fn last_os_error() -> Self {
        Self::from_io(io::Error::last_os_error())
    }

    /// Negative errno equivalent, for callers speaking C-style status codes.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => -libc::ENOENT,
            Error::ReadOnly => -libc::EROFS,
            Error::BadDescriptor => -libc::EBADF,
            Error::InvalidRoot(_) | Error::InvalidId(_) | Error::Config(_) => -libc::EINVAL,
            Error::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::from_io(err)
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}
