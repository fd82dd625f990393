//! Error types for hashguardfs
//!
//! Every variant maps onto an errno so the FUSE adapter can reply
//! with the code the lower filesystem produced.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Failure from a delegated std::fs primitive
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure from a delegated nix primitive
    #[error("system call failed: {0}")]
    Nix(#[from] nix::Error),

    /// Underlying access check denied the request
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// No open handle with this number
    #[error("bad file handle: {0}")]
    BadHandle(u64),

    /// The content scan at release could not read the file
    #[error("scan of {path:?} failed: {source}")]
    ScanFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Operation deliberately not implemented by the relay
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("blacklist error: {0}")]
    Blacklist(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// errno reported back through the bridge
    pub fn errno(&self) -> i32 {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Nix(e) => *e as i32,
            Error::PermissionDenied(_) => libc::EACCES,
            Error::BadHandle(_) => libc::EBADF,
            Error::ScanFailed { .. } => libc::EIO,
            Error::NotSupported(_) => libc::ENOSYS,
            Error::PathNotFound(_) => libc::ENOENT,
            Error::Blacklist(_) | Error::Config(_) | Error::InvalidConfig(_) => libc::EINVAL,
        }
    }
}
