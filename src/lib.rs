//! hashguardfs - passthrough filesystem with a close-time blacklist gate
//!
//! Every operation is relayed to a lower directory tree. When a file handle
//! is released its content is digested and compared against a blacklist of
//! known-bad signatures; matching files are deleted and reported.

pub mod config;
pub mod error;
pub mod fs;
pub mod scan;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::fs::{GuardFs, OperationRelay};
    pub use crate::scan::{DigestAlgorithm, IncidentLog, ScanResult, SignatureSet};
}
