//! Content signature scanning
//!
//! Files are identified by a digest of their full content and compared
//! against a blacklist loaded once at startup. The release gate runs the
//! scan whenever a handle is closed.

mod digest;
mod gate;
mod incident;
mod scanner;
mod signature;

pub use digest::{ContentHasher, DigestAlgorithm};
pub use gate::{GateState, ReleaseGate, ReleaseOutcome};
pub use incident::{IncidentKind, IncidentLog, SecurityIncident};
pub use scanner::{ContentScanner, ScanMatch, ScanReport, ScanResult, SCAN_CHUNK_SIZE};
pub use signature::SignatureSet;
