//! Release-time scan-and-purge gate
//!
//! A handle moves `Open -> Closing -> Closed`. Entering `Closing` scans the
//! file behind the handle; a blacklisted file is unlinked and reported before
//! the descriptor is closed. The descriptor is closed on every path out of
//! `Closing`, including scan and unlink failures.
//!
//! Nothing is checked at open, write or flush time. A writer can keep
//! blacklisted content on disk for as long as it holds the handle.

use crate::error::{Error, Result};
use crate::fs::OpenHandle;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::{ContentScanner, IncidentKind, IncidentLog, ScanResult, SecurityIncident};

/// Lifecycle of an open handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Open,
    Closing,
    Closed,
}

/// What the gate did with a released file
#[derive(Debug)]
pub enum ReleaseOutcome {
    /// Not blacklisted, left untouched
    Clean,
    /// Blacklisted and removed
    Purged { digest: String },
    /// Blacklisted but the unlink failed
    PurgeFailed { digest: String, error: io::Error },
    /// Content could not be read
    ScanFailed(io::Error),
}

impl ReleaseOutcome {
    /// Map to the result reported through the bridge
    ///
    /// Scan failures are fail-closed: the caller sees an error instead of a
    /// silent success. Clean and purged outcomes pass through unchanged.
    pub fn into_result(self, path: &Path) -> Result<ReleaseOutcome> {
        match self {
            ReleaseOutcome::PurgeFailed { error, .. } => Err(Error::Io(error)),
            ReleaseOutcome::ScanFailed(source) => Err(Error::ScanFailed {
                path: path.to_path_buf(),
                source,
            }),
            other => Ok(other),
        }
    }
}

pub struct ReleaseGate {
    scanner: ContentScanner,
    incidents: Arc<IncidentLog>,
}

impl ReleaseGate {
    pub fn new(scanner: ContentScanner, incidents: Arc<IncidentLog>) -> Self {
        Self { scanner, incidents }
    }

    pub fn scanner(&self) -> &ContentScanner {
        &self.scanner
    }

    pub fn incidents(&self) -> &Arc<IncidentLog> {
        &self.incidents
    }

    /// Run the gate for a handle and close its descriptor
    pub fn release(&self, handle: &OpenHandle, concrete: &Path) -> Result<ReleaseOutcome> {
        handle.transition(GateState::Open, GateState::Closing)?;

        // Writers still holding the handle wait until the descriptor is gone
        let outcome = handle.close_after(|| self.inspect(&handle.path(), concrete));

        handle.transition(GateState::Closing, GateState::Closed)?;

        Ok(outcome)
    }

    /// Scan one file and purge it on a match
    pub fn inspect(&self, virtual_path: &Path, concrete: &Path) -> ReleaseOutcome {
        let digest = match self.scanner.scan_report(concrete, false) {
            Ok(report) if report.result() == ScanResult::Matched => report
                .matches
                .into_iter()
                .next()
                .map(|m| m.digest)
                .unwrap_or_default(),
            Ok(_) => {
                debug!("release scan clean: {}", virtual_path.display());
                return ReleaseOutcome::Clean;
            }
            Err(e) => {
                self.incidents.record(
                    SecurityIncident::new(IncidentKind::ScanFailed, virtual_path)
                        .with_detail(e.to_string()),
                );
                return ReleaseOutcome::ScanFailed(e);
            }
        };

        match std::fs::remove_file(concrete) {
            Ok(()) => {
                self.incidents.record(
                    SecurityIncident::new(IncidentKind::Purged, virtual_path)
                        .with_digest(digest.clone()),
                );
                ReleaseOutcome::Purged { digest }
            }
            Err(error) => {
                self.incidents.record(
                    SecurityIncident::new(IncidentKind::Detected, virtual_path)
                        .with_digest(digest.clone())
                        .with_detail(format!("unlink failed: {}", error)),
                );
                ReleaseOutcome::PurgeFailed { digest, error }
            }
        }
    }
}
