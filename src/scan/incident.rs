//! Security incident log
//!
//! Every incident is emitted as an `error!` event on the
//! `hashguardfs::security` target and kept in a bounded in-memory ring.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    /// Blacklisted file removed at release
    Purged,
    /// Blacklisted file seen but left in place
    Detected,
    /// Release-time scan could not read the file
    ScanFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityIncident {
    pub kind: IncidentKind,
    /// Path as seen through the mount
    pub path: PathBuf,
    pub digest: Option<String>,
    pub detail: Option<String>,
    pub detected_at: DateTime<Utc>,
}

impl SecurityIncident {
    pub fn new(kind: IncidentKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            digest: None,
            detail: None,
            detected_at: Utc::now(),
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Bounded record of security incidents
pub struct IncidentLog {
    capacity: usize,
    entries: Mutex<VecDeque<SecurityIncident>>,
}

impl IncidentLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Emit and retain an incident, dropping the oldest when full
    pub fn record(&self, incident: SecurityIncident) {
        error!(
            target: "hashguardfs::security",
            kind = ?incident.kind,
            path = %incident.path.display(),
            digest = incident.digest.as_deref().unwrap_or("-"),
            "SECURITY {:?}: {}{}",
            incident.kind,
            incident.path.display(),
            incident
                .detail
                .as_deref()
                .map(|d| format!(" ({})", d))
                .unwrap_or_default()
        );

        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(incident);
    }

    /// Copy of the retained incidents, oldest first
    pub fn snapshot(&self) -> Vec<SecurityIncident> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Was any incident of this kind recorded for `path`?
    pub fn contains(&self, kind: IncidentKind, path: &Path) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|i| i.kind == kind && i.path == path)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for IncidentLog {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_INCIDENT_CAPACITY)
    }
}
