//! Blacklisted content signatures

use crate::error::{Error, Result};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

use super::DigestAlgorithm;

/// Immutable set of blacklisted digests
///
/// Built once at startup; there is no way to add or remove entries
/// afterwards. Reloading means building a new set.
#[derive(Debug, Clone)]
pub struct SignatureSet {
    algorithm: DigestAlgorithm,
    digests: HashSet<String>,
}

impl SignatureSet {
    /// Build from already-split entries
    ///
    /// Entries are trimmed and lowercased. Anything that is not hex of the
    /// algorithm's length is skipped with a warning.
    pub fn new<I, S>(algorithm: DigestAlgorithm, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut digests = HashSet::new();

        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }

            let normalized = entry.to_ascii_lowercase();
            if normalized.len() != algorithm.hex_len() || hex::decode(&normalized).is_err() {
                warn!("Skipping malformed {} blacklist entry: {:?}", algorithm, entry);
                continue;
            }

            digests.insert(normalized);
        }

        SignatureSet { algorithm, digests }
    }

    /// Parse newline-separated blacklist content
    pub fn parse(algorithm: DigestAlgorithm, content: &str) -> Self {
        Self::new(algorithm, content.lines())
    }

    /// Load a blacklist file
    pub fn load<P: AsRef<Path>>(path: P, algorithm: DigestAlgorithm) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Blacklist(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let set = Self::parse(algorithm, &content);
        info!(
            "Loaded {} {} signatures from {}",
            set.len(),
            algorithm,
            path.display()
        );
        Ok(set)
    }

    /// Is this digest blacklisted?
    pub fn contains(&self, digest: &str) -> bool {
        if self.digests.contains(digest) {
            return true;
        }
        self.digests.contains(&digest.to_ascii_lowercase())
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}
