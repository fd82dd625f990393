//! Streaming content scanner
//!
//! Files are read in fixed-size chunks so memory use stays flat no
//! matter how large the scanned file is.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use super::SignatureSet;

/// Read size while digesting a file
pub const SCAN_CHUNK_SIZE: usize = 64 * 1024;

/// Outcome of a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanResult {
    Matched,
    Clean,
}

impl ScanResult {
    pub fn is_match(&self) -> bool {
        *self == ScanResult::Matched
    }
}

/// A blacklisted file found by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanMatch {
    pub path: PathBuf,
    pub digest: String,
}

/// Everything a scan saw
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Blacklisted files, depth-first order
    pub matches: Vec<ScanMatch>,
    /// Regular files digested
    pub files_scanned: u64,
    /// Descendants skipped because they could not be read (recursive only)
    pub unreadable: Vec<PathBuf>,
}

impl ScanReport {
    pub fn result(&self) -> ScanResult {
        if self.matches.is_empty() {
            ScanResult::Clean
        } else {
            ScanResult::Matched
        }
    }
}

/// Digests file content and checks it against the blacklist
#[derive(Clone)]
pub struct ContentScanner {
    signatures: Arc<SignatureSet>,
}

impl ContentScanner {
    pub fn new(signatures: Arc<SignatureSet>) -> Self {
        Self { signatures }
    }

    pub fn signatures(&self) -> &SignatureSet {
        &self.signatures
    }

    /// Digest everything a reader yields
    pub fn digest_reader<R: Read>(&self, mut reader: R) -> io::Result<String> {
        let mut hasher = self.signatures.algorithm().hasher();
        let mut buffer = vec![0u8; SCAN_CHUNK_SIZE];

        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => hasher.update(&buffer[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(hasher.finalize_hex())
    }

    /// Digest a file on disk
    pub fn digest_file(&self, path: &Path) -> io::Result<String> {
        let file = File::open(path)?;
        self.digest_reader(file)
    }

    /// Scan a file, or with `recursive` a whole tree
    pub fn scan(&self, path: &Path, recursive: bool) -> io::Result<ScanResult> {
        Ok(self.scan_report(path, recursive)?.result())
    }

    /// Scan and report every match
    ///
    /// In single-file mode any read failure is returned. In recursive mode
    /// failures below the starting point are collected in
    /// [`ScanReport::unreadable`] and the walk continues. Symlinks are never
    /// followed below the starting point.
    pub fn scan_report(&self, path: &Path, recursive: bool) -> io::Result<ScanReport> {
        let mut report = ScanReport::default();
        let meta = fs::metadata(path)?;

        if meta.is_dir() {
            if recursive {
                self.walk_dir(path, &mut report)?;
            }
        } else if meta.is_file() {
            self.check_file(path, &mut report)?;
        }

        Ok(report)
    }

    fn check_file(&self, path: &Path, report: &mut ScanReport) -> io::Result<()> {
        let digest = self.digest_file(path)?;
        report.files_scanned += 1;
        debug!("digest {}: {}", path.display(), digest);

        if self.signatures.contains(&digest) {
            report.matches.push(ScanMatch {
                path: path.to_path_buf(),
                digest,
            });
        }
        Ok(())
    }

    fn walk_dir(&self, dir: &Path, report: &mut ScanReport) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            let file_type = match entry.file_type() {
                Ok(ft) => ft,
                Err(e) => {
                    warn!("Cannot stat {} during scan: {}", path.display(), e);
                    report.unreadable.push(path);
                    continue;
                }
            };

            let outcome = if file_type.is_dir() {
                self.walk_dir(&path, report)
            } else if file_type.is_file() {
                self.check_file(&path, report)
            } else {
                Ok(())
            };

            if let Err(e) = outcome {
                warn!("Cannot scan {}: {}", path.display(), e);
                report.unreadable.push(path);
            }
        }
        Ok(())
    }
}
