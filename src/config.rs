//! Configuration management for hashguardfs

use crate::error::{Error, Result};
use crate::scan::DigestAlgorithm;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the blacklist shipped alongside the binary
pub const DEFAULT_BLACKLIST_NAME: &str = "black_list";

/// Default number of incidents kept in memory
pub const DEFAULT_INCIDENT_CAPACITY: usize = 1024;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Signature scanning configuration
    pub scan: ScanConfig,

    /// Mount configuration
    pub mount: MountConfig,
}

/// Signature scanning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Newline-separated list of blacklisted digests
    pub blacklist_path: PathBuf,

    /// Digest used for both the blacklist and file content
    pub digest: DigestAlgorithm,

    /// Walk the whole lower tree once before mounting
    pub scan_on_mount: bool,

    /// Maximum incidents retained by the in-memory log
    pub incident_capacity: usize,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Filesystem name shown in the mount table
    pub fsname: String,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Unmount automatically when the process exits
    pub auto_unmount: bool,

    /// Kernel attribute/entry cache TTL
    pub attr_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            scan: ScanConfig::default(),
            mount: MountConfig::default(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            blacklist_path: default_blacklist_path(),
            digest: DigestAlgorithm::Sha1,
            scan_on_mount: true,
            incident_capacity: DEFAULT_INCIDENT_CAPACITY,
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            fsname: "hashguardfs".to_string(),
            allow_other: false,
            auto_unmount: true,
            attr_ttl_secs: 1,
        }
    }
}

/// `black_list` next to the running executable
pub fn default_blacklist_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_BLACKLIST_NAME)))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BLACKLIST_NAME))
}

/// Per-user config location, used when no `--config` is given
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("hashguardfs").join("config.json"))
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for runs without a config file
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("HASHGUARDFS_BLACKLIST") {
            let path = path.trim();
            if !path.is_empty() {
                self.scan.blacklist_path = PathBuf::from(path);
            }
        }

        if let Ok(digest) = std::env::var("HASHGUARDFS_DIGEST") {
            if let Ok(algorithm) = digest.trim().parse::<DigestAlgorithm>() {
                self.scan.digest = algorithm;
            }
        }

        if let Ok(flag) = std::env::var("HASHGUARDFS_SCAN_ON_MOUNT") {
            if let Some(value) = parse_bool(&flag) {
                self.scan.scan_on_mount = value;
            }
        }

        if let Ok(flag) = std::env::var("HASHGUARDFS_ALLOW_OTHER") {
            if let Some(value) = parse_bool(&flag) {
                self.mount.allow_other = value;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.scan.blacklist_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "Blacklist path must not be empty".to_string(),
            ));
        }

        if self.scan.incident_capacity == 0 {
            return Err(Error::InvalidConfig(
                "Incident capacity must be greater than 0".to_string(),
            ));
        }

        if self.mount.fsname.is_empty() {
            return Err(Error::InvalidConfig(
                "Filesystem name must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
