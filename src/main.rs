//! hashguardfs - passthrough filesystem with a close-time blacklist gate
//!
//! Usage:
//!   hashguardfs <root> <mountpoint>
//!
//! Every file closed through the mount is digested; files whose digest is
//! on the blacklist are deleted and reported.

use anyhow::Context;
use clap::error::ErrorKind;
use clap::Parser;
use hashguardfs::{
    config::{default_config_path, Config},
    fs::{GuardFs, OperationRelay},
    scan::{IncidentLog, SignatureSet},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "hashguardfs")]
#[command(author = "hashguardfs Contributors")]
#[command(version)]
#[command(about = "Passthrough filesystem that deletes blacklisted files on close")]
struct Cli {
    /// Directory to relay
    root: PathBuf,

    /// Where to mount it
    mount_point: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Blacklist file (overrides config and environment)
    #[arg(short, long)]
    blacklist: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,
}

fn usage(program: &str) -> String {
    format!("usage: {} <root> <mountpoint>", program)
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(_) => {
            let program = std::env::args().next().unwrap_or_else(|| "hashguardfs".into());
            println!("{}", usage(&program));
            std::process::exit(1);
        }
    };

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    if let Err(e) = run(cli) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => Config::load(&path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => Config::from_env()?,
        },
    };

    if let Some(blacklist) = &cli.blacklist {
        config.scan.blacklist_path = blacklist.clone();
    }
    if cli.allow_other {
        config.mount.allow_other = true;
    }

    Ok(config)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;

    let signatures = SignatureSet::load(&config.scan.blacklist_path, config.scan.digest)
        .context("loading blacklist")?;
    if signatures.is_empty() {
        warn!("Blacklist is empty; nothing will ever be purged");
    }

    let incidents = Arc::new(IncidentLog::new(config.scan.incident_capacity));
    let relay = OperationRelay::new(&cli.root, Arc::new(signatures), incidents)
        .with_context(|| format!("opening root {}", cli.root.display()))?;

    if config.scan.scan_on_mount {
        info!("Scanning {} before mounting...", relay.root().display());
        relay.scan_mount_root().context("initial scan of root")?;
    }

    let fs = GuardFs::new(relay, Duration::from_secs(config.mount.attr_ttl_secs));

    // Build mount options
    let mut options = vec![fuser::MountOption::FSName(config.mount.fsname.clone())];

    if config.mount.auto_unmount {
        options.push(fuser::MountOption::AutoUnmount);
    }
    if config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }

    info!("Mounting at {:?}", cli.mount_point);
    fuser::mount2(fs, &cli.mount_point, &options)
        .with_context(|| format!("mounting at {}", cli.mount_point.display()))?;

    info!("Unmounted {:?}", cli.mount_point);
    Ok(())
}
