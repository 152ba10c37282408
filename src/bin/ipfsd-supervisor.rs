//! IPFS daemon supervisor binary
//!
//! Initializes the repository, starts the daemon and keeps it running until
//! SIGINT/SIGTERM or until the daemon exits on an interrupt.

use anyhow::{bail, Context, Result};
use clap::Parser;
use ipfsd_supervisor::logging;
use ipfsd_supervisor::{Config, ConfigOverlay, IpfsControllerFactory, Supervisor, SupervisorBuilder};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ipfsd-supervisor")]
#[command(about = "Run and supervise an IPFS daemon", long_about = None)]
struct Args {
    /// TOML file with configuration overrides
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Repository directory (defaults to $IPFS_PATH, then ./ipfs)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Directory for ipfs-daemon.log
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// API multiaddr (e.g., /ip4/127.0.0.1/tcp/5001)
    #[arg(long)]
    api: Option<String>,

    /// Gateway multiaddr (e.g., /ip4/0.0.0.0/tcp/8080)
    #[arg(long)]
    gateway: Option<String>,

    /// Swarm multiaddr, may be repeated
    #[arg(long)]
    swarm: Vec<String>,

    /// Daemon flag, may be repeated; replaces the default flags
    #[arg(long = "flag", allow_hyphen_values = true)]
    flags: Vec<String>,

    /// Path to the ipfs binary (defaults to $IPFS_EXEC, then ipfs)
    #[arg(long)]
    ipfs_bin: Option<PathBuf>,
}

impl Args {
    fn overlay(&self) -> Result<ConfigOverlay> {
        let mut overlay = match &self.config {
            Some(path) => ConfigOverlay::load(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => ConfigOverlay::default(),
        };

        if let Some(dir) = &self.data_dir {
            overlay = overlay.with_data_dir(dir);
        }
        if let Some(dir) = &self.log_dir {
            overlay = overlay.with_log_directory(dir);
        }

        if self.api.is_some() || self.gateway.is_some() || !self.swarm.is_empty() {
            let mut addresses = overlay
                .addresses
                .clone()
                .unwrap_or_else(|| Config::defaults().addresses);
            if let Some(api) = &self.api {
                addresses.api = Some(api.clone());
            }
            if let Some(gateway) = &self.gateway {
                addresses.gateway = Some(gateway.clone());
            }
            if !self.swarm.is_empty() {
                addresses.swarm = Some(self.swarm.clone());
            }
            overlay = overlay.with_addresses(addresses);
        }

        if !self.flags.is_empty() {
            overlay = overlay.with_flags(self.flags.iter().cloned());
        }

        Ok(overlay)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_global();

    let args = Args::parse();
    let overlay = args.overlay()?;

    let mut builder = SupervisorBuilder::new().overlay(overlay);
    if let Some(binary) = &args.ipfs_bin {
        builder = builder.controller(IpfsControllerFactory::new(binary));
    }
    let supervisor: Supervisor = builder.spawn()?;

    log::info!("Log file: {}", supervisor.log_path().display());

    match supervisor.ready().await {
        Ok(daemon) => {
            println!("API: {}", daemon.api_address());
            if let Some(gateway) = daemon.gateway_address() {
                println!("Gateway: {}", gateway);
            }
            match daemon.version().await {
                Ok(info) => println!("Version: {}", info.version),
                Err(e) => log::warn!("Failed to query daemon version: {}", e),
            }
        }
        Err(e) => bail!("{}", e),
    }

    supervisor.stopped().await;
    log::info!("Supervisor stopped");
    Ok(())
}
