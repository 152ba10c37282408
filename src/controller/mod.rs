//! Daemon controller
//!
//! The supervisor never talks to the daemon binary directly. It locates a
//! [`DaemonController`] through a [`ControllerFactory`], asks it to initialize
//! the repository, then to start the daemon, and keeps the returned
//! [`DaemonHandle`] so it can request a stop later.

pub mod addr;
pub mod ipfs;

use crate::config::Config;
use crate::host::FaultReporter;
use async_trait::async_trait;
use std::io;
use thiserror::Error;

pub use addr::{AddrError, Endpoint};
pub use ipfs::{IpfsController, IpfsControllerFactory};

/// Message fragment the daemon prints when the repository version does not match
pub const MIGRATION_REQUIRED_MESSAGE: &str = "ipfs repo needs migration";

/// Controller errors
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("daemon exited before it was ready ({status}): {output}")]
    Exited { status: String, output: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Addr(#[from] AddrError),

    #[error("failed to signal daemon pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl ControllerError {
    /// Whether the failure reports a repository that needs migrating
    pub fn needs_migration(&self) -> bool {
        self.to_string().contains(MIGRATION_REQUIRED_MESSAGE)
    }
}

/// What a successfully started daemon reports
pub struct StartedDaemon {
    /// API endpoint
    pub api: Endpoint,
    /// Gateway base address, if the daemon runs one
    pub gateway: Option<String>,
    /// Handle to the running process
    pub handle: Box<dyn DaemonHandle>,
}

/// Handle to a running daemon process
pub trait DaemonHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Ask the daemon to stop without waiting for it to exit
    fn request_stop(&mut self) -> Result<(), ControllerError>;
}

/// Locates a controller for a data directory
#[async_trait]
pub trait ControllerFactory: Send + Sync {
    /// Build a controller for `config.ipfs_data_dir`, with the full configuration
    async fn locate(&self, config: &Config) -> Result<Box<dyn DaemonController>, ControllerError>;
}

/// Drives one repository and its daemon
#[async_trait]
pub trait DaemonController: Send {
    /// Initialize (or open) the on-disk repository
    async fn init(&mut self) -> Result<(), ControllerError>;

    /// Start the daemon with `flags`. Exit of the process is reported to `faults`.
    async fn start(
        &mut self,
        flags: &[String],
        faults: FaultReporter,
    ) -> Result<StartedDaemon, ControllerError>;
}
