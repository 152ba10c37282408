//! IPFS daemon supervisor
//!
//! This crate prepares an IPFS repository, starts the daemon against it and
//! hands out an HTTP API client once the daemon is ready. Shutdown is driven
//! by an explicit stop, a termination signal or an interrupt exit of the
//! daemon, and releases every listener the supervisor registered.

pub mod api;
pub mod config;
pub mod controller;
pub mod host;
pub mod logging;
pub mod supervisor;

pub use api::{ApiClient, ApiError, HttpApiClient};
pub use config::{Addresses, Config, ConfigError, ConfigOverlay};
pub use controller::{ControllerError, ControllerFactory, DaemonController, IpfsControllerFactory};
pub use host::Fault;
pub use supervisor::{
    ReadyDaemon, Supervisor, SupervisorBuilder, SupervisorError, SupervisorEvent, SupervisorState,
};
