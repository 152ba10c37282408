//! Daemon supervisor
//!
//! [`Supervisor`] merges the configuration, prepares the data directory, and
//! runs the startup pipeline in the background. Once the daemon is up,
//! [`Supervisor::ready`] hands out a [`ReadyDaemon`] which dereferences to the
//! API client, so API calls read as calls on the supervisor itself.
//!
//! Shutdown comes from [`Supervisor::stop`], a termination signal, or an
//! interrupt fault from the daemon, and always takes the same path.

mod pipeline;

use crate::api::{ApiClient, ApiError, HttpApiClient};
use crate::config::{Config, ConfigError, ConfigOverlay};
use crate::controller::{
    ControllerError, ControllerFactory, DaemonController, DaemonHandle, IpfsControllerFactory,
};
use crate::host::{Fault, FaultReporter, HostEvent, HostSubscription};
use crate::logging::{self, LogContext};
use log::LevelFilter;
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Path appended to the gateway base address
pub const GATEWAY_PATH_SUFFIX: &str = "/ipfs/";

/// Supervisor errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to prepare {path:?}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to register signal handlers: {0}")]
    Signal(#[source] std::io::Error),

    #[error(transparent)]
    ControllerInit(ControllerError),

    #[error("{remediation}")]
    RepoMigrationRequired {
        data_dir: PathBuf,
        remediation: String,
        #[source]
        source: ControllerError,
    },

    #[error(transparent)]
    RepoInit(ControllerError),

    #[error(transparent)]
    DaemonStart(ControllerError),

    #[error("failed to construct API client: {0}")]
    ApiClient(#[source] ApiError),

    #[error("supervisor stopped before the daemon became ready")]
    Stopped,
}

impl SupervisorError {
    pub fn is_migration_required(&self) -> bool {
        matches!(self, SupervisorError::RepoMigrationRequired { .. })
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Unstarted,
    Initializing,
    Starting,
    Ready,
    ShuttingDown,
    Stopped,
    Failed,
}

impl SupervisorState {
    /// No transition leads out of a terminal state except `Failed` → `Stopped`
    pub fn is_terminal(self) -> bool {
        matches!(self, SupervisorState::Stopped | SupervisorState::Failed)
    }

    fn is_shutting_down(self) -> bool {
        matches!(self, SupervisorState::ShuttingDown | SupervisorState::Stopped)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Unstarted => "unstarted",
            SupervisorState::Initializing => "initializing",
            SupervisorState::Starting => "starting",
            SupervisorState::Ready => "ready",
            SupervisorState::ShuttingDown => "shutting down",
            SupervisorState::Stopped => "stopped",
            SupervisorState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Terminal outcome of the startup pipeline
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Ready,
    Error(Arc<SupervisorError>),
}

struct Inner<A> {
    state: SupervisorState,
    config: Option<Config>,
    controller: Option<Box<dyn DaemonController>>,
    daemon: Option<Box<dyn DaemonHandle>>,
    gateway_address: Option<String>,
    api_address: Option<String>,
    client: Option<Arc<A>>,
    subscription: Option<HostSubscription>,
    startup: Option<JoinHandle<()>>,
    faults: Vec<Fault>,
}

/// State shared between the supervisor, its pipeline and its host subscription
pub(crate) struct Shared<A> {
    inner: Mutex<Inner<A>>,
    state_tx: watch::Sender<SupervisorState>,
    log: LogContext,
}

impl<A: ApiClient> Shared<A> {
    fn lock(&self) -> MutexGuard<'_, Inner<A>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut Inner<A>, state: SupervisorState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Move to the next startup phase unless shutdown already happened
    fn advance(&self, next: SupervisorState) -> Result<(), SupervisorError> {
        let mut inner = self.lock();
        if inner.state.is_shutting_down() {
            return Err(SupervisorError::Stopped);
        }
        self.set_state(&mut inner, next);
        Ok(())
    }

    fn become_ready(
        &self,
        controller: Box<dyn DaemonController>,
        mut daemon: Box<dyn DaemonHandle>,
        api_address: String,
        gateway_address: Option<String>,
        client: A,
    ) -> Result<(), SupervisorError> {
        let mut inner = self.lock();
        if inner.state.is_shutting_down() {
            drop(inner);
            // Shutdown ran while the daemon was starting.
            if let Err(err) = daemon.request_stop() {
                self.log.warn(format_args!("Failed to stop daemon: {}", err));
            }
            return Err(SupervisorError::Stopped);
        }

        inner.controller = Some(controller);
        inner.daemon = Some(daemon);
        inner.api_address = Some(api_address.clone());
        inner.gateway_address = gateway_address.clone();
        inner.client = Some(Arc::new(client));
        self.set_state(&mut inner, SupervisorState::Ready);
        drop(inner);

        self.log.info(format_args!(
            "Daemon ready, API at {}, gateway at {}",
            api_address,
            gateway_address.as_deref().unwrap_or("(none)")
        ));
        Ok(())
    }

    fn fail(&self, err: &SupervisorError) {
        self.log.error(format_args!("Startup failed: {}", err));
        let mut inner = self.lock();
        if !inner.state.is_shutting_down() {
            self.set_state(&mut inner, SupervisorState::Failed);
        }
    }

    fn on_host_event(&self, event: HostEvent) {
        if event.triggers_shutdown() {
            match &event {
                HostEvent::Signal(name) => self.log.info(format_args!("{} received", name)),
                HostEvent::Fault(fault) => self.log.info(format_args!("{}", fault)),
            }
            self.shutdown();
        } else if let HostEvent::Fault(fault) = event {
            self.log.warn(format_args!("Unhandled fault: {}", fault));
            self.lock().faults.push(fault);
        }
    }

    /// Best-effort teardown. Later calls see `Stopped` and do nothing.
    fn shutdown(&self) {
        let (daemon, subscription, startup) = {
            let mut inner = self.lock();
            if inner.state.is_shutting_down() {
                return;
            }
            self.set_state(&mut inner, SupervisorState::ShuttingDown);
            (
                inner.daemon.take(),
                inner.subscription.take(),
                inner.startup.take(),
            )
        };

        self.log.info(format_args!("Shutting down"));
        if let Some(mut daemon) = daemon {
            if let Err(err) = daemon.request_stop() {
                self.log.warn(format_args!("Failed to stop daemon: {}", err));
            }
        }

        {
            let mut inner = self.lock();
            inner.gateway_address = None;
            inner.api_address = None;
            inner.config = None;
            inner.controller = None;
            inner.client = None;
            self.set_state(&mut inner, SupervisorState::Stopped);
        }

        if let Some(startup) = startup {
            if !startup.is_finished() {
                startup.abort();
            }
        }
        if let Some(mut subscription) = subscription {
            subscription.dispose();
        }
    }
}

/// Builder for [`Supervisor`]
pub struct SupervisorBuilder {
    overlay: ConfigOverlay,
    defaults: Option<Config>,
    controller: Arc<dyn ControllerFactory>,
    handle_signals: bool,
    log_level: Option<LevelFilter>,
}

impl SupervisorBuilder {
    pub fn new() -> Self {
        Self {
            overlay: ConfigOverlay::default(),
            defaults: None,
            controller: Arc::new(IpfsControllerFactory::from_env()),
            handle_signals: true,
            log_level: None,
        }
    }

    pub fn overlay(mut self, overlay: ConfigOverlay) -> Self {
        self.overlay = overlay;
        self
    }

    /// Replace the built-in defaults the overlay is laid over
    pub fn defaults(mut self, defaults: Config) -> Self {
        self.defaults = Some(defaults);
        self
    }

    pub fn controller<F: ControllerFactory + 'static>(mut self, factory: F) -> Self {
        self.controller = Arc::new(factory);
        self
    }

    /// Listen for SIGINT/SIGTERM (default true)
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Log verbosity; defaults to `LOG` from the environment
    pub fn log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = Some(level);
        self
    }

    /// Prepare directories and begin the startup pipeline.
    ///
    /// Must be called from within a tokio runtime. Returns as soon as the
    /// pipeline is spawned; its outcome arrives through [`Supervisor::ready`].
    pub fn spawn<A: ApiClient>(self) -> Result<Supervisor<A>, SupervisorError> {
        self.overlay.validate()?;
        let config = self
            .defaults
            .unwrap_or_else(Config::defaults)
            .overlay(self.overlay);

        std::fs::create_dir_all(&config.ipfs_data_dir).map_err(|source| {
            SupervisorError::Filesystem {
                path: config.ipfs_data_dir.clone(),
                source,
            }
        })?;

        let level = self.log_level.unwrap_or_else(logging::level_from_env);
        let log = LogContext::open(&config.log_directory, level).map_err(|source| {
            SupervisorError::Filesystem {
                path: config.log_directory.clone(),
                source,
            }
        })?;
        let log_path = log.path().to_path_buf();

        let (state_tx, state_rx) = watch::channel(SupervisorState::Unstarted);
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: SupervisorState::Unstarted,
                config: Some(config.clone()),
                controller: None,
                daemon: None,
                gateway_address: None,
                api_address: None,
                client: None,
                subscription: None,
                startup: None,
                faults: Vec::new(),
            }),
            state_tx,
            log,
        });

        let weak: Weak<Shared<A>> = Arc::downgrade(&shared);
        let subscription = HostSubscription::register(self.handle_signals, move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.on_host_event(event);
            }
        })
        .map_err(SupervisorError::Signal)?;
        let faults = subscription.reporter();
        shared.lock().subscription = Some(subscription);

        shared.log.info(format_args!(
            "Supervising repository {:?}",
            config.ipfs_data_dir
        ));
        match config.to_json() {
            Ok(json) => shared.log.debug(format_args!("Effective configuration: {}", json)),
            Err(err) => shared
                .log
                .warn(format_args!("Failed to render configuration: {}", err)),
        }

        let (events_tx, events_rx) = watch::channel(None);
        let startup = tokio::spawn(pipeline::run(
            Arc::clone(&shared),
            self.controller,
            config,
            faults,
            events_tx,
        ));
        {
            let mut inner = shared.lock();
            if inner.state.is_shutting_down() {
                startup.abort();
            } else {
                inner.startup = Some(startup);
            }
        }

        Ok(Supervisor {
            shared,
            events: events_rx,
            state: state_rx,
            log_path,
        })
    }
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Supervises one daemon
pub struct Supervisor<A: ApiClient = HttpApiClient> {
    shared: Arc<Shared<A>>,
    events: watch::Receiver<Option<SupervisorEvent>>,
    state: watch::Receiver<SupervisorState>,
    log_path: PathBuf,
}

impl Supervisor<HttpApiClient> {
    /// Supervise the `ipfs` binary with the given overrides
    pub fn spawn(overlay: ConfigOverlay) -> Result<Self, SupervisorError> {
        SupervisorBuilder::new().overlay(overlay).spawn()
    }
}

impl<A: ApiClient> Supervisor<A> {
    pub fn builder() -> SupervisorBuilder {
        SupervisorBuilder::new()
    }

    pub fn state(&self) -> SupervisorState {
        self.shared.lock().state
    }

    /// Effective configuration, cleared on shutdown
    pub fn config(&self) -> Option<Config> {
        self.shared.lock().config.clone()
    }

    /// `host:port` of the daemon API
    pub fn api_address(&self) -> Option<String> {
        self.shared.lock().api_address.clone()
    }

    /// Gateway address with the `/ipfs/` suffix, if the daemon runs a gateway
    pub fn gateway_address(&self) -> Option<String> {
        self.shared.lock().gateway_address.clone()
    }

    pub fn client(&self) -> Option<Arc<A>> {
        self.shared.lock().client.clone()
    }

    pub fn daemon_pid(&self) -> Option<u32> {
        self.shared.lock().daemon.as_ref().and_then(|d| d.pid())
    }

    /// Faults that were logged without triggering shutdown
    pub fn recorded_faults(&self) -> Vec<Fault> {
        self.shared.lock().faults.clone()
    }

    /// Reporter for host-side faults; `None` after shutdown
    pub fn fault_reporter(&self) -> Option<FaultReporter> {
        self.shared
            .lock()
            .subscription
            .as_ref()
            .map(HostSubscription::reporter)
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Wait for the terminal startup event
    pub async fn terminal_event(&self) -> SupervisorEvent {
        let mut events = self.events.clone();
        let event = match events.wait_for(Option::is_some).await {
            Ok(event) => (*event).clone(),
            Err(_) => None,
        };
        event.unwrap_or_else(|| SupervisorEvent::Error(Arc::new(SupervisorError::Stopped)))
    }

    /// Wait for the daemon to become ready
    pub async fn ready(&self) -> Result<ReadyDaemon<'_, A>, Arc<SupervisorError>> {
        if let SupervisorEvent::Error(err) = self.terminal_event().await {
            return Err(err);
        }

        let inner = self.shared.lock();
        match (&inner.client, &inner.api_address) {
            (Some(client), Some(api_address)) => Ok(ReadyDaemon {
                supervisor: self,
                client: Arc::clone(client),
                api_address: api_address.clone(),
                gateway_address: inner.gateway_address.clone(),
            }),
            _ => Err(Arc::new(SupervisorError::Stopped)),
        }
    }

    /// Wait until shutdown has completed
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        let _ = state
            .wait_for(|state| *state == SupervisorState::Stopped)
            .await;
    }

    /// Stop the daemon and release everything acquired at construction
    pub fn stop(&self) {
        self.shared.shutdown();
    }
}

impl<A: ApiClient> Drop for Supervisor<A> {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl<A: ApiClient> fmt::Debug for Supervisor<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.state())
            .field("api_address", &self.api_address())
            .field("gateway_address", &self.gateway_address())
            .finish()
    }
}

/// A supervisor whose daemon is up; dereferences to the API client
pub struct ReadyDaemon<'a, A: ApiClient> {
    supervisor: &'a Supervisor<A>,
    client: Arc<A>,
    api_address: String,
    gateway_address: Option<String>,
}

impl<A: ApiClient> ReadyDaemon<'_, A> {
    pub fn api_address(&self) -> &str {
        &self.api_address
    }

    pub fn gateway_address(&self) -> Option<&str> {
        self.gateway_address.as_deref()
    }

    pub fn stop(&self) {
        self.supervisor.stop();
    }
}

impl<A: ApiClient> Deref for ReadyDaemon<'_, A> {
    type Target = A;

    fn deref(&self) -> &A {
        &self.client
    }
}

#[cfg(test)]
mod testing;
