//! In-memory controller and client used by the supervisor tests

use crate::api::{ApiClient, ApiError};
use crate::config::Config;
use crate::controller::{
    ControllerError, ControllerFactory, DaemonController, DaemonHandle, Endpoint, StartedDaemon,
};
use crate::host::{Fault, FaultReporter};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct Calls {
    locate: AtomicUsize,
    init: AtomicUsize,
    start: AtomicUsize,
    stop: AtomicUsize,
}

impl Calls {
    pub fn locate(&self) -> usize {
        self.locate.load(Ordering::SeqCst)
    }

    pub fn init(&self) -> usize {
        self.init.load(Ordering::SeqCst)
    }

    pub fn start(&self) -> usize {
        self.start.load(Ordering::SeqCst)
    }

    pub fn stop(&self) -> usize {
        self.stop.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Recorded {
    config: Option<Config>,
    data_dir_existed: Option<bool>,
    flags: Option<Vec<String>>,
    faults: Option<FaultReporter>,
}

#[derive(Clone)]
pub struct FakeFactory {
    pub calls: Arc<Calls>,
    recorded: Arc<Mutex<Recorded>>,
    api: Endpoint,
    gateway: Option<String>,
    locate_error: Option<String>,
    init_error: Option<String>,
    start_error: Option<String>,
    hold: Option<Arc<Notify>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Calls::default()),
            recorded: Arc::new(Mutex::new(Recorded::default())),
            api: Endpoint::new("127.0.0.1", 5001),
            gateway: None,
            locate_error: None,
            init_error: None,
            start_error: None,
            hold: None,
        }
    }

    pub fn with_api(mut self, host: &str, port: u16) -> Self {
        self.api = Endpoint::new(host, port);
        self
    }

    pub fn with_gateway(mut self, gateway: &str) -> Self {
        self.gateway = Some(gateway.to_string());
        self
    }

    pub fn fail_locate(mut self, message: &str) -> Self {
        self.locate_error = Some(message.to_string());
        self
    }

    pub fn fail_init(mut self, message: &str) -> Self {
        self.init_error = Some(message.to_string());
        self
    }

    pub fn fail_start(mut self, message: &str) -> Self {
        self.start_error = Some(message.to_string());
        self
    }

    /// Block in `start` until the startup task is aborted
    pub fn hold_start(mut self) -> Self {
        self.hold = Some(Arc::new(Notify::new()));
        self
    }

    pub fn located_config(&self) -> Option<Config> {
        self.recorded.lock().unwrap().config.clone()
    }

    pub fn data_dir_existed_at_locate(&self) -> Option<bool> {
        self.recorded.lock().unwrap().data_dir_existed
    }

    pub fn started_flags(&self) -> Option<Vec<String>> {
        self.recorded.lock().unwrap().flags.clone()
    }

    /// Report the daemon exit the way the process watcher would
    pub fn report_exit(&self, code: i32) {
        let recorded = self.recorded.lock().unwrap();
        let faults = recorded.faults.as_ref().unwrap();
        assert!(faults.report(Fault::process_exit("ipfs", code)));
    }
}

#[async_trait]
impl ControllerFactory for FakeFactory {
    async fn locate(&self, config: &Config) -> Result<Box<dyn DaemonController>, ControllerError> {
        self.calls.locate.fetch_add(1, Ordering::SeqCst);
        {
            let mut recorded = self.recorded.lock().unwrap();
            recorded.config = Some(config.clone());
            recorded.data_dir_existed = Some(config.ipfs_data_dir.is_dir());
        }

        if let Some(message) = &self.locate_error {
            return Err(ControllerError::Other(message.clone()));
        }
        Ok(Box::new(FakeController {
            factory: self.clone(),
        }))
    }
}

struct FakeController {
    factory: FakeFactory,
}

#[async_trait]
impl DaemonController for FakeController {
    async fn init(&mut self) -> Result<(), ControllerError> {
        self.factory.calls.init.fetch_add(1, Ordering::SeqCst);
        match &self.factory.init_error {
            Some(message) => Err(ControllerError::Other(message.clone())),
            None => Ok(()),
        }
    }

    async fn start(
        &mut self,
        flags: &[String],
        faults: FaultReporter,
    ) -> Result<StartedDaemon, ControllerError> {
        self.factory.calls.start.fetch_add(1, Ordering::SeqCst);
        {
            let mut recorded = self.factory.recorded.lock().unwrap();
            recorded.flags = Some(flags.to_vec());
            recorded.faults = Some(faults);
        }

        if let Some(hold) = &self.factory.hold {
            hold.notified().await;
        }
        if let Some(message) = &self.factory.start_error {
            return Err(ControllerError::Other(message.clone()));
        }

        Ok(StartedDaemon {
            api: self.factory.api.clone(),
            gateway: self.factory.gateway.clone(),
            handle: Box::new(FakeHandle {
                calls: Arc::clone(&self.factory.calls),
            }),
        })
    }
}

struct FakeHandle {
    calls: Arc<Calls>,
}

impl DaemonHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn request_stop(&mut self) -> Result<(), ControllerError> {
        self.calls.stop.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeClient {
    endpoint: Endpoint,
}

impl FakeClient {
    pub fn describe(&self) -> String {
        format!("fake client for {}", self.endpoint)
    }
}

impl ApiClient for FakeClient {
    fn connect(endpoint: &Endpoint) -> Result<Self, ApiError> {
        Ok(Self {
            endpoint: endpoint.clone(),
        })
    }
}
