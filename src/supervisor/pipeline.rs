//! Startup pipeline
//!
//! Locate controller → initialize repository → start daemon → bind API client.
//! Each phase starts only after the previous one succeeded. The pipeline owns
//! the event sender and publishes exactly one terminal event.

use super::{Shared, SupervisorError, SupervisorEvent, SupervisorState, GATEWAY_PATH_SUFFIX};
use crate::api::ApiClient;
use crate::config::Config;
use crate::controller::{ControllerError, ControllerFactory, StartedDaemon};
use crate::host::FaultReporter;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

pub(super) async fn run<A: ApiClient>(
    shared: Arc<Shared<A>>,
    factory: Arc<dyn ControllerFactory>,
    config: Config,
    faults: FaultReporter,
    events: watch::Sender<Option<SupervisorEvent>>,
) {
    let event = match startup(&shared, factory.as_ref(), &config, faults).await {
        Ok(()) => SupervisorEvent::Ready,
        Err(SupervisorError::Stopped) => {
            shared.log.info(format_args!("Startup abandoned: supervisor stopped"));
            return;
        }
        Err(err) => {
            shared.fail(&err);
            SupervisorEvent::Error(Arc::new(err))
        }
    };

    events.send_replace(Some(event));
}

async fn startup<A: ApiClient>(
    shared: &Shared<A>,
    factory: &dyn ControllerFactory,
    config: &Config,
    faults: FaultReporter,
) -> Result<(), SupervisorError> {
    shared.advance(SupervisorState::Initializing)?;

    shared.log.debug(format_args!(
        "Locating controller for {:?}",
        config.ipfs_data_dir
    ));
    let mut controller = factory
        .locate(config)
        .await
        .map_err(SupervisorError::ControllerInit)?;

    shared.log.info(format_args!(
        "Initializing repository at {:?}",
        config.ipfs_data_dir
    ));
    controller
        .init()
        .await
        .map_err(|err| classify_init_failure(err, &config.ipfs_data_dir))?;

    shared.advance(SupervisorState::Starting)?;

    shared.log.info(format_args!("Starting daemon with flags {:?}", config.flags));
    let StartedDaemon {
        api,
        gateway,
        mut handle,
    } = controller
        .start(&config.flags, faults)
        .await
        .map_err(SupervisorError::DaemonStart)?;

    let gateway_address = gateway.map(|base| format!("{}{}", base, GATEWAY_PATH_SUFFIX));

    let client = match A::connect(&api) {
        Ok(client) => client,
        Err(err) => {
            if let Err(stop_err) = handle.request_stop() {
                shared
                    .log
                    .warn(format_args!("Failed to stop daemon: {}", stop_err));
            }
            return Err(SupervisorError::ApiClient(err));
        }
    };

    shared.become_ready(controller, handle, api.to_string(), gateway_address, client)
}

/// Split repository init failures into migration-required and everything else
pub(super) fn classify_init_failure(err: ControllerError, data_dir: &Path) -> SupervisorError {
    if err.needs_migration() {
        SupervisorError::RepoMigrationRequired {
            data_dir: data_dir.to_path_buf(),
            remediation: migration_remediation(data_dir),
            source: err,
        }
    } else {
        SupervisorError::RepoInit(err)
    }
}

fn migration_remediation(data_dir: &Path) -> String {
    let dir = data_dir.display();
    format!(
        "ipfs repo needs migration: the repository at {dir} was created by a different version of ipfs.\n\
         To keep it, migrate it in place:\n\
         \n    IPFS_PATH={dir} ipfs daemon --migrate\n\
         \n\
         Or start from a fresh repository by setting IPFS_PATH (or IpfsDataDir) to another directory."
    )
}
