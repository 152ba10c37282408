//! Controller for the `ipfs` command line daemon
//!
//! Runs `ipfs init` and `ipfs config` against the configured repository, then
//! spawns `ipfs daemon` and reads its startup banner to learn where the API and
//! gateway are listening. A watcher task owns the child afterwards and reports
//! its exit as a fault.

use super::addr::Endpoint;
use super::{ControllerError, ControllerFactory, DaemonController, DaemonHandle, StartedDaemon};
use crate::config::{Config, DATA_DIR_ENV};
use crate::host::{Fault, FaultReporter};
use async_trait::async_trait;
use multiaddr::Multiaddr;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Environment variable naming the `ipfs` binary
pub const IPFS_EXEC_ENV: &str = "IPFS_EXEC";

const DEFAULT_BINARY: &str = "ipfs";

/// Name used in exit faults
const PROCESS_NAME: &str = "ipfs";

const LISTEN_MARKER: &str = "server listening on ";
const READY_LINE: &str = "Daemon is ready";

/// Lines of daemon stderr kept for error reports
const STDERR_TAIL: usize = 50;

/// Locates [`IpfsController`]s
#[derive(Debug, Clone)]
pub struct IpfsControllerFactory {
    binary: PathBuf,
}

impl IpfsControllerFactory {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Binary from `IPFS_EXEC`, falling back to `ipfs` on `PATH`
    pub fn from_env() -> Self {
        let binary = std::env::var_os(IPFS_EXEC_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BINARY));
        Self::new(binary)
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

impl Default for IpfsControllerFactory {
    fn default() -> Self {
        Self::from_env()
    }
}

#[async_trait]
impl ControllerFactory for IpfsControllerFactory {
    async fn locate(&self, config: &Config) -> Result<Box<dyn DaemonController>, ControllerError> {
        validate_config(config)?;

        let controller = IpfsController {
            binary: self.binary.clone(),
            config: config.clone(),
        };
        let version = controller.run(&["version"]).await?;
        log::info!("Located {} ({})", self.binary.display(), version.trim());

        Ok(Box::new(controller))
    }
}

fn validate_config(config: &Config) -> Result<(), ControllerError> {
    if config.ipfs_data_dir.as_os_str().is_empty() {
        return Err(ControllerError::InvalidConfig(
            "IpfsDataDir must not be empty".to_string(),
        ));
    }

    let api = config.addresses.api.as_deref().ok_or_else(|| {
        ControllerError::InvalidConfig("Addresses.API is required".to_string())
    })?;
    Endpoint::parse(api)?;

    let others = config
        .addresses
        .gateway
        .iter()
        .chain(config.addresses.swarm.iter().flatten());
    for addr in others {
        addr.parse::<Multiaddr>().map_err(|e| {
            ControllerError::InvalidConfig(format!("invalid address {:?}: {}", addr, e))
        })?;
    }

    Ok(())
}

/// Controller for one repository
pub struct IpfsController {
    binary: PathBuf,
    config: Config,
}

impl IpfsController {
    pub fn data_dir(&self) -> &Path {
        &self.config.ipfs_data_dir
    }

    /// Whether the repository already has a config file
    pub fn is_initialized(&self) -> bool {
        self.data_dir().join("config").exists()
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .env(DATA_DIR_ENV, self.data_dir())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.binary.display(), args.join(" "))
    }

    /// Run a one-shot command, returning its stdout
    async fn run(&self, args: &[&str]) -> Result<String, ControllerError> {
        let command = self.describe(args);
        log::debug!("Running {}", command);

        let output = self
            .command(args)
            .output()
            .await
            .map_err(|source| ControllerError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ControllerError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Write addresses and pass-through keys into the repository config
    async fn apply_config(&self) -> Result<(), ControllerError> {
        let addresses = serde_json::to_string(&self.config.addresses)
            .map_err(|e| ControllerError::InvalidConfig(e.to_string()))?;
        self.run(&["config", "--json", "Addresses", &addresses]).await?;

        for (key, value) in &self.config.extra {
            let value = value.to_string();
            self.run(&["config", "--json", key, &value]).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl DaemonController for IpfsController {
    async fn init(&mut self) -> Result<(), ControllerError> {
        if self.is_initialized() {
            log::info!("Using existing repository at {:?}", self.data_dir());
        } else {
            log::info!("Initializing repository at {:?}", self.data_dir());
            self.run(&["init"]).await?;
        }

        self.apply_config().await
    }

    async fn start(
        &mut self,
        flags: &[String],
        faults: FaultReporter,
    ) -> Result<StartedDaemon, ControllerError> {
        let mut args = vec!["daemon".to_string()];
        args.extend(flags.iter().cloned());
        let command = format!("{} {}", self.binary.display(), args.join(" "));
        log::info!("Starting {}", command);

        let mut child = self
            .command(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ControllerError::Spawn {
                command: command.clone(),
                source,
            })?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ControllerError::Other("daemon stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ControllerError::Other("daemon stderr was not captured".to_string()))?;
        let stderr_tail = drain_stderr(stderr);

        let mut stdout = BufReader::new(stdout);
        let mut banner = Banner::default();
        let mut transcript = Vec::new();

        loop {
            match read_line(&mut stdout).await {
                Ok(Some(line)) => {
                    log::debug!("ipfs: {}", line);
                    if banner.observe(&line) {
                        break;
                    }
                    transcript.push(line);
                }
                result => {
                    if let Err(e) = result {
                        log::warn!("Failed to read daemon output: {}", e);
                        let _ = child.start_kill();
                    }
                    let status = match child.wait().await {
                        Ok(status) => status.to_string(),
                        Err(e) => e.to_string(),
                    };
                    let stderr = stderr_tail.await.unwrap_or_default();
                    transcript.extend(stderr);
                    return Err(ControllerError::Exited {
                        status,
                        output: transcript.join("\n"),
                    });
                }
            }
        }

        let api = match banner.api {
            Some(addr) => Endpoint::parse(&addr)?,
            None => {
                let configured = self.config.addresses.api.as_deref().ok_or_else(|| {
                    ControllerError::InvalidConfig("Addresses.API is required".to_string())
                })?;
                Endpoint::parse(configured)?
            }
        };
        let gateway = match banner.gateway {
            Some(addr) => Some(gateway_base(&addr)?),
            None => None,
        };

        log::info!("Daemon ready (pid {:?}), API on {}", pid, api);

        tokio::spawn(drain_stdout(stdout));
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(watch_daemon(child, stop_rx, faults));

        Ok(StartedDaemon {
            api,
            gateway,
            handle: Box::new(IpfsDaemonHandle {
                pid,
                stop: Some(stop_tx),
            }),
        })
    }
}

/// Gateway base address, `host:port` with IPv6 hosts bracketed
fn gateway_base(addr: &str) -> Result<String, ControllerError> {
    Ok(Endpoint::parse(addr)?.authority())
}

/// Own the child until it exits. Only this task reaps it, so the pid is
/// signalled only while it still belongs to the daemon.
async fn watch_daemon(mut child: Child, mut stop: oneshot::Receiver<()>, faults: FaultReporter) {
    let mut stop_pending = true;
    loop {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => {
                        let code = exit_code(status);
                        log::info!("Daemon exited with code {}", code);
                        faults.report(Fault::process_exit(PROCESS_NAME, code));
                    }
                    Err(e) => log::warn!("Failed to wait for daemon: {}", e),
                }
                return;
            }
            requested = &mut stop, if stop_pending => {
                stop_pending = false;
                if requested.is_err() {
                    continue;
                }
                match (child.try_wait(), child.id()) {
                    (Ok(None), Some(pid)) => {
                        log::info!("Sending SIGTERM to daemon pid {}", pid);
                        if let Err(e) = send_terminate(pid) {
                            log::warn!("{}", e);
                        }
                    }
                    _ => log::debug!("Daemon already exited, not signalling"),
                }
            }
        }
    }
}

/// Listening addresses announced on the daemon's stdout
#[derive(Debug, Default)]
struct Banner {
    api: Option<String>,
    gateway: Option<String>,
}

impl Banner {
    /// Record a banner line. Returns true once the daemon reports ready.
    fn observe(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line == READY_LINE {
            return true;
        }

        if let Some((label, addr)) = line.split_once(LISTEN_MARKER) {
            let addr = addr.trim().to_string();
            if label.starts_with("Gateway") {
                self.gateway = Some(addr);
            } else if label.contains("API") {
                self.api = Some(addr);
            }
        }

        false
    }
}

/// Next line of output, decoded lossily. `None` at end of stream.
async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf).await? == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(&buf);
    Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
}

async fn drain_stdout<R>(mut stdout: R)
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match read_line(&mut stdout).await {
            Ok(Some(line)) => log::debug!("ipfs: {}", line),
            Ok(None) => return,
            Err(e) => {
                log::warn!("Failed to read daemon output: {}", e);
                return;
            }
        }
    }
}

fn drain_stderr<R>(stderr: R) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut stderr = BufReader::new(stderr);
        let mut tail = VecDeque::with_capacity(STDERR_TAIL);
        while let Ok(Some(line)) = read_line(&mut stderr).await {
            log::debug!("ipfs stderr: {}", line);
            if tail.len() == STDERR_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into_iter().collect()
    })
}

/// Exit code, with death by signal N reported as 128 + N
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}

/// Handle to a spawned `ipfs daemon`
struct IpfsDaemonHandle {
    pid: Option<u32>,
    stop: Option<oneshot::Sender<()>>,
}

impl DaemonHandle for IpfsDaemonHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the watcher to terminate the daemon. A daemon that already exited
    /// is left alone.
    fn request_stop(&mut self) -> Result<(), ControllerError> {
        if let Some(stop) = self.stop.take() {
            if stop.send(()).is_err() {
                log::debug!("Daemon watcher already finished");
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> Result<(), ControllerError> {
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret != 0 {
        return Err(ControllerError::Signal {
            pid,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_terminate(pid: u32) -> Result<(), ControllerError> {
    Err(ControllerError::Signal {
        pid,
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "stopping the daemon is only supported on unix",
        ),
    })
}
