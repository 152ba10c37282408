//! Host process signals and fault notifications
//!
//! A [`HostSubscription`] listens for termination signals and for faults
//! reported by collaborators (for example the daemon exit watcher) and hands
//! them to a handler. It is returned at construction and disposed on shutdown,
//! so repeated supervisors never stack listeners.

use std::fmt;
use std::io;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Exit code of a process terminated by an interrupt (128 + SIGINT)
pub const INTERRUPT_EXIT_CODE: i32 = 130;

const PROCESS_EXIT_PATTERN: &str = "process exited with code ";

/// A runtime fault observed after construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    message: String,
}

impl Fault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Fault describing a child process exit
    pub fn process_exit(process: &str, code: i32) -> Self {
        Self::new(format!("{} process exited with code {}", process, code))
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the fault reports a process that exited because of an interrupt
    pub fn is_interrupt(&self) -> bool {
        self.message
            .match_indices(PROCESS_EXIT_PATTERN)
            .filter_map(|(at, pattern)| {
                let code: String = self.message[at + pattern.len()..]
                    .chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                code.parse::<i32>().ok()
            })
            .any(|code| code == INTERRUPT_EXIT_CODE)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Event delivered to the subscription handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// Termination signal, by name
    Signal(&'static str),
    /// Fault notification
    Fault(Fault),
}

impl HostEvent {
    /// Signals and interrupt faults shut the supervisor down; other faults are only logged
    pub fn triggers_shutdown(&self) -> bool {
        match self {
            HostEvent::Signal(_) => true,
            HostEvent::Fault(fault) => fault.is_interrupt(),
        }
    }
}

/// Sending half for fault notifications
#[derive(Debug, Clone)]
pub struct FaultReporter {
    tx: mpsc::UnboundedSender<Fault>,
}

impl FaultReporter {
    /// Report a fault. Returns false once the subscription has been disposed.
    pub fn report(&self, fault: Fault) -> bool {
        self.tx.send(fault).is_ok()
    }
}

/// Registered signal and fault listeners
pub struct HostSubscription {
    reporter: FaultReporter,
    task: Option<JoinHandle<()>>,
}

impl HostSubscription {
    /// Register listeners. Must be called from within a tokio runtime.
    ///
    /// With `listen_for_signals` false only fault notifications are delivered,
    /// which is what tests running many supervisors in one process want.
    pub fn register<F>(listen_for_signals: bool, handler: F) -> io::Result<Self>
    where
        F: Fn(HostEvent) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let signals = if listen_for_signals {
            Some(Signals::register()?)
        } else {
            None
        };

        let task = tokio::spawn(listen(signals, rx, handler));

        Ok(Self {
            reporter: FaultReporter { tx },
            task: Some(task),
        })
    }

    pub fn reporter(&self) -> FaultReporter {
        self.reporter.clone()
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Deregister the listeners. Safe to call more than once.
    pub fn dispose(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for HostSubscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for HostSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSubscription")
            .field("active", &self.is_active())
            .finish()
    }
}

async fn listen<F>(mut signals: Option<Signals>, mut faults: mpsc::UnboundedReceiver<Fault>, handler: F)
where
    F: Fn(HostEvent) + Send + Sync + 'static,
{
    loop {
        tokio::select! {
            name = next_signal(&mut signals) => {
                log::debug!("Received {}", name);
                handler(HostEvent::Signal(name));
            }
            fault = faults.recv() => match fault {
                Some(fault) => handler(HostEvent::Fault(fault)),
                None => break,
            },
        }
    }
}

async fn next_signal(signals: &mut Option<Signals>) -> &'static str {
    match signals {
        Some(signals) => signals.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn register() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            Some(()) = self.interrupt.recv() => "SIGINT",
            Some(()) = self.terminate.recv() => "SIGTERM",
            else => std::future::pending().await,
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn register() -> io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "CTRL_C",
            Err(_) => std::future::pending().await,
        }
    }
}
