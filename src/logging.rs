//! Per-supervisor logging context
//!
//! Each supervisor owns a [`LogContext`] holding its verbosity and log file, so
//! several supervisors can run in one process without sharing global state.
//! Records are also forwarded to the `log` facade.

use chrono::Utc;
use env_logger::Env;
use log::{Level, LevelFilter};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Environment variable controlling log verbosity
pub const LOG_ENV: &str = "LOG";

/// File name of the supervisor log inside the log directory
pub const LOG_FILE_NAME: &str = "ipfs-daemon.log";

const LOG_TARGET: &str = "ipfsd_supervisor";

/// Install the global `env_logger` backend, honoring `LOG` (default `error`)
pub fn init_global() {
    let _ = env_logger::Builder::from_env(Env::default().filter_or(LOG_ENV, "error")).try_init();
}

/// Verbosity from `LOG`, `Error` when unset or unparsable
pub fn level_from_env() -> LevelFilter {
    std::env::var(LOG_ENV)
        .ok()
        .and_then(|value| parse_level(&value))
        .unwrap_or(LevelFilter::Error)
}

fn parse_level(value: &str) -> Option<LevelFilter> {
    value.trim().parse::<LevelFilter>().ok()
}

/// Logging context owned by one supervisor
pub struct LogContext {
    level: LevelFilter,
    path: PathBuf,
    file: Mutex<File>,
}

impl LogContext {
    /// Open `<dir>/ipfs-daemon.log` for appending, creating `dir` if needed
    pub fn open<P: AsRef<Path>>(dir: P, level: LevelFilter) -> io::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let path = dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            level,
            path,
            file: Mutex::new(file),
        })
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn enabled(&self, level: Level) -> bool {
        level <= self.level
    }

    /// Write a record to the log file and the `log` facade
    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }

        log::log!(target: LOG_TARGET, level, "{}", args);

        let line = format!("[{} {:<5}] {}\n", Utc::now().to_rfc3339(), level, args);
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(line.as_bytes());
        }
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args)
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args)
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args)
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args)
    }
}

impl fmt::Debug for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogContext")
            .field("level", &self.level)
            .field("path", &self.path)
            .finish()
    }
}
