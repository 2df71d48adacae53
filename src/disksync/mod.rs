//! Durability policy for buffered writes.
//!
//! A [`Syncer`] sits in front of a write chain. Every write returns a
//! [`Notifier`] that resolves after the next physical sync covering it. Syncs
//! fire when any configured trigger is reached, checked on a periodic tick.

mod notify;
mod syncer;

use std::{fmt, io, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

pub use self::{
    notify::Notifier,
    syncer::{StatisticsProvider, SyncChain, Syncer},
};

/// What a sync does with buffered bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// No syncs; writes are acknowledged once they reach the chain.
    Disabled,
    /// Flush layers and fsync the file.
    #[default]
    Disk,
    /// Flush layers into the OS page cache.
    Cache,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Disabled => "disabled",
            Mode::Disk => "disk",
            Mode::Cache => "cache",
        })
    }
}

/// Sync triggers. The first one reached starts a sync.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// What a sync does.
    pub mode: Mode,
    /// Wait for the sync covering a write before reporting it written.
    pub wait: bool,
    /// How often triggers are checked.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub check_interval: Duration,
    /// Writes since the last sync; 0 disables the trigger.
    pub count_trigger: u64,
    /// Bytes accepted since the last sync; 0 disables the trigger.
    pub uncompressed_bytes_trigger: u64,
    /// Bytes that reached the compressed side since the last sync; 0 disables the trigger.
    pub compressed_bytes_trigger: u64,
    /// Time since the last sync; zero disables the trigger.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub interval_trigger: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Disk,
            wait: true,
            check_interval: Duration::from_millis(5),
            count_trigger: 10_000,
            uncompressed_bytes_trigger: 1024 * 1024,
            compressed_bytes_trigger: 256 * 1024,
            interval_trigger: Duration::from_millis(50),
        }
    }
}

impl Config {
    /// No syncs and no waiting.
    pub fn disabled() -> Self {
        Self {
            mode: Mode::Disabled,
            wait: false,
            ..Self::default()
        }
    }

    /// Replace the sync mode.
    pub fn with_mode(self, mode: Mode) -> Self {
        Self { mode, ..self }
    }

    /// Replace the wait flag.
    pub fn with_wait(self, wait: bool) -> Self {
        Self { wait, ..self }
    }

    /// Replace the check interval.
    pub fn with_check_interval(self, check_interval: Duration) -> Self {
        Self {
            check_interval,
            ..self
        }
    }

    /// Replace the count trigger.
    pub fn with_count_trigger(self, count_trigger: u64) -> Self {
        Self {
            count_trigger,
            ..self
        }
    }

    /// Replace the interval trigger.
    pub fn with_interval_trigger(self, interval_trigger: Duration) -> Self {
        Self {
            interval_trigger,
            ..self
        }
    }

    /// An enabled policy needs a positive check interval and at least one trigger.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.mode == Mode::Disabled {
            return Ok(());
        }
        if self.check_interval.is_zero() {
            return Err(SyncError::Invalid("check interval must be positive".into()));
        }
        if self.count_trigger == 0
            && self.uncompressed_bytes_trigger == 0
            && self.compressed_bytes_trigger == 0
            && self.interval_trigger.is_zero()
        {
            return Err(SyncError::Invalid("at least one trigger must be set".into()));
        }
        Ok(())
    }
}

/// Errors surfaced by the sync policy. Clonable so one sync result can be
/// delivered to every waiting writer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// The config failed validation.
    #[error("invalid sync config: {0}")]
    Invalid(String),
    /// `stop` was called twice.
    #[error("syncer is already stopped")]
    AlreadyStopped,
    /// A write or sync arrived after `stop`.
    #[error("syncer is stopped")]
    Stopped,
    /// The chain failed to flush or sync.
    #[error("sync to {mode} failed: {message}")]
    Failed {
        /// Mode of the failed sync.
        mode: Mode,
        /// Rendered chain error.
        message: String,
    },
    /// The syncer went away before reporting a result.
    #[error("sync notifier dropped before completion")]
    NotifierDropped,
    /// The chain rejected a write.
    #[error("write error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for SyncError {
    fn from(err: io::Error) -> Self {
        SyncError::Io(Arc::new(err))
    }
}
