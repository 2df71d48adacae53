use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Instant,
};

use log::Level;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{notify::NotifierSender, Config, Mode, Notifier, SyncError};
use crate::{
    chain::WriteChain,
    logging::{slicestore_log, LogContext},
};

/// Resource synchronised by a [`Syncer`].
pub trait SyncChain: Send + Sync + 'static {
    /// Write through the outermost layer.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Move buffered bytes into the OS page cache.
    fn flush(&self) -> io::Result<()>;

    /// Move buffered bytes to the physical disk.
    fn sync(&self) -> io::Result<()>;
}

impl SyncChain for WriteChain {
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        WriteChain::write(self, buf)
    }

    fn flush(&self) -> io::Result<()> {
        WriteChain::flush(self).map_err(io::Error::from)
    }

    fn sync(&self) -> io::Result<()> {
        WriteChain::sync(self).map_err(io::Error::from)
    }
}

/// Byte counters consulted by the size triggers.
pub trait StatisticsProvider: Send + Sync + 'static {
    /// Bytes measured before compression.
    fn uncompressed_size(&self) -> u64;

    /// Bytes measured after compression.
    fn compressed_size(&self) -> u64;
}

struct Snapshot {
    accepted_writes: u64,
    uncompressed_size: u64,
    compressed_size: u64,
    at: Instant,
}

struct Inner {
    config: Config,
    chain: Arc<dyn SyncChain>,
    statistics: Arc<dyn StatisticsProvider>,
    ctx: LogContext,
    accepted_writes: AtomicU64,
    snapshot: Mutex<Snapshot>,
    // One sync at a time.
    sync_lock: Arc<tokio::sync::Mutex<()>>,
    // Read-held during a chain write, write-held during the notifier swap.
    notifier: RwLock<NotifierSender>,
    stopped: AtomicBool,
}

/// Triggers chain flushes or syncs according to a [`Config`].
pub struct Syncer {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Syncer {
    /// Create the syncer and start its trigger loop on the current runtime.
    pub fn new(
        config: Config,
        chain: Arc<dyn SyncChain>,
        statistics: Arc<dyn StatisticsProvider>,
        ctx: LogContext,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let snapshot = Snapshot {
            accepted_writes: 0,
            uncompressed_size: statistics.uncompressed_size(),
            compressed_size: statistics.compressed_size(),
            at: Instant::now(),
        };
        let syncer = Self {
            inner: Arc::new(Inner {
                config,
                chain,
                statistics,
                ctx,
                accepted_writes: AtomicU64::new(0),
                snapshot: Mutex::new(snapshot),
                sync_lock: Arc::new(tokio::sync::Mutex::new(())),
                notifier: RwLock::new(NotifierSender::new()),
                stopped: AtomicBool::new(false),
            }),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };

        let config = &syncer.inner.config;
        if config.mode == Mode::Disabled {
            slicestore_log!(Level::Debug, ctx: syncer.inner.ctx, "sync_config", "sync is disabled");
        } else {
            slicestore_log!(
                Level::Debug,
                ctx: syncer.inner.ctx,
                "sync_config",
                "sync is enabled mode={} count={} uncompressed={} compressed={} interval={:?} check={:?}",
                config.mode,
                config.count_trigger,
                config.uncompressed_bytes_trigger,
                config.compressed_bytes_trigger,
                config.interval_trigger,
                config.check_interval
            );
            syncer.spawn_loop();
        }
        Ok(syncer)
    }

    /// The policy this syncer was built with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Write through the chain. The returned notifier resolves after the
    /// next sync; it is `None` when syncing or waiting is disabled.
    pub fn write(&self, buf: &[u8]) -> Result<(usize, Option<Notifier>), SyncError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(SyncError::Stopped);
        }
        let guard = self
            .inner
            .notifier
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let n = self.inner.chain.write(buf)?;
        self.inner.accepted_writes.fetch_add(1, Ordering::AcqRel);
        let notifier = self.wants_notifier().then(|| guard.notifier());
        Ok((n, notifier))
    }

    /// Notifier of the next sync, if waiting is enabled.
    pub fn notifier(&self) -> Option<Notifier> {
        if !self.wants_notifier() {
            return None;
        }
        Some(self.inner.current_notifier())
    }

    /// Start a sync. With `force`, waits for a running sync and then starts
    /// a new one; otherwise returns the running sync's notifier.
    pub async fn trigger_sync(&self, force: bool) -> Option<Notifier> {
        Inner::trigger_sync(&self.inner, &self.tracker, force).await
    }

    /// Stop the trigger loop and run one last sync.
    pub async fn stop(&self) -> Result<(), SyncError> {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return Err(SyncError::AlreadyStopped);
        }
        self.cancel.cancel();
        let result = match self.trigger_sync(true).await {
            Some(notifier) => notifier.wait().await,
            None => Ok(()),
        };
        self.tracker.close();
        self.tracker.wait().await;
        slicestore_log!(Level::Debug, ctx: self.inner.ctx, "sync_stop", "syncer stopped");
        result
    }

    fn wants_notifier(&self) -> bool {
        self.inner.config.mode != Mode::Disabled && self.inner.config.wait
    }

    fn spawn_loop(&self) {
        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();
        let tracker = self.tracker.clone();
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if inner.check_conditions() {
                            Inner::trigger_sync(&inner, &tracker, false).await;
                        }
                    }
                }
            }
        });
    }
}

impl Inner {
    fn current_notifier(&self) -> Notifier {
        self.notifier
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .notifier()
    }

    fn check_conditions(&self) -> bool {
        let snapshot = self
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = self
            .accepted_writes
            .load(Ordering::Acquire)
            .saturating_sub(snapshot.accepted_writes);
        if count == 0 {
            return false;
        }
        let config = &self.config;
        if config.count_trigger > 0 && count >= config.count_trigger {
            return true;
        }
        let uncompressed = self
            .statistics
            .uncompressed_size()
            .saturating_sub(snapshot.uncompressed_size);
        if config.uncompressed_bytes_trigger > 0 && uncompressed >= config.uncompressed_bytes_trigger
        {
            return true;
        }
        let compressed = self
            .statistics
            .compressed_size()
            .saturating_sub(snapshot.compressed_size);
        if config.compressed_bytes_trigger > 0 && compressed >= config.compressed_bytes_trigger {
            return true;
        }
        // A zero interval disables the time trigger.
        !config.interval_trigger.is_zero() && snapshot.at.elapsed() >= config.interval_trigger
    }

    async fn trigger_sync(
        inner: &Arc<Inner>,
        tracker: &TaskTracker,
        force: bool,
    ) -> Option<Notifier> {
        if inner.config.mode == Mode::Disabled {
            return None;
        }

        let guard = if force {
            Arc::clone(&inner.sync_lock).lock_owned().await
        } else {
            match Arc::clone(&inner.sync_lock).try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => return Some(inner.current_notifier()),
            }
        };

        {
            let mut snapshot = inner
                .snapshot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            snapshot.accepted_writes = inner.accepted_writes.load(Ordering::Acquire);
            snapshot.uncompressed_size = inner.statistics.uncompressed_size();
            snapshot.compressed_size = inner.statistics.compressed_size();
            snapshot.at = Instant::now();
        }

        // Writes that finished before the swap are covered by this sync.
        let sender = {
            let mut current = inner
                .notifier
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *current, NotifierSender::new())
        };
        let notifier = sender.notifier();

        let chain = Arc::clone(&inner.chain);
        let mode = inner.config.mode;
        let ctx = inner.ctx.clone();
        tracker.spawn(async move {
            slicestore_log!(Level::Trace, ctx: ctx, "sync_start", "starting sync to {}", mode);
            let op = tokio::task::spawn_blocking(move || match mode {
                Mode::Disk => chain.sync(),
                Mode::Cache => chain.flush(),
                Mode::Disabled => Ok(()),
            })
            .await;
            let result = match op {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(SyncError::Failed {
                    mode,
                    message: err.to_string(),
                }),
                Err(join) => Err(SyncError::Failed {
                    mode,
                    message: join.to_string(),
                }),
            };
            match &result {
                Ok(()) => {
                    slicestore_log!(Level::Trace, ctx: ctx, "sync_done", "sync to {} done", mode)
                }
                Err(err) => {
                    slicestore_log!(Level::Error, ctx: ctx, "sync_failed", "{}", err)
                }
            }
            drop(guard);
            sender.done(result);
        });

        Some(notifier)
    }
}
