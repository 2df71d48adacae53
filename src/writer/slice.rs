use std::{
    error::Error as StdError,
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use log::Level;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{FileOpener, VolumeConfig, WriterError, WriterKey};
use crate::{
    chain::{SliceFile, WriteChain},
    compression,
    diskalloc::Allocator,
    disksync::{StatisticsProvider, SyncChain, Syncer},
    encoding::{csv, BackupCounter, BufferLayer, SizeMeter, SliceCounters, Statistics},
    error::MultiError,
    events::Events,
    inflight::InFlight,
    logging::{slicestore_log, LogContext},
    model::{Slice, SliceKey},
};

/// Writes one slice file on one volume.
///
/// The write chain is, outermost first: uncompressed size meter, input
/// buffer, compression, compressed size meter, file buffer, file. Layers
/// that are not configured are skipped.
pub struct SliceWriter {
    key: WriterKey,
    slice: Slice,
    file_path: PathBuf,
    chain: Arc<WriteChain>,
    syncer: Arc<Syncer>,
    counters: SliceCounters,
    events: Events<SliceWriter>,
    // Writes inside the chain.
    writing: InFlight,
    // Writes not yet acknowledged to the caller.
    completing: InFlight,
    closed: AtomicBool,
    cancel: CancellationToken,
    tracker: TaskTracker,
    ctx: LogContext,
}

pub(crate) struct OpenParams<'a> {
    pub(crate) key: WriterKey,
    pub(crate) slice: Slice,
    pub(crate) volume_path: &'a Path,
    pub(crate) config: &'a VolumeConfig,
    pub(crate) opener: &'a dyn FileOpener,
    pub(crate) allocator: &'a dyn Allocator,
    pub(crate) events: &'a Events<SliceWriter>,
    pub(crate) ctx: LogContext,
}

struct CounterStatistics {
    uncompressed: Arc<BackupCounter>,
    compressed: Arc<BackupCounter>,
}

impl StatisticsProvider for CounterStatistics {
    fn uncompressed_size(&self) -> u64 {
        self.uncompressed.get()
    }

    fn compressed_size(&self) -> u64 {
        self.compressed.get()
    }
}

impl SliceWriter {
    pub(crate) async fn open(params: OpenParams<'_>) -> Result<Self, WriterError> {
        let OpenParams {
            key,
            slice,
            volume_path,
            config,
            opener,
            allocator,
            events,
            ctx,
        } = params;
        slice.local_compression.validate()?;
        slice.sync.validate()?;

        let dir = slice.dir_path(volume_path);
        create_dir(&dir)?;
        let file_path = slice.file_path(volume_path);
        let existed = file_path.exists();
        let file = opener
            .open_file(&file_path)
            .map_err(|source| WriterError::File {
                path: file_path.clone(),
                source,
            })?;

        if !existed && config.allocation.enabled && slice.allocated_disk_space > 0 {
            allocate(file.as_ref(), allocator, slice.allocated_disk_space, &ctx);
        }

        let counters = match SliceCounters::open(&dir) {
            Ok(counters) => counters,
            Err(err) => {
                let _ = file.close();
                return Err(WriterError::Counters(err));
            }
        };
        let chain = Arc::new(WriteChain::new(Arc::clone(&file)));
        if let Err(err) = build_chain(&chain, &slice, config, &counters) {
            let _ = chain.close();
            return Err(WriterError::Chain(err));
        }
        slicestore_log!(Level::Trace, ctx: ctx, "writer_chain", "{}", chain.dump());

        let statistics = Arc::new(CounterStatistics {
            uncompressed: Arc::clone(&counters.uncompressed),
            compressed: Arc::clone(&counters.compressed),
        });
        let syncer = match Syncer::new(
            slice.sync.clone(),
            Arc::clone(&chain) as Arc<dyn SyncChain>,
            statistics,
            ctx.clone(),
        ) {
            Ok(syncer) => Arc::new(syncer),
            Err(err) => {
                let _ = chain.close();
                return Err(err.into());
            }
        };

        let writer = Self {
            key,
            slice,
            file_path,
            chain,
            syncer,
            counters,
            events: events.child(),
            writing: InFlight::new(),
            completing: InFlight::new(),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            ctx,
        };
        writer.spawn_counters_backup(config.statistics_sync_interval);

        if let Err(err) = writer.events.dispatch_open(&writer) {
            writer.closed.store(true, Ordering::Release);
            let shutdown = writer.shutdown().await;
            if !shutdown.is_empty() {
                slicestore_log!(
                    Level::Warn,
                    ctx: writer.ctx,
                    "writer_close",
                    "cannot close writer rejected by open listener: {}",
                    shutdown
                );
            }
            return Err(WriterError::Events(err));
        }
        slicestore_log!(Level::Debug, ctx: writer.ctx, "writer_open", "opened writer");
        Ok(writer)
    }

    /// Key of the slice being written.
    pub fn slice_key(&self) -> &SliceKey {
        &self.key.slice_key
    }

    /// Node this writer writes for.
    pub fn source_node_id(&self) -> &str {
        &self.key.source_node_id
    }

    /// Parameters the writer was opened with.
    pub fn slice(&self) -> &Slice {
        &self.slice
    }

    /// Absolute path of the slice file.
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Listeners of this writer; close listeners fire before the volume's.
    pub fn events(&self) -> &Events<SliceWriter> {
        &self.events
    }

    /// Rows and bytes written so far, including earlier writers of the slice.
    pub fn statistics(&self) -> Statistics {
        self.counters.statistics()
    }

    /// Layer order of the write chain.
    pub fn chain_dump(&self) -> String {
        self.chain.dump()
    }

    /// Write `buf`. With `wait` enabled, returns after the sync covering the
    /// write has finished.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, WriterError> {
        let _completing = self.completing.enter();
        let writing = self.writing.enter();
        if self.closed.load(Ordering::Acquire) {
            return Err(WriterError::Closed);
        }
        // Chain writes block; the guard travels with them so close waits.
        let syncer = Arc::clone(&self.syncer);
        let buf = buf.to_vec();
        let (n, notifier) = tokio::task::spawn_blocking(move || {
            let _writing = writing;
            syncer.write(&buf)
        })
        .await
        .map_err(|err| WriterError::Write(std::io::Error::other(err).into()))?
        .map_err(WriterError::Write)?;
        if let Some(notifier) = notifier {
            notifier.wait().await?;
        }
        Ok(n)
    }

    /// Encode `fields` as one CSV row, write it and count it.
    pub async fn write_row<S: AsRef<str>>(&self, fields: &[S]) -> Result<usize, WriterError> {
        let n = self.write(&csv::encode_row(fields)).await?;
        self.counters.rows.add(1);
        Ok(n)
    }

    /// Force a sync now and wait for it.
    pub async fn sync(&self) -> Result<(), WriterError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WriterError::Closed);
        }
        match self.syncer.trigger_sync(true).await {
            Some(notifier) => Ok(notifier.wait().await?),
            None => {
                let chain = Arc::clone(&self.chain);
                tokio::task::spawn_blocking(move || chain.sync())
                    .await
                    .map_err(|err| WriterError::Chain(std::io::Error::other(err)))??;
                Ok(())
            }
        }
    }

    /// Wait for in-flight writes, sync, close the chain and notify close
    /// listeners. A second call fails.
    pub async fn close(&self) -> Result<(), WriterError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(WriterError::AlreadyClosed);
        }
        slicestore_log!(Level::Debug, ctx: self.ctx, "writer_close", "closing writer");

        let mut errs = self.shutdown().await;

        let close_err = (!errs.is_empty()).then(|| errs.clone());
        let close_err_ref = close_err
            .as_ref()
            .map(|err| err as &(dyn StdError + Send + Sync));
        if let Err(err) = self.events.dispatch_close(self, close_err_ref) {
            errs.extend(err);
        }

        slicestore_log!(Level::Debug, ctx: self.ctx, "writer_close", "closed writer");
        errs.into_result().map_err(WriterError::Close)
    }

    async fn shutdown(&self) -> MultiError {
        let mut errs = MultiError::new();
        self.writing.wait_idle().await;
        if let Err(err) = self.syncer.stop().await {
            errs.push_prefixed("cannot stop syncer: ", err);
        }
        self.completing.wait_idle().await;

        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let chain = Arc::clone(&self.chain);
        match tokio::task::spawn_blocking(move || chain.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => errs.push(err),
            Err(err) => errs.push(err),
        }
        if let Err(err) = self.counters.backup() {
            errs.push_prefixed("cannot backup counters: ", err);
        }
        errs
    }

    fn spawn_counters_backup(&self, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let counters = self.counters.clone();
        let cancel = self.cancel.clone();
        let ctx = self.ctx.clone();
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(err) = counters.backup() {
                            slicestore_log!(
                                Level::Warn,
                                ctx: ctx,
                                "counter_backup_failed",
                                "cannot backup counters: {}",
                                err
                            );
                        }
                    }
                }
            }
        });
    }
}

impl fmt::Debug for SliceWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SliceWriter")
            .field("slice_key", &self.key.slice_key.to_string())
            .field("source_node_id", &self.key.source_node_id)
            .field("file_path", &self.file_path)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

fn create_dir(dir: &Path) -> Result<(), WriterError> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o750)
        .create(dir)
        .map_err(|source| WriterError::Dir {
            path: dir.to_path_buf(),
            source,
        })
}

fn allocate(file: &dyn SliceFile, allocator: &dyn Allocator, size: u64, ctx: &LogContext) {
    match file.with_os_file(&mut |f| allocator.allocate(f, size)) {
        Ok(true) => {
            slicestore_log!(Level::Debug, ctx: ctx, "disk_allocation", "allocated {} bytes", size)
        }
        Ok(false) => slicestore_log!(
            Level::Debug,
            ctx: ctx,
            "disk_allocation",
            "disk space allocation is not supported"
        ),
        Err(err) => slicestore_log!(
            Level::Warn,
            ctx: ctx,
            "disk_allocation",
            "cannot allocate disk space {} bytes: {}",
            size,
            err
        ),
    }
}

fn build_chain(
    chain: &WriteChain,
    slice: &Slice,
    config: &VolumeConfig,
    counters: &SliceCounters,
) -> std::io::Result<()> {
    if config.file_buffer_size > 0 {
        let size = config.file_buffer_size;
        chain.prepend_writer(|link| Ok(Some(BufferLayer::new("file buffer", size, link))))?;
    }

    let compressed = Arc::clone(&counters.compressed);
    chain.prepend_writer(|link| {
        Ok(Some(SizeMeter::new("compressed size meter", link, compressed)))
    })?;

    let compressing =
        chain.prepend_writer(|link| compression::new_writer(link, &slice.local_compression))?;
    if compressing && config.input_buffer_size > 0 {
        let size = config.input_buffer_size;
        chain.prepend_writer(|link| Ok(Some(BufferLayer::new("input buffer", size, link))))?;
    }

    let uncompressed = Arc::clone(&counters.uncompressed);
    chain.prepend_writer(|link| {
        Ok(Some(SizeMeter::new("uncompressed size meter", link, uncompressed)))
    })?;
    Ok(())
}
