use std::{
    collections::HashMap,
    fmt, io,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures_util::future::join_all;
use log::Level;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{
    slice::{OpenParams, SliceWriter},
    WriterError,
};
use crate::{
    chain::{OsFile, SliceFile},
    diskalloc::{self, Allocator, DefaultAllocator},
    error::MultiError,
    events::Events,
    logging::{slicestore_log, LogContext},
    model::{Slice, SliceKey, SourceNodeId},
    volume::{
        self, drain, DetectedVolume, LockRole, VolumeError, VolumeId, VolumeLock, VolumeMetadata,
        VolumeSpec,
    },
};

/// Settings of writer volumes.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VolumeConfig {
    /// Follow the drain marker while the volume is open.
    pub watch_drain_file: bool,
    /// Buffer in front of the compression layer; 0 disables it.
    pub input_buffer_size: usize,
    /// Buffer in front of the file; 0 disables it.
    pub file_buffer_size: usize,
    /// How often slice counters are backed up; 0 backs up on close only.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub statistics_sync_interval: Duration,
    /// Space reserved for new slice files.
    pub allocation: diskalloc::Config,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            watch_drain_file: true,
            input_buffer_size: 2 * 1024 * 1024,
            file_buffer_size: 1024 * 1024,
            statistics_sync_interval: Duration::from_secs(1),
            allocation: diskalloc::Config::default(),
        }
    }
}

impl VolumeConfig {
    /// Replace the drain watch flag.
    pub fn with_watch_drain_file(self, watch_drain_file: bool) -> Self {
        Self {
            watch_drain_file,
            ..self
        }
    }

    /// Replace the allocation policy.
    pub fn with_allocation(self, allocation: diskalloc::Config) -> Self {
        Self { allocation, ..self }
    }

    /// Replace the input buffer size.
    pub fn with_input_buffer_size(self, input_buffer_size: usize) -> Self {
        Self {
            input_buffer_size,
            ..self
        }
    }

    /// Replace the file buffer size.
    pub fn with_file_buffer_size(self, file_buffer_size: usize) -> Self {
        Self {
            file_buffer_size,
            ..self
        }
    }

    /// Replace the counter backup interval.
    pub fn with_statistics_sync_interval(self, statistics_sync_interval: Duration) -> Self {
        Self {
            statistics_sync_interval,
            ..self
        }
    }

    /// Checks the allocation policy.
    pub fn validate(&self) -> Result<(), VolumeError> {
        self.allocation
            .validate()
            .map_err(|err| VolumeError::Config(err.to_string()))
    }
}

/// Opens the base file of a new slice writer.
pub trait FileOpener: Send + Sync {
    /// Open `path` for appending.
    fn open_file(&self, path: &Path) -> io::Result<Arc<dyn SliceFile>>;
}

/// Opens slice files for appending, creating them if missing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFileOpener;

impl FileOpener for DefaultFileOpener {
    fn open_file(&self, path: &Path) -> io::Result<Arc<dyn SliceFile>> {
        Ok(Arc::new(OsFile::open_append(path)?))
    }
}

/// Replacements of the OS-facing collaborators, mainly for tests.
#[derive(Default, Clone)]
pub struct Overrides {
    /// Defaults to [`DefaultFileOpener`].
    pub file_opener: Option<Arc<dyn FileOpener>>,
    /// Defaults to [`DefaultAllocator`](crate::diskalloc::DefaultAllocator).
    pub allocator: Option<Arc<dyn Allocator>>,
}

/// Registry key of a writer. Several source nodes may write into the same
/// slice, e.g. after a failover.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WriterKey {
    /// Slice being written.
    pub slice_key: SliceKey,
    /// Node producing the data.
    pub source_node_id: SourceNodeId,
}

/// Space figures of the filesystem holding a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    /// Bytes in use.
    pub used: u64,
    /// Filesystem size in bytes.
    pub total: u64,
}

// `None` marks a writer that is still opening.
type Registry = Arc<Mutex<HashMap<WriterKey, Option<Arc<SliceWriter>>>>>;

/// A local directory opened for slice writing.
pub struct Volume {
    id: VolumeId,
    spec: VolumeSpec,
    config: VolumeConfig,
    ctx: LogContext,
    events: Events<SliceWriter>,
    opener: Arc<dyn FileOpener>,
    allocator: Arc<dyn Allocator>,
    drain: drain::DrainFlag,
    cancel: CancellationToken,
    tracker: TaskTracker,
    lock: Mutex<Option<VolumeLock>>,
    writers: Registry,
}

impl Volume {
    /// Open the volume at `spec.path` for writing.
    ///
    /// Loads or generates the identity, takes the writer lock and starts
    /// following the drain marker.
    pub async fn open(
        spec: VolumeSpec,
        config: VolumeConfig,
        events: &Events<SliceWriter>,
    ) -> Result<Self, VolumeError> {
        Self::open_with(spec, config, events, Overrides::default()).await
    }

    /// Like [`Volume::open`], with OS collaborators replaced by `overrides`.
    pub async fn open_with(
        spec: VolumeSpec,
        config: VolumeConfig,
        events: &Events<SliceWriter>,
        overrides: Overrides,
    ) -> Result<Self, VolumeError> {
        let path = spec.path.clone();
        let ctx = LogContext::new().with("volume.path", path.display());
        slicestore_log!(Level::Info, ctx: ctx, "volume_open", "opening volume");

        config.validate()?;
        volume::check_dir(&path)?;
        let (id, generated) = volume::load_or_create_id(&path)?;
        let ctx = ctx.with("volume.id", &id);
        if generated {
            slicestore_log!(Level::Info, ctx: ctx, "volume_id_generated", "generated volume ID");
        }

        let lock = VolumeLock::acquire(&path, LockRole::Writer)?;

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let drain = drain::DrainFlag::new(volume::drain_file_path(&path));
        if config.watch_drain_file {
            drain::watch(drain.clone(), &path, cancel.clone(), &tracker, ctx.clone());
        }

        slicestore_log!(
            Level::Info,
            ctx: ctx,
            "volume_open",
            "opened volume volume.type={} volume.label={} drained={}",
            spec.volume_type,
            spec.label,
            drain.is_drained()
        );

        Ok(Self {
            id,
            spec,
            config,
            ctx,
            events: events.child(),
            opener: overrides
                .file_opener
                .unwrap_or_else(|| Arc::new(DefaultFileOpener)),
            allocator: overrides
                .allocator
                .unwrap_or_else(|| Arc::new(DefaultAllocator)),
            drain,
            cancel,
            tracker,
            lock: Mutex::new(Some(lock)),
            writers: Arc::default(),
        })
    }

    /// Identity persisted in the volume's ID file.
    pub fn id(&self) -> &VolumeId {
        &self.id
    }

    /// Volume root directory.
    pub fn path(&self) -> &Path {
        &self.spec.path
    }

    /// Storage type, e.g. `hdd` or `ssd`.
    pub fn volume_type(&self) -> &str {
        &self.spec.volume_type
    }

    /// Label unique within the volume type.
    pub fn label(&self) -> &str {
        &self.spec.label
    }

    /// Identity and spec, as reported to the cluster.
    pub fn metadata(&self) -> VolumeMetadata {
        VolumeMetadata {
            id: self.id.clone(),
            spec: self.spec.clone(),
        }
    }

    /// Listeners applied to every writer of this volume.
    pub fn events(&self) -> &Events<SliceWriter> {
        &self.events
    }

    /// True while the drain marker is present. Drained volumes keep their
    /// writers but receive no new slices.
    pub fn is_drained(&self) -> bool {
        self.drain.is_drained()
    }

    /// Usage of the filesystem holding the volume.
    pub fn disk_usage(&self) -> io::Result<DiskUsage> {
        Ok(DiskUsage {
            used: self.allocator.used_space(self.path())?,
            total: self.allocator.total_space(self.path())?,
        })
    }

    /// Open a writer for `slice` on behalf of `source_node_id`.
    pub async fn open_writer(
        &self,
        source_node_id: impl Into<SourceNodeId>,
        slice: Slice,
    ) -> Result<Arc<SliceWriter>, WriterError> {
        if self.cancel.is_cancelled() {
            return Err(WriterError::VolumeClosed(self.id.clone()));
        }
        let key = WriterKey {
            slice_key: slice.key.clone(),
            source_node_id: source_node_id.into(),
        };
        let ctx = self
            .ctx
            .clone()
            .with("slice", &key.slice_key)
            .with("source_node.id", &key.source_node_id);

        {
            let mut writers = lock(&self.writers);
            if writers.contains_key(&key) {
                slicestore_log!(Level::Error, ctx: ctx, "writer_open", "writer already exists");
                return Err(WriterError::AlreadyExists);
            }
            writers.insert(key.clone(), None);
        }

        let opened = SliceWriter::open(OpenParams {
            key: key.clone(),
            slice,
            volume_path: self.path(),
            config: &self.config,
            opener: self.opener.as_ref(),
            allocator: self.allocator.as_ref(),
            events: &self.events,
            ctx: ctx.clone(),
        })
        .await;
        let writer = match opened {
            Ok(writer) => Arc::new(writer),
            Err(err) => {
                lock(&self.writers).remove(&key);
                return Err(err);
            }
        };

        let registry = Arc::clone(&self.writers);
        let registered = key.clone();
        writer.events().on_close(move |_, _| {
            lock(&registry).remove(&registered);
            Ok(())
        });
        lock(&self.writers).insert(key, Some(Arc::clone(&writer)));

        // The volume may have started closing while the writer was opening.
        if self.cancel.is_cancelled() {
            if let Err(err) = writer.close().await {
                slicestore_log!(
                    Level::Warn,
                    ctx: ctx,
                    "writer_close",
                    "cannot close writer opened during volume close: {}",
                    err
                );
            }
            return Err(WriterError::VolumeClosed(self.id.clone()));
        }
        Ok(writer)
    }

    /// Opened writers, ordered by slice key.
    pub fn writers(&self) -> Vec<Arc<SliceWriter>> {
        let mut out = lock(&self.writers)
            .values()
            .flatten()
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_cached_key(|w| (w.slice_key().to_string(), w.source_node_id().to_string()));
        out
    }

    /// Stop the drain watch, close all writers concurrently and release the
    /// lock. Writer failures are collected, one per slice key.
    pub async fn close(&self) -> Result<(), VolumeError> {
        slicestore_log!(Level::Info, ctx: self.ctx, "volume_close", "closing volume");
        self.cancel.cancel();

        let mut errs = MultiError::new();
        let results = join_all(self.writers().into_iter().map(|writer| async move {
            let result = writer.close().await;
            (writer, result)
        }))
        .await;
        for (writer, result) in results {
            if let Err(err) = result {
                errs.push_prefixed(
                    format!("cannot close writer for slice \"{}\": ", writer.slice_key()),
                    err,
                );
            }
        }

        self.tracker.close();
        self.tracker.wait().await;

        let held = self
            .lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(held) = held {
            if let Err(err) = held.release() {
                errs.extend(err);
            }
        }

        slicestore_log!(Level::Info, ctx: self.ctx, "volume_close", "closed volume");
        errs.into_result().map_err(VolumeError::Close)
    }
}

impl DetectedVolume for Volume {
    fn id(&self) -> &VolumeId {
        &self.id
    }

    fn spec(&self) -> &VolumeSpec {
        &self.spec
    }

    fn is_drained(&self) -> bool {
        Volume::is_drained(self)
    }

    async fn close(&self) -> Result<(), VolumeError> {
        Volume::close(self).await
    }
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .field("drained", &self.is_drained())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
