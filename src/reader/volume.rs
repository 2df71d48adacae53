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
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{ReaderError, SliceReader};
use crate::{
    error::MultiError,
    events::Events,
    logging::{slicestore_log, LogContext},
    model::{Slice, SliceKey},
    volume::{
        self, drain, DetectedVolume, LockRole, VolumeError, VolumeId, VolumeLock, VolumeMetadata,
        VolumeSpec, ID_FILE,
    },
};

/// Settings of reader volumes.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VolumeConfig {
    /// How long to wait for the writer to create the identity file.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub wait_for_volume_id_timeout: Duration,
    /// Poll interval while waiting for the identity file.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub wait_for_volume_id_interval: Duration,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            wait_for_volume_id_timeout: Duration::from_secs(30),
            wait_for_volume_id_interval: Duration::from_millis(500),
        }
    }
}

impl VolumeConfig {
    /// Replace the identity wait timeout.
    pub fn with_wait_for_volume_id_timeout(self, wait_for_volume_id_timeout: Duration) -> Self {
        Self {
            wait_for_volume_id_timeout,
            ..self
        }
    }

    /// Replace the identity poll interval.
    pub fn with_wait_for_volume_id_interval(self, wait_for_volume_id_interval: Duration) -> Self {
        Self {
            wait_for_volume_id_interval,
            ..self
        }
    }

    /// The poll interval must be positive.
    pub fn validate(&self) -> Result<(), VolumeError> {
        if self.wait_for_volume_id_interval.is_zero() {
            return Err(VolumeError::Config(
                "waitForVolumeIdInterval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

// `None` marks a reader that is still opening.
type Registry = Arc<Mutex<HashMap<SliceKey, Option<Arc<SliceReader>>>>>;

/// A local directory opened for slice reading.
///
/// The reader never creates the identity file; it waits for the writer of
/// the same volume to do so.
pub struct Volume {
    id: VolumeId,
    spec: VolumeSpec,
    ctx: LogContext,
    events: Events<SliceReader>,
    drain: drain::DrainFlag,
    cancel: CancellationToken,
    lock: Mutex<Option<VolumeLock>>,
    readers: Registry,
}

impl Volume {
    /// Open the volume at `spec.path` for reading.
    ///
    /// Waits for the identity file, then takes the reader lock.
    pub async fn open(
        spec: VolumeSpec,
        config: VolumeConfig,
        events: &Events<SliceReader>,
    ) -> Result<Self, VolumeError> {
        let path = spec.path.clone();
        let ctx = LogContext::new().with("volume.path", path.display());
        slicestore_log!(Level::Info, ctx: ctx, "volume_open", "opening volume");

        config.validate()?;
        volume::check_dir(&path)?;
        let id = wait_for_id(&path, &config, &ctx).await?;
        let ctx = ctx.with("volume.id", &id);

        let lock = VolumeLock::acquire(&path, LockRole::Reader)?;

        slicestore_log!(
            Level::Info,
            ctx: ctx,
            "volume_open",
            "opened volume volume.type={} volume.label={}",
            spec.volume_type,
            spec.label
        );

        Ok(Self {
            id,
            spec,
            ctx,
            events: events.child(),
            drain: drain::DrainFlag::new(volume::drain_file_path(&path)),
            cancel: CancellationToken::new(),
            lock: Mutex::new(Some(lock)),
            readers: Arc::default(),
        })
    }

    /// Identity written by the writer side.
    pub fn id(&self) -> &VolumeId {
        &self.id
    }

    /// Volume root directory.
    pub fn path(&self) -> &Path {
        &self.spec.path
    }

    /// Storage type from the volume spec.
    pub fn volume_type(&self) -> &str {
        &self.spec.volume_type
    }

    /// Label from the volume spec.
    pub fn label(&self) -> &str {
        &self.spec.label
    }

    /// Identity and spec of the volume.
    pub fn metadata(&self) -> VolumeMetadata {
        VolumeMetadata {
            id: self.id.clone(),
            spec: self.spec.clone(),
        }
    }

    /// Listeners applied to every reader of this volume.
    pub fn events(&self) -> &Events<SliceReader> {
        &self.events
    }

    /// Current state of the drain marker, checked on each call.
    pub fn is_drained(&self) -> bool {
        self.drain.refresh();
        self.drain.is_drained()
    }

    /// Open a reader for `slice`. At most one reader per slice is open at a
    /// time.
    pub async fn open_reader(&self, slice: Slice) -> Result<Arc<SliceReader>, ReaderError> {
        if self.cancel.is_cancelled() {
            return Err(ReaderError::VolumeClosed(self.id.clone()));
        }
        let key = slice.key.clone();
        let ctx = self.ctx.clone().with("slice", &key);

        {
            let mut readers = lock(&self.readers);
            if readers.contains_key(&key) {
                slicestore_log!(Level::Error, ctx: ctx, "reader_open", "reader already exists");
                return Err(ReaderError::AlreadyExists);
            }
            readers.insert(key.clone(), None);
        }

        let reader = match SliceReader::open(slice, self.path(), &self.events, ctx.clone()).await {
            Ok(reader) => Arc::new(reader),
            Err(err) => {
                lock(&self.readers).remove(&key);
                return Err(err);
            }
        };

        let registry = Arc::clone(&self.readers);
        let registered = key.clone();
        reader.events().on_close(move |_, _| {
            lock(&registry).remove(&registered);
            Ok(())
        });
        lock(&self.readers).insert(key, Some(Arc::clone(&reader)));

        if self.cancel.is_cancelled() {
            if let Err(err) = reader.close().await {
                slicestore_log!(
                    Level::Warn,
                    ctx: ctx,
                    "reader_close",
                    "cannot close reader opened during volume close: {}",
                    err
                );
            }
            return Err(ReaderError::VolumeClosed(self.id.clone()));
        }
        Ok(reader)
    }

    /// Opened readers, ordered by slice key.
    pub fn readers(&self) -> Vec<Arc<SliceReader>> {
        let mut out = lock(&self.readers)
            .values()
            .flatten()
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_cached_key(|r| r.slice_key().to_string());
        out
    }

    /// Close all readers concurrently and release the lock.
    pub async fn close(&self) -> Result<(), VolumeError> {
        slicestore_log!(Level::Info, ctx: self.ctx, "volume_close", "closing volume");
        self.cancel.cancel();

        let mut errs = MultiError::new();
        let results = join_all(self.readers().into_iter().map(|reader| async move {
            let result = reader.close().await;
            (reader, result)
        }))
        .await;
        for (reader, result) in results {
            if let Err(err) = result {
                errs.push_prefixed(
                    format!("cannot close reader for slice \"{}\": ", reader.slice_key()),
                    err,
                );
            }
        }

        let held = lock(&self.lock).take();
        if let Some(held) = held {
            if let Err(err) = held.release() {
                errs.extend(err);
            }
        }

        slicestore_log!(Level::Info, ctx: self.ctx, "volume_close", "closed volume");
        errs.into_result().map_err(VolumeError::Close)
    }
}

async fn wait_for_id(
    path: &Path,
    config: &VolumeConfig,
    ctx: &LogContext,
) -> Result<VolumeId, VolumeError> {
    let deadline = Instant::now() + config.wait_for_volume_id_timeout;
    loop {
        match volume::read_id(path) {
            // An empty file is still being written by the writer side.
            Ok(id) if !id.as_str().is_empty() => return Ok(id),
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(VolumeError::IdFile {
                    path: path.join(ID_FILE),
                    source,
                })
            }
        }
        if Instant::now() >= deadline {
            return Err(VolumeError::IdTimeout {
                path: path.join(ID_FILE),
                timeout: config.wait_for_volume_id_timeout,
            });
        }
        slicestore_log!(
            Level::Debug,
            ctx: ctx,
            "volume_id_wait",
            "waiting for volume ID file"
        );
        tokio::time::sleep(config.wait_for_volume_id_interval).await;
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
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
