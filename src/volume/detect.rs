use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures_util::future::join_all;

use super::{VolumeError, VolumeId, VolumeSpec};
use crate::error::MultiError;

/// Volume handle managed by a [`Collection`].
pub trait DetectedVolume: Send + Sync + 'static {
    /// Identity used as the collection key.
    fn id(&self) -> &VolumeId;

    /// Where the volume lives.
    fn spec(&self) -> &VolumeSpec;

    /// Drained volumes are skipped by assignment.
    fn is_drained(&self) -> bool {
        false
    }

    /// Close the volume and its resources.
    fn close(&self) -> impl Future<Output = Result<(), VolumeError>> + Send;
}

/// Errors surfaced by volume detection.
#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    /// The root or a type directory cannot be listed.
    #[error("cannot read volumes directory \"{path}\": {source}")]
    Read {
        /// Directory being listed.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// One or more volumes failed to open. The opened ones were closed.
    #[error("cannot open volumes:\n{0}")]
    Open(MultiError),
    /// Two directories carry the same identity, e.g. after a copy.
    #[error("duplicate volume ID \"{id}\" found in \"{first}\" and \"{second}\"")]
    DuplicateId {
        /// Shared identity.
        id: VolumeId,
        /// Path of the volume seen first.
        first: PathBuf,
        /// Path of the other volume.
        second: PathBuf,
    },
    /// The root holds no `{type}/{label}` directory.
    #[error("no volume found in \"{path}\"")]
    NoVolume {
        /// Root that was scanned.
        path: PathBuf,
    },
}

/// Opened volumes keyed by identity.
pub struct Collection<V> {
    volumes: BTreeMap<VolumeId, Arc<V>>,
}

impl<V: DetectedVolume> Collection<V> {
    /// Index `volumes` by identity, rejecting duplicates.
    pub fn new(volumes: impl IntoIterator<Item = Arc<V>>) -> Result<Self, DetectError> {
        let mut map: BTreeMap<VolumeId, Arc<V>> = BTreeMap::new();
        for volume in volumes {
            if let Some(existing) = map.get(volume.id()) {
                return Err(DetectError::DuplicateId {
                    id: volume.id().clone(),
                    first: existing.spec().path.clone(),
                    second: volume.spec().path.clone(),
                });
            }
            map.insert(volume.id().clone(), volume);
        }
        Ok(Self { volumes: map })
    }

    /// All volumes, ordered by identity.
    pub fn all(&self) -> Vec<Arc<V>> {
        self.volumes.values().cloned().collect()
    }

    /// Volume with the given identity.
    pub fn get(&self, id: &VolumeId) -> Option<Arc<V>> {
        self.volumes.get(id).cloned()
    }

    /// Number of volumes.
    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    /// True without volumes.
    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    /// Volumes whose drain marker is currently present.
    pub fn drained(&self) -> Vec<Arc<V>> {
        self.volumes
            .values()
            .filter(|v| v.is_drained())
            .cloned()
            .collect()
    }

    /// Close all volumes concurrently, collecting every failure.
    pub async fn close(&self) -> Result<(), MultiError> {
        close_all(self.volumes.values().cloned()).await
    }
}

async fn close_all<V: DetectedVolume>(
    volumes: impl IntoIterator<Item = Arc<V>>,
) -> Result<(), MultiError> {
    let results = join_all(volumes.into_iter().map(|volume| async move {
        let result = volume.close().await;
        (volume, result)
    }))
    .await;
    let mut errs = MultiError::new();
    for (volume, result) in results {
        if let Err(err) = result {
            errs.push_prefixed(format!("cannot close volume \"{}\": ", volume.id()), err);
        }
    }
    errs.into_result()
}

/// Find `{type}/{label}` directories exactly two levels below `root`.
pub(crate) fn scan(node_id: &str, root: &Path) -> Result<Vec<VolumeSpec>, DetectError> {
    let read_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| DetectError::Read { path, source }
    };
    let mut specs = Vec::new();
    for type_entry in std::fs::read_dir(root).map_err(read_err(root))? {
        let type_entry = type_entry.map_err(read_err(root))?;
        if !type_entry.file_type().map_err(read_err(root))?.is_dir() {
            continue;
        }
        let type_path = type_entry.path();
        for label_entry in std::fs::read_dir(&type_path).map_err(read_err(&type_path))? {
            let label_entry = label_entry.map_err(read_err(&type_path))?;
            if !label_entry.file_type().map_err(read_err(&type_path))?.is_dir() {
                continue;
            }
            specs.push(VolumeSpec::new(
                node_id,
                label_entry.path(),
                type_entry.file_name().to_string_lossy(),
                label_entry.file_name().to_string_lossy(),
            ));
        }
    }
    specs.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(specs)
}

/// Detect volumes under `root` and open each of them concurrently with
/// `open`. Any open failure, a duplicate identity or an empty result fails
/// the whole detection; volumes already opened are closed again.
pub async fn detect_volumes<V, F, Fut>(
    node_id: &str,
    root: &Path,
    open: F,
) -> Result<Collection<V>, DetectError>
where
    V: DetectedVolume,
    F: Fn(VolumeSpec) -> Fut,
    Fut: Future<Output = Result<V, VolumeError>>,
{
    let specs = scan(node_id, root)?;
    let results = join_all(specs.into_iter().map(|spec| {
        let path = spec.path.clone();
        let opening = open(spec);
        async move { (path, opening.await) }
    }))
    .await;

    let mut opened = Vec::new();
    let mut errs = MultiError::new();
    for (path, result) in results {
        match result {
            Ok(volume) => opened.push(Arc::new(volume)),
            Err(err) => errs.push_prefixed(format!("cannot open volume \"{}\": ", path.display()), err),
        }
    }

    let outcome = if !errs.is_empty() {
        Err(DetectError::Open(errs))
    } else if opened.is_empty() {
        Err(DetectError::NoVolume {
            path: root.to_path_buf(),
        })
    } else {
        let mut seen: HashMap<&VolumeId, &Path> = HashMap::new();
        let mut duplicate = None;
        for volume in &opened {
            if let Some(first) = seen.insert(volume.id(), &volume.spec().path) {
                duplicate = Some(DetectError::DuplicateId {
                    id: volume.id().clone(),
                    first: first.to_path_buf(),
                    second: volume.spec().path.clone(),
                });
                break;
            }
        }
        match duplicate {
            Some(err) => Err(err),
            None => Ok(()),
        }
    };

    match outcome {
        Ok(()) => Collection::new(opened),
        Err(err) => {
            let _ = close_all(opened).await;
            Err(err)
        }
    }
}
