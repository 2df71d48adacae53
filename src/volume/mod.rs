//! Volume identity, locking and drain state shared by writer and reader
//! volumes, plus detection of volumes under a root path and assignment of
//! volumes to new files.
//!
//! On-disk layout of one volume:
//!
//! ```text
//! <root>/<type>/<label>/
//!   volume-id      identity, written once with exclusive create
//!   drain          optional marker; presence blocks new writers
//!   writer.lock    advisory lock, writer role
//!   reader.lock    advisory lock, reader role
//!   <slice-dir>/...
//! ```

mod assignment;
mod detect;
pub(crate) mod drain;
mod lock;

use std::{
    fmt,
    fs::OpenOptions,
    io::{self, Write},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub use self::{
    assignment::{assign, AssignmentConfig},
    detect::{detect_volumes, Collection, DetectError, DetectedVolume},
    lock::{LockRole, VolumeLock},
};
use crate::error::MultiError;

/// File holding the volume identity.
pub const ID_FILE: &str = "volume-id";
/// Marker file that blocks new writers.
pub const DRAIN_FILE: &str = "drain";
/// Length of a generated volume identity.
pub const ID_LENGTH: usize = 26;

const ID_FILE_MODE: u32 = 0o640;

/// Globally unique volume identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeId(String);

impl VolumeId {
    /// Wrap an identity read from disk or configuration.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random identity of [`ID_LENGTH`] characters.
    pub fn generate() -> Self {
        Self(Ulid::new().to_string().to_lowercase())
    }

    /// The identity as written to the ID file.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Location of a volume, derived from its directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Node owning the volume.
    pub node_id: String,
    /// Volume root directory.
    pub path: PathBuf,
    /// Storage class, e.g. `hdd` or `ssd`; drives assignment preference.
    #[serde(rename = "type")]
    pub volume_type: String,
    /// Unique within the volume type.
    pub label: String,
}

impl VolumeSpec {
    /// Describe the volume at `path`.
    pub fn new(
        node_id: impl Into<String>,
        path: impl Into<PathBuf>,
        volume_type: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            path: path.into(),
            volume_type: volume_type.into(),
            label: label.into(),
        }
    }
}

/// Identity and location of an opened volume, for external reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMetadata {
    /// Volume identity.
    pub id: VolumeId,
    /// Location, flattened into the same object.
    #[serde(flatten)]
    pub spec: VolumeSpec,
}

/// Errors surfaced while opening, using or closing a volume.
#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    /// The volume directory cannot be accessed.
    #[error("cannot open volume \"{path}\": {source}")]
    Path {
        /// Volume directory.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The volume config failed validation.
    #[error("invalid volume config: {0}")]
    Config(String),
    /// The volume path exists but is a file.
    #[error("cannot open volume \"{path}\": not a directory")]
    NotDirectory {
        /// Volume path.
        path: PathBuf,
    },
    /// The identity file cannot be read or created.
    #[error("cannot open volume ID file \"{path}\": {source}")]
    IdFile {
        /// Identity file path.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// A reader gave up waiting for the writer to create the identity file.
    #[error("volume ID file \"{path}\" not found: timeout after {timeout:?}")]
    IdTimeout {
        /// Identity file path.
        path: PathBuf,
        /// How long the reader waited.
        timeout: std::time::Duration,
    },
    /// Another process holds the lock of this role.
    #[error("cannot acquire {role} lock \"{path}\": already locked")]
    AlreadyLocked {
        /// Contended role.
        role: LockRole,
        /// Lock file path.
        path: PathBuf,
    },
    /// The lock file cannot be opened or locked.
    #[error("cannot acquire {role} lock \"{path}\": {source}")]
    Lock {
        /// Requested role.
        role: LockRole,
        /// Lock file path.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The volume was used after `close`.
    #[error("volume is closed")]
    Closed,
    /// Errors collected while closing.
    #[error("{0}")]
    Close(MultiError),
}

/// Fail unless `path` is an existing directory.
pub(crate) fn check_dir(path: &Path) -> Result<(), VolumeError> {
    let metadata = std::fs::metadata(path).map_err(|source| VolumeError::Path {
        path: path.to_path_buf(),
        source,
    })?;
    if !metadata.is_dir() {
        return Err(VolumeError::NotDirectory {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Read the identity file of the volume at `dir`.
pub(crate) fn read_id(dir: &Path) -> io::Result<VolumeId> {
    let content = std::fs::read_to_string(dir.join(ID_FILE))?;
    Ok(VolumeId::new(content.trim()))
}

/// Read the identity file, creating it if missing. Returns the identity and
/// whether it was generated by this call.
pub(crate) fn load_or_create_id(dir: &Path) -> Result<(VolumeId, bool), VolumeError> {
    let path = dir.join(ID_FILE);
    let id_err = |source| VolumeError::IdFile {
        path: path.clone(),
        source,
    };
    match read_id(dir) {
        Ok(id) => Ok((id, false)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let id = VolumeId::generate();
            create_id_file(&path, &id).map_err(id_err)?;
            Ok((id, true))
        }
        Err(err) => Err(id_err(err)),
    }
}

// Exclusive create: a racing opener fails instead of overwriting.
fn create_id_file(path: &Path, id: &VolumeId) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(ID_FILE_MODE)
        .open(path)?;
    let write = file.write_all(id.as_str().as_bytes());
    let sync = file.sync_all();
    write.and(sync)
}

pub(crate) fn drain_file_path(dir: &Path) -> PathBuf {
    dir.join(DRAIN_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_has_fixed_length() {
        let id = VolumeId::generate();
        assert_eq!(id.as_str().len(), ID_LENGTH);
        assert_ne!(id, VolumeId::generate());
    }

    #[test]
    fn id_is_created_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (first, generated) = load_or_create_id(dir.path()).expect("create");
        assert!(generated);
        let (second, generated) = load_or_create_id(dir.path()).expect("load");
        assert!(!generated);
        assert_eq!(first, second);
        assert_eq!(
            std::fs::read_to_string(dir.path().join(ID_FILE)).expect("read"),
            first.as_str()
        );
    }

    #[test]
    fn existing_id_is_trimmed() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(ID_FILE), "HDD_1\n").expect("write");
        let (id, generated) = load_or_create_id(dir.path()).expect("load");
        assert_eq!(id.as_str(), "HDD_1");
        assert!(!generated);
    }

    #[test]
    fn check_dir_rejects_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("file");
        std::fs::write(&file, "").expect("write");
        assert!(matches!(
            check_dir(&file),
            Err(VolumeError::NotDirectory { .. })
        ));
        assert!(matches!(
            check_dir(&dir.path().join("missing")),
            Err(VolumeError::Path { .. })
        ));
        assert!(check_dir(dir.path()).is_ok());
    }
}
