use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{compression, disksync, volume::VolumeId};

/// Composite identity of one slice file on one volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceKey {
    /// Owning project.
    pub project_id: String,
    /// Source the data comes from.
    pub source_id: String,
    /// Sink the data is buffered for.
    pub sink_id: String,
    /// File of the sink the slice belongs to.
    pub file_id: String,
    /// Volume holding the slice.
    pub volume_id: VolumeId,
    /// Unique within the file and volume.
    pub slice_id: String,
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}/{}",
            self.project_id,
            self.source_id,
            self.sink_id,
            self.file_id,
            self.volume_id,
            self.slice_id
        )
    }
}

/// Identity of the node that produces data for a slice.
pub type SourceNodeId = String;

/// Local storage parameters of one slice, immutable for the life of a writer
/// or reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slice {
    /// Identity of the slice.
    pub key: SliceKey,
    /// Directory relative to the volume path.
    pub dir: PathBuf,
    /// File name inside `dir`.
    pub filename: String,
    /// Bytes to reserve when the slice file is created; 0 disables it.
    pub allocated_disk_space: u64,
    /// Compression of the bytes stored on the local volume.
    pub local_compression: compression::Config,
    /// Compression expected by staging storage.
    pub staging_compression: compression::Config,
    /// Sync policy of the writer.
    pub sync: disksync::Config,
}

impl Slice {
    /// Path of the slice directory inside `volume_path`.
    pub fn dir_path(&self, volume_path: &std::path::Path) -> PathBuf {
        volume_path.join(&self.dir)
    }

    /// Path of the slice file inside `volume_path`.
    pub fn file_path(&self, volume_path: &std::path::Path) -> PathBuf {
        self.dir_path(volume_path).join(&self.filename)
    }
}
