//! Write side: one [`SliceWriter`] per open slice file, owned by a writer
//! [`Volume`].

mod slice;
mod volume;
mod volumes;

use std::{io, path::PathBuf};

pub use self::{
    slice::SliceWriter,
    volume::{DefaultFileOpener, DiskUsage, FileOpener, Overrides, Volume, VolumeConfig, WriterKey},
    volumes::Volumes,
};
use crate::{
    chain::ChainError, compression::CompressionError, disksync::SyncError, error::MultiError,
    volume::VolumeId,
};

/// Errors surfaced by slice writers and writer volumes.
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    /// The slice already has a writer for this source node.
    #[error("writer already exists")]
    AlreadyExists,
    /// `close` was called twice.
    #[error("writer is already closed")]
    AlreadyClosed,
    /// The writer was used after `close`.
    #[error("writer is closed")]
    Closed,
    /// The volume closed before or during the open.
    #[error("cannot open writer: volume \"{0}\" is closed")]
    VolumeClosed(VolumeId),
    /// The slice directory could not be created.
    #[error("cannot create slice directory \"{path}\": {source}")]
    Dir {
        /// Slice directory path.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The slice file could not be opened.
    #[error("cannot open slice file \"{path}\": {source}")]
    File {
        /// Slice file path.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// A counter backup exists but cannot be read.
    #[error("cannot open slice counters: {0}")]
    Counters(#[source] io::Error),
    /// A chain layer could not be built.
    #[error("cannot build write chain: {0}")]
    Chain(#[source] io::Error),
    /// The local compression config is invalid.
    #[error(transparent)]
    Compression(#[from] CompressionError),
    /// The chain rejected the bytes.
    #[error("cannot write to slice: {0}")]
    Write(#[source] SyncError),
    /// The sync covering the write failed.
    #[error("error when waiting for sync: {0}")]
    Sync(#[from] SyncError),
    /// A sync without a running syncer failed.
    #[error("sync error: {0}")]
    ChainSync(#[from] ChainError),
    /// Open listeners refused the writer.
    #[error("{0}")]
    Events(MultiError),
    /// Errors collected while closing.
    #[error("{0}")]
    Close(MultiError),
}
