//! Read side: one [`SliceReader`] per slice being shipped to staging storage,
//! owned by a reader [`Volume`].

mod pipe;
mod slice;
mod volume;
mod volumes;

use std::{io, path::PathBuf};

pub use self::{
    slice::SliceReader,
    volume::{Volume, VolumeConfig},
    volumes::Volumes,
};
use crate::{error::MultiError, volume::VolumeId};

/// Errors surfaced by slice readers and reader volumes.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    /// The slice already has an open reader on this volume.
    #[error("reader already exists")]
    AlreadyExists,
    /// `close` was called twice.
    #[error("reader is already closed")]
    AlreadyClosed,
    /// The reader was used after `close`.
    #[error("reader is closed")]
    Closed,
    /// The volume closed before or during the open.
    #[error("cannot open reader: volume \"{0}\" is closed")]
    VolumeClosed(VolumeId),
    /// The slice file could not be opened.
    #[error("cannot open slice file \"{path}\": {source}")]
    File {
        /// Slice file path.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// A decoding or recompression layer could not be built.
    #[error("cannot build read chain: {0}")]
    Chain(#[source] io::Error),
    /// Open listeners refused the reader.
    #[error("{0}")]
    Events(MultiError),
    /// Errors collected while closing.
    #[error("{0}")]
    Close(MultiError),
}
