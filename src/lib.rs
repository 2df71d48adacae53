#![deny(missing_docs)]
//! Local-disk slice buffering.
//!
//! Incoming table rows are appended to per-slice files on local volumes before
//! they are shipped to staging storage. The crate owns the local half of that
//! path: volume identity and locking, disk-space pre-allocation, a layered I/O
//! chain with compression, durability policy, and the lifecycle of the
//! writers and readers that sit on top.

#[cfg(not(unix))]
compile_error!("slicestore requires a unix platform");

mod logging;

/// Aggregated error helpers.
pub mod error;

/// Ordered open/close listener registries.
pub mod events;

/// Slice descriptors consumed by writers and readers.
pub mod model;

/// Stream compression codecs.
pub mod compression;

/// Disk space pre-allocation and usage.
pub mod diskalloc;

/// Layered read/write pipelines over a slice file.
pub mod chain;

/// Durability policy for buffered writes.
pub mod disksync;

/// Counters, meters and row encoders.
pub mod encoding;

/// Tracking of in-flight operations for graceful shutdown.
pub mod inflight;

/// Volume identity, locking, detection and assignment.
pub mod volume;

/// Write side: slice writers and writer volumes.
pub mod writer;

/// Read side: slice readers and reader volumes.
pub mod reader;

pub use crate::{
    model::{Slice, SliceKey},
    reader::{SliceReader, Volume as ReaderVolume},
    volume::{VolumeId, VolumeSpec},
    writer::{SliceWriter, Volume as WriterVolume},
};
