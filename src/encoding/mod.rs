//! Byte meters, persistent counters and row encoding used by slice writers.

mod buffer;
mod counter;
/// CSV rows as written by [`SliceWriter::write_row`](crate::writer::SliceWriter::write_row).
pub mod csv;
mod meter;

pub use self::{
    buffer::BufferLayer,
    counter::{BackupCounter, SliceCounters, Statistics},
    meter::SizeMeter,
};

/// File holding the backup of the row counter.
pub const ROWS_COUNT_FILE: &str = "rows_count";
/// File holding the backup of the bytes-after-compression counter.
pub const COMPRESSED_SIZE_FILE: &str = "compressed_size";
/// File holding the backup of the bytes-before-compression counter.
pub const UNCOMPRESSED_SIZE_FILE: &str = "uncompressed_size";
