//! Layered I/O pipelines over a slice file.
//!
//! A chain starts as a bare [`SliceFile`]. Layers are prepended one at a time:
//! a factory receives a link to the current outermost handle and returns a
//! new layer that becomes the outermost one. Closers run front-first, so the
//! most recently prepended layer is torn down first and the base file last.

mod file;
mod read;
mod write;

use std::{io, sync::Mutex};

pub use self::{
    file::{OsFile, SliceFile},
    read::{ReadChain, ReadLayer, ReadLink},
    write::{WriteChain, WriteLayer, WriteLink},
};
use crate::error::MultiError;

/// Errors surfaced by chain operations.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The chain was closed before the call.
    #[error("chain is already closed")]
    Closed,
    /// A layer failed to flush into the next one.
    #[error("chain flush error: {0}")]
    Flush(#[source] io::Error),
    /// Layers flushed, but the file sync failed.
    #[error("chain sync error: {0}")]
    Sync(#[source] io::Error),
    /// Errors of every closer that failed.
    #[error("chain close error: {0}")]
    Close(MultiError),
}

impl From<ChainError> for io::Error {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Flush(e) | ChainError::Sync(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

type CloseFn = Box<dyn FnOnce() -> io::Result<()> + Send>;

pub(crate) struct Closer {
    name: String,
    run: CloseFn,
}

impl Closer {
    pub(crate) fn new(name: impl Into<String>, run: CloseFn) -> Self {
        Self {
            name: name.into(),
            run,
        }
    }
}

/// Run closers front-first, then close `file`, collecting every failure.
pub(crate) fn run_closers(
    closers: Vec<Closer>,
    file: &dyn SliceFile,
    sync_file: bool,
) -> Result<(), MultiError> {
    let mut errs = MultiError::new();
    for closer in closers {
        if let Err(err) = (closer.run)() {
            errs.push_prefixed(format!("cannot close \"{}\": ", closer.name), err);
        }
    }
    if sync_file {
        if let Err(err) = file.sync() {
            errs.push_prefixed("cannot sync file: ", err);
        }
    }
    if let Err(err) = file.close() {
        errs.push_prefixed("cannot close file: ", err);
    }
    errs.into_result()
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn dump(kind: &str, layers: &[String], file: &str, closers: &[String]) -> String {
    let mut out = String::new();
    out.push_str(kind);
    out.push_str(":\n");
    for (i, name) in layers.iter().enumerate() {
        out.push_str(&format!("  [{:02}] {}\n", i + 1, name));
    }
    out.push_str(&format!("  [{:02}] file \"{}\"\n", layers.len() + 1, file));
    out.push_str("Closers:\n");
    for (i, name) in closers.iter().enumerate() {
        out.push_str(&format!("  [{:02}] {}\n", i + 1, name));
    }
    out.push_str(&format!("  [{:02}] file \"{}\"\n", closers.len() + 1, file));
    out
}
