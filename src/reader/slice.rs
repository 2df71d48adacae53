use std::{
    error::Error as StdError,
    fmt,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::Level;

use super::{pipe::CompressPipe, ReaderError};
use crate::{
    chain::{OsFile, ReadChain, SliceFile},
    compression::{self, CompressionType},
    error::MultiError,
    events::Events,
    inflight::InFlight,
    logging::{slicestore_log, LogContext},
    model::{Slice, SliceKey},
};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Reads one slice file, converting it from the local to the staging
/// compression on the fly when the two differ.
pub struct SliceReader {
    slice: Slice,
    file_path: PathBuf,
    chain: Arc<ReadChain>,
    events: Events<SliceReader>,
    reading: InFlight,
    closed: AtomicBool,
    ctx: LogContext,
}

impl SliceReader {
    pub(crate) async fn open(
        slice: Slice,
        volume_path: &Path,
        events: &Events<SliceReader>,
        ctx: LogContext,
    ) -> Result<Self, ReaderError> {
        let file_path = slice.file_path(volume_path);
        let file = OsFile::open_read(&file_path).map_err(|source| ReaderError::File {
            path: file_path.clone(),
            source,
        })?;
        let chain = Arc::new(ReadChain::new(Arc::new(file) as Arc<dyn SliceFile>));
        if let Err(err) = build_chain(&chain, &slice) {
            let _ = chain.close();
            return Err(ReaderError::Chain(err));
        }
        slicestore_log!(Level::Trace, ctx: ctx, "reader_chain", "{}", chain.dump());

        let reader = Self {
            slice,
            file_path,
            chain,
            events: events.child(),
            reading: InFlight::new(),
            closed: AtomicBool::new(false),
            ctx,
        };
        if let Err(err) = reader.events.dispatch_open(&reader) {
            reader.closed.store(true, Ordering::Release);
            let closed = reader.close_chain().await;
            if !closed.is_empty() {
                slicestore_log!(
                    Level::Warn,
                    ctx: reader.ctx,
                    "reader_close",
                    "cannot close reader rejected by open listener: {}",
                    closed
                );
            }
            return Err(ReaderError::Events(err));
        }
        slicestore_log!(Level::Debug, ctx: reader.ctx, "reader_open", "opened reader");
        Ok(reader)
    }

    /// Key of the slice being read.
    pub fn slice_key(&self) -> &SliceKey {
        &self.slice.key
    }

    /// Parameters the reader was opened with.
    pub fn slice(&self) -> &Slice {
        &self.slice
    }

    /// Absolute path of the slice file.
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Listeners of this reader; close listeners fire before the volume's.
    pub fn events(&self) -> &Events<SliceReader> {
        &self.events
    }

    /// Layer order of the read chain.
    pub fn chain_dump(&self) -> String {
        self.chain.dump()
    }

    /// Read staging-compressed bytes. Returns 0 at the end of the slice.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let _reading = self.reading.enter();
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::other(ReaderError::Closed));
        }
        self.chain.read(buf)
    }

    /// Copy the remaining staging-compressed bytes into `dst`. The file is
    /// copied directly when no conversion is needed.
    pub fn write_to(&self, dst: &mut dyn Write) -> io::Result<u64> {
        let _reading = self.reading.enter();
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::other(ReaderError::Closed));
        }
        if let Some(file) = self.chain.unwrap_file() {
            return file.copy_to(dst);
        }
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = self.chain.read(&mut buf)?;
            if n == 0 {
                return Ok(total);
            }
            dst.write_all(&buf[..n])?;
            total += n as u64;
        }
    }

    /// Wait for in-flight reads, close the chain and notify close listeners.
    /// A second call fails.
    pub async fn close(&self) -> Result<(), ReaderError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ReaderError::AlreadyClosed);
        }
        slicestore_log!(Level::Debug, ctx: self.ctx, "reader_close", "closing reader");

        self.reading.wait_idle().await;
        let mut errs = self.close_chain().await;

        let close_err = (!errs.is_empty()).then(|| errs.clone());
        let close_err_ref = close_err
            .as_ref()
            .map(|err| err as &(dyn StdError + Send + Sync));
        if let Err(err) = self.events.dispatch_close(self, close_err_ref) {
            errs.extend(err);
        }

        slicestore_log!(Level::Debug, ctx: self.ctx, "reader_close", "closed reader");
        errs.into_result().map_err(ReaderError::Close)
    }

    async fn close_chain(&self) -> MultiError {
        let mut errs = MultiError::new();
        let chain = Arc::clone(&self.chain);
        match tokio::task::spawn_blocking(move || chain.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => errs.push(err),
            Err(err) => errs.push(err),
        }
        errs
    }
}

fn build_chain(chain: &ReadChain, slice: &Slice) -> io::Result<()> {
    let local = &slice.local_compression;
    let staging = &slice.staging_compression;
    if local.kind == staging.kind {
        return Ok(());
    }
    if local.kind != CompressionType::None {
        chain.prepend_reader(|link| compression::new_reader(link, local))?;
    }
    if staging.kind != CompressionType::None {
        let staging = staging.clone();
        chain.prepend_reader(|link| Ok(Some(CompressPipe::new(link, staging)?)))?;
    }
    Ok(())
}

impl fmt::Debug for SliceReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SliceReader")
            .field("slice", &self.slice.key)
            .field("file_path", &self.file_path)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}
