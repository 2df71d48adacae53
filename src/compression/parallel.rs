use std::io::{self, Write};

use flate2::{write::GzEncoder, Compression};
use rayon::prelude::*;

/// Gzip encoder that compresses fixed-size blocks concurrently.
///
/// Each block becomes an independent gzip member; members are written in
/// input order, so any multi-member decoder reads the original stream back.
pub struct ParallelGzEncoder<W: Write> {
    inner: W,
    level: Compression,
    block_size: usize,
    concurrency: usize,
    current: Vec<u8>,
    pending: Vec<Vec<u8>>,
    members_written: usize,
    finished: bool,
}

impl<W: Write> ParallelGzEncoder<W> {
    pub(crate) fn new(inner: W, level: Compression, block_size: usize, concurrency: usize) -> Self {
        Self {
            inner,
            level,
            block_size,
            concurrency: concurrency.max(1),
            current: Vec::with_capacity(block_size),
            pending: Vec::new(),
            members_written: 0,
            finished: false,
        }
    }

    pub(crate) fn into_inner(self) -> W {
        self.inner
    }

    /// Compress and write all buffered bytes, then an empty member if the
    /// stream would otherwise be empty.
    pub(crate) fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.seal_current();
        self.drain_pending()?;
        if self.members_written == 0 {
            let empty = compress_member(&[], self.level)?;
            self.inner.write_all(&empty)?;
            self.members_written += 1;
        }
        self.inner.flush()?;
        self.finished = true;
        Ok(())
    }

    fn seal_current(&mut self) {
        if !self.current.is_empty() {
            let block = std::mem::replace(&mut self.current, Vec::with_capacity(self.block_size));
            self.pending.push(block);
        }
    }

    fn drain_pending(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let level = self.level;
        let members = self
            .pending
            .par_iter()
            .map(|block| compress_member(block, level))
            .collect::<io::Result<Vec<_>>>()?;
        self.pending.clear();
        for member in members {
            self.inner.write_all(&member)?;
            self.members_written += 1;
        }
        Ok(())
    }
}

fn compress_member(block: &[u8], level: Compression) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(block.len() / 2 + 64), level);
    encoder.write_all(block)?;
    encoder.finish()
}

impl<W: Write> Write for ParallelGzEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "gzip stream is already finished",
            ));
        }
        let room = self.block_size - self.current.len();
        let n = room.min(buf.len());
        self.current.extend_from_slice(&buf[..n]);
        if self.current.len() == self.block_size {
            self.seal_current();
            if self.pending.len() >= self.concurrency {
                self.drain_pending()?;
            }
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.finished {
            return self.inner.flush();
        }
        self.seal_current();
        self.drain_pending()?;
        self.inner.flush()
    }
}
