use std::io::{self, BufWriter, Write};

use crate::chain::{WriteLayer, WriteLink};

/// Fixed-capacity write buffer placed between two chain layers.
pub struct BufferLayer {
    name: &'static str,
    inner: BufWriter<WriteLink>,
}

impl BufferLayer {
    /// Buffer up to `capacity` bytes before writing to `next`.
    pub fn new(name: &'static str, capacity: usize, next: WriteLink) -> Self {
        Self {
            name,
            inner: BufWriter::with_capacity(capacity, next),
        }
    }
}

impl Write for BufferLayer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl WriteLayer for BufferLayer {
    fn name(&self) -> &str {
        self.name
    }
}
