use std::{
    io::{self, Write},
    sync::Arc,
};

use super::BackupCounter;
use crate::chain::{WriteLayer, WriteLink};

/// Pass-through layer adding the number of written bytes to a counter.
pub struct SizeMeter {
    name: &'static str,
    next: WriteLink,
    counter: Arc<BackupCounter>,
}

impl SizeMeter {
    /// Count bytes accepted by `next` into `counter`.
    pub fn new(name: &'static str, next: WriteLink, counter: Arc<BackupCounter>) -> Self {
        Self {
            name,
            next,
            counter,
        }
    }
}

impl Write for SizeMeter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.next.write(buf)?;
        self.counter.add(n as u64);
        Ok(n)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.next.write_all(buf)?;
        self.counter.add(buf.len() as u64);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WriteLayer for SizeMeter {
    fn name(&self) -> &str {
        self.name
    }
}
