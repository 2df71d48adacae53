use std::{
    io::{self, Read, Write},
    thread::JoinHandle,
};

use crate::{
    chain::{ReadLayer, ReadLink},
    compression,
};

const PIPE_CAPACITY: usize = 16;

/// Compresses the bytes of the next layer on a background thread and
/// exposes the compressed stream as a reader.
pub(crate) struct CompressPipe {
    name: String,
    rx: Option<flume::Receiver<io::Result<Vec<u8>>>>,
    current: Vec<u8>,
    offset: usize,
    worker: Option<JoinHandle<()>>,
}

struct PipeWriter {
    tx: flume::Sender<io::Result<Vec<u8>>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(Ok(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader is closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CompressPipe {
    pub(crate) fn new(mut source: ReadLink, config: compression::Config) -> io::Result<Self> {
        let (tx, rx) = flume::bounded(PIPE_CAPACITY);
        let name = format!("{:?} compression pipe", config.kind).to_lowercase();
        let worker = std::thread::Builder::new()
            .name("slice-compress-pipe".to_string())
            .spawn(move || {
                let result = (|| -> io::Result<()> {
                    let writer = PipeWriter { tx: tx.clone() };
                    let Some(mut encoder) = compression::new_writer(writer, &config)? else {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "compression pipe requires a compression type",
                        ));
                    };
                    io::copy(&mut source, &mut encoder)?;
                    encoder.finish()?;
                    Ok(())
                })();
                if let Err(err) = result {
                    let _ = tx.send(Err(err));
                }
            })?;
        Ok(Self {
            name,
            rx: Some(rx),
            current: Vec::new(),
            offset: 0,
            worker: Some(worker),
        })
    }
}

impl Read for CompressPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset >= self.current.len() {
            let Some(rx) = &self.rx else {
                return Err(io::Error::new(io::ErrorKind::Other, "pipe is closed"));
            };
            match rx.recv() {
                Ok(Ok(chunk)) => {
                    self.current = chunk;
                    self.offset = 0;
                }
                Ok(Err(err)) => return Err(err),
                // Writer finished.
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.offset);
        buf[..n].copy_from_slice(&self.current[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

impl ReadLayer for CompressPipe {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> io::Result<()> {
        drop(self.rx.take());
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "compression pipe panicked"))?;
        }
        Ok(())
    }
}

impl Drop for CompressPipe {
    fn drop(&mut self) {
        let _ = ReadLayer::close(self);
    }
}
