use std::io::{self, BufWriter, Write};

use flate2::{write::GzEncoder, Compression};

use super::{
    parallel::ParallelGzEncoder, resolve_concurrency, CompressionType, Config,
    GzipImplementation,
};
use crate::chain::WriteLayer;

/// A compressing writer over `W`.
pub enum Encoder<W: Write> {
    /// [`GzipImplementation::Standard`].
    Gzip(GzEncoder<W>),
    /// [`GzipImplementation::Fast`].
    GzipFast(BufWriter<GzEncoder<W>>),
    /// [`GzipImplementation::Parallel`].
    GzipParallel(ParallelGzEncoder<W>),
    /// Multi-threaded zstd encoder.
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

/// Wrap `inner` with the configured compressor. Returns `None` when the
/// config selects no compression.
pub fn new_writer<W>(inner: W, config: &Config) -> io::Result<Option<Encoder<W>>>
where
    W: Write,
{
    let encoder = match config.kind {
        CompressionType::None => return Ok(None),
        CompressionType::Gzip => {
            let gzip = &config.gzip;
            let level = Compression::new(gzip.level);
            match gzip.implementation {
                GzipImplementation::Standard => Encoder::Gzip(GzEncoder::new(inner, level)),
                // Speed over ratio: the configured level is ignored.
                GzipImplementation::Fast => Encoder::GzipFast(BufWriter::with_capacity(
                    gzip.block_size,
                    GzEncoder::new(inner, Compression::fast()),
                )),
                GzipImplementation::Parallel => {
                    Encoder::GzipParallel(ParallelGzEncoder::new(
                        inner,
                        level,
                        gzip.block_size,
                        resolve_concurrency(gzip.concurrency),
                    ))
                }
            }
        }
        CompressionType::Zstd => {
            let zstd_config = &config.zstd;
            let mut encoder = zstd::stream::write::Encoder::new(inner, zstd_config.level)?;
            let workers = resolve_concurrency(zstd_config.concurrency);
            if workers > 1 {
                encoder.multithread(workers as u32)?;
            }
            encoder.window_log(zstd_config.window_log())?;
            Encoder::Zstd(encoder)
        }
    };
    Ok(Some(encoder))
}

impl<W: Write> Encoder<W> {
    /// Codec name used in chain dumps.
    pub fn name(&self) -> &'static str {
        match self {
            Encoder::Gzip(_) => "gzip.Writer",
            Encoder::GzipFast(_) => "gzip.FastWriter",
            Encoder::GzipParallel(_) => "gzip.ParallelWriter",
            Encoder::Zstd(_) => "zstd.Writer",
        }
    }

    /// Write the stream trailer. The encoder must not be written afterwards.
    pub fn finish(&mut self) -> io::Result<()> {
        match self {
            Encoder::Gzip(w) => w.try_finish(),
            Encoder::GzipFast(w) => {
                w.flush()?;
                w.get_mut().try_finish()
            }
            Encoder::GzipParallel(w) => w.finish(),
            Encoder::Zstd(w) => w.do_finish(),
        }
    }

    /// Finish the stream and return the underlying writer.
    pub fn finish_into_inner(self) -> io::Result<W> {
        match self {
            Encoder::Gzip(w) => w.finish(),
            Encoder::GzipFast(w) => w.into_inner().map_err(|e| e.into_error())?.finish(),
            Encoder::GzipParallel(mut w) => {
                w.finish()?;
                Ok(w.into_inner())
            }
            Encoder::Zstd(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Gzip(w) => w.write(buf),
            Encoder::GzipFast(w) => w.write(buf),
            Encoder::GzipParallel(w) => w.write(buf),
            Encoder::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Gzip(w) => w.flush(),
            Encoder::GzipFast(w) => w.flush(),
            Encoder::GzipParallel(w) => w.flush(),
            Encoder::Zstd(w) => w.flush(),
        }
    }
}

impl<W: Write + Send> WriteLayer for Encoder<W> {
    fn name(&self) -> &str {
        Encoder::name(self)
    }

    fn finish(&mut self) -> io::Result<()> {
        Encoder::finish(self)
    }
}
