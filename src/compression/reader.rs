use std::io::{self, BufReader, Read};

use flate2::read::MultiGzDecoder;

use super::{CompressionType, Config};

const ZSTD_WINDOW_LOG_MAX: u32 = 31;

/// A decompressing reader over `R`.
pub enum Decoder<R: Read> {
    /// Reads every concatenated gzip member.
    Gzip(MultiGzDecoder<R>),
    /// Zstandard frames.
    Zstd(zstd::stream::read::Decoder<'static, BufReader<R>>),
}

/// Wrap `inner` with the configured decompressor. Returns `None` when the
/// config selects no compression.
///
/// Every gzip implementation is read with a multi-member decoder, since the
/// parallel writer emits one member per block.
pub fn new_reader<R>(inner: R, config: &Config) -> io::Result<Option<Decoder<R>>>
where
    R: Read,
{
    let decoder = match config.kind {
        CompressionType::None => return Ok(None),
        CompressionType::Gzip => Decoder::Gzip(MultiGzDecoder::new(inner)),
        CompressionType::Zstd => {
            let mut decoder = zstd::stream::read::Decoder::new(inner)?;
            decoder.window_log_max(ZSTD_WINDOW_LOG_MAX)?;
            Decoder::Zstd(decoder)
        }
    };
    Ok(Some(decoder))
}

impl<R: Read> Decoder<R> {
    /// Codec name used in chain dumps.
    pub fn name(&self) -> &'static str {
        match self {
            Decoder::Gzip(_) => "gzip.Reader",
            Decoder::Zstd(_) => "zstd.Reader",
        }
    }
}

impl<R: Read> Read for Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Decoder::Gzip(r) => r.read(buf),
            Decoder::Zstd(r) => r.read(buf),
        }
    }
}

impl<R: Read + Send> crate::chain::ReadLayer for Decoder<R> {
    fn name(&self) -> &str {
        Decoder::name(self)
    }
}
