//! Stream compression codecs.
//!
//! [`new_writer`] and [`new_reader`] wrap a byte stream with the codec named by
//! a [`Config`]. Both return `None` for [`CompressionType::None`], which lets
//! a chain skip the layer entirely.

mod parallel;
mod reader;
mod writer;

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

pub use self::{
    parallel::ParallelGzEncoder,
    reader::{new_reader, Decoder},
    writer::{new_writer, Encoder},
};

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

pub(crate) const MIN_GZIP_BLOCK_SIZE: usize = 16 * KIB;
pub(crate) const MAX_GZIP_BLOCK_SIZE: usize = 100 * MIB;
pub(crate) const MIN_ZSTD_WINDOW_SIZE: usize = KIB;
pub(crate) const MAX_ZSTD_WINDOW_SIZE: usize = 128 * MIB;

/// Codec family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    /// Bytes pass through unchanged.
    #[default]
    None,
    /// RFC 1952 gzip, possibly several concatenated members.
    Gzip,
    /// Zstandard frames.
    Zstd,
}

impl CompressionType {
    /// Conventional file name suffix, without the dot.
    pub fn file_extension(&self) -> Option<&'static str> {
        match self {
            CompressionType::None => None,
            CompressionType::Gzip => Some("gz"),
            CompressionType::Zstd => Some("zst"),
        }
    }
}

/// Gzip encoder implementations. All of them produce the same wire format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GzipImplementation {
    /// Single-threaded streaming encoder.
    Standard,
    /// Single-threaded encoder at the fastest level, fed by a block-sized
    /// staging buffer. The configured level is ignored.
    Fast,
    /// Blocks compressed concurrently as independent gzip members.
    #[default]
    Parallel,
}

/// Gzip encoder settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GzipConfig {
    /// Deflate level, 1 to 9.
    pub level: u32,
    /// Encoder used for writing; any implementation decodes the result.
    pub implementation: GzipImplementation,
    /// Bytes per block of the fast and parallel implementations.
    pub block_size: usize,
    /// Worker count of the parallel implementation; 0 means available parallelism.
    pub concurrency: usize,
}

impl Default for GzipConfig {
    fn default() -> Self {
        Self {
            level: 1,
            implementation: GzipImplementation::default(),
            block_size: 256 * KIB,
            concurrency: 0,
        }
    }
}

/// Zstandard encoder settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ZstdConfig {
    /// 1 to 22.
    pub level: i32,
    /// Worker count; 0 means available parallelism.
    pub concurrency: usize,
    /// Rounded up to the next power of two.
    pub window_size: usize,
}

impl Default for ZstdConfig {
    fn default() -> Self {
        Self {
            level: 3,
            concurrency: 0,
            window_size: MIB,
        }
    }
}

impl ZstdConfig {
    /// Base-2 logarithm of the window size rounded up to a power of two.
    pub fn window_log(&self) -> u32 {
        self.window_size
            .max(MIN_ZSTD_WINDOW_SIZE)
            .next_power_of_two()
            .trailing_zeros()
    }
}

/// Declarative compression settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Selected codec. The settings of the other codecs are ignored.
    #[serde(rename = "type")]
    pub kind: CompressionType,
    /// Used when `kind` is gzip.
    pub gzip: GzipConfig,
    /// Used when `kind` is zstd.
    pub zstd: ZstdConfig,
}

impl Config {
    /// No compression.
    pub fn none() -> Self {
        Self::default()
    }

    /// Gzip with default settings.
    pub fn gzip() -> Self {
        Self {
            kind: CompressionType::Gzip,
            ..Self::default()
        }
    }

    /// Zstandard with default settings.
    pub fn zstd() -> Self {
        Self {
            kind: CompressionType::Zstd,
            ..Self::default()
        }
    }

    /// Replace the gzip settings.
    pub fn with_gzip(self, gzip: GzipConfig) -> Self {
        Self { gzip, ..self }
    }

    /// Replace the zstd settings.
    pub fn with_zstd(self, zstd: ZstdConfig) -> Self {
        Self { zstd, ..self }
    }

    /// Check ranges of the settings used by the selected codec.
    pub fn validate(&self) -> Result<(), CompressionError> {
        match self.kind {
            CompressionType::None => Ok(()),
            CompressionType::Gzip => {
                let gzip = &self.gzip;
                if !(1..=9).contains(&gzip.level) {
                    return Err(CompressionError::Invalid(format!(
                        "gzip level {} is not in 1..=9",
                        gzip.level
                    )));
                }
                if !(MIN_GZIP_BLOCK_SIZE..=MAX_GZIP_BLOCK_SIZE).contains(&gzip.block_size) {
                    return Err(CompressionError::Invalid(format!(
                        "gzip block size {} is not in {}..={}",
                        gzip.block_size, MIN_GZIP_BLOCK_SIZE, MAX_GZIP_BLOCK_SIZE
                    )));
                }
                Ok(())
            }
            CompressionType::Zstd => {
                let zstd = &self.zstd;
                if !(1..=22).contains(&zstd.level) {
                    return Err(CompressionError::Invalid(format!(
                        "zstd level {} is not in 1..=22",
                        zstd.level
                    )));
                }
                if !(MIN_ZSTD_WINDOW_SIZE..=MAX_ZSTD_WINDOW_SIZE).contains(&zstd.window_size) {
                    return Err(CompressionError::Invalid(format!(
                        "zstd window size {} is not in {}..={}",
                        zstd.window_size, MIN_ZSTD_WINDOW_SIZE, MAX_ZSTD_WINDOW_SIZE
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Errors surfaced by codec configuration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompressionError {
    /// A setting is out of range.
    #[error("invalid compression config: {0}")]
    Invalid(String),
}

pub(crate) fn resolve_concurrency(concurrency: usize) -> usize {
    if concurrency > 0 {
        return concurrency;
    }
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    fn roundtrip(config: &Config, payload: &[u8]) -> Vec<u8> {
        let mut encoder = new_writer(Vec::new(), config)
            .expect("writer")
            .expect("codec layer");
        for chunk in payload.chunks(7_001) {
            encoder.write_all(chunk).expect("write");
        }
        let compressed = encoder.finish_into_inner().expect("finish");

        let mut decoder = new_reader(std::io::Cursor::new(compressed), config)
            .expect("reader")
            .expect("codec layer");
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).expect("read");
        out
    }

    fn payload() -> Vec<u8> {
        (0..300_000u32)
            .flat_map(|i| format!("{i},row-{}\n", i % 13).into_bytes())
            .collect()
    }

    #[test]
    fn none_declines_layer() {
        assert!(new_writer(Vec::new(), &Config::none())
            .expect("writer")
            .is_none());
        assert!(new_reader(&b""[..], &Config::none())
            .expect("reader")
            .is_none());
    }

    #[test]
    fn gzip_implementations_share_wire_format() {
        let data = payload();
        for implementation in [
            GzipImplementation::Standard,
            GzipImplementation::Fast,
            GzipImplementation::Parallel,
        ] {
            let config = Config::gzip().with_gzip(GzipConfig {
                implementation,
                block_size: MIN_GZIP_BLOCK_SIZE,
                concurrency: 3,
                ..GzipConfig::default()
            });
            config.validate().expect("valid");
            assert_eq!(roundtrip(&config, &data), data, "{implementation:?}");
        }
    }

    #[test]
    fn fast_gzip_ignores_level() {
        let data = payload();
        let compress = |implementation| {
            let config = Config::gzip().with_gzip(GzipConfig {
                level: 9,
                implementation,
                ..GzipConfig::default()
            });
            let mut encoder = new_writer(Vec::new(), &config)
                .expect("writer")
                .expect("codec layer");
            encoder.write_all(&data).expect("write");
            encoder.finish_into_inner().expect("finish")
        };
        let standard = compress(GzipImplementation::Standard);
        let fast = compress(GzipImplementation::Fast);
        // Header XFL byte: 2 for maximum compression, 4 for fastest.
        assert_eq!(standard[8], 2);
        assert_eq!(fast[8], 4);
        let mut decoded = Vec::new();
        new_reader(std::io::Cursor::new(fast), &Config::gzip())
            .expect("reader")
            .expect("codec layer")
            .read_to_end(&mut decoded)
            .expect("decode");
        assert_eq!(decoded, data);
    }

    #[test]
    fn incompressible_payload_roundtrip() {
        let mut rng = fastrand::Rng::with_seed(7);
        let data = (0..200_000).map(|_| rng.u8(..)).collect::<Vec<_>>();
        for config in [Config::gzip(), Config::zstd()] {
            assert_eq!(roundtrip(&config, &data), data, "{:?}", config.kind);
        }
    }

    #[test]
    fn parallel_gzip_empty_stream_is_valid() {
        let config = Config::gzip();
        assert!(roundtrip(&config, b"").is_empty());
    }

    #[test]
    fn zstd_roundtrip() {
        let data = payload();
        let config = Config::zstd().with_zstd(ZstdConfig {
            concurrency: 2,
            window_size: 100_000,
            ..ZstdConfig::default()
        });
        assert_eq!(config.zstd.window_log(), 17);
        assert_eq!(roundtrip(&config, &data), data);
    }

    #[test]
    fn validate_rejects_out_of_range() {
        let bad_level = Config::gzip().with_gzip(GzipConfig {
            level: 10,
            ..GzipConfig::default()
        });
        assert!(bad_level.validate().is_err());
        let bad_block = Config::gzip().with_gzip(GzipConfig {
            block_size: 1,
            ..GzipConfig::default()
        });
        assert!(bad_block.validate().is_err());
        let bad_window = Config::zstd().with_zstd(ZstdConfig {
            window_size: 1,
            ..ZstdConfig::default()
        });
        assert!(bad_window.validate().is_err());
    }

    #[test]
    fn unknown_type_fails_at_load() {
        let err = serde_json::from_str::<Config>(r#"{"type":"brotli"}"#);
        assert!(err.is_err());
        let parsed: Config =
            serde_json::from_str(r#"{"type":"gzip","gzip":{"implementation":"fast"}}"#)
                .expect("parse");
        assert_eq!(parsed.kind, CompressionType::Gzip);
        assert_eq!(parsed.gzip.implementation, GzipImplementation::Fast);
        assert_eq!(parsed.gzip.block_size, 256 * KIB);
    }
}
