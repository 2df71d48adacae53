use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
};

use super::{COMPRESSED_SIZE_FILE, ROWS_COUNT_FILE, UNCOMPRESSED_SIZE_FILE};

/// Counter whose value is restored from and saved to a small file.
#[derive(Debug)]
pub struct BackupCounter {
    path: PathBuf,
    value: AtomicU64,
}

impl BackupCounter {
    /// Load the counter from `path`, starting at zero if the file is missing.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let value = match fs::read_to_string(&path) {
            Ok(content) => {
                let content = content.trim();
                if content.is_empty() {
                    0
                } else {
                    content.parse::<u64>().map_err(|err| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("invalid counter backup \"{}\": {err}", path.display()),
                        )
                    })?
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err),
        };
        Ok(Self {
            path,
            value: AtomicU64::new(value),
        })
    }

    /// Add `n` and return the new value.
    pub fn add(&self, n: u64) -> u64 {
        self.value.fetch_add(n, Ordering::AcqRel) + n
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Backup file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the current value, replacing the file atomically.
    pub fn backup(&self) -> io::Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, self.get().to_string())?;
        fs::rename(&tmp, &self.path)
    }
}

/// Snapshot of a writer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Rows written through `write_row`.
    pub rows: u64,
    /// Bytes accepted before compression.
    pub uncompressed_bytes: u64,
    /// Bytes produced by compression, or the raw bytes without it.
    pub compressed_bytes: u64,
}

/// The three counters kept in a slice directory.
#[derive(Debug, Clone)]
pub struct SliceCounters {
    /// Backed by [`ROWS_COUNT_FILE`](super::ROWS_COUNT_FILE).
    pub rows: Arc<BackupCounter>,
    /// Backed by [`UNCOMPRESSED_SIZE_FILE`](super::UNCOMPRESSED_SIZE_FILE).
    pub uncompressed: Arc<BackupCounter>,
    /// Backed by [`COMPRESSED_SIZE_FILE`](super::COMPRESSED_SIZE_FILE).
    pub compressed: Arc<BackupCounter>,
}

impl SliceCounters {
    /// Load the counters kept in `slice_dir`.
    pub fn open(slice_dir: &Path) -> io::Result<Self> {
        Ok(Self {
            rows: Arc::new(BackupCounter::open(slice_dir.join(ROWS_COUNT_FILE))?),
            uncompressed: Arc::new(BackupCounter::open(
                slice_dir.join(UNCOMPRESSED_SIZE_FILE),
            )?),
            compressed: Arc::new(BackupCounter::open(slice_dir.join(COMPRESSED_SIZE_FILE))?),
        })
    }

    /// Back up all counters, attempting each even if one fails.
    pub fn backup(&self) -> io::Result<()> {
        let results = [
            self.rows.backup(),
            self.uncompressed.backup(),
            self.compressed.backup(),
        ];
        results.into_iter().collect()
    }

    /// Snapshot of the current values.
    pub fn statistics(&self) -> Statistics {
        Statistics {
            rows: self.rows.get(),
            uncompressed_bytes: self.uncompressed.get(),
            compressed_bytes: self.compressed.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let counters = SliceCounters::open(dir.path()).expect("open");
        counters.rows.add(2);
        counters.uncompressed.add(100);
        counters.compressed.add(40);
        counters.backup().expect("backup");

        let reopened = SliceCounters::open(dir.path()).expect("reopen");
        assert_eq!(
            reopened.statistics(),
            Statistics {
                rows: 2,
                uncompressed_bytes: 100,
                compressed_bytes: 40,
            }
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join(ROWS_COUNT_FILE)).expect("read"),
            "2"
        );
    }

    #[test]
    fn corrupted_backup_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(ROWS_COUNT_FILE);
        std::fs::write(&path, "abc").expect("write");
        let err = BackupCounter::open(&path).expect_err("invalid");
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
