//! Disk space pre-allocation and usage introspection.
//!
//! Allocation is an optimisation: platforms without sparse pre-allocation
//! report `Ok(false)` and callers carry on.

mod sys;

use std::{fs::File, io, path::Path};

use serde::{Deserialize, Serialize};

const MB: u64 = 1_000_000;

/// Capability interface over the platform's allocation and usage calls.
pub trait Allocator: Send + Sync {
    /// Reserve `size` bytes for `file` without changing its reported length.
    /// Returns `Ok(false)` when the platform has no support.
    fn allocate(&self, file: &File, size: u64) -> io::Result<bool>;

    /// Bytes used on the filesystem holding `path`.
    fn used_space(&self, path: &Path) -> io::Result<u64>;

    /// Total bytes of the filesystem holding `path`.
    fn total_space(&self, path: &Path) -> io::Result<u64>;
}

/// [`Allocator`] selected for the build target.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAllocator;

impl Allocator for DefaultAllocator {
    fn allocate(&self, file: &File, size: u64) -> io::Result<bool> {
        sys::allocate(file, size)
    }

    fn used_space(&self, path: &Path) -> io::Result<u64> {
        sys::used_space(path)
    }

    fn total_space(&self, path: &Path) -> io::Result<u64> {
        sys::total_space(path)
    }
}

/// Bytes actually reserved on disk for `path`, which may exceed its length.
pub fn allocated(path: impl AsRef<Path>) -> io::Result<u64> {
    sys::allocated(path.as_ref())
}

/// Sizing policy of the space reserved for a new slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// When false, new slices get no reservation.
    pub enabled: bool,
    /// Bytes reserved when there is no previous slice or `relative` is 0.
    #[serde(rename = "static")]
    pub static_size: u64,
    /// Percentage of the previous slice size; 0 disables relative sizing.
    pub relative: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            static_size: 100 * MB,
            relative: 110,
        }
    }
}

impl Config {
    /// Policy that never reserves space.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Replace the static size.
    pub fn with_static_size(self, static_size: u64) -> Self {
        Self {
            static_size,
            ..self
        }
    }

    /// Replace the relative percentage.
    pub fn with_relative(self, relative: u32) -> Self {
        Self { relative, ..self }
    }

    /// `relative` must be 0 or within 100..=500 percent.
    pub fn validate(&self) -> Result<(), AllocError> {
        if self.relative != 0 && !(100..=500).contains(&self.relative) {
            return Err(AllocError::Invalid(format!(
                "relative {} must be 0 or in 100..=500",
                self.relative
            )));
        }
        Ok(())
    }

    /// Bytes to reserve for the next slice, given the size of the previous one.
    pub fn for_next_slice(&self, previous_slice_size: Option<u64>) -> u64 {
        if !self.enabled {
            return 0;
        }
        match previous_slice_size {
            Some(prev) if self.relative > 0 => {
                prev.saturating_mul(u64::from(self.relative)) / 100
            }
            _ => self.static_size,
        }
    }
}

/// Errors surfaced by allocation configuration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AllocError {
    /// `relative` is out of range.
    #[error("invalid allocation config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;

    use super::*;

    #[test]
    fn sizing_policy() {
        let config = Config::default().with_relative(150).with_static_size(10_000);
        assert_eq!(config.for_next_slice(None), 10_000);
        assert_eq!(config.for_next_slice(Some(1_000_000)), 1_500_000);

        let static_only = config.clone().with_relative(0);
        assert_eq!(static_only.for_next_slice(Some(1_000_000)), 10_000);
        assert_eq!(Config::disabled().for_next_slice(Some(5)), 0);
    }

    #[test]
    fn relative_range() {
        assert!(Config::default().with_relative(0).validate().is_ok());
        assert!(Config::default().with_relative(500).validate().is_ok());
        assert!(Config::default().with_relative(99).validate().is_err());
        assert!(Config::default().with_relative(501).validate().is_err());
    }

    #[test]
    fn allocate_keeps_file_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("file");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .expect("open");
        let size = 64 * 1024;
        let ok = DefaultAllocator.allocate(&file, size).unwrap_or(false);
        assert_eq!(file.metadata().expect("metadata").len(), 0);
        if ok {
            assert!(allocated(&path).expect("allocated") >= size);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn allocation_reserves_blocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("file");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .expect("open");
        let size = 1024 * 1024;
        // tmpfs and some overlay setups reject fallocate.
        match DefaultAllocator.allocate(&file, size) {
            Ok(true) => assert!(allocated(&path).expect("allocated") >= size),
            Ok(false) => panic!("linux allocation reported unsupported"),
            Err(err) => assert!(err.raw_os_error().is_some(), "{err}"),
        }
        assert_eq!(file.metadata().expect("metadata").len(), 0);
        assert!(DefaultAllocator.allocate(&file, 0).expect("empty"));
    }

    #[test]
    fn disk_usage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let total = DefaultAllocator.total_space(dir.path()).expect("total");
        let used = DefaultAllocator.used_space(dir.path()).expect("used");
        assert!(total > 0);
        assert!(used <= total);
    }
}
