//! Common test utilities for integration tests.
#![allow(dead_code)]

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Barrier,
    },
    time::{Duration, Instant},
};

use slicestore::{
    chain::{OsFile, SliceFile},
    compression,
    diskalloc::Allocator,
    disksync,
    writer::FileOpener,
    Slice, SliceKey, VolumeId, VolumeSpec,
};

/// Create `<root>/<volume_type>/<label>` and describe it.
pub fn volume_spec(root: &Path, volume_type: &str, label: &str) -> VolumeSpec {
    let path = root.join(volume_type).join(label);
    std::fs::create_dir_all(&path).expect("create volume dir");
    VolumeSpec::new("my-node", path, volume_type, label)
}

pub fn slice_key(volume_id: &VolumeId, slice_id: &str) -> SliceKey {
    SliceKey {
        project_id: "123".into(),
        source_id: "my-source".into(),
        sink_id: "my-sink".into(),
        file_id: "my-file".into(),
        volume_id: volume_id.clone(),
        slice_id: slice_id.into(),
    }
}

pub fn test_slice(volume_id: &VolumeId, slice_id: &str) -> Slice {
    Slice {
        key: slice_key(volume_id, slice_id),
        dir: PathBuf::from(format!("my-file/{slice_id}")),
        filename: "slice.csv".into(),
        allocated_disk_space: 0,
        local_compression: compression::Config::none(),
        staging_compression: compression::Config::none(),
        sync: disksync::Config::default(),
    }
}

/// Opens real files whose `close` fails after releasing the handle.
pub struct FailingCloseOpener;

struct FailingCloseFile(OsFile);

impl FileOpener for FailingCloseOpener {
    fn open_file(&self, path: &Path) -> io::Result<Arc<dyn SliceFile>> {
        Ok(Arc::new(FailingCloseFile(OsFile::open_append(path)?)))
    }
}

impl SliceFile for FailingCloseFile {
    fn name(&self) -> String {
        self.0.name()
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn sync(&self) -> io::Result<()> {
        self.0.sync()
    }

    fn close(&self) -> io::Result<()> {
        self.0.close()?;
        Err(io::Error::other("some close error"))
    }
}

/// Like [`FailingCloseOpener`], but `open_file` first meets the test at
/// `entered` and then blocks on `release`.
pub struct GatedOpener {
    pub entered: Barrier,
    pub release: Barrier,
}

impl GatedOpener {
    pub fn new() -> Self {
        Self {
            entered: Barrier::new(2),
            release: Barrier::new(2),
        }
    }
}

impl FileOpener for GatedOpener {
    fn open_file(&self, path: &Path) -> io::Result<Arc<dyn SliceFile>> {
        self.entered.wait();
        self.release.wait();
        FailingCloseOpener.open_file(path)
    }
}

/// Opens real files whose writes hold until `released` is set and fail if
/// that takes longer than a second.
#[derive(Default)]
pub struct HeldWriteOpener {
    pub released: Arc<AtomicBool>,
}

struct HeldWriteFile {
    file: OsFile,
    released: Arc<AtomicBool>,
}

impl FileOpener for HeldWriteOpener {
    fn open_file(&self, path: &Path) -> io::Result<Arc<dyn SliceFile>> {
        Ok(Arc::new(HeldWriteFile {
            file: OsFile::open_append(path)?,
            released: Arc::clone(&self.released),
        }))
    }
}

impl SliceFile for HeldWriteFile {
    fn name(&self) -> String {
        self.file.name()
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let deadline = Instant::now() + Duration::from_secs(1);
        while !self.released.load(Ordering::SeqCst) {
            if Instant::now() > deadline {
                return Err(io::Error::other("write was never released"));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.file.write(buf)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync()
    }

    fn close(&self) -> io::Result<()> {
        self.file.close()
    }
}

/// Records requested sizes instead of touching the disk.
#[derive(Default)]
pub struct RecordingAllocator {
    pub requested: AtomicU64,
}

impl RecordingAllocator {
    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::SeqCst)
    }
}

impl Allocator for RecordingAllocator {
    fn allocate(&self, _file: &File, size: u64) -> io::Result<bool> {
        self.requested.fetch_add(size, Ordering::SeqCst);
        Ok(true)
    }

    fn used_space(&self, _path: &Path) -> io::Result<u64> {
        Ok(1)
    }

    fn total_space(&self, _path: &Path) -> io::Result<u64> {
        Ok(2)
    }
}
