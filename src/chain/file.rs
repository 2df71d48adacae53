use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard},
};

/// Base file handle at the bottom of a chain.
///
/// All methods take `&self`; a chain serialises access to its layers, while
/// `sync` may run concurrently with writes that land in upper layers.
pub trait SliceFile: Send + Sync + 'static {
    /// Path or other name used in errors and dumps.
    fn name(&self) -> String;

    /// Read at the current position, like [`Read::read`].
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Append bytes, like [`Write::write`].
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Persist written bytes to the physical disk.
    fn sync(&self) -> io::Result<()>;

    /// Release the handle. Later calls on the file fail.
    fn close(&self) -> io::Result<()>;

    /// Copy the remaining content to `dst` without intermediate layers.
    fn copy_to(&self, dst: &mut dyn Write) -> io::Result<u64> {
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = self.read(&mut buf)?;
            if n == 0 {
                return Ok(total);
            }
            dst.write_all(&buf[..n])?;
            total += n as u64;
        }
    }

    /// Underlying OS file, if any. Used for space pre-allocation.
    fn with_os_file(&self, f: &mut dyn FnMut(&File) -> io::Result<bool>) -> io::Result<bool> {
        let _ = f;
        Ok(false)
    }
}

/// [`SliceFile`] backed by an OS file.
#[derive(Debug)]
pub struct OsFile {
    path: PathBuf,
    file: RwLock<Option<File>>,
}

impl OsFile {
    /// Open for appending, creating the file if missing.
    pub fn open_append(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self::from_file(path, file))
    }

    /// Open read-only.
    pub fn open_read(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Ok(Self::from_file(path, file))
    }

    /// Wrap an already opened file.
    pub fn from_file(path: impl Into<PathBuf>, file: File) -> Self {
        Self {
            path: path.into(),
            file: RwLock::new(Some(file)),
        }
    }

    /// Path the file was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn handle(&self) -> io::Result<RwLockReadGuard<'_, Option<File>>> {
        let guard = self
            .file
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_none() {
            return Err(closed_error(&self.path));
        }
        Ok(guard)
    }
}

fn closed_error(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        format!("file \"{}\" is already closed", path.display()),
    )
}

impl SliceFile for OsFile {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let guard = self.handle()?;
        match guard.as_ref() {
            Some(mut file) => file.read(buf),
            None => Err(closed_error(&self.path)),
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let guard = self.handle()?;
        match guard.as_ref() {
            Some(mut file) => file.write(buf),
            None => Err(closed_error(&self.path)),
        }
    }

    fn sync(&self) -> io::Result<()> {
        let guard = self.handle()?;
        match guard.as_ref() {
            Some(file) => file.sync_data(),
            None => Err(closed_error(&self.path)),
        }
    }

    fn close(&self) -> io::Result<()> {
        let mut guard = self
            .file
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.take() {
            Some(file) => {
                drop(file);
                Ok(())
            }
            None => Err(closed_error(&self.path)),
        }
    }

    fn copy_to(&self, dst: &mut dyn Write) -> io::Result<u64> {
        let guard = self.handle()?;
        match guard.as_ref() {
            Some(mut file) => io::copy(&mut file, dst),
            None => Err(closed_error(&self.path)),
        }
    }

    fn with_os_file(&self, f: &mut dyn FnMut(&File) -> io::Result<bool>) -> io::Result<bool> {
        let guard = self.handle()?;
        match guard.as_ref() {
            Some(file) => f(file),
            None => Err(closed_error(&self.path)),
        }
    }
}
