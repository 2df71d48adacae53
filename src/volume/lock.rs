use std::{
    fmt,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
};

use super::VolumeError;
use crate::error::MultiError;

/// Role a volume is opened for. Each role has its own lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRole {
    /// Held by the writer side; one writer process per volume.
    Writer,
    /// Held by the reader side; independent of the writer lock.
    Reader,
}

impl LockRole {
    /// Lock file name inside the volume directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            LockRole::Writer => "writer.lock",
            LockRole::Reader => "reader.lock",
        }
    }
}

impl fmt::Display for LockRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockRole::Writer => "writer",
            LockRole::Reader => "reader",
        })
    }
}

/// Exclusive advisory lock on a volume directory.
///
/// The lock is tied to the open file description, so a second acquisition
/// fails even from the same process.
pub struct VolumeLock {
    role: LockRole,
    path: PathBuf,
    lock: Flock<File>,
}

impl fmt::Debug for VolumeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeLock")
            .field("role", &self.role)
            .field("path", &self.path)
            .finish()
    }
}

impl VolumeLock {
    /// Lock `role` on the volume at `dir` without blocking.
    pub fn acquire(dir: &Path, role: LockRole) -> Result<Self, VolumeError> {
        let path = dir.join(role.file_name());
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| VolumeError::Lock {
                role,
                path: path.clone(),
                source,
            })?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Self { role, path, lock }),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                Err(VolumeError::AlreadyLocked { role, path })
            }
            Err((_, errno)) => Err(VolumeError::Lock {
                role,
                path,
                source: errno.into(),
            }),
        }
    }

    /// Lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlock and remove the lock file.
    pub fn release(self) -> Result<(), MultiError> {
        let mut errs = MultiError::new();
        let Self { role, path, lock } = self;
        match lock.unlock() {
            Ok(file) => drop(file),
            Err((_, errno)) => errs.push_prefixed(
                format!("cannot release {role} lock \"{}\": ", path.display()),
                errno,
            ),
        }
        if let Err(err) = std::fs::remove_file(&path) {
            errs.push_prefixed(
                format!("cannot remove {role} lock \"{}\": ", path.display()),
                err,
            );
        }
        errs.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::{LockRole, VolumeLock};
    use crate::volume::VolumeError;

    #[test]
    fn second_acquire_fails_until_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = VolumeLock::acquire(dir.path(), LockRole::Writer).expect("lock");
        assert_eq!(
            format!("{lock:?}"),
            format!(
                "VolumeLock {{ role: Writer, path: {:?} }}",
                dir.path().join("writer.lock")
            )
        );
        let err = VolumeLock::acquire(dir.path(), LockRole::Writer).expect_err("locked");
        assert!(matches!(err, VolumeError::AlreadyLocked { .. }));
        assert_eq!(
            err.to_string(),
            format!(
                "cannot acquire writer lock \"{}\": already locked",
                dir.path().join("writer.lock").display()
            )
        );

        // Roles are independent.
        let reader = VolumeLock::acquire(dir.path(), LockRole::Reader).expect("reader lock");

        lock.release().expect("release");
        assert!(!dir.path().join("writer.lock").exists());
        VolumeLock::acquire(dir.path(), LockRole::Writer)
            .expect("lock again")
            .release()
            .expect("release");
        reader.release().expect("release");
    }
}
