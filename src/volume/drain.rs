//! Drain marker monitoring.
//!
//! The marker's presence is checked when the volume opens. While the volume
//! is open, directory change notifications re-check it; if notifications
//! cannot be set up the startup value is kept.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::Level;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::logging::{slicestore_log, LogContext};

/// Shared drain flag of one volume.
#[derive(Debug, Clone)]
pub(crate) struct DrainFlag {
    path: PathBuf,
    drained: Arc<AtomicBool>,
}

impl DrainFlag {
    pub(crate) fn new(path: PathBuf) -> Self {
        let drained = Arc::new(AtomicBool::new(path.exists()));
        Self { path, drained }
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.drained.load(Ordering::Acquire)
    }

    /// Re-check the marker; returns the new state when it changed.
    pub(crate) fn refresh(&self) -> Option<bool> {
        let drained = self.path.exists();
        let previous = self.drained.swap(drained, Ordering::AcqRel);
        (previous != drained).then_some(drained)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

/// Watch `flag` until `cancel` fires. Falls back to the startup value when
/// the watch cannot be set up.
pub(crate) fn watch(
    flag: DrainFlag,
    dir: &Path,
    cancel: CancellationToken,
    tracker: &TaskTracker,
    ctx: LogContext,
) {
    match sys::Watcher::new(dir) {
        Ok(watcher) => {
            tracker.spawn(run(watcher, flag, cancel, ctx));
        }
        Err(err) => {
            slicestore_log!(
                Level::Warn,
                ctx: ctx,
                "drain_watch_fallback",
                "cannot watch drain file \"{}\", checked only at startup: {}",
                flag.path().display(),
                err
            );
        }
    }
}

async fn run(mut watcher: sys::Watcher, flag: DrainFlag, cancel: CancellationToken, ctx: LogContext) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = watcher.changed() => {
                if let Err(err) = changed {
                    slicestore_log!(
                        Level::Warn,
                        ctx: ctx,
                        "drain_watch_fallback",
                        "drain file watch failed, keeping last state: {}",
                        err
                    );
                    return;
                }
                match flag.refresh() {
                    Some(true) => slicestore_log!(Level::Info, ctx: ctx, "drain_changed", "volume drained"),
                    Some(false) => slicestore_log!(Level::Info, ctx: ctx, "drain_changed", "volume undrained"),
                    None => {}
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use std::{
        io,
        os::fd::{AsFd, AsRawFd, RawFd},
        path::Path,
    };

    use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
    use tokio::io::unix::AsyncFd;

    struct InotifyFd(Inotify);

    impl AsRawFd for InotifyFd {
        fn as_raw_fd(&self) -> RawFd {
            self.0.as_fd().as_raw_fd()
        }
    }

    pub(super) struct Watcher {
        fd: AsyncFd<InotifyFd>,
    }

    impl Watcher {
        pub(super) fn new(dir: &Path) -> io::Result<Self> {
            let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
            inotify.add_watch(
                dir,
                AddWatchFlags::IN_CREATE
                    | AddWatchFlags::IN_DELETE
                    | AddWatchFlags::IN_MOVED_FROM
                    | AddWatchFlags::IN_MOVED_TO,
            )?;
            Ok(Self {
                fd: AsyncFd::new(InotifyFd(inotify))?,
            })
        }

        /// Wait for the next batch of directory changes.
        pub(super) async fn changed(&mut self) -> io::Result<()> {
            loop {
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|fd| fd.get_ref().0.read_events().map_err(io::Error::from)) {
                    Ok(events) => {
                        events?;
                        return Ok(());
                    }
                    Err(_would_block) => continue,
                }
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::{io, path::Path};

    pub(super) struct Watcher;

    impl Watcher {
        pub(super) fn new(_dir: &Path) -> io::Result<Self> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "file change notifications are not supported on this platform",
            ))
        }

        pub(super) async fn changed(&mut self) -> io::Result<()> {
            std::future::pending().await
        }
    }
}
