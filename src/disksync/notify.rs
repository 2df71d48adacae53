use tokio::sync::watch;

use super::SyncError;

type Slot = Option<Result<(), SyncError>>;

/// Resolves once the sync covering a write has finished.
#[derive(Debug, Clone)]
pub struct Notifier {
    rx: watch::Receiver<Slot>,
}

impl Notifier {
    /// Wait for the sync result.
    pub async fn wait(mut self) -> Result<(), SyncError> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone().unwrap_or(Ok(())),
            Err(_) => Err(SyncError::NotifierDropped),
        }
    }

    /// True once the sync result is available.
    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

/// Completing side of a [`Notifier`].
#[derive(Debug)]
pub(crate) struct NotifierSender {
    tx: watch::Sender<Slot>,
}

impl NotifierSender {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub(crate) fn notifier(&self) -> Notifier {
        Notifier {
            rx: self.tx.subscribe(),
        }
    }

    pub(crate) fn done(self, result: Result<(), SyncError>) {
        self.tx.send_replace(Some(result));
    }
}
