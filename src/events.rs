//! Open/close listener registries.
//!
//! An [`Events`] value owns an ordered list of handlers and optionally points
//! at a parent registry. Writers and readers get a child of their volume's
//! registry, so a listener registered on the volume also fires for every
//! writer or reader the volume opens.

use std::{
    error::Error as StdError,
    fmt,
    sync::{Arc, Mutex},
};

use crate::error::{BoxError, MultiError};

type OpenHandler<T> = Arc<dyn Fn(&T) -> Result<(), BoxError> + Send + Sync>;
type CloseHandler<T> =
    Arc<dyn Fn(&T, Option<&(dyn StdError + Send + Sync)>) -> Result<(), BoxError> + Send + Sync>;

struct Handlers<T> {
    on_open: Vec<OpenHandler<T>>,
    on_close: Vec<CloseHandler<T>>,
}

/// Ordered, cloneable listener registry.
pub struct Events<T> {
    handlers: Arc<Mutex<Handlers<T>>>,
    parent: Option<Box<Events<T>>>,
}

impl<T> Events<T> {
    /// Create a root registry.
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(Handlers {
                on_open: Vec::new(),
                on_close: Vec::new(),
            })),
            parent: None,
        }
    }

    /// Create an empty registry whose dispatch continues into `self`.
    pub fn child(&self) -> Self {
        Self {
            parent: Some(Box::new(self.clone())),
            ..Self::new()
        }
    }

    /// Register a handler invoked when a resource opens. A failing handler
    /// aborts the open.
    pub fn on_open<F>(&self, f: F)
    where
        F: Fn(&T) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.lock().on_open.push(Arc::new(f));
    }

    /// Register a handler invoked when a resource closes. It receives the
    /// close error, if any.
    pub fn on_close<F>(&self, f: F)
    where
        F: Fn(&T, Option<&(dyn StdError + Send + Sync)>) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.lock().on_close.push(Arc::new(f));
    }

    /// Invoke open handlers, last registered first, then the parent's.
    pub fn dispatch_open(&self, subject: &T) -> Result<(), MultiError> {
        let mut errs = MultiError::new();
        let mut current = Some(self);
        while let Some(events) = current {
            let handlers = events.lock().on_open.clone();
            for handler in handlers.iter().rev() {
                if let Err(err) = handler(subject) {
                    errs.push(err);
                }
            }
            current = events.parent.as_deref();
        }
        errs.into_result()
    }

    /// Invoke close handlers, last registered first, then the parent's.
    pub fn dispatch_close(
        &self,
        subject: &T,
        close_err: Option<&(dyn StdError + Send + Sync)>,
    ) -> Result<(), MultiError> {
        let mut errs = MultiError::new();
        let mut current = Some(self);
        while let Some(events) = current {
            let handlers = events.lock().on_close.clone();
            for handler in handlers.iter().rev() {
                if let Err(err) = handler(subject, close_err) {
                    errs.push(err);
                }
            }
            current = events.parent.as_deref();
        }
        errs.into_result()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Handlers<T>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> Clone for Events<T> {
    fn clone(&self) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
            parent: self.parent.clone(),
        }
    }
}

impl<T> Default for Events<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Events<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.lock();
        f.debug_struct("Events")
            .field("on_open", &handlers.on_open.len())
            .field("on_close", &handlers.on_close.len())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}
