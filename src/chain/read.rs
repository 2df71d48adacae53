use std::{
    collections::VecDeque,
    io::{self, Read},
    sync::{Arc, Mutex},
};

use super::{dump, lock, run_closers, ChainError, Closer, SliceFile};

/// A reader layer that can be placed into a [`ReadChain`].
pub trait ReadLayer: Read + Send {
    /// Name shown in dumps and close errors.
    fn name(&self) -> &str;

    /// Release resources held by the layer. Called once, when the chain
    /// closes.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

type SharedLayer = Arc<Mutex<Box<dyn ReadLayer>>>;

#[derive(Clone)]
enum LinkTarget {
    File(Arc<dyn SliceFile>),
    Layer(SharedLayer),
}

/// Handle to the next layer down, given to a layer factory.
#[derive(Clone)]
pub struct ReadLink {
    target: LinkTarget,
}

impl Read for ReadLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.target {
            LinkTarget::File(file) => file.read(buf),
            LinkTarget::Layer(layer) => lock(layer).read(buf),
        }
    }
}

struct ReadState {
    beginning: ReadLink,
    layers: VecDeque<String>,
    closers: VecDeque<Closer>,
    closed: bool,
}

/// Ordered stack of reader layers over a [`SliceFile`].
pub struct ReadChain {
    file: Arc<dyn SliceFile>,
    state: Mutex<ReadState>,
}

impl ReadChain {
    /// Chain with no layers; reads go straight to `file`.
    pub fn new(file: Arc<dyn SliceFile>) -> Self {
        let beginning = ReadLink {
            target: LinkTarget::File(Arc::clone(&file)),
        };
        Self {
            file,
            state: Mutex::new(ReadState {
                beginning,
                layers: VecDeque::new(),
                closers: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Prepend a layer built from the current outermost link. The factory may
    /// decline by returning `None`. Returns whether a layer was added.
    pub fn prepend_reader<L, F>(&self, factory: F) -> io::Result<bool>
    where
        L: ReadLayer + 'static,
        F: FnOnce(ReadLink) -> io::Result<Option<L>>,
    {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(ChainError::Closed.into());
        }
        let Some(layer) = factory(state.beginning.clone())? else {
            return Ok(false);
        };
        let name = layer.name().to_string();
        let shared: SharedLayer = Arc::new(Mutex::new(Box::new(layer)));
        let closing = Arc::clone(&shared);
        state.closers.push_front(Closer::new(
            name.clone(),
            Box::new(move || lock(&closing).close()),
        ));
        state.layers.push_front(name);
        state.beginning = ReadLink {
            target: LinkTarget::Layer(shared),
        };
        Ok(true)
    }

    /// Run `f` before every closer registered so far.
    pub fn prepend_close_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce() -> io::Result<()> + Send + 'static,
    {
        lock(&self.state)
            .closers
            .push_front(Closer::new(name, Box::new(f)));
    }

    /// Run `f` after every closer registered so far, but before the file closes.
    pub fn append_close_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce() -> io::Result<()> + Send + 'static,
    {
        lock(&self.state)
            .closers
            .push_back(Closer::new(name, Box::new(f)));
    }

    /// Read from the outermost layer.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(ChainError::Closed.into());
        }
        state.beginning.read(buf)
    }

    /// The base file, if no layer was ever added to the chain.
    pub fn unwrap_file(&self) -> Option<Arc<dyn SliceFile>> {
        let state = lock(&self.state);
        if state.closed || !state.layers.is_empty() {
            return None;
        }
        Some(Arc::clone(&self.file))
    }

    /// Run all closers front-first, then close the file.
    pub fn close(&self) -> Result<(), ChainError> {
        let closers = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(ChainError::Closed);
            }
            state.closed = true;
            state.closers.drain(..).collect::<Vec<_>>()
        };
        run_closers(closers, self.file.as_ref(), false).map_err(ChainError::Close)
    }

    /// Debug listing of layers and closers in the order they run.
    pub fn dump(&self) -> String {
        let state = lock(&self.state);
        let layers = state.layers.iter().cloned().collect::<Vec<_>>();
        let closers = state.closers.iter().map(|c| c.name.clone()).collect::<Vec<_>>();
        dump("Readers", &layers, &self.file.name(), &closers)
    }
}
