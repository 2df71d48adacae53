use std::{
    collections::VecDeque,
    io::{self, Write},
    sync::{Arc, Mutex},
};

use super::{dump, lock, run_closers, ChainError, Closer, SliceFile};

/// A writer layer that can be placed into a [`WriteChain`].
pub trait WriteLayer: Write + Send {
    /// Name shown in dumps and close errors.
    fn name(&self) -> &str;

    /// Emit buffered bytes and trailers into the next layer. Called once,
    /// when the chain closes.
    fn finish(&mut self) -> io::Result<()> {
        self.flush()
    }
}

type SharedLayer = Arc<Mutex<Box<dyn WriteLayer>>>;

#[derive(Clone)]
enum LinkTarget {
    File(Arc<dyn SliceFile>),
    Layer(SharedLayer),
}

/// Handle to the next layer down, given to a layer factory.
///
/// Flushing a link is a no-op: the chain flushes every layer itself,
/// outermost first.
#[derive(Clone)]
pub struct WriteLink {
    target: LinkTarget,
}

impl Write for WriteLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.target {
            LinkTarget::File(file) => file.write(buf),
            LinkTarget::Layer(layer) => lock(layer).write(buf),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match &self.target {
            LinkTarget::File(file) => {
                let mut rest = buf;
                while !rest.is_empty() {
                    match file.write(rest) {
                        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                        Ok(n) => rest = &rest[n..],
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
            LinkTarget::Layer(layer) => lock(layer).write_all(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct WriteState {
    beginning: WriteLink,
    // Front is the outermost layer.
    layers: VecDeque<(String, SharedLayer)>,
    closers: VecDeque<Closer>,
    closed: bool,
}

/// Ordered stack of writer layers over a [`SliceFile`].
pub struct WriteChain {
    file: Arc<dyn SliceFile>,
    state: Mutex<WriteState>,
}

impl WriteChain {
    /// Chain with no layers; writes go straight to `file`.
    pub fn new(file: Arc<dyn SliceFile>) -> Self {
        let beginning = WriteLink {
            target: LinkTarget::File(Arc::clone(&file)),
        };
        Self {
            file,
            state: Mutex::new(WriteState {
                beginning,
                layers: VecDeque::new(),
                closers: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Prepend a layer built from the current outermost link. The factory may
    /// decline by returning `None`. Returns whether a layer was added.
    pub fn prepend_writer<L, F>(&self, factory: F) -> io::Result<bool>
    where
        L: WriteLayer + 'static,
        F: FnOnce(WriteLink) -> io::Result<Option<L>>,
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
        let finisher = Arc::clone(&shared);
        state.closers.push_front(Closer::new(
            name.clone(),
            Box::new(move || lock(&finisher).finish()),
        ));
        state.layers.push_front((name, Arc::clone(&shared)));
        state.beginning = WriteLink {
            target: LinkTarget::Layer(shared),
        };
        Ok(true)
    }

    /// Add a close callback that runs before all current closers.
    pub fn prepend_close_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce() -> io::Result<()> + Send + 'static,
    {
        lock(&self.state)
            .closers
            .push_front(Closer::new(name, Box::new(f)));
    }

    /// Add a close callback that runs after all current closers.
    pub fn append_close_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce() -> io::Result<()> + Send + 'static,
    {
        lock(&self.state)
            .closers
            .push_back(Closer::new(name, Box::new(f)));
    }

    /// Write the whole buffer into the outermost layer.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(ChainError::Closed.into());
        }
        state.beginning.write_all(buf)?;
        Ok(buf.len())
    }

    /// Push buffered bytes of every layer, outermost first, into the file.
    pub fn flush(&self) -> Result<(), ChainError> {
        let state = lock(&self.state);
        if state.closed {
            return Err(ChainError::Closed);
        }
        Self::flush_layers(&state)
    }

    /// Flush all layers, then persist the file. Writes may proceed while the
    /// file is being synced.
    pub fn sync(&self) -> Result<(), ChainError> {
        {
            let state = lock(&self.state);
            if state.closed {
                return Err(ChainError::Closed);
            }
            Self::flush_layers(&state)?;
        }
        self.file.sync().map_err(ChainError::Sync)
    }

    /// Run all closers front-first, then sync and close the file.
    pub fn close(&self) -> Result<(), ChainError> {
        let closers = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(ChainError::Closed);
            }
            state.closed = true;
            state.layers.clear();
            state.closers.drain(..).collect::<Vec<_>>()
        };
        run_closers(closers, self.file.as_ref(), true).map_err(ChainError::Close)
    }

    /// The base file.
    pub fn file(&self) -> &Arc<dyn SliceFile> {
        &self.file
    }

    /// Debug listing of layers and closers in the order they run.
    pub fn dump(&self) -> String {
        let state = lock(&self.state);
        let layers = state.layers.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>();
        let closers = state.closers.iter().map(|c| c.name.clone()).collect::<Vec<_>>();
        dump("Writers", &layers, &self.file.name(), &closers)
    }

    fn flush_layers(state: &WriteState) -> Result<(), ChainError> {
        for (_, layer) in state.layers.iter() {
            lock(layer).flush().map_err(ChainError::Flush)?;
        }
        Ok(())
    }
}
