//! Node runtime shared by sources, transformations and destinations.

use crate::completion::{Completion, CompletionSource};
use crate::error::{FlowError, FlowResult};
use crate::port::InputPort;
use crate::settings::FlowSettings;
use arcstr::ArcStr;
use async_trait::async_trait;
use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinError;
use tracing::{error, info, warn};

/// Base trait for all dataflow nodes
///
/// A node owns a [`NodeCore`] (name, completion, progress) and knows how to
/// start itself: open its input buffer, start every node it links to, and
/// spawn its driver task.
#[async_trait]
pub trait Node: Send + Sync + 'static {
    fn core(&self) -> &NodeCore;

    /// Opens buffers, starts linked targets and spawns the driver.
    ///
    /// Idempotent. Must be called from within a tokio runtime. Sources are
    /// started through `execute`; everything downstream is started by the
    /// node that links to it.
    fn start(&self);

    /// Returns the unique name of this node
    ///
    /// Used for logging and in error records.
    fn name(&self) -> &ArcStr {
        self.core().name()
    }

    fn completion(&self) -> Completion {
        self.core().completion()
    }

    /// Waits until this node and its upstream graph have drained.
    async fn wait(&self) -> FlowResult<()> {
        self.completion().wait().await
    }

    /// Bounds the input buffer; `None` means unbounded. Nodes without an
    /// input accept and ignore the call.
    fn set_bounded_capacity(&self, capacity: Option<usize>) -> FlowResult<()> {
        let _ = capacity;
        Ok(())
    }

    /// Applies pipeline-wide settings before the node starts.
    fn configure(&self, settings: &FlowSettings) -> FlowResult<()> {
        self.core().set_progress_every(settings.progress_every);
        self.set_bounded_capacity(settings.bounded_capacity)
    }
}

/// A node that accepts rows of type `T` on an input port.
pub trait Target<T: Send + 'static>: Node + Clone {
    fn input(&self) -> &InputPort<T>;

    /// Builder form of [`Node::set_bounded_capacity`] for freshly built nodes.
    fn with_bounded_capacity(self, capacity: usize) -> Self {
        if let Err(e) = self.set_bounded_capacity(Some(capacity)) {
            warn!(node = %self.name(), error = %e, "bounded capacity ignored");
        }
        self
    }
}

/// One of several named inputs of a multi-input node, e.g. the `left` and
/// `right` side of a merge join. Linking to it links to the owning node.
pub struct NamedPort<N, T> {
    node: N,
    port: InputPort<T>,
}

impl<N: Clone, T> Clone for NamedPort<N, T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            port: self.port.clone(),
        }
    }
}

impl<N, T> NamedPort<N, T>
where
    N: Node + Clone,
    T: Send + 'static,
{
    pub fn new(node: N, port: InputPort<T>) -> Self {
        Self { node, port }
    }
}

#[async_trait]
impl<N, T> Node for NamedPort<N, T>
where
    N: Node + Clone,
    T: Send + 'static,
{
    fn core(&self) -> &NodeCore {
        self.node.core()
    }

    fn start(&self) {
        self.node.start();
    }

    fn set_bounded_capacity(&self, capacity: Option<usize>) -> FlowResult<()> {
        self.port.set_capacity(capacity)
    }
}

impl<N, T> Target<T> for NamedPort<N, T>
where
    N: Node + Clone,
    T: Send + 'static,
{
    fn input(&self) -> &InputPort<T> {
        &self.port
    }
}

/// Name, completion and progress bookkeeping of one node.
#[derive(Debug)]
pub struct NodeCore {
    name: ArcStr,
    completion: Arc<CompletionSource>,
    started: AtomicBool,
    progress: Progress,
}

impl NodeCore {
    pub fn new(name: impl Into<ArcStr>) -> Self {
        let name = name.into();
        Self {
            completion: Arc::new(CompletionSource::new(name.clone())),
            progress: Progress::new(name.clone()),
            started: AtomicBool::new(false),
            name,
        }
    }

    pub fn name(&self) -> &ArcStr {
        &self.name
    }

    pub fn completion(&self) -> Completion {
        self.completion.subscribe()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Claims the right to start. True exactly once.
    pub fn begin_start(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    pub fn set_progress_every(&self, every: Option<u64>) {
        self.progress.every.store(every.unwrap_or(0), Ordering::Relaxed);
    }

    pub fn progress(&self) -> Progress {
        self.progress.clone()
    }

    /// Rows processed so far.
    pub fn processed(&self) -> u64 {
        self.progress.count.load(Ordering::Relaxed)
    }

    /// Runs `driver` as this node's processing task and resolves the
    /// completion with its outcome. Panics are reported as faults.
    pub fn spawn<F>(&self, driver: F)
    where
        F: Future<Output = FlowResult<()>> + Send + 'static,
    {
        let name = self.name.clone();
        let completion = self.completion.clone();
        completion.set_running();
        info!(node = %name, "node started");

        let handle = tokio::spawn(driver);
        tokio::spawn(async move {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(FlowError::Panicked {
                    node: name.clone(),
                    message: panic_message(e),
                }),
            };
            match &result {
                Ok(()) => info!(node = %name, "node completed"),
                Err(e) => error!(node = %name, error = %e, "node faulted"),
            }
            completion.finish(result);
        });
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Processed-row counter with optional periodic logging.
#[derive(Debug, Clone)]
pub struct Progress {
    node: ArcStr,
    count: Arc<AtomicU64>,
    every: Arc<AtomicU64>,
}

impl Progress {
    fn new(node: ArcStr) -> Self {
        Self {
            node,
            count: Arc::new(AtomicU64::new(0)),
            every: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn add(&self, rows: u64) {
        if rows == 0 {
            return;
        }
        let before = self.count.fetch_add(rows, Ordering::Relaxed);
        let every = self.every.load(Ordering::Relaxed);
        if every > 0 && before / every != (before + rows) / every {
            info!(node = %self.node, rows = before + rows, "progress");
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}
