//! Fan-out nodes: multicast and row duplication.

use arcstr::ArcStr;
use async_trait::async_trait;
use etlflow_core::{FlowResult, InputPort, Linkable, Node, NodeCore, Outbox, Target};
use std::sync::Arc;
use tracing::debug;

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Sends a copy of every row to each of its links.
///
/// Links with a keep predicate only receive the rows it accepts. A row that
/// no link accepts is dropped without notice.
pub struct Multicast<T> {
    inner: Arc<MulticastInner<T>>,
}

struct MulticastInner<T> {
    core: NodeCore,
    input: InputPort<T>,
    outbox: Outbox<T>,
}

impl<T> Clone for Multicast<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Multicast<T> {
    pub fn new(name: impl Into<ArcStr>) -> Self {
        let core = NodeCore::new(name);
        Self {
            inner: Arc::new(MulticastInner {
                input: InputPort::new(core.name().clone()),
                outbox: Outbox::new(core.name().clone()),
                core,
            }),
        }
    }
}

impl<T: Clone + Send + 'static> MulticastInner<T> {
    async fn run(&self) -> FlowResult<()> {
        let mut out = self.outbox.open()?;
        let mut inbox = self.input.take_inbox()?;
        let progress = self.core.progress();
        while let Some(row) = inbox.recv().await? {
            out.broadcast(row).await;
            progress.add(1);
        }
        if out.dropped() > 0 {
            debug!(node = %self.core.name(), rows = out.dropped(), "rows matched no link");
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> Node for Multicast<T> {
    fn core(&self) -> &NodeCore {
        &self.inner.core
    }

    fn start(&self) {
        if !self.inner.core.begin_start() {
            return;
        }
        self.inner.input.open(0);
        self.inner.outbox.start_targets();
        let inner = self.inner.clone();
        self.inner.core.spawn(async move { inner.run().await });
    }

    fn set_bounded_capacity(&self, capacity: Option<usize>) -> FlowResult<()> {
        self.inner.input.set_capacity(capacity)
    }
}

impl<T: Clone + Send + 'static> Target<T> for Multicast<T> {
    fn input(&self) -> &InputPort<T> {
        &self.inner.input
    }
}

impl<T: Clone + Send + 'static> Linkable<T> for Multicast<T> {
    fn outbox(&self) -> &Outbox<T> {
        &self.inner.outbox
    }
}

/// Emits every row followed by `copies` clones of it. With a predicate only
/// the rows it accepts are duplicated; the others pass through once.
pub struct RowDuplication<T> {
    inner: Arc<DuplicationInner<T>>,
}

struct DuplicationInner<T> {
    core: NodeCore,
    input: InputPort<T>,
    outbox: Outbox<T>,
    copies: usize,
    predicate: Option<Predicate<T>>,
}

impl<T> Clone for RowDuplication<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> RowDuplication<T> {
    /// One extra copy of every row.
    pub fn new(name: impl Into<ArcStr>) -> Self {
        Self::build(name, 1, None)
    }

    pub fn with_copies(name: impl Into<ArcStr>, copies: usize) -> Self {
        Self::build(name, copies, None)
    }

    pub fn with_predicate<P>(name: impl Into<ArcStr>, copies: usize, predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self::build(name, copies, Some(Arc::new(predicate)))
    }

    fn build(name: impl Into<ArcStr>, copies: usize, predicate: Option<Predicate<T>>) -> Self {
        let core = NodeCore::new(name);
        Self {
            inner: Arc::new(DuplicationInner {
                input: InputPort::new(core.name().clone()),
                outbox: Outbox::new(core.name().clone()),
                core,
                copies,
                predicate,
            }),
        }
    }
}

impl<T: Clone + Send + 'static> DuplicationInner<T> {
    async fn run(&self) -> FlowResult<()> {
        let mut out = self.outbox.open()?;
        let mut inbox = self.input.take_inbox()?;
        let progress = self.core.progress();
        while let Some(row) = inbox.recv().await? {
            let copies = match &self.predicate {
                Some(predicate) if !predicate(&row) => 0,
                _ => self.copies,
            };
            for _ in 0..copies {
                out.send(row.clone()).await;
            }
            out.send(row).await;
            progress.add(1);
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> Node for RowDuplication<T> {
    fn core(&self) -> &NodeCore {
        &self.inner.core
    }

    fn start(&self) {
        if !self.inner.core.begin_start() {
            return;
        }
        self.inner.input.open(0);
        self.inner.outbox.start_targets();
        let inner = self.inner.clone();
        self.inner.core.spawn(async move { inner.run().await });
    }

    fn set_bounded_capacity(&self, capacity: Option<usize>) -> FlowResult<()> {
        self.inner.input.set_capacity(capacity)
    }
}

impl<T: Clone + Send + 'static> Target<T> for RowDuplication<T> {
    fn input(&self) -> &InputPort<T> {
        &self.inner.input
    }
}

impl<T: Clone + Send + 'static> Linkable<T> for RowDuplication<T> {
    fn outbox(&self) -> &Outbox<T> {
        &self.inner.outbox
    }
}
