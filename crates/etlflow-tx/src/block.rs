//! Whole-input transformations: block and sort.

use arcstr::ArcStr;
use async_trait::async_trait;
use etlflow_core::{FlowError, FlowResult, InputPort, Linkable, Node, NodeCore, Outbox, Target};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::info;

type BlockFn<I, O> = Arc<dyn Fn(Vec<I>) -> anyhow::Result<Vec<O>> + Send + Sync>;
type Comparer<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Buffers the complete input, then transforms it as one list.
///
/// A failure aborts the whole block and faults the node; there is no
/// per-row fallback, so this node has no error link.
pub struct BlockTransformation<I, O> {
    inner: Arc<BlockInner<I, O>>,
}

struct BlockInner<I, O> {
    core: NodeCore,
    input: InputPort<I>,
    outbox: Outbox<O>,
    transform: BlockFn<I, O>,
}

impl<I, O> Clone for BlockTransformation<I, O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I: Send + 'static, O: Send + 'static> BlockTransformation<I, O> {
    pub fn new<F>(name: impl Into<ArcStr>, transform: F) -> Self
    where
        F: Fn(Vec<I>) -> anyhow::Result<Vec<O>> + Send + Sync + 'static,
    {
        let core = NodeCore::new(name);
        Self {
            inner: Arc::new(BlockInner {
                input: InputPort::new(core.name().clone()),
                outbox: Outbox::new(core.name().clone()),
                core,
                transform: Arc::new(transform),
            }),
        }
    }
}

impl<I: Send + 'static, O: Send + 'static> BlockInner<I, O> {
    async fn run(&self) -> FlowResult<()> {
        let mut out = self.outbox.open()?;
        let rows = self.input.take_inbox()?.collect().await?;
        info!(node = %self.core.name(), rows = rows.len(), "transforming block");
        let count = rows.len() as u64;
        let rows = (self.transform)(rows).map_err(|e| FlowError::node(self.core.name(), e))?;
        self.core.progress().add(count);
        out.send_all(rows).await;
        Ok(())
    }
}

#[async_trait]
impl<I: Send + 'static, O: Send + 'static> Node for BlockTransformation<I, O> {
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

impl<I: Send + 'static, O: Send + 'static> Target<I> for BlockTransformation<I, O> {
    fn input(&self) -> &InputPort<I> {
        &self.inner.input
    }
}

impl<I: Send + 'static, O: Send + 'static> Linkable<O> for BlockTransformation<I, O> {
    fn outbox(&self) -> &Outbox<O> {
        &self.inner.outbox
    }
}

/// Buffers the complete input and emits it ordered by a comparer.
///
/// The sort is stable: rows that compare equal keep their input order.
pub struct Sort<T> {
    inner: Arc<SortInner<T>>,
}

struct SortInner<T> {
    core: NodeCore,
    input: InputPort<T>,
    outbox: Outbox<T>,
    compare: Comparer<T>,
}

impl<T> Clone for Sort<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Sort<T> {
    pub fn new<F>(name: impl Into<ArcStr>, compare: F) -> Self
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        let core = NodeCore::new(name);
        Self {
            inner: Arc::new(SortInner {
                input: InputPort::new(core.name().clone()),
                outbox: Outbox::new(core.name().clone()),
                core,
                compare: Arc::new(compare),
            }),
        }
    }

    pub fn by_key<K, F>(name: impl Into<ArcStr>, key: F) -> Self
    where
        K: Ord,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        Self::new(name, move |a, b| key(a).cmp(&key(b)))
    }
}

impl<T: Send + 'static> SortInner<T> {
    async fn run(&self) -> FlowResult<()> {
        let mut out = self.outbox.open()?;
        let mut rows = self.input.take_inbox()?.collect().await?;
        rows.sort_by(|a, b| (self.compare)(a, b));
        self.core.progress().add(rows.len() as u64);
        out.send_all(rows).await;
        Ok(())
    }
}

#[async_trait]
impl<T: Send + 'static> Node for Sort<T> {
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

impl<T: Send + 'static> Target<T> for Sort<T> {
    fn input(&self) -> &InputPort<T> {
        &self.inner.input
    }
}

impl<T: Send + 'static> Linkable<T> for Sort<T> {
    fn outbox(&self) -> &Outbox<T> {
        &self.inner.outbox
    }
}
