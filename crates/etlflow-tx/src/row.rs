//! Row-wise transformations.

use crate::lock;
use arcstr::ArcStr;
use async_trait::async_trait;
use etlflow_core::{
    ErrorLinkable, ErrorOutbox, FlowError, FlowResult, InputPort, Linkable, Node, NodeCore, Outbox, Target,
};
use std::sync::{Arc, Mutex};
use tracing::debug;

type RowFn<I, O> = Arc<dyn Fn(I) -> anyhow::Result<Option<O>> + Send + Sync>;
type InitFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;
type MultiplyFn<I, O> = Arc<dyn Fn(I) -> anyhow::Result<Vec<O>> + Send + Sync>;

/// Applies a function to every row.
///
/// A function that yields `None` drops the row. A failing row faults the
/// node, or becomes an error record when an error link is attached.
pub struct RowTransformation<I, O> {
    inner: Arc<RowInner<I, O>>,
}

struct RowInner<I, O> {
    core: NodeCore,
    input: InputPort<I>,
    outbox: Outbox<O>,
    errors: ErrorOutbox<I>,
    transform: RowFn<I, O>,
    init: Mutex<Option<InitFn>>,
}

impl<I, O> Clone for RowTransformation<I, O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I: Send + 'static, O: Send + 'static> RowTransformation<I, O> {
    pub fn new<F>(name: impl Into<ArcStr>, transform: F) -> Self
    where
        F: Fn(I) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        Self::filter_map(name, move |row| transform(row).map(Some))
    }

    /// Like [`new`](Self::new), but `Ok(None)` drops the row.
    pub fn filter_map<F>(name: impl Into<ArcStr>, transform: F) -> Self
    where
        F: Fn(I) -> anyhow::Result<Option<O>> + Send + Sync + 'static,
    {
        let core = NodeCore::new(name);
        let name = core.name().clone();
        Self {
            inner: Arc::new(RowInner {
                input: InputPort::new(name.clone()),
                outbox: Outbox::new(name.clone()),
                errors: ErrorOutbox::new(name),
                core,
                transform: Arc::new(transform),
                init: Mutex::new(None),
            }),
        }
    }

    /// Runs `init` once, before the first row is transformed. A failing
    /// init faults the node.
    pub fn with_init<F>(self, init: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        *lock(&self.inner.init) = Some(Box::new(init));
        self
    }
}

impl<I: Send + 'static, O: Send + 'static> RowInner<I, O> {
    async fn run(&self) -> FlowResult<()> {
        let mut out = self.outbox.open()?;
        let mut errors = self.errors.open()?;
        let mut inbox = self.input.take_inbox()?;
        let progress = self.core.progress();

        let mut init = lock(&self.init).take();
        while let Some(row) = inbox.recv().await? {
            if let Some(init) = init.take() {
                debug!(node = %self.core.name(), "running init action");
                init().map_err(|e| FlowError::node(self.core.name(), e.context("init action")))?;
            }
            let json = errors.snapshot(&row);
            match (self.transform)(row) {
                Ok(row) => {
                    progress.add(1);
                    out.send_opt(row).await;
                }
                Err(e) => errors.report(e, json).await?,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<I: Send + 'static, O: Send + 'static> Node for RowTransformation<I, O> {
    fn core(&self) -> &NodeCore {
        &self.inner.core
    }

    fn start(&self) {
        if !self.inner.core.begin_start() {
            return;
        }
        self.inner.input.open(0);
        self.inner.outbox.start_targets();
        self.inner.errors.start_target();
        let inner = self.inner.clone();
        self.inner.core.spawn(async move { inner.run().await });
    }

    fn set_bounded_capacity(&self, capacity: Option<usize>) -> FlowResult<()> {
        self.inner.input.set_capacity(capacity)
    }
}

impl<I: Send + 'static, O: Send + 'static> Target<I> for RowTransformation<I, O> {
    fn input(&self) -> &InputPort<I> {
        &self.inner.input
    }
}

impl<I: Send + 'static, O: Send + 'static> Linkable<O> for RowTransformation<I, O> {
    fn outbox(&self) -> &Outbox<O> {
        &self.inner.outbox
    }
}

impl<I: Send + 'static, O: Send + 'static> ErrorLinkable<I> for RowTransformation<I, O> {
    fn error_outbox(&self) -> &ErrorOutbox<I> {
        &self.inner.errors
    }
}

/// Turns every row into zero or more rows, emitted in the order returned.
pub struct RowMultiplication<I, O> {
    inner: Arc<MultiplyInner<I, O>>,
}

struct MultiplyInner<I, O> {
    core: NodeCore,
    input: InputPort<I>,
    outbox: Outbox<O>,
    errors: ErrorOutbox<I>,
    multiply: MultiplyFn<I, O>,
}

impl<I, O> Clone for RowMultiplication<I, O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I: Send + 'static, O: Send + 'static> RowMultiplication<I, O> {
    pub fn new<F>(name: impl Into<ArcStr>, multiply: F) -> Self
    where
        F: Fn(I) -> anyhow::Result<Vec<O>> + Send + Sync + 'static,
    {
        let core = NodeCore::new(name);
        let name = core.name().clone();
        Self {
            inner: Arc::new(MultiplyInner {
                input: InputPort::new(name.clone()),
                outbox: Outbox::new(name.clone()),
                errors: ErrorOutbox::new(name),
                core,
                multiply: Arc::new(multiply),
            }),
        }
    }
}

impl<I: Send + 'static, O: Send + 'static> MultiplyInner<I, O> {
    async fn run(&self) -> FlowResult<()> {
        let mut out = self.outbox.open()?;
        let mut errors = self.errors.open()?;
        let mut inbox = self.input.take_inbox()?;
        let progress = self.core.progress();
        while let Some(row) = inbox.recv().await? {
            let json = errors.snapshot(&row);
            match (self.multiply)(row) {
                Ok(rows) => {
                    progress.add(1);
                    out.send_all(rows).await;
                }
                Err(e) => errors.report(e, json).await?,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<I: Send + 'static, O: Send + 'static> Node for RowMultiplication<I, O> {
    fn core(&self) -> &NodeCore {
        &self.inner.core
    }

    fn start(&self) {
        if !self.inner.core.begin_start() {
            return;
        }
        self.inner.input.open(0);
        self.inner.outbox.start_targets();
        self.inner.errors.start_target();
        let inner = self.inner.clone();
        self.inner.core.spawn(async move { inner.run().await });
    }

    fn set_bounded_capacity(&self, capacity: Option<usize>) -> FlowResult<()> {
        self.inner.input.set_capacity(capacity)
    }
}

impl<I: Send + 'static, O: Send + 'static> Target<I> for RowMultiplication<I, O> {
    fn input(&self) -> &InputPort<I> {
        &self.inner.input
    }
}

impl<I: Send + 'static, O: Send + 'static> Linkable<O> for RowMultiplication<I, O> {
    fn outbox(&self) -> &Outbox<O> {
        &self.inner.outbox
    }
}

impl<I: Send + 'static, O: Send + 'static> ErrorLinkable<I> for RowMultiplication<I, O> {
    fn error_outbox(&self) -> &ErrorOutbox<I> {
        &self.inner.errors
    }
}
