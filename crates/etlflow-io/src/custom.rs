use crate::lock;
use crate::source::{CancelSlot, Source};
use arcstr::ArcStr;
use async_trait::async_trait;
use etlflow_core::{
    ErrorLinkable, ErrorOutbox, FlowError, FlowResult, InputPort, Linkable, Node, NodeCore, Outbox, Target,
};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

type ReadFn<T> = Box<dyn FnMut(u64) -> anyhow::Result<Option<T>> + Send>;
type ReadCompletedFn = Box<dyn FnMut(u64) -> bool + Send>;
type WriteFn<T> = Box<dyn FnMut(T) -> anyhow::Result<()> + Send>;

/// Source driven by two callbacks.
///
/// `read(n)` produces the n-th row (`None` skips it) until
/// `read_completed(n)` reports that there is nothing left. With an error
/// link a failing read is reported and the source moves on to the next
/// index.
pub struct CustomSource<T> {
    inner: Arc<CustomSourceInner<T>>,
}

struct CustomSourceInner<T> {
    core: NodeCore,
    outbox: Outbox<T>,
    errors: ErrorOutbox<T>,
    callbacks: Mutex<Option<(ReadFn<T>, ReadCompletedFn)>>,
    cancel: CancelSlot,
}

impl<T> Clone for CustomSource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> CustomSource<T> {
    pub fn new<R, C>(name: impl Into<ArcStr>, read: R, read_completed: C) -> Self
    where
        R: FnMut(u64) -> anyhow::Result<Option<T>> + Send + 'static,
        C: FnMut(u64) -> bool + Send + 'static,
    {
        let core = NodeCore::new(name);
        let outbox = Outbox::new(core.name().clone());
        let errors = ErrorOutbox::new(core.name().clone());
        Self {
            inner: Arc::new(CustomSourceInner {
                core,
                outbox,
                errors,
                callbacks: Mutex::new(Some((Box::new(read), Box::new(read_completed)))),
                cancel: CancelSlot::default(),
            }),
        }
    }
}

impl<T: Send + 'static> CustomSourceInner<T> {
    async fn run(&self, cancel: CancellationToken) -> FlowResult<()> {
        let mut out = self.outbox.open()?;
        let mut errors = self.errors.open()?;
        let (mut read, mut read_completed) = lock(&self.callbacks)
            .take()
            .ok_or(FlowError::ChannelClosed("custom source callbacks already taken"))?;
        let progress = self.core.progress();

        let mut index = 0u64;
        while !read_completed(index) {
            if cancel.is_cancelled() {
                info!(node = %self.core.name(), rows = index, "cancelled, no more rows read");
                break;
            }
            match read(index) {
                Ok(row) => {
                    if row.is_some() {
                        progress.add(1);
                    }
                    out.send_opt(row).await;
                }
                Err(e) => errors.report(e.context(format!("reading row {index}")), None).await?,
            }
            index += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Send + 'static> Node for CustomSource<T> {
    fn core(&self) -> &NodeCore {
        &self.inner.core
    }

    fn start(&self) {
        if !self.inner.core.begin_start() {
            return;
        }
        self.inner.outbox.start_targets();
        self.inner.errors.start_target();
        let inner = self.inner.clone();
        let cancel = inner.cancel.token();
        self.inner.core.spawn(async move { inner.run(cancel).await });
    }
}

impl<T: Send + 'static> Linkable<T> for CustomSource<T> {
    fn outbox(&self) -> &Outbox<T> {
        &self.inner.outbox
    }
}

impl<T: Send + 'static> ErrorLinkable<T> for CustomSource<T> {
    fn error_outbox(&self) -> &ErrorOutbox<T> {
        &self.inner.errors
    }
}

impl<T: Send + 'static> Source<T> for CustomSource<T> {
    fn cancellation(&self) -> &CancelSlot {
        &self.inner.cancel
    }
}

/// Destination that hands every row to a callback.
///
/// A failing write faults the destination, or becomes an
/// [`ErrorRecord`](etlflow_core::ErrorRecord) when an error link is attached.
pub struct CustomDestination<T> {
    inner: Arc<CustomDestinationInner<T>>,
}

struct CustomDestinationInner<T> {
    core: NodeCore,
    input: InputPort<T>,
    errors: ErrorOutbox<T>,
    write: Mutex<Option<WriteFn<T>>>,
}

impl<T> Clone for CustomDestination<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> CustomDestination<T> {
    pub fn new<W>(name: impl Into<ArcStr>, write: W) -> Self
    where
        W: FnMut(T) -> anyhow::Result<()> + Send + 'static,
    {
        let core = NodeCore::new(name);
        let input = InputPort::new(core.name().clone());
        let errors = ErrorOutbox::new(core.name().clone());
        Self {
            inner: Arc::new(CustomDestinationInner {
                core,
                input,
                errors,
                write: Mutex::new(Some(Box::new(write))),
            }),
        }
    }
}

impl<T: Send + 'static> CustomDestinationInner<T> {
    async fn run(&self) -> FlowResult<()> {
        let mut errors = self.errors.open()?;
        let mut inbox = self.input.take_inbox()?;
        let mut write = lock(&self.write)
            .take()
            .ok_or(FlowError::ChannelClosed("custom destination callback already taken"))?;
        let progress = self.core.progress();
        while let Some(row) = inbox.recv().await? {
            let json = errors.snapshot(&row);
            match write(row) {
                Ok(()) => progress.add(1),
                Err(e) => errors.report(e, json).await?,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Send + 'static> Node for CustomDestination<T> {
    fn core(&self) -> &NodeCore {
        &self.inner.core
    }

    fn start(&self) {
        if !self.inner.core.begin_start() {
            return;
        }
        self.inner.input.open(0);
        self.inner.errors.start_target();
        let inner = self.inner.clone();
        self.inner.core.spawn(async move { inner.run().await });
    }

    fn set_bounded_capacity(&self, capacity: Option<usize>) -> FlowResult<()> {
        self.inner.input.set_capacity(capacity)
    }
}

impl<T: Send + 'static> Target<T> for CustomDestination<T> {
    fn input(&self) -> &InputPort<T> {
        &self.inner.input
    }
}

impl<T: Send + 'static> ErrorLinkable<T> for CustomDestination<T> {
    fn error_outbox(&self) -> &ErrorOutbox<T> {
        &self.inner.errors
    }
}
