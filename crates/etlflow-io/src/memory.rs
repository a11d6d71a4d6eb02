use crate::lock;
use crate::source::{CancelSlot, Source};
use arcstr::ArcStr;
use async_trait::async_trait;
use etlflow_core::{FlowResult, InputPort, Linkable, Node, NodeCore, Outbox, Target};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Source that emits a list of rows held in memory.
///
/// `None` entries are skip markers: they are consumed by the source and
/// never reach a link.
pub struct MemorySource<T> {
    inner: Arc<MemorySourceInner<T>>,
}

struct MemorySourceInner<T> {
    core: NodeCore,
    outbox: Outbox<T>,
    rows: Mutex<Vec<Option<T>>>,
    cancel: CancelSlot,
}

impl<T> Clone for MemorySource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> MemorySource<T> {
    pub fn new(name: impl Into<ArcStr>, rows: impl IntoIterator<Item = T>) -> Self {
        Self::with_nulls(name, rows.into_iter().map(Some))
    }

    /// Rows where `None` marks an entry to skip.
    pub fn with_nulls(name: impl Into<ArcStr>, rows: impl IntoIterator<Item = Option<T>>) -> Self {
        let core = NodeCore::new(name);
        let outbox = Outbox::new(core.name().clone());
        Self {
            inner: Arc::new(MemorySourceInner {
                core,
                outbox,
                rows: Mutex::new(rows.into_iter().collect()),
                cancel: CancelSlot::default(),
            }),
        }
    }

    /// Appends a row. Rows pushed after `execute` are not emitted.
    pub fn push(&self, row: T) {
        lock(&self.inner.rows).push(Some(row));
    }
}

impl<T: Send + 'static> MemorySourceInner<T> {
    async fn run(&self, cancel: CancellationToken) -> FlowResult<()> {
        let mut out = self.outbox.open()?;
        let rows = std::mem::take(&mut *lock(&self.rows));
        let progress = self.core.progress();
        for row in rows {
            if cancel.is_cancelled() {
                info!(node = %self.core.name(), "cancelled, no more rows emitted");
                break;
            }
            if row.is_some() {
                progress.add(1);
            }
            out.send_opt(row).await;
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Send + 'static> Node for MemorySource<T> {
    fn core(&self) -> &NodeCore {
        &self.inner.core
    }

    fn start(&self) {
        if !self.inner.core.begin_start() {
            return;
        }
        self.inner.outbox.start_targets();
        let inner = self.inner.clone();
        let cancel = inner.cancel.token();
        self.inner.core.spawn(async move { inner.run(cancel).await });
    }
}

impl<T: Send + 'static> Linkable<T> for MemorySource<T> {
    fn outbox(&self) -> &Outbox<T> {
        &self.inner.outbox
    }
}

impl<T: Send + 'static> Source<T> for MemorySource<T> {
    fn cancellation(&self) -> &CancelSlot {
        &self.inner.cancel
    }
}

/// Destination that collects every row it receives.
pub struct MemoryDestination<T> {
    inner: Arc<MemoryDestinationInner<T>>,
}

struct MemoryDestinationInner<T> {
    core: NodeCore,
    input: InputPort<T>,
    data: Mutex<Vec<T>>,
}

impl<T> Clone for MemoryDestination<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> MemoryDestination<T> {
    pub fn new(name: impl Into<ArcStr>) -> Self {
        let core = NodeCore::new(name);
        let input = InputPort::new(core.name().clone());
        Self {
            inner: Arc::new(MemoryDestinationInner {
                core,
                input,
                data: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Rows received so far. Complete only once `wait` returned.
    pub fn data(&self) -> Vec<T>
    where
        T: Clone,
    {
        lock(&self.inner.data).clone()
    }

    pub fn take_data(&self) -> Vec<T> {
        std::mem::take(&mut *lock(&self.inner.data))
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.data).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + 'static> MemoryDestinationInner<T> {
    async fn run(&self) -> FlowResult<()> {
        let mut inbox = self.input.take_inbox()?;
        let progress = self.core.progress();
        while let Some(row) = inbox.recv().await? {
            lock(&self.data).push(row);
            progress.add(1);
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Send + 'static> Node for MemoryDestination<T> {
    fn core(&self) -> &NodeCore {
        &self.inner.core
    }

    fn start(&self) {
        if !self.inner.core.begin_start() {
            return;
        }
        self.inner.input.open(0);
        let inner = self.inner.clone();
        self.inner.core.spawn(async move { inner.run().await });
    }

    fn set_bounded_capacity(&self, capacity: Option<usize>) -> FlowResult<()> {
        self.inner.input.set_capacity(capacity)
    }
}

impl<T: Send + 'static> Target<T> for MemoryDestination<T> {
    fn input(&self) -> &InputPort<T> {
        &self.inner.input
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etlflow_core::FlowError;

    #[tokio::test]
    async fn null_rows_are_skipped_in_order() {
        let source = MemorySource::with_nulls("src", vec![Some(1), None, Some(2), None, None, Some(3)]);
        let dest = MemoryDestination::new("dest");
        source.link_to(&dest);

        source.execute();
        dest.wait().await.unwrap();
        assert_eq!(dest.data(), vec![1, 2, 3]);
        assert_eq!(source.core().processed(), 3);
    }

    #[tokio::test]
    async fn cancelled_source_completes_without_rows() {
        let source = MemorySource::new("src", 0..100);
        let dest = MemoryDestination::new("dest");
        source.link_to(&dest);

        let cancel = CancellationToken::new();
        cancel.cancel();
        source.execute_async(cancel).await.unwrap();
        dest.wait().await.unwrap();
        assert!(dest.is_empty());
    }

    #[tokio::test]
    async fn two_sources_into_one_destination() {
        let a = MemorySource::new("a", vec![1, 2]);
        let b = MemorySource::new("b", vec![3]);
        let dest = MemoryDestination::new("dest");
        a.link_to(&dest);
        b.link_to(&dest);

        a.execute();
        b.execute();
        dest.wait().await.unwrap();
        let mut rows = dest.take_data();
        rows.sort();
        assert_eq!(rows, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn capacity_after_start_is_rejected() {
        let source = MemorySource::new("src", vec![1]);
        let dest = MemoryDestination::<i32>::new("dest");
        source.link_to(&dest);
        source.execute();
        dest.wait().await.unwrap();
        assert!(matches!(
            dest.set_bounded_capacity(Some(2)),
            Err(FlowError::AlreadyStarted(_))
        ));
    }
}
