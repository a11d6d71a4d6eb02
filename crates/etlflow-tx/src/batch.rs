//! Row-batch transformation.

use crate::lock;
use arcstr::ArcStr;
use async_trait::async_trait;
use etlflow_core::{
    Emitter, ErrorLinkable, ErrorOutbox, ErrorReporter, FlowError, FlowResult, FlowSettings, InputPort,
    Linkable, Node, NodeCore, Outbox, Target,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

type BatchFn<I, O> = Arc<dyn Fn(Vec<I>) -> anyhow::Result<Option<Vec<O>>> + Send + Sync>;
type BeforeBatchFn<I> = Arc<dyn Fn(&mut Vec<I>) -> anyhow::Result<()> + Send + Sync>;

/// Transforms the input in fixed-size batches.
///
/// Rows are collected until `batch_size` is reached; the optional
/// before-batch hook runs on the collected rows, then the batch function
/// produces the output rows. The remainder is processed when the input
/// completes. Output order across batches equals input order.
///
/// The batch function returns `Ok(None)` only by mistake: that faults the
/// node with [`FlowError::InvalidOperation`] even when an error link is
/// attached. `Ok(Some(vec![]))` drops the batch. A batch that fails with
/// an error link attached yields one error record per row of that batch.
pub struct RowBatchTransformation<I, O> {
    inner: Arc<BatchInner<I, O>>,
}

struct BatchInner<I, O> {
    core: NodeCore,
    input: InputPort<I>,
    outbox: Outbox<O>,
    errors: ErrorOutbox<I>,
    transform: BatchFn<I, O>,
    before_batch: Mutex<Option<BeforeBatchFn<I>>>,
    batch_size: Mutex<Option<usize>>,
    default_batch_size: AtomicUsize,
}

impl<I, O> Clone for RowBatchTransformation<I, O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I: Send + 'static, O: Send + 'static> RowBatchTransformation<I, O> {
    pub fn new<F>(name: impl Into<ArcStr>, batch_size: usize, transform: F) -> Self
    where
        F: Fn(Vec<I>) -> anyhow::Result<Option<Vec<O>>> + Send + Sync + 'static,
    {
        let this = Self::with_default_size(name, transform);
        *lock(&this.inner.batch_size) = Some(batch_size.max(1));
        this
    }

    /// Batch size taken from [`FlowSettings::batch_size`] at configure time.
    pub fn with_default_size<F>(name: impl Into<ArcStr>, transform: F) -> Self
    where
        F: Fn(Vec<I>) -> anyhow::Result<Option<Vec<O>>> + Send + Sync + 'static,
    {
        let core = NodeCore::new(name);
        let name = core.name().clone();
        Self {
            inner: Arc::new(BatchInner {
                input: InputPort::new(name.clone()),
                outbox: Outbox::new(name.clone()),
                errors: ErrorOutbox::new(name),
                core,
                transform: Arc::new(transform),
                before_batch: Mutex::new(None),
                batch_size: Mutex::new(None),
                default_batch_size: AtomicUsize::new(FlowSettings::default().batch_size),
            }),
        }
    }

    pub fn with_before_batch<F>(self, hook: F) -> Self
    where
        F: Fn(&mut Vec<I>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        *lock(&self.inner.before_batch) = Some(Arc::new(hook));
        self
    }

    pub fn batch_size(&self) -> usize {
        self.inner.batch_size()
    }
}

impl<I: Send + 'static, O: Send + 'static> BatchInner<I, O> {
    fn batch_size(&self) -> usize {
        lock(&self.batch_size).unwrap_or_else(|| self.default_batch_size.load(Ordering::Relaxed))
    }

    async fn run(&self) -> FlowResult<()> {
        let mut out = self.outbox.open()?;
        let mut errors = self.errors.open()?;
        let mut inbox = self.input.take_inbox()?;
        let batch_size = self.batch_size();
        let before_batch = lock(&self.before_batch).clone();

        let mut batch = Vec::with_capacity(batch_size);
        let mut snapshots = Vec::with_capacity(batch_size);
        let mut batches = 0u64;
        while let Some(row) = inbox.recv().await? {
            snapshots.push(errors.snapshot(&row));
            batch.push(row);
            if batch.len() == batch_size {
                batches += 1;
                let rows = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                let json = std::mem::replace(&mut snapshots, Vec::with_capacity(batch_size));
                self.process(rows, json, before_batch.as_ref(), &mut out, &mut errors)
                    .await?;
            }
        }
        if !batch.is_empty() {
            batches += 1;
            self.process(batch, snapshots, before_batch.as_ref(), &mut out, &mut errors)
                .await?;
        }
        debug!(node = %self.core.name(), batches, "all batches processed");
        Ok(())
    }

    async fn process(
        &self,
        mut rows: Vec<I>,
        snapshots: Vec<Option<String>>,
        before_batch: Option<&BeforeBatchFn<I>>,
        out: &mut Emitter<O>,
        errors: &mut ErrorReporter<I>,
    ) -> FlowResult<()> {
        let count = rows.len() as u64;
        let result = match before_batch {
            Some(hook) => hook(&mut rows).and_then(|()| (self.transform)(rows)),
            None => (self.transform)(rows),
        };
        match result {
            Ok(Some(output)) => {
                self.core.progress().add(count);
                out.send_all(output).await;
                Ok(())
            }
            Ok(None) => Err(FlowError::invalid_operation(
                self.core.name(),
                "batch transformation returned no result; return an empty list to drop a batch",
            )),
            Err(e) => errors.report_many(e, snapshots).await,
        }
    }
}

#[async_trait]
impl<I: Send + 'static, O: Send + 'static> Node for RowBatchTransformation<I, O> {
    fn core(&self) -> &NodeCore {
        &self.inner.core
    }

    fn start(&self) {
        if !self.inner.core.begin_start() {
            return;
        }
        // A bounded buffer never holds less than one batch.
        self.inner.input.open(self.inner.batch_size());
        self.inner.outbox.start_targets();
        self.inner.errors.start_target();
        let inner = self.inner.clone();
        self.inner.core.spawn(async move { inner.run().await });
    }

    fn set_bounded_capacity(&self, capacity: Option<usize>) -> FlowResult<()> {
        self.inner.input.set_capacity(capacity)
    }

    fn configure(&self, settings: &FlowSettings) -> FlowResult<()> {
        self.core().set_progress_every(settings.progress_every);
        self.inner
            .default_batch_size
            .store(settings.batch_size.max(1), Ordering::Relaxed);
        self.set_bounded_capacity(settings.bounded_capacity)
    }
}

impl<I: Send + 'static, O: Send + 'static> Target<I> for RowBatchTransformation<I, O> {
    fn input(&self) -> &InputPort<I> {
        &self.inner.input
    }
}

impl<I: Send + 'static, O: Send + 'static> Linkable<O> for RowBatchTransformation<I, O> {
    fn outbox(&self) -> &Outbox<O> {
        &self.inner.outbox
    }
}

impl<I: Send + 'static, O: Send + 'static> ErrorLinkable<I> for RowBatchTransformation<I, O> {
    fn error_outbox(&self) -> &ErrorOutbox<I> {
        &self.inner.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etlflow_core::ErrorRecord;
    use etlflow_io::{MemoryDestination, MemorySource, Source};
    use std::sync::atomic::AtomicUsize;

    fn doubler(size: usize) -> RowBatchTransformation<i32, i32> {
        RowBatchTransformation::new("double", size, |rows: Vec<i32>| {
            Ok(Some(rows.into_iter().map(|x| x * 2).collect()))
        })
    }

    #[tokio::test]
    async fn remainder_batch_is_processed() {
        let source = MemorySource::new("src", 1..=10);
        let batch = doubler(4);
        let dest = MemoryDestination::new("dest");
        source.link_to(&batch).link_to(&dest);

        source.execute();
        dest.wait().await.unwrap();
        assert_eq!(dest.data(), vec![2, 4, 6, 8, 10, 12, 14, 16, 18, 20]);
    }

    #[tokio::test]
    async fn before_batch_sees_every_batch() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let source = MemorySource::new("src", 0..7);
        let batch = doubler(3).with_before_batch(move |rows| {
            counter.fetch_add(1, Ordering::SeqCst);
            rows.reverse();
            Ok(())
        });
        let dest = MemoryDestination::new("dest");
        source.link_to(&batch).link_to(&dest);

        source.execute();
        dest.wait().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(dest.data(), vec![4, 2, 0, 10, 8, 6, 12]);
    }

    #[tokio::test]
    async fn none_result_is_invalid_even_with_error_link() {
        let source = MemorySource::new("src", 1..=3);
        let batch = RowBatchTransformation::new("broken", 2, |_: Vec<i32>| Ok(None::<Vec<i32>>));
        let dest = MemoryDestination::new("dest");
        let errors = MemoryDestination::<ErrorRecord>::new("errors");
        source.link_to(&batch).link_to(&dest);
        batch.link_errors_to(&errors);

        source.execute();
        let err = batch.wait().await.unwrap_err();
        assert!(matches!(err.causes()[0], FlowError::InvalidOperation { .. }));
        // The fault reaches the error destination too, without any record.
        assert!(errors.wait().await.is_err());
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn empty_result_drops_the_batch() {
        let source = MemorySource::new("src", 1..=4);
        let batch = RowBatchTransformation::new("filter", 2, |rows: Vec<i32>| {
            Ok(Some(if rows.contains(&1) { Vec::new() } else { rows }))
        });
        let dest = MemoryDestination::new("dest");
        source.link_to(&batch).link_to(&dest);

        source.execute();
        dest.wait().await.unwrap();
        assert_eq!(dest.data(), vec![3, 4]);
    }

    #[tokio::test]
    async fn configured_batch_size_applies_when_unset() {
        let batch = RowBatchTransformation::with_default_size("b", |rows: Vec<i32>| Ok(Some(rows)));
        let settings = FlowSettings {
            batch_size: 3,
            bounded_capacity: Some(1),
            ..FlowSettings::default()
        };
        batch.configure(&settings).unwrap();
        assert_eq!(batch.batch_size(), 3);

        let source = MemorySource::new("src", 1..=7);
        let dest = MemoryDestination::new("dest");
        source.link_to(&batch).link_to(&dest);
        source.execute();
        dest.wait().await.unwrap();
        assert_eq!(dest.data(), (1..=7).collect::<Vec<_>>());
    }
}
