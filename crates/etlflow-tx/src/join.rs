//! Two-input joins: positional merge join and cross join.

use crate::lock;
use arcstr::ArcStr;
use async_trait::async_trait;
use etlflow_core::{
    ErrorLinkable, ErrorOutbox, FlowError, FlowResult, Inbox, InputPort, Linkable, NamedPort, Node, NodeCore,
    Outbox,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

type MergeFn<A, B, O> = Arc<dyn Fn(A, B) -> anyhow::Result<O> + Send + Sync>;
type CrossFn<A, B, O> = Arc<dyn Fn(&A, &B) -> anyhow::Result<Option<O>> + Send + Sync>;

/// What a merge join does with rows left over when one input ends first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnpairedPolicy {
    /// Discard the leftovers and log how many were dropped.
    #[default]
    Truncate,
    /// Fault with [`FlowError::UnpairedRows`].
    Fail,
}

/// Pairs the n-th `left` row with the n-th `right` row.
///
/// Both inputs are read in lockstep; the node completes when both producers
/// have completed. A failing pair is routed to the error link as `(left, right)`.
pub struct MergeJoin<A, B, O> {
    inner: Arc<MergeInner<A, B, O>>,
}

struct MergeInner<A, B, O> {
    core: NodeCore,
    left: InputPort<A>,
    right: InputPort<B>,
    outbox: Outbox<O>,
    errors: ErrorOutbox<(A, B)>,
    combine: MergeFn<A, B, O>,
    policy: Mutex<UnpairedPolicy>,
}

impl<A, B, O> Clone for MergeJoin<A, B, O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A, B, O> MergeJoin<A, B, O>
where
    A: Send + 'static,
    B: Send + 'static,
    O: Send + 'static,
{
    pub fn new<F>(name: impl Into<ArcStr>, combine: F) -> Self
    where
        F: Fn(A, B) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        let core = NodeCore::new(name);
        let name = core.name().clone();
        Self {
            inner: Arc::new(MergeInner {
                left: InputPort::new(arcstr::format!("{name}.left")),
                right: InputPort::new(arcstr::format!("{name}.right")),
                outbox: Outbox::new(name.clone()),
                errors: ErrorOutbox::new(name),
                core,
                combine: Arc::new(combine),
                policy: Mutex::new(UnpairedPolicy::default()),
            }),
        }
    }

    pub fn with_unpaired_policy(self, policy: UnpairedPolicy) -> Self {
        *lock(&self.inner.policy) = policy;
        self
    }

    pub fn left(&self) -> NamedPort<Self, A> {
        NamedPort::new(self.clone(), self.inner.left.clone())
    }

    pub fn right(&self) -> NamedPort<Self, B> {
        NamedPort::new(self.clone(), self.inner.right.clone())
    }
}

impl<A, B, O> MergeInner<A, B, O>
where
    A: Send + 'static,
    B: Send + 'static,
    O: Send + 'static,
{
    async fn run(&self) -> FlowResult<()> {
        let mut out = self.outbox.open()?;
        let mut errors = self.errors.open()?;
        let mut left = self.left.take_inbox()?;
        let mut right = self.right.take_inbox()?;
        let policy = *lock(&self.policy);
        let progress = self.core.progress();

        let (unpaired_left, unpaired_right) = loop {
            let a = left.recv().await?;
            let b = right.recv().await?;
            let pair = match (a, b) {
                (Some(a), Some(b)) => (a, b),
                (Some(_), None) => break (1 + drain(&mut left).await?, 0),
                (None, Some(_)) => break (0, 1 + drain(&mut right).await?),
                (None, None) => break (0, 0),
            };
            let json = errors.snapshot(&pair);
            let (a, b) = pair;
            match (self.combine)(a, b) {
                Ok(row) => {
                    out.send(row).await;
                    progress.add(1);
                }
                Err(e) => errors.report(e, json).await?,
            }
        };

        if unpaired_left + unpaired_right == 0 {
            return Ok(());
        }
        match policy {
            UnpairedPolicy::Truncate => {
                warn!(
                    node = %self.core.name(),
                    left = unpaired_left,
                    right = unpaired_right,
                    "inputs of unequal length, unpaired rows discarded"
                );
                Ok(())
            }
            UnpairedPolicy::Fail => Err(FlowError::UnpairedRows {
                node: self.core.name().clone(),
                left: unpaired_left,
                right: unpaired_right,
            }),
        }
    }
}

async fn drain<T>(inbox: &mut Inbox<T>) -> FlowResult<usize> {
    let mut count = 0;
    while inbox.recv().await?.is_some() {
        count += 1;
    }
    Ok(count)
}

#[async_trait]
impl<A, B, O> Node for MergeJoin<A, B, O>
where
    A: Send + 'static,
    B: Send + 'static,
    O: Send + 'static,
{
    fn core(&self) -> &NodeCore {
        &self.inner.core
    }

    fn start(&self) {
        if !self.inner.core.begin_start() {
            return;
        }
        self.inner.left.open(0);
        self.inner.right.open(0);
        self.inner.outbox.start_targets();
        self.inner.errors.start_target();
        let inner = self.inner.clone();
        self.inner.core.spawn(async move { inner.run().await });
    }

    /// Applies to both inputs.
    fn set_bounded_capacity(&self, capacity: Option<usize>) -> FlowResult<()> {
        self.inner.left.set_capacity(capacity)?;
        self.inner.right.set_capacity(capacity)
    }
}

impl<A, B, O> Linkable<O> for MergeJoin<A, B, O>
where
    A: Send + 'static,
    B: Send + 'static,
    O: Send + 'static,
{
    fn outbox(&self) -> &Outbox<O> {
        &self.inner.outbox
    }
}

impl<A, B, O> ErrorLinkable<(A, B)> for MergeJoin<A, B, O>
where
    A: Send + 'static,
    B: Send + 'static,
    O: Send + 'static,
{
    fn error_outbox(&self) -> &ErrorOutbox<(A, B)> {
        &self.inner.errors
    }
}

/// Combines every `in_memory` row with every `passing` row.
///
/// The `in_memory` input is read to the end before the first `passing` row
/// is taken, so only that side is buffered. The combinator returns `None`
/// to filter a combination out.
pub struct CrossJoin<A, B, O> {
    inner: Arc<CrossInner<A, B, O>>,
}

struct CrossInner<A, B, O> {
    core: NodeCore,
    in_memory: InputPort<A>,
    passing: InputPort<B>,
    outbox: Outbox<O>,
    errors: ErrorOutbox<(A, B)>,
    combine: CrossFn<A, B, O>,
}

impl<A, B, O> Clone for CrossJoin<A, B, O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A, B, O> CrossJoin<A, B, O>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    pub fn new<F>(name: impl Into<ArcStr>, combine: F) -> Self
    where
        F: Fn(&A, &B) -> anyhow::Result<Option<O>> + Send + Sync + 'static,
    {
        let core = NodeCore::new(name);
        let name = core.name().clone();
        Self {
            inner: Arc::new(CrossInner {
                in_memory: InputPort::new(arcstr::format!("{name}.in_memory")),
                passing: InputPort::new(arcstr::format!("{name}.passing")),
                outbox: Outbox::new(name.clone()),
                errors: ErrorOutbox::new(name),
                core,
                combine: Arc::new(combine),
            }),
        }
    }

    pub fn in_memory(&self) -> NamedPort<Self, A> {
        NamedPort::new(self.clone(), self.inner.in_memory.clone())
    }

    pub fn passing(&self) -> NamedPort<Self, B> {
        NamedPort::new(self.clone(), self.inner.passing.clone())
    }
}

impl<A, B, O> CrossInner<A, B, O>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    async fn run(&self) -> FlowResult<()> {
        let mut out = self.outbox.open()?;
        let mut errors = self.errors.open()?;
        let mut memory = self.in_memory.take_inbox()?;
        let mut passing = self.passing.take_inbox()?;

        let buffered = memory.collect().await?;
        debug!(node = %self.core.name(), rows = buffered.len(), "in-memory side buffered");

        let progress = self.core.progress();
        while let Some(b) = passing.recv().await? {
            for a in &buffered {
                match (self.combine)(a, &b) {
                    Ok(Some(row)) => out.send(row).await,
                    Ok(None) => {}
                    Err(e) => {
                        let json = if errors.is_linked() {
                            errors.snapshot(&(a.clone(), b.clone()))
                        } else {
                            None
                        };
                        errors.report(e, json).await?;
                    }
                }
            }
            progress.add(1);
        }
        Ok(())
    }
}

#[async_trait]
impl<A, B, O> Node for CrossJoin<A, B, O>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    fn core(&self) -> &NodeCore {
        &self.inner.core
    }

    fn start(&self) {
        if !self.inner.core.begin_start() {
            return;
        }
        self.inner.in_memory.open(0);
        self.inner.passing.open(0);
        self.inner.outbox.start_targets();
        self.inner.errors.start_target();
        let inner = self.inner.clone();
        self.inner.core.spawn(async move { inner.run().await });
    }

    /// Bounds the passing input; the in-memory side is buffered whole anyway.
    fn set_bounded_capacity(&self, capacity: Option<usize>) -> FlowResult<()> {
        self.inner.passing.set_capacity(capacity)
    }
}

impl<A, B, O> Linkable<O> for CrossJoin<A, B, O>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    fn outbox(&self) -> &Outbox<O> {
        &self.inner.outbox
    }
}

impl<A, B, O> ErrorLinkable<(A, B)> for CrossJoin<A, B, O>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    fn error_outbox(&self) -> &ErrorOutbox<(A, B)> {
        &self.inner.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etlflow_core::ErrorRecord;
    use etlflow_io::{MemoryDestination, MemorySource, Source};

    fn sum_join() -> MergeJoin<i32, i32, i32> {
        MergeJoin::new("merge", |a: i32, b: i32| Ok(a + b))
    }

    #[tokio::test]
    async fn merge_pairs_rows_positionally() {
        let left = MemorySource::new("left", vec![1, 2, 3]);
        let right = MemorySource::new("right", vec![10, 20, 30]);
        let join = sum_join();
        let dest = MemoryDestination::new("dest");
        left.link_to(&join.left());
        right.link_to(&join.right());
        join.link_to(&dest);

        left.execute();
        right.execute();
        dest.wait().await.unwrap();
        assert_eq!(dest.data(), vec![11, 22, 33]);
    }

    #[tokio::test]
    async fn merge_truncates_longer_input_by_default() {
        let left = MemorySource::new("left", vec![1, 2, 3, 4]);
        let right = MemorySource::new("right", vec![10, 20]);
        let join = sum_join();
        let dest = MemoryDestination::new("dest");
        left.link_to(&join.left());
        right.link_to(&join.right());
        join.link_to(&dest);

        left.execute();
        right.execute();
        dest.wait().await.unwrap();
        assert_eq!(dest.data(), vec![11, 22]);
    }

    #[tokio::test]
    async fn merge_fail_policy_reports_unpaired_counts() {
        let left = MemorySource::new("left", vec![1]);
        let right = MemorySource::new("right", vec![10, 20, 30]);
        let join = sum_join().with_unpaired_policy(UnpairedPolicy::Fail);
        let dest = MemoryDestination::new("dest");
        left.link_to(&join.left());
        right.link_to(&join.right());
        join.link_to(&dest);

        left.execute();
        right.execute();
        let err = dest.wait().await.unwrap_err();
        assert!(matches!(
            err.causes()[0],
            FlowError::UnpairedRows { left: 0, right: 2, .. }
        ));
        assert_eq!(dest.data(), vec![11]);
    }

    #[tokio::test]
    async fn merge_routes_failing_pairs() {
        let left = MemorySource::new("left", vec![1, 2]);
        let right = MemorySource::new("right", vec![5, 0]);
        let join = MergeJoin::new("div", |a: i32, b: i32| {
            a.checked_div(b).ok_or_else(|| anyhow::anyhow!("division by zero"))
        });
        let dest = MemoryDestination::new("dest");
        let errors = MemoryDestination::<ErrorRecord>::new("errors");
        left.link_to(&join.left());
        right.link_to(&join.right());
        join.link_to(&dest);
        join.link_errors_to(&errors);

        left.execute();
        right.execute();
        dest.wait().await.unwrap();
        errors.wait().await.unwrap();
        assert_eq!(dest.data(), vec![0]);
        let errors = errors.take_data();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].record_as_json.as_deref(), Some("[2,0]"));
    }

    #[tokio::test]
    async fn cross_join_yields_every_combination() {
        let memory = MemorySource::new("sizes", vec!["S".to_string(), "M".to_string()]);
        let passing = MemorySource::new("colors", vec!["red".to_string(), "blue".to_string(), "green".to_string()]);
        let join = CrossJoin::new("cross", |size: &String, color: &String| Ok(Some(format!("{color}-{size}"))));
        let dest = MemoryDestination::new("dest");
        memory.link_to(&join.in_memory());
        passing.link_to(&join.passing());
        join.link_to(&dest);

        passing.execute();
        memory.execute();
        dest.wait().await.unwrap();
        assert_eq!(
            dest.data(),
            vec!["red-S", "red-M", "blue-S", "blue-M", "green-S", "green-M"]
        );
    }

    #[tokio::test]
    async fn cross_join_filters_none_combinations() {
        let memory = MemorySource::new("a", 1..=3);
        let passing = MemorySource::new("b", 1..=3);
        let join = CrossJoin::new("cross", |a: &i32, b: &i32| Ok((a != b).then(|| a * 10 + b)));
        let dest = MemoryDestination::new("dest");
        memory.link_to(&join.in_memory());
        passing.link_to(&join.passing());
        join.link_to(&dest);

        memory.execute();
        passing.execute();
        dest.wait().await.unwrap();
        assert_eq!(dest.len(), 6);
    }
}
