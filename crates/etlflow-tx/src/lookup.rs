//! Lookup transformation.

use crate::cache::CacheManager;
use crate::lock;
use arcstr::ArcStr;
use async_trait::async_trait;
use etlflow_core::{
    ErrorLinkable, ErrorOutbox, FlowError, FlowResult, FlowSettings, InputPort, Linkable, NamedPort, Node,
    NodeCore, Outbox, Target,
};
use std::sync::{Arc, Mutex};
use tracing::debug;

type MatchFn<I, O, L> = Arc<dyn Fn(I, Option<&L>) -> anyhow::Result<O> + Send + Sync>;
type ExistsFn<I, O> = Arc<dyn Fn(I, bool) -> anyhow::Result<O> + Send + Sync>;

enum Retrieval<I, O, L> {
    Match(MatchFn<I, O, L>),
    Exists(ExistsFn<I, O>),
}

/// Enriches every input row from a cache filled by a second source.
///
/// Whatever is linked to [`source`](Self::source) is read completely and
/// handed to the cache before the first input row is processed. A miss is
/// not an error: the transform receives `None` (or `false` in exists mode).
/// Caches that load on demand get a chance to fetch the record first.
pub struct LookupTransformation<I, O, L, C> {
    inner: Arc<LookupInner<I, O, L, C>>,
}

struct LookupInner<I, O, L, C> {
    core: NodeCore,
    input: InputPort<I>,
    lookup: InputPort<L>,
    outbox: Outbox<O>,
    errors: ErrorOutbox<I>,
    retrieval: Retrieval<I, O, L>,
    cache: Mutex<Option<C>>,
}

impl<I, O, L, C> Clone for LookupTransformation<I, O, L, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I, O, L, C> LookupTransformation<I, O, L, C>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
    L: Send + Sync + 'static,
    C: CacheManager<I, L> + 'static,
{
    /// `transform` receives the row and the matching lookup record, if any.
    pub fn new<F>(name: impl Into<ArcStr>, cache: C, transform: F) -> Self
    where
        F: Fn(I, Option<&L>) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        Self::build(name, cache, Retrieval::Match(Arc::new(transform)))
    }

    /// `transform` only learns whether a matching record exists.
    pub fn exists<F>(name: impl Into<ArcStr>, cache: C, transform: F) -> Self
    where
        F: Fn(I, bool) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        Self::build(name, cache, Retrieval::Exists(Arc::new(transform)))
    }

    fn build(name: impl Into<ArcStr>, cache: C, retrieval: Retrieval<I, O, L>) -> Self {
        let core = NodeCore::new(name);
        let name = core.name().clone();
        Self {
            inner: Arc::new(LookupInner {
                input: InputPort::new(name.clone()),
                lookup: InputPort::new(arcstr::format!("{name}.source")),
                outbox: Outbox::new(name.clone()),
                errors: ErrorOutbox::new(name),
                core,
                retrieval,
                cache: Mutex::new(Some(cache)),
            }),
        }
    }

    /// Input port for the lookup records.
    pub fn source(&self) -> NamedPort<Self, L> {
        NamedPort::new(self.clone(), self.inner.lookup.clone())
    }
}

impl<I, O, L, C> LookupInner<I, O, L, C>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
    L: Send + Sync + 'static,
    C: CacheManager<I, L> + 'static,
{
    async fn run(&self) -> FlowResult<()> {
        let mut out = self.outbox.open()?;
        let mut errors = self.errors.open()?;
        let mut lookup = self.lookup.take_inbox()?;
        let mut inbox = self.input.take_inbox()?;
        let mut cache = lock(&self.cache)
            .take()
            .ok_or_else(|| FlowError::invalid_operation(self.core.name(), "cache already in use"))?;

        let records = lookup.collect().await?;
        debug!(node = %self.core.name(), records = records.len(), "lookup source loaded");
        cache.init(records)?;

        let progress = self.core.progress();
        while let Some(row) = inbox.recv().await? {
            let json = errors.snapshot(&row);
            match self.resolve(&mut cache, row).await {
                Ok(output) => {
                    out.send(output).await;
                    progress.add(1);
                }
                Err(e) => errors.report(e, json).await?,
            }
        }
        Ok(())
    }

    async fn resolve(&self, cache: &mut C, row: I) -> anyhow::Result<O> {
        let hit = cache.contains(&row)
            || (cache.loads_on_demand() && {
                cache.add(&row).await?;
                cache.contains(&row)
            });
        match &self.retrieval {
            Retrieval::Match(transform) => {
                let found = if hit { cache.find(&row) } else { None };
                transform(row, found)
            }
            Retrieval::Exists(transform) => {
                let exists = hit && cache.exists(&row);
                transform(row, exists)
            }
        }
    }
}

#[async_trait]
impl<I, O, L, C> Node for LookupTransformation<I, O, L, C>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
    L: Send + Sync + 'static,
    C: CacheManager<I, L> + 'static,
{
    fn core(&self) -> &NodeCore {
        &self.inner.core
    }

    fn start(&self) {
        if !self.inner.core.begin_start() {
            return;
        }
        self.inner.lookup.open(0);
        self.inner.input.open(0);
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
        if let Some(cache) = lock(&self.inner.cache).as_mut() {
            cache.configure(settings);
        }
        self.set_bounded_capacity(settings.bounded_capacity)
    }
}

impl<I, O, L, C> Target<I> for LookupTransformation<I, O, L, C>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
    L: Send + Sync + 'static,
    C: CacheManager<I, L> + 'static,
{
    fn input(&self) -> &InputPort<I> {
        &self.inner.input
    }
}

impl<I, O, L, C> Linkable<O> for LookupTransformation<I, O, L, C>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
    L: Send + Sync + 'static,
    C: CacheManager<I, L> + 'static,
{
    fn outbox(&self) -> &Outbox<O> {
        &self.inner.outbox
    }
}

impl<I, O, L, C> ErrorLinkable<I> for LookupTransformation<I, O, L, C>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
    L: Send + Sync + 'static,
    C: CacheManager<I, L> + 'static,
{
    fn error_outbox(&self) -> &ErrorOutbox<I> {
        &self.inner.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{hash_of, FullTableCache, HashCache, PartialCache};
    use etlflow_core::ErrorRecord;
    use etlflow_io::{MemoryDestination, MemorySource, Source};
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn enriches_rows_from_a_full_table() {
        let customers = MemorySource::new("customers", vec![(1u32, "ann".to_string()), (2, "bob".to_string())]);
        let orders = MemorySource::new("orders", vec![(10u32, 2u32), (11, 1), (12, 9)]);
        let lookup = LookupTransformation::new(
            "lookup",
            FullTableCache::new(|order: &(u32, u32), customer: &(u32, String)| order.1 == customer.0),
            |order: (u32, u32), customer: Option<&(u32, String)>| {
                Ok((order.0, customer.map(|c| c.1.clone())))
            },
        );
        let dest = MemoryDestination::new("dest");
        customers.link_to(&lookup.source());
        orders.link_to(&lookup).link_to(&dest);

        customers.execute();
        orders.execute();
        dest.wait().await.unwrap();
        assert_eq!(
            dest.data(),
            vec![(10, Some("bob".to_string())), (11, Some("ann".to_string())), (12, None)]
        );
    }

    #[tokio::test]
    async fn exists_mode_with_hash_cache() {
        let known = MemorySource::new("known", vec!["a@x.io".to_string(), "b@x.io".to_string()]);
        let input = MemorySource::new("input", vec!["b@x.io".to_string(), "z@x.io".to_string()]);
        let lookup = LookupTransformation::exists(
            "seen",
            HashCache::new(|email: &String| hash_of(email), |email: &String| hash_of(email)),
            |email: String, seen: bool| Ok((email, seen)),
        );
        let dest = MemoryDestination::new("dest");
        known.link_to(&lookup.source());
        input.link_to(&lookup).link_to(&dest);

        known.execute();
        input.execute();
        dest.wait().await.unwrap();
        assert_eq!(
            dest.data(),
            vec![("b@x.io".to_string(), true), ("z@x.io".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn exists_mode_with_full_table_reports_misses() {
        let known = MemorySource::new("known", vec![1u32, 3]);
        let input = MemorySource::new("input", vec![1u32, 2, 3]);
        let lookup = LookupTransformation::exists(
            "known-ids",
            FullTableCache::new(|id: &u32, record: &u32| id == record),
            |id: u32, found: bool| Ok((id, found)),
        );
        let dest = MemoryDestination::new("dest");
        known.link_to(&lookup.source());
        input.link_to(&lookup).link_to(&dest);

        known.execute();
        input.execute();
        dest.wait().await.unwrap();
        assert_eq!(dest.data(), vec![(1, true), (2, false), (3, true)]);
    }

    #[tokio::test]
    async fn partial_cache_loads_each_key_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let cache = PartialCache::new(
            |id: &u32, record: &(u32, u32)| *id == record.0,
            move |id: &u32| {
                counter.fetch_add(1, Ordering::SeqCst);
                let id = *id;
                let load: BoxFuture<'static, anyhow::Result<Vec<(u32, u32)>>> =
                    Box::pin(async move { Ok(vec![(id, id * 100)]) });
                load
            },
        );
        let lookup = LookupTransformation::new("lookup", cache, |id: u32, record: Option<&(u32, u32)>| {
            Ok(record.map(|r| r.1).unwrap_or_default() + id)
        });
        let input = MemorySource::new("input", vec![1u32, 2, 1, 2, 3]);
        let dest = MemoryDestination::new("dest");
        input.link_to(&lookup).link_to(&dest);

        input.execute();
        dest.wait().await.unwrap();
        assert_eq!(dest.data(), vec![101, 202, 101, 202, 303]);
        assert_eq!(loads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failing_rows_go_to_the_error_link() {
        let lookup = LookupTransformation::new(
            "lookup",
            FullTableCache::new(|id: &u32, record: &u32| id == record),
            |id: u32, record: Option<&u32>| match record {
                Some(_) => Ok(id),
                None => anyhow::bail!("unknown id {id}"),
            },
        );
        let known = MemorySource::new("known", vec![1u32, 3]);
        let input = MemorySource::new("input", vec![1u32, 2, 3]);
        let dest = MemoryDestination::new("dest");
        let errors = MemoryDestination::<ErrorRecord>::new("errors");
        known.link_to(&lookup.source());
        input.link_to(&lookup).link_to(&dest);
        lookup.link_errors_to(&errors);

        known.execute();
        input.execute();
        dest.wait().await.unwrap();
        errors.wait().await.unwrap();
        assert_eq!(dest.data(), vec![1, 3]);
        let errors = errors.take_data();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_text, "unknown id 2");
        assert_eq!(errors[0].record_as_json.as_deref(), Some("2"));
    }
}
