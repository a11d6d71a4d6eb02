use super::CacheManager;
use anyhow::Context;
use async_trait::async_trait;
use etlflow_core::{ColumnMap, Connection, DynamicRow, FlowError, FlowResult, FlowSettings, Query};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

type Matcher<I, L> = Arc<dyn Fn(&I, &L) -> bool + Send + Sync>;
type Loader<I, L> = Arc<dyn Fn(&I) -> BoxFuture<'static, anyhow::Result<Vec<L>>> + Send + Sync>;

/// Loads lookup records on demand.
///
/// A miss runs the loader for the input row, typically a targeted query,
/// and appends what it returns. `contains` only looks at what has been
/// loaded so far. Past `max_cache_size` records the oldest are discarded.
pub struct PartialCache<I, L> {
    matcher: Matcher<I, L>,
    loader: Loader<I, L>,
    records: VecDeque<L>,
    max_size: Option<usize>,
    default_max_size: usize,
}

impl<I, L> PartialCache<I, L> {
    pub fn new<M, F>(matcher: M, loader: F) -> Self
    where
        M: Fn(&I, &L) -> bool + Send + Sync + 'static,
        F: Fn(&I) -> BoxFuture<'static, anyhow::Result<Vec<L>>> + Send + Sync + 'static,
    {
        Self {
            matcher: Arc::new(matcher),
            loader: Arc::new(loader),
            records: VecDeque::new(),
            max_size: None,
            default_max_size: FlowSettings::default().max_cache_size,
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size.max(1));
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn max_size(&self) -> usize {
        self.max_size.unwrap_or(self.default_max_size)
    }

    fn extend(&mut self, records: impl IntoIterator<Item = L>) {
        self.records.extend(records);
        let max = self.max_size();
        if self.records.len() > max {
            let excess = self.records.len() - max;
            self.records.drain(..excess);
        }
    }
}

impl<I> PartialCache<I, DynamicRow> {
    /// Cache that runs `to_query(input)` against `connection` on every miss.
    pub fn from_connection<Q, M>(connection: Arc<dyn Connection>, to_query: Q, matcher: M) -> Self
    where
        Q: Fn(&I) -> Query + Send + Sync + 'static,
        M: Fn(&I, &DynamicRow) -> bool + Send + Sync + 'static,
    {
        Self::new(matcher, move |input: &I| {
            let connection = connection.clone();
            let query = to_query(input);
            let load: BoxFuture<'static, anyhow::Result<Vec<DynamicRow>>> = Box::pin(async move {
                connection.open().await?;
                let result = connection.execute_reader(&query).await;
                connection.close().await?;
                let result = result.with_context(|| format!("querying {}", query.table))?;
                let map = ColumnMap::new();
                Ok(result
                    .rows
                    .into_iter()
                    .map(|values| map.to_row(&result.columns, values))
                    .collect())
            });
            load
        })
    }
}

#[async_trait]
impl<I, L> CacheManager<I, L> for PartialCache<I, L>
where
    I: Send + Sync,
    L: Send + Sync,
{
    fn init(&mut self, records: Vec<L>) -> FlowResult<()> {
        self.records.clear();
        self.extend(records);
        Ok(())
    }

    fn contains(&self, input: &I) -> bool {
        self.records.iter().any(|record| (self.matcher)(input, record))
    }

    async fn add(&mut self, input: &I) -> FlowResult<()> {
        let loaded = (self.loader)(input)
            .await
            .context("loading lookup records")
            .map_err(FlowError::Other)?;
        debug!(records = loaded.len(), "partial cache loaded records");
        self.extend(loaded);
        Ok(())
    }

    fn records(&self) -> Vec<&L> {
        self.records.iter().collect()
    }

    fn find(&self, input: &I) -> Option<&L> {
        self.records.iter().find(|record| (self.matcher)(input, record))
    }

    fn loads_on_demand(&self) -> bool {
        true
    }

    fn configure(&mut self, settings: &FlowSettings) {
        self.default_max_size = settings.max_cache_size.max(1);
    }
}
