use super::CacheManager;
use async_trait::async_trait;
use etlflow_core::{FlowError, FlowResult};
use std::sync::Arc;

type Matcher<I, L> = Arc<dyn Fn(&I, &L) -> bool + Send + Sync>;

/// Holds the complete lookup source.
///
/// Everything is loaded at init, so `contains` is always true and `add`
/// is an error.
pub struct FullTableCache<I, L> {
    matcher: Matcher<I, L>,
    records: Vec<L>,
}

impl<I, L> FullTableCache<I, L> {
    pub fn new<M>(matcher: M) -> Self
    where
        M: Fn(&I, &L) -> bool + Send + Sync + 'static,
    {
        Self {
            matcher: Arc::new(matcher),
            records: Vec::new(),
        }
    }
}

#[async_trait]
impl<I, L> CacheManager<I, L> for FullTableCache<I, L>
where
    I: Send + Sync,
    L: Send + Sync,
{
    fn init(&mut self, records: Vec<L>) -> FlowResult<()> {
        self.records = records;
        Ok(())
    }

    fn contains(&self, _input: &I) -> bool {
        true
    }

    async fn add(&mut self, _input: &I) -> FlowResult<()> {
        Err(FlowError::Cache(
            "full table cache is loaded at init and cannot be extended".into(),
        ))
    }

    fn records(&self) -> Vec<&L> {
        self.records.iter().collect()
    }

    fn find(&self, input: &I) -> Option<&L> {
        self.records.iter().find(|record| (self.matcher)(input, record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finds_loaded_records_and_refuses_additions() {
        let mut cache = FullTableCache::new(|id: &u32, record: &(u32, String)| *id == record.0);
        cache
            .init(vec![(1, "one".to_string()), (2, "two".to_string())])
            .unwrap();

        assert!(cache.contains(&7));
        assert_eq!(cache.find(&2), Some(&(2, "two".to_string())));
        assert_eq!(cache.find(&7), None);
        assert!(cache.exists(&2));
        assert!(!cache.exists(&7));
        assert_eq!(cache.records().len(), 2);
        assert!(matches!(cache.add(&7).await, Err(FlowError::Cache(_))));
    }
}
