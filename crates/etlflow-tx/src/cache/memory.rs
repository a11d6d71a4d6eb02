use super::CacheManager;
use async_trait::async_trait;
use etlflow_core::{FlowResult, FlowSettings};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

type Matcher<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Bounded cache of record copies.
///
/// Keeps at most `max_cache_size` records; past that the oldest record is
/// evicted first (insertion order, not recency of use).
pub struct MemoryCache<T> {
    matcher: Matcher<T>,
    records: VecDeque<T>,
    max_size: Option<usize>,
    default_max_size: usize,
}

impl<T: Clone> MemoryCache<T> {
    pub fn new<M>(matcher: M) -> Self
    where
        M: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self {
            matcher: Arc::new(matcher),
            records: VecDeque::new(),
            max_size: None,
            default_max_size: FlowSettings::default().max_cache_size,
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size.max(1));
        self
    }

    pub fn max_size(&self) -> usize {
        self.max_size.unwrap_or(self.default_max_size)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn push(&mut self, record: T) {
        self.records.push_back(record);
        while self.records.len() > self.max_size() {
            self.records.pop_front();
            trace!("memory cache evicted oldest record");
        }
    }
}

#[async_trait]
impl<T> CacheManager<T, T> for MemoryCache<T>
where
    T: Clone + Send + Sync,
{
    fn init(&mut self, records: Vec<T>) -> FlowResult<()> {
        self.records.clear();
        for record in records {
            self.push(record);
        }
        Ok(())
    }

    fn contains(&self, input: &T) -> bool {
        self.records.iter().any(|record| (self.matcher)(input, record))
    }

    /// Stores a copy of `input`.
    async fn add(&mut self, input: &T) -> FlowResult<()> {
        self.push(input.clone());
        Ok(())
    }

    fn records(&self) -> Vec<&T> {
        self.records.iter().collect()
    }

    fn find(&self, input: &T) -> Option<&T> {
        self.records.iter().find(|record| (self.matcher)(input, record))
    }

    fn configure(&mut self, settings: &FlowSettings) {
        self.default_max_size = settings.max_cache_size.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn evicts_oldest_past_the_bound() {
        let mut cache = MemoryCache::new(|a: &u32, b: &u32| a == b).with_max_size(3);
        cache.init(vec![1, 2]).unwrap();
        cache.add(&3).await.unwrap();
        cache.add(&4).await.unwrap();

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&1));
        assert!(cache.contains(&4));
        assert_eq!(cache.records(), vec![&2, &3, &4]);
    }

    #[test]
    fn default_bound_comes_from_settings() {
        let mut cache = MemoryCache::new(|a: &u32, b: &u32| a == b);
        assert_eq!(cache.max_size(), 10_000);
        let settings = FlowSettings {
            max_cache_size: 5,
            ..FlowSettings::default()
        };
        CacheManager::<u32, u32>::configure(&mut cache, &settings);
        assert_eq!(cache.max_size(), 5);
        assert!(cache.is_empty());
    }
}
