use super::CacheManager;
use async_trait::async_trait;
use etlflow_core::FlowResult;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

type HashFn<T> = Arc<dyn Fn(&T) -> u64 + Send + Sync>;

/// Hash of any hashable value, for use with [`HashCache`].
pub fn hash_of<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Remembers only a hash per lookup record.
///
/// Answers existence checks; records themselves are never kept, so
/// `records` is empty and `find` is always `None`.
pub struct HashCache<I, L> {
    input_hash: HashFn<I>,
    record_hash: HashFn<L>,
    hashes: HashSet<u64>,
}

impl<I, L> HashCache<I, L> {
    pub fn new<A, B>(input_hash: A, record_hash: B) -> Self
    where
        A: Fn(&I) -> u64 + Send + Sync + 'static,
        B: Fn(&L) -> u64 + Send + Sync + 'static,
    {
        Self {
            input_hash: Arc::new(input_hash),
            record_hash: Arc::new(record_hash),
            hashes: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

#[async_trait]
impl<I, L> CacheManager<I, L> for HashCache<I, L>
where
    I: Send + Sync,
    L: Send + Sync,
{
    fn init(&mut self, records: Vec<L>) -> FlowResult<()> {
        self.hashes = records.iter().map(|r| (self.record_hash)(r)).collect();
        Ok(())
    }

    fn contains(&self, input: &I) -> bool {
        self.hashes.contains(&(self.input_hash)(input))
    }

    /// Remembers the hash of `input`.
    async fn add(&mut self, input: &I) -> FlowResult<()> {
        self.hashes.insert((self.input_hash)(input));
        Ok(())
    }

    fn records(&self) -> Vec<&L> {
        Vec::new()
    }

    fn find(&self, _input: &I) -> Option<&L> {
        None
    }

    fn exists(&self, input: &I) -> bool {
        self.contains(input)
    }
}
