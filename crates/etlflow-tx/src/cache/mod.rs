//! Cache managers for lookup transformations.
//!
//! A cache manager decides how much of the lookup source is kept and how
//! an input row finds its lookup record. The lookup transformation
//! initialises it once from the lookup source and then uses it from its
//! own driver only, so implementations need no internal locking.

use async_trait::async_trait;
use etlflow_core::{FlowResult, FlowSettings};

mod full;
mod hash;
mod memory;
mod partial;

pub use full::FullTableCache;
pub use hash::{hash_of, HashCache};
pub use memory::MemoryCache;
pub use partial::PartialCache;

/// Caching strategy behind a lookup transformation.
///
/// `I` is the row being enriched, `L` the lookup record.
#[async_trait]
pub trait CacheManager<I: Send + Sync, L>: Send {
    /// Loads the rows read from the lookup source. Called once, before the
    /// first input row.
    fn init(&mut self, records: Vec<L>) -> FlowResult<()>;

    /// Whether the materialised records can answer for `input`.
    fn contains(&self, input: &I) -> bool;

    /// Materialises the records for `input`.
    async fn add(&mut self, input: &I) -> FlowResult<()>;

    /// Every materialised record.
    fn records(&self) -> Vec<&L>;

    /// The record matching `input`, if one is materialised.
    fn find(&self, input: &I) -> Option<&L>;

    /// Whether a record matching `input` is materialised. Caches that keep
    /// no records override this.
    fn exists(&self, input: &I) -> bool {
        self.find(input).is_some()
    }

    /// True for caches that fill themselves through [`add`](Self::add) on a
    /// miss.
    fn loads_on_demand(&self) -> bool {
        false
    }

    fn configure(&mut self, settings: &FlowSettings) {
        let _ = settings;
    }
}
