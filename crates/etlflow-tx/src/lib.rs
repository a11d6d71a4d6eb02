//! Transformation nodes.
//!
//! Row-wise nodes ([`RowTransformation`], [`RowMultiplication`]) process one
//! row at a time and stream. Block-wise nodes ([`BlockTransformation`],
//! [`Sort`]) need the whole input before emitting anything. In between,
//! [`RowBatchTransformation`] works on fixed-size chunks. Lookups enrich
//! rows from a [`cache`] filled by a second source; joins and fan-out nodes
//! have more than one input or output.

use std::sync::{Mutex, MutexGuard, PoisonError};

mod batch;
mod block;
pub mod cache;
mod join;
mod lookup;
mod multicast;
mod row;

pub use batch::RowBatchTransformation;
pub use block::{BlockTransformation, Sort};
pub use cache::CacheManager;
pub use join::{CrossJoin, MergeJoin, UnpairedPolicy};
pub use lookup::LookupTransformation;
pub use multicast::{Multicast, RowDuplication};
pub use row::{RowMultiplication, RowTransformation};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
