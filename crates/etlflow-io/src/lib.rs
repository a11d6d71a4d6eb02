//! # etlflow I/O - Source and Destination Nodes
//!
//! The roots and leaves of an etlflow pipeline.
//!
//! ## Sources
//! - **Memory**: emits a list of rows, `None` entries are skipped
//! - **Custom**: pulls rows from a callback until a completion callback says stop
//! - **Database**: runs one [`Query`](etlflow_core::Query) through a
//!   [`Connection`](etlflow_core::Connection)
//!
//! ## Destinations
//! - **Memory**: collects rows for inspection after `wait`
//! - **Custom**: hands each row to a callback
//! - **Database**: bulk-inserts batches inside transactions
//! - **JSON lines**: one JSON document per row, e.g. on stdout
//! - **Void**: discards rows
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use etlflow_core::{Linkable, Node};
//! use etlflow_io::{MemoryDestination, MemorySource, Source};
//!
//! let source = MemorySource::new("numbers", 1..=3);
//! let dest = MemoryDestination::new("collected");
//! source.link_to(&dest);
//! source.execute();
//! dest.wait().await?;
//! assert_eq!(dest.data(), vec![1, 2, 3]);
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod custom;
pub mod db;
pub mod memory;
pub mod source;
pub mod stdout;
pub mod void;

pub use custom::{CustomDestination, CustomSource};
pub use db::{DbDestination, DbSource};
pub use memory::{MemoryDestination, MemorySource};
pub use source::{CancelSlot, Source};
pub use stdout::JsonLinesDestination;
pub use void::VoidDestination;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
