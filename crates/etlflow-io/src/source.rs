//! Execution contract shared by source nodes.

use async_trait::async_trait;
use etlflow_core::{FlowResult, Linkable, Node};
use std::sync::{Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Trait for data source nodes
///
/// Sources are the roots of a pipeline. Link every target first, then call
/// one of the `execute` methods; the source pushes its rows through its
/// links and completes exactly once. A cancelled source stops producing
/// between rows and completes normally, so downstream nodes still drain.
#[async_trait]
pub trait Source<T: Send + 'static>: Linkable<T> {
    /// Token checked between rows.
    fn cancellation(&self) -> &CancelSlot;

    /// Starts the source in the background.
    fn execute(&self) {
        self.start();
    }

    fn execute_with(&self, cancel: CancellationToken) {
        self.cancellation().set(cancel);
        self.start();
    }

    /// Starts the source and waits for it to finish producing.
    async fn execute_async(&self, cancel: CancellationToken) -> FlowResult<()> {
        self.execute_with(cancel);
        self.wait().await
    }
}

/// Holds the cancellation token a source checks while producing.
#[derive(Debug, Default)]
pub struct CancelSlot(Mutex<CancellationToken>);

impl CancelSlot {
    pub fn set(&self, cancel: CancellationToken) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = cancel;
    }

    pub fn token(&self) -> CancellationToken {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
