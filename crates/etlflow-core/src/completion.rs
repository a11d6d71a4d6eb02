//! Completion signal of a node.

use crate::error::{FlowError, FlowResult};
use arcstr::ArcStr;
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle of a node.
#[derive(Debug, Clone)]
pub enum NodeState {
    Created,
    Running,
    Completed,
    /// Root causes of the failure, flattened.
    Faulted(Vec<Arc<FlowError>>),
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Completed | NodeState::Faulted(_))
    }
}

/// Awaitable handle on a node's completion. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Completion {
    node: ArcStr,
    rx: watch::Receiver<NodeState>,
}

impl Completion {
    pub fn node(&self) -> &ArcStr {
        &self.node
    }

    pub fn state(&self) -> NodeState {
        self.rx.borrow().clone()
    }

    /// Waits until the node completed or faulted.
    ///
    /// A faulted node yields [`FlowError::Aggregate`] with every root cause
    /// collected along its upstream graph.
    pub async fn wait(&self) -> FlowResult<()> {
        match self.terminal_state().await? {
            NodeState::Faulted(causes) => Err(FlowError::Aggregate(causes)),
            _ => Ok(()),
        }
    }

    /// Root causes if the node faulted, empty if it completed.
    pub(crate) async fn faults(&self) -> Vec<Arc<FlowError>> {
        match self.terminal_state().await {
            Ok(NodeState::Faulted(causes)) => causes,
            Ok(_) => Vec::new(),
            Err(e) => vec![Arc::new(e)],
        }
    }

    async fn terminal_state(&self) -> FlowResult<NodeState> {
        let mut rx = self.rx.clone();
        let state = match rx.wait_for(NodeState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => return Err(FlowError::ChannelClosed("completion")),
        };
        Ok(state)
    }
}

/// Write side of a [`Completion`], owned by the node's runtime.
#[derive(Debug)]
pub(crate) struct CompletionSource {
    node: ArcStr,
    tx: watch::Sender<NodeState>,
}

impl CompletionSource {
    pub(crate) fn new(node: ArcStr) -> Self {
        let (tx, _) = watch::channel(NodeState::Created);
        Self { node, tx }
    }

    pub(crate) fn subscribe(&self) -> Completion {
        Completion {
            node: self.node.clone(),
            rx: self.tx.subscribe(),
        }
    }

    pub(crate) fn set_running(&self) {
        self.tx.send_replace(NodeState::Running);
    }

    pub(crate) fn finish(&self, result: FlowResult<()>) {
        let state = match result {
            Ok(()) => NodeState::Completed,
            Err(e) => NodeState::Faulted(e.into_causes()),
        };
        self.tx.send_replace(state);
    }
}
