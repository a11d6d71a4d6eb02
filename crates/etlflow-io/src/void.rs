use arcstr::ArcStr;
use async_trait::async_trait;
use etlflow_core::{FlowResult, InputPort, Node, NodeCore, Target};
use std::sync::Arc;
use tracing::debug;

/// Destination that discards every row. Useful to terminate a branch whose
/// output nobody needs while still awaiting its completion.
pub struct VoidDestination<T> {
    inner: Arc<VoidInner<T>>,
}

struct VoidInner<T> {
    core: NodeCore,
    input: InputPort<T>,
}

impl<T> Clone for VoidDestination<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> VoidDestination<T> {
    pub fn new(name: impl Into<ArcStr>) -> Self {
        let core = NodeCore::new(name);
        let input = InputPort::new(core.name().clone());
        Self {
            inner: Arc::new(VoidInner { core, input }),
        }
    }
}

impl<T: Send + 'static> VoidInner<T> {
    async fn run(&self) -> FlowResult<()> {
        let mut inbox = self.input.take_inbox()?;
        let progress = self.core.progress();
        while inbox.recv().await?.is_some() {
            progress.add(1);
        }
        debug!(node = %self.core.name(), rows = progress.count(), "discarded");
        Ok(())
    }
}

#[async_trait]
impl<T: Send + 'static> Node for VoidDestination<T> {
    fn core(&self) -> &NodeCore {
        &self.inner.core
    }

    fn start(&self) {
        if !self.inner.core.begin_start() {
            return;
        }
        self.inner.input.open(0);
        let inner = self.inner.clone();
        self.inner.core.spawn(async move { inner.run().await });
    }

    fn set_bounded_capacity(&self, capacity: Option<usize>) -> FlowResult<()> {
        self.inner.input.set_capacity(capacity)
    }
}

impl<T: Send + 'static> Target<T> for VoidDestination<T> {
    fn input(&self) -> &InputPort<T> {
        &self.inner.input
    }
}
