//! Input buffers of nodes.
//!
//! An [`InputPort`] is created with its node but only materialises its
//! channel when the node starts, so capacity can change freely until then.
//! Producers attach at link time and claim a sender when they start; the
//! port drops its own sender once every attached producer has claimed one,
//! which makes the channel close exactly when the last producer finishes.

use crate::completion::Completion;
use crate::error::{FlowError, FlowResult};
use arcstr::ArcStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sending half of a node buffer.
#[derive(Debug)]
pub enum PortSender<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

impl<T> Clone for PortSender<T> {
    fn clone(&self) -> Self {
        match self {
            PortSender::Bounded(tx) => PortSender::Bounded(tx.clone()),
            PortSender::Unbounded(tx) => PortSender::Unbounded(tx.clone()),
        }
    }
}

impl<T> PortSender<T> {
    /// Suspends while a bounded buffer is full. Hands the row back if the
    /// receiving node has gone away.
    pub async fn send(&self, row: T) -> Result<(), T> {
        match self {
            PortSender::Bounded(tx) => tx.send(row).await.map_err(|e| e.0),
            PortSender::Unbounded(tx) => tx.send(row).map_err(|e| e.0),
        }
    }
}

enum PortReceiver<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

impl<T> PortReceiver<T> {
    async fn recv(&mut self) -> Option<T> {
        match self {
            PortReceiver::Bounded(rx) => rx.recv().await,
            PortReceiver::Unbounded(rx) => rx.recv().await,
        }
    }
}

struct PortState<T> {
    capacity: Option<usize>,
    attached: usize,
    claimed: usize,
    opened: bool,
    sender: Option<PortSender<T>>,
    receiver: Option<PortReceiver<T>>,
    upstream: Vec<Completion>,
}

/// The input buffer of a node. Cheap to clone; clones share the buffer.
pub struct InputPort<T> {
    name: ArcStr,
    state: Arc<Mutex<PortState<T>>>,
}

impl<T> Clone for InputPort<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T: Send + 'static> InputPort<T> {
    pub fn new(name: ArcStr) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(PortState {
                capacity: None,
                attached: 0,
                claimed: 0,
                opened: false,
                sender: None,
                receiver: None,
                upstream: Vec::new(),
            })),
        }
    }

    pub fn name(&self) -> &ArcStr {
        &self.name
    }

    pub fn capacity(&self) -> Option<usize> {
        lock(&self.state).capacity
    }

    /// Sets the buffer capacity; `None` means unbounded.
    pub fn set_capacity(&self, capacity: Option<usize>) -> FlowResult<()> {
        let mut state = lock(&self.state);
        if state.opened {
            return Err(FlowError::AlreadyStarted(self.name.clone()));
        }
        state.capacity = capacity.map(|c| c.max(1));
        Ok(())
    }

    /// Registers a producer. Its completion is consulted when the buffer
    /// drains so that upstream faults reach this node.
    pub fn attach(&self, upstream: Completion) {
        let mut state = lock(&self.state);
        state.attached += 1;
        state.upstream.push(upstream);
    }

    /// Materialises the channel. `min_capacity` raises a bounded capacity
    /// for nodes that buffer whole batches. Idempotent.
    pub fn open(&self, min_capacity: usize) {
        let mut state = lock(&self.state);
        if state.opened {
            return;
        }
        state.opened = true;
        let (tx, rx) = match state.capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(min_capacity).max(1));
                (PortSender::Bounded(tx), PortReceiver::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (PortSender::Unbounded(tx), PortReceiver::Unbounded(rx))
            }
        };
        state.receiver = Some(rx);
        // A port nobody links to closes right away.
        if state.attached > state.claimed {
            state.sender = Some(tx);
        }
        debug!(port = %self.name, capacity = ?state.capacity, "input buffer opened");
    }

    /// Hands a sender to an attached producer that is starting.
    pub fn claim_sender(&self) -> FlowResult<PortSender<T>> {
        let mut state = lock(&self.state);
        let sender = state
            .sender
            .clone()
            .ok_or(FlowError::ChannelClosed("input port not open"))?;
        state.claimed += 1;
        if state.claimed >= state.attached {
            state.sender = None;
        }
        Ok(sender)
    }

    /// Takes the receiving side. Only the owning node's driver calls this.
    pub fn take_inbox(&self) -> FlowResult<Inbox<T>> {
        let mut state = lock(&self.state);
        let receiver = state
            .receiver
            .take()
            .ok_or(FlowError::ChannelClosed("input port already taken"))?;
        Ok(Inbox {
            port: self.name.clone(),
            receiver,
            upstream: state.upstream.clone(),
        })
    }
}

/// Receiving side of an [`InputPort`], owned by a node driver.
pub struct Inbox<T> {
    port: ArcStr,
    receiver: PortReceiver<T>,
    upstream: Vec<Completion>,
}

impl<T> Inbox<T> {
    pub fn port(&self) -> &ArcStr {
        &self.port
    }

    /// Next row in FIFO order, `Ok(None)` once every producer completed, or
    /// the aggregated upstream failure if any producer faulted.
    pub async fn recv(&mut self) -> FlowResult<Option<T>> {
        if let Some(row) = self.receiver.recv().await {
            return Ok(Some(row));
        }
        let mut causes = Vec::new();
        for upstream in &self.upstream {
            causes.extend(upstream.faults().await);
        }
        if causes.is_empty() {
            Ok(None)
        } else {
            Err(FlowError::Aggregate(causes))
        }
    }

    /// Drains the whole input into a list.
    pub async fn collect(&mut self) -> FlowResult<Vec<T>> {
        let mut rows = Vec::new();
        while let Some(row) = self.recv().await? {
            rows.push(row);
        }
        Ok(rows)
    }
}
