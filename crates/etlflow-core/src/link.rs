//! Links between nodes.
//!
//! A link is a typed edge from a node's [`Outbox`] to another node's
//! [`InputPort`], optionally guarded by a keep predicate, a void predicate
//! and a row converter. Regular nodes hand each row to the first link that
//! keeps it; multicast nodes hand a clone to every link that keeps it.
//! Within one link rows arrive in the order they were sent.

use crate::completion::Completion;
use crate::error::FlowResult;
use crate::node::{Node, Target};
use crate::port::{lock, InputPort, PortSender};
use arcstr::ArcStr;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

pub type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
pub type Converter<T, U> = Arc<dyn Fn(T) -> U + Send + Sync>;

/// What a link does with an offered row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Deliver the row to the link's target.
    Keep,
    /// Consume and discard the row.
    Void,
    /// Not for this link.
    Skip,
}

#[async_trait]
trait Edge<T>: Send + Sync {
    fn target(&self) -> &ArcStr;

    fn decide(&self, row: &T) -> Decision;

    fn open(&mut self) -> FlowResult<()>;

    /// False if the target has gone away; the row is dropped in that case.
    async fn deliver(&mut self, row: T) -> bool;
}

struct LinkEdge<T, U> {
    target: ArcStr,
    port: InputPort<U>,
    keep: Option<Predicate<T>>,
    void: Option<Predicate<T>>,
    convert: Converter<T, U>,
    sender: Option<PortSender<U>>,
    closed: bool,
}

#[async_trait]
impl<T, U> Edge<T> for LinkEdge<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn target(&self) -> &ArcStr {
        &self.target
    }

    fn decide(&self, row: &T) -> Decision {
        if self.closed {
            return Decision::Skip;
        }
        match &self.keep {
            None => Decision::Keep,
            Some(keep) if keep(row) => Decision::Keep,
            Some(_) => match &self.void {
                Some(void) if void(row) => Decision::Void,
                _ => Decision::Skip,
            },
        }
    }

    fn open(&mut self) -> FlowResult<()> {
        self.sender = Some(self.port.claim_sender()?);
        Ok(())
    }

    async fn deliver(&mut self, row: T) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        let row = (self.convert)(row);
        if sender.send(row).await.is_ok() {
            return true;
        }
        warn!(target_node = %self.target, "link target is gone, closing link");
        self.closed = true;
        self.sender = None;
        false
    }
}

struct LinkEntry<T> {
    target: Arc<dyn Node>,
    edge: Box<dyn Edge<T>>,
}

struct OutboxState<T> {
    links: Vec<LinkEntry<T>>,
    opened: bool,
}

/// Outgoing links of a node, in registration order.
pub struct Outbox<T> {
    owner: ArcStr,
    state: Mutex<OutboxState<T>>,
}

impl<T: Send + 'static> Outbox<T> {
    pub fn new(owner: ArcStr) -> Self {
        Self {
            owner,
            state: Mutex::new(OutboxState {
                links: Vec::new(),
                opened: false,
            }),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.state).links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers an edge to `target`. Links added after the owner started
    /// are ignored with a warning.
    pub fn link<U, D>(
        &self,
        upstream: Completion,
        target: &D,
        keep: Option<Predicate<T>>,
        void: Option<Predicate<T>>,
        convert: Converter<T, U>,
    ) where
        U: Send + 'static,
        D: Target<U>,
    {
        let mut state = lock(&self.state);
        if state.opened {
            warn!(node = %self.owner, target_node = %target.name(), "node already started, link ignored");
            return;
        }
        target.input().attach(upstream);
        debug!(node = %self.owner, target_node = %target.name(), "linked");
        state.links.push(LinkEntry {
            target: Arc::new(target.clone()),
            edge: Box::new(LinkEdge {
                target: target.name().clone(),
                port: target.input().clone(),
                keep,
                void,
                convert,
                sender: None,
                closed: false,
            }),
        });
    }

    /// Starts every linked target.
    pub fn start_targets(&self) {
        let targets: Vec<Arc<dyn Node>> = lock(&self.state)
            .links
            .iter()
            .map(|l| l.target.clone())
            .collect();
        for target in targets {
            target.start();
        }
    }

    /// Claims senders on every link and hands them to the driver.
    pub fn open(&self) -> FlowResult<Emitter<T>> {
        let mut state = lock(&self.state);
        state.opened = true;
        let mut edges = Vec::with_capacity(state.links.len());
        for entry in state.links.drain(..) {
            let mut edge = entry.edge;
            edge.open()?;
            edges.push(edge);
        }
        Ok(Emitter {
            owner: self.owner.clone(),
            edges,
            dropped: 0,
        })
    }
}

/// Driver-side view of an [`Outbox`].
pub struct Emitter<T> {
    owner: ArcStr,
    edges: Vec<Box<dyn Edge<T>>>,
    dropped: u64,
}

impl<T: Send + 'static> Emitter<T> {
    pub fn is_linked(&self) -> bool {
        !self.edges.is_empty()
    }

    /// Rows no link accepted so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Offers `row` to the links in order; the first that keeps it gets it.
    /// A void decision discards the row. Rows nobody wants are dropped.
    pub async fn send(&mut self, row: T) {
        let mut chosen = None;
        for (i, edge) in self.edges.iter().enumerate() {
            match edge.decide(&row) {
                Decision::Keep => {
                    chosen = Some(i);
                    break;
                }
                Decision::Void => return,
                Decision::Skip => {}
            }
        }
        match chosen {
            Some(i) => {
                self.edges[i].deliver(row).await;
            }
            None => self.drop_row(),
        }
    }

    pub async fn send_all(&mut self, rows: impl IntoIterator<Item = T>) {
        for row in rows {
            self.send(row).await;
        }
    }

    /// Sends an optional row; `None` is the skip sentinel and never leaves
    /// the node.
    pub async fn send_opt(&mut self, row: Option<T>) {
        if let Some(row) = row {
            self.send(row).await;
        }
    }

    fn drop_row(&mut self) {
        self.dropped += 1;
        trace!(node = %self.owner, "row matched no link, dropped");
    }
}

impl<T: Clone + Send + 'static> Emitter<T> {
    /// Hands a copy of `row` to every link that keeps it.
    pub async fn broadcast(&mut self, row: T) {
        let keepers: Vec<usize> = self
            .edges
            .iter()
            .enumerate()
            .filter(|(_, edge)| edge.decide(&row) == Decision::Keep)
            .map(|(i, _)| i)
            .collect();
        if keepers.is_empty() {
            self.drop_row();
            return;
        }
        let last = keepers.len() - 1;
        let mut row = Some(row);
        for (n, i) in keepers.into_iter().enumerate() {
            let copy = if n == last { row.take() } else { row.clone() };
            if let Some(copy) = copy {
                if !self.edges[i].deliver(copy).await {
                    debug!(node = %self.owner, target_node = %self.edges[i].target(), "broadcast target closed");
                }
            }
        }
    }
}

/// Nodes with an output of row type `T`.
pub trait Linkable<T: Send + 'static>: Node + Sized {
    fn outbox(&self) -> &Outbox<T>;

    /// Links every row to `target`. Returns the target for chaining.
    fn link_to<'a, D: Target<T>>(&self, target: &'a D) -> &'a D {
        self.outbox()
            .link::<T, D>(self.completion(), target, None, None, Arc::new(|row: T| row));
        target
    }

    /// Links the rows for which `keep` holds.
    fn link_to_if<'a, D, K>(&self, target: &'a D, keep: K) -> &'a D
    where
        D: Target<T>,
        K: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.outbox().link::<T, D>(
            self.completion(),
            target,
            Some(Arc::new(keep)),
            None,
            Arc::new(|row: T| row),
        );
        target
    }

    /// Rows matching `keep` go to `target`, rows matching `void` are
    /// discarded, rows matching neither are offered to later links.
    ///
    /// A row matching neither is dropped silently only when no later link
    /// accepts it. On a multicast every link sees every row, so there the
    /// `void` predicate only keeps rows away from `target`.
    fn link_to_filtered<'a, D, K, V>(&self, target: &'a D, keep: K, void: V) -> &'a D
    where
        D: Target<T>,
        K: Fn(&T) -> bool + Send + Sync + 'static,
        V: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.outbox().link::<T, D>(
            self.completion(),
            target,
            Some(Arc::new(keep)),
            Some(Arc::new(void)),
            Arc::new(|row: T| row),
        );
        target
    }

    /// Links to a target of another row type, converting at the edge.
    fn link_to_with<'a, U, D, F>(&self, target: &'a D, convert: F) -> &'a D
    where
        U: Send + 'static,
        D: Target<U>,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.outbox()
            .link(self.completion(), target, None, None, Arc::new(convert));
        target
    }
}
