//! Error side-channel.
//!
//! A node with an error link turns a failing row (or every row of a failing
//! batch) into an [`ErrorRecord`] and carries on with the next unit of work.
//! Without an error link the same failure faults the node.

use crate::completion::Completion;
use crate::error::{FlowError, FlowResult};
use crate::node::{Node, Target};
use crate::port::{lock, InputPort, PortSender};
use arcstr::ArcStr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// A failure routed to an error link instead of aborting the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Top-level error message.
    pub error_text: String,
    pub report_time: DateTime<Utc>,
    /// The full error chain.
    pub exception: String,
    /// Best-effort JSON rendering of the offending row.
    pub record_as_json: Option<String>,
}

impl ErrorRecord {
    pub fn new(error: &anyhow::Error, record_as_json: Option<String>) -> Self {
        Self {
            error_text: error.to_string(),
            report_time: Utc::now(),
            exception: format!("{error:#}"),
            record_as_json,
        }
    }
}

pub type Describe<T> = Arc<dyn Fn(&T) -> Option<String> + Send + Sync>;

struct ErrorLink<T> {
    target: Arc<dyn Node>,
    port: InputPort<ErrorRecord>,
    describe: Describe<T>,
}

/// The error link of a node, if any.
pub struct ErrorOutbox<T> {
    owner: ArcStr,
    link: Mutex<Option<ErrorLink<T>>>,
}

impl<T: Send + 'static> ErrorOutbox<T> {
    pub fn new(owner: ArcStr) -> Self {
        Self {
            owner,
            link: Mutex::new(None),
        }
    }

    pub fn is_linked(&self) -> bool {
        lock(&self.link).is_some()
    }

    pub fn link<D: Target<ErrorRecord>>(&self, upstream: Completion, target: &D, describe: Describe<T>) {
        let mut link = lock(&self.link);
        if link.is_some() {
            warn!(node = %self.owner, "error link replaced");
        }
        target.input().attach(upstream);
        *link = Some(ErrorLink {
            target: Arc::new(target.clone()),
            port: target.input().clone(),
            describe,
        });
    }

    pub fn start_target(&self) {
        let target = lock(&self.link).as_ref().map(|l| l.target.clone());
        if let Some(target) = target {
            target.start();
        }
    }

    pub fn open(&self) -> FlowResult<ErrorReporter<T>> {
        let link = lock(&self.link);
        let (sender, describe) = match link.as_ref() {
            Some(l) => (Some(l.port.claim_sender()?), Some(l.describe.clone())),
            None => (None, None),
        };
        Ok(ErrorReporter {
            node: self.owner.clone(),
            sender,
            describe,
            reported: 0,
        })
    }
}

/// Driver-side view of an [`ErrorOutbox`].
pub struct ErrorReporter<T> {
    node: ArcStr,
    sender: Option<PortSender<ErrorRecord>>,
    describe: Option<Describe<T>>,
    reported: u64,
}

impl<T> ErrorReporter<T> {
    pub fn is_linked(&self) -> bool {
        self.sender.is_some()
    }

    pub fn reported(&self) -> u64 {
        self.reported
    }

    /// JSON of `row` for a later report; `None` when there is no error link,
    /// so unlinked nodes never pay for serialisation.
    pub fn snapshot(&self, row: &T) -> Option<String> {
        match (&self.sender, &self.describe) {
            (Some(_), Some(describe)) => describe(row),
            _ => None,
        }
    }

    /// Routes `error` to the error link, or returns it as the node's fault
    /// when there is none.
    pub async fn report(&mut self, error: anyhow::Error, record_as_json: Option<String>) -> FlowResult<()> {
        self.report_many(error, vec![record_as_json]).await
    }

    /// One record per row of a failed unit of work.
    pub async fn report_many(
        &mut self,
        error: anyhow::Error,
        records_as_json: Vec<Option<String>>,
    ) -> FlowResult<()> {
        let Some(sender) = &self.sender else {
            return Err(FlowError::node(&self.node, error));
        };
        warn!(node = %self.node, rows = records_as_json.len(), error = %error, "routing failure to error link");
        for json in records_as_json {
            if sender.send(ErrorRecord::new(&error, json)).await.is_err() {
                return Err(FlowError::node(&self.node, error));
            }
            self.reported += 1;
        }
        Ok(())
    }
}

/// Nodes that can redirect failures of rows of type `T`.
pub trait ErrorLinkable<T: Send + 'static>: Node + Sized {
    fn error_outbox(&self) -> &ErrorOutbox<T>;

    /// Sends failures to `target` as [`ErrorRecord`]s instead of faulting.
    fn link_errors_to<'a, D: Target<ErrorRecord>>(&self, target: &'a D) -> &'a D
    where
        T: Serialize,
    {
        self.error_outbox().link(
            self.completion(),
            target,
            Arc::new(|row: &T| serde_json::to_string(row).ok()),
        );
        target
    }
}
