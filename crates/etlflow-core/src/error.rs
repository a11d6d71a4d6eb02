//! Error types for dataflow execution.

use arcstr::ArcStr;
use std::fmt;
use std::sync::Arc;

/// Result alias used throughout the engine.
pub type FlowResult<T> = std::result::Result<T, FlowError>;

/// Error types specific to etlflow pipeline operations
///
/// Errors raised by user closures are carried as [`anyhow::Error`] inside
/// [`FlowError::Node`]; the remaining variants are raised by the runtime itself.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// A node's processing step failed and no error link absorbed the failure.
    #[error("node `{node}` failed: {source:#}")]
    Node {
        node: ArcStr,
        #[source]
        source: anyhow::Error,
    },

    /// One or more nodes in the upstream graph faulted.
    ///
    /// Returned by [`Completion::wait`](crate::Completion::wait); holds the
    /// flattened root causes, never another `Aggregate`.
    #[error("{}", AggregateDisplay(.0))]
    Aggregate(Vec<Arc<FlowError>>),

    /// The node was asked to do something its contract forbids, e.g. a batch
    /// transformation returned no result at all.
    #[error("invalid operation in `{node}`: {message}")]
    InvalidOperation { node: ArcStr, message: String },

    /// A required property was missing or invalid when the node started.
    #[error("invalid configuration for `{node}`: {message}")]
    Config { node: ArcStr, message: String },

    /// Buffers are materialised at start; they cannot be reshaped afterwards.
    #[error("node `{0}` has already started")]
    AlreadyStarted(ArcStr),

    /// A merge join finished with rows left on one side.
    #[error("merge join `{node}` left {left} left row(s) and {right} right row(s) unpaired")]
    UnpairedRows {
        node: ArcStr,
        left: usize,
        right: usize,
    },

    /// A cache manager was used outside its contract.
    #[error("cache error: {0}")]
    Cache(String),

    /// A connection or command failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Channel communication error
    ///
    /// Occurs when a buffer between nodes is unexpectedly unavailable.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// A user closure panicked inside a node driver.
    #[error("node `{node}` panicked: {message}")]
    Panicked { node: ArcStr, message: String },

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FlowError {
    pub fn node(node: &ArcStr, source: impl Into<anyhow::Error>) -> Self {
        FlowError::Node {
            node: node.clone(),
            source: source.into(),
        }
    }

    pub fn config(node: &ArcStr, message: impl Into<String>) -> Self {
        FlowError::Config {
            node: node.clone(),
            message: message.into(),
        }
    }

    pub fn invalid_operation(node: &ArcStr, message: impl Into<String>) -> Self {
        FlowError::InvalidOperation {
            node: node.clone(),
            message: message.into(),
        }
    }

    /// Flattens this error into its root causes.
    pub fn into_causes(self) -> Vec<Arc<FlowError>> {
        match self {
            FlowError::Aggregate(causes) => causes,
            other => vec![Arc::new(other)],
        }
    }

    /// Root causes of an aggregate, or the error itself.
    pub fn causes(&self) -> Vec<&FlowError> {
        match self {
            FlowError::Aggregate(causes) => causes.iter().map(|c| c.as_ref()).collect(),
            other => vec![other],
        }
    }
}

struct AggregateDisplay<'a>(&'a [Arc<FlowError>]);

impl fmt::Display for AggregateDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "one or more errors occurred ({})", self.0.len())?;
        for (i, cause) in self.0.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{cause}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arcstr::literal;

    #[test]
    fn aggregate_lists_every_cause() {
        let err = FlowError::Aggregate(vec![
            Arc::new(FlowError::node(&literal!("a"), anyhow::anyhow!("boom"))),
            Arc::new(FlowError::Cache("full".into())),
        ]);
        let text = err.to_string();
        assert!(text.starts_with("one or more errors occurred (2)"));
        assert!(text.contains("node `a` failed: boom"));
        assert!(text.contains("cache error: full"));
    }

    #[test]
    fn into_causes_flattens_aggregates() {
        let single = FlowError::Cache("x".into()).into_causes();
        assert_eq!(single.len(), 1);

        let agg = FlowError::Aggregate(vec![
            Arc::new(FlowError::ChannelClosed("a")),
            Arc::new(FlowError::ChannelClosed("b")),
        ]);
        assert_eq!(agg.causes().len(), 2);
        assert_eq!(agg.into_causes().len(), 2);
    }
}
