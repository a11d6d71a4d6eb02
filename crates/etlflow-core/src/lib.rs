//! # etlflow core
//!
//! Foundational types of the etlflow dataflow engine: the node runtime,
//! the link protocol between nodes, completion and fault propagation, the
//! error side-channel, run settings and the connection abstraction used by
//! database nodes.
//!
//! ## Key Components
//!
//! - **Node runtime**: every node owns an input buffer, a completion signal and
//!   a driver task ([`Node`], [`NodeCore`], [`InputPort`])
//! - **Links**: typed edges with keep/void predicates and conversion ([`Linkable`])
//! - **Error side-channel**: failures become [`ErrorRecord`]s ([`ErrorLinkable`])
//! - **Configuration**: [`FlowSettings`] and the YAML [`PipelineSpec`]
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use etlflow_core::{Linkable, Node};
//! use etlflow_io::{MemoryDestination, MemorySource, Source};
//! use etlflow_tx::RowTransformation;
//!
//! let source = MemorySource::new("numbers", 1..=10);
//! let double = RowTransformation::new("double", |n: i32| Ok(n * 2));
//! let dest = MemoryDestination::new("doubled");
//! source.link_to(&double).link_to(&dest);
//! source.execute();
//! dest.wait().await?;
//! ```

pub mod completion;
pub mod connection;
pub mod error;
pub mod error_record;
pub mod link;
pub mod node;
pub mod port;
pub mod row;
pub mod settings;
pub mod spec;

pub use completion::{Completion, NodeState};
pub use connection::{Connection, MemoryConnection, Query, ResultSet};
pub use error::{FlowError, FlowResult};
pub use error_record::{ErrorLinkable, ErrorOutbox, ErrorRecord, ErrorReporter};
pub use link::{Decision, Emitter, Linkable, Outbox};
pub use node::{NamedPort, Node, NodeCore, Progress, Target};
pub use port::{Inbox, InputPort, PortSender};
pub use row::{ArrayRow, ColumnMap, DynamicRow, Record, RowAccess};
pub use settings::FlowSettings;
pub use spec::{PipelineSpec, SinkSpec, SourceSpec, TransformSpec};
pub use tokio_util::sync::CancellationToken;
