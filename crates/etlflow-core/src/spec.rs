//! YAML pipeline specification.

use crate::error::{FlowError, FlowResult};
use crate::settings::FlowSettings;
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;

/// Complete pipeline specification loaded from YAML configuration
///
/// # Example YAML Configuration
///
/// ```yaml
/// name: "orders"
/// settings:
///   bounded_capacity: 64
/// sources:
///   - type: inline
///     id: "orders"
///     rows:
///       - { id: 1, region: "north" }
///       - { id: 2, region: "south" }
/// transforms:
///   - type: filter
///     id: "north-only"
///     field: "region"
///     pattern: "^north$"
/// sinks:
///   - type: stdout
///     id: "out"
/// edges:
///   - ["orders", "north-only"]
///   - ["north-only", "out"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Human-readable name of the pipeline
    pub name: String,

    #[serde(default)]
    pub settings: FlowSettings,

    pub sources: Vec<SourceSpec>,

    #[serde(default)]
    pub transforms: Vec<TransformSpec>,

    pub sinks: Vec<SinkSpec>,

    /// Directed edges `(from, to)` defining data flow between nodes
    pub edges: Vec<(String, String)>,

    /// Error links `(from, to)`; `to` must be an `errors` sink.
    #[serde(default)]
    pub error_edges: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceSpec {
    /// Rows written directly in the spec
    #[serde(rename = "inline")]
    Inline {
        id: String,
        rows: Vec<Map<String, Value>>,
    },
    /// `count` rows of the form `{ "id": n }`, `n` starting at 1
    #[serde(rename = "generate")]
    Generate { id: String, count: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransformSpec {
    #[serde(rename = "passthrough")]
    Passthrough { id: String },
    /// Keeps rows whose `field`, rendered as text, matches `pattern`
    #[serde(rename = "filter")]
    Filter {
        id: String,
        field: String,
        pattern: String,
    },
    #[serde(rename = "sort")]
    Sort {
        id: String,
        by: String,
        #[serde(default)]
        descending: bool,
    },
    #[serde(rename = "multicast")]
    Multicast { id: String },
    #[serde(rename = "duplicate")]
    Duplicate { id: String, copies: usize },
    /// Row-batch transformation that sets `field` to `value` on every row
    #[serde(rename = "batch_set")]
    BatchSet {
        id: String,
        #[serde(default)]
        batch_size: Option<usize>,
        field: String,
        value: Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SinkSpec {
    /// Prints rows as JSON lines
    #[serde(rename = "stdout")]
    Stdout { id: String },
    /// Collects rows and logs how many arrived
    #[serde(rename = "memory")]
    Memory { id: String },
    /// Prints error records as JSON lines
    #[serde(rename = "errors")]
    Errors { id: String },
}

impl SourceSpec {
    pub fn id(&self) -> &str {
        match self {
            SourceSpec::Inline { id, .. } | SourceSpec::Generate { id, .. } => id,
        }
    }
}

impl TransformSpec {
    pub fn id(&self) -> &str {
        match self {
            TransformSpec::Passthrough { id }
            | TransformSpec::Filter { id, .. }
            | TransformSpec::Sort { id, .. }
            | TransformSpec::Multicast { id }
            | TransformSpec::Duplicate { id, .. }
            | TransformSpec::BatchSet { id, .. } => id,
        }
    }
}

impl SinkSpec {
    pub fn id(&self) -> &str {
        match self {
            SinkSpec::Stdout { id } | SinkSpec::Memory { id } | SinkSpec::Errors { id } => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Source,
    Transform,
    Sink,
    ErrorSink,
}

impl PipelineSpec {
    pub fn from_yaml(yaml: &str) -> FlowResult<Self> {
        let spec: PipelineSpec = serde_yaml::from_str(yaml).map_err(|e| FlowError::Other(e.into()))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn load(path: impl AsRef<Path>) -> FlowResult<Self> {
        let yaml = std::fs::read_to_string(path.as_ref()).map_err(|e| FlowError::Other(e.into()))?;
        Self::from_yaml(&yaml)
    }

    /// Checks ids, edge endpoints and acyclicity.
    pub fn validate(&self) -> FlowResult<()> {
        self.settings.validate()?;
        self.graph().map(|_| ())
    }

    /// Node ids in an order where every edge points forward.
    pub fn topological_order(&self) -> FlowResult<Vec<String>> {
        let (graph, _) = self.graph()?;
        let order = toposort(&graph, None).map_err(|_| self.invalid("pipeline graph has a cycle"))?;
        Ok(order.into_iter().map(|i| graph[i].clone()).collect())
    }

    fn invalid(&self, message: impl Into<String>) -> FlowError {
        FlowError::Config {
            node: self.name.as_str().into(),
            message: message.into(),
        }
    }

    fn graph(&self) -> FlowResult<(DiGraph<String, ()>, HashMap<String, Role>)> {
        let mut graph = DiGraph::new();
        let mut index: HashMap<String, NodeIndex> = HashMap::new();
        let mut roles: HashMap<String, Role> = HashMap::new();

        let ids = self
            .sources
            .iter()
            .map(|s| (s.id(), Role::Source))
            .chain(self.transforms.iter().map(|t| (t.id(), Role::Transform)))
            .chain(self.sinks.iter().map(|s| match s {
                SinkSpec::Errors { id } => (id.as_str(), Role::ErrorSink),
                other => (other.id(), Role::Sink),
            }));
        for (id, role) in ids {
            if roles.insert(id.to_string(), role).is_some() {
                return Err(self.invalid(format!("duplicate node id `{id}`")));
            }
            index.insert(id.to_string(), graph.add_node(id.to_string()));
        }

        let lookup = |id: &str| {
            index
                .get(id)
                .copied()
                .ok_or_else(|| self.invalid(format!("edge references unknown node `{id}`")))
        };

        for (from, to) in &self.edges {
            let (a, b) = (lookup(from)?, lookup(to)?);
            if matches!(roles[from], Role::Sink | Role::ErrorSink) {
                return Err(self.invalid(format!("sink `{from}` cannot have outgoing edges")));
            }
            match roles[to] {
                Role::Source => return Err(self.invalid(format!("source `{to}` cannot have incoming edges"))),
                Role::ErrorSink => return Err(self.invalid(format!("`{to}` only accepts error edges"))),
                _ => {}
            }
            graph.add_edge(a, b, ());
        }
        for (from, to) in &self.error_edges {
            let (a, b) = (lookup(from)?, lookup(to)?);
            if roles[to] != Role::ErrorSink {
                return Err(self.invalid(format!("error edge target `{to}` is not an errors sink")));
            }
            graph.add_edge(a, b, ());
        }

        if is_cyclic_directed(&graph) {
            return Err(self.invalid("pipeline graph has a cycle"));
        }
        Ok((graph, roles))
    }
}
