//! Turns a [`PipelineSpec`] into linked nodes of [`DynamicRow`]s.

use anyhow::{bail, Context, Result};
use etlflow_core::{
    DynamicRow, ErrorLinkable, ErrorRecord, Linkable, Node, PipelineSpec, RowAccess, SinkSpec, SourceSpec, Target,
    TransformSpec,
};
use etlflow_io::{JsonLinesDestination, MemoryDestination, MemorySource, Source};
use etlflow_tx::{Multicast, RowBatchTransformation, RowDuplication, RowTransformation, Sort};
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

type Row = DynamicRow;

/// One node of a spec-built pipeline.
enum Stage {
    Source(MemorySource<Row>),
    Row(RowTransformation<Row, Row>),
    Sort(Sort<Row>),
    Multicast(Multicast<Row>),
    Duplicate(RowDuplication<Row>),
    Batch(RowBatchTransformation<Row, Row>),
    Stdout(JsonLinesDestination<Row>),
    Memory(MemoryDestination<Row>),
    Errors(JsonLinesDestination<ErrorRecord>),
}

impl Stage {
    fn node(&self) -> &dyn Node {
        match self {
            Stage::Source(n) => n,
            Stage::Row(n) => n,
            Stage::Sort(n) => n,
            Stage::Multicast(n) => n,
            Stage::Duplicate(n) => n,
            Stage::Batch(n) => n,
            Stage::Stdout(n) => n,
            Stage::Memory(n) => n,
            Stage::Errors(n) => n,
        }
    }

    fn is_sink(&self) -> bool {
        matches!(self, Stage::Stdout(_) | Stage::Memory(_) | Stage::Errors(_))
    }

    fn link(&self, to: &Stage) -> Result<()> {
        match to {
            Stage::Row(t) => self.link_into(t),
            Stage::Sort(t) => self.link_into(t),
            Stage::Multicast(t) => self.link_into(t),
            Stage::Duplicate(t) => self.link_into(t),
            Stage::Batch(t) => self.link_into(t),
            Stage::Stdout(t) => self.link_into(t),
            Stage::Memory(t) => self.link_into(t),
            Stage::Source(_) | Stage::Errors(_) => bail!("`{}` does not accept rows", to.node().name()),
        }
    }

    fn link_into<D: Target<Row>>(&self, target: &D) -> Result<()> {
        match self {
            Stage::Source(n) => n.link_to(target),
            Stage::Row(n) => n.link_to(target),
            Stage::Sort(n) => n.link_to(target),
            Stage::Multicast(n) => n.link_to(target),
            Stage::Duplicate(n) => n.link_to(target),
            Stage::Batch(n) => n.link_to(target),
            Stage::Stdout(_) | Stage::Memory(_) | Stage::Errors(_) => {
                bail!("`{}` is a sink and has no output", self.node().name())
            }
        };
        Ok(())
    }

    fn link_errors(&self, to: &Stage) -> Result<()> {
        let Stage::Errors(target) = to else {
            bail!("`{}` is not an errors sink", to.node().name());
        };
        match self {
            Stage::Row(n) => n.link_errors_to(target),
            Stage::Batch(n) => n.link_errors_to(target),
            Stage::Stdout(n) => n.link_errors_to(target),
            _ => bail!("`{}` does not report row errors", self.node().name()),
        };
        Ok(())
    }
}

/// Rows collected by the `memory` sinks of a finished run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub collected: HashMap<String, Vec<Row>>,
}

pub struct Pipeline {
    name: String,
    order: Vec<String>,
    stages: HashMap<String, Stage>,
}

impl Pipeline {
    pub fn build(spec: &PipelineSpec) -> Result<Self> {
        spec.validate()?;
        let order = spec.topological_order()?;

        let mut stages = HashMap::new();
        for source in &spec.sources {
            stages.insert(source.id().to_string(), build_source(source));
        }
        for transform in &spec.transforms {
            stages.insert(transform.id().to_string(), build_transform(transform)?);
        }
        for sink in &spec.sinks {
            stages.insert(sink.id().to_string(), build_sink(sink));
        }
        for stage in stages.values() {
            stage
                .node()
                .configure(&spec.settings)
                .with_context(|| format!("configuring `{}`", stage.node().name()))?;
        }

        let stage = |id: &str| {
            stages
                .get(id)
                .with_context(|| format!("unknown node `{id}`"))
        };
        for (from, to) in &spec.edges {
            stage(from)?.link(stage(to)?)?;
        }
        for (from, to) in &spec.error_edges {
            stage(from)?.link_errors(stage(to)?)?;
        }

        Ok(Self {
            name: spec.name.clone(),
            order,
            stages,
        })
    }

    /// Node ids, every edge pointing forward.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Executes every source and waits for every sink.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunSummary> {
        info!(pipeline = %self.name, nodes = self.order.len(), "running pipeline");
        for id in &self.order {
            if let Some(Stage::Source(source)) = self.stages.get(id) {
                source.execute_with(cancel.clone());
            }
        }

        let mut summary = RunSummary::default();
        let mut failed = 0usize;
        for id in &self.order {
            let Some(stage) = self.stages.get(id).filter(|s| s.is_sink()) else {
                continue;
            };
            if let Err(e) = stage.node().wait().await {
                error!(node = %id, error = %e, "sink failed");
                failed += 1;
            }
            if let Stage::Memory(sink) = stage {
                let rows = sink.take_data();
                info!(node = %id, rows = rows.len(), "rows collected");
                summary.collected.insert(id.clone(), rows);
            }
        }
        if failed > 0 {
            bail!("{failed} sink(s) of pipeline `{}` failed", self.name);
        }
        Ok(summary)
    }
}

fn build_source(spec: &SourceSpec) -> Stage {
    let node = match spec {
        SourceSpec::Inline { id, rows } => MemorySource::new(id.as_str(), rows.iter().cloned().map(Row::from)),
        SourceSpec::Generate { id, count } => {
            MemorySource::new(id.as_str(), (1..=*count).map(|n| Row::new().with("id", n)))
        }
    };
    Stage::Source(node)
}

fn build_transform(spec: &TransformSpec) -> Result<Stage> {
    let stage = match spec {
        TransformSpec::Passthrough { id } => Stage::Row(RowTransformation::new(id.as_str(), Ok)),
        TransformSpec::Filter { id, field, pattern } => {
            let regex = Regex::new(pattern).with_context(|| format!("invalid pattern for `{id}`"))?;
            let field = field.clone();
            Stage::Row(RowTransformation::filter_map(id.as_str(), move |row: Row| {
                let keep = row.get(&field).is_some_and(|v| regex.is_match(&as_text(v)));
                Ok(keep.then_some(row))
            }))
        }
        TransformSpec::Sort { id, by, descending } => {
            let (by, descending) = (by.clone(), *descending);
            Stage::Sort(Sort::new(id.as_str(), move |a: &Row, b: &Row| {
                let order = compare_fields(a.get(&by), b.get(&by));
                if descending {
                    order.reverse()
                } else {
                    order
                }
            }))
        }
        TransformSpec::Multicast { id } => Stage::Multicast(Multicast::new(id.as_str())),
        TransformSpec::Duplicate { id, copies } => Stage::Duplicate(RowDuplication::with_copies(id.as_str(), *copies)),
        TransformSpec::BatchSet {
            id,
            batch_size,
            field,
            value,
        } => {
            let (field, value) = (field.clone(), value.clone());
            let set = move |rows: Vec<Row>| {
                Ok(Some(
                    rows.into_iter()
                        .map(|row| row.with(field.clone(), value.clone()))
                        .collect(),
                ))
            };
            Stage::Batch(match batch_size {
                Some(size) => RowBatchTransformation::new(id.as_str(), *size, set),
                None => RowBatchTransformation::with_default_size(id.as_str(), set),
            })
        }
    };
    Ok(stage)
}

fn build_sink(spec: &SinkSpec) -> Stage {
    match spec {
        SinkSpec::Stdout { id } => Stage::Stdout(JsonLinesDestination::stdout(id.as_str())),
        SinkSpec::Memory { id } => Stage::Memory(MemoryDestination::new(id.as_str())),
        SinkSpec::Errors { id } => Stage::Errors(JsonLinesDestination::stdout(id.as_str())),
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Missing fields sort first; numbers compare numerically, strings
/// lexically, anything else by its JSON text.
fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y))
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}
