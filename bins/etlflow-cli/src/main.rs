use anyhow::Result;
use clap::Parser;
use etlflow_core::{FlowSettings, PipelineSpec};
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod graph;

use graph::Pipeline;

#[derive(Parser, Debug)]
#[command(name = "etlflow", about = "Run a dataflow pipeline described in YAML")]
struct Args {
    /// Pipeline YAML
    #[arg(short, long)]
    pipeline: PathBuf,
    /// Settings YAML; replaces the pipeline's own `settings` block
    #[arg(short, long)]
    settings: Option<PathBuf>,
    /// Bounded buffer capacity for every node, overriding the settings
    #[arg(long)]
    channel_capacity: Option<usize>,
    /// Validate the pipeline and print its nodes in execution order
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Rows go to stdout, logs to stderr.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    let args = Args::parse();

    let mut spec = PipelineSpec::load(&args.pipeline)?;
    if let Some(path) = &args.settings {
        spec.settings = FlowSettings::load(path)?;
    }
    if let Some(capacity) = args.channel_capacity {
        spec.settings.bounded_capacity = Some(capacity);
    }
    spec.validate()?;

    let pipeline = Pipeline::build(&spec)?;
    if args.check {
        for id in pipeline.order() {
            println!("{id}");
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupted, sources stop after the current row");
            on_ctrl_c.cancel();
        }
    });

    let summary = pipeline.run(cancel).await?;
    let collected: usize = summary.collected.values().map(Vec::len).sum();
    info!(pipeline = %spec.name, collected, "pipeline finished");
    Ok(())
}
