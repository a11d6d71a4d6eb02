use crate::lock;
use anyhow::Context;
use arcstr::ArcStr;
use async_trait::async_trait;
use etlflow_core::{ErrorLinkable, ErrorOutbox, FlowError, FlowResult, InputPort, Node, NodeCore, Target};
use serde::Serialize;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Destination that writes each row as one line of JSON.
pub struct JsonLinesDestination<T> {
    inner: Arc<JsonLinesInner<T>>,
}

struct JsonLinesInner<T> {
    core: NodeCore,
    input: InputPort<T>,
    errors: ErrorOutbox<T>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
}

impl<T> Clone for JsonLinesDestination<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Serialize + Send + 'static> JsonLinesDestination<T> {
    pub fn new(name: impl Into<ArcStr>, writer: Box<dyn Write + Send>) -> Self {
        let core = NodeCore::new(name);
        let input = InputPort::new(core.name().clone());
        let errors = ErrorOutbox::new(core.name().clone());
        Self {
            inner: Arc::new(JsonLinesInner {
                core,
                input,
                errors,
                writer: Mutex::new(Some(writer)),
            }),
        }
    }

    pub fn stdout(name: impl Into<ArcStr>) -> Self {
        Self::new(name, Box::new(std::io::stdout()))
    }
}

impl<T: Serialize + Send + 'static> JsonLinesInner<T> {
    async fn run(&self) -> FlowResult<()> {
        let mut errors = self.errors.open()?;
        let mut inbox = self.input.take_inbox()?;
        let mut writer = lock(&self.writer)
            .take()
            .ok_or(FlowError::ChannelClosed("json lines writer already taken"))?;
        let progress = self.core.progress();
        while let Some(row) = inbox.recv().await? {
            let line = serde_json::to_string(&row).context("serializing row");
            match line.and_then(|line| writeln!(writer, "{line}").context("writing row")) {
                Ok(()) => progress.add(1),
                Err(e) => {
                    let json = errors.snapshot(&row);
                    errors.report(e, json).await?
                }
            }
        }
        writer
            .flush()
            .map_err(|e| FlowError::node(self.core.name(), e))
    }
}

#[async_trait]
impl<T: Serialize + Send + 'static> Node for JsonLinesDestination<T> {
    fn core(&self) -> &NodeCore {
        &self.inner.core
    }

    fn start(&self) {
        if !self.inner.core.begin_start() {
            return;
        }
        self.inner.input.open(0);
        self.inner.errors.start_target();
        let inner = self.inner.clone();
        self.inner.core.spawn(async move { inner.run().await });
    }

    fn set_bounded_capacity(&self, capacity: Option<usize>) -> FlowResult<()> {
        self.inner.input.set_capacity(capacity)
    }
}

impl<T: Serialize + Send + 'static> Target<T> for JsonLinesDestination<T> {
    fn input(&self) -> &InputPort<T> {
        &self.inner.input
    }
}

impl<T: Serialize + Send + 'static> ErrorLinkable<T> for JsonLinesDestination<T> {
    fn error_outbox(&self) -> &ErrorOutbox<T> {
        &self.inner.errors
    }
}
