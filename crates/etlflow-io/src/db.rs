//! Database source and destination.
//!
//! Both talk to the database only through [`Connection`]; which columns
//! map to which fields is an explicit [`ColumnMap`].

use crate::lock;
use crate::source::{CancelSlot, Source};
use arcstr::ArcStr;
use async_trait::async_trait;
use etlflow_core::{
    ColumnMap, Connection, DynamicRow, ErrorLinkable, ErrorOutbox, ErrorReporter, FlowError, FlowResult,
    FlowSettings, Inbox, InputPort, Linkable, Node, NodeCore, Outbox, Query, RowAccess, Target,
};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type RowMapper<T> = Arc<dyn Fn(DynamicRow) -> anyhow::Result<T> + Send + Sync>;

/// Source that runs one query and emits every result row.
pub struct DbSource<T> {
    inner: Arc<DbSourceInner<T>>,
}

struct DbSourceInner<T> {
    core: NodeCore,
    outbox: Outbox<T>,
    connection: Arc<dyn Connection>,
    query: Query,
    column_map: Mutex<ColumnMap>,
    mapper: RowMapper<T>,
    cancel: CancelSlot,
}

impl<T> Clone for DbSource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl DbSource<DynamicRow> {
    pub fn new(name: impl Into<ArcStr>, connection: Arc<dyn Connection>, query: Query) -> Self {
        Self::with_mapper(name, connection, query, Ok)
    }
}

impl<T: Send + 'static> DbSource<T> {
    /// Source whose rows are built from each result row by `mapper`.
    pub fn with_mapper<F>(name: impl Into<ArcStr>, connection: Arc<dyn Connection>, query: Query, mapper: F) -> Self
    where
        F: Fn(DynamicRow) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let core = NodeCore::new(name);
        let outbox = Outbox::new(core.name().clone());
        Self {
            inner: Arc::new(DbSourceInner {
                core,
                outbox,
                connection,
                query,
                column_map: Mutex::new(ColumnMap::new()),
                mapper: Arc::new(mapper),
                cancel: CancelSlot::default(),
            }),
        }
    }

    pub fn with_column_map(self, column_map: ColumnMap) -> Self {
        *lock(&self.inner.column_map) = column_map;
        self
    }
}

impl<T: Send + 'static> DbSourceInner<T> {
    async fn run(&self, cancel: CancellationToken) -> FlowResult<()> {
        let mut out = self.outbox.open()?;
        self.connection.open().await?;
        let result = self.connection.execute_reader(&self.query).await;
        let closed = self.connection.close().await;
        let result = first_error(self.core.name(), result, closed)?;

        let column_map = lock(&self.column_map).clone();
        info!(
            node = %self.core.name(),
            rows = result.rows.len(),
            table = %self.query.table,
            "query read"
        );
        let progress = self.core.progress();
        for values in result.rows {
            if cancel.is_cancelled() {
                info!(node = %self.core.name(), "cancelled, no more rows emitted");
                break;
            }
            let row = column_map.to_row(&result.columns, values);
            let row = (self.mapper)(row).map_err(|e| FlowError::node(self.core.name(), e))?;
            out.send(row).await;
            progress.add(1);
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Send + 'static> Node for DbSource<T> {
    fn core(&self) -> &NodeCore {
        &self.inner.core
    }

    fn start(&self) {
        if !self.inner.core.begin_start() {
            return;
        }
        self.inner.outbox.start_targets();
        let inner = self.inner.clone();
        let cancel = inner.cancel.token();
        self.inner.core.spawn(async move { inner.run(cancel).await });
    }
}

impl<T: Send + 'static> Linkable<T> for DbSource<T> {
    fn outbox(&self) -> &Outbox<T> {
        &self.inner.outbox
    }
}

impl<T: Send + 'static> Source<T> for DbSource<T> {
    fn cancellation(&self) -> &CancelSlot {
        &self.inner.cancel
    }
}

/// Destination that bulk-inserts rows into a table, one transaction per
/// batch.
///
/// Columns come from [`with_columns`](Self::with_columns) or, when unset,
/// from the field names of each batch's first row passed through the
/// column map.
/// A batch that fails is rolled back; with an error link each of its rows
/// becomes an error record and the next batch is written.
pub struct DbDestination<T> {
    inner: Arc<DbDestinationInner<T>>,
}

struct DbDestinationInner<T> {
    core: NodeCore,
    input: InputPort<T>,
    errors: ErrorOutbox<T>,
    connection: Arc<dyn Connection>,
    table: String,
    columns: Mutex<Option<Vec<String>>>,
    column_map: Mutex<ColumnMap>,
    batch_size: Mutex<Option<usize>>,
    default_batch_size: AtomicUsize,
}

impl<T> Clone for DbDestination<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: RowAccess + Send + 'static> DbDestination<T> {
    pub fn new(name: impl Into<ArcStr>, connection: Arc<dyn Connection>, table: impl Into<String>) -> Self {
        let core = NodeCore::new(name);
        let input = InputPort::new(core.name().clone());
        let errors = ErrorOutbox::new(core.name().clone());
        Self {
            inner: Arc::new(DbDestinationInner {
                core,
                input,
                errors,
                connection,
                table: table.into(),
                columns: Mutex::new(None),
                column_map: Mutex::new(ColumnMap::new()),
                batch_size: Mutex::new(None),
                default_batch_size: AtomicUsize::new(FlowSettings::default().batch_size),
            }),
        }
    }

    pub fn with_columns<I, S>(self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *lock(&self.inner.columns) = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_column_map(self, column_map: ColumnMap) -> Self {
        *lock(&self.inner.column_map) = column_map;
        self
    }

    pub fn with_batch_size(self, batch_size: usize) -> Self {
        *lock(&self.inner.batch_size) = Some(batch_size.max(1));
        self
    }

    pub fn batch_size(&self) -> usize {
        self.inner.batch_size()
    }
}

impl<T: RowAccess + Send + 'static> DbDestinationInner<T> {
    fn batch_size(&self) -> usize {
        lock(&self.batch_size).unwrap_or_else(|| self.default_batch_size.load(Ordering::Relaxed))
    }

    async fn run(&self) -> FlowResult<()> {
        let mut errors = self.errors.open()?;
        let mut inbox = self.input.take_inbox()?;
        if lock(&self.columns).as_ref().is_some_and(Vec::is_empty) {
            return Err(FlowError::config(self.core.name(), "column list is empty"));
        }
        self.connection.open().await?;
        let result = self.drain(&mut inbox, &mut errors).await;
        let closed = self.connection.close().await;
        first_error(self.core.name(), result, closed)
    }

    async fn drain(&self, inbox: &mut Inbox<T>, errors: &mut ErrorReporter<T>) -> FlowResult<()> {
        let batch_size = self.batch_size();
        let column_map = lock(&self.column_map).clone();
        let columns = lock(&self.columns).clone();
        let mut batch = Vec::with_capacity(batch_size);
        let mut snapshots = Vec::with_capacity(batch_size);
        while let Some(row) = inbox.recv().await? {
            if columns.is_none() && batch.is_empty() && row.field_names().is_empty() {
                return Err(FlowError::config(
                    self.core.name(),
                    "no columns configured and rows carry no field names",
                ));
            }
            snapshots.push(errors.snapshot(&row));
            batch.push(row);
            if batch.len() == batch_size {
                let rows = std::mem::take(&mut batch);
                let json = std::mem::take(&mut snapshots);
                self.flush(rows, json, columns.as_deref(), &column_map, errors).await?;
            }
        }
        self.flush(batch, snapshots, columns.as_deref(), &column_map, errors)
            .await
    }

    async fn flush(
        &self,
        rows: Vec<T>,
        snapshots: Vec<Option<String>>,
        columns: Option<&[String]>,
        column_map: &ColumnMap,
        errors: &mut ErrorReporter<T>,
    ) -> FlowResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        // Without explicit columns every batch takes them from its first row.
        let columns = match columns {
            Some(columns) => columns.to_vec(),
            None => rows[0]
                .field_names()
                .iter()
                .map(|field| column_map.column_for(field).to_string())
                .collect(),
        };
        let values: Vec<Vec<Value>> = rows.iter().map(|row| column_map.project(row, &columns)).collect();

        match self.write(&columns, values).await {
            Ok(written) => {
                debug!(node = %self.core.name(), rows = written, table = %self.table, "batch written");
                self.core.progress().add(written);
                Ok(())
            }
            Err(e) => errors.report_many(e.into(), snapshots).await,
        }
    }

    async fn write(&self, columns: &[String], values: Vec<Vec<Value>>) -> FlowResult<u64> {
        self.connection.begin_transaction().await?;
        match self.connection.bulk_insert(&self.table, columns, values).await {
            Ok(written) => {
                self.connection.commit().await?;
                Ok(written)
            }
            Err(e) => {
                if let Err(rollback) = self.connection.rollback().await {
                    error!(node = %self.core.name(), error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }
}

/// The work's own error wins over a failure to close the connection.
fn first_error<T>(node: &ArcStr, result: FlowResult<T>, closed: FlowResult<()>) -> FlowResult<T> {
    match (result, closed) {
        (Ok(value), closed) => closed.map(|()| value),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close)) => {
            warn!(node = %node, error = %close, "closing the connection failed as well");
            Err(e)
        }
    }
}

#[async_trait]
impl<T: RowAccess + Send + 'static> Node for DbDestination<T> {
    fn core(&self) -> &NodeCore {
        &self.inner.core
    }

    fn start(&self) {
        if !self.inner.core.begin_start() {
            return;
        }
        self.inner.input.open(self.inner.batch_size());
        self.inner.errors.start_target();
        let inner = self.inner.clone();
        self.inner.core.spawn(async move { inner.run().await });
    }

    fn set_bounded_capacity(&self, capacity: Option<usize>) -> FlowResult<()> {
        self.inner.input.set_capacity(capacity)
    }

    fn configure(&self, settings: &FlowSettings) -> FlowResult<()> {
        self.core().set_progress_every(settings.progress_every);
        self.inner
            .default_batch_size
            .store(settings.batch_size.max(1), Ordering::Relaxed);
        self.set_bounded_capacity(settings.bounded_capacity)
    }
}

impl<T: RowAccess + Send + 'static> Target<T> for DbDestination<T> {
    fn input(&self) -> &InputPort<T> {
        &self.inner.input
    }
}

impl<T: RowAccess + Send + 'static> ErrorLinkable<T> for DbDestination<T> {
    fn error_outbox(&self) -> &ErrorOutbox<T> {
        &self.inner.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryDestination, MemorySource};
    use etlflow_core::{ArrayRow, ErrorRecord, MemoryConnection, ResultSet};
    use serde_json::json;

    fn orders() -> Arc<MemoryConnection> {
        let conn = Arc::new(MemoryConnection::new());
        conn.create_table("orders", ["id", "cust_name"]);
        conn
    }

    fn order(id: i64, customer: &str) -> DynamicRow {
        DynamicRow::new().with("id", id).with("customer", customer)
    }

    #[tokio::test]
    async fn writes_in_batches_through_column_map() {
        let conn = orders();
        let source = MemorySource::new("src", (1..=5).map(|i| order(i, "ann")));
        let dest = DbDestination::new("db", conn.clone(), "orders")
            .with_column_map(ColumnMap::new().map("customer", "cust_name"))
            .with_batch_size(2);
        source.link_to(&dest);

        source.execute();
        dest.wait().await.unwrap();
        let rows = conn.rows("orders");
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[4], vec![json!(5), json!("ann")]);
        assert_eq!(dest.core().processed(), 5);
    }

    #[tokio::test]
    async fn failed_batch_is_rolled_back_and_reported_per_row() {
        let conn = orders();
        let source = MemorySource::new(
            "src",
            vec![
                order(1, "a"),
                order(2, "b"),
                DynamicRow::new().with("id", 3).with("missing", "x"),
                order(4, "d"),
            ],
        );
        let dest = DbDestination::new("db", conn.clone(), "orders")
            .with_column_map(ColumnMap::new().map("customer", "cust_name"))
            .with_batch_size(2);
        let errors = MemoryDestination::<ErrorRecord>::new("errors");
        source.link_to(&dest);
        dest.link_errors_to(&errors);

        source.execute();
        dest.wait().await.unwrap();
        errors.wait().await.unwrap();
        assert_eq!(conn.rows("orders").len(), 2);
        let records = errors.data();
        assert_eq!(records.len(), 2);
        assert!(records[0].error_text.contains("unknown column `missing`"));
        assert_eq!(records[0].record_as_json.as_deref(), Some(r#"{"id":3,"missing":"x"}"#));
    }

    #[tokio::test]
    async fn positional_rows_need_explicit_columns() {
        let conn = orders();
        let source = MemorySource::new("src", vec![ArrayRow(vec![json!(1), json!("z")])]);
        let dest = DbDestination::new("db", conn.clone(), "orders");
        source.link_to(&dest);
        source.execute();
        assert!(matches!(
            dest.wait().await.unwrap_err().causes()[0],
            FlowError::Config { .. }
        ));

        let source = MemorySource::new("src", vec![ArrayRow(vec![json!(1), json!("z")])]);
        let dest = DbDestination::new("db", conn.clone(), "orders").with_columns(["id", "cust_name"]);
        source.link_to(&dest);
        source.execute();
        dest.wait().await.unwrap();
        assert_eq!(conn.rows("orders"), vec![vec![json!(1), json!("z")]]);
    }

    #[tokio::test]
    async fn source_reads_query_into_rows() {
        let conn = orders();
        conn.open().await.unwrap();
        conn.bulk_insert(
            "orders",
            &["id".to_string(), "cust_name".to_string()],
            vec![vec![json!(1), json!("ann")], vec![json!(2), json!("bob")]],
        )
        .await
        .unwrap();

        let source = DbSource::new("db", conn.clone(), Query::table("orders").where_eq("cust_name", "bob"))
            .with_column_map(ColumnMap::new().map("customer", "cust_name"));
        let dest = MemoryDestination::new("dest");
        source.link_to(&dest);
        source.execute();
        dest.wait().await.unwrap();
        assert_eq!(dest.data(), vec![order(2, "bob")]);
    }

    #[tokio::test]
    async fn configure_sets_default_batch_size() {
        let dest = DbDestination::<DynamicRow>::new("db", orders(), "orders");
        let settings = FlowSettings {
            batch_size: 7,
            ..FlowSettings::default()
        };
        dest.configure(&settings).unwrap();
        assert_eq!(dest.batch_size(), 7);
        assert_eq!(dest.with_batch_size(3).batch_size(), 3);
    }

    /// Memory tables whose close and rollback always fail.
    struct BrokenCleanup(MemoryConnection);

    #[async_trait]
    impl Connection for BrokenCleanup {
        async fn open(&self) -> FlowResult<()> {
            self.0.open().await
        }

        async fn close(&self) -> FlowResult<()> {
            self.0.close().await?;
            Err(FlowError::Connection("close refused".into()))
        }

        async fn begin_transaction(&self) -> FlowResult<()> {
            self.0.begin_transaction().await
        }

        async fn commit(&self) -> FlowResult<()> {
            self.0.commit().await
        }

        async fn rollback(&self) -> FlowResult<()> {
            self.0.rollback().await?;
            Err(FlowError::Connection("rollback refused".into()))
        }

        async fn execute_reader(&self, query: &Query) -> FlowResult<ResultSet> {
            self.0.execute_reader(query).await
        }

        async fn bulk_insert(&self, table: &str, columns: &[String], rows: Vec<Vec<Value>>) -> FlowResult<u64> {
            self.0.bulk_insert(table, columns, rows).await
        }
    }

    fn broken_orders() -> Arc<BrokenCleanup> {
        let conn = MemoryConnection::new();
        conn.create_table("orders", ["id", "cust_name"]);
        Arc::new(BrokenCleanup(conn))
    }

    #[tokio::test]
    async fn read_failure_outranks_close_failure() {
        let source = DbSource::new("read", broken_orders(), Query::table("missing"));
        source.execute();
        let err = source.wait().await.unwrap_err();
        assert!(matches!(
            err.causes()[0],
            FlowError::Connection(message) if message.contains("unknown table `missing`")
        ));
    }

    #[tokio::test]
    async fn close_failure_after_a_clean_read_is_reported() {
        let source = DbSource::new("read", broken_orders(), Query::table("orders"));
        source.execute();
        let err = source.wait().await.unwrap_err();
        assert!(matches!(
            err.causes()[0],
            FlowError::Connection(message) if message == "close refused"
        ));
    }

    #[tokio::test]
    async fn insert_error_survives_a_failed_rollback() {
        let source = MemorySource::new("src", vec![DynamicRow::new().with("id", 1).with("missing", "x")]);
        let dest = DbDestination::new("db", broken_orders(), "orders");
        let errors = MemoryDestination::<ErrorRecord>::new("errors");
        source.link_to(&dest);
        dest.link_errors_to(&errors);

        source.execute();
        // The batch is absorbed by the error link; only closing fails the node.
        let err = dest.wait().await.unwrap_err();
        assert!(matches!(
            err.causes()[0],
            FlowError::Connection(message) if message == "close refused"
        ));
        // The error destination faults with its producer but keeps what it got.
        assert!(errors.wait().await.is_err());
        let records = errors.take_data();
        assert_eq!(records.len(), 1);
        assert!(records[0].error_text.contains("unknown column `missing`"));
        assert!(!records[0].exception.contains("rollback"));
    }

    #[tokio::test]
    async fn empty_column_list_fails_before_any_row() {
        let conn = orders();
        let source = MemorySource::new("src", (1..=3).map(|i| order(i, "ann")));
        let dest = DbDestination::new("db", conn.clone(), "orders").with_columns(Vec::<String>::new());
        source.link_to(&dest);

        source.execute();
        assert!(matches!(
            dest.wait().await.unwrap_err().causes()[0],
            FlowError::Config { .. }
        ));
        assert_eq!(dest.core().processed(), 0);
        assert!(conn.rows("orders").is_empty());
    }
}
