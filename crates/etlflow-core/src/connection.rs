//! Connection abstraction used by database nodes and partial caches.
//!
//! Dialects, quoting and drivers live outside the engine: a driver crate
//! implements [`Connection`] and renders [`Query`] in its own SQL.
//! [`MemoryConnection`] keeps tables in memory and is what tests and the CLI
//! run against.

use crate::error::{FlowError, FlowResult};
use crate::port::lock;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// A dialect-free read request: a table, optional column list and
/// equality filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub table: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub filters: Vec<(String, Value)>,
}

impl Query {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            filters: Vec::new(),
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }
}

/// Column names plus rows of values in column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn open(&self) -> FlowResult<()>;

    async fn close(&self) -> FlowResult<()>;

    async fn begin_transaction(&self) -> FlowResult<()>;

    async fn commit(&self) -> FlowResult<()>;

    async fn rollback(&self) -> FlowResult<()>;

    async fn execute_reader(&self, query: &Query) -> FlowResult<ResultSet>;

    /// Inserts `rows` (values in `columns` order). Returns the row count.
    async fn bulk_insert(&self, table: &str, columns: &[String], rows: Vec<Vec<Value>>) -> FlowResult<u64>;
}

#[derive(Debug, Clone, Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

/// In-memory tables behind the [`Connection`] contract.
#[derive(Debug, Default)]
pub struct MemoryConnection {
    tables: Mutex<HashMap<String, Table>>,
    pending: Mutex<Option<Vec<(String, Vec<Vec<Value>>)>>>,
    open: AtomicBool,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table<I, S>(&self, name: impl Into<String>, columns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.tables).insert(
            name.into(),
            Table {
                columns: columns.into_iter().map(Into::into).collect(),
                rows: Vec::new(),
            },
        );
    }

    /// Committed rows of `table`.
    pub fn rows(&self, table: &str) -> Vec<Vec<Value>> {
        lock(&self.tables)
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    fn ensure_open(&self) -> FlowResult<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(FlowError::Connection("connection is not open".into()))
        }
    }

    fn reorder(table_name: &str, table: &Table, columns: &[String], rows: Vec<Vec<Value>>) -> FlowResult<Vec<Vec<Value>>> {
        let positions = columns
            .iter()
            .map(|c| {
                table.columns.iter().position(|tc| tc == c).ok_or_else(|| {
                    FlowError::Connection(format!("unknown column `{c}` in table `{table_name}`"))
                })
            })
            .collect::<FlowResult<Vec<_>>>()?;
        rows.into_iter()
            .map(|row| {
                if row.len() != columns.len() {
                    return Err(FlowError::Connection(format!(
                        "expected {} values, got {}",
                        columns.len(),
                        row.len()
                    )));
                }
                let mut full = vec![Value::Null; table.columns.len()];
                for (value, &pos) in row.into_iter().zip(&positions) {
                    full[pos] = value;
                }
                Ok(full)
            })
            .collect()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open(&self) -> FlowResult<()> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> FlowResult<()> {
        self.open.store(false, Ordering::Release);
        *lock(&self.pending) = None;
        Ok(())
    }

    async fn begin_transaction(&self) -> FlowResult<()> {
        self.ensure_open()?;
        let mut pending = lock(&self.pending);
        if pending.is_some() {
            return Err(FlowError::Connection("transaction already active".into()));
        }
        *pending = Some(Vec::new());
        Ok(())
    }

    async fn commit(&self) -> FlowResult<()> {
        let staged = lock(&self.pending)
            .take()
            .ok_or_else(|| FlowError::Connection("no active transaction".into()))?;
        let mut tables = lock(&self.tables);
        for (table, rows) in staged {
            if let Some(t) = tables.get_mut(&table) {
                t.rows.extend(rows);
            }
        }
        Ok(())
    }

    async fn rollback(&self) -> FlowResult<()> {
        lock(&self.pending).take();
        Ok(())
    }

    async fn execute_reader(&self, query: &Query) -> FlowResult<ResultSet> {
        self.ensure_open()?;
        let tables = lock(&self.tables);
        let table = tables
            .get(&query.table)
            .ok_or_else(|| FlowError::Connection(format!("unknown table `{}`", query.table)))?;
        let columns = if query.columns.is_empty() {
            table.columns.clone()
        } else {
            query.columns.clone()
        };
        let index = |name: &str| {
            table.columns.iter().position(|c| c == name).ok_or_else(|| {
                FlowError::Connection(format!("unknown column `{name}` in table `{}`", query.table))
            })
        };
        let projection = columns.iter().map(|c| index(c.as_str())).collect::<FlowResult<Vec<_>>>()?;
        let filters = query
            .filters
            .iter()
            .map(|(c, v)| Ok((index(c.as_str())?, v)))
            .collect::<FlowResult<Vec<_>>>()?;

        let rows = table
            .rows
            .iter()
            .filter(|row| filters.iter().all(|(i, v)| &row[*i] == *v))
            .map(|row| projection.iter().map(|&i| row[i].clone()).collect())
            .collect::<Vec<Vec<Value>>>();
        debug!(table = %query.table, rows = rows.len(), "query executed");
        Ok(ResultSet { columns, rows })
    }

    async fn bulk_insert(&self, table: &str, columns: &[String], rows: Vec<Vec<Value>>) -> FlowResult<u64> {
        self.ensure_open()?;
        let full = {
            let tables = lock(&self.tables);
            let t = tables
                .get(table)
                .ok_or_else(|| FlowError::Connection(format!("unknown table `{table}`")))?;
            Self::reorder(table, t, columns, rows)?
        };
        let count = full.len() as u64;
        let mut pending = lock(&self.pending);
        match pending.as_mut() {
            Some(staged) => staged.push((table.to_string(), full)),
            None => {
                drop(pending);
                if let Some(t) = lock(&self.tables).get_mut(table) {
                    t.rows.extend(full);
                }
            }
        }
        Ok(count)
    }
}
