//! Row shapes that flow between nodes.
//!
//! The engine is generic over its row type and never looks inside a row on
//! its own. This module supplies the shapes that callers without a dedicated
//! struct usually reach for: an open, ordered field bag ([`DynamicRow`]), a
//! positional value array ([`ArrayRow`]), and the [`Record`] union over both
//! plus a typed record. [`RowAccess`] is the uniform accessor that key
//! extractors, comparers and database nodes use.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Field access by name or position.
///
/// Typed records implement this with plain field access; the dynamic shapes
/// below implement it over their storage.
pub trait RowAccess {
    fn get(&self, name: &str) -> Option<&Value>;

    fn get_index(&self, index: usize) -> Option<&Value>;

    /// Field names in positional order, when the shape has names.
    fn field_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Open record: an ordered `name -> value` map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DynamicRow {
    fields: Map<String, Value>,
}

impl DynamicRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.fields
    }
}

impl From<Map<String, Value>> for DynamicRow {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

impl RowAccess for DynamicRow {
    fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    fn get_index(&self, index: usize) -> Option<&Value> {
        self.fields.values().nth(index)
    }

    fn field_names(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }
}

/// Positional record: values without names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArrayRow(pub Vec<Value>);

impl RowAccess for ArrayRow {
    fn get(&self, name: &str) -> Option<&Value> {
        // Positional rows answer to their index rendered as a name.
        name.parse::<usize>().ok().and_then(|i| self.0.get(i))
    }

    fn get_index(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }
}

/// A row whose shape is decided by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Record<T> {
    Typed(T),
    Open(DynamicRow),
    Positional(ArrayRow),
}

impl<T: RowAccess> RowAccess for Record<T> {
    fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Record::Typed(t) => t.get(name),
            Record::Open(row) => row.get(name),
            Record::Positional(row) => row.get(name),
        }
    }

    fn get_index(&self, index: usize) -> Option<&Value> {
        match self {
            Record::Typed(t) => t.get_index(index),
            Record::Open(row) => row.get_index(index),
            Record::Positional(row) => row.get_index(index),
        }
    }

    fn field_names(&self) -> Vec<String> {
        match self {
            Record::Typed(t) => t.field_names(),
            Record::Open(row) => row.field_names(),
            Record::Positional(_) => Vec::new(),
        }
    }
}

/// Explicit `field -> column` mapping, built once per pipeline.
///
/// Fields without an entry map to a column of the same name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnMap {
    #[serde(default)]
    columns: BTreeMap<String, String>,
}

impl ColumnMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(mut self, field: impl Into<String>, column: impl Into<String>) -> Self {
        self.columns.insert(field.into(), column.into());
        self
    }

    pub fn column_for<'a>(&'a self, field: &'a str) -> &'a str {
        self.columns.get(field).map(String::as_str).unwrap_or(field)
    }

    pub fn field_for<'a>(&'a self, column: &'a str) -> &'a str {
        self.columns
            .iter()
            .find(|(_, c)| c.as_str() == column)
            .map(|(f, _)| f.as_str())
            .unwrap_or(column)
    }

    /// Values of `row` for `columns`, in column order. Missing fields are
    /// `Null`; rows without field names are read by position.
    pub fn project<R: RowAccess>(&self, row: &R, columns: &[String]) -> Vec<Value> {
        let positional = row.field_names().is_empty();
        columns
            .iter()
            .enumerate()
            .map(|(i, column)| {
                row.get(self.field_for(column))
                    .or_else(|| if positional { row.get_index(i) } else { None })
                    .cloned()
                    .unwrap_or(Value::Null)
            })
            .collect()
    }

    /// Builds a [`DynamicRow`] from a column-ordered result row.
    pub fn to_row(&self, columns: &[String], values: Vec<Value>) -> DynamicRow {
        let mut row = DynamicRow::new();
        for (column, value) in columns.iter().zip(values) {
            row.set(self.field_for(column), value);
        }
        row
    }
}
