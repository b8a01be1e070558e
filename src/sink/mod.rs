//! Storage sink abstraction
//!
//! Defines the `StorageSink` trait the ingestion and inference passes write
//! through, plus the value and schema types that cross that boundary:
//! - MemorySink: in-process tables (tests, small imports)
//! - DuckDbSink: embedded DuckDB database (feature `duckdb-backend`)
//!
//! The sink exclusively owns rows once `insert_batch` returns successfully.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod memory;

#[cfg(feature = "duckdb-backend")]
pub mod duckdb_sink;

pub use memory::MemorySink;

#[cfg(feature = "duckdb-backend")]
pub use duckdb_sink::DuckDbSink;

/// Error type for sink operations
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Table not found: {0}")]
    TableNotFound(String),
    #[error("Table already exists: {0}")]
    TableExists(String),
    #[error("Unknown column {column} in table {table}")]
    UnknownColumn { table: String, column: String },
    #[error("Column {column} in table {table} cannot hold value {value:?} ({expected})")]
    TypeMismatch {
        table: String,
        column: String,
        expected: String,
        value: String,
    },
    #[error("Value for {table}.{column} exceeds {max} characters")]
    ValueTooLong {
        table: String,
        column: String,
        max: usize,
    },
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// A single cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    /// Canonical decimal rendering with a fixed scale, e.g. `1200.50`
    Decimal(String),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Text rendering of the value, `None` for null
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Value::Null => None,
            Value::Text(s) | Value::Decimal(s) => Some(Cow::Borrowed(s.as_str())),
            Value::Boolean(b) => Some(Cow::Owned(if *b { "1" } else { "0" }.to_string())),
            Value::Integer(n) => Some(Cow::Owned(n.to_string())),
            Value::Float(f) => Some(Cow::Owned(f.to_string())),
        }
    }

    /// Null or an empty string, the two shapes counted as missing
    pub fn is_blank(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Text(s) => s.is_empty(),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("NULL"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Declared type of a destination column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ColumnType {
    Integer,
    BigInteger,
    Decimal { precision: u8, scale: u8 },
    Float,
    Boolean,
    DateTime,
    Date,
    String { length: usize },
    Text,
    LongText,
    Json,
}

impl ColumnType {
    /// Short string column of the default width
    pub const STRING: ColumnType = ColumnType::String { length: 255 };

    /// SQL type used by relational backends
    pub fn sql_type(&self) -> String {
        match self {
            ColumnType::Integer => "INTEGER".to_string(),
            ColumnType::BigInteger => "BIGINT".to_string(),
            ColumnType::Decimal { precision, scale } => format!("DECIMAL({precision},{scale})"),
            ColumnType::Float => "DOUBLE".to_string(),
            ColumnType::Boolean => "BOOLEAN".to_string(),
            ColumnType::DateTime => "TIMESTAMP".to_string(),
            ColumnType::Date => "DATE".to_string(),
            ColumnType::String { length } => format!("VARCHAR({length})"),
            ColumnType::Text | ColumnType::LongText | ColumnType::Json => "VARCHAR".to_string(),
        }
    }

    /// Maximum character length, for bounded string columns
    pub fn max_length(&self) -> Option<usize> {
        match self {
            ColumnType::String { length } => Some(*length),
            _ => None,
        }
    }

    /// Whether a value of this shape may be stored in the column
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ColumnType::Integer, Value::Integer(n)) => i32::try_from(*n).is_ok(),
            (ColumnType::BigInteger, Value::Integer(_)) => true,
            (ColumnType::Decimal { .. }, Value::Decimal(_) | Value::Integer(_)) => true,
            (ColumnType::Float, Value::Float(_) | Value::Integer(_)) => true,
            (ColumnType::Boolean, Value::Boolean(_)) => true,
            (
                ColumnType::DateTime
                | ColumnType::Date
                | ColumnType::String { .. }
                | ColumnType::Text
                | ColumnType::LongText
                | ColumnType::Json,
                Value::Text(_),
            ) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql_type())
    }
}

/// A named, typed column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// An ordered mapping of column name to value, destined for one table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Set a column value, replacing an earlier value for the same column
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(name, _)| *name == column) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((column, value)),
        }
    }

    /// Builder form of `set`
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    /// JSON object rendering, used as the raw payload of failed rows
    pub fn to_payload(&self) -> String {
        let map: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(name, value)| {
                let json = match value {
                    Value::Null => serde_json::Value::Null,
                    Value::Boolean(b) => serde_json::Value::Bool(*b),
                    Value::Integer(n) => serde_json::Value::from(*n),
                    Value::Float(f) => serde_json::Value::from(*f),
                    Value::Decimal(s) | Value::Text(s) => serde_json::Value::String(s.clone()),
                };
                (name.clone(), json)
            })
            .collect();
        serde_json::Value::Object(map).to_string()
    }
}

/// Row filter understood by every sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Column is null or the empty string
    IsNullOrEmpty(String),
    /// Column text equals the given value
    Equals(String, String),
}

/// A text row as returned by `fetch_rows`, in table column order
pub type TextRow = Vec<Option<String>>;

/// Durable table/row storage and statistics primitives
///
/// Implementations decide how rows are laid out; callers rely only on these
/// operations. `insert_batch` must be all-or-nothing: when it returns an error
/// no row of the batch is stored, so callers can retry rows individually.
pub trait StorageSink {
    /// Check if a table exists
    fn table_exists(&self, table: &str) -> Result<bool, SinkError>;

    /// Create a table with the given ordered columns
    fn create_table(&mut self, table: &str, columns: &[ColumnDef]) -> Result<(), SinkError>;

    /// Append a column to an existing table
    fn add_column(&mut self, table: &str, column: &ColumnDef) -> Result<(), SinkError>;

    /// Insert rows; columns absent from a record are stored as null
    fn insert_batch(&mut self, table: &str, rows: &[Record]) -> Result<usize, SinkError>;

    /// Ordered column names of a table
    fn columns(&self, table: &str) -> Result<Vec<String>, SinkError>;

    /// Number of rows in a table
    fn count(&self, table: &str) -> Result<u64, SinkError>;

    /// Number of rows matching a predicate
    fn count_where(&self, table: &str, predicate: &Predicate) -> Result<u64, SinkError>;

    /// Number of distinct non-blank values of a column
    fn count_distinct(&self, table: &str, column: &str) -> Result<u64, SinkError>;

    /// Lexical minimum over non-blank values
    fn min(&self, table: &str, column: &str) -> Result<Option<String>, SinkError>;

    /// Lexical maximum over non-blank values
    fn max(&self, table: &str, column: &str) -> Result<Option<String>, SinkError>;

    /// The first `limit` non-blank values of a column, in insertion order
    fn sample_non_null(
        &self,
        table: &str,
        column: &str,
        limit: usize,
    ) -> Result<Vec<String>, SinkError>;

    /// A page of rows rendered as text, in insertion order
    fn fetch_rows(&self, table: &str, offset: u64, limit: usize)
    -> Result<Vec<TextRow>, SinkError>;

    /// Delete rows matching a predicate, returning the number removed
    fn delete_where(&mut self, table: &str, predicate: &Predicate) -> Result<u64, SinkError>;

    /// Drop a table if it exists
    fn drop_table(&mut self, table: &str) -> Result<(), SinkError>;
}

/// Create a table unless it already exists; existing tables gain any missing
/// columns (never removed or renamed)
pub fn ensure_table<S: StorageSink + ?Sized>(
    sink: &mut S,
    table: &str,
    columns: &[ColumnDef],
) -> Result<(), SinkError> {
    if !sink.table_exists(table)? {
        return sink.create_table(table, columns);
    }

    let existing = sink.columns(table)?;
    for column in columns {
        if !existing.iter().any(|name| name == &column.name) {
            tracing::debug!(table, column = %column.name, "Adding missing column");
            sink.add_column(table, column)?;
        }
    }
    Ok(())
}
