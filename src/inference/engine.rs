//! Type inference runs and typed table materialization

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use super::coerce::coerce;
use super::config::InferenceConfig;
use super::error::InferenceError;
use super::stats::{ColumnStatistics, gather_statistics};
use super::types::{InferredType, decide};
use crate::sink::{
    ColumnDef, ColumnType, Predicate, Record, SinkError, StorageSink, Value, ensure_table,
};
use crate::staging::batch::{BatchAccumulator, BatchThreshold, FlushReport};
use crate::staging::sanitize::CANONICAL_DATETIME;

/// Table recording completed typed copies
pub const MARKER_TABLE: &str = "typed_table_markers";

/// Type decided for one column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnAssignment {
    pub column: String,
    pub inferred: InferredType,
}

/// Statistics and decision for one column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnProfile {
    pub statistics: ColumnStatistics,
    pub inferred: InferredType,
}

/// Outcome of one inference run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedTableReport {
    pub source_table: String,
    pub typed_table: String,
    pub columns: Vec<ColumnAssignment>,
    pub rows_copied: u64,
    /// Rows the sink rejected even when inserted alone
    pub rows_failed: u64,
    /// Values stored as null because they did not fit their type
    pub coercion_failures: u64,
    /// The typed table was already complete and nothing was done
    pub skipped: bool,
}

impl TypedTableReport {
    /// Inferred type of a column
    pub fn column_type(&self, column: &str) -> Option<InferredType> {
        self.columns
            .iter()
            .find(|c| c.column == column)
            .map(|c| c.inferred)
    }
}

fn marker_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::new("source_table", ColumnType::STRING),
        ColumnDef::new("typed_table", ColumnType::STRING),
        ColumnDef::new("column_types", ColumnType::Json),
        ColumnDef::new("completed_at", ColumnType::DateTime),
    ]
}

/// Recovers column types from untyped text tables
///
/// Each run samples a source table, decides a type per column and copies the
/// rows into `<table><suffix>`. A completion marker makes repeat runs no-ops
/// unless `force` is set.
pub struct TypeInferenceEngine<'a, S: StorageSink + ?Sized> {
    sink: &'a mut S,
    config: InferenceConfig,
}

impl<'a, S: StorageSink + ?Sized> TypeInferenceEngine<'a, S> {
    pub fn new(sink: &'a mut S, config: InferenceConfig) -> Self {
        Self { sink, config }
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// Gather statistics and decide column types without writing anything
    pub fn infer_table(&self, table: &str) -> Result<Vec<ColumnProfile>, InferenceError> {
        if !self.sink.table_exists(table)? {
            return Err(InferenceError::TableNotFound(table.to_string()));
        }
        let statistics = gather_statistics(&*self.sink, table, &self.config)?;
        if statistics.is_empty() {
            return Err(InferenceError::NoColumns(table.to_string()));
        }

        Ok(statistics
            .into_iter()
            .map(|statistics| {
                let inferred = decide(&statistics, &self.config);
                debug!(
                    column = %statistics.column,
                    sample = statistics.sample_size,
                    inferred = %inferred,
                    "Column type decided"
                );
                ColumnProfile {
                    statistics,
                    inferred,
                }
            })
            .collect())
    }

    /// True when a typed copy of `table` has been completed
    pub fn is_complete(&self, table: &str) -> Result<bool, InferenceError> {
        Ok(self.read_marker(table)?.is_some()
            && self.sink.table_exists(&self.config.typed_table_name(table))?)
    }

    /// Infer types for `table` and materialize its typed copy
    pub fn run(&mut self, table: &str) -> Result<TypedTableReport, InferenceError> {
        let typed_table = self.config.typed_table_name(table);
        let _span = info_span!("type_inference", source = table, typed = %typed_table).entered();

        if !self.sink.table_exists(table)? {
            return Err(InferenceError::TableNotFound(table.to_string()));
        }
        ensure_table(&mut *self.sink, MARKER_TABLE, &marker_columns()).map_err(|source| {
            InferenceError::Materialize {
                table: MARKER_TABLE.to_string(),
                source,
            }
        })?;

        let marker = self.read_marker(table)?;
        let typed_exists = self.sink.table_exists(&typed_table)?;

        match (&marker, typed_exists, self.config.force) {
            (Some(columns), true, false) => {
                info!(table, "Typed table already complete, skipping");
                return Ok(TypedTableReport {
                    source_table: table.to_string(),
                    typed_table,
                    columns: columns.clone(),
                    rows_copied: 0,
                    rows_failed: 0,
                    coercion_failures: 0,
                    skipped: true,
                });
            }
            (None, true, false) => {
                warn!(table = %typed_table, "Typed table has no completion marker, rebuilding");
            }
            _ => {}
        }
        self.clear(table, &typed_table)?;

        let profiles = self.infer_table(table)?;
        let columns: Vec<ColumnAssignment> = profiles
            .iter()
            .map(|p| ColumnAssignment {
                column: p.statistics.column.clone(),
                inferred: p.inferred,
            })
            .collect();

        let defs: Vec<ColumnDef> = columns
            .iter()
            .map(|c| ColumnDef::new(c.column.as_str(), c.inferred.column_type()))
            .collect();
        self.sink
            .create_table(&typed_table, &defs)
            .map_err(|source| InferenceError::Materialize {
                table: typed_table.clone(),
                source,
            })?;

        let mut report = TypedTableReport {
            source_table: table.to_string(),
            typed_table,
            columns,
            rows_copied: 0,
            rows_failed: 0,
            coercion_failures: 0,
            skipped: false,
        };
        self.copy_rows(&mut report)?;
        self.write_marker(&report)?;

        info!(
            table,
            rows_copied = report.rows_copied,
            rows_failed = report.rows_failed,
            coercion_failures = report.coercion_failures,
            "Typed table complete"
        );
        Ok(report)
    }

    fn clear(&mut self, table: &str, typed_table: &str) -> Result<(), SinkError> {
        self.sink.drop_table(typed_table)?;
        let removed = self.sink.delete_where(
            MARKER_TABLE,
            &Predicate::Equals("source_table".to_string(), table.to_string()),
        )?;
        if removed > 0 {
            debug!(table, removed, "Removed completion marker");
        }
        Ok(())
    }

    /// Column types recorded by the completion marker of `table`
    fn read_marker(&self, table: &str) -> Result<Option<Vec<ColumnAssignment>>, SinkError> {
        if !self.sink.table_exists(MARKER_TABLE)? {
            return Ok(None);
        }
        let names = self.sink.columns(MARKER_TABLE)?;
        let source_at = names.iter().position(|n| n == "source_table");
        let types_at = names.iter().position(|n| n == "column_types");
        let (Some(source_at), Some(types_at)) = (source_at, types_at) else {
            return Ok(None);
        };

        let mut offset = 0u64;
        loop {
            let rows = self.sink.fetch_rows(MARKER_TABLE, offset, 100)?;
            if rows.is_empty() {
                return Ok(None);
            }
            offset += rows.len() as u64;
            for row in rows {
                if row.get(source_at).and_then(|v| v.as_deref()) != Some(table) {
                    continue;
                }
                let columns = row
                    .get(types_at)
                    .and_then(|v| v.as_deref())
                    .and_then(|json| serde_json::from_str(json).ok())
                    .unwrap_or_default();
                return Ok(Some(columns));
            }
        }
    }

    fn write_marker(&mut self, report: &TypedTableReport) -> Result<(), InferenceError> {
        let column_types = serde_json::to_string(&report.columns).map_err(|e| {
            InferenceError::Materialize {
                table: MARKER_TABLE.to_string(),
                source: SinkError::Backend(e.to_string()),
            }
        })?;
        let marker = Record::with_capacity(4)
            .with("source_table", report.source_table.as_str())
            .with("typed_table", report.typed_table.as_str())
            .with("column_types", column_types)
            .with(
                "completed_at",
                Utc::now().format(CANONICAL_DATETIME).to_string(),
            );
        self.sink
            .insert_batch(MARKER_TABLE, &[marker])
            .map_err(|source| InferenceError::Materialize {
                table: MARKER_TABLE.to_string(),
                source,
            })?;
        Ok(())
    }

    /// Copy and coerce every source row into the typed table
    fn copy_rows(&mut self, report: &mut TypedTableReport) -> Result<(), InferenceError> {
        let batch_size = self.config.copy_batch_size.max(1);
        let mut accumulator = BatchAccumulator::new(BatchThreshold::new(batch_size, batch_size));
        accumulator.register(&report.typed_table, true);

        let mut offset = 0u64;
        loop {
            let rows = self
                .sink
                .fetch_rows(&report.source_table, offset, batch_size)?;
            if rows.is_empty() {
                break;
            }
            let fetched = rows.len();

            for (i, row) in rows.into_iter().enumerate() {
                let row_number = offset + i as u64 + 1;
                let mut record = Record::with_capacity(report.columns.len());
                for (column, cell) in report.columns.iter().zip(row) {
                    let value = match coerce(cell.as_deref(), column.inferred) {
                        Ok(value) => value,
                        Err(error) => {
                            warn!(
                                row = row_number,
                                column = %column.column,
                                error = %error,
                                "Coercion failed, storing null"
                            );
                            report.coercion_failures += 1;
                            Value::Null
                        }
                    };
                    record.set(column.column.as_str(), value);
                }
                if let Some(flushed) =
                    accumulator.push(&mut *self.sink, &report.typed_table, record)
                {
                    absorb(report, flushed);
                }
            }

            offset += fetched as u64;
            if fetched < batch_size {
                break;
            }
        }

        for flushed in accumulator.flush_all(&mut *self.sink) {
            absorb(report, flushed);
        }
        Ok(())
    }
}

fn absorb(report: &mut TypedTableReport, flushed: FlushReport) {
    report.rows_copied += flushed.inserted as u64;
    for failure in &flushed.failures {
        warn!(
            table = %flushed.table,
            error = %failure.error,
            row = %failure.record.to_payload(),
            "Typed row rejected"
        );
    }
    report.rows_failed += flushed.failures.len() as u64;
}
