//! Import run records and failed items

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::RecordError;
use super::governor::MemorySnapshot;
use super::progress::format_number;
use super::sanitize::CANONICAL_DATETIME;
use crate::sink::{ColumnDef, ColumnType, Record, SinkError, StorageSink, ensure_table};

/// Stage at which a record failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePhase {
    Read,
    Parse,
    Extract,
    Insert,
}

impl fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePhase::Read => write!(f, "read"),
            FailurePhase::Parse => write!(f, "parse"),
            FailurePhase::Extract => write!(f, "extract"),
            FailurePhase::Insert => write!(f, "insert"),
        }
    }
}

impl From<&RecordError> for FailurePhase {
    fn from(error: &RecordError) -> Self {
        match error {
            RecordError::Read(_) => FailurePhase::Read,
            RecordError::Parse(_) => FailurePhase::Parse,
            RecordError::Extract(_) => FailurePhase::Extract,
            RecordError::Insert { .. } => FailurePhase::Insert,
        }
    }
}

/// A record or row that could not be processed
///
/// Diagnostic only; nothing reads failed items back to decide behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedItem {
    pub phase: FailurePhase,
    /// Destination table, when known
    pub table: Option<String>,
    /// Source text of the fragment or row, or the rejected record as JSON
    pub raw_payload: String,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
    pub memory: MemorySnapshot,
}

impl FailedItem {
    pub fn new(
        phase: FailurePhase,
        table: Option<&str>,
        raw_payload: String,
        error_message: String,
        memory: MemorySnapshot,
    ) -> Self {
        Self {
            phase,
            table: table.map(|t| t.to_string()),
            raw_payload,
            error_message,
            timestamp: Utc::now(),
            memory,
        }
    }
}

/// Status of an import run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportStatus::Running => write!(f, "running"),
            ImportStatus::Completed => write!(f, "completed"),
            ImportStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for ImportStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(ImportStatus::Running),
            "completed" => Ok(ImportStatus::Completed),
            "failed" => Ok(ImportStatus::Failed),
            _ => Err(format!("Invalid import status: {}", s)),
        }
    }
}

/// Source format of an import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportFormat {
    Wxr,
    Delimited,
}

impl fmt::Display for ImportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportFormat::Wxr => write!(f, "wxr"),
            ImportFormat::Delimited => write!(f, "delimited"),
        }
    }
}

/// Row counts for one destination table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStats {
    pub inserted: u64,
    pub failed: u64,
}

/// Record of one import
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRun {
    /// Unique run identifier
    pub id: String,
    pub source_path: String,
    pub format: ImportFormat,
    pub status: ImportStatus,
    /// Fragments or rows seen
    pub records_encountered: u64,
    /// Rows stored in a primary table
    pub records_stored: u64,
    /// Records that failed to read, parse, extract or insert
    pub records_failed: u64,
    pub bytes_processed: u64,
    pub tables: BTreeMap<String, TableStats>,
    pub failed_items: Vec<FailedItem>,
    pub peak_memory_bytes: u64,
    pub final_batch_threshold: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl ImportRun {
    pub fn new(source_path: &str, format: ImportFormat) -> Self {
        Self {
            id: Self::generate_id(),
            source_path: source_path.to_string(),
            format,
            status: ImportStatus::Running,
            records_encountered: 0,
            records_stored: 0,
            records_failed: 0,
            bytes_processed: 0,
            tables: BTreeMap::new(),
            failed_items: Vec::new(),
            peak_memory_bytes: 0,
            final_batch_threshold: 0,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
        }
    }

    /// Generate a new run ID
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn complete(&mut self) {
        self.status = ImportStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &str) {
        self.status = ImportStatus::Failed;
        self.error_message = Some(error.to_string());
        self.completed_at = Some(Utc::now());
    }

    /// Count rows written to a table
    pub fn record_inserted(&mut self, table: &str, rows: u64, primary: bool) {
        self.tables.entry(table.to_string()).or_default().inserted += rows;
        if primary {
            self.records_stored += rows;
        }
    }

    /// Keep a failed item; `counts_as_record` when it stands for a whole
    /// fragment or row rather than a dependent row
    pub fn record_failure(&mut self, item: FailedItem, counts_as_record: bool) {
        if let Some(table) = &item.table {
            if item.phase == FailurePhase::Insert {
                self.tables.entry(table.clone()).or_default().failed += 1;
            }
        }
        if counts_as_record {
            self.records_failed += 1;
        }
        self.failed_items.push(item);
    }

    pub fn note_memory(&mut self, snapshot: &MemorySnapshot) {
        self.peak_memory_bytes = self.peak_memory_bytes.max(snapshot.used_bytes);
    }

    /// Every encountered record was either stored or failed
    pub fn is_balanced(&self) -> bool {
        self.records_stored + self.records_failed == self.records_encountered
    }

    /// Duration in seconds
    pub fn duration_seconds(&self) -> f64 {
        let ended = self.completed_at.unwrap_or_else(Utc::now);
        (ended - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// Records per second throughput
    pub fn throughput(&self) -> Option<f64> {
        let duration = self.duration_seconds();
        if duration <= 0.0 {
            return None;
        }
        Some(self.records_encountered as f64 / duration)
    }

    /// One-line human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "{} import {}: {} {} stored, {} failed of {} in {:.1}s",
            self.format,
            self.status,
            format_number(self.records_stored),
            if self.records_stored == 1 { "record" } else { "records" },
            format_number(self.records_failed),
            format_number(self.records_encountered),
            self.duration_seconds()
        )
    }
}

/// Columns of the failed item table
pub fn failed_item_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::new("run_id", ColumnType::String { length: 36 }),
        ColumnDef::new("phase", ColumnType::String { length: 20 }),
        ColumnDef::new("table_name", ColumnType::STRING),
        ColumnDef::new("raw_payload", ColumnType::LongText),
        ColumnDef::new("error_message", ColumnType::Text),
        ColumnDef::new("failed_at", ColumnType::DateTime),
        ColumnDef::new("memory_used_bytes", ColumnType::BigInteger),
        ColumnDef::new("batch_threshold", ColumnType::BigInteger),
    ]
}

/// Write a run's failed items to a table, creating it if needed
pub fn persist_failed_items<S: StorageSink + ?Sized>(
    sink: &mut S,
    table: &str,
    run: &ImportRun,
) -> Result<usize, SinkError> {
    ensure_table(sink, table, &failed_item_columns())?;

    let mut written = 0;
    for chunk in run.failed_items.chunks(500) {
        let rows: Vec<Record> = chunk
            .iter()
            .map(|item| {
                Record::with_capacity(8)
                    .with("run_id", run.id.as_str())
                    .with("phase", item.phase.to_string())
                    .with("table_name", item.table.clone())
                    .with("raw_payload", item.raw_payload.as_str())
                    .with("error_message", item.error_message.as_str())
                    .with(
                        "failed_at",
                        item.timestamp.format(CANONICAL_DATETIME).to_string(),
                    )
                    .with("memory_used_bytes", item.memory.used_bytes.min(i64::MAX as u64) as i64)
                    .with("batch_threshold", item.memory.batch_threshold as i64)
            })
            .collect();
        written += sink.insert_batch(table, &rows)?;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    fn snapshot() -> MemorySnapshot {
        MemorySnapshot {
            used_bytes: 1024,
            ceiling_bytes: Some(4096),
            pressure: 0.25,
            batch_threshold: 50,
        }
    }

    #[test]
    fn test_import_status_round_trip() {
        assert_eq!(ImportStatus::Completed.to_string(), "completed");
        assert_eq!(
            "FAILED".parse::<ImportStatus>().unwrap(),
            ImportStatus::Failed
        );
        assert!("paused".parse::<ImportStatus>().is_err());
    }

    #[test]
    fn test_accounting() {
        let mut run = ImportRun::new("export.xml", ImportFormat::Wxr);
        run.records_encountered = 3;
        run.record_inserted("posts", 2, true);
        run.record_inserted("postmeta", 5, false);
        run.record_failure(
            FailedItem::new(
                FailurePhase::Parse,
                None,
                "<item>".into(),
                "bad".into(),
                snapshot(),
            ),
            true,
        );
        run.record_failure(
            FailedItem::new(
                FailurePhase::Insert,
                Some("postmeta"),
                "{}".into(),
                "too long".into(),
                snapshot(),
            ),
            false,
        );

        assert!(run.is_balanced());
        assert_eq!(run.records_stored, 2);
        assert_eq!(run.records_failed, 1);
        assert_eq!(run.failed_items.len(), 2);
        assert_eq!(run.tables["postmeta"], TableStats { inserted: 5, failed: 1 });
    }

    #[test]
    fn test_run_lifecycle() {
        let mut run = ImportRun::new("data.csv", ImportFormat::Delimited);
        assert_eq!(run.status, ImportStatus::Running);
        assert!(uuid::Uuid::parse_str(&run.id).is_ok());

        run.complete();
        assert_eq!(run.status, ImportStatus::Completed);
        assert!(run.completed_at.is_some());
        assert!(run.summary().starts_with("delimited import completed"));
    }

    #[test]
    fn test_persist_failed_items() {
        let mut sink = MemorySink::new();
        let mut run = ImportRun::new("data.csv", ImportFormat::Delimited);
        run.record_failure(
            FailedItem::new(
                FailurePhase::Read,
                Some("data"),
                "1,\u{fffd}".into(),
                "invalid UTF-8".into(),
                snapshot(),
            ),
            true,
        );

        let written = persist_failed_items(&mut sink, "import_failures", &run).unwrap();
        assert_eq!(written, 1);
        assert_eq!(
            sink.sample_non_null("import_failures", "phase", 1).unwrap(),
            vec!["read".to_string()]
        );
    }
}
