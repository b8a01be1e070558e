//! Per-table batch buffers with an adaptive flush threshold

use crate::sink::{Record, SinkError, StorageSink};

/// Flush threshold bounded by `[minimum, ceiling]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchThreshold {
    current: usize,
    minimum: usize,
    ceiling: usize,
}

impl BatchThreshold {
    /// Start at the ceiling; `minimum` is clamped into `1..=ceiling`
    pub fn new(ceiling: usize, minimum: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            current: ceiling,
            minimum: minimum.clamp(1, ceiling),
            ceiling,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn minimum(&self) -> usize {
        self.minimum
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Scale down to 70%, never below the minimum; true if it changed
    pub fn shrink(&mut self) -> bool {
        let next = (self.current * 7 / 10).max(self.minimum);
        let changed = next != self.current;
        self.current = next;
        changed
    }

    /// Scale up by 30%, never above the ceiling; true if it changed
    pub fn grow(&mut self) -> bool {
        if self.current >= self.ceiling {
            return false;
        }
        // Small thresholds would otherwise round back to themselves
        let next = (self.current * 13 / 10)
            .max(self.current + 1)
            .min(self.ceiling);
        self.current = next;
        true
    }

    pub fn is_below_ceiling(&self) -> bool {
        self.current < self.ceiling
    }
}

/// A row the sink rejected even when inserted on its own
#[derive(Debug)]
pub struct RowFailure {
    pub record: Record,
    pub error: SinkError,
}

/// Result of writing one table's buffer
#[derive(Debug)]
pub struct FlushReport {
    pub table: String,
    pub primary: bool,
    pub inserted: usize,
    /// Error of the whole-batch insert that triggered row-by-row retry
    pub batch_error: Option<String>,
    pub failures: Vec<RowFailure>,
}

impl FlushReport {
    fn empty(table: &str, primary: bool) -> Self {
        Self {
            table: table.to_string(),
            primary,
            inserted: 0,
            batch_error: None,
            failures: Vec::new(),
        }
    }

    pub fn attempted(&self) -> usize {
        self.inserted + self.failures.len()
    }
}

#[derive(Debug)]
struct TableBuffer {
    table: String,
    primary: bool,
    rows: Vec<Record>,
}

/// Owns pending records for every destination table of one import
///
/// Buffers share one threshold. A buffer is flushed automatically when it
/// reaches the threshold; the memory governor can additionally flush every
/// buffer at once.
#[derive(Debug)]
pub struct BatchAccumulator {
    threshold: BatchThreshold,
    buffers: Vec<TableBuffer>,
}

impl BatchAccumulator {
    pub fn new(threshold: BatchThreshold) -> Self {
        Self {
            threshold,
            buffers: Vec::new(),
        }
    }

    pub fn threshold(&self) -> &BatchThreshold {
        &self.threshold
    }

    pub fn threshold_mut(&mut self) -> &mut BatchThreshold {
        &mut self.threshold
    }

    /// Declare a destination table; flush order follows registration order
    pub fn register(&mut self, table: &str, primary: bool) {
        if self.position(table).is_none() {
            self.buffers.push(TableBuffer {
                table: table.to_string(),
                primary,
                rows: Vec::new(),
            });
        }
    }

    fn position(&self, table: &str) -> Option<usize> {
        self.buffers.iter().position(|b| b.table == table)
    }

    /// Pending rows for a table
    pub fn pending(&self, table: &str) -> usize {
        self.position(table)
            .map(|i| self.buffers[i].rows.len())
            .unwrap_or(0)
    }

    /// Pending rows across all tables
    pub fn total_pending(&self) -> usize {
        self.buffers.iter().map(|b| b.rows.len()).sum()
    }

    /// Buffer a record, flushing its table when the threshold is reached
    pub fn push<S: StorageSink + ?Sized>(
        &mut self,
        sink: &mut S,
        table: &str,
        record: Record,
    ) -> Option<FlushReport> {
        let index = match self.position(table) {
            Some(i) => i,
            None => {
                self.register(table, false);
                self.buffers.len() - 1
            }
        };
        self.buffers[index].rows.push(record);
        if self.buffers[index].rows.len() >= self.threshold.current {
            Some(Self::flush_buffer(sink, &mut self.buffers[index]))
        } else {
            None
        }
    }

    /// Write one table's buffer
    ///
    /// The buffer goes to the sink in a single `insert_batch` call. If that
    /// call fails, the same rows are retried one at a time and every row that
    /// still fails is returned in [`FlushReport::failures`]; the other rows
    /// are stored.
    pub fn flush<S: StorageSink + ?Sized>(&mut self, sink: &mut S, table: &str) -> FlushReport {
        match self.position(table) {
            Some(i) => Self::flush_buffer(sink, &mut self.buffers[i]),
            None => FlushReport::empty(table, false),
        }
    }

    /// Write every non-empty buffer, in registration order
    pub fn flush_all<S: StorageSink + ?Sized>(&mut self, sink: &mut S) -> Vec<FlushReport> {
        self.buffers
            .iter_mut()
            .filter(|b| !b.rows.is_empty())
            .map(|b| Self::flush_buffer(sink, b))
            .collect()
    }

    /// Release spare capacity held by drained buffers
    pub fn reclaim(&mut self) {
        for buffer in &mut self.buffers {
            buffer.rows.shrink_to_fit();
        }
    }

    fn flush_buffer<S: StorageSink + ?Sized>(sink: &mut S, buffer: &mut TableBuffer) -> FlushReport {
        let mut report = FlushReport::empty(&buffer.table, buffer.primary);
        if buffer.rows.is_empty() {
            return report;
        }

        match sink.insert_batch(&buffer.table, &buffer.rows) {
            Ok(inserted) => {
                report.inserted = inserted;
                buffer.rows.clear();
            }
            Err(batch_error) => {
                tracing::debug!(
                    table = %buffer.table,
                    rows = buffer.rows.len(),
                    error = %batch_error,
                    "Batch insert failed, retrying rows individually"
                );
                report.batch_error = Some(batch_error.to_string());
                for record in buffer.rows.drain(..) {
                    match sink.insert_batch(&buffer.table, std::slice::from_ref(&record)) {
                        Ok(inserted) => report.inserted += inserted,
                        Err(error) => report.failures.push(RowFailure { record, error }),
                    }
                }
            }
        }

        tracing::debug!(
            table = %report.table,
            inserted = report.inserted,
            failed = report.failures.len(),
            "Flushed batch"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{ColumnDef, ColumnType, MemorySink, Value};

    fn sink() -> MemorySink {
        let mut sink = MemorySink::new();
        sink.create_table(
            "items",
            &[
                ColumnDef::new("id", ColumnType::Integer),
                ColumnDef::new("code", ColumnType::String { length: 3 }),
            ],
        )
        .unwrap();
        sink.create_table("notes", &[ColumnDef::new("body", ColumnType::Text)])
            .unwrap();
        sink
    }

    fn item(id: i64, code: &str) -> Record {
        Record::new().with("id", id).with("code", code)
    }

    #[test]
    fn test_threshold_shrink_and_grow() {
        let mut threshold = BatchThreshold::new(100, 10);
        assert!(threshold.shrink());
        assert_eq!(threshold.current(), 70);
        assert!(threshold.grow());
        assert_eq!(threshold.current(), 91);
        assert!(threshold.grow());
        assert_eq!(threshold.current(), 100);
        assert!(!threshold.grow());
    }

    #[test]
    fn test_threshold_respects_minimum() {
        let mut threshold = BatchThreshold::new(12, 10);
        threshold.shrink();
        assert_eq!(threshold.current(), 10);
        assert!(!threshold.shrink());
        assert_eq!(threshold.current(), 10);
    }

    #[test]
    fn test_threshold_grows_from_small_values() {
        let mut threshold = BatchThreshold::new(5, 1);
        for _ in 0..10 {
            threshold.shrink();
        }
        assert_eq!(threshold.current(), 1);
        threshold.grow();
        assert_eq!(threshold.current(), 2);
    }

    #[test]
    fn test_auto_flush_at_threshold() {
        let mut sink = sink();
        let mut acc = BatchAccumulator::new(BatchThreshold::new(2, 1));
        acc.register("items", true);

        assert!(acc.push(&mut sink, "items", item(1, "a")).is_none());
        let report = acc.push(&mut sink, "items", item(2, "b")).unwrap();
        assert_eq!(report.inserted, 2);
        assert!(report.primary);
        assert_eq!(acc.pending("items"), 0);
        assert_eq!(sink.count("items").unwrap(), 2);
    }

    #[test]
    fn test_failed_batch_is_retried_per_row() {
        let mut sink = sink();
        let mut acc = BatchAccumulator::new(BatchThreshold::new(10, 1));
        acc.push(&mut sink, "items", item(1, "ok"));
        acc.push(&mut sink, "items", item(2, "toolong"));
        acc.push(&mut sink, "items", item(3, "ok"));

        let report = acc.flush(&mut sink, "items");
        assert!(report.batch_error.is_some());
        assert_eq!(report.inserted, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].record.get("id"), Some(&Value::Integer(2)));
        assert_eq!(report.attempted(), 3);
        assert_eq!(sink.count("items").unwrap(), 2);
    }

    #[test]
    fn test_flush_all_drains_every_table() {
        let mut sink = sink();
        let mut acc = BatchAccumulator::new(BatchThreshold::new(10, 1));
        acc.push(&mut sink, "items", item(1, "a"));
        acc.push(&mut sink, "notes", Record::new().with("body", "x"));

        let reports = acc.flush_all(&mut sink);
        assert_eq!(reports.len(), 2);
        assert_eq!(acc.total_pending(), 0);
        acc.reclaim();
        assert_eq!(sink.count("notes").unwrap(), 1);
    }
}
