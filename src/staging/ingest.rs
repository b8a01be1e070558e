//! Streaming import of WXR and delimited sources into a storage sink

use std::io::{BufRead, Read};
use std::path::Path;
use std::time::Instant;

use tracing::{debug, info, info_span, warn};

use super::batch::{BatchAccumulator, BatchThreshold, FlushReport};
use super::config::ImportConfig;
use super::delimited::DelimitedReader;
use super::error::{IngestError, RecordError};
use super::extract::{ExtractionContext, Extracted, extract_author, extract_item, wxr_tables};
use super::governor::{MemoryGovernor, MemoryGauge, ProcessMemoryGauge};
use super::progress::{ImportObserver, NoopObserver, ProgressCursor, ProgressThrottle, ProgressUnit};
use super::report::{FailedItem, FailurePhase, ImportFormat, ImportRun, persist_failed_items};
use super::source::{SourceFile, estimate_total};
use super::wxr::{FragmentKind, WxrReader};
use crate::sink::{ColumnDef, ColumnType, Record, StorageSink, ensure_table};

const WXR_READ_BUFFER: usize = 64 * 1024;

/// State of one import in flight
struct RunState {
    run: ImportRun,
    accumulator: BatchAccumulator,
    throttle: ProgressThrottle,
    unit: ProgressUnit,
    total_bytes: u64,
    started: Instant,
}

/// Imports source files into a [`StorageSink`]
///
/// One importer can run several imports in sequence; each returns its own
/// [`ImportRun`]. Malformed records never abort an import: they are kept as
/// failed items on the run and the stream continues.
pub struct Importer<'a, S: StorageSink + ?Sized> {
    sink: &'a mut S,
    config: ImportConfig,
    governor: MemoryGovernor<'a>,
    observer: Box<dyn ImportObserver + 'a>,
}

impl<'a, S: StorageSink + ?Sized> Importer<'a, S> {
    /// Create an importer that samples the memory of the current process
    pub fn new(sink: &'a mut S, config: ImportConfig) -> Result<Self, IngestError> {
        config.validate()?;
        let governor = MemoryGovernor::new(
            config.memory.limit,
            config.batch.check_interval,
            Box::new(ProcessMemoryGauge::new()),
        );
        Ok(Self {
            sink,
            config,
            governor,
            observer: Box::new(NoopObserver),
        })
    }

    /// Replace the memory source
    pub fn with_gauge(mut self, gauge: impl MemoryGauge + 'a) -> Self {
        self.governor.set_gauge(Box::new(gauge));
        self
    }

    /// Receive progress and memory notifications
    pub fn with_observer(mut self, observer: impl ImportObserver + 'a) -> Self {
        self.observer = Box::new(observer);
        self
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Import a WXR export file
    pub fn import_wxr(&mut self, path: &Path) -> Result<ImportRun, IngestError> {
        let source = SourceFile::open(path)?;
        let reader = source.reader(WXR_READ_BUFFER)?;
        self.import_wxr_from(reader, source.size(), &path.display().to_string())
    }

    /// Import a WXR document from any buffered reader
    ///
    /// `total_bytes` is only used to estimate progress; pass 0 when unknown.
    pub fn import_wxr_from<R: BufRead>(
        &mut self,
        input: R,
        total_bytes: u64,
        source: &str,
    ) -> Result<ImportRun, IngestError> {
        let mut state = self.begin(source, ImportFormat::Wxr, ProgressUnit::Fragments, total_bytes);
        let _span = info_span!("wxr_import", job_id = %state.run.id, source).entered();
        info!(source, total_bytes, "Starting WXR import");

        for schema in wxr_tables(&self.config.wxr) {
            ensure_table(&mut *self.sink, schema.name, &schema.columns).map_err(|source| {
                IngestError::Schema {
                    table: schema.name.to_string(),
                    source,
                }
            })?;
            state.accumulator.register(schema.name, schema.primary);
        }

        let mut context = ExtractionContext::new();
        let mut reader = WxrReader::new(input);

        while let Some(next) = reader.next_fragment() {
            match next {
                Err(error) => {
                    state.run.records_encountered += 1;
                    self.fail(&mut state, &error, None, String::new(), true);
                }
                Ok(fragment) => {
                    if fragment.kind == FragmentKind::Author && !self.config.wxr.authors {
                        continue;
                    }
                    state.run.records_encountered += 1;

                    let extracted = fragment.root.and_then(|node| match fragment.kind {
                        FragmentKind::Item => extract_item(&node, &self.config.wxr, &mut context),
                        FragmentKind::Author => extract_author(&node),
                    });
                    match extracted {
                        Ok(extracted) => self.store(&mut state, extracted),
                        Err(error) => self.fail(&mut state, &error, None, fragment.raw, true),
                    }
                }
            }

            self.govern(&mut state);
            self.report_progress(&mut state, reader.bytes_consumed());
        }

        debug!(terms = context.terms_seen(), "Distinct terms emitted");
        Ok(self.finish(state, reader.bytes_consumed()))
    }

    /// Import a delimited text file
    ///
    /// The destination table is the configured table name, or the normalised
    /// file stem.
    pub fn import_delimited(&mut self, path: &Path) -> Result<ImportRun, IngestError> {
        let source = SourceFile::open(path)?;
        let reader = source.reader(self.config.delimited.buffer_capacity)?;
        let table = self
            .config
            .delimited
            .table
            .clone()
            .unwrap_or_else(|| source.table_name());
        self.import_delimited_from(reader, source.size(), &path.display().to_string(), &table)
    }

    /// Import delimited text from any reader into `table`
    pub fn import_delimited_from<R: Read>(
        &mut self,
        input: R,
        total_bytes: u64,
        source: &str,
        table: &str,
    ) -> Result<ImportRun, IngestError> {
        let mut state = self.begin(source, ImportFormat::Delimited, ProgressUnit::Rows, total_bytes);
        let _span = info_span!("delimited_import", job_id = %state.run.id, source, table).entered();
        info!(source, table, total_bytes, "Starting delimited import");

        let mut reader = DelimitedReader::new(input, &self.config.delimited).map_err(|e| {
            IngestError::SourceNotReadable {
                path: source.into(),
                reason: e.to_string(),
            }
        })?;
        let headers = reader.headers().to_vec();

        if headers.is_empty() {
            info!(source, "Source has no rows");
            return Ok(self.finish(state, reader.bytes_consumed()));
        }

        let columns: Vec<ColumnDef> = headers
            .iter()
            .map(|name| ColumnDef::new(name.as_str(), ColumnType::Text))
            .collect();
        ensure_table(&mut *self.sink, table, &columns).map_err(|source| IngestError::Schema {
            table: table.to_string(),
            source,
        })?;
        state.accumulator.register(table, true);

        while let Some(next) = reader.next_row() {
            state.run.records_encountered += 1;
            match next {
                Ok(row) => self.push(&mut state, table, row.to_record(&headers)),
                Err((error, raw)) => self.fail(&mut state, &error, Some(table), raw, true),
            }

            self.govern(&mut state);
            self.report_progress(&mut state, reader.bytes_consumed());
        }

        Ok(self.finish(state, reader.bytes_consumed()))
    }

    fn begin(
        &mut self,
        source: &str,
        format: ImportFormat,
        unit: ProgressUnit,
        total_bytes: u64,
    ) -> RunState {
        self.governor
            .reset(self.config.memory.limit, self.config.batch.check_interval);
        let threshold = BatchThreshold::new(
            self.config.batch.initial_size,
            self.config.batch.minimum_size,
        );
        RunState {
            run: ImportRun::new(source, format),
            accumulator: BatchAccumulator::new(threshold),
            throttle: ProgressThrottle::new(),
            unit,
            total_bytes,
            started: Instant::now(),
        }
    }

    fn store(&mut self, state: &mut RunState, extracted: Extracted) {
        let Extracted {
            primary,
            dependents,
        } = extracted;
        self.push(state, primary.table, primary.record);
        for dependent in dependents {
            self.push(state, dependent.table, dependent.record);
        }
    }

    fn push(&mut self, state: &mut RunState, table: &str, record: Record) {
        if let Some(report) = state.accumulator.push(&mut *self.sink, table, record) {
            self.absorb(state, vec![report]);
        }
    }

    /// Fold flush results into the run
    fn absorb(&mut self, state: &mut RunState, reports: Vec<FlushReport>) {
        for report in reports {
            state
                .run
                .record_inserted(&report.table, report.inserted as u64, report.primary);
            for failure in report.failures {
                let error = RecordError::Insert {
                    table: report.table.clone(),
                    message: failure.error.to_string(),
                };
                self.fail(
                    state,
                    &error,
                    Some(&report.table),
                    failure.record.to_payload(),
                    report.primary,
                );
            }
        }
    }

    fn fail(
        &mut self,
        state: &mut RunState,
        error: &RecordError,
        table: Option<&str>,
        raw_payload: String,
        counts_as_record: bool,
    ) {
        let snapshot = self.governor.snapshot(state.accumulator.threshold());
        warn!(
            phase = %FailurePhase::from(error),
            table,
            record = state.run.records_encountered,
            memory_used_bytes = snapshot.used_bytes,
            batch_threshold = snapshot.batch_threshold,
            error = %error,
            "Record failed"
        );
        let item = FailedItem::new(
            FailurePhase::from(error),
            table,
            raw_payload,
            error.to_string(),
            snapshot,
        );
        state.run.record_failure(item, counts_as_record);
    }

    /// Let the memory governor adjust the threshold and force flushes
    fn govern(&mut self, state: &mut RunState) {
        let Some(evaluation) = self.governor.tick(state.accumulator.threshold_mut()) else {
            return;
        };

        if evaluation.flush_all {
            let reports = state.accumulator.flush_all(&mut *self.sink);
            self.absorb(state, reports);
            state.accumulator.reclaim();
        }

        state.run.note_memory(&evaluation.snapshot);
        self.observer.on_memory(&evaluation.snapshot);
    }

    fn report_progress(&mut self, state: &mut RunState, bytes_consumed: u64) {
        let processed = state.run.records_encountered;
        let estimated_total = estimate_total(processed, bytes_consumed, state.total_bytes);
        if state.throttle.should_report(processed, estimated_total) {
            self.observer.on_progress(&ProgressCursor {
                processed,
                estimated_total,
                unit: state.unit,
            });
        }
    }

    fn finish(&mut self, mut state: RunState, bytes_consumed: u64) -> ImportRun {
        let reports = state.accumulator.flush_all(&mut *self.sink);
        self.absorb(&mut state, reports);
        state.accumulator.reclaim();

        state.run.bytes_processed = bytes_consumed;
        state.run.final_batch_threshold = state.accumulator.threshold().current();

        let processed = state.run.records_encountered;
        if state.throttle.finish(processed) {
            self.observer.on_progress(&ProgressCursor {
                processed,
                estimated_total: processed,
                unit: state.unit,
            });
        }

        if let Some(table) = &self.config.failed_items_table {
            if !state.run.failed_items.is_empty() {
                match persist_failed_items(&mut *self.sink, table, &state.run) {
                    Ok(written) => debug!(table = %table, written, "Persisted failed items"),
                    Err(e) => {
                        warn!(table = %table, error = %e, "Failed items not persisted");
                        state.run.error_message =
                            Some(format!("failed items not persisted to {table}: {e}"));
                    }
                }
            }
        }

        state.run.complete();
        info!(
            encountered = state.run.records_encountered,
            stored = state.run.records_stored,
            failed = state.run.records_failed,
            bytes = state.run.bytes_processed,
            batch_threshold = state.run.final_batch_threshold,
            duration_ms = state.started.elapsed().as_millis() as u64,
            "Import complete"
        );
        state.run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemorySink, Value};
    use crate::staging::config::{DelimitedOptions, MemoryLimit, WxrOptions};
    use crate::staging::governor::{FixedGauge, MemorySnapshot};

    const WXR: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:wp="http://wordpress.org/export/1.2/" xmlns:content="http://purl.org/rss/1.0/modules/content/">
<channel>
  <wp:author><wp:author_id>7</wp:author_id><wp:author_login>editor</wp:author_login></wp:author>
  <item>
    <title>First</title>
    <wp:post_id>1</wp:post_id>
    <category domain="category" nicename="news">News</category>
  </item>
  <item>
    <title>Second</title>
    <wp:post_id>2</wp:post_id>
    <category domain="category" nicename="news">News</category>
  </item>
</channel>
</rss>"#;

    fn config() -> ImportConfig {
        ImportConfig::builder()
            .batch_size(10)
            .minimum_batch_size(2)
            .memory_limit(MemoryLimit::Unlimited)
            .build()
            .unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        progress: Vec<ProgressCursor>,
        memory: Vec<MemorySnapshot>,
    }

    impl ImportObserver for Recorder {
        fn on_progress(&mut self, cursor: &ProgressCursor) {
            self.progress.push(*cursor);
        }

        fn on_memory(&mut self, snapshot: &MemorySnapshot) {
            self.memory.push(*snapshot);
        }
    }

    #[test]
    fn test_wxr_import_routes_tables() {
        let mut sink = MemorySink::new();
        let run = {
            let mut importer = Importer::new(&mut sink, config()).unwrap();
            importer
                .import_wxr_from(WXR.as_bytes(), WXR.len() as u64, "inline.xml")
                .unwrap()
        };

        assert_eq!(run.records_encountered, 3);
        assert_eq!(run.records_stored, 3);
        assert!(run.is_balanced());
        assert_eq!(sink.count("posts").unwrap(), 2);
        assert_eq!(sink.count("users").unwrap(), 1);
        assert_eq!(sink.count("terms").unwrap(), 1);
        assert_eq!(sink.count("term_relationships").unwrap(), 2);
    }

    #[test]
    fn test_disabled_authors_are_not_counted() {
        let mut sink = MemorySink::new();
        let config = ImportConfig::builder()
            .memory_limit(MemoryLimit::Unlimited)
            .wxr(WxrOptions {
                authors: false,
                ..WxrOptions::default()
            })
            .build()
            .unwrap();
        let run = Importer::new(&mut sink, config)
            .unwrap()
            .import_wxr_from(WXR.as_bytes(), 0, "inline.xml")
            .unwrap();

        assert_eq!(run.records_encountered, 2);
        assert!(!sink.table_exists("users").unwrap());
    }

    #[test]
    fn test_delimited_import_stores_text() {
        let mut sink = MemorySink::new();
        let input = "Name,Age\nada,36\ngrace,85\n";
        let run = Importer::new(&mut sink, config())
            .unwrap()
            .import_delimited_from(input.as_bytes(), input.len() as u64, "people.csv", "people")
            .unwrap();

        assert_eq!(run.records_stored, 2);
        assert_eq!(sink.columns("people").unwrap(), vec!["name", "age"]);
        assert_eq!(
            sink.column_values("people", "age").unwrap(),
            vec![Value::Text("36".into()), Value::Text("85".into())]
        );
    }

    #[test]
    fn test_delimited_schema_is_extended() {
        let mut sink = MemorySink::new();
        sink.create_table("people", &[ColumnDef::new("name", ColumnType::Text)])
            .unwrap();
        let input = "name,email\nada,ada@example.com\n";
        Importer::new(&mut sink, config())
            .unwrap()
            .import_delimited_from(input.as_bytes(), 0, "people.csv", "people")
            .unwrap();

        assert_eq!(sink.columns("people").unwrap(), vec!["name", "email"]);
        assert_eq!(sink.count("people").unwrap(), 1);
    }

    #[test]
    fn test_observer_receives_final_progress_and_memory() {
        let mut sink = MemorySink::new();
        let mut recorder = Recorder::default();
        let input: String = std::iter::once("id\n".to_string())
            .chain((1..=25).map(|i| format!("{i}\n")))
            .collect();

        let config = ImportConfig::builder()
            .batch_size(10)
            .minimum_batch_size(2)
            .memory_limit(MemoryLimit::Bytes(1_000_000))
            .build()
            .unwrap();
        Importer::new(&mut sink, config)
            .unwrap()
            .with_gauge(FixedGauge(100_000))
            .with_observer(&mut recorder)
            .import_delimited_from(input.as_bytes(), input.len() as u64, "ids.csv", "ids")
            .unwrap();

        assert_eq!(recorder.memory.len(), 25);
        let last = recorder.progress.last().unwrap();
        assert_eq!(last.processed, 25);
        assert_eq!(last.estimated_total, 25);
        assert!(recorder.progress.windows(2).all(|w| w[0].processed < w[1].processed));
    }

    #[test]
    fn test_critical_pressure_flushes_every_record() {
        let mut sink = MemorySink::new();
        let mut recorder = Recorder::default();
        let config = ImportConfig::builder()
            .batch_size(100)
            .minimum_batch_size(10)
            .memory_limit(MemoryLimit::Bytes(1000))
            .build()
            .unwrap();
        let run = Importer::new(&mut sink, config)
            .unwrap()
            .with_gauge(FixedGauge(950))
            .with_observer(&mut recorder)
            .import_wxr_from(WXR.as_bytes(), 0, "inline.xml")
            .unwrap();

        assert_eq!(run.final_batch_threshold, 100);
        assert_eq!(run.peak_memory_bytes, 950);
        assert!(recorder.memory.iter().all(|s| s.pressure > 0.9));
        assert_eq!(sink.count("posts").unwrap(), 2);
    }

    #[test]
    fn test_failed_items_are_persisted() {
        let mut sink = MemorySink::new();
        let config = ImportConfig::builder()
            .memory_limit(MemoryLimit::Unlimited)
            .delimited(DelimitedOptions::default())
            .failed_items_table("import_failures")
            .build()
            .unwrap();
        let mut input = b"id,name\n1,ok\n2,".to_vec();
        input.extend_from_slice(&[0xff]);
        input.push(b'\n');

        let run = Importer::new(&mut sink, config)
            .unwrap()
            .import_delimited_from(input.as_slice(), 0, "bad.csv", "bad")
            .unwrap();

        assert_eq!(run.records_failed, 1);
        assert!(run.is_balanced());
        assert_eq!(sink.count("import_failures").unwrap(), 1);
    }

    #[test]
    fn test_unwritable_failed_items_table_keeps_the_run() {
        let mut sink = MemorySink::new();
        sink.create_table(
            "import_failures",
            &[ColumnDef::new("raw_payload", ColumnType::Integer)],
        )
        .unwrap();
        let config = ImportConfig::builder()
            .memory_limit(MemoryLimit::Unlimited)
            .failed_items_table("import_failures")
            .build()
            .unwrap();
        let mut input = b"id,name\n1,ok\n2,".to_vec();
        input.push(0xff);
        input.push(b'\n');

        let run = Importer::new(&mut sink, config)
            .unwrap()
            .import_delimited_from(input.as_slice(), 0, "bad.csv", "bad")
            .unwrap();

        assert_eq!(run.status, crate::staging::report::ImportStatus::Completed);
        assert_eq!(run.records_stored, 1);
        assert_eq!(run.records_failed, 1);
        assert!(run.is_balanced());
        assert!(
            run.error_message
                .as_deref()
                .is_some_and(|m| m.contains("import_failures"))
        );
        assert_eq!(sink.count("import_failures").unwrap(), 0);
    }

    #[test]
    fn test_self_closing_item_is_counted() {
        let mut sink = MemorySink::new();
        let xml = WXR.replace(
            "<item>\n    <title>First</title>",
            "<item/>\n  <item>\n    <title>First</title>",
        );
        let run = Importer::new(&mut sink, config())
            .unwrap()
            .import_wxr_from(xml.as_bytes(), 0, "inline.xml")
            .unwrap();

        assert_eq!(run.records_encountered, 4);
        assert!(run.is_balanced());
        assert_eq!(run.records_stored + run.records_failed, 4);
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let mut sink = MemorySink::new();
        let mut importer = Importer::new(&mut sink, config()).unwrap();
        let err = importer
            .import_delimited(Path::new("/nonexistent/data.csv"))
            .unwrap_err();
        assert!(matches!(err, IngestError::FileNotFound(_)));
    }
}
