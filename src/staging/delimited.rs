//! Delimited text reader
//!
//! Wraps a `csv` reader that owns the buffering and quote handling. Header
//! names are normalised into identifiers and every row is aligned to the
//! header width: short rows are padded with nulls and long rows truncated.

use std::cell::RefCell;
use std::collections::HashSet;
use std::io::{self, Read};
use std::rc::Rc;

use csv::{ByteRecord, ReaderBuilder};

use super::config::DelimitedOptions;
use super::error::RecordError;
use crate::sink::{Record, Value};

/// Lowercase identifier with runs of other characters collapsed to `_`
pub fn normalize_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_separator = false;
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            pending_separator = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert_str(0, "c_");
    }
    out
}

/// Normalise a header row into unique column names
pub fn normalize_headers<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
    let mut used = HashSet::new();
    raw.iter()
        .enumerate()
        .map(|(i, header)| {
            let mut name = normalize_identifier(header.as_ref());
            if name.is_empty() {
                name = format!("column_{}", i + 1);
            }
            if used.contains(&name) {
                let base = name.clone();
                let mut suffix = 2;
                while used.contains(&name) {
                    name = format!("{base}_{suffix}");
                    suffix += 1;
                }
            }
            used.insert(name.clone());
            name
        })
        .collect()
}

/// Positional names for headerless input
pub fn positional_headers(width: usize) -> Vec<String> {
    (1..=width).map(|i| format!("column_{i}")).collect()
}

/// A data row aligned to the header width
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// One-based data row number, header excluded
    pub number: u64,
    /// Source text of the row, for failed items
    pub raw: String,
    /// Field values; `None` where the row was padded
    pub values: Vec<Option<String>>,
}

impl Row {
    /// Pair values with column names
    pub fn to_record(&self, headers: &[String]) -> Record {
        let mut record = Record::with_capacity(headers.len());
        for (name, value) in headers.iter().zip(&self.values) {
            record.set(name.as_str(), Value::from(value.clone()));
        }
        record
    }
}

/// Pad with nulls or truncate to `width`
pub fn align(mut values: Vec<Option<String>>, width: usize) -> Vec<Option<String>> {
    values.resize(width, None);
    values
}

/// Source bytes read ahead of the parser, starting at `offset`
#[derive(Debug, Default)]
struct Tape {
    bytes: Vec<u8>,
    offset: u64,
}

impl Tape {
    /// Source text between two byte positions, without line terminators
    fn text(&self, start: u64, end: u64) -> String {
        let len = self.bytes.len();
        let from = (start.saturating_sub(self.offset) as usize).min(len);
        let to = (end.saturating_sub(self.offset) as usize).clamp(from, len);
        let slice = &self.bytes[from..to];
        let trimmed = match slice.iter().position(|b| !matches!(b, b'\r' | b'\n')) {
            Some(first) => {
                let last = slice
                    .iter()
                    .rposition(|b| !matches!(b, b'\r' | b'\n'))
                    .unwrap_or(first);
                &slice[first..=last]
            }
            None => &[][..],
        };
        String::from_utf8_lossy(trimmed).into_owned()
    }

    /// Forget everything before `position`
    fn release(&mut self, position: u64) {
        let n = (position.saturating_sub(self.offset) as usize).min(self.bytes.len());
        self.bytes.drain(..n);
        self.offset += n as u64;
    }
}

/// Read adapter that keeps a copy of the bytes handed to the parser
struct TapeReader<R> {
    inner: R,
    tape: Rc<RefCell<Tape>>,
}

impl<R: Read> Read for TapeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.tape.borrow_mut().bytes.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

/// Streaming reader over delimited text
///
/// The bytes of every row are kept until the row has been read, so a row
/// that fails carries its source text exactly as it appeared (invalid UTF-8
/// sequences are replaced with U+FFFD).
pub struct DelimitedReader<R: Read> {
    reader: csv::Reader<TapeReader<R>>,
    tape: Rc<RefCell<Tape>>,
    headers: Vec<String>,
    pending: Option<(ByteRecord, String)>,
    record: ByteRecord,
    rows_read: u64,
    last_error_at: Option<u64>,
    finished: bool,
}

impl<R: Read> DelimitedReader<R> {
    /// Build the reader and consume the header row (or peek the first row
    /// for its width when there is no header)
    pub fn new(inner: R, options: &DelimitedOptions) -> Result<Self, csv::Error> {
        let tape = Rc::new(RefCell::new(Tape::default()));
        let mut reader = ReaderBuilder::new()
            .delimiter(options.delimiter as u8)
            .quote(options.quote as u8)
            .escape(options.escape.map(|c| c as u8))
            .double_quote(options.escape.is_none())
            .has_headers(false)
            .flexible(true)
            .buffer_capacity(options.buffer_capacity)
            .from_reader(TapeReader {
                inner,
                tape: Rc::clone(&tape),
            });

        let mut first = ByteRecord::new();
        let has_first = reader.read_byte_record(&mut first)?;
        let end = reader.position().byte();
        let first_raw = tape.borrow().text(0, end);
        tape.borrow_mut().release(end);

        let (headers, pending) = match (has_first, options.has_header) {
            (false, _) => (Vec::new(), None),
            (true, true) => {
                let raw: Vec<String> = first
                    .iter()
                    .map(|f| String::from_utf8_lossy(f).into_owned())
                    .collect();
                (normalize_headers(&raw), None)
            }
            (true, false) => (positional_headers(first.len()), Some((first, first_raw))),
        };

        Ok(Self {
            reader,
            tape,
            headers,
            pending,
            record: ByteRecord::new(),
            rows_read: 0,
            last_error_at: None,
            finished: false,
        })
    }

    /// Normalised column names
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Bytes of the source consumed so far
    pub fn bytes_consumed(&self) -> u64 {
        self.reader.position().byte()
    }

    /// Source text of the row that ended at `end`
    fn take_raw(&self, start: u64, end: u64) -> String {
        let raw = self.tape.borrow().text(start, end);
        self.tape.borrow_mut().release(end);
        raw
    }

    fn decode(&self, record: &ByteRecord, raw: String) -> Result<Row, (RecordError, String)> {
        let number = self.rows_read;

        let mut values = Vec::with_capacity(record.len());
        for (i, field) in record.iter().enumerate() {
            match std::str::from_utf8(field) {
                Ok(text) => values.push(Some(text.to_string())),
                Err(e) => {
                    let error = RecordError::Read(format!(
                        "row {number}, field {}: invalid UTF-8 ({e})",
                        i + 1
                    ));
                    return Err((error, raw));
                }
            }
        }

        if values.len() > self.headers.len() {
            tracing::debug!(
                row = number,
                fields = values.len(),
                columns = self.headers.len(),
                "Truncating row to header width"
            );
        }

        Ok(Row {
            number,
            raw,
            values: align(values, self.headers.len()),
        })
    }

    /// Read the next row
    ///
    /// The second element of an error is the source text of the row, so it
    /// can be kept as a failed item.
    pub fn next_row(&mut self) -> Option<Result<Row, (RecordError, String)>> {
        if let Some((first, raw)) = self.pending.take() {
            self.rows_read += 1;
            return Some(self.decode(&first, raw));
        }

        while !self.finished {
            let mut record = std::mem::take(&mut self.record);
            let start = self.bytes_consumed();
            let result = self.reader.read_byte_record(&mut record);
            let end = self.bytes_consumed();
            let outcome = match result {
                Ok(false) => {
                    self.finished = true;
                    None
                }
                Ok(true) => {
                    self.rows_read += 1;
                    let raw = self.take_raw(start, end);
                    Some(self.decode(&record, raw))
                }
                Err(e) => {
                    if self.last_error_at == Some(end) {
                        tracing::warn!(error = %e, "Reader made no progress, stopping");
                        self.finished = true;
                    }
                    self.last_error_at = Some(end);
                    self.rows_read += 1;
                    let raw = self.take_raw(start, end);
                    Some(Err((RecordError::Read(e.to_string()), raw)))
                }
            };
            self.record = record;
            if outcome.is_some() {
                return outcome;
            }
        }
        None
    }
}

impl<R: Read> Iterator for DelimitedReader<R> {
    type Item = Result<Row, (RecordError, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(input: &str, options: &DelimitedOptions) -> (Vec<String>, Vec<Row>) {
        let mut reader = DelimitedReader::new(input.as_bytes(), options).unwrap();
        let headers = reader.headers().to_vec();
        let rows = reader.by_ref().map(|r| r.unwrap()).collect();
        (headers, rows)
    }

    #[test]
    fn test_normalize_identifier() {
        assert_eq!(normalize_identifier("Order ID"), "order_id");
        assert_eq!(normalize_identifier("  Amount ($) "), "amount");
        assert_eq!(normalize_identifier("2024 total"), "c_2024_total");
        assert_eq!(normalize_identifier("first_name"), "first_name");
        assert_eq!(normalize_identifier("---"), "");
    }

    #[test]
    fn test_normalize_headers_dedups_and_fills() {
        let headers = normalize_headers(&["Name", "name", "", "NAME"]);
        assert_eq!(headers, vec!["name", "name_2", "column_3", "name_3"]);
    }

    #[test]
    fn test_rows_are_aligned_to_header() {
        let input = "id,amount,note\n1,19.99\n2,5,x,extra\n";
        let (headers, rows) = rows(input, &DelimitedOptions::default());

        assert_eq!(headers, vec!["id", "amount", "note"]);
        assert_eq!(
            rows[0].values,
            vec![Some("1".into()), Some("19.99".into()), None]
        );
        assert_eq!(
            rows[1].values,
            vec![Some("2".into()), Some("5".into()), Some("x".into())]
        );
        assert_eq!(rows[1].raw, "2,5,x,extra");
    }

    #[test]
    fn test_quoted_fields() {
        let input = "id,amount\n2,\"$1,200.50\"\n3,\"say \"\"hi\"\"\"\n";
        let (_, rows) = rows(input, &DelimitedOptions::default());
        assert_eq!(rows[0].values[1].as_deref(), Some("$1,200.50"));
        assert_eq!(rows[1].values[1].as_deref(), Some("say \"hi\""));
    }

    #[test]
    fn test_escape_and_delimiter_options() {
        let options = DelimitedOptions {
            delimiter: ';',
            escape: Some('\\'),
            has_header: false,
            ..DelimitedOptions::default()
        };
        let input = "a;\"b\\\"c\"\nd;e\n";
        let (headers, rows) = rows(input, &options);

        assert_eq!(headers, vec!["column_1", "column_2"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].number, 1);
        assert_eq!(rows[0].values[1].as_deref(), Some("b\"c"));
        assert_eq!(rows[1].values[0].as_deref(), Some("d"));
    }

    #[test]
    fn test_invalid_utf8_fails_only_that_row() {
        let mut input = b"id,name\n1,ok\n2,".to_vec();
        input.extend_from_slice(&[0xff, 0xfe]);
        input.extend_from_slice(b"\n3,fine\n");

        let reader = DelimitedReader::new(input.as_slice(), &DelimitedOptions::default()).unwrap();
        let results: Vec<_> = reader.collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        let (err, raw) = results[1].as_ref().unwrap_err();
        assert!(matches!(err, RecordError::Read(_)));
        assert_eq!(raw, "2,\u{FFFD}\u{FFFD}");
        assert!(results[2].is_ok());
    }

    #[test]
    fn test_failed_row_keeps_source_text() {
        let mut input = b"id,label,code\n1,\"a,b\",".to_vec();
        input.push(0xff);
        input.extend_from_slice(b"\r\n2,\"say \"\"hi\"\"\",x\n");

        let options = DelimitedOptions {
            buffer_capacity: 4,
            ..DelimitedOptions::default()
        };
        let reader = DelimitedReader::new(input.as_slice(), &options).unwrap();
        let results: Vec<_> = reader.collect();
        assert_eq!(results.len(), 2);

        let (_, raw) = results[0].as_ref().unwrap_err();
        assert_eq!(raw, "1,\"a,b\",\u{FFFD}");

        let row = results[1].as_ref().unwrap();
        assert_eq!(row.raw, "2,\"say \"\"hi\"\"\",x");
        assert_eq!(row.values[1].as_deref(), Some("say \"hi\""));
    }

    #[test]
    fn test_headerless_first_row_keeps_source_text() {
        let options = DelimitedOptions {
            has_header: false,
            ..DelimitedOptions::default()
        };
        let (_, rows) = rows("\"x\",1\ny,2\n", &options);
        assert_eq!(rows[0].raw, "\"x\",1");
        assert_eq!(rows[1].raw, "y,2");
    }

    #[test]
    fn test_to_record() {
        let row = Row {
            number: 1,
            raw: "1".into(),
            values: vec![Some("1".into()), None],
        };
        let record = row.to_record(&["id".to_string(), "amount".to_string()]);
        assert_eq!(record.get("id"), Some(&Value::Text("1".into())));
        assert_eq!(record.get("amount"), Some(&Value::Null));
    }

    #[test]
    fn test_empty_input() {
        let (headers, rows) = rows("", &DelimitedOptions::default());
        assert!(headers.is_empty());
        assert!(rows.is_empty());
    }
}
