//! In-process storage sink

use std::collections::{BTreeMap, HashSet};

use super::{ColumnDef, Predicate, Record, SinkError, StorageSink, TextRow, Value};

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    columns: Vec<ColumnDef>,
    rows: Vec<Vec<Value>>,
}

impl MemoryTable {
    fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == column)
    }

    fn matches(&self, row: &[Value], predicate: &Predicate) -> bool {
        match predicate {
            Predicate::IsNullOrEmpty(column) => self
                .position(column)
                .map(|i| row[i].is_blank())
                .unwrap_or(true),
            Predicate::Equals(column, expected) => self
                .position(column)
                .and_then(|i| row[i].as_text())
                .map(|text| text == expected.as_str())
                .unwrap_or(false),
        }
    }

    fn non_blank(&self, column: &str) -> Option<impl Iterator<Item = String> + '_> {
        let index = self.position(column)?;
        Some(
            self.rows
                .iter()
                .filter(move |row| !row[index].is_blank())
                .filter_map(move |row| row[index].as_text().map(|t| t.into_owned())),
        )
    }
}

/// Storage sink holding tables in memory
///
/// Enforces declared column types and string lengths on insert, and stores a
/// batch only when every row in it is valid.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: BTreeMap<String, MemoryTable>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored rows of a table, in column order
    pub fn rows(&self, table: &str) -> Option<&[Vec<Value>]> {
        self.tables.get(table).map(|t| t.rows.as_slice())
    }

    /// Declared columns of a table
    pub fn column_defs(&self, table: &str) -> Option<&[ColumnDef]> {
        self.tables.get(table).map(|t| t.columns.as_slice())
    }

    /// Values of one column, in insertion order
    pub fn column_values(&self, table: &str, column: &str) -> Option<Vec<Value>> {
        let table = self.tables.get(table)?;
        let index = table.position(column)?;
        Some(table.rows.iter().map(|row| row[index].clone()).collect())
    }

    /// Names of all tables
    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    fn table(&self, table: &str) -> Result<&MemoryTable, SinkError> {
        self.tables
            .get(table)
            .ok_or_else(|| SinkError::TableNotFound(table.to_string()))
    }

    fn table_mut(&mut self, table: &str) -> Result<&mut MemoryTable, SinkError> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| SinkError::TableNotFound(table.to_string()))
    }

    fn build_row(name: &str, table: &MemoryTable, record: &Record) -> Result<Vec<Value>, SinkError> {
        let mut row = vec![Value::Null; table.columns.len()];
        for (column, value) in record.iter() {
            let index = table
                .position(column)
                .ok_or_else(|| SinkError::UnknownColumn {
                    table: name.to_string(),
                    column: column.to_string(),
                })?;
            let def = &table.columns[index];
            if !def.column_type.accepts(value) {
                return Err(SinkError::TypeMismatch {
                    table: name.to_string(),
                    column: column.to_string(),
                    expected: def.column_type.sql_type(),
                    value: value.to_string(),
                });
            }
            if let (Some(max), Value::Text(text)) = (def.column_type.max_length(), value) {
                if text.chars().count() > max {
                    return Err(SinkError::ValueTooLong {
                        table: name.to_string(),
                        column: column.to_string(),
                        max,
                    });
                }
            }
            row[index] = value.clone();
        }
        Ok(row)
    }
}

impl StorageSink for MemorySink {
    fn table_exists(&self, table: &str) -> Result<bool, SinkError> {
        Ok(self.tables.contains_key(table))
    }

    fn create_table(&mut self, table: &str, columns: &[ColumnDef]) -> Result<(), SinkError> {
        if self.tables.contains_key(table) {
            return Err(SinkError::TableExists(table.to_string()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = columns.iter().find(|c| !seen.insert(c.name.as_str())) {
            return Err(SinkError::Backend(format!(
                "duplicate column {} in {}",
                dup.name, table
            )));
        }
        self.tables.insert(
            table.to_string(),
            MemoryTable {
                columns: columns.to_vec(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    fn add_column(&mut self, table: &str, column: &ColumnDef) -> Result<(), SinkError> {
        let t = self.table_mut(table)?;
        if t.position(&column.name).is_some() {
            return Ok(());
        }
        t.columns.push(column.clone());
        for row in &mut t.rows {
            row.push(Value::Null);
        }
        Ok(())
    }

    fn insert_batch(&mut self, table: &str, rows: &[Record]) -> Result<usize, SinkError> {
        let t = self.table(table)?;
        let built = rows
            .iter()
            .map(|record| Self::build_row(table, t, record))
            .collect::<Result<Vec<_>, _>>()?;
        let inserted = built.len();
        self.table_mut(table)?.rows.extend(built);
        Ok(inserted)
    }

    fn columns(&self, table: &str) -> Result<Vec<String>, SinkError> {
        Ok(self
            .table(table)?
            .columns
            .iter()
            .map(|c| c.name.clone())
            .collect())
    }

    fn count(&self, table: &str) -> Result<u64, SinkError> {
        Ok(self.table(table)?.rows.len() as u64)
    }

    fn count_where(&self, table: &str, predicate: &Predicate) -> Result<u64, SinkError> {
        let t = self.table(table)?;
        Ok(t.rows.iter().filter(|row| t.matches(row, predicate)).count() as u64)
    }

    fn count_distinct(&self, table: &str, column: &str) -> Result<u64, SinkError> {
        let t = self.table(table)?;
        let values = t.non_blank(column).ok_or_else(|| SinkError::UnknownColumn {
            table: table.to_string(),
            column: column.to_string(),
        })?;
        Ok(values.collect::<HashSet<_>>().len() as u64)
    }

    fn min(&self, table: &str, column: &str) -> Result<Option<String>, SinkError> {
        let t = self.table(table)?;
        Ok(t.non_blank(column).and_then(|values| values.min()))
    }

    fn max(&self, table: &str, column: &str) -> Result<Option<String>, SinkError> {
        let t = self.table(table)?;
        Ok(t.non_blank(column).and_then(|values| values.max()))
    }

    fn sample_non_null(
        &self,
        table: &str,
        column: &str,
        limit: usize,
    ) -> Result<Vec<String>, SinkError> {
        let t = self.table(table)?;
        let values = t.non_blank(column).ok_or_else(|| SinkError::UnknownColumn {
            table: table.to_string(),
            column: column.to_string(),
        })?;
        Ok(values.take(limit).collect())
    }

    fn fetch_rows(
        &self,
        table: &str,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<TextRow>, SinkError> {
        let t = self.table(table)?;
        Ok(t.rows
            .iter()
            .skip(offset as usize)
            .take(limit)
            .map(|row| {
                row.iter()
                    .map(|v| v.as_text().map(|t| t.into_owned()))
                    .collect()
            })
            .collect())
    }

    fn delete_where(&mut self, table: &str, predicate: &Predicate) -> Result<u64, SinkError> {
        let t = self.table_mut(table)?;
        let before = t.rows.len();
        let rows = std::mem::take(&mut t.rows);
        let kept: Vec<_> = rows
            .into_iter()
            .filter(|row| !t.matches(row, predicate))
            .collect();
        t.rows = kept;
        Ok((before - t.rows.len()) as u64)
    }

    fn drop_table(&mut self, table: &str) -> Result<(), SinkError> {
        self.tables.remove(table);
        Ok(())
    }
}
