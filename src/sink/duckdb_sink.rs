//! DuckDB storage sink
//!
//! Embedded-database implementation of `StorageSink`. Every table the import
//! creates is an ordinary DuckDB table; statistics are computed with SQL
//! aggregates so inference never pulls a full column into memory.

use duckdb::types::Value as DuckValue;

use super::{ColumnDef, Predicate, Record, SinkError, StorageSink, TextRow, Value};

impl From<duckdb::Error> for SinkError {
    fn from(err: duckdb::Error) -> Self {
        SinkError::Backend(err.to_string())
    }
}

/// Storage sink backed by a DuckDB connection
pub struct DuckDbSink {
    conn: duckdb::Connection,
    path: Option<String>,
}

impl DuckDbSink {
    /// Open or create a database at the given path
    pub fn open(path: &str) -> Result<Self, SinkError> {
        let conn = duckdb::Connection::open(path)?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn memory() -> Result<Self, SinkError> {
        let conn = duckdb::Connection::open_in_memory()?;
        Ok(Self { conn, path: None })
    }

    /// Get the database path (if not in-memory)
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    fn require_table(&self, table: &str) -> Result<(), SinkError> {
        if self.table_exists(table)? {
            Ok(())
        } else {
            Err(SinkError::TableNotFound(table.to_string()))
        }
    }

    fn where_clause(predicate: &Predicate) -> (String, Vec<String>) {
        match predicate {
            Predicate::IsNullOrEmpty(column) => (
                format!(
                    "{col} IS NULL OR CAST({col} AS VARCHAR) = ''",
                    col = quote_ident(column)
                ),
                Vec::new(),
            ),
            Predicate::Equals(column, value) => (
                format!("CAST({} AS VARCHAR) = ?", quote_ident(column)),
                vec![value.clone()],
            ),
        }
    }

    fn non_blank(column: &str) -> String {
        format!(
            "{col} IS NOT NULL AND CAST({col} AS VARCHAR) <> ''",
            col = quote_ident(column)
        )
    }

    fn insert_rows(&self, table: &str, rows: &[Record]) -> Result<usize, SinkError> {
        for record in rows {
            let columns: Vec<String> = record.columns().map(quote_ident).collect();
            let placeholders = vec!["?"; columns.len()].join(", ");
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(table),
                columns.join(", "),
                placeholders
            );
            let params: Vec<DuckValue> = record.iter().map(|(_, v)| to_duck_value(v)).collect();
            let mut stmt = self.conn.prepare_cached(&sql)?;
            stmt.execute(duckdb::params_from_iter(params.iter()))?;
        }
        Ok(rows.len())
    }
}

impl StorageSink for DuckDbSink {
    fn table_exists(&self, table: &str) -> Result<bool, SinkError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = ?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn create_table(&mut self, table: &str, columns: &[ColumnDef]) -> Result<(), SinkError> {
        let defs: Vec<String> = columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.column_type.sql_type()))
            .collect();
        let ddl = format!("CREATE TABLE {} ({})", quote_ident(table), defs.join(", "));
        self.conn.execute_batch(&ddl)?;
        Ok(())
    }

    fn add_column(&mut self, table: &str, column: &ColumnDef) -> Result<(), SinkError> {
        let ddl = format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
            quote_ident(table),
            quote_ident(&column.name),
            column.column_type.sql_type()
        );
        self.conn.execute_batch(&ddl)?;
        Ok(())
    }

    fn insert_batch(&mut self, table: &str, rows: &[Record]) -> Result<usize, SinkError> {
        self.conn.execute_batch("BEGIN TRANSACTION")?;
        match self.insert_rows(table, rows) {
            Ok(inserted) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(inserted)
            }
            Err(e) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    tracing::warn!(table, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    fn columns(&self, table: &str) -> Result<Vec<String>, SinkError> {
        self.require_table(table)?;
        let mut stmt = self.conn.prepare(
            "SELECT column_name FROM information_schema.columns
             WHERE table_name = ?1 ORDER BY ordinal_position",
        )?;
        let rows = stmt.query_map([table], |row| row.get::<_, String>(0))?;
        let mut columns = Vec::new();
        for row in rows {
            columns.push(row?);
        }
        Ok(columns)
    }

    fn count(&self, table: &str) -> Result<u64, SinkError> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn count_where(&self, table: &str, predicate: &Predicate) -> Result<u64, SinkError> {
        let (clause, params) = Self::where_clause(predicate);
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", quote_ident(table), clause);
        let count: i64 = self.conn.query_row(
            &sql,
            duckdb::params_from_iter(params.iter()),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn count_distinct(&self, table: &str, column: &str) -> Result<u64, SinkError> {
        let sql = format!(
            "SELECT COUNT(DISTINCT {}) FROM {} WHERE {}",
            quote_ident(column),
            quote_ident(table),
            Self::non_blank(column)
        );
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn min(&self, table: &str, column: &str) -> Result<Option<String>, SinkError> {
        let sql = format!(
            "SELECT MIN(CAST({} AS VARCHAR)) FROM {} WHERE {}",
            quote_ident(column),
            quote_ident(table),
            Self::non_blank(column)
        );
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }

    fn max(&self, table: &str, column: &str) -> Result<Option<String>, SinkError> {
        let sql = format!(
            "SELECT MAX(CAST({} AS VARCHAR)) FROM {} WHERE {}",
            quote_ident(column),
            quote_ident(table),
            Self::non_blank(column)
        );
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }

    fn sample_non_null(
        &self,
        table: &str,
        column: &str,
        limit: usize,
    ) -> Result<Vec<String>, SinkError> {
        let sql = format!(
            "SELECT CAST({} AS VARCHAR) FROM {} WHERE {} ORDER BY rowid LIMIT ?1",
            quote_ident(column),
            quote_ident(table),
            Self::non_blank(column)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([limit as i64], |row| row.get::<_, String>(0))?;
        let mut samples = Vec::new();
        for row in rows {
            samples.push(row?);
        }
        Ok(samples)
    }

    fn fetch_rows(
        &self,
        table: &str,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<TextRow>, SinkError> {
        let columns = self.columns(table)?;
        let select: Vec<String> = columns
            .iter()
            .map(|c| format!("CAST({} AS VARCHAR)", quote_ident(c)))
            .collect();
        let sql = format!(
            "SELECT {} FROM {} ORDER BY rowid LIMIT ?1 OFFSET ?2",
            select.join(", "),
            quote_ident(table)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(duckdb::params![limit as i64, offset as i64])?;

        let mut page = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(row.get::<_, Option<String>>(i)?);
            }
            page.push(values);
        }
        Ok(page)
    }

    fn delete_where(&mut self, table: &str, predicate: &Predicate) -> Result<u64, SinkError> {
        let (clause, params) = Self::where_clause(predicate);
        let sql = format!("DELETE FROM {} WHERE {}", quote_ident(table), clause);
        let removed = self
            .conn
            .execute(&sql, duckdb::params_from_iter(params.iter()))?;
        Ok(removed as u64)
    }

    fn drop_table(&mut self, table: &str) -> Result<(), SinkError> {
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))?;
        Ok(())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn to_duck_value(value: &Value) -> DuckValue {
    match value {
        Value::Null => DuckValue::Null,
        Value::Boolean(b) => DuckValue::Boolean(*b),
        Value::Integer(n) => DuckValue::BigInt(*n),
        Value::Float(f) => DuckValue::Double(*f),
        Value::Decimal(s) | Value::Text(s) => DuckValue::Text(s.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ColumnType;

    #[test]
    fn test_create_insert_count() {
        let mut sink = DuckDbSink::memory().unwrap();
        assert!(!sink.table_exists("t").unwrap());

        sink.create_table(
            "t",
            &[
                ColumnDef::new("id", ColumnType::BigInteger),
                ColumnDef::new("name", ColumnType::Text),
            ],
        )
        .unwrap();
        assert!(sink.table_exists("t").unwrap());

        sink.insert_batch(
            "t",
            &[
                Record::new().with("id", 1i64).with("name", "a"),
                Record::new().with("id", 2i64).with("name", ""),
                Record::new().with("id", 3i64),
            ],
        )
        .unwrap();

        assert_eq!(sink.count("t").unwrap(), 3);
        assert_eq!(
            sink.count_where("t", &Predicate::IsNullOrEmpty("name".into()))
                .unwrap(),
            2
        );
        assert_eq!(sink.sample_non_null("t", "name", 10).unwrap(), vec!["a"]);
        assert_eq!(sink.columns("t").unwrap(), vec!["id", "name"]);
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
