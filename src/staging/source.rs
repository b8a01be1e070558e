//! Buffered sequential access to a source file

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use super::error::IngestError;

/// A validated source file, opened lazily for sequential reads
#[derive(Debug, Clone)]
pub struct SourceFile {
    path: PathBuf,
    size: u64,
}

impl SourceFile {
    /// Check that the path names a readable regular file
    pub fn open(path: &Path) -> Result<Self, IngestError> {
        if !path.exists() {
            return Err(IngestError::FileNotFound(path.to_path_buf()));
        }

        let metadata = fs::metadata(path).map_err(|e| IngestError::SourceNotReadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !metadata.is_file() {
            return Err(IngestError::SourceNotReadable {
                path: path.to_path_buf(),
                reason: "not a regular file".to_string(),
            });
        }

        // Fail before parsing starts rather than on the first read
        File::open(path).map_err(|e| IngestError::SourceNotReadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File size in bytes at open time
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Open a fresh buffered reader positioned at the start of the file
    pub fn reader(&self, capacity: usize) -> Result<BufReader<File>, IngestError> {
        let file = File::open(&self.path).map_err(|e| IngestError::SourceNotReadable {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        Ok(BufReader::with_capacity(capacity.max(1), file))
    }

    /// Normalised file stem, used as the default destination table name
    pub fn table_name(&self) -> String {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let name = super::delimited::normalize_identifier(&stem);
        if name.is_empty() {
            "imported".to_string()
        } else {
            name
        }
    }
}

/// Extrapolate the total record count from bytes consumed so far
///
/// Never returns less than `processed`, so the cursor stays consistent.
pub fn estimate_total(processed: u64, bytes_consumed: u64, total_bytes: u64) -> u64 {
    if bytes_consumed == 0 || total_bytes == 0 {
        return processed;
    }
    if bytes_consumed >= total_bytes {
        return processed;
    }
    let estimate = (processed as u128 * total_bytes as u128 / bytes_consumed as u128) as u64;
    estimate.max(processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_fatal() {
        let err = SourceFile::open(Path::new("/nonexistent/export.xml")).unwrap_err();
        assert!(matches!(err, IngestError::FileNotFound(_)));
    }

    #[test]
    fn test_directory_is_not_readable() {
        let dir = TempDir::new().unwrap();
        let err = SourceFile::open(dir.path()).unwrap_err();
        assert!(matches!(err, IngestError::SourceNotReadable { .. }));
    }

    #[test]
    fn test_open_reports_size_and_table_name() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Sales Report 2024.csv");
        let mut file = File::create(&path).unwrap();
        write!(file, "id,amount\n1,2\n").unwrap();

        let source = SourceFile::open(&path).unwrap();
        assert_eq!(source.size(), 14);
        assert_eq!(source.table_name(), "sales_report_2024");
    }

    #[test]
    fn test_estimate_total() {
        assert_eq!(estimate_total(0, 0, 1000), 0);
        assert_eq!(estimate_total(10, 100, 1000), 100);
        assert_eq!(estimate_total(10, 1000, 1000), 10);
        assert_eq!(estimate_total(10, 999, 1000), 10);
    }
}
