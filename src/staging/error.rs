//! Error types for staging operations

use std::path::PathBuf;
use thiserror::Error;

use crate::sink::SinkError;

/// Fatal errors that stop an import before or outside the record stream
#[derive(Error, Debug)]
pub enum IngestError {
    /// File not found
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    /// Source exists but cannot be read
    #[error("Source not readable: {path} - {reason}")]
    SourceNotReadable { path: PathBuf, reason: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Destination schema could not be created or extended
    #[error("Cannot prepare destination table {table}: {source}")]
    Schema {
        table: String,
        #[source]
        source: SinkError,
    },

    /// Storage failure outside row insertion (e.g. failed item persistence)
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            IngestError::FileNotFound(path) => {
                format!(
                    "File not found: {}\n\nHint: Check that the file exists and the path is correct.",
                    path.display()
                )
            }
            IngestError::SourceNotReadable { path, reason } => {
                format!(
                    "Cannot read source: {}\nReason: {reason}\n\nHint: Check file permissions.",
                    path.display()
                )
            }
            IngestError::InvalidConfig(msg) => {
                format!("Invalid configuration: {msg}\n\nHint: Check your import configuration.")
            }
            IngestError::Schema { table, source } => {
                format!(
                    "Cannot prepare table {table}: {source}\n\n\
                    Hint: Check that the storage backend is writable."
                )
            }
            _ => self.to_string(),
        }
    }
}

/// Per-record failure, turned into a failed item by the importer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    /// Reading the next record from the source failed
    #[error("read error: {0}")]
    Read(String),

    /// The record text is not well-formed
    #[error("parse error: {0}")]
    Parse(String),

    /// The record is well-formed but fields could not be mapped
    #[error("extract error: {0}")]
    Extract(String),

    /// The storage sink rejected the row
    #[error("insert error in {table}: {message}")]
    Insert { table: String, message: String },
}

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid memory limit: {0}")]
    MemoryLimit(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for IngestError {
    fn from(err: ConfigError) -> Self {
        IngestError::InvalidConfig(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_has_hint() {
        let err = IngestError::FileNotFound(PathBuf::from("/tmp/missing.xml"));
        let msg = err.user_message();
        assert!(msg.contains("/tmp/missing.xml"));
        assert!(msg.contains("Hint"));
    }

    #[test]
    fn test_record_error_display() {
        let err = RecordError::Insert {
            table: "posts".to_string(),
            message: "too long".to_string(),
        };
        assert_eq!(err.to_string(), "insert error in posts: too long");
    }
}
