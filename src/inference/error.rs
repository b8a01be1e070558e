//! Error types for type inference

use thiserror::Error;

use crate::sink::SinkError;

/// Errors that stop an inference run
///
/// Value coercion failures are not errors: the value is stored as null.
#[derive(Error, Debug)]
pub enum InferenceError {
    /// Source table does not exist
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Source table has no columns to type
    #[error("Table {0} has no columns")]
    NoColumns(String),

    /// Typed table or completion marker could not be created
    #[error("Cannot create typed table {table}: {source}")]
    Materialize {
        table: String,
        #[source]
        source: SinkError,
    },

    /// Storage error while reading statistics or rows
    #[error("Storage error: {0}")]
    Sink(#[from] SinkError),
}
