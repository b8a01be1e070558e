//! Data Staging Core - constant-memory ingestion and type inference
//!
//! Provides:
//! - Streaming import of WXR and delimited exports into a storage sink
//! - Adaptive batch sizing under a process memory ceiling
//! - Statistical column type inference and typed table materialization
//! - In-memory and DuckDB storage sinks

pub mod inference;
pub mod sink;
pub mod staging;

pub use inference::{InferenceConfig, InferenceError, InferredType, TypeInferenceEngine};
#[cfg(feature = "duckdb-backend")]
pub use sink::DuckDbSink;
pub use sink::{ColumnDef, ColumnType, MemorySink, Record, SinkError, StorageSink, Value};
pub use staging::{FailedItem, ImportConfig, ImportRun, Importer, IngestError};
