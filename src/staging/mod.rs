//! Streaming ingestion of export files into a storage sink
//!
//! Two source formats are supported:
//!
//! - **WXR** - WordPress eXtended RSS exports. Every `<item>` and
//!   `<wp:author>` is parsed as an isolated fragment and routed to `posts`,
//!   `users` and their dependent tables.
//! - **Delimited text** - CSV, TSV and friends, stored as text columns for
//!   later type inference.
//!
//! Records are buffered per table and written in batches. The memory governor
//! shrinks the batch threshold and forces flushes as process memory
//! approaches the configured ceiling.
//!
//! ## Example
//!
//! ```rust,ignore
//! use data_staging_core::sink::MemorySink;
//! use data_staging_core::staging::{ImportConfig, Importer};
//!
//! let mut sink = MemorySink::new();
//! let config = ImportConfig::builder().batch_size(1000).build()?;
//! let run = Importer::new(&mut sink, config)?.import_wxr(Path::new("export.xml"))?;
//! println!("{}", run.summary());
//! ```

pub mod batch;
pub mod config;
pub mod delimited;
pub mod error;
pub mod extract;
pub mod governor;
pub mod ingest;
pub mod progress;
pub mod report;
pub mod sanitize;
pub mod source;
pub mod wxr;

pub use batch::{BatchAccumulator, BatchThreshold, FlushReport};
pub use config::{
    BatchConfig, DelimitedOptions, ImportConfig, ImportConfigBuilder, MemoryConfig, MemoryLimit,
    WxrOptions,
};
pub use error::{ConfigError, IngestError, RecordError};
pub use governor::{
    FixedGauge, MemoryGauge, MemoryGovernor, MemorySnapshot, PressureLevel, ProcessMemoryGauge,
    ScriptedGauge,
};
pub use ingest::Importer;
#[cfg(feature = "progress")]
pub use progress::ConsoleProgress;
pub use progress::{ImportObserver, NoopObserver, ProgressCursor, ProgressUnit};
pub use report::{FailedItem, FailurePhase, ImportFormat, ImportRun, ImportStatus, TableStats};
