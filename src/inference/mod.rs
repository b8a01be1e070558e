//! Statistical type inference for staged text tables
//!
//! Staged tables store every value as text. This module samples each column,
//! classifies the sampled values and decides a precise type, then
//! materializes a typed copy of the table.
//!
//! ## Decision
//!
//! - A value class holding 90% of the sample decides the type
//! - Otherwise 75% numeric values choose decimal, float or integer
//! - Otherwise the value lengths choose string, text or long text
//!
//! ## Example
//!
//! ```rust,ignore
//! use data_staging_core::inference::{InferenceConfig, TypeInferenceEngine};
//!
//! let mut engine = TypeInferenceEngine::new(&mut sink, InferenceConfig::default());
//! let report = engine.run("orders")?;
//! println!("{:?}", report.column_type("amount"));
//! ```

mod coerce;
mod config;
mod engine;
mod error;
mod formats;
mod stats;
mod types;

pub use coerce::{CoercionError, coerce};
pub use config::{InferenceConfig, InferenceConfigBuilder, SamplingStrategy};
pub use engine::{ColumnAssignment, ColumnProfile, MARKER_TABLE, TypeInferenceEngine, TypedTableReport};
pub use error::InferenceError;
pub use formats::{ValueClass, classify};
pub use stats::{ColumnStatistics, gather_statistics};
pub use types::{InferredType, decide};
