//! Configuration for type inference

use serde::{Deserialize, Serialize};

/// How sample values are chosen from a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum SamplingStrategy {
    /// The first N non-null values in storage order
    #[default]
    Head,
    /// A uniform sample over all non-null values, reproducible for a seed
    Reservoir { seed: u64 },
}

/// Configuration for type inference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InferenceConfig {
    /// Non-null values sampled per column
    pub sample_size: usize,

    /// Rows copied per insert while materializing
    pub copy_batch_size: usize,

    /// Share of the sample a single class needs to decide the type (0.0 - 1.0)
    pub dominant_ratio: f64,

    /// Share of numeric classes combined needed for a numeric type (0.0 - 1.0)
    pub numeric_ratio: f64,

    /// Distinct/non-null ratio above which integers become wide identifiers
    pub unique_ratio: f64,

    /// Suffix appended to the source table name
    pub typed_suffix: String,

    pub strategy: SamplingStrategy,

    /// Rebuild typed tables even when already complete
    pub force: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            sample_size: 200,
            copy_batch_size: 500,
            dominant_ratio: 0.90,
            numeric_ratio: 0.75,
            unique_ratio: 0.95,
            typed_suffix: "_typed".to_string(),
            strategy: SamplingStrategy::Head,
            force: false,
        }
    }
}

impl InferenceConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for custom configuration
    pub fn builder() -> InferenceConfigBuilder {
        InferenceConfigBuilder::default()
    }

    /// Name of the typed copy of `source`
    pub fn typed_table_name(&self, source: &str) -> String {
        format!("{source}{}", self.typed_suffix)
    }
}

/// Builder for InferenceConfig
#[derive(Debug, Default)]
pub struct InferenceConfigBuilder {
    config: InferenceConfig,
}

impl InferenceConfigBuilder {
    /// Set the per-column sample size (at least 1)
    pub fn sample_size(mut self, size: usize) -> Self {
        self.config.sample_size = size.max(1);
        self
    }

    /// Set the materialization batch size (at least 1)
    pub fn copy_batch_size(mut self, size: usize) -> Self {
        self.config.copy_batch_size = size.max(1);
        self
    }

    pub fn dominant_ratio(mut self, ratio: f64) -> Self {
        self.config.dominant_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn numeric_ratio(mut self, ratio: f64) -> Self {
        self.config.numeric_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn unique_ratio(mut self, ratio: f64) -> Self {
        self.config.unique_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn typed_suffix(mut self, suffix: &str) -> Self {
        self.config.typed_suffix = suffix.to_string();
        self
    }

    pub fn strategy(mut self, strategy: SamplingStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.config.force = force;
        self
    }

    /// Build the configuration
    pub fn build(self) -> InferenceConfig {
        self.config
    }
}
