//! Configuration types for staging imports

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;

/// Memory ceiling for an import, written as `<n>[K|M|G|T][B]` or `-1`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MemoryLimit {
    /// Ceiling in bytes
    Bytes(u64),
    /// No ceiling; the governor never reports pressure
    Unlimited,
}

impl MemoryLimit {
    /// Ceiling in bytes, `None` when unlimited
    pub fn bytes(&self) -> Option<u64> {
        match self {
            MemoryLimit::Bytes(b) => Some(*b),
            MemoryLimit::Unlimited => None,
        }
    }
}

impl Default for MemoryLimit {
    fn default() -> Self {
        MemoryLimit::Bytes(512 * 1024 * 1024)
    }
}

impl FromStr for MemoryLimit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed == "-1" || trimmed.eq_ignore_ascii_case("unlimited") {
            return Ok(MemoryLimit::Unlimited);
        }

        let upper = trimmed.to_ascii_uppercase();
        let without_b = upper
            .strip_suffix('B')
            .filter(|rest| rest.ends_with(|c: char| c.is_ascii_alphabetic()))
            .unwrap_or(&upper);
        let (digits, multiplier) = match without_b.chars().last() {
            Some('K') => (&without_b[..without_b.len() - 1], 1u64 << 10),
            Some('M') => (&without_b[..without_b.len() - 1], 1u64 << 20),
            Some('G') => (&without_b[..without_b.len() - 1], 1u64 << 30),
            Some('T') => (&without_b[..without_b.len() - 1], 1u64 << 40),
            _ => (without_b.strip_suffix('B').unwrap_or(without_b), 1),
        };

        let value: u64 = digits
            .trim()
            .parse()
            .map_err(|_| ConfigError::MemoryLimit(s.to_string()))?;
        if value == 0 {
            return Err(ConfigError::MemoryLimit(format!("{s} (must be positive)")));
        }
        value
            .checked_mul(multiplier)
            .map(MemoryLimit::Bytes)
            .ok_or_else(|| ConfigError::MemoryLimit(format!("{s} (overflow)")))
    }
}

impl TryFrom<String> for MemoryLimit {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MemoryLimit> for String {
    fn from(limit: MemoryLimit) -> Self {
        limit.to_string()
    }
}

impl fmt::Display for MemoryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryLimit::Unlimited => write!(f, "-1"),
            MemoryLimit::Bytes(b) => {
                for (suffix, shift) in [("T", 40), ("G", 30), ("M", 20), ("K", 10)] {
                    let unit = 1u64 << shift;
                    if *b >= unit && b % unit == 0 {
                        return write!(f, "{}{}", b / unit, suffix);
                    }
                }
                write!(f, "{}", b)
            }
        }
    }
}

/// Batch sizing for the accumulator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchConfig {
    /// Starting threshold, also the ceiling the governor grows back to
    pub initial_size: usize,
    /// Floor the governor never shrinks below
    pub minimum_size: usize,
    /// Evaluate memory pressure every N records
    pub check_interval: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            initial_size: 500,
            minimum_size: 10,
            check_interval: 1,
        }
    }
}

/// Memory budget shared by every destination table of an import
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MemoryConfig {
    pub limit: MemoryLimit,
}

/// Options for delimited text sources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DelimitedOptions {
    pub delimiter: char,
    pub quote: char,
    /// Escape character; `None` means quotes are escaped by doubling
    pub escape: Option<char>,
    /// First row holds column names
    pub has_header: bool,
    /// Read buffer size in bytes
    pub buffer_capacity: usize,
    /// Destination table; defaults to the normalised file stem
    pub table: Option<String>,
}

impl Default for DelimitedOptions {
    fn default() -> Self {
        Self {
            delimiter: ',',
            quote: '"',
            escape: None,
            has_header: true,
            buffer_capacity: 64 * 1024,
            table: None,
        }
    }
}

impl DelimitedOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, c) in [("delimiter", Some(self.delimiter)), ("quote", Some(self.quote)), ("escape", self.escape)] {
            if let Some(c) = c {
                if !c.is_ascii() {
                    return Err(ConfigError::Invalid(format!(
                        "{name} must be a single ASCII character, got {c:?}"
                    )));
                }
            }
        }
        if self.delimiter == self.quote {
            return Err(ConfigError::Invalid(
                "delimiter and quote must differ".to_string(),
            ));
        }
        if self.buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "buffer capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which WXR dependent collections are extracted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WxrOptions {
    pub postmeta: bool,
    pub comments: bool,
    pub terms: bool,
    pub authors: bool,
    /// Tags kept in post and comment content
    pub content_safelist: Vec<String>,
}

impl Default for WxrOptions {
    fn default() -> Self {
        Self {
            postmeta: true,
            comments: true,
            terms: true,
            authors: true,
            content_safelist: [
                "a",
                "b",
                "blockquote",
                "br",
                "code",
                "em",
                "h1",
                "h2",
                "h3",
                "h4",
                "h5",
                "h6",
                "i",
                "img",
                "li",
                "ol",
                "p",
                "pre",
                "strong",
                "ul",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Configuration for one import
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImportConfig {
    pub batch: BatchConfig,
    pub memory: MemoryConfig,
    pub delimited: DelimitedOptions,
    pub wxr: WxrOptions,
    /// Persist failed items into this table when the import finishes
    pub failed_items_table: Option<String>,
}

impl ImportConfig {
    /// Create a new builder for ImportConfig
    pub fn builder() -> ImportConfigBuilder {
        ImportConfigBuilder::default()
    }

    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ImportConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch.initial_size == 0 {
            return Err(ConfigError::Invalid(
                "batch initial size must be positive".to_string(),
            ));
        }
        if self.batch.minimum_size == 0 || self.batch.minimum_size > self.batch.initial_size {
            return Err(ConfigError::Invalid(format!(
                "batch minimum size {} must be between 1 and the initial size {}",
                self.batch.minimum_size, self.batch.initial_size
            )));
        }
        if self.batch.check_interval == 0 {
            return Err(ConfigError::Invalid(
                "memory check interval must be positive".to_string(),
            ));
        }
        self.delimited.validate()
    }
}

/// Builder for ImportConfig
#[derive(Debug, Default)]
pub struct ImportConfigBuilder {
    config: ImportConfig,
}

impl ImportConfigBuilder {
    /// Set the initial (and ceiling) batch size
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch.initial_size = size;
        self
    }

    /// Set the minimum batch size
    pub fn minimum_batch_size(mut self, size: usize) -> Self {
        self.config.batch.minimum_size = size;
        self
    }

    /// Evaluate memory pressure every N records
    pub fn check_interval(mut self, interval: usize) -> Self {
        self.config.batch.check_interval = interval;
        self
    }

    /// Set the memory ceiling
    pub fn memory_limit(mut self, limit: MemoryLimit) -> Self {
        self.config.memory.limit = limit;
        self
    }

    /// Set delimited text options
    pub fn delimited(mut self, options: DelimitedOptions) -> Self {
        self.config.delimited = options;
        self
    }

    /// Set WXR extraction options
    pub fn wxr(mut self, options: WxrOptions) -> Self {
        self.config.wxr = options;
        self
    }

    /// Persist failed items into a table
    pub fn failed_items_table(mut self, table: &str) -> Self {
        self.config.failed_items_table = Some(table.to_string());
        self
    }

    /// Build the ImportConfig
    pub fn build(self) -> Result<ImportConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_limit_parse() {
        assert_eq!(
            "128M".parse::<MemoryLimit>().unwrap(),
            MemoryLimit::Bytes(128 * 1024 * 1024)
        );
        assert_eq!(
            "2gb".parse::<MemoryLimit>().unwrap(),
            MemoryLimit::Bytes(2 * 1024 * 1024 * 1024)
        );
        assert_eq!(
            "1024K".parse::<MemoryLimit>().unwrap(),
            MemoryLimit::Bytes(1024 * 1024)
        );
        assert_eq!(
            "4096".parse::<MemoryLimit>().unwrap(),
            MemoryLimit::Bytes(4096)
        );
        assert_eq!(
            "-1".parse::<MemoryLimit>().unwrap(),
            MemoryLimit::Unlimited
        );
        assert!("lots".parse::<MemoryLimit>().is_err());
        assert!("0M".parse::<MemoryLimit>().is_err());
    }

    #[test]
    fn test_memory_limit_display() {
        assert_eq!(MemoryLimit::Bytes(256 * 1024 * 1024).to_string(), "256M");
        assert_eq!(MemoryLimit::Bytes(1500).to_string(), "1500");
        assert_eq!(MemoryLimit::Unlimited.to_string(), "-1");
    }

    #[test]
    fn test_builder_validates_sizes() {
        assert!(
            ImportConfig::builder()
                .batch_size(5)
                .minimum_batch_size(10)
                .build()
                .is_err()
        );

        let config = ImportConfig::builder()
            .batch_size(100)
            .minimum_batch_size(10)
            .memory_limit("64M".parse().unwrap())
            .build()
            .unwrap();
        assert_eq!(config.batch.initial_size, 100);
        assert_eq!(config.memory.limit.bytes(), Some(64 * 1024 * 1024));
    }

    #[test]
    fn test_from_toml() {
        let config = ImportConfig::from_toml_str(
            r#"
            failedItemsTable = "import_failures"

            [batch]
            initialSize = 200
            minimumSize = 20

            [memory]
            limit = "1G"

            [delimited]
            delimiter = ";"
            hasHeader = false

            [wxr]
            comments = false
            "#,
        )
        .unwrap();

        assert_eq!(config.batch.initial_size, 200);
        assert_eq!(config.batch.check_interval, 1);
        assert_eq!(config.memory.limit, MemoryLimit::Bytes(1 << 30));
        assert_eq!(config.delimited.delimiter, ';');
        assert!(!config.delimited.has_header);
        assert!(!config.wxr.comments);
        assert!(config.wxr.postmeta);
        assert_eq!(config.failed_items_table.as_deref(), Some("import_failures"));
    }

    #[test]
    fn test_non_ascii_delimiter_rejected() {
        let options = DelimitedOptions {
            delimiter: '§',
            ..DelimitedOptions::default()
        };
        assert!(ImportConfig::builder().delimited(options).build().is_err());
    }
}
