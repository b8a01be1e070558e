//! Inferred column types and the decision rule

use std::fmt;

use serde::{Deserialize, Serialize};

use super::config::InferenceConfig;
use super::formats::ValueClass;
use super::stats::ColumnStatistics;
use crate::sink::ColumnType;

const DECIMAL_PRECISION: u8 = 18;
const MIN_SCALE: usize = 2;
const MAX_SCALE: usize = 8;

const SHORT_STRING_MAX: usize = 255;
const SHORT_STRING_AVG: f64 = 50.0;
const TEXT_MAX: usize = 65_535;

/// Semantic type decided for a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum InferredType {
    Integer,
    /// Wide integer identifiers
    BigInteger,
    Decimal { precision: u8, scale: u8 },
    Float,
    Boolean,
    DateTime,
    Date,
    /// Short bounded string
    String,
    Text,
    LongText,
    Json,
}

impl InferredType {
    /// Get the type name
    pub fn type_name(&self) -> &'static str {
        match self {
            InferredType::Integer => "integer",
            InferredType::BigInteger => "bigInteger",
            InferredType::Decimal { .. } => "decimal",
            InferredType::Float => "float",
            InferredType::Boolean => "boolean",
            InferredType::DateTime => "datetime",
            InferredType::Date => "date",
            InferredType::String => "string",
            InferredType::Text => "text",
            InferredType::LongText => "longText",
            InferredType::Json => "json",
        }
    }

    /// Storage column type of the typed table
    pub fn column_type(&self) -> ColumnType {
        match self {
            InferredType::Integer => ColumnType::Integer,
            InferredType::BigInteger => ColumnType::BigInteger,
            InferredType::Decimal { precision, scale } => ColumnType::Decimal {
                precision: *precision,
                scale: *scale,
            },
            InferredType::Float => ColumnType::Float,
            InferredType::Boolean => ColumnType::Boolean,
            InferredType::DateTime => ColumnType::DateTime,
            InferredType::Date => ColumnType::Date,
            InferredType::String => ColumnType::String {
                length: SHORT_STRING_MAX,
            },
            InferredType::Text => ColumnType::Text,
            InferredType::LongText => ColumnType::LongText,
            InferredType::Json => ColumnType::Json,
        }
    }

    fn decimal(max_scale: usize) -> Self {
        InferredType::Decimal {
            precision: DECIMAL_PRECISION,
            scale: max_scale.clamp(MIN_SCALE, MAX_SCALE) as u8,
        }
    }
}

impl fmt::Display for InferredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferredType::Decimal { precision, scale } => write!(f, "decimal({precision},{scale})"),
            other => f.write_str(other.type_name()),
        }
    }
}

fn integer_type(stats: &ColumnStatistics, config: &InferenceConfig) -> InferredType {
    if stats.wide_integers || (stats.uniqueness() > config.unique_ratio && stats.min_len > 0) {
        InferredType::BigInteger
    } else {
        InferredType::Integer
    }
}

fn by_length(stats: &ColumnStatistics) -> InferredType {
    if stats.max_len <= SHORT_STRING_MAX && stats.avg_len <= SHORT_STRING_AVG {
        InferredType::String
    } else if stats.max_len > TEXT_MAX {
        InferredType::LongText
    } else if stats.max_len > SHORT_STRING_MAX {
        InferredType::Text
    } else {
        InferredType::String
    }
}

/// Decide a column's type from its statistics
///
/// 1. A class holding at least `dominant_ratio` of the sample decides the
///    type. Integer columns whose values are almost all distinct become
///    wide identifiers. Email, URL, phone and text fall through to the
///    length rule.
/// 2. Numeric classes together holding at least `numeric_ratio` pick the
///    most permissive numeric type present: decimal, then float, then integer.
///    Uniqueness plays no part here; only values outside 32 bits widen the
///    integer.
/// 3. Otherwise the length rule picks string, text or long text.
///
/// An empty sample is text.
pub fn decide(stats: &ColumnStatistics, config: &InferenceConfig) -> InferredType {
    if stats.sample_size == 0 {
        return InferredType::Text;
    }

    let dominant = ValueClass::ALL
        .iter()
        .copied()
        .find(|class| stats.ratio(*class) >= config.dominant_ratio);

    if let Some(class) = dominant {
        let decided = match class {
            ValueClass::Integer => Some(integer_type(stats, config)),
            ValueClass::Decimal => Some(InferredType::decimal(stats.max_scale)),
            ValueClass::Float => Some(InferredType::Float),
            ValueClass::Boolean => Some(InferredType::Boolean),
            ValueClass::DateTime => Some(InferredType::DateTime),
            ValueClass::Date => Some(InferredType::Date),
            ValueClass::Json => Some(InferredType::Json),
            ValueClass::Email | ValueClass::Url | ValueClass::Phone | ValueClass::Text => None,
        };
        if let Some(decided) = decided {
            return decided;
        }
    }

    if stats.numeric_ratio() >= config.numeric_ratio {
        return if stats.pattern_count(ValueClass::Decimal) > 0 {
            InferredType::decimal(stats.max_scale)
        } else if stats.pattern_count(ValueClass::Float) > 0 {
            InferredType::Float
        } else if stats.wide_integers {
            InferredType::BigInteger
        } else {
            InferredType::Integer
        };
    }

    by_length(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(sample: &[&str]) -> ColumnStatistics {
        let mut stats = ColumnStatistics {
            column: "c".into(),
            total: sample.len() as u64,
            distinct_count: 1,
            min_len: sample.iter().map(|s| s.len()).min().unwrap_or(0),
            max_len: sample.iter().map(|s| s.len()).max().unwrap_or(0),
            avg_len: sample.iter().map(|s| s.len()).sum::<usize>() as f64
                / sample.len().max(1) as f64,
            ..ColumnStatistics::default()
        };
        stats.classify_sample(sample);
        stats
    }

    #[test]
    fn test_dominant_integer() {
        let config = InferenceConfig::default();
        assert_eq!(decide(&stats(&["1", "2", "2", "3"]), &config), InferredType::Integer);
    }

    #[test]
    fn test_unique_integers_become_big_integer() {
        let config = InferenceConfig::default();
        let mut s = stats(&["1", "2", "3", "4"]);
        s.distinct_count = 4;
        assert_eq!(decide(&s, &config), InferredType::BigInteger);
    }

    #[test]
    fn test_wide_integers_become_big_integer() {
        let config = InferenceConfig::default();
        let mut s = stats(&["1", "2"]);
        s.wide_integers = true;
        assert_eq!(decide(&s, &config), InferredType::BigInteger);
    }

    #[test]
    fn test_numeric_majority_prefers_decimal() {
        let config = InferenceConfig::default();
        let s = stats(&["$1,200.50", "$3.10", "7", "n/a"]);
        assert_eq!(
            decide(&s, &config),
            InferredType::Decimal {
                precision: 18,
                scale: 2
            }
        );
    }

    #[test]
    fn test_numeric_majority_integers_stay_plain() {
        let config = InferenceConfig::default();
        let sample: Vec<String> = (0..80)
            .map(|i| i.to_string())
            .chain((0..20).map(|i| format!("n/a{i}")))
            .collect();
        let mut s = stats(&sample.iter().map(String::as_str).collect::<Vec<_>>());
        s.distinct_count = 100;
        assert_eq!(s.uniqueness(), 1.0);
        assert_eq!(decide(&s, &config), InferredType::Integer);

        s.wide_integers = true;
        assert_eq!(decide(&s, &config), InferredType::BigInteger);
    }

    #[test]
    fn test_numeric_majority_float_over_integer() {
        let config = InferenceConfig::default();
        let s = stats(&["1e3", "2", "3", "x"]);
        assert_eq!(decide(&s, &config), InferredType::Float);
    }

    #[test]
    fn test_scale_is_clamped() {
        let config = InferenceConfig::default();
        assert_eq!(
            decide(&stats(&["1.5", "2.5"]), &config),
            InferredType::Decimal {
                precision: 18,
                scale: 2
            }
        );
        assert_eq!(
            decide(&stats(&["1.1234567891", "2.5"]), &config),
            InferredType::Decimal {
                precision: 18,
                scale: 8
            }
        );
    }

    #[test]
    fn test_length_rule() {
        let config = InferenceConfig::default();
        let mut s = stats(&["alpha", "beta"]);
        assert_eq!(decide(&s, &config), InferredType::String);

        s.max_len = 300;
        s.avg_len = 120.0;
        assert_eq!(decide(&s, &config), InferredType::Text);

        s.max_len = 70_000;
        assert_eq!(decide(&s, &config), InferredType::LongText);

        s.max_len = 200;
        s.avg_len = 80.0;
        assert_eq!(decide(&s, &config), InferredType::String);
    }

    #[test]
    fn test_emails_resolve_by_length() {
        let config = InferenceConfig::default();
        let s = stats(&["a@example.com", "b@example.com"]);
        assert_eq!(decide(&s, &config), InferredType::String);
    }

    #[test]
    fn test_other_dominant_classes() {
        let config = InferenceConfig::default();
        assert_eq!(decide(&stats(&["yes", "no", "on"]), &config), InferredType::Boolean);
        assert_eq!(
            decide(&stats(&["2024-01-01", "0000-00-00"]), &config),
            InferredType::Date
        );
        assert_eq!(
            decide(&stats(&["2024-01-01 10:00:00"]), &config),
            InferredType::DateTime
        );
        assert_eq!(decide(&stats(&[r#"{"a":1}"#, "[]"]), &config), InferredType::Json);
    }

    #[test]
    fn test_empty_sample_is_text() {
        let config = InferenceConfig::default();
        assert_eq!(decide(&stats(&[]), &config), InferredType::Text);
    }

    #[test]
    fn test_order_independent() {
        let config = InferenceConfig::default();
        let forward = stats(&["1", "2.50", "$3", "x", "4"]);
        let backward = stats(&["4", "x", "$3", "2.50", "1"]);
        assert_eq!(decide(&forward, &config), decide(&backward, &config));
    }
}
