//! Conversion of stored text into typed values

use thiserror::Error;

use super::formats::{parse_boolean_token, parse_date, parse_datetime};
use super::types::InferredType;
use crate::sink::Value;
use crate::staging::sanitize::{CANONICAL_DATETIME, is_zero_date, truncate};

const DATE_FORMAT: &str = "%Y-%m-%d";
const STRING_LENGTH: usize = 255;

/// A value that does not fit its column type; stored as null
#[derive(Error, Debug, Clone, PartialEq)]
#[error("cannot convert {value:?} to {target}: {reason}")]
pub struct CoercionError {
    pub value: String,
    pub target: &'static str,
    pub reason: String,
}

impl CoercionError {
    fn new(value: &str, target: InferredType, reason: impl Into<String>) -> Self {
        Self {
            value: value.to_string(),
            target: target.type_name(),
            reason: reason.into(),
        }
    }
}

fn numeric_text(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '-' | '.' | 'e' | 'E' | '+'))
        .collect()
}

/// Convert one stored value to the column's type
///
/// Null and empty input is null for every type; so is the zero sentinel date
/// in date columns.
pub fn coerce(raw: Option<&str>, target: InferredType) -> Result<Value, CoercionError> {
    let Some(raw) = raw.filter(|r| !r.is_empty()) else {
        return Ok(Value::Null);
    };

    match target {
        InferredType::Integer | InferredType::BigInteger => {
            let digits: String = raw
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '-')
                .collect();
            let n = digits
                .parse::<i64>()
                .map_err(|e| CoercionError::new(raw, target, e.to_string()))?;
            if target == InferredType::Integer && i32::try_from(n).is_err() {
                return Err(CoercionError::new(raw, target, "out of 32-bit range"));
            }
            Ok(Value::Integer(n))
        }
        InferredType::Decimal { precision, scale } => {
            let n = numeric_text(raw)
                .parse::<f64>()
                .map_err(|e| CoercionError::new(raw, target, e.to_string()))?;
            if !n.is_finite() {
                return Err(CoercionError::new(raw, target, "not a finite number"));
            }
            let rendered = format!("{:.*}", scale as usize, n);
            let integer_digits = rendered
                .trim_start_matches('-')
                .split('.')
                .next()
                .map(|d| d.trim_start_matches('0').len())
                .unwrap_or(0);
            if integer_digits > precision.saturating_sub(scale) as usize {
                return Err(CoercionError::new(
                    raw,
                    target,
                    format!("exceeds precision {precision}"),
                ));
            }
            Ok(Value::Decimal(rendered))
        }
        InferredType::Float => numeric_text(raw)
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|e| CoercionError::new(raw, target, e.to_string())),
        InferredType::Boolean => {
            if let Some(b) = parse_boolean_token(raw) {
                return Ok(Value::Boolean(b));
            }
            let lower = raw.trim().to_lowercase();
            match lower.as_str() {
                "t" => Ok(Value::Boolean(true)),
                "f" => Ok(Value::Boolean(false)),
                other => other
                    .parse::<f64>()
                    .map(|n| Value::Boolean(n != 0.0))
                    .map_err(|_| CoercionError::new(raw, target, "not a boolean")),
            }
        }
        InferredType::DateTime => {
            if is_zero_date(raw) {
                return Ok(Value::Null);
            }
            parse_datetime(raw)
                .or_else(|| parse_date(raw).and_then(|d| d.and_hms_opt(0, 0, 0)))
                .map(|dt| Value::Text(dt.format(CANONICAL_DATETIME).to_string()))
                .ok_or_else(|| CoercionError::new(raw, target, "unrecognised date-time"))
        }
        InferredType::Date => {
            if is_zero_date(raw) {
                return Ok(Value::Null);
            }
            parse_date(raw)
                .or_else(|| parse_datetime(raw).map(|dt| dt.date()))
                .map(|d| Value::Text(d.format(DATE_FORMAT).to_string()))
                .ok_or_else(|| CoercionError::new(raw, target, "unrecognised date"))
        }
        InferredType::Json => serde_json::from_str::<serde_json::Value>(raw)
            .map(|_| Value::Text(raw.to_string()))
            .map_err(|e| CoercionError::new(raw, target, e.to_string())),
        InferredType::String => Ok(Value::Text(truncate(raw, STRING_LENGTH))),
        InferredType::Text | InferredType::LongText => Ok(Value::Text(raw.to_string())),
    }
}
