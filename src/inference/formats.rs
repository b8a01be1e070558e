//! Classification of individual text values

use chrono::{NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::staging::sanitize::is_zero_date;

/// Shape of a single sampled value
///
/// Declaration order is classification order: the first class whose test
/// matches wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueClass {
    Integer,
    /// Plain or currency-formatted decimal, e.g. `19.99`, `$1,200.50`
    Decimal,
    /// Exponent or otherwise non-decimal numeric form
    Float,
    Boolean,
    Email,
    Url,
    /// JSON object or array
    Json,
    Phone,
    DateTime,
    Date,
    Text,
}

impl ValueClass {
    pub const ALL: [ValueClass; 11] = [
        ValueClass::Integer,
        ValueClass::Decimal,
        ValueClass::Float,
        ValueClass::Boolean,
        ValueClass::Email,
        ValueClass::Url,
        ValueClass::Json,
        ValueClass::Phone,
        ValueClass::DateTime,
        ValueClass::Date,
        ValueClass::Text,
    ];

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ValueClass::Integer | ValueClass::Decimal | ValueClass::Float
        )
    }
}

impl std::fmt::Display for ValueClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValueClass::Integer => "integer",
            ValueClass::Decimal => "decimal",
            ValueClass::Float => "float",
            ValueClass::Boolean => "boolean",
            ValueClass::Email => "email",
            ValueClass::Url => "url",
            ValueClass::Json => "json",
            ValueClass::Phone => "phone",
            ValueClass::DateTime => "datetime",
            ValueClass::Date => "date",
            ValueClass::Text => "text",
        };
        f.write_str(name)
    }
}

static INTEGER_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?\d+$").unwrap());

static DECIMAL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^-?[$€£¥]?\s?-?(\d{1,3}(,\d{3})+|\d+)(\.\d+)?$").unwrap()
});

static FLOAT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?$").unwrap());

static EMAIL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap());

static URL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(https?|ftp)://[^\s/$.?#].[^\s]*$").unwrap());

static PHONE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\d+\-() ]{7,15}$").unwrap());

static ISO_DATE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());

static DATETIME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(:\d{2}(\.\d+)?)?(Z|[+-]\d{2}:?\d{2})?|\d{1,2}/\d{1,2}/\d{4} \d{1,2}:\d{2}(:\d{2})?)$",
    )
    .unwrap()
});

static DATE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4}-\d{2}-\d{2}|\d{4}/\d{2}/\d{2}|\d{1,2}/\d{1,2}/\d{4})$").unwrap());

const TRUE_TOKENS: [&str; 6] = ["true", "yes", "y", "1", "on", "enabled"];
const FALSE_TOKENS: [&str; 6] = ["false", "no", "n", "0", "off", "disabled"];

const DATETIME_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

/// Token of the fixed boolean vocabulary
pub fn parse_boolean_token(value: &str) -> Option<bool> {
    let lower = value.trim().to_lowercase();
    if TRUE_TOKENS.contains(&lower.as_str()) {
        Some(true)
    } else if FALSE_TOKENS.contains(&lower.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Parse a date-time in any accepted shape; offsets are converted to UTC
pub fn parse_datetime(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_utc());
    }
    // Fractional seconds and offsets without a colon
    if let Ok(dt) = chrono::DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.naive_utc());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(dt);
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
}

/// Parse a date in any accepted shape
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
}

fn is_json_container(value: &str) -> bool {
    let starts = value.starts_with('{') || value.starts_with('[');
    starts
        && matches!(
            serde_json::from_str::<serde_json::Value>(value),
            Ok(serde_json::Value::Object(_) | serde_json::Value::Array(_))
        )
}

/// Classify one non-blank value
///
/// The zero sentinel date (`0000-00-00`, with or without a time) belongs to
/// the date classes so that it does not pull a date column towards text.
pub fn classify(value: &str) -> ValueClass {
    let value = value.trim();
    if value.is_empty() {
        return ValueClass::Text;
    }

    if INTEGER_REGEX.is_match(value) {
        return ValueClass::Integer;
    }
    if DECIMAL_REGEX.is_match(value) {
        return ValueClass::Decimal;
    }
    if FLOAT_REGEX.is_match(value) && value.parse::<f64>().is_ok() {
        return ValueClass::Float;
    }
    if parse_boolean_token(value).is_some() {
        return ValueClass::Boolean;
    }
    if EMAIL_REGEX.is_match(value) {
        return ValueClass::Email;
    }
    if URL_REGEX.is_match(value) {
        return ValueClass::Url;
    }
    if is_json_container(value) {
        return ValueClass::Json;
    }
    if PHONE_REGEX.is_match(value)
        && !ISO_DATE_REGEX.is_match(value)
        && value.chars().filter(|c| c.is_ascii_digit()).count() >= 7
    {
        return ValueClass::Phone;
    }
    if is_zero_date(value) {
        return if value.len() > 10 {
            ValueClass::DateTime
        } else {
            ValueClass::Date
        };
    }
    if DATETIME_REGEX.is_match(value) && parse_datetime(value).is_some() {
        return ValueClass::DateTime;
    }
    if DATE_REGEX.is_match(value) && parse_date(value).is_some() {
        return ValueClass::Date;
    }

    ValueClass::Text
}

/// Digits after the decimal point of a plain or currency-formatted number
pub fn fractional_digits(value: &str) -> usize {
    let value = value.trim();
    let mantissa = value.split(['e', 'E']).next().unwrap_or(value);
    mantissa
        .rsplit_once('.')
        .map(|(_, fraction)| fraction.chars().take_while(|c| c.is_ascii_digit()).count())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_classes() {
        assert_eq!(classify("42"), ValueClass::Integer);
        assert_eq!(classify("-7"), ValueClass::Integer);
        assert_eq!(classify("19.99"), ValueClass::Decimal);
        assert_eq!(classify("$1,200.50"), ValueClass::Decimal);
        assert_eq!(classify("€5"), ValueClass::Decimal);
        assert_eq!(classify("1,000"), ValueClass::Decimal);
        assert_eq!(classify("1.5e3"), ValueClass::Float);
        assert_eq!(classify(".5"), ValueClass::Float);
    }

    #[test]
    fn test_boolean_tokens() {
        assert_eq!(classify("yes"), ValueClass::Boolean);
        assert_eq!(classify("Disabled"), ValueClass::Boolean);
        // Digits are integers first
        assert_eq!(classify("1"), ValueClass::Integer);
        assert_eq!(parse_boolean_token("OFF"), Some(false));
        assert_eq!(parse_boolean_token("maybe"), None);
    }

    #[test]
    fn test_contact_classes() {
        assert_eq!(classify("ada@example.com"), ValueClass::Email);
        assert_eq!(classify("https://example.com/a?b=c"), ValueClass::Url);
        assert_eq!(classify("+1 555 010 9999"), ValueClass::Phone);
        assert_eq!(classify("(555) 010-9999"), ValueClass::Phone);
        assert_eq!(classify("555-0199"), ValueClass::Phone);
    }

    #[test]
    fn test_json_requires_container() {
        assert_eq!(classify(r#"{"a": 1}"#), ValueClass::Json);
        assert_eq!(classify("[1, 2]"), ValueClass::Json);
        assert_eq!(classify("{not json"), ValueClass::Text);
        assert_eq!(classify("null"), ValueClass::Text);
    }

    #[test]
    fn test_dates_are_not_phones() {
        assert_eq!(classify("2024-01-15"), ValueClass::Date);
        assert_eq!(classify("01/15/2024"), ValueClass::Date);
        assert_eq!(classify("2024-01-15 10:30:00"), ValueClass::DateTime);
        assert_eq!(classify("2024-01-15T10:30:00Z"), ValueClass::DateTime);
        assert_eq!(classify("2024-02-30"), ValueClass::Text);
    }

    #[test]
    fn test_zero_dates_stay_in_date_classes() {
        assert_eq!(classify("0000-00-00"), ValueClass::Date);
        assert_eq!(classify("0000-00-00 00:00:00"), ValueClass::DateTime);
    }

    #[test]
    fn test_fractional_digits() {
        assert_eq!(fractional_digits("19.99"), 2);
        assert_eq!(fractional_digits("$1,200.5"), 1);
        assert_eq!(fractional_digits("3.14159e2"), 5);
        assert_eq!(fractional_digits("12"), 0);
    }
}
