//! Field sanitization for extracted text
//!
//! Markup is reduced to a safelist of tags, emails and URLs that fail
//! validation become null, and source dates are rewritten to the canonical
//! `YYYY-MM-DD HH:MM:SS` form. The zero sentinel date `0000-00-00` always maps
//! to null.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Canonical date-time rendering written to staging tables
pub const CANONICAL_DATETIME: &str = "%Y-%m-%d %H:%M:%S";

static SCRIPT_STYLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>").unwrap()
});

static COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());

static TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<(/?)([a-zA-Z][a-zA-Z0-9]*)\b([^>]*)>").unwrap());

static EVENT_HANDLER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\s+on[a-z]+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).unwrap());

static SCRIPT_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\s+[a-z-]+\s*=\s*("\s*javascript:[^"]*"|'\s*javascript:[^']*'|javascript:[^\s>]*)"#)
        .unwrap()
});

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9._%+\-]+@[a-z0-9\-]+(\.[a-z0-9\-]+)*\.[a-z]{2,}$").unwrap());

static URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(https?|ftp)://[^\s/$.?#][^\s]*$").unwrap());

/// Remove markup except tags named in `safelist`
///
/// Script and style blocks are dropped together with their content. Kept tags
/// lose event-handler attributes and `javascript:` URLs.
pub fn strip_markup<S: AsRef<str>>(input: &str, safelist: &[S]) -> String {
    if !input.contains('<') {
        return input.trim().to_string();
    }

    let without_scripts = SCRIPT_STYLE.replace_all(input, "");
    let without_comments = COMMENT.replace_all(&without_scripts, "");
    let stripped = TAG.replace_all(&without_comments, |caps: &Captures| {
        let name = caps[2].to_ascii_lowercase();
        if !safelist.iter().any(|s| s.as_ref().eq_ignore_ascii_case(&name)) {
            return String::new();
        }
        if &caps[1] == "/" {
            return format!("</{name}>");
        }
        let attrs = EVENT_HANDLER.replace_all(&caps[3], "");
        let attrs = SCRIPT_URL.replace_all(&attrs, "");
        format!("<{name}{attrs}>")
    });

    stripped.trim().to_string()
}

/// Strip every tag, for plain-text fields such as titles and names
pub fn plain_text(input: &str) -> String {
    strip_markup::<&str>(input, &[])
}

/// Truncate to at most `max_chars` characters without splitting a character
pub fn truncate(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((byte_index, _)) => value[..byte_index].to_string(),
        None => value.to_string(),
    }
}

/// Plain text, trimmed and truncated; empty becomes `None`
pub fn short_text(input: &str, max_chars: usize) -> Option<String> {
    let text = truncate(&plain_text(input), max_chars);
    if text.is_empty() { None } else { Some(text) }
}

/// Lowercased email address, or `None` when it does not look like one
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    if email.chars().count() <= 100 && EMAIL.is_match(&email) {
        Some(email)
    } else {
        None
    }
}

/// Trimmed http(s)/ftp URL, or `None`
pub fn normalize_url(raw: &str) -> Option<String> {
    let url = raw.trim();
    if URL.is_match(url) {
        Some(url.to_string())
    } else {
        None
    }
}

/// True for the zero sentinel date in either date or date-time form
pub fn is_zero_date(raw: &str) -> bool {
    raw.trim().starts_with("0000-00-00")
}

/// Rewrite a source date to canonical form
///
/// Accepts `YYYY-MM-DD HH:MM:SS`, RFC 2822 (`pubDate`), RFC 3339 and bare
/// `YYYY-MM-DD`. Offsets are converted to UTC.
pub fn normalize_date(raw: &str) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() || is_zero_date(value) {
        return None;
    }

    if let Ok(dt) = NaiveDateTime::parse_from_str(value, CANONICAL_DATETIME) {
        return Some(dt.format(CANONICAL_DATETIME).to_string());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.naive_utc().format(CANONICAL_DATETIME).to_string());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_utc().format(CANONICAL_DATETIME).to_string());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.format(CANONICAL_DATETIME).to_string());
    }

    tracing::debug!(value, "Unparseable date dropped");
    None
}
