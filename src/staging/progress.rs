//! Progress reporting for import operations
//!
//! Importers report to an [`ImportObserver`] supplied at construction. The
//! observer is advisory only: nothing it does changes control flow.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::governor::MemorySnapshot;

/// What a progress count is counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressUnit {
    Fragments,
    Rows,
}

impl fmt::Display for ProgressUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressUnit::Fragments => write!(f, "fragments"),
            ProgressUnit::Rows => write!(f, "rows"),
        }
    }
}

/// Position of an import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressCursor {
    pub processed: u64,
    /// Never less than `processed`
    pub estimated_total: u64,
    pub unit: ProgressUnit,
}

impl ProgressCursor {
    /// Completion ratio in `[0, 1]`
    pub fn fraction(&self) -> f64 {
        if self.estimated_total == 0 {
            return 1.0;
        }
        (self.processed as f64 / self.estimated_total as f64).min(1.0)
    }
}

/// Receives progress and memory telemetry during an import
pub trait ImportObserver {
    fn on_progress(&mut self, _cursor: &ProgressCursor) {}

    /// Called on every memory governor evaluation
    fn on_memory(&mut self, _snapshot: &MemorySnapshot) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ImportObserver for NoopObserver {}

impl<T: ImportObserver + ?Sized> ImportObserver for &mut T {
    fn on_progress(&mut self, cursor: &ProgressCursor) {
        (**self).on_progress(cursor);
    }

    fn on_memory(&mut self, snapshot: &MemorySnapshot) {
        (**self).on_memory(snapshot);
    }
}

/// Decides when a progress report is due
///
/// Reports every 10 units or every 1% of the estimated total, whichever is
/// coarser.
#[derive(Debug, Default, Clone)]
pub struct ProgressThrottle {
    last_reported: u64,
}

impl ProgressThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interval(estimated_total: u64) -> u64 {
        (estimated_total / 100).max(10)
    }

    /// True when `processed` has advanced a full interval since the last report
    pub fn should_report(&mut self, processed: u64, estimated_total: u64) -> bool {
        if processed >= self.last_reported + Self::interval(estimated_total) {
            self.last_reported = processed;
            true
        } else {
            false
        }
    }

    /// The closing report is always due unless this exact count was reported
    pub fn finish(&mut self, processed: u64) -> bool {
        let due = processed == 0 || processed != self.last_reported;
        self.last_reported = processed;
        due
    }
}

/// Terminal progress bar observer
#[cfg(feature = "progress")]
pub struct ConsoleProgress {
    records_bar: indicatif::ProgressBar,
    memory_bar: indicatif::ProgressBar,
    _multi: indicatif::MultiProgress,
}

#[cfg(feature = "progress")]
impl ConsoleProgress {
    pub fn new() -> Self {
        use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
        use std::time::Duration;

        let multi = MultiProgress::new();

        let records_bar = multi.add(ProgressBar::new(0));
        records_bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg} ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░  "),
        );
        records_bar.enable_steady_tick(Duration::from_millis(100));

        let memory_bar = multi.add(ProgressBar::new_spinner());
        memory_bar.set_style(
            ProgressStyle::with_template("{spinner:.magenta} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        memory_bar.set_message("Memory: -");

        Self {
            records_bar,
            memory_bar,
            _multi: multi,
        }
    }

    /// Finish with success message
    pub fn finish_success(&self, msg: &str) {
        self.records_bar.finish_with_message(format!("✓ {}", msg));
        self.memory_bar.finish_and_clear();
    }

    /// Finish with error message
    pub fn finish_error(&self, msg: &str) {
        self.records_bar.abandon_with_message(format!("✗ {}", msg));
        self.memory_bar.finish_and_clear();
    }
}

#[cfg(feature = "progress")]
impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "progress")]
impl ImportObserver for ConsoleProgress {
    fn on_progress(&mut self, cursor: &ProgressCursor) {
        self.records_bar.set_length(cursor.estimated_total);
        self.records_bar.set_position(cursor.processed);
        self.records_bar.set_message(cursor.unit.to_string());
    }

    fn on_memory(&mut self, snapshot: &MemorySnapshot) {
        let ceiling = snapshot
            .ceiling_bytes
            .map(format_bytes)
            .unwrap_or_else(|| "unlimited".to_string());
        self.memory_bar.set_message(format!(
            "Memory: {} / {} (batch {})",
            format_bytes(snapshot.used_bytes),
            ceiling,
            format_number(snapshot.batch_threshold as u64)
        ));
    }
}

/// Format a number with thousand separators
pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    grouped
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_small_totals_use_ten() {
        let mut throttle = ProgressThrottle::new();
        let reported: Vec<u64> = (1..=35)
            .filter(|n| throttle.should_report(*n, 35))
            .collect();
        assert_eq!(reported, vec![10, 20, 30]);
        assert!(throttle.finish(35));
        assert!(!throttle.finish(35));
    }

    #[test]
    fn test_throttle_large_totals_use_one_percent() {
        let mut throttle = ProgressThrottle::new();
        let count = (1..=10_000)
            .filter(|n| throttle.should_report(*n, 10_000))
            .count();
        assert_eq!(count, 100);
    }

    #[test]
    fn test_cursor_fraction() {
        let cursor = ProgressCursor {
            processed: 25,
            estimated_total: 100,
            unit: ProgressUnit::Rows,
        };
        assert_eq!(cursor.fraction(), 0.25);
        assert_eq!(ProgressUnit::Fragments.to_string(), "fragments");
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(100), "100");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1000000), "1,000,000");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }
}
