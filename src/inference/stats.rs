//! Column statistics gathered through sink primitives

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::config::{InferenceConfig, SamplingStrategy};
use super::formats::{ValueClass, classify, fractional_digits};
use crate::sink::{Predicate, SinkError, StorageSink};

/// Statistics of one text column
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnStatistics {
    pub column: String,
    pub total: u64,
    /// Null and empty values
    pub null_count: u64,
    pub distinct_count: u64,
    /// Lexical minimum
    pub min: Option<String>,
    /// Lexical maximum
    pub max: Option<String>,
    /// Character lengths over every non-null value
    pub min_len: usize,
    pub max_len: usize,
    pub avg_len: f64,
    pub sample_size: usize,
    pub pattern_counts: BTreeMap<ValueClass, usize>,
    /// Largest number of fractional digits among sampled decimal and float values
    pub max_scale: usize,
    /// Some integer-shaped value in the column does not fit 32 bits
    pub wide_integers: bool,
}

impl ColumnStatistics {
    pub fn non_null(&self) -> u64 {
        self.total.saturating_sub(self.null_count)
    }

    /// Number of sampled values of a class
    pub fn pattern_count(&self, class: ValueClass) -> usize {
        self.pattern_counts.get(&class).copied().unwrap_or(0)
    }

    /// Share of the sample in a class
    pub fn ratio(&self, class: ValueClass) -> f64 {
        if self.sample_size == 0 {
            return 0.0;
        }
        self.pattern_count(class) as f64 / self.sample_size as f64
    }

    /// Share of the sample in any numeric class
    pub fn numeric_ratio(&self) -> f64 {
        if self.sample_size == 0 {
            return 0.0;
        }
        let numeric: usize = ValueClass::ALL
            .iter()
            .filter(|c| c.is_numeric())
            .map(|c| self.pattern_count(*c))
            .sum();
        numeric as f64 / self.sample_size as f64
    }

    /// Distinct values per non-null value
    pub fn uniqueness(&self) -> f64 {
        match self.non_null() {
            0 => 0.0,
            n => self.distinct_count as f64 / n as f64,
        }
    }

    /// Fold a sample into the class counts
    pub fn classify_sample<S: AsRef<str>>(&mut self, sample: &[S]) {
        self.sample_size = sample.len();
        self.pattern_counts.clear();
        self.max_scale = 0;
        for value in sample {
            let value = value.as_ref();
            let class = classify(value);
            if matches!(class, ValueClass::Decimal | ValueClass::Float) {
                self.max_scale = self.max_scale.max(fractional_digits(value));
            }
            *self.pattern_counts.entry(class).or_insert(0) += 1;
        }
    }
}

#[derive(Debug, Default)]
struct LengthTracker {
    count: u64,
    min: usize,
    max: usize,
    sum: u64,
    wide_integers: bool,
}

impl LengthTracker {
    fn observe(&mut self, value: &str) {
        let len = value.chars().count();
        self.min = if self.count == 0 { len } else { self.min.min(len) };
        self.max = self.max.max(len);
        self.sum += len as u64;
        self.count += 1;
        if !self.wide_integers {
            let trimmed = value.trim();
            let digits = trimmed.strip_prefix('-').unwrap_or(trimmed);
            let integer_shaped = !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit());
            self.wide_integers = integer_shaped && trimmed.parse::<i32>().is_err();
        }
    }

    fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }
}

/// Uniform sample of fixed capacity over a stream (Algorithm R)
struct Reservoir {
    capacity: usize,
    seen: u64,
    items: Vec<String>,
    rng: StdRng,
}

impl Reservoir {
    fn new(capacity: usize, seed: u64) -> Self {
        Self {
            capacity,
            seen: 0,
            items: Vec::with_capacity(capacity),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn offer(&mut self, value: &str) {
        self.seen += 1;
        if self.items.len() < self.capacity {
            self.items.push(value.to_string());
            return;
        }
        let slot = self.rng.gen_range(0..self.seen);
        if slot < self.capacity as u64 {
            self.items[slot as usize] = value.to_string();
        }
    }
}

/// Gather statistics for every column of a table
///
/// Counts come from the sink's aggregate primitives. Lengths come from one
/// paged scan over the table, which also feeds the reservoirs when the
/// strategy samples randomly.
pub fn gather_statistics<S: StorageSink + ?Sized>(
    sink: &S,
    table: &str,
    config: &InferenceConfig,
) -> Result<Vec<ColumnStatistics>, SinkError> {
    let columns = sink.columns(table)?;
    let total = sink.count(table)?;

    let mut lengths: Vec<LengthTracker> = columns.iter().map(|_| LengthTracker::default()).collect();
    let mut reservoirs: Option<Vec<Reservoir>> = match config.strategy {
        SamplingStrategy::Head => None,
        SamplingStrategy::Reservoir { seed } => Some(
            (0..columns.len())
                .map(|i| Reservoir::new(config.sample_size, seed.wrapping_add(i as u64)))
                .collect(),
        ),
    };

    let page = config.copy_batch_size.max(1);
    let mut offset = 0u64;
    loop {
        let rows = sink.fetch_rows(table, offset, page)?;
        if rows.is_empty() {
            break;
        }
        offset += rows.len() as u64;
        for row in &rows {
            for (i, cell) in row.iter().enumerate().take(columns.len()) {
                let Some(value) = cell.as_deref().filter(|v| !v.is_empty()) else {
                    continue;
                };
                lengths[i].observe(value);
                if let Some(reservoirs) = reservoirs.as_mut() {
                    reservoirs[i].offer(value);
                }
            }
        }
        if rows.len() < page {
            break;
        }
    }

    let mut statistics = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let sample = match reservoirs.as_mut() {
            Some(reservoirs) => std::mem::take(&mut reservoirs[i].items),
            None => sink.sample_non_null(table, column, config.sample_size)?,
        };

        let mut stats = ColumnStatistics {
            column: column.clone(),
            total,
            null_count: sink.count_where(table, &Predicate::IsNullOrEmpty(column.clone()))?,
            distinct_count: sink.count_distinct(table, column)?,
            min: sink.min(table, column)?,
            max: sink.max(table, column)?,
            min_len: lengths[i].min,
            max_len: lengths[i].max,
            avg_len: lengths[i].average(),
            wide_integers: lengths[i].wide_integers,
            ..ColumnStatistics::default()
        };
        stats.classify_sample(&sample);
        statistics.push(stats);
    }
    Ok(statistics)
}
