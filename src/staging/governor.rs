//! Memory governor
//!
//! Samples process memory on the hot path and steers the shared batch
//! threshold. Pressure is `used / ceiling`:
//!
//! | pressure      | action                                              |
//! |---------------|-----------------------------------------------------|
//! | > 0.9         | flush every buffer and release spare capacity       |
//! | > 0.8         | shrink threshold to 70%, then flush every buffer     |
//! | < 0.4         | grow threshold by 30% while below its starting value |
//! | otherwise     | nothing                                             |
//!
//! An unlimited ceiling disables the governor entirely.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, System};

use super::batch::BatchThreshold;
use super::config::MemoryLimit;

const CRITICAL: f64 = 0.9;
const HIGH: f64 = 0.8;
const LOW: f64 = 0.4;

/// Source of memory usage readings
pub trait MemoryGauge {
    /// Current memory usage in bytes
    fn used_bytes(&mut self) -> u64;
}

/// Resident memory of the current process, via sysinfo
pub struct ProcessMemoryGauge {
    system: System,
    pid: Option<Pid>,
}

impl ProcessMemoryGauge {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| tracing::warn!(error = e, "Cannot determine process id, memory reads as zero"))
            .ok();
        Self {
            system: System::new(),
            pid,
        }
    }
}

impl Default for ProcessMemoryGauge {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGauge for ProcessMemoryGauge {
    fn used_bytes(&mut self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        self.system
            .refresh_process_specifics(pid, ProcessRefreshKind::new().with_memory());
        self.system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}

/// Always reports the same usage
#[derive(Debug, Clone, Copy)]
pub struct FixedGauge(pub u64);

impl MemoryGauge for FixedGauge {
    fn used_bytes(&mut self) -> u64 {
        self.0
    }
}

/// Replays a fixed sequence of readings, then repeats the last one
#[derive(Debug, Clone, Default)]
pub struct ScriptedGauge {
    readings: VecDeque<u64>,
    last: u64,
}

impl ScriptedGauge {
    pub fn new(readings: impl IntoIterator<Item = u64>) -> Self {
        Self {
            readings: readings.into_iter().collect(),
            last: 0,
        }
    }

    /// Readings expressed as fractions of `ceiling`
    pub fn from_pressures(ceiling: u64, pressures: &[f64]) -> Self {
        Self::new(pressures.iter().map(|p| (p * ceiling as f64).round() as u64))
    }
}

impl MemoryGauge for ScriptedGauge {
    fn used_bytes(&mut self) -> u64 {
        if let Some(next) = self.readings.pop_front() {
            self.last = next;
        }
        self.last
    }
}

/// Classification of a pressure reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    Low,
    Normal,
    High,
    Critical,
}

impl PressureLevel {
    pub fn from_pressure(pressure: f64) -> Self {
        if pressure > CRITICAL {
            PressureLevel::Critical
        } else if pressure > HIGH {
            PressureLevel::High
        } else if pressure < LOW {
            PressureLevel::Low
        } else {
            PressureLevel::Normal
        }
    }
}

/// Memory state at one governor evaluation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySnapshot {
    pub used_bytes: u64,
    /// `None` when the limit is unlimited
    pub ceiling_bytes: Option<u64>,
    pub pressure: f64,
    pub batch_threshold: usize,
}

/// Outcome of one evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub snapshot: MemorySnapshot,
    pub level: PressureLevel,
    /// Every buffer must be flushed now
    pub flush_all: bool,
    pub threshold_before: usize,
}

/// Negative-feedback controller for batch sizing
pub struct MemoryGovernor<'a> {
    gauge: Box<dyn MemoryGauge + 'a>,
    ceiling: Option<u64>,
    check_interval: usize,
    since_check: usize,
    last: MemorySnapshot,
}

impl<'a> MemoryGovernor<'a> {
    pub fn new(limit: MemoryLimit, check_interval: usize, gauge: Box<dyn MemoryGauge + 'a>) -> Self {
        Self {
            gauge,
            ceiling: limit.bytes(),
            check_interval: check_interval.max(1),
            since_check: 0,
            last: MemorySnapshot {
                used_bytes: 0,
                ceiling_bytes: limit.bytes(),
                pressure: 0.0,
                batch_threshold: 0,
            },
        }
    }

    /// Swap the memory source
    pub fn set_gauge(&mut self, gauge: Box<dyn MemoryGauge + 'a>) {
        self.gauge = gauge;
    }

    /// Reconfigure for a new run
    pub fn reset(&mut self, limit: MemoryLimit, check_interval: usize) {
        self.ceiling = limit.bytes();
        self.check_interval = check_interval.max(1);
        self.since_check = 0;
        self.last = MemorySnapshot {
            used_bytes: 0,
            ceiling_bytes: self.ceiling,
            pressure: 0.0,
            batch_threshold: 0,
        };
    }

    pub fn is_enabled(&self) -> bool {
        self.ceiling.is_some()
    }

    /// Most recent reading, stamped with the given threshold
    pub fn snapshot(&self, threshold: &BatchThreshold) -> MemorySnapshot {
        MemorySnapshot {
            batch_threshold: threshold.current(),
            ..self.last
        }
    }

    /// Count one processed record; evaluates every `check_interval` records
    pub fn tick(&mut self, threshold: &mut BatchThreshold) -> Option<Evaluation> {
        if !self.is_enabled() {
            return None;
        }
        self.since_check += 1;
        if self.since_check < self.check_interval {
            return None;
        }
        self.since_check = 0;
        Some(self.evaluate(threshold))
    }

    /// Sample memory and adjust the threshold
    pub fn evaluate(&mut self, threshold: &mut BatchThreshold) -> Evaluation {
        let used_bytes = self.gauge.used_bytes();
        let pressure = match self.ceiling {
            Some(ceiling) if ceiling > 0 => used_bytes as f64 / ceiling as f64,
            _ => 0.0,
        };
        let level = if self.is_enabled() {
            PressureLevel::from_pressure(pressure)
        } else {
            PressureLevel::Normal
        };
        let before = threshold.current();

        let flush_all = match level {
            PressureLevel::Critical => true,
            PressureLevel::High => {
                threshold.shrink();
                true
            }
            PressureLevel::Low if threshold.is_below_ceiling() => {
                threshold.grow();
                false
            }
            _ => false,
        };

        if threshold.current() != before {
            tracing::debug!(
                pressure,
                from = before,
                to = threshold.current(),
                "Adjusted batch threshold"
            );
        }
        if flush_all {
            tracing::debug!(pressure, used_bytes, ?level, "Memory pressure, flushing all buffers");
        }

        self.last = MemorySnapshot {
            used_bytes,
            ceiling_bytes: self.ceiling,
            pressure,
            batch_threshold: threshold.current(),
        };

        Evaluation {
            snapshot: self.last,
            level,
            flush_all,
            threshold_before: before,
        }
    }
}
