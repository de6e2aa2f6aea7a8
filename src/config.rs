use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::instrument::InstrumentSpec;
use crate::time::DEFAULT_TIMEZONE;

/// How a bar that pierces both breakout levels is resolved.
///
/// OHLC alone cannot tell which side traded first, so this is an explicit
/// policy rather than an ordering accident.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TieBreakPolicy {
    #[default]
    LongWins,
    ShortWins,
    /// Neither side enters on an ambiguous bar; later bars may still break out.
    Skip,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fixed reference timezone; timetables must carry exactly this name.
    pub timezone: String,
    pub bar_period_secs: u64,
    /// Hard hydration timeout measured from range start.
    pub hydration_grace_secs: u64,
    /// Fraction of the theoretical bar count a range needs before it may lock.
    pub min_bar_fraction: f64,
    pub protective_max_attempts: u32,
    pub protective_backoff_ms: u64,
    pub flatten_max_attempts: u32,
    /// Fraction of target distance price must travel before the stop moves to break-even.
    pub break_even_fraction: f64,
    pub break_even_offset_ticks: u32,
    pub tie_break: TieBreakPolicy,
    pub tick_interval_ms: u64,
    pub journal_dir: PathBuf,
    pub instruments: Vec<InstrumentSpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timezone: DEFAULT_TIMEZONE.to_string(),
            bar_period_secs: 60,
            hydration_grace_secs: 60,
            min_bar_fraction: 0.85,
            protective_max_attempts: 3,
            protective_backoff_ms: 250,
            flatten_max_attempts: 3,
            break_even_fraction: 0.65,
            break_even_offset_ticks: 1,
            tie_break: TieBreakPolicy::LongWins,
            tick_interval_ms: 1_000,
            journal_dir: PathBuf::from("journal"),
            instruments: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn bar_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.bar_period_secs as i64)
    }

    pub fn hydration_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.hydration_grace_secs as i64)
    }

    pub fn protective_backoff(&self) -> Duration {
        Duration::from_millis(self.protective_backoff_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}
