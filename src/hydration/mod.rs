//! Per-stream bar storage with source precedence, plus pre-hydration status.
//!
//! The buffer holds at most one bar per open timestamp: the one from the
//! highest-precedence source seen so far. Admission is bookkeeping; a rejected
//! bar is counted and dropped, never surfaced as an error.

pub mod source;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::types::Bar;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    /// Bar opens after `now`.
    Future,
    /// Bar has opened but not yet closed.
    Partial,
    /// Bar belongs to a different trading date.
    WrongDate,
    /// A same-timestamp bar from a higher-precedence source is already held.
    LowerPrecedenceDuplicate,
    /// Non-finite or inverted OHLC.
    Malformed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Admission {
    Inserted,
    Replaced,
    Rejected(RejectReason),
}

impl Admission {
    pub fn accepted(self) -> bool {
        !matches!(self, Admission::Rejected(_))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AdmissionPolicy {
    pub trading_date: NaiveDate,
    pub bar_period: chrono::Duration,
    pub tz: Tz,
}

/// Mutex-guarded because historical loads deliver from a background task while
/// live bars and ticks arrive on the engine thread.
pub struct BarBuffer {
    policy: AdmissionPolicy,
    bars: Mutex<BTreeMap<DateTime<Utc>, Bar>>,
}

impl BarBuffer {
    pub fn new(policy: AdmissionPolicy) -> Self {
        Self {
            policy,
            bars: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn admit(&self, bar: Bar, now: DateTime<Utc>) -> Admission {
        let verdict = self.classify(&bar, now);
        if let Err(reason) = verdict {
            return Admission::Rejected(reason);
        }
        let mut bars = self.bars.lock();
        match bars.get(&bar.open_timestamp_utc) {
            None => {
                bars.insert(bar.open_timestamp_utc, bar);
                Admission::Inserted
            }
            Some(existing) if bar.source >= existing.source => {
                bars.insert(bar.open_timestamp_utc, bar);
                Admission::Replaced
            }
            Some(_) => Admission::Rejected(RejectReason::LowerPrecedenceDuplicate),
        }
    }

    fn classify(&self, bar: &Bar, now: DateTime<Utc>) -> Result<(), RejectReason> {
        let ohlc = [bar.open, bar.high, bar.low, bar.close];
        if ohlc.iter().any(|v| !v.is_finite()) || bar.high < bar.low {
            return Err(RejectReason::Malformed);
        }
        if bar.open_timestamp_utc > now {
            return Err(RejectReason::Future);
        }
        if bar.open_timestamp_utc + self.policy.bar_period > now {
            return Err(RejectReason::Partial);
        }
        let local_date = bar.open_timestamp_utc.with_timezone(&self.policy.tz).date_naive();
        if local_date != self.policy.trading_date {
            return Err(RejectReason::WrongDate);
        }
        Ok(())
    }

    /// Bars with `from <= open < to`, oldest first.
    pub fn window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Bar> {
        if from >= to {
            return Vec::new();
        }
        self.bars
            .lock()
            .range(from..to)
            .map(|(_, b)| b.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bars.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HydrationOutcome {
    Pending,
    Completed,
    /// The historical request finished with an error; live bars still flow.
    Failed,
}

/// Completion flag shared with the background hydration task.
#[derive(Debug)]
pub struct HydrationStatus(AtomicU8);

impl HydrationStatus {
    pub fn pending() -> Self {
        Self(AtomicU8::new(0))
    }

    pub fn completed() -> Self {
        Self(AtomicU8::new(1))
    }

    pub fn mark_completed(&self) {
        self.0.store(1, Ordering::Release);
    }

    pub fn mark_failed(&self) {
        self.0.store(2, Ordering::Release);
    }

    pub fn outcome(&self) -> HydrationOutcome {
        match self.0.load(Ordering::Acquire) {
            0 => HydrationOutcome::Pending,
            1 => HydrationOutcome::Completed,
            _ => HydrationOutcome::Failed,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.outcome() != HydrationOutcome::Pending
    }
}
