use hdrhistogram::Histogram;
use std::collections::BTreeMap;

use crate::hydration::{Admission, RejectReason};

#[derive(Clone, Debug, Default)]
pub struct BarCounters {
    pub inserted: u64,
    pub replaced: u64,
    pub unrouted: u64,
    pub rejected: BTreeMap<RejectReason, u64>,
}

impl BarCounters {
    pub fn record(&mut self, admission: Admission) {
        match admission {
            Admission::Inserted => self.inserted += 1,
            Admission::Replaced => self.replaced += 1,
            Admission::Rejected(r) => *self.rejected.entry(r).or_default() += 1,
        }
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected.values().sum()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExecutionCounters {
    pub intents_submitted: u64,
    pub duplicate_submissions_skipped: u64,
    pub entries_blocked: u64,
    pub entry_fills: u64,
    pub exit_fills: u64,
    pub protective_failures: u64,
    pub incidents: u64,
}

#[derive(Clone, Debug)]
pub struct Histo {
    /// Store values in micro-units (e.g., ms, ticks*100) as integers.
    /// `None` only if the histogram could not be allocated; records are then dropped.
    inner: Option<Histogram<u64>>,
}

impl Default for Histo {
    fn default() -> Self {
        Self {
            inner: Histogram::new(3).ok(),
        }
    }
}

impl Histo {
    pub fn record(&mut self, v: u64) {
        if let Some(h) = self.inner.as_mut() {
            let _ = h.record(v.max(1));
        }
    }

    pub fn p50(&self) -> u64 {
        self.inner.as_ref().map_or(0, |h| h.value_at_quantile(0.50))
    }

    pub fn p95(&self) -> u64 {
        self.inner.as_ref().map_or(0, |h| h.value_at_quantile(0.95))
    }

    pub fn max(&self) -> u64 {
        self.inner.as_ref().map_or(0, |h| h.max())
    }

    pub fn count(&self) -> u64 {
        self.inner.as_ref().map_or(0, |h| h.len())
    }
}

#[derive(Clone, Debug, Default)]
pub struct EngineStats {
    pub bars: BarCounters,
    pub execution: ExecutionCounters,
    /// Adverse entry slippage in ticks*100 (fill worse than intended entry).
    pub adverse_entry_slippage_ticks: Histo,
    /// Favorable entry slippage in ticks*100.
    pub favorable_entry_slippage_ticks: Histo,
}

impl EngineStats {
    /// `signed_ticks > 0` means the fill was worse than the intended price.
    pub fn record_entry_slippage(&mut self, signed_ticks: f64) {
        if !signed_ticks.is_finite() {
            return;
        }
        let scaled = (signed_ticks.abs() * 100.0) as u64;
        if signed_ticks >= 0.0 {
            self.adverse_entry_slippage_ticks.record(scaled);
        } else {
            self.favorable_entry_slippage_ticks.record(scaled);
        }
    }

    /// Quick key/value summary for operators.
    pub fn snapshot_kv(&self) -> BTreeMap<String, String> {
        let mut kv = BTreeMap::new();
        kv.insert("bars.inserted".into(), self.bars.inserted.to_string());
        kv.insert("bars.replaced".into(), self.bars.replaced.to_string());
        kv.insert("bars.unrouted".into(), self.bars.unrouted.to_string());
        kv.insert("bars.rejected".into(), self.bars.rejected_total().to_string());
        for (reason, n) in &self.bars.rejected {
            kv.insert(format!("bars.rejected.{reason:?}"), n.to_string());
        }
        let e = &self.execution;
        kv.insert("intents.submitted".into(), e.intents_submitted.to_string());
        kv.insert(
            "intents.duplicate_skipped".into(),
            e.duplicate_submissions_skipped.to_string(),
        );
        kv.insert("intents.blocked".into(), e.entries_blocked.to_string());
        kv.insert("fills.entry".into(), e.entry_fills.to_string());
        kv.insert("fills.exit".into(), e.exit_fills.to_string());
        kv.insert("protective.failures".into(), e.protective_failures.to_string());
        kv.insert("incidents".into(), e.incidents.to_string());
        let adverse = &self.adverse_entry_slippage_ticks;
        if adverse.count() > 0 {
            kv.insert(
                "slippage.adverse_ticks.p50".into(),
                format!("{:.2}", adverse.p50() as f64 / 100.0),
            );
            kv.insert(
                "slippage.adverse_ticks.p95".into(),
                format!("{:.2}", adverse.p95() as f64 / 100.0),
            );
            kv.insert(
                "slippage.adverse_ticks.max".into(),
                format!("{:.2}", adverse.max() as f64 / 100.0),
            );
        }
        kv
    }
}
