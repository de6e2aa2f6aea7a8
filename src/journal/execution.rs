//! Per-intent execution ledger.
//!
//! Fields only move from unset to set, or accumulate. Fills are accounted as
//! deltas (this fill only); weighted-average prices are derived from running
//! quantity and notional. Realized P&L is frozen exactly once, when cumulative
//! exit quantity reaches cumulative entry quantity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AccountingError;
use crate::intent::Intent;
use crate::types::{Direction, IntentId, OrderLeg};

const QTY_EPSILON: f64 = 1e-9;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LegFills {
    pub quantity: f64,
    pub notional: f64,
    pub first_fill_at: Option<DateTime<Utc>>,
    pub last_fill_at: Option<DateTime<Utc>>,
}

impl LegFills {
    pub fn average_price(&self) -> Option<f64> {
        if self.quantity <= 0.0 {
            return None;
        }
        Some(self.notional / self.quantity)
    }

    fn accumulate(&mut self, price: f64, qty: f64, ts: DateTime<Utc>) {
        self.quantity += qty;
        self.notional += price * qty;
        if self.first_fill_at.is_none() {
            self.first_fill_at = Some(ts);
        }
        self.last_fill_at = Some(ts);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RealizedPnl {
    /// Signed points per contract: (exit avg - entry avg) in the trade direction.
    pub points: f64,
    pub gross: f64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionJournalEntry {
    pub intent_id: IntentId,
    pub intent: Intent,
    pub quantity: f64,
    pub entry_submitted: bool,
    pub entry_submitted_at: Option<DateTime<Utc>>,
    pub entry_rejected: Option<String>,
    pub entry: LegFills,
    /// Frozen on first entry fill.
    pub direction: Option<Direction>,
    /// Frozen on first entry fill.
    pub contract_multiplier: Option<f64>,
    pub exit: LegFills,
    /// Leg of the first exit fill.
    pub exit_kind: Option<OrderLeg>,
    pub protective_submitted: bool,
    pub break_even_modified: bool,
    pub realized: Option<RealizedPnl>,
}

/// What a fill did to the ledger.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FillEffect {
    EntryAccumulated { cumulative: f64 },
    ExitAccumulated { cumulative: f64, remaining: f64 },
    Completed(RealizedPnl),
}

impl ExecutionJournalEntry {
    pub fn new(intent: Intent, quantity: f64) -> Self {
        Self {
            intent_id: intent.id(),
            intent,
            quantity,
            entry_submitted: false,
            entry_submitted_at: None,
            entry_rejected: None,
            entry: LegFills::default(),
            direction: None,
            contract_multiplier: None,
            exit: LegFills::default(),
            exit_kind: None,
            protective_submitted: false,
            break_even_modified: false,
            realized: None,
        }
    }

    pub fn mark_submitted(&mut self, ts: DateTime<Utc>) {
        if !self.entry_submitted {
            self.entry_submitted = true;
            self.entry_submitted_at = Some(ts);
        }
    }

    pub fn mark_rejected(&mut self, reason: impl Into<String>) {
        if self.entry_rejected.is_none() {
            self.entry_rejected = Some(reason.into());
        }
    }

    pub fn has_entry_fill(&self) -> bool {
        self.entry.quantity > 0.0
    }

    pub fn is_complete(&self) -> bool {
        self.realized.is_some()
    }

    /// Entry quantity not yet closed out by exits.
    pub fn open_quantity(&self) -> f64 {
        (self.entry.quantity - self.exit.quantity).max(0.0)
    }

    pub fn record_entry_fill(
        &mut self,
        price: f64,
        qty: f64,
        contract_multiplier: f64,
        ts: DateTime<Utc>,
    ) -> Result<FillEffect, AccountingError> {
        if !(qty.is_finite() && qty > 0.0) {
            return Err(AccountingError::InvalidQuantity(qty));
        }
        if self.direction.is_none() {
            self.direction = Some(self.intent.direction);
        }
        if self.contract_multiplier.is_none() {
            self.contract_multiplier = Some(contract_multiplier);
        }
        self.entry.accumulate(price, qty, ts);
        Ok(FillEffect::EntryAccumulated {
            cumulative: self.entry.quantity,
        })
    }

    /// Exits beyond the entry quantity are refused, never capped.
    pub fn record_exit_fill(
        &mut self,
        leg: OrderLeg,
        price: f64,
        qty: f64,
        ts: DateTime<Utc>,
    ) -> Result<FillEffect, AccountingError> {
        if !(qty.is_finite() && qty > 0.0) {
            return Err(AccountingError::InvalidQuantity(qty));
        }
        if !self.has_entry_fill() {
            return Err(AccountingError::ExitBeforeEntry);
        }
        let exit_qty = self.exit.quantity + qty;
        if exit_qty > self.entry.quantity + QTY_EPSILON {
            return Err(AccountingError::Overfill {
                entry_qty: self.entry.quantity,
                exit_qty,
            });
        }
        if self.exit_kind.is_none() {
            self.exit_kind = Some(leg);
        }
        self.exit.accumulate(price, qty, ts);

        let remaining = self.entry.quantity - self.exit.quantity;
        if remaining.abs() <= QTY_EPSILON && self.realized.is_none() {
            let pnl = self.compute_realized(ts);
            self.realized = Some(pnl);
            return Ok(FillEffect::Completed(pnl));
        }
        Ok(FillEffect::ExitAccumulated {
            cumulative: self.exit.quantity,
            remaining,
        })
    }

    fn compute_realized(&self, ts: DateTime<Utc>) -> RealizedPnl {
        let sign = self.direction.unwrap_or(self.intent.direction).sign();
        let entry_avg = self.entry.average_price().unwrap_or(0.0);
        let exit_avg = self.exit.average_price().unwrap_or(0.0);
        let points = sign * (exit_avg - entry_avg);
        let multiplier = self.contract_multiplier.unwrap_or(1.0);
        RealizedPnl {
            points,
            gross: points * self.entry.quantity * multiplier,
            completed_at: ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::fixtures::long_intent;
    use chrono::TimeZone;

    fn ts(m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 1, 14, m, 0).unwrap()
    }

    #[test]
    fn two_lot_long_realizes_weighted_points() {
        let mut e = ExecutionJournalEntry::new(long_intent(), 2.0);
        e.record_entry_fill(100.0, 1.0, 50.0, ts(1)).unwrap();
        e.record_entry_fill(102.0, 1.0, 50.0, ts(2)).unwrap();
        assert_eq!(e.entry.average_price(), Some(101.0));

        let partial = e.record_exit_fill(OrderLeg::Target, 110.0, 1.0, ts(3)).unwrap();
        assert!(matches!(partial, FillEffect::ExitAccumulated { remaining, .. } if remaining == 1.0));
        assert!(e.realized.is_none());

        let done = e.record_exit_fill(OrderLeg::Target, 112.0, 1.0, ts(4)).unwrap();
        let FillEffect::Completed(pnl) = done else {
            panic!("expected completion, got {done:?}");
        };
        assert_eq!(pnl.points, 10.0);
        assert_eq!(pnl.gross, 10.0 * 2.0 * 50.0);
        assert_eq!(pnl.completed_at, ts(4));
    }

    #[test]
    fn short_pnl_is_sign_adjusted() {
        let mut intent = long_intent();
        intent.direction = Direction::Short;
        let mut e = ExecutionJournalEntry::new(intent, 1.0);
        e.record_entry_fill(100.0, 1.0, 5.0, ts(1)).unwrap();
        let FillEffect::Completed(pnl) = e.record_exit_fill(OrderLeg::Stop, 104.0, 1.0, ts(2)).unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(pnl.points, -4.0);
        assert_eq!(pnl.gross, -20.0);
    }

    #[test]
    fn overfill_is_refused_not_capped() {
        let mut e = ExecutionJournalEntry::new(long_intent(), 1.0);
        e.record_entry_fill(100.0, 1.0, 50.0, ts(1)).unwrap();
        let err = e.record_exit_fill(OrderLeg::Stop, 95.0, 2.0, ts(2)).unwrap_err();
        assert_eq!(err, AccountingError::Overfill { entry_qty: 1.0, exit_qty: 2.0 });
        assert_eq!(e.exit.quantity, 0.0);
        assert!(e.realized.is_none());
    }

    #[test]
    fn exit_before_entry_and_bad_quantities_fail() {
        let mut e = ExecutionJournalEntry::new(long_intent(), 1.0);
        assert_eq!(
            e.record_exit_fill(OrderLeg::Stop, 95.0, 1.0, ts(1)).unwrap_err(),
            AccountingError::ExitBeforeEntry
        );
        assert!(e.record_entry_fill(100.0, 0.0, 50.0, ts(1)).is_err());
        assert!(e.record_entry_fill(100.0, f64::NAN, 50.0, ts(1)).is_err());
    }

    #[test]
    fn multiplier_and_submission_are_set_once() {
        let mut e = ExecutionJournalEntry::new(long_intent(), 2.0);
        e.mark_submitted(ts(1));
        e.mark_submitted(ts(5));
        assert_eq!(e.entry_submitted_at, Some(ts(1)));
        e.record_entry_fill(100.0, 1.0, 50.0, ts(2)).unwrap();
        e.record_entry_fill(100.0, 1.0, 5.0, ts(3)).unwrap();
        assert_eq!(e.contract_multiplier, Some(50.0));
    }
}
