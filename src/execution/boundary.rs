//! Shared map between the order path and the fill callback path.
//!
//! An intent is registered here *before* its entry order is submitted: in an
//! instant-fill environment the fill callback can run before `submit_entry`
//! returns, and an unregistered intent would leave that fill unattributable.

use chrono::NaiveDate;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error};

use crate::audit::{Incident, IncidentKind};
use crate::events::{FillEvent, ResolvedFill};
use crate::types::{Direction, Instrument, IntentId, OrderTag, StreamId};

#[derive(Clone, Debug, PartialEq)]
pub struct IntentRegistration {
    pub trading_date: NaiveDate,
    pub stream_id: StreamId,
    pub instrument: Instrument,
    pub direction: Direction,
    pub contract_multiplier: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FillRouting {
    Routed,
    /// Could not be attributed; execution is now blocked.
    Orphan,
}

#[derive(Default)]
pub struct ExecutionBoundary {
    intents: DashMap<IntentId, IntentRegistration>,
    pending: Mutex<VecDeque<ResolvedFill>>,
    incidents: Mutex<Vec<Incident>>,
    blocked: DashSet<Instrument>,
    blocked_all: AtomicBool,
}

impl ExecutionBoundary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: re-registering the same id overwrites with identical data.
    pub fn register(&self, intent_id: IntentId, registration: IntentRegistration) {
        debug!(intent_id = %intent_id, stream_id = %registration.stream_id, "intent registered");
        self.intents.insert(intent_id, registration);
    }

    pub fn is_registered(&self, intent_id: &IntentId) -> bool {
        self.intents.contains_key(intent_id)
    }

    /// Fill callback entry point. Safe to call from any thread.
    pub fn on_fill(&self, fill: FillEvent) -> FillRouting {
        let tag: OrderTag = match fill.order_tag.parse() {
            Ok(tag) => tag,
            Err(err) => {
                self.blocked_all.store(true, Ordering::SeqCst);
                self.orphan(Incident::new(
                    fill.timestamp,
                    IncidentKind::OrphanFill,
                    format!("{err}; all execution blocked"),
                ));
                return FillRouting::Orphan;
            }
        };
        let Some(reg) = self.intents.get(&tag.intent_id).map(|r| r.value().clone()) else {
            self.blocked_all.store(true, Ordering::SeqCst);
            self.orphan(
                Incident::new(
                    fill.timestamp,
                    IncidentKind::OrphanFill,
                    format!("fill for unregistered intent (tag {}); all execution blocked", fill.order_tag),
                )
                .intent(tag.intent_id),
            );
            return FillRouting::Orphan;
        };
        if !(fill.fill_price.is_finite() && fill.fill_qty.is_finite() && fill.fill_qty > 0.0) {
            self.blocked.insert(reg.instrument.clone());
            self.orphan(
                Incident::new(
                    fill.timestamp,
                    IncidentKind::OrphanFill,
                    format!(
                        "unusable fill price={} qty={}; instrument blocked",
                        fill.fill_price, fill.fill_qty
                    ),
                )
                .intent(tag.intent_id)
                .instrument(reg.instrument),
            );
            return FillRouting::Orphan;
        }
        self.pending.lock().push_back(ResolvedFill {
            trading_date: reg.trading_date,
            stream_id: reg.stream_id,
            intent_id: tag.intent_id,
            leg: tag.leg,
            direction: reg.direction,
            instrument: reg.instrument,
            contract_multiplier: reg.contract_multiplier,
            price: fill.fill_price,
            qty: fill.fill_qty,
            ts: fill.timestamp,
        });
        FillRouting::Routed
    }

    fn orphan(&self, incident: Incident) {
        error!(
            kind = ?incident.kind,
            intent_id = ?incident.intent_id,
            instrument = ?incident.instrument,
            detail = %incident.detail,
            "orphan fill"
        );
        self.incidents.lock().push(incident);
    }

    pub fn drain_fills(&self) -> Vec<ResolvedFill> {
        self.pending.lock().drain(..).collect()
    }

    pub fn drain_incidents(&self) -> Vec<Incident> {
        std::mem::take(&mut *self.incidents.lock())
    }

    pub fn block_instrument(&self, instrument: Instrument) {
        self.blocked.insert(instrument);
    }

    pub fn is_blocked(&self, instrument: &Instrument) -> bool {
        self.blocked_all.load(Ordering::SeqCst) || self.blocked.contains(instrument)
    }
}
