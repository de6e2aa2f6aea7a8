use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ExecutionError;
use crate::events::{EntryOrder, FillEvent, FlattenTarget, OrderAck};
use crate::execution::{ExecutionAdapter, ExecutionBoundary};
use crate::types::*;

/// Failure injection and fill behaviour for [`SimulatedAdapter`].
#[derive(Clone, Debug, Default)]
pub struct SimConfig {
    /// Fill entries inside `submit_entry`, before it returns.
    pub instant_entry_fill: bool,
    /// Points added against the trader on entry fills.
    pub entry_slippage: f64,
    pub reject_entries: bool,
    /// Number of upcoming protective submissions (of `fail_protective_kind`, or any) to fail.
    pub fail_protective: u32,
    pub fail_protective_kind: Option<ProtectiveKind>,
    pub fail_flatten: bool,
    pub fail_modify: bool,
}

/// Every call the adapter received, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum SimCall {
    Entry(EntryOrder),
    Protective {
        intent_id: IntentId,
        kind: ProtectiveKind,
        price: f64,
        qty: f64,
    },
    ModifyStop {
        intent_id: IntentId,
        new_price: f64,
    },
    Flatten(FlattenTarget),
    Cancel {
        intent_id: IntentId,
        leg: OrderLeg,
    },
}

#[derive(Clone, Debug)]
struct SimOrder {
    instrument: Instrument,
    direction: Direction,
    entry: Option<EntryOrder>,
    open_qty: f64,
    last_price: f64,
    stop: Option<(f64, f64)>,
    target: Option<(f64, f64)>,
}

#[derive(Default)]
struct SimState {
    cfg: SimConfig,
    orders: BTreeMap<IntentId, SimOrder>,
    calls: Vec<SimCall>,
    clock: Option<DateTime<Utc>>,
}

/// In-process broker stand-in. Fills are delivered through the execution
/// boundary exactly as a broker callback would deliver them.
pub struct SimulatedAdapter {
    boundary: Arc<ExecutionBoundary>,
    state: Mutex<SimState>,
}

impl SimulatedAdapter {
    pub fn new(boundary: Arc<ExecutionBoundary>, cfg: SimConfig) -> Self {
        Self {
            boundary,
            state: Mutex::new(SimState {
                cfg,
                ..SimState::default()
            }),
        }
    }

    pub fn set_clock(&self, now: DateTime<Utc>) {
        self.state.lock().clock = Some(now);
    }

    pub fn configure(&self, f: impl FnOnce(&mut SimConfig)) {
        f(&mut self.state.lock().cfg);
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().calls.clone()
    }

    pub fn entry_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, SimCall::Entry(_)))
            .count()
    }

    pub fn open_quantity(&self, intent_id: &IntentId) -> f64 {
        self.state
            .lock()
            .orders
            .get(intent_id)
            .map(|o| o.open_qty)
            .unwrap_or(0.0)
    }

    pub fn working_stop(&self, intent_id: &IntentId) -> Option<f64> {
        self.state
            .lock()
            .orders
            .get(intent_id)
            .and_then(|o| o.stop.map(|(p, _)| p))
    }

    /// Work resting orders against a completed bar.
    pub fn on_bar(&self, bar: &Bar) {
        let ts = bar.open_timestamp_utc;
        let mut fills = Vec::new();
        {
            let mut st = self.state.lock();
            for (id, order) in st.orders.iter_mut() {
                if order.instrument != bar.instrument {
                    continue;
                }
                order.last_price = bar.close;
                if let Some(entry) = order.entry.clone() {
                    let crossed = match entry.direction {
                        Direction::Long => bar.high >= entry.price,
                        Direction::Short => bar.low <= entry.price,
                    };
                    if crossed {
                        order.entry = None;
                        order.open_qty += entry.qty;
                        fills.push((OrderTag::new(id.clone(), OrderLeg::Entry), entry.price, entry.qty));
                    }
                    continue;
                }
                if order.open_qty <= 0.0 {
                    continue;
                }
                let stop_hit = order.stop.filter(|(p, _)| match order.direction {
                    Direction::Long => bar.low <= *p,
                    Direction::Short => bar.high >= *p,
                });
                let target_hit = order.target.filter(|(p, _)| match order.direction {
                    Direction::Long => bar.high >= *p,
                    Direction::Short => bar.low <= *p,
                });
                // Stop first when both are touched inside one bar.
                if let Some((price, qty)) = stop_hit {
                    let qty = qty.min(order.open_qty);
                    order.open_qty -= qty;
                    order.stop = None;
                    fills.push((OrderTag::new(id.clone(), OrderLeg::Stop), price, qty));
                } else if let Some((price, qty)) = target_hit {
                    let qty = qty.min(order.open_qty);
                    order.open_qty -= qty;
                    order.target = None;
                    fills.push((OrderTag::new(id.clone(), OrderLeg::Target), price, qty));
                }
            }
        }
        for (tag, price, qty) in fills {
            self.deliver(tag, price, qty, ts);
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.state.lock().clock.unwrap_or_else(Utc::now)
    }

    fn deliver(&self, tag: OrderTag, price: f64, qty: f64, ts: DateTime<Utc>) {
        self.boundary.on_fill(FillEvent {
            order_tag: tag.to_string(),
            fill_price: price,
            fill_qty: qty,
            timestamp: ts,
        });
    }

    fn ack(&self, tag: OrderTag) -> OrderAck {
        OrderAck {
            tag: tag.to_string(),
            ts: self.now(),
        }
    }
}

#[async_trait]
impl ExecutionAdapter for SimulatedAdapter {
    async fn submit_entry(&self, order: EntryOrder) -> Result<OrderAck, ExecutionError> {
        let tag = OrderTag::new(order.intent_id.clone(), OrderLeg::Entry);
        let instant = {
            let mut st = self.state.lock();
            st.calls.push(SimCall::Entry(order.clone()));
            if st.cfg.reject_entries {
                return Err(ExecutionError::Rejected("simulated entry rejection".into()));
            }
            let instant = st.cfg.instant_entry_fill;
            let slip = order.direction.sign() * st.cfg.entry_slippage;
            st.orders.insert(
                order.intent_id.clone(),
                SimOrder {
                    instrument: order.instrument.clone(),
                    direction: order.direction,
                    entry: if instant { None } else { Some(order.clone()) },
                    open_qty: if instant { order.qty } else { 0.0 },
                    last_price: order.price + slip,
                    stop: None,
                    target: None,
                },
            );
            instant.then_some(order.price + slip)
        };
        if let Some(price) = instant {
            // Delivered before this call returns.
            self.deliver(tag.clone(), price, order.qty, self.now());
        }
        Ok(self.ack(tag))
    }

    async fn submit_protective(
        &self,
        intent_id: &IntentId,
        kind: ProtectiveKind,
        price: f64,
        qty: f64,
    ) -> Result<OrderAck, ExecutionError> {
        {
            let mut st = self.state.lock();
            st.calls.push(SimCall::Protective {
                intent_id: intent_id.clone(),
                kind,
                price,
                qty,
            });
            let targeted = st.cfg.fail_protective_kind.map_or(true, |k| k == kind);
            if targeted && st.cfg.fail_protective > 0 {
                st.cfg.fail_protective -= 1;
                return Err(ExecutionError::Unavailable(format!("simulated {kind:?} failure")));
            }
            let order = st
                .orders
                .get_mut(intent_id)
                .ok_or_else(|| ExecutionError::UnknownIntent(intent_id.clone()))?;
            let slot = match kind {
                ProtectiveKind::Stop => &mut order.stop,
                ProtectiveKind::Target => &mut order.target,
            };
            let working = slot.map_or(0.0, |(_, q)| q);
            *slot = Some((price, working + qty));
        }
        Ok(self.ack(OrderTag::new(intent_id.clone(), kind.into())))
    }

    async fn modify_stop(&self, intent_id: &IntentId, new_price: f64) -> Result<OrderAck, ExecutionError> {
        {
            let mut st = self.state.lock();
            st.calls.push(SimCall::ModifyStop {
                intent_id: intent_id.clone(),
                new_price,
            });
            if st.cfg.fail_modify {
                return Err(ExecutionError::Unavailable("simulated modify failure".into()));
            }
            let order = st
                .orders
                .get_mut(intent_id)
                .ok_or_else(|| ExecutionError::UnknownIntent(intent_id.clone()))?;
            match order.stop.as_mut() {
                Some((p, _)) => *p = new_price,
                None => return Err(ExecutionError::Rejected("no working stop".into())),
            }
        }
        Ok(self.ack(OrderTag::new(intent_id.clone(), OrderLeg::Stop)))
    }

    async fn flatten(&self, target: FlattenTarget) -> Result<OrderAck, ExecutionError> {
        let ts = self.now();
        let fills = {
            let mut st = self.state.lock();
            st.calls.push(SimCall::Flatten(target.clone()));
            if st.cfg.fail_flatten {
                return Err(ExecutionError::Unavailable("simulated flatten failure".into()));
            }
            let mut fills = Vec::new();
            for (id, order) in st.orders.iter_mut() {
                let hit = match &target {
                    FlattenTarget::Intent(i) => i == id,
                    FlattenTarget::Instrument(inst) => inst == &order.instrument,
                };
                if !hit {
                    continue;
                }
                order.entry = None;
                order.stop = None;
                order.target = None;
                if order.open_qty > 0.0 {
                    fills.push((OrderTag::new(id.clone(), OrderLeg::Flatten), order.last_price, order.open_qty));
                    order.open_qty = 0.0;
                }
            }
            fills
        };
        for (tag, price, qty) in fills {
            self.deliver(tag, price, qty, ts);
        }
        let label = match target {
            FlattenTarget::Intent(id) => id.0,
            FlattenTarget::Instrument(inst) => inst.0,
        };
        Ok(OrderAck {
            tag: format!("{label}:FLATTEN"),
            ts,
        })
    }

    async fn cancel(&self, intent_id: &IntentId, leg: OrderLeg) -> Result<OrderAck, ExecutionError> {
        {
            let mut st = self.state.lock();
            st.calls.push(SimCall::Cancel {
                intent_id: intent_id.clone(),
                leg,
            });
            if let Some(order) = st.orders.get_mut(intent_id) {
                match leg {
                    OrderLeg::Entry => order.entry = None,
                    OrderLeg::Stop => order.stop = None,
                    OrderLeg::Target => order.target = None,
                    OrderLeg::Flatten => {}
                }
            }
        }
        Ok(self.ack(OrderTag::new(intent_id.clone(), leg)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::IntentRegistration;
    use chrono::{NaiveDate, TimeZone};

    fn setup(cfg: SimConfig) -> (Arc<ExecutionBoundary>, SimulatedAdapter, IntentId) {
        let boundary = Arc::new(ExecutionBoundary::new());
        let id = IntentId("00ff00ff00ff00ff".into());
        boundary.register(
            id.clone(),
            IntentRegistration {
                trading_date: NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
                stream_id: StreamId("ES1".into()),
                instrument: Instrument("ES".into()),
                direction: Direction::Long,
                contract_multiplier: 50.0,
            },
        );
        let sim = SimulatedAdapter::new(boundary.clone(), cfg);
        sim.set_clock(Utc.with_ymd_and_hms(2025, 7, 1, 14, 0, 0).unwrap());
        (boundary, sim, id)
    }

    fn entry(id: &IntentId) -> EntryOrder {
        EntryOrder {
            instrument: Instrument("ES".into()),
            direction: Direction::Long,
            price: 100.0,
            qty: 2.0,
            intent_id: id.clone(),
        }
    }

    #[tokio::test]
    async fn instant_fill_arrives_before_submit_returns() {
        let (boundary, sim, id) = setup(SimConfig {
            instant_entry_fill: true,
            ..Default::default()
        });
        sim.submit_entry(entry(&id)).await.unwrap();
        let fills = boundary.drain_fills();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].leg, OrderLeg::Entry);
        assert_eq!(sim.open_quantity(&id), 2.0);
    }

    #[tokio::test]
    async fn protective_failures_are_injected_then_clear() {
        let (_b, sim, id) = setup(SimConfig {
            instant_entry_fill: true,
            fail_protective: 2,
            fail_protective_kind: Some(ProtectiveKind::Stop),
            ..Default::default()
        });
        sim.submit_entry(entry(&id)).await.unwrap();
        assert!(sim.submit_protective(&id, ProtectiveKind::Target, 110.0, 2.0).await.is_ok());
        assert!(sim.submit_protective(&id, ProtectiveKind::Stop, 95.0, 2.0).await.is_err());
        assert!(sim.submit_protective(&id, ProtectiveKind::Stop, 95.0, 2.0).await.is_err());
        assert!(sim.submit_protective(&id, ProtectiveKind::Stop, 95.0, 2.0).await.is_ok());
        assert_eq!(sim.working_stop(&id), Some(95.0));
    }

    #[tokio::test]
    async fn bars_trigger_resting_entry_and_stop() {
        let (boundary, sim, id) = setup(SimConfig::default());
        sim.submit_entry(entry(&id)).await.unwrap();
        assert!(boundary.drain_fills().is_empty());

        let mut bar = Bar {
            instrument: Instrument("ES".into()),
            open_timestamp_utc: Utc.with_ymd_and_hms(2025, 7, 1, 14, 1, 0).unwrap(),
            open: 99.0,
            high: 100.5,
            low: 98.0,
            close: 100.25,
            source: BarSource::Live,
        };
        sim.on_bar(&bar);
        assert_eq!(boundary.drain_fills()[0].leg, OrderLeg::Entry);

        sim.submit_protective(&id, ProtectiveKind::Stop, 95.0, 2.0).await.unwrap();
        bar.low = 94.0;
        sim.on_bar(&bar);
        let fills = boundary.drain_fills();
        assert_eq!(fills[0].leg, OrderLeg::Stop);
        assert_eq!(fills[0].qty, 2.0);
        assert_eq!(sim.open_quantity(&id), 0.0);
    }

    #[tokio::test]
    async fn flatten_closes_open_quantity() {
        let (boundary, sim, id) = setup(SimConfig {
            instant_entry_fill: true,
            ..Default::default()
        });
        sim.submit_entry(entry(&id)).await.unwrap();
        boundary.drain_fills();
        sim.flatten(FlattenTarget::Intent(id.clone())).await.unwrap();
        let fills = boundary.drain_fills();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].leg, OrderLeg::Flatten);
        assert_eq!(fills[0].qty, 2.0);
    }
}
