//! Order side of a stream: intent creation, submission, protective legs,
//! break-even, fills and every fail-closed path.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

use super::{CommitReason, StreamState, StreamStateMachine};
use crate::audit::{emit_quietly, AuditEvent, Incident, IncidentKind};
use crate::engine::EngineContext;
use crate::error::{AccountingError, ExecutionError};
use crate::events::{EntryOrder, FlattenTarget, OrderAck, ResolvedFill};
use crate::execution::IntentRegistration;
use crate::intent::Intent;
use crate::journal::{ExecutionJournalEntry, FillEffect};
use crate::risk::GateInputs;
use crate::strategy::range_breakout::{bracket_prices, evaluate_bar, BracketParams};
use crate::types::{round_to_tick, Bar, Direction, OrderLeg, ProtectiveKind};

/// Run an order call up to `attempts` times with a fixed pause between tries.
async fn with_retry<F, Fut>(
    what: &'static str,
    attempts: u32,
    backoff: Duration,
    mut op: F,
) -> Result<(OrderAck, u32), ExecutionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<OrderAck, ExecutionError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(ack) => return Ok((ack, attempt)),
            Err(err) if attempt < attempts => {
                warn!(what, attempt, attempts, error = %err, "order call failed; retrying");
                if !backoff.is_zero() {
                    tokio::time::sleep(backoff).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
}

impl StreamStateMachine {
    pub(super) fn register(&self, ctx: &EngineContext, entry: &ExecutionJournalEntry) {
        ctx.boundary.register(
            entry.intent_id.clone(),
            IntentRegistration {
                trading_date: self.identity.trading_date,
                stream_id: self.identity.stream_id.clone(),
                instrument: self.identity.execution_instrument.clone(),
                direction: entry.intent.direction,
                contract_multiplier: self.spec.contract_multiplier,
            },
        );
    }

    fn save_ledger(&self, ctx: &EngineContext, now: DateTime<Utc>) -> bool {
        let Some(ledger) = self.ledger.as_ref() else {
            return true;
        };
        match ctx.journals.save_execution(&self.key, ledger) {
            Ok(()) => true,
            Err(err) => {
                ctx.incident(
                    Incident::new(now, IncidentKind::JournalWriteFailed, err.to_string())
                        .stream(self.key.clone())
                        .intent(ledger.intent_id.clone()),
                );
                false
            }
        }
    }

    fn break_even_stop(&self, intent: &Intent, ctx: &EngineContext) -> f64 {
        let tick = self.spec.tick_size;
        let offset = f64::from(ctx.config.break_even_offset_ticks) * tick;
        round_to_tick(intent.entry_price + intent.direction.sign() * offset, tick)
    }

    pub(super) async fn evaluate_breakout(&mut self, bar: &Bar, now: DateTime<Utc>, ctx: &EngineContext) {
        let (Some(range), Some(levels)) = (self.range, self.levels) else {
            return;
        };
        let Some(breakout) = evaluate_bar(bar, &levels, ctx.config.tie_break) else {
            return;
        };
        if breakout.ambiguous {
            warn!(
                stream = %self.key,
                bar_open = %bar.open_timestamp_utc,
                chosen = ?breakout.direction,
                "bar pierced both levels; tie-break policy applied"
            );
        }
        let prices = bracket_prices(
            breakout.direction,
            &range,
            &levels,
            &BracketParams {
                tick_size: self.spec.tick_size,
                target_points: self.spec.target_points,
                stop_cap_points: self.spec.stop_cap_points,
                break_even_fraction: ctx.config.break_even_fraction,
            },
        );
        let intent = Intent {
            trading_date: self.identity.trading_date,
            stream_id: self.identity.stream_id.clone(),
            canonical_instrument: self.identity.canonical_instrument.clone(),
            session: self.identity.session.clone(),
            slot_time: self.identity.slot_time,
            direction: breakout.direction,
            entry_price: prices.entry,
            stop_price: prices.stop,
            target_price: prices.target,
            break_even_trigger_price: prices.break_even_trigger,
            created_at: bar.open_timestamp_utc + ctx.config.bar_period(),
            trigger_reason: format!("BREAKOUT_{}", breakout.direction.as_str()),
        };
        self.enter(intent, now, ctx).await;
    }

    async fn enter(&mut self, intent: Intent, now: DateTime<Utc>, ctx: &EngineContext) {
        let instrument = self.identity.execution_instrument.clone();
        let gate = ctx.gate.evaluate(&GateInputs {
            kill_switch: &*ctx.kill_switch,
            timetable_valid: ctx.timetable_valid,
            stream_state: self.state,
            entry_already_detected: self.journal.entry_detected,
            slot_time: self.identity.slot_time,
            allowed_slots: &self.session.allowed_slots,
            instrument_blocked: ctx.boundary.is_blocked(&instrument),
        });
        if let Err(block) = gate {
            ctx.stats.lock().execution.entries_blocked += 1;
            ctx.incident(
                Incident::new(now, IncidentKind::GateBlocked, format!("{block:?}"))
                    .stream(self.key.clone())
                    .instrument(instrument),
            );
            self.commit(StreamState::NoTrade, CommitReason::EntryBlocked, now, ctx);
            return;
        }

        let mut entry = ExecutionJournalEntry::new(intent, self.spec.base_quantity);
        let intent_id = entry.intent_id.clone();

        match ctx.journals.submitted_entry(&self.key) {
            Ok(None) => {}
            Ok(Some(previous)) => {
                warn!(
                    stream = %self.key,
                    intent_id = %intent_id,
                    submitted = %previous.intent_id,
                    "entry already submitted for this occurrence; skipping"
                );
                ctx.stats.lock().execution.duplicate_submissions_skipped += 1;
                emit_quietly(
                    &*ctx.audit,
                    AuditEvent::IntentAlreadySubmitted {
                        ts: now,
                        stream: self.key.clone(),
                        intent_id: previous.intent_id.clone(),
                    },
                );
                self.register(ctx, &previous);
                self.ledger = Some(previous);
                self.journal.entry_detected = true;
                self.persist_journal(ctx, now);
                return;
            }
            Err(err) => {
                ctx.incident(
                    Incident::new(now, IncidentKind::JournalCorrupt, err.to_string()).stream(self.key.clone()),
                );
                self.set_state(StreamState::Suspended, "cannot verify prior submission", now, ctx);
                return;
            }
        }

        // Before submission: an instant fill must already be attributable.
        self.register(ctx, &entry);
        entry.mark_submitted(now);
        let order = EntryOrder {
            instrument,
            direction: entry.intent.direction,
            price: entry.intent.entry_price,
            qty: entry.quantity,
            intent_id: intent_id.clone(),
        };
        self.ledger = Some(entry);
        // Journal first: a crash after this line can never submit twice.
        if !self.save_ledger(ctx, now) {
            self.ledger = None;
            self.set_state(StreamState::Suspended, "cannot journal intent before submission", now, ctx);
            return;
        }
        self.journal.entry_detected = true;
        self.persist_journal(ctx, now);

        match ctx.adapter.submit_entry(order.clone()).await {
            Ok(ack) => {
                info!(
                    stream = %self.key,
                    intent_id = %intent_id,
                    direction = ?order.direction,
                    price = order.price,
                    qty = order.qty,
                    tag = %ack.tag,
                    "entry submitted"
                );
                ctx.stats.lock().execution.intents_submitted += 1;
                emit_quietly(
                    &*ctx.audit,
                    AuditEvent::IntentSubmitted {
                        ts: now,
                        stream: self.key.clone(),
                        intent_id,
                        quantity: order.qty,
                    },
                );
            }
            Err(err) => {
                if let Some(ledger) = self.ledger.as_mut() {
                    ledger.mark_rejected(err.to_string());
                }
                self.save_ledger(ctx, now);
                ctx.incident(
                    Incident::new(now, IncidentKind::EntryRejected, err.to_string())
                        .stream(self.key.clone())
                        .intent(intent_id.clone())
                        .instrument(order.instrument),
                );
                self.flatten(FlattenTarget::Intent(intent_id), now, ctx).await;
                self.commit(StreamState::Suspended, CommitReason::EntryRejected, now, ctx);
            }
        }
    }

    /// Fill routed here by the engine. Accepted in terminal states too, so
    /// late fills still land in the ledger.
    pub async fn on_fill(&mut self, fill: &ResolvedFill, now: DateTime<Utc>, ctx: &EngineContext) {
        let known = self.ledger.as_ref().is_some_and(|l| l.intent_id == fill.intent_id);
        if !known {
            ctx.boundary.block_instrument(fill.instrument.clone());
            ctx.incident(
                Incident::new(
                    fill.ts,
                    IncidentKind::OrphanFill,
                    format!("{:?} fill for an intent this stream does not own; instrument blocked", fill.leg),
                )
                .stream(self.key.clone())
                .intent(fill.intent_id.clone())
                .instrument(fill.instrument.clone()),
            );
            self.flatten(FlattenTarget::Intent(fill.intent_id.clone()), now, ctx).await;
            return;
        }
        emit_quietly(
            &*ctx.audit,
            AuditEvent::Fill {
                ts: fill.ts,
                stream: self.key.clone(),
                intent_id: fill.intent_id.clone(),
                leg: fill.leg,
                price: fill.price,
                qty: fill.qty,
            },
        );
        match fill.leg {
            OrderLeg::Entry => self.on_entry_fill(fill, now, ctx).await,
            leg => self.on_exit_fill(leg, fill, now, ctx).await,
        }
    }

    async fn on_entry_fill(&mut self, fill: &ResolvedFill, now: DateTime<Utc>, ctx: &EngineContext) {
        let Some(ledger) = self.ledger.as_mut() else {
            return;
        };
        let effect = match ledger.record_entry_fill(fill.price, fill.qty, fill.contract_multiplier, fill.ts) {
            Ok(effect) => effect,
            Err(err) => {
                error!(stream = %self.key, error = %err, "entry fill refused by ledger");
                return;
            }
        };
        let slippage_ticks = ledger.intent.direction.sign() * (fill.price - ledger.intent.entry_price) / self.spec.tick_size;
        {
            let mut stats = ctx.stats.lock();
            stats.execution.entry_fills += 1;
            stats.record_entry_slippage(slippage_ticks);
        }
        info!(stream = %self.key, intent_id = %fill.intent_id, price = fill.price, qty = fill.qty, ?effect, "entry fill");
        self.save_ledger(ctx, now);

        if self.state.is_terminal() {
            // The entry order outlived its stream.
            warn!(stream = %self.key, state = ?self.state, "entry filled after stream concluded; flattening");
            self.flatten(FlattenTarget::Intent(fill.intent_id.clone()), now, ctx).await;
            return;
        }
        if let Err(detail) = self.submit_protectives(fill.qty, now, ctx).await {
            ctx.stats.lock().execution.protective_failures += 1;
            self.fail_closed(IncidentKind::ProtectiveFailure, CommitReason::ProtectiveFailure, detail, now, ctx)
                .await;
        }
    }

    /// Stop and target for the quantity just filled.
    async fn submit_protectives(&mut self, qty: f64, now: DateTime<Utc>, ctx: &EngineContext) -> Result<(), String> {
        let Some(ledger) = self.ledger.as_ref() else {
            return Err("no intent".into());
        };
        let intent_id = ledger.intent_id.clone();
        let stop = if ledger.break_even_modified {
            self.break_even_stop(&ledger.intent, ctx)
        } else {
            ledger.intent.stop_price
        };
        let legs = [
            (ProtectiveKind::Stop, stop),
            (ProtectiveKind::Target, ledger.intent.target_price),
        ];
        let adapter = ctx.adapter.as_ref();
        let id = &intent_id;
        for (kind, price) in legs {
            let submitted = with_retry(
                "protective",
                ctx.config.protective_max_attempts,
                ctx.config.protective_backoff(),
                move || adapter.submit_protective(id, kind, price, qty),
            )
            .await;
            match submitted {
                Ok((_, attempts)) => emit_quietly(
                    &*ctx.audit,
                    AuditEvent::ProtectiveSubmitted {
                        ts: now,
                        stream: self.key.clone(),
                        intent_id: intent_id.clone(),
                        kind,
                        price,
                        qty,
                        attempts,
                    },
                ),
                Err(err) => {
                    return Err(format!(
                        "{kind:?} leg failed after {} attempts: {err}",
                        ctx.config.protective_max_attempts
                    ))
                }
            }
        }
        if let Some(ledger) = self.ledger.as_mut() {
            ledger.protective_submitted = true;
        }
        self.save_ledger(ctx, now);
        self.journal.protective_orders_submitted = true;
        self.persist_journal(ctx, now);
        Ok(())
    }

    async fn on_exit_fill(&mut self, leg: OrderLeg, fill: &ResolvedFill, now: DateTime<Utc>, ctx: &EngineContext) {
        let Some(ledger) = self.ledger.as_mut() else {
            return;
        };
        match ledger.record_exit_fill(leg, fill.price, fill.qty, fill.ts) {
            Ok(effect) => {
                ctx.stats.lock().execution.exit_fills += 1;
                self.save_ledger(ctx, now);
                match effect {
                    FillEffect::Completed(pnl) => {
                        info!(
                            stream = %self.key,
                            intent_id = %fill.intent_id,
                            ?leg,
                            points = pnl.points,
                            gross = pnl.gross,
                            "trade complete"
                        );
                        if matches!(leg, OrderLeg::Stop | OrderLeg::Target) {
                            let sibling = if leg == OrderLeg::Stop { OrderLeg::Target } else { OrderLeg::Stop };
                            self.cancel(sibling, now, ctx).await;
                        }
                        if !self.state.is_terminal() {
                            self.commit(StreamState::Done, CommitReason::TradeCompleted, now, ctx);
                        }
                    }
                    other => info!(stream = %self.key, ?leg, ?other, "partial exit"),
                }
            }
            Err(err @ (AccountingError::Overfill { .. } | AccountingError::ExitBeforeEntry)) => {
                self.fail_closed(IncidentKind::Overfill, CommitReason::Overfill, err.to_string(), now, ctx)
                    .await;
            }
            Err(err) => {
                error!(stream = %self.key, error = %err, "exit fill refused by ledger");
            }
        }
    }

    pub(super) async fn check_break_even(&mut self, bar: &Bar, now: DateTime<Utc>, ctx: &EngineContext) {
        let Some(ledger) = self.ledger.as_ref() else {
            return;
        };
        if !ledger.has_entry_fill()
            || !ledger.protective_submitted
            || ledger.break_even_modified
            || ledger.is_complete()
            || bar.open_timestamp_utc < ledger.intent.created_at
        {
            return;
        }
        let trigger = ledger.intent.break_even_trigger_price;
        let reached = match ledger.intent.direction {
            Direction::Long => bar.high >= trigger,
            Direction::Short => bar.low <= trigger,
        };
        if !reached {
            return;
        }
        let new_stop = self.break_even_stop(&ledger.intent, ctx);
        let intent_id = ledger.intent_id.clone();
        let adapter = ctx.adapter.as_ref();
        let id = &intent_id;
        let modified = with_retry(
            "modify stop",
            ctx.config.protective_max_attempts,
            ctx.config.protective_backoff(),
            move || adapter.modify_stop(id, new_stop),
        )
        .await;
        match modified {
            Ok(_) => {
                if let Some(ledger) = self.ledger.as_mut() {
                    ledger.break_even_modified = true;
                }
                self.save_ledger(ctx, now);
                info!(stream = %self.key, intent_id = %intent_id, new_stop, "stop moved to break-even");
                emit_quietly(
                    &*ctx.audit,
                    AuditEvent::BreakEvenModified {
                        ts: now,
                        stream: self.key.clone(),
                        intent_id,
                        new_stop,
                    },
                );
            }
            Err(err) => {
                // The original stop is still working; the next bar tries again.
                warn!(stream = %self.key, error = %err, "break-even modify failed");
            }
        }
    }

    pub(super) async fn conclude_at_market_close(&mut self, now: DateTime<Utc>, ctx: &EngineContext) {
        let Some(ledger) = self.ledger.as_ref() else {
            self.commit(StreamState::NoTrade, CommitReason::NoBreakoutBeforeClose, now, ctx);
            return;
        };
        let intent_id = ledger.intent_id.clone();
        if ledger.is_complete() {
            self.commit(StreamState::Done, CommitReason::TradeCompleted, now, ctx);
            return;
        }
        if !ledger.has_entry_fill() {
            info!(stream = %self.key, intent_id = %intent_id, "market close; cancelling unfilled entry");
            if !self.cancel(OrderLeg::Entry, now, ctx).await {
                self.flatten(FlattenTarget::Intent(intent_id), now, ctx).await;
            }
            self.commit(StreamState::NoTrade, CommitReason::MarketClose, now, ctx);
            return;
        }
        info!(
            stream = %self.key,
            intent_id = %intent_id,
            open_qty = ledger.open_quantity(),
            "market close; flattening open position"
        );
        self.cancel(OrderLeg::Stop, now, ctx).await;
        self.cancel(OrderLeg::Target, now, ctx).await;
        if self.flatten(FlattenTarget::Intent(intent_id), now, ctx).await {
            self.commit(StreamState::Done, CommitReason::MarketCloseFlattened, now, ctx);
        } else {
            self.commit(StreamState::Suspended, CommitReason::MarketClose, now, ctx);
        }
    }

    /// First tick after a restart that found a journaled intent.
    pub(super) async fn recover_open_intent(&mut self, now: DateTime<Utc>, ctx: &EngineContext) {
        let Some(ledger) = self.ledger.as_ref() else {
            return;
        };
        if ledger.is_complete() {
            self.commit(StreamState::Done, CommitReason::TradeCompleted, now, ctx);
            return;
        }
        if ledger.entry_rejected.is_some() {
            self.commit(StreamState::Suspended, CommitReason::EntryRejected, now, ctx);
            return;
        }
        if ledger.has_entry_fill() && !ledger.protective_submitted {
            let detail = format!(
                "{} contracts filled with no protective orders on record",
                ledger.open_quantity()
            );
            self.fail_closed(
                IncidentKind::UnprotectedOnRestart,
                CommitReason::UnprotectedOnRestart,
                detail,
                now,
                ctx,
            )
            .await;
            return;
        }
        info!(
            stream = %self.key,
            intent_id = %ledger.intent_id,
            filled = ledger.entry.quantity,
            protected = ledger.protective_submitted,
            "restored working intent"
        );
    }

    /// Record the incident, pull every working order, flatten and stand down.
    async fn fail_closed(
        &mut self,
        kind: IncidentKind,
        reason: CommitReason,
        detail: String,
        now: DateTime<Utc>,
        ctx: &EngineContext,
    ) {
        let mut incident = Incident::new(now, kind, detail)
            .stream(self.key.clone())
            .instrument(self.identity.execution_instrument.clone());
        let intent_id = self.ledger.as_ref().map(|l| l.intent_id.clone());
        if let Some(id) = &intent_id {
            incident = incident.intent(id.clone());
        }
        ctx.incident(incident);
        if let Some(id) = intent_id {
            self.cancel(OrderLeg::Stop, now, ctx).await;
            self.cancel(OrderLeg::Target, now, ctx).await;
            self.flatten(FlattenTarget::Intent(id), now, ctx).await;
        }
        self.commit(StreamState::Suspended, reason, now, ctx);
    }

    async fn cancel(&self, leg: OrderLeg, now: DateTime<Utc>, ctx: &EngineContext) -> bool {
        let Some(ledger) = self.ledger.as_ref() else {
            return true;
        };
        let adapter = ctx.adapter.as_ref();
        let id = &ledger.intent_id;
        let cancelled = with_retry(
            "cancel",
            ctx.config.protective_max_attempts,
            ctx.config.protective_backoff(),
            move || adapter.cancel(id, leg),
        )
        .await;
        if let Err(err) = &cancelled {
            warn!(stream = %self.key, ?leg, error = %err, ts = %now, "cancel failed");
        }
        cancelled.is_ok()
    }

    /// Bounded retries; on exhaustion the instrument is blocked.
    async fn flatten(&self, target: FlattenTarget, now: DateTime<Utc>, ctx: &EngineContext) -> bool {
        let adapter = ctx.adapter.as_ref();
        let flat = &target;
        let result = with_retry(
            "flatten",
            ctx.config.flatten_max_attempts,
            ctx.config.protective_backoff(),
            move || adapter.flatten(flat.clone()),
        )
        .await;
        match result {
            Ok((ack, attempts)) => {
                info!(stream = %self.key, tag = %ack.tag, attempts, "flatten accepted");
                true
            }
            Err(err) => {
                let instrument = self.identity.execution_instrument.clone();
                ctx.boundary.block_instrument(instrument.clone());
                let mut incident = Incident::new(
                    now,
                    IncidentKind::FlattenFailure,
                    format!("flatten {target:?} failed: {err}; instrument blocked"),
                )
                .stream(self.key.clone())
                .instrument(instrument);
                if let FlattenTarget::Intent(id) = &target {
                    incident = incident.intent(id.clone());
                }
                ctx.incident(incident);
                false
            }
        }
    }
}
