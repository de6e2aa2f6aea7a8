//! One state machine per (trading date, stream).
//!
//! Driven by two inputs from a single serialized caller: `tick(now)` on a wall
//! clock cadence, and `on_bar(bar, now)` on data arrival. Time-based
//! transitions (arming, range lock, market close) happen on ticks so a stalled
//! feed cannot hold a stream in place.
//!
//! Only [`StreamJournal`] survives a restart. On construction the journal is
//! loaded; a committed occurrence stays terminal, anything else is rebuilt from
//! a fresh historical request.

mod execution;
pub mod state;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{emit_quietly, AuditEvent, Incident, IncidentKind};
use crate::engine::EngineContext;
use crate::error::SetupError;
use crate::hydration::source::HydrationJob;
use crate::hydration::{AdmissionPolicy, BarBuffer, HydrationOutcome, HydrationStatus};
use crate::instrument::{InstrumentSpec, SessionSpec};
use crate::journal::{ExecutionJournalEntry, StreamJournal};
use crate::strategy::range_breakout::{
    compute_range, first_breakout, min_bar_count, validate_range, BreakoutLevels, Range,
    RangeCandidate, RangeRejection,
};
use crate::types::{Bar, StreamIdentity, StreamKey};

pub use state::{CommitReason, StreamState, StreamWindow};

pub struct StreamStateMachine {
    identity: StreamIdentity,
    key: StreamKey,
    window: StreamWindow,
    spec: InstrumentSpec,
    session: SessionSpec,
    state: StreamState,
    journal: StreamJournal,
    /// False when the on-disk journal was corrupt; it is then never overwritten.
    journal_writable: bool,
    /// State recorded by a previous process, if any.
    restored_state: Option<StreamState>,
    /// Constructed at or after slot time: any breakout already in the buffer was missed.
    late_start: bool,
    recovery_pending: bool,
    buffer: Arc<BarBuffer>,
    hydration: Arc<HydrationStatus>,
    hydration_task: Option<JoinHandle<()>>,
    /// When the historical request went out; the hard timeout runs from here.
    hydration_requested_at: Option<DateTime<Utc>>,
    hydration_timeout_logged: bool,
    /// Armed on a hard timeout: history that lands afterwards is scanned once more.
    late_history_pending: bool,
    range_preview: RangeCandidate,
    last_rejection: Option<RangeRejection>,
    range: Option<Range>,
    levels: Option<BreakoutLevels>,
    ledger: Option<ExecutionJournalEntry>,
}

impl StreamStateMachine {
    pub fn new(identity: StreamIdentity, ctx: &EngineContext, now: DateTime<Utc>) -> Result<Self, SetupError> {
        let (spec, session) = ctx.instruments.resolve(
            &identity.canonical_instrument,
            &identity.session,
            identity.slot_time,
        )?;
        let (spec, session) = (spec.clone(), session.clone());
        let window = StreamWindow::resolve(&ctx.time, &identity, &session)?;
        let key = identity.key();
        let buffer = Arc::new(BarBuffer::new(AdmissionPolicy {
            trading_date: identity.trading_date,
            bar_period: ctx.config.bar_period(),
            tz: ctx.time.tz(),
        }));

        let mut machine = Self {
            journal: StreamJournal::new(identity.trading_date, identity.stream_id.clone(), now),
            identity,
            key,
            window,
            spec,
            session,
            state: StreamState::PreHydration,
            journal_writable: true,
            restored_state: None,
            late_start: now >= window.slot_time,
            recovery_pending: false,
            buffer,
            hydration: Arc::new(HydrationStatus::pending()),
            hydration_task: None,
            hydration_requested_at: None,
            hydration_timeout_logged: false,
            late_history_pending: false,
            range_preview: RangeCandidate::default(),
            last_rejection: None,
            range: None,
            levels: None,
            ledger: None,
        };

        match ctx.journals.load_stream(&machine.key) {
            Ok(Some(journal)) => {
                machine.restored_state = Some(journal.last_observed_state);
                machine.journal = journal;
            }
            Ok(None) => machine.persist_journal(ctx, now),
            Err(err) => {
                machine.journal_writable = false;
                ctx.incident(
                    Incident::new(now, IncidentKind::JournalCorrupt, err.to_string()).stream(machine.key.clone()),
                );
                machine.set_state(StreamState::Suspended, "stream journal unreadable", now, ctx);
                return Ok(machine);
            }
        }

        if machine.journal.committed {
            info!(
                stream = %machine.key,
                reason = ?machine.journal.commit_reason,
                "occurrence already concluded; staying terminal"
            );
            machine.set_state(StreamState::Committed, "journal committed", now, ctx);
            return Ok(machine);
        }

        if !machine.restore_ledger(ctx, now) {
            return Ok(machine);
        }

        if machine.restored_state.is_some() && now > machine.window.range_start {
            info!(
                stream = %machine.key,
                last_state = ?machine.restored_state,
                late_start = machine.late_start,
                "mid-occurrence restart; rebuilding from history"
            );
        }
        machine.start_hydration(ctx, now);
        Ok(machine)
    }

    /// Load any intent already journaled for this occurrence and re-register it.
    fn restore_ledger(&mut self, ctx: &EngineContext, now: DateTime<Utc>) -> bool {
        let entries = match ctx.journals.executions_for_stream(&self.key) {
            Ok(entries) => entries,
            Err(err) => {
                ctx.incident(
                    Incident::new(now, IncidentKind::JournalCorrupt, err.to_string()).stream(self.key.clone()),
                );
                self.set_state(StreamState::Suspended, "execution journal unreadable", now, ctx);
                return false;
            }
        };
        let submitted: Vec<ExecutionJournalEntry> = entries.into_iter().filter(|e| e.entry_submitted).collect();
        if submitted.len() > 1 {
            ctx.incident(
                Incident::new(
                    now,
                    IncidentKind::JournalCorrupt,
                    format!("{} submitted intents for one occurrence", submitted.len()),
                )
                .stream(self.key.clone()),
            );
            for entry in &submitted {
                self.register(ctx, entry);
            }
            self.set_state(StreamState::Suspended, "multiple submitted intents", now, ctx);
            return false;
        }
        match submitted.into_iter().next() {
            Some(entry) => {
                self.register(ctx, &entry);
                self.journal.entry_detected = true;
                self.ledger = Some(entry);
                self.recovery_pending = true;
                true
            }
            None if self.journal.entry_detected => {
                ctx.incident(
                    Incident::new(now, IncidentKind::JournalCorrupt, "entry detected but no submitted intent")
                        .stream(self.key.clone()),
                );
                self.set_state(StreamState::Suspended, "journal inconsistent", now, ctx);
                false
            }
            None => true,
        }
    }

    fn start_hydration(&mut self, ctx: &EngineContext, now: DateTime<Utc>) {
        if now <= self.window.range_start {
            // Nothing has traded in the window yet; live bars cover it.
            self.hydration.mark_completed();
            return;
        }
        let job = HydrationJob {
            stream: self.key.clone(),
            instrument: self.identity.canonical_instrument.clone(),
            from: self.window.range_start,
            to: now,
        };
        debug!(stream = %self.key, from = %job.from, to = %job.to, "requesting historical bars");
        self.hydration_requested_at = Some(now);
        self.hydration_task = Some(ctx.hydrator.spawn(job, self.buffer.clone(), self.hydration.clone()));
    }

    pub fn identity(&self) -> &StreamIdentity {
        &self.identity
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn window(&self) -> &StreamWindow {
        &self.window
    }

    pub fn range(&self) -> Option<&Range> {
        self.range.as_ref()
    }

    pub fn levels(&self) -> Option<&BreakoutLevels> {
        self.levels.as_ref()
    }

    pub fn range_preview(&self) -> &RangeCandidate {
        &self.range_preview
    }

    pub fn ledger(&self) -> Option<&ExecutionJournalEntry> {
        self.ledger.as_ref()
    }

    pub fn journal(&self) -> &StreamJournal {
        &self.journal
    }

    pub fn buffer(&self) -> &Arc<BarBuffer> {
        &self.buffer
    }

    pub fn take_hydration_task(&mut self) -> Option<JoinHandle<()>> {
        self.hydration_task.take()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Time-driven progression. No-op once terminal.
    pub async fn tick(&mut self, now: DateTime<Utc>, ctx: &EngineContext) {
        if self.recovery_pending {
            self.recovery_pending = false;
            self.recover_open_intent(now, ctx).await;
        }
        // Each pass may unlock the next transition; bounded by the number of states.
        for _ in 0..5 {
            if self.state.is_terminal() {
                return;
            }
            if now >= self.window.market_close && self.ledger.is_some() {
                self.conclude_at_market_close(now, ctx).await;
                return;
            }
            let before = self.state;
            match self.state {
                StreamState::PreHydration => self.tick_pre_hydration(now, ctx),
                StreamState::Armed => self.set_state(StreamState::RangeBuilding, "armed past range start", now, ctx),
                StreamState::RangeBuilding => self.tick_range_building(now, ctx).await,
                StreamState::RangeLocked => self.tick_range_locked(now, ctx).await,
                _ => {}
            }
            if self.state == before {
                return;
            }
        }
    }

    fn tick_pre_hydration(&mut self, now: DateTime<Utc>, ctx: &EngineContext) {
        let requested = self
            .hydration_requested_at
            .map_or(self.window.range_start, |at| at.max(self.window.range_start));
        let deadline = requested + ctx.config.hydration_grace();
        let finished = match self.hydration.outcome() {
            HydrationOutcome::Pending if now >= deadline => {
                if !self.hydration_timeout_logged {
                    self.hydration_timeout_logged = true;
                    self.late_history_pending = true;
                    warn!(stream = %self.key, deadline = %deadline, "hydration hard timeout; proceeding");
                }
                true
            }
            HydrationOutcome::Pending => false,
            HydrationOutcome::Completed | HydrationOutcome::Failed => true,
        };
        if finished && now >= self.window.range_start {
            self.set_state(StreamState::Armed, "hydration finished", now, ctx);
        }
    }

    async fn tick_range_building(&mut self, now: DateTime<Utc>, ctx: &EngineContext) {
        if now >= self.window.market_close {
            self.conclude_before_lock(now, ctx).await;
            return;
        }
        if now < self.window.slot_time {
            return;
        }
        self.try_lock(now, ctx).await;
    }

    async fn try_lock(&mut self, now: DateTime<Utc>, ctx: &EngineContext) {
        let bars = self.buffer.window(self.window.range_start, self.window.slot_time);
        let candidate = compute_range(&bars);
        let need = min_bar_count(
            self.window.range_duration(),
            ctx.config.bar_period(),
            ctx.config.min_bar_fraction,
        );
        self.range_preview = candidate;
        let range = match validate_range(&candidate, need) {
            Ok(range) => range,
            Err(rejection) => {
                let restored_locked = self.restored_state.is_some_and(StreamState::was_locked);
                let insufficient = matches!(
                    rejection,
                    RangeRejection::InsufficientBars { .. } | RangeRejection::MissingValues
                );
                if restored_locked && insufficient && self.ledger.is_none() {
                    ctx.incident(
                        Incident::new(
                            now,
                            IncidentKind::ReconstructionInsufficient,
                            format!("{rejection:?} after restart from a locked state"),
                        )
                        .stream(self.key.clone()),
                    );
                    self.set_state(StreamState::Suspended, "range reconstruction insufficient", now, ctx);
                    return;
                }
                if self.last_rejection != Some(rejection) {
                    warn!(stream = %self.key, ?rejection, "range refused lock; retrying next tick");
                    self.last_rejection = Some(rejection);
                }
                return;
            }
        };

        let levels = BreakoutLevels::from_range(&range, self.spec.tick_size);
        self.range = Some(range);
        self.levels = Some(levels);
        info!(
            stream = %self.key,
            high = range.high,
            low = range.low,
            freeze_close = range.freeze_close,
            bar_count = range.bar_count,
            long_level = levels.long,
            short_level = levels.short,
            "range locked"
        );
        emit_quietly(
            &*ctx.audit,
            AuditEvent::RangeLocked {
                ts: now,
                stream: self.key.clone(),
                range,
                levels,
            },
        );
        self.set_state(StreamState::RangeLocked, "range validated", now, ctx);
        self.scan_after_lock(now, ctx).await;
    }

    /// Bars between slot time and now that arrived before the lock.
    async fn scan_after_lock(&mut self, now: DateTime<Utc>, ctx: &EngineContext) {
        if self.ledger.is_some() {
            return;
        }
        let Some(levels) = self.levels else { return };
        let bars: Vec<Bar> = self
            .buffer
            .window(self.window.slot_time, now)
            .into_iter()
            .filter(|b| self.closes_before_market_close(b, ctx))
            .collect();
        if self.late_start {
            if let Some(missed) = first_breakout(&bars, &levels, ctx.config.tie_break) {
                info!(
                    stream = %self.key,
                    direction = ?missed.direction,
                    bar_open = %missed.bar_open,
                    "breakout already happened before start; not entering late"
                );
                self.commit(StreamState::NoTrade, CommitReason::MissedBreakout, now, ctx);
            }
            return;
        }
        for bar in bars {
            if self.ledger.is_some() || self.state.is_terminal() {
                break;
            }
            self.evaluate_breakout(&bar, now, ctx).await;
        }
    }

    async fn tick_range_locked(&mut self, now: DateTime<Utc>, ctx: &EngineContext) {
        if now >= self.window.market_close {
            self.conclude_at_market_close(now, ctx).await;
            return;
        }
        if self.late_history_pending && self.hydration.is_finished() {
            self.late_history_pending = false;
            info!(stream = %self.key, buffered = self.buffer.len(), "late history arrived; rescanning");
            self.scan_after_lock(now, ctx).await;
        }
    }

    /// Feed one bar. Admission is silent bookkeeping; accepted bars may move the
    /// range preview, trigger a breakout, or move the stop to break-even.
    pub async fn on_bar(&mut self, bar: &Bar, now: DateTime<Utc>, ctx: &EngineContext) {
        if self.state.is_terminal() {
            return;
        }
        let admission = self.buffer.admit(bar.clone(), now);
        ctx.stats.lock().bars.record(admission);
        if !admission.accepted() {
            debug!(stream = %self.key, ?admission, ts = %bar.open_timestamp_utc, "bar not admitted");
            return;
        }
        let ts = bar.open_timestamp_utc;
        let in_range = ts >= self.window.range_start && ts < self.window.slot_time;
        match self.state {
            StreamState::PreHydration | StreamState::Armed | StreamState::RangeBuilding if in_range => {
                // Full recompute: late or reordered bars must be reflected up to the lock.
                let bars = self.buffer.window(self.window.range_start, self.window.slot_time);
                self.range_preview = compute_range(&bars);
            }
            StreamState::RangeLocked if ts >= self.window.slot_time => {
                if self.ledger.is_none() {
                    if self.closes_before_market_close(bar, ctx) {
                        self.evaluate_breakout(bar, now, ctx).await;
                    }
                } else {
                    self.check_break_even(bar, now, ctx).await;
                }
            }
            _ => {}
        }
    }

    fn closes_before_market_close(&self, bar: &Bar, ctx: &EngineContext) -> bool {
        bar.open_timestamp_utc + ctx.config.bar_period() <= self.window.market_close
    }

    async fn conclude_before_lock(&mut self, now: DateTime<Utc>, ctx: &EngineContext) {
        if let Some(rejection) = self.last_rejection {
            warn!(stream = %self.key, ?rejection, "market close reached without a valid range");
        }
        self.commit(StreamState::NoTrade, CommitReason::RangeNeverLocked, now, ctx);
    }

    /// Terminal transition that is recorded as concluded in the journal.
    fn commit(&mut self, to: StreamState, reason: CommitReason, now: DateTime<Utc>, ctx: &EngineContext) {
        if self.state.is_terminal() {
            return;
        }
        self.journal.commit(reason, now);
        info!(stream = %self.key, ?reason, state = ?to, "stream committed");
        emit_quietly(
            &*ctx.audit,
            AuditEvent::Committed {
                ts: now,
                stream: self.key.clone(),
                reason,
                state: to,
            },
        );
        self.set_state(to, &format!("{reason:?}"), now, ctx);
    }

    fn set_state(&mut self, to: StreamState, reason: &str, now: DateTime<Utc>, ctx: &EngineContext) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        info!(stream = %self.key, ?from, ?to, reason, "stream transition");
        // A rebuild after restart must not erase the fact that the range was locked,
        // and neither may an uncommitted stand-down.
        let uncommitted_suspend = to == StreamState::Suspended && !self.journal.committed;
        let keeps_locked_marker = self.journal.last_observed_state.was_locked()
            && !to.was_locked()
            && (!to.is_terminal() || uncommitted_suspend);
        if !keeps_locked_marker {
            self.journal.last_observed_state = to;
        }
        self.journal.updated_at = now;
        self.persist_journal(ctx, now);
        emit_quietly(
            &*ctx.audit,
            AuditEvent::Transition {
                ts: now,
                stream: self.key.clone(),
                from,
                to,
                reason: reason.to_string(),
            },
        );
    }

    fn persist_journal(&mut self, ctx: &EngineContext, now: DateTime<Utc>) {
        if !self.journal_writable {
            return;
        }
        if let Err(err) = ctx.journals.save_stream(&self.journal) {
            ctx.incident(
                Incident::new(now, IncidentKind::JournalWriteFailed, err.to_string()).stream(self.key.clone()),
            );
        }
    }

    /// Conclude without an entry because configuration withdrew the stream.
    pub fn disable(&mut self, now: DateTime<Utc>, ctx: &EngineContext) -> bool {
        if self.state.is_terminal() || self.journal.entry_detected {
            return false;
        }
        self.commit(StreamState::NoTrade, CommitReason::DisabledByTimetable, now, ctx);
        true
    }
}
