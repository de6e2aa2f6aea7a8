#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use range_breakout_bot::audit::{AuditSink, IncidentKind, MemoryAuditSink};
use range_breakout_bot::execution::simulated::{SimConfig, SimulatedAdapter};
use range_breakout_bot::execution::ExecutionBoundary;
use range_breakout_bot::hydration::source::{HistoricalBarSource, InMemoryBarSource};
use range_breakout_bot::instrument::{InstrumentSpec, SessionSpec};
use range_breakout_bot::journal::ExecutionJournalEntry;
use range_breakout_bot::risk::{KillSwitch, StaticKillSwitch};
use range_breakout_bot::stream::StreamStateMachine;
use range_breakout_bot::types::{Bar, BarSource, Instrument, StreamId, StreamKey};
use range_breakout_bot::{Engine, EngineConfig, EngineDeps, Timetable, TimetableEntry};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Notify;

pub const TZ: &str = "America/Chicago";

pub fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 7, 1).unwrap()
}

/// 2025-07-01 is CDT: local = UTC - 5h. Range 08:00-09:00 local is 13:00-14:00 UTC.
pub fn utc(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 7, 1, h, m, 0).unwrap()
}

pub fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

pub fn key() -> StreamKey {
    StreamKey {
        trading_date: date(),
        stream_id: StreamId("ES1".into()),
    }
}

pub fn es_spec() -> InstrumentSpec {
    InstrumentSpec {
        canonical: Instrument("ES".into()),
        aliases: vec![Instrument("MES".into())],
        tick_size: 0.25,
        contract_multiplier: 50.0,
        target_points: 10.0,
        stop_cap_points: None,
        base_quantity: 2.0,
        sessions: vec![SessionSpec {
            name: "S1".into(),
            range_start: hm(8, 0),
            market_close: hm(15, 0),
            allowed_slots: vec![hm(9, 0), hm(9, 30)],
        }],
    }
}

pub fn config(journal_dir: &Path) -> EngineConfig {
    EngineConfig {
        timezone: TZ.into(),
        bar_period_secs: 300,
        hydration_grace_secs: 60,
        protective_backoff_ms: 0,
        journal_dir: journal_dir.to_path_buf(),
        instruments: vec![es_spec()],
        ..EngineConfig::default()
    }
}

pub fn entry(id: &str) -> TimetableEntry {
    TimetableEntry {
        stream_id: StreamId(id.into()),
        instrument: Instrument("ES".into()),
        execution_instrument: None,
        session: "S1".into(),
        slot_time: hm(9, 0),
        enabled: true,
    }
}

pub fn timetable() -> Timetable {
    Timetable {
        trading_date: date(),
        timezone: TZ.into(),
        streams: vec![entry("ES1")],
    }
}

pub fn bar(h: u32, m: u32, high: f64, low: f64, close: f64) -> Bar {
    Bar {
        instrument: Instrument("ES".into()),
        open_timestamp_utc: utc(h, m),
        open: close,
        high,
        low,
        close,
        source: BarSource::Live,
    }
}

/// Twelve 5-minute bars from 13:00 to 13:55 UTC. High 105 at 13:15, low 95 at 13:35,
/// last close 101.
pub fn range_bars() -> Vec<Bar> {
    (0..12)
        .map(|i| {
            let m = i * 5;
            let high = if i == 3 { 105.0 } else { 102.0 };
            let low = if i == 7 { 95.0 } else { 98.0 };
            let close = if i == 11 { 101.0 } else { 100.0 };
            bar(13, m, high, low, close)
        })
        .collect()
}

/// Pierces the long level (105.25) only.
pub fn long_breakout_bar(h: u32, m: u32) -> Bar {
    bar(h, m, 106.0, 100.0, 105.5)
}

pub fn quiet_bar(h: u32, m: u32) -> Bar {
    bar(h, m, 103.0, 97.0, 100.0)
}

/// Historical source that holds every request until [`GatedBarSource::release`].
pub struct GatedBarSource {
    inner: Arc<InMemoryBarSource>,
    gate: Notify,
}

impl GatedBarSource {
    pub fn new(inner: Arc<InMemoryBarSource>) -> Self {
        Self {
            inner,
            gate: Notify::new(),
        }
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl HistoricalBarSource for GatedBarSource {
    async fn request(
        &self,
        instrument: &Instrument,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Bar>> {
        self.gate.notified().await;
        self.inner.request(instrument, from, to).await
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub boundary: Arc<ExecutionBoundary>,
    pub sim: Arc<SimulatedAdapter>,
    pub kill: Arc<StaticKillSwitch>,
    pub history: Arc<InMemoryBarSource>,
    pub gate: Option<Arc<GatedBarSource>>,
    pub audit: Arc<MemoryAuditSink>,
    pub engine: Engine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(tempfile::tempdir().unwrap(), Vec::new(), |_| {})
    }

    /// Fresh process over an existing journal root, as after a crash.
    pub fn with(dir: tempfile::TempDir, history: Vec<Bar>, tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        let kill = Arc::new(StaticKillSwitch::new(false));
        Self::with_kill_switch(dir, history, kill.clone(), kill, tweak)
    }

    pub fn with_kill_switch(
        dir: tempfile::TempDir,
        history: Vec<Bar>,
        kill: Arc<StaticKillSwitch>,
        switch: Arc<dyn KillSwitch>,
        tweak: impl FnOnce(&mut EngineConfig),
    ) -> Self {
        Self::build(dir, Arc::new(InMemoryBarSource::new(history)), None, kill, switch, tweak)
    }

    /// Historical requests stay pending until `gate.release()`.
    pub fn with_gated_history(
        dir: tempfile::TempDir,
        history: Vec<Bar>,
        tweak: impl FnOnce(&mut EngineConfig),
    ) -> Self {
        let history = Arc::new(InMemoryBarSource::new(history));
        let gate = Arc::new(GatedBarSource::new(history.clone()));
        let kill = Arc::new(StaticKillSwitch::new(false));
        Self::build(dir, history, Some(gate), kill.clone(), kill, tweak)
    }

    fn build(
        dir: tempfile::TempDir,
        history: Arc<InMemoryBarSource>,
        gate: Option<Arc<GatedBarSource>>,
        kill: Arc<StaticKillSwitch>,
        switch: Arc<dyn KillSwitch>,
        tweak: impl FnOnce(&mut EngineConfig),
    ) -> Self {
        let mut cfg = config(dir.path());
        tweak(&mut cfg);
        let boundary = Arc::new(ExecutionBoundary::new());
        let sim = Arc::new(SimulatedAdapter::new(
            boundary.clone(),
            SimConfig {
                instant_entry_fill: true,
                ..SimConfig::default()
            },
        ));
        let bar_source: Arc<dyn HistoricalBarSource> = match &gate {
            Some(gate) => gate.clone(),
            None => history.clone(),
        };
        let audit = Arc::new(MemoryAuditSink::default());
        let audit_sink: Arc<dyn AuditSink> = audit.clone();
        let engine = Engine::new(
            cfg,
            EngineDeps {
                boundary: boundary.clone(),
                adapter: sim.clone(),
                kill_switch: switch,
                bar_source,
                audit: audit_sink,
            },
        )
        .unwrap();
        Self {
            dir,
            boundary,
            sim,
            kill,
            history,
            gate,
            audit,
            engine,
        }
    }

    /// Tear down the process but keep the journal directory.
    pub fn crash(self) -> tempfile::TempDir {
        self.dir
    }

    pub async fn start(&mut self, now: DateTime<Utc>) {
        self.apply(now).await;
        self.engine.join_hydration().await;
    }

    /// Apply the timetable without waiting for historical requests.
    pub async fn apply(&mut self, now: DateTime<Utc>) {
        self.sim.set_clock(now);
        self.engine.apply_timetable(&timetable(), now).await.unwrap();
    }

    /// Deliver a completed bar the way the live feed does: at its close.
    pub async fn feed(&mut self, bar: &Bar) {
        let now = bar.open_timestamp_utc + chrono::Duration::minutes(5);
        self.sim.set_clock(now);
        self.sim.on_bar(bar);
        self.engine.on_bar(bar, now).await;
        self.engine.tick(now).await;
    }

    pub async fn feed_all(&mut self, bars: &[Bar]) {
        for b in bars {
            self.feed(b).await;
        }
    }

    pub async fn tick(&mut self, now: DateTime<Utc>) {
        self.sim.set_clock(now);
        self.engine.tick(now).await;
    }

    pub fn stream(&self) -> &StreamStateMachine {
        self.engine.stream(&key()).expect("stream ES1 exists")
    }

    pub fn ledger(&self) -> ExecutionJournalEntry {
        self.stream().ledger().cloned().expect("stream has an intent")
    }

    pub fn incident_kinds(&self) -> Vec<IncidentKind> {
        self.audit.incidents().iter().map(|i| i.kind).collect()
    }

    /// Range built, locked at 14:00 UTC, long breakout on the 14:00 bar.
    pub async fn run_to_entry(&mut self) {
        self.start(utc(12, 55)).await;
        self.feed_all(&range_bars()).await;
        self.feed(&long_breakout_bar(14, 0)).await;
    }
}
