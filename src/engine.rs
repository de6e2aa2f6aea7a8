//! Top-level driver.
//!
//! Owns every stream of the current trading date and serializes all inputs
//! through `&mut self`: timetable application, ticks, bars and fill routing.
//! Fills arrive on any thread through the [`ExecutionBoundary`] and are drained
//! after every operation, so stream state is only ever touched from here.

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::audit::{emit_quietly, AuditEvent, AuditSink, Incident, IncidentKind};
use crate::config::EngineConfig;
use crate::error::{ConfigError, SetupError};
use crate::execution::{ExecutionAdapter, ExecutionBoundary};
use crate::hydration::source::{HistoricalBarSource, Hydrator};
use crate::instrument::InstrumentRegistry;
use crate::journal::JournalStore;
use crate::metrics::EngineStats;
use crate::risk::{KillSwitch, RiskGate};
use crate::stream::StreamStateMachine;
use crate::time::TimeService;
use crate::types::{Bar, Instrument, StreamId, StreamIdentity, StreamKey};

/// Fill drain rounds per operation; a fill can trigger orders that fill instantly.
const MAX_FILL_ROUNDS: usize = 16;

/// Shared, read-mostly context handed to every stream call.
pub struct EngineContext {
    pub config: EngineConfig,
    pub time: TimeService,
    pub instruments: InstrumentRegistry,
    pub journals: JournalStore,
    pub boundary: Arc<ExecutionBoundary>,
    pub adapter: Arc<dyn ExecutionAdapter>,
    pub kill_switch: Arc<dyn KillSwitch>,
    pub hydrator: Hydrator,
    pub audit: Arc<dyn AuditSink>,
    pub gate: RiskGate,
    pub stats: Mutex<EngineStats>,
    /// Cleared whenever a timetable is rejected or the trading date rolls.
    pub timetable_valid: bool,
}

impl EngineContext {
    pub fn incident(&self, incident: Incident) {
        error!(
            kind = ?incident.kind,
            stream = ?incident.stream.as_ref().map(ToString::to_string),
            intent_id = ?incident.intent_id,
            instrument = ?incident.instrument,
            detail = %incident.detail,
            "incident"
        );
        self.stats.lock().execution.incidents += 1;
        emit_quietly(&*self.audit, AuditEvent::Incident(incident));
    }
}

/// External collaborators the engine is wired to.
pub struct EngineDeps {
    pub boundary: Arc<ExecutionBoundary>,
    pub adapter: Arc<dyn ExecutionAdapter>,
    pub kill_switch: Arc<dyn KillSwitch>,
    pub bar_source: Arc<dyn HistoricalBarSource>,
    pub audit: Arc<dyn AuditSink>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimetableEntry {
    pub stream_id: StreamId,
    /// Quoted or canonical symbol; resolved to the canonical instrument.
    pub instrument: Instrument,
    /// Traded symbol, defaults to `instrument`.
    #[serde(default)]
    pub execution_instrument: Option<Instrument>,
    pub session: String,
    pub slot_time: NaiveTime,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Which streams run today. Re-applying is idempotent for streams that exist.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Timetable {
    pub trading_date: NaiveDate,
    pub timezone: String,
    pub streams: Vec<TimetableEntry>,
}

impl Timetable {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading timetable {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing timetable {}", path.display()))
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimetableReport {
    pub created: Vec<StreamKey>,
    pub disabled: Vec<StreamKey>,
    pub skipped: Vec<(StreamId, String)>,
}

pub struct Engine {
    ctx: EngineContext,
    streams: BTreeMap<StreamKey, StreamStateMachine>,
    trading_date: Option<NaiveDate>,
}

impl Engine {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> anyhow::Result<Self> {
        let time = TimeService::from_name(&config.timezone)?;
        let instruments = InstrumentRegistry::new(config.instruments.clone())?;
        let journals = JournalStore::open(&config.journal_dir)
            .with_context(|| format!("opening journal root {}", config.journal_dir.display()))?;
        info!(
            timezone = time.tz_name(),
            journal = %config.journal_dir.display(),
            instruments = config.instruments.len(),
            "engine configured"
        );
        Ok(Self {
            ctx: EngineContext {
                config,
                time,
                instruments,
                journals,
                boundary: deps.boundary,
                adapter: deps.adapter,
                kill_switch: deps.kill_switch,
                hydrator: Hydrator::new(deps.bar_source),
                audit: deps.audit,
                gate: RiskGate,
                stats: Mutex::new(EngineStats::default()),
                timetable_valid: false,
            },
            streams: BTreeMap::new(),
            trading_date: None,
        })
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn stream(&self, key: &StreamKey) -> Option<&StreamStateMachine> {
        self.streams.get(key)
    }

    pub fn streams(&self) -> impl Iterator<Item = &StreamStateMachine> {
        self.streams.values()
    }

    pub fn trading_date(&self) -> Option<NaiveDate> {
        self.trading_date
    }

    pub fn timetable_valid(&self) -> bool {
        self.ctx.timetable_valid
    }

    pub fn stats_snapshot(&self) -> BTreeMap<String, String> {
        let mut kv = self.ctx.stats.lock().snapshot_kv();
        kv.insert("streams".into(), self.streams.len().to_string());
        for stream in self.streams.values() {
            kv.insert(format!("stream.{}", stream.key()), format!("{:?}", stream.state()));
        }
        kv
    }

    /// Validate and apply a timetable. A timezone or date mismatch rejects the
    /// whole timetable and stands execution down; a bad entry only skips itself.
    pub async fn apply_timetable(&mut self, timetable: &Timetable, now: DateTime<Utc>) -> Result<TimetableReport, ConfigError> {
        self.roll_if_needed(now);
        let today = self.ctx.time.trading_date(now);
        let expected_tz = self.ctx.time.tz_name();
        let rejection = if timetable.timezone != expected_tz {
            Some(ConfigError::TimezoneMismatch {
                expected: expected_tz.to_string(),
                found: timetable.timezone.clone(),
            })
        } else if timetable.trading_date != today {
            Some(ConfigError::StaleTradingDate {
                expected: today,
                found: timetable.trading_date,
            })
        } else {
            None
        };
        if let Some(err) = rejection {
            self.ctx.timetable_valid = false;
            self.ctx
                .incident(Incident::new(now, IncidentKind::TimetableRejected, err.to_string()));
            return Err(err);
        }
        self.ctx.timetable_valid = true;

        let mut report = TimetableReport::default();
        for entry in &timetable.streams {
            let key = StreamKey {
                trading_date: today,
                stream_id: entry.stream_id.clone(),
            };
            if let Some(existing) = self.streams.get_mut(&key) {
                if !entry.enabled {
                    if existing.disable(now, &self.ctx) {
                        report.disabled.push(key);
                    }
                    continue;
                }
                let id = existing.identity();
                let changed = self.ctx.instruments.canonical_for(&entry.instrument) != Some(&id.canonical_instrument)
                    || entry.session != id.session
                    || entry.slot_time != id.slot_time;
                if changed {
                    warn!(stream = %key, "timetable changes an existing stream's identity; ignored");
                }
                continue;
            }
            if !entry.enabled {
                debug!(stream = %key, "stream disabled in timetable");
                continue;
            }
            match self.create_stream(entry, today, now) {
                Ok(machine) => {
                    info!(stream = %key, state = ?machine.state(), "stream created");
                    self.streams.insert(key.clone(), machine);
                    report.created.push(key);
                }
                Err(err) => {
                    warn!(stream_id = %entry.stream_id, error = %err, "timetable entry skipped");
                    report.skipped.push((entry.stream_id.clone(), err.to_string()));
                }
            }
        }
        emit_quietly(
            &*self.ctx.audit,
            AuditEvent::TimetableApplied {
                ts: now,
                trading_date: today,
                created: report.created.len(),
                skipped: report.skipped.len(),
            },
        );
        self.process_fills(now).await;
        Ok(report)
    }

    fn create_stream(&self, entry: &TimetableEntry, today: NaiveDate, now: DateTime<Utc>) -> Result<StreamStateMachine, SetupError> {
        if entry.stream_id.0.trim().is_empty() {
            return Err(SetupError::EmptyStreamId);
        }
        let canonical = self
            .ctx
            .instruments
            .canonical_for(&entry.instrument)
            .cloned()
            .ok_or_else(|| SetupError::UnknownInstrument(entry.instrument.clone()))?;
        let identity = StreamIdentity {
            trading_date: today,
            stream_id: entry.stream_id.clone(),
            canonical_instrument: canonical,
            execution_instrument: entry
                .execution_instrument
                .clone()
                .unwrap_or_else(|| entry.instrument.clone()),
            session: entry.session.clone(),
            slot_time: entry.slot_time,
        };
        StreamStateMachine::new(identity, &self.ctx, now)
    }

    pub async fn tick(&mut self, now: DateTime<Utc>) {
        self.roll_if_needed(now);
        self.process_fills(now).await;
        for stream in self.streams.values_mut() {
            stream.tick(now, &self.ctx).await;
        }
        self.process_fills(now).await;
    }

    /// Route a bar to every stream on its canonical instrument.
    pub async fn on_bar(&mut self, bar: &Bar, now: DateTime<Utc>) {
        self.roll_if_needed(now);
        let Some(canonical) = self.ctx.instruments.canonical_for(&bar.instrument).cloned() else {
            self.ctx.stats.lock().bars.unrouted += 1;
            debug!(instrument = %bar.instrument, "bar for unknown instrument");
            return;
        };
        let mut bar = bar.clone();
        bar.instrument = canonical;
        let mut routed = false;
        for stream in self.streams.values_mut() {
            if stream.identity().canonical_instrument == bar.instrument {
                routed = true;
                stream.on_bar(&bar, now, &self.ctx).await;
            }
        }
        if !routed {
            self.ctx.stats.lock().bars.unrouted += 1;
        }
        self.process_fills(now).await;
    }

    /// Drain the boundary and hand each fill to its owning stream.
    pub async fn process_fills(&mut self, now: DateTime<Utc>) {
        for _ in 0..MAX_FILL_ROUNDS {
            for incident in self.ctx.boundary.drain_incidents() {
                self.ctx.incident(incident);
            }
            let fills = self.ctx.boundary.drain_fills();
            if fills.is_empty() {
                return;
            }
            for fill in fills {
                let key = fill.stream_key();
                match self.streams.get_mut(&key) {
                    Some(stream) => stream.on_fill(&fill, now, &self.ctx).await,
                    None => {
                        self.ctx.boundary.block_instrument(fill.instrument.clone());
                        self.ctx.incident(
                            Incident::new(
                                fill.ts,
                                IncidentKind::OrphanFill,
                                format!("{:?} fill for stream {key} not loaded; instrument blocked", fill.leg),
                            )
                            .stream(key)
                            .intent(fill.intent_id.clone())
                            .instrument(fill.instrument.clone()),
                        );
                    }
                }
            }
        }
        warn!(rounds = MAX_FILL_ROUNDS, "fill drain did not settle; continuing next operation");
    }

    /// Await every outstanding historical request.
    pub async fn join_hydration(&mut self) {
        for stream in self.streams.values_mut() {
            if let Some(task) = stream.take_hydration_task() {
                if let Err(err) = task.await {
                    warn!(stream = %stream.key(), error = %err, "hydration task aborted");
                }
            }
        }
    }

    fn roll_if_needed(&mut self, now: DateTime<Utc>) {
        let date = self.ctx.time.trading_date(now);
        match self.trading_date {
            Some(current) if current == date => {}
            Some(current) => {
                info!(from = %current, to = %date, streams = self.streams.len(), "trading date rolled; dropping streams");
                self.streams.clear();
                self.ctx.timetable_valid = false;
                self.trading_date = Some(date);
            }
            None => self.trading_date = Some(date),
        }
    }

    /// Live loop: bars from `bars`, ticks on the configured cadence, until the
    /// channel closes or ctrl-c.
    pub async fn run(&mut self, mut bars: mpsc::Receiver<Bar>) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.ctx.config.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(Utc::now()).await,
                bar = bars.recv() => match bar {
                    Some(bar) => self.on_bar(&bar, Utc::now()).await,
                    None => {
                        info!("bar feed closed");
                        break;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }
        Ok(())
    }
}
