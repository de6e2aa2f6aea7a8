use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::stream::state::{CommitReason, StreamState};
use crate::strategy::range_breakout::{BreakoutLevels, Range};
use crate::types::{Instrument, IntentId, OrderLeg, ProtectiveKind, StreamKey};

pub mod jsonl;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncidentKind {
    OrphanFill,
    ProtectiveFailure,
    FlattenFailure,
    Overfill,
    EntryRejected,
    JournalCorrupt,
    JournalWriteFailed,
    UnprotectedOnRestart,
    ReconstructionInsufficient,
    TimetableRejected,
    GateBlocked,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub ts: DateTime<Utc>,
    pub kind: IncidentKind,
    pub stream: Option<StreamKey>,
    pub intent_id: Option<IntentId>,
    pub instrument: Option<Instrument>,
    pub detail: String,
}

impl Incident {
    pub fn new(ts: DateTime<Utc>, kind: IncidentKind, detail: impl Into<String>) -> Self {
        Self {
            ts,
            kind,
            stream: None,
            intent_id: None,
            instrument: None,
            detail: detail.into(),
        }
    }

    pub fn stream(mut self, key: StreamKey) -> Self {
        self.stream = Some(key);
        self
    }

    pub fn intent(mut self, id: IntentId) -> Self {
        self.intent_id = Some(id);
        self
    }

    pub fn instrument(mut self, instrument: Instrument) -> Self {
        self.instrument = Some(instrument);
        self
    }
}

/// Everything an outside observer needs to reconstruct a trading day offline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AuditEvent {
    Transition {
        ts: DateTime<Utc>,
        stream: StreamKey,
        from: StreamState,
        to: StreamState,
        reason: String,
    },
    RangeLocked {
        ts: DateTime<Utc>,
        stream: StreamKey,
        range: Range,
        levels: BreakoutLevels,
    },
    IntentSubmitted {
        ts: DateTime<Utc>,
        stream: StreamKey,
        intent_id: IntentId,
        quantity: f64,
    },
    IntentAlreadySubmitted {
        ts: DateTime<Utc>,
        stream: StreamKey,
        intent_id: IntentId,
    },
    Fill {
        ts: DateTime<Utc>,
        stream: StreamKey,
        intent_id: IntentId,
        leg: OrderLeg,
        price: f64,
        qty: f64,
    },
    ProtectiveSubmitted {
        ts: DateTime<Utc>,
        stream: StreamKey,
        intent_id: IntentId,
        kind: ProtectiveKind,
        price: f64,
        qty: f64,
        attempts: u32,
    },
    BreakEvenModified {
        ts: DateTime<Utc>,
        stream: StreamKey,
        intent_id: IntentId,
        new_stop: f64,
    },
    Committed {
        ts: DateTime<Utc>,
        stream: StreamKey,
        reason: CommitReason,
        state: StreamState,
    },
    TimetableApplied {
        ts: DateTime<Utc>,
        trading_date: NaiveDate,
        created: usize,
        skipped: usize,
    },
    Incident(Incident),
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent) -> anyhow::Result<()>;
}

/// Mirrors each event into the log as one JSON field under the `audit` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) -> anyhow::Result<()> {
        let line = serde_json::to_string(&event)?;
        info!(target: "audit", event = %line, "audit event");
        Ok(())
    }
}

/// Keeps every event in memory; handy in tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn incidents(&self) -> Vec<Incident> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                AuditEvent::Incident(i) => Some(i.clone()),
                _ => None,
            })
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: AuditEvent) -> anyhow::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Delivers every event to each backend. A failing backend is reported but
/// never keeps the event from the others.
pub struct CompositeAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl CompositeAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for CompositeAuditSink {
    fn emit(&self, event: AuditEvent) -> anyhow::Result<()> {
        let failures: Vec<String> = self
            .sinks
            .iter()
            .filter_map(|sink| sink.emit(event.clone()).err())
            .map(|err| err.to_string())
            .collect();
        if failures.is_empty() {
            return Ok(());
        }
        anyhow::bail!(
            "{} of {} audit sinks failed: {}",
            failures.len(),
            self.sinks.len(),
            failures.join("; ")
        )
    }
}

/// Emit without letting an observer failure change trading decisions.
pub fn emit_quietly(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(err) = sink.emit(event) {
        error!(error = %err, "audit sink failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    struct Broken;

    impl AuditSink for Broken {
        fn emit(&self, _event: AuditEvent) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    fn incident() -> AuditEvent {
        let ts = Utc.with_ymd_and_hms(2025, 7, 1, 14, 0, 0).unwrap();
        AuditEvent::Incident(Incident::new(ts, IncidentKind::GateBlocked, "kill switch engaged"))
    }

    #[test]
    fn composite_keeps_delivering_past_a_failed_backend() {
        let memory = Arc::new(MemoryAuditSink::default());
        let broken: Arc<dyn AuditSink> = Arc::new(Broken);
        let kept: Arc<dyn AuditSink> = memory.clone();
        let composite = CompositeAuditSink::new(vec![broken, kept, Arc::new(TracingAuditSink)]);

        let err = composite.emit(incident()).unwrap_err();
        assert!(err.to_string().contains("1 of 3 audit sinks failed"));
        assert_eq!(memory.events(), vec![incident()]);
        assert_eq!(memory.incidents()[0].kind, IncidentKind::GateBlocked);
    }
}
