use chrono::{NaiveDate, NaiveTime};
use std::path::PathBuf;

use crate::types::{Instrument, IntentId};

/// Engine-wide configuration problems. Any of these stands the whole engine down.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("timetable timezone {found:?} does not match engine timezone {expected:?}")]
    TimezoneMismatch { expected: String, found: String },
    #[error("unknown timezone {0:?}")]
    InvalidTimezone(String),
    #[error("timetable trading date {found} is stale (engine trading date {expected})")]
    StaleTradingDate { expected: NaiveDate, found: NaiveDate },
    #[error("duplicate instrument spec for {0}")]
    DuplicateInstrument(Instrument),
    #[error("invalid instrument spec for {instrument}: {reason}")]
    InvalidInstrument { instrument: Instrument, reason: String },
}

/// Problems with a single timetable entry. Only that stream is skipped.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("unknown instrument {0}")]
    UnknownInstrument(Instrument),
    #[error("instrument {instrument} has no session {session:?}")]
    UnknownSession { instrument: Instrument, session: String },
    #[error("slot time {slot} is not allowed for session {session:?}")]
    SlotNotAllowed { session: String, slot: NaiveTime },
    #[error("slot time {slot} is outside the session window for {session:?}")]
    SlotOutsideSession { session: String, slot: NaiveTime },
    #[error("empty stream id")]
    EmptyStreamId,
    #[error(transparent)]
    Time(#[from] TimeError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeError {
    #[error("local time {date} {time} does not exist in {tz}")]
    NonexistentLocalTime {
        date: NaiveDate,
        time: NaiveTime,
        tz: String,
    },
}

/// Persistence failures. Corruption is never read as "nothing recorded yet".
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt journal at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("adapter unavailable: {0}")]
    Unavailable(String),
    #[error("unknown intent {0}")]
    UnknownIntent(IntentId),
}

/// Fill-accounting violations on an execution journal entry.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AccountingError {
    #[error("exit quantity {exit_qty} would exceed entry quantity {entry_qty}")]
    Overfill { entry_qty: f64, exit_qty: f64 },
    #[error("exit fill recorded before any entry fill")]
    ExitBeforeEntry,
    #[error("non-positive fill quantity {0}")]
    InvalidQuantity(f64),
}
