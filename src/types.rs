use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Instrument(pub String);

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(pub String);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic identity of an [`crate::intent::Intent`]; doubles as the order tag prefix.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IntentId(pub String);

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }
}

/// Where a bar came from. Ordering is precedence: a higher variant wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BarSource {
    FileReplay,
    HistoricalRequest,
    Live,
}

impl BarSource {
    pub fn precedence(self) -> u8 {
        match self {
            BarSource::FileReplay => 0,
            BarSource::HistoricalRequest => 1,
            BarSource::Live => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub instrument: Instrument,
    pub open_timestamp_utc: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub source: BarSource,
}

/// Immutable key of one stream occurrence. Keys every journal lookup.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamIdentity {
    pub trading_date: NaiveDate,
    pub stream_id: StreamId,
    pub canonical_instrument: Instrument,
    pub execution_instrument: Instrument,
    pub session: String,
    /// Local time in the engine reference timezone.
    pub slot_time: NaiveTime,
}

impl StreamIdentity {
    pub fn key(&self) -> StreamKey {
        StreamKey {
            trading_date: self.trading_date,
            stream_id: self.stream_id.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub trading_date: NaiveDate,
    pub stream_id: StreamId,
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.trading_date.format("%Y-%m-%d"), self.stream_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtectiveKind {
    Stop,
    Target,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OrderLeg {
    Entry,
    Stop,
    Target,
    Flatten,
}

impl OrderLeg {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderLeg::Entry => "ENTRY",
            OrderLeg::Stop => "STOP",
            OrderLeg::Target => "TARGET",
            OrderLeg::Flatten => "FLATTEN",
        }
    }

    pub fn is_exit(self) -> bool {
        !matches!(self, OrderLeg::Entry)
    }
}

impl From<ProtectiveKind> for OrderLeg {
    fn from(kind: ProtectiveKind) -> Self {
        match kind {
            ProtectiveKind::Stop => OrderLeg::Stop,
            ProtectiveKind::Target => OrderLeg::Target,
        }
    }
}

/// `order_tag` carried by every order: `<intent_id>:<LEG>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderTag {
    pub intent_id: IntentId,
    pub leg: OrderLeg,
}

impl OrderTag {
    pub fn new(intent_id: IntentId, leg: OrderLeg) -> Self {
        Self { intent_id, leg }
    }
}

impl fmt::Display for OrderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.intent_id, self.leg.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("malformed order tag: {0:?}")]
pub struct MalformedTag(pub String);

impl FromStr for OrderTag {
    type Err = MalformedTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, leg) = s.rsplit_once(':').ok_or_else(|| MalformedTag(s.to_string()))?;
        if id.is_empty() {
            return Err(MalformedTag(s.to_string()));
        }
        let leg = match leg {
            "ENTRY" => OrderLeg::Entry,
            "STOP" => OrderLeg::Stop,
            "TARGET" => OrderLeg::Target,
            "FLATTEN" => OrderLeg::Flatten,
            _ => return Err(MalformedTag(s.to_string())),
        };
        Ok(Self {
            intent_id: IntentId(id.to_string()),
            leg,
        })
    }
}

/// Round `price` to the nearest multiple of `tick`.
pub fn round_to_tick(price: f64, tick: f64) -> f64 {
    if !(tick.is_finite() && tick > 0.0) {
        return price;
    }
    let ticks = (price / tick).round();
    // Re-derive through the tick count so repeated rounding is stable.
    (ticks * tick * 1e9).round() / 1e9
}
