use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Direction, Instrument, IntentId, StreamId};

/// A fully specified trade. Its id is a hash of every field, so two intents
/// with identical fields are the same intent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub trading_date: NaiveDate,
    pub stream_id: StreamId,
    pub canonical_instrument: Instrument,
    pub session: String,
    pub slot_time: NaiveTime,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub break_even_trigger_price: f64,
    /// Close time of the breakout bar, not wall-clock, so a restart derives the same id.
    pub created_at: DateTime<Utc>,
    pub trigger_reason: String,
}

impl Intent {
    pub fn id(&self) -> IntentId {
        let mut hasher = blake3::Hasher::new();
        for field in self.canonical_fields() {
            hasher.update(field.as_bytes());
            hasher.update(b"\x1f");
        }
        let hex = hasher.finalize().to_hex();
        IntentId(hex.as_str()[..16].to_string())
    }

    fn canonical_fields(&self) -> [String; 12] {
        [
            self.trading_date.format("%Y-%m-%d").to_string(),
            self.stream_id.0.clone(),
            self.canonical_instrument.0.clone(),
            self.session.clone(),
            self.slot_time.format("%H:%M:%S").to_string(),
            self.direction.as_str().to_string(),
            format!("{:.10}", self.entry_price),
            format!("{:.10}", self.stop_price),
            format!("{:.10}", self.target_price),
            format!("{:.10}", self.break_even_trigger_price),
            self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.trigger_reason.clone(),
        ]
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::long_intent;
    use super::*;

    #[test]
    fn identical_fields_collapse_to_one_id() {
        let a = long_intent();
        let b = long_intent();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().0.len(), 16);
    }

    #[test]
    fn every_field_feeds_the_id() {
        let base = long_intent().id();
        let mut changed = long_intent();
        changed.stop_price = 95.25;
        assert_ne!(changed.id(), base);
        let mut changed = long_intent();
        changed.trigger_reason = "OTHER".into();
        assert_ne!(changed.id(), base);
        let mut changed = long_intent();
        changed.direction = Direction::Short;
        assert_ne!(changed.id(), base);
    }
}
