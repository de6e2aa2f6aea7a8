use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::types::*;

/// Raw fill as delivered by the broker callback.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    /// `<intent_id>:<LEG>`, see [`OrderTag`].
    pub order_tag: String,
    pub fill_price: f64,
    /// Quantity of this fill only, not cumulative.
    pub fill_qty: f64,
    pub timestamp: DateTime<Utc>,
}

/// A fill attributed to its stream, intent and leg.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolvedFill {
    pub trading_date: NaiveDate,
    pub stream_id: StreamId,
    pub intent_id: IntentId,
    pub leg: OrderLeg,
    pub direction: Direction,
    pub instrument: Instrument,
    pub contract_multiplier: f64,
    pub price: f64,
    pub qty: f64,
    pub ts: DateTime<Utc>,
}

impl ResolvedFill {
    pub fn stream_key(&self) -> StreamKey {
        StreamKey {
            trading_date: self.trading_date,
            stream_id: self.stream_id.clone(),
        }
    }
}

/// An order request handed to the execution adapter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryOrder {
    pub instrument: Instrument,
    pub direction: Direction,
    pub price: f64,
    pub qty: f64,
    pub intent_id: IntentId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlattenTarget {
    Intent(IntentId),
    Instrument(Instrument),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub tag: String,
    pub ts: DateTime<Utc>,
}
