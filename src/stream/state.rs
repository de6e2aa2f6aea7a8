use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TimeError;
use crate::instrument::SessionSpec;
use crate::time::TimeService;
use crate::types::StreamIdentity;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    PreHydration,
    Armed,
    RangeBuilding,
    RangeLocked,
    /// Trade taken and closed out (or flattened).
    Done,
    /// Journal showed the occurrence already concluded.
    Committed,
    /// Concluded without a position.
    NoTrade,
    /// Stood down: state could not be trusted or execution failed closed.
    Suspended,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Done | StreamState::Committed | StreamState::NoTrade | StreamState::Suspended
        )
    }

    /// States at or beyond range lock.
    pub fn was_locked(self) -> bool {
        matches!(self, StreamState::RangeLocked | StreamState::Done)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitReason {
    TradeCompleted,
    MarketClose,
    MarketCloseFlattened,
    NoBreakoutBeforeClose,
    RangeNeverLocked,
    MissedBreakout,
    EntryBlocked,
    EntryRejected,
    ProtectiveFailure,
    Overfill,
    UnprotectedOnRestart,
    DisabledByTimetable,
}

/// UTC instants that drive a stream's time-based transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamWindow {
    pub range_start: DateTime<Utc>,
    pub slot_time: DateTime<Utc>,
    pub market_close: DateTime<Utc>,
}

impl StreamWindow {
    pub fn resolve(
        time: &TimeService,
        identity: &StreamIdentity,
        session: &SessionSpec,
    ) -> Result<Self, TimeError> {
        Ok(Self {
            range_start: time.local_to_utc(identity.trading_date, session.range_start)?,
            slot_time: time.local_to_utc(identity.trading_date, identity.slot_time)?,
            market_close: time.local_to_utc(identity.trading_date, session.market_close)?,
        })
    }

    pub fn range_duration(&self) -> chrono::Duration {
        self.slot_time - self.range_start
    }
}
