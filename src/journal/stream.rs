use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::stream::state::{CommitReason, StreamState};
use crate::types::StreamId;

/// Minimal per-stream recovery record. The only state carried across restarts;
/// everything else is recomputed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamJournal {
    pub trading_date: NaiveDate,
    pub stream_id: StreamId,
    pub committed: bool,
    pub commit_reason: Option<CommitReason>,
    pub last_observed_state: StreamState,
    pub protective_orders_submitted: bool,
    pub entry_detected: bool,
    pub updated_at: DateTime<Utc>,
}

impl StreamJournal {
    pub fn new(trading_date: NaiveDate, stream_id: StreamId, now: DateTime<Utc>) -> Self {
        Self {
            trading_date,
            stream_id,
            committed: false,
            commit_reason: None,
            last_observed_state: StreamState::PreHydration,
            protective_orders_submitted: false,
            entry_detected: false,
            updated_at: now,
        }
    }

    /// Set-once: a committed journal keeps its first reason.
    pub fn commit(&mut self, reason: CommitReason, now: DateTime<Utc>) {
        if self.committed {
            return;
        }
        self.committed = true;
        self.commit_reason = Some(reason);
        self.updated_at = now;
    }
}
