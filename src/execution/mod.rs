use async_trait::async_trait;

use crate::error::ExecutionError;
use crate::events::{EntryOrder, FlattenTarget, OrderAck};
use crate::types::{IntentId, OrderLeg, ProtectiveKind};

pub mod boundary;
pub mod simulated;

pub use boundary::{ExecutionBoundary, FillRouting, IntentRegistration};

/// Broker-facing order port. Calls are expected to return quickly; callers
/// retry a bounded number of times. Fills never come back through these
/// calls: they arrive asynchronously through [`ExecutionBoundary::on_fill`].
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    async fn submit_entry(&self, order: EntryOrder) -> Result<OrderAck, ExecutionError>;

    async fn submit_protective(
        &self,
        intent_id: &IntentId,
        kind: ProtectiveKind,
        price: f64,
        qty: f64,
    ) -> Result<OrderAck, ExecutionError>;

    async fn modify_stop(&self, intent_id: &IntentId, new_price: f64) -> Result<OrderAck, ExecutionError>;

    async fn flatten(&self, target: FlattenTarget) -> Result<OrderAck, ExecutionError>;

    async fn cancel(&self, intent_id: &IntentId, leg: OrderLeg) -> Result<OrderAck, ExecutionError>;
}
