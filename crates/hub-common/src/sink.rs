//! The subscriber sink contract (§3): the only thing the core knows about a
//! transport. A transport (SSE, a test harness, ...) implements this trait;
//! the core never depends on the transport's own types.

use async_trait::async_trait;
use serde_json::Value;

use crate::model::SinkResult;

/// A writable endpoint for one attached subscriber.
///
/// `write` must never block on a slow peer for long: implementations are
/// expected to use a bounded outbound buffer and report overflow as failure
/// (§5), at which point the Connection Manager detaches the subscriber.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Write one named event with a JSON payload.
    async fn write(&self, event_name: &str, payload: Value) -> SinkResult;
}
