//! `Sink` implementation backed by a bounded channel feeding an SSE stream.
//!
//! §5 requires a sink never block a slow peer for long and report overflow
//! as failure so the Connection Manager can detach it; `try_send` against a
//! bounded channel gives both for free.

use std::sync::Arc;

use async_trait::async_trait;
use axum::response::sse::Event;
use hub_common::model::SinkResult;
use hub_common::Sink;
use serde_json::Value;
use tokio::sync::mpsc;

/// Outbound buffer depth per subscriber before writes start failing.
pub const SSE_BUFFER_SIZE: usize = 256;

/// One subscriber's outbound half. `write` encodes the wire format from §6
/// (`event: <topic>\ndata: <json>\n\n`) via axum's `Event` builder.
pub struct SseSink {
    tx: mpsc::Sender<Event>,
}

impl SseSink {
    /// Build a sink paired with the receiver the SSE response streams from.
    pub fn channel() -> (Arc<Self>, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(SSE_BUFFER_SIZE);
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl Sink for SseSink {
    async fn write(&self, event_name: &str, payload: Value) -> SinkResult {
        let event = Event::default().event(event_name).data(payload.to_string());
        self.tx.try_send(event)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn write_delivers_an_event_to_the_receiver() {
        let (sink, mut rx) = SseSink::channel();
        sink.write("qbittorrent:abc", json!({"torrents": []})).await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn write_fails_once_the_buffer_is_full() {
        let (tx, rx) = mpsc::channel(1);
        let sink = Arc::new(SseSink { tx });
        sink.write("a", json!({})).await.unwrap();
        assert!(sink.write("a", json!({})).await.is_err());
        drop(rx);
    }
}
