//! Outbound plumbing: pooled serialization buffers and the
//! stream-event-to-notification bridge.
//!
//! Every outgoing line (response or notification) is rendered into a
//! recycled buffer and funneled through one writer channel, which both
//! caps allocation churn on the token hot path and serializes stdout
//! writes.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use super::protocol::notification;
use crate::scheduler::streaming::{StreamEvent, StreamReceiver};

/// Recycled serialization buffers for outbound lines.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(max_pooled: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
        }
    }

    pub fn acquire(&self) -> Vec<u8> {
        self.free.lock().pop().unwrap_or_default()
    }

    /// Return a buffer for reuse; surplus buffers are simply dropped.
    pub fn release(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(buffer);
        }
    }
}

/// Handle for emitting wire lines from anywhere in the runtime.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Outbound {
    pub fn new(tx: mpsc::UnboundedSender<Vec<u8>>, pool: Arc<BufferPool>) -> Self {
        Self { tx, pool }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Serialize one value as a line and queue it for the writer.
    pub fn send<T: Serialize>(&self, value: &T) {
        let mut buffer = self.pool.acquire();
        if let Err(e) = serde_json::to_writer(&mut buffer, value) {
            tracing::error!(error = %e, "failed to serialize outbound message");
            self.pool.release(buffer);
            return;
        }
        if self.tx.send(buffer).is_err() {
            tracing::debug!("outbound writer gone, dropping message");
        }
    }
}

/// Forward one stream's events to the wire until its terminal event.
///
/// Emits `stream.chunk` per token, then `stream.stats` and the final
/// `stream.event`. Within a stream, tokens always precede completion
/// because both travel the same channel.
pub async fn forward_stream(stream_id: String, mut events: StreamReceiver, outbound: Outbound) {
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Token { token_id, text } => {
                outbound.send(&notification(
                    "stream.chunk",
                    serde_json::json!({
                        "stream_id": stream_id,
                        "token": text,
                        "token_id": token_id,
                        "is_final": false,
                    }),
                ));
            }
            StreamEvent::Complete(stats) => {
                outbound.send(&notification(
                    "stream.stats",
                    serde_json::json!({
                        "stream_id": stream_id,
                        "tokens_generated": stats.tokens_generated,
                        "tokens_per_second": stats.tokens_per_sec,
                        "time_to_first_token": stats.ttft_ms / 1000.0,
                        "total_time": stats.duration_ms / 1000.0,
                    }),
                ));
                let mut params = serde_json::json!({
                    "stream_id": stream_id,
                    "event": stats.finish_reason.event_name(),
                    "is_final": true,
                    "finish_reason": stats.finish_reason.as_str(),
                });
                if let Some(error) = &stats.error {
                    params["error"] = serde_json::Value::String(error.clone());
                }
                outbound.send(&notification("stream.event", params));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::streaming::{stream_channel, CompletionStats, FinishReason};
    use std::time::Duration;

    #[test]
    fn test_pool_recycles_buffers() {
        let pool = BufferPool::new(2);
        let mut buffer = pool.acquire();
        buffer.extend_from_slice(b"data");
        pool.release(buffer);

        let reused = pool.acquire();
        assert!(reused.is_empty());
        assert!(reused.capacity() >= 4);
    }

    #[test]
    fn test_pool_caps_retained_buffers() {
        let pool = BufferPool::new(1);
        pool.release(Vec::with_capacity(64));
        pool.release(Vec::with_capacity(64));
        assert!(pool.free.lock().len() <= 1);
    }

    #[tokio::test]
    async fn test_forward_stream_emits_chunk_stats_event() {
        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        let outbound = Outbound::new(line_tx, Arc::new(BufferPool::new(8)));
        let (tx, rx) = stream_channel(16, Duration::from_millis(50));

        let forwarder = tokio::spawn(forward_stream("s1".to_string(), rx, outbound));

        tx.send(StreamEvent::Token { token_id: 5, text: "hi".into() }).await.unwrap();
        tx.send(StreamEvent::Complete(CompletionStats {
            finish_reason: FinishReason::Length,
            tokens_generated: 1,
            duration_ms: 100.0,
            ttft_ms: 20.0,
            tokens_per_sec: 10.0,
            error: None,
        }))
        .await
        .unwrap();
        forwarder.await.unwrap();

        let chunk: serde_json::Value =
            serde_json::from_slice(&line_rx.recv().await.unwrap()).unwrap();
        assert_eq!(chunk["method"], "stream.chunk");
        assert_eq!(chunk["params"]["token_id"], 5);
        assert_eq!(chunk["params"]["is_final"], false);

        let stats: serde_json::Value =
            serde_json::from_slice(&line_rx.recv().await.unwrap()).unwrap();
        assert_eq!(stats["method"], "stream.stats");
        assert_eq!(stats["params"]["tokens_generated"], 1);

        let event: serde_json::Value =
            serde_json::from_slice(&line_rx.recv().await.unwrap()).unwrap();
        assert_eq!(event["method"], "stream.event");
        assert_eq!(event["params"]["event"], "completed");
        assert_eq!(event["params"]["finish_reason"], "length");
        assert_eq!(event["params"]["is_final"], true);
    }
}
