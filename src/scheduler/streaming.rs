//! Bounded per-stream event channel between generators and the wire.
//!
//! Token producers never talk to the transport directly: they push tagged
//! events into a bounded channel and the IPC layer turns them into
//! notifications. The sender side carries the full backpressure budget,
//! so there is exactly one place that decides when a slow consumer kills
//! a stream.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

/// Why a generation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Eos,
    Length,
    Error,
    Timeout,
    Cancelled,
    Shutdown,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eos => "eos",
            Self::Length => "length",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Shutdown => "shutdown",
        }
    }

    /// Wire event name for the terminal `stream.event` notification.
    pub fn event_name(self) -> &'static str {
        match self {
            Self::Eos | Self::Length => "completed",
            Self::Error => "error",
            Self::Timeout => "error",
            Self::Cancelled => "cancelled",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Terminal statistics for one stream.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionStats {
    pub finish_reason: FinishReason,
    pub tokens_generated: usize,
    pub duration_ms: f64,
    pub ttft_ms: f64,
    pub tokens_per_sec: f64,
    pub error: Option<String>,
}

/// Everything a stream can carry, as a closed set of variants. The tag
/// only becomes a string method name at the serialization boundary.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Token { token_id: u32, text: String },
    Complete(CompletionStats),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamSendError {
    #[error("stream consumer too slow")]
    ConsumerTooSlow,
    #[error("stream receiver dropped")]
    Closed,
}

/// Sender half with a total backpressure budget.
#[derive(Clone)]
pub struct StreamSender {
    tx: mpsc::Sender<StreamEvent>,
    budget: Duration,
}

impl StreamSender {
    /// Send one event, waiting at most the configured budget for queue
    /// space. Exceeding the budget fails the stream rather than stalling
    /// the batch loop behind one slow consumer.
    pub async fn send(&self, event: StreamEvent) -> Result<(), StreamSendError> {
        match tokio::time::timeout(self.budget, self.tx.send(event)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(StreamSendError::Closed),
            Err(_) => Err(StreamSendError::ConsumerTooSlow),
        }
    }
}

/// Receiver half consumed by the transport bridge.
pub struct StreamReceiver {
    rx: mpsc::Receiver<StreamEvent>,
}

impl StreamReceiver {
    /// Next event, or `None` once the sender side is gone.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

/// Build a bounded stream channel.
///
/// `budget` is the sender's total wait allowance per event, derived from
/// `queue_put_backoff_ms × queue_put_max_retries` in the bridge config.
pub fn stream_channel(capacity: usize, budget: Duration) -> (StreamSender, StreamReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (StreamSender { tx, budget }, StreamReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (tx, mut rx) = stream_channel(8, Duration::from_millis(50));
        tx.send(StreamEvent::Token { token_id: 1, text: "a".into() }).await.unwrap();
        tx.send(StreamEvent::Token { token_id: 2, text: "b".into() }).await.unwrap();

        match rx.recv().await.unwrap() {
            StreamEvent::Token { token_id, .. } => assert_eq!(token_id, 1),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            StreamEvent::Token { token_id, .. } => assert_eq!(token_id, 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_consumer_times_out() {
        let (tx, _rx) = stream_channel(1, Duration::from_millis(20));
        tx.send(StreamEvent::Token { token_id: 1, text: "a".into() }).await.unwrap();
        // Queue full and nobody draining: the second send must give up.
        let err = tx
            .send(StreamEvent::Token { token_id: 2, text: "b".into() })
            .await
            .unwrap_err();
        assert_eq!(err, StreamSendError::ConsumerTooSlow);
    }

    #[tokio::test]
    async fn test_dropped_receiver_closes_stream() {
        let (tx, rx) = stream_channel(1, Duration::from_millis(20));
        drop(rx);
        let err = tx
            .send(StreamEvent::Token { token_id: 1, text: "a".into() })
            .await
            .unwrap_err();
        assert_eq!(err, StreamSendError::Closed);
    }

    #[test]
    fn test_finish_reason_event_names() {
        assert_eq!(FinishReason::Eos.event_name(), "completed");
        assert_eq!(FinishReason::Length.event_name(), "completed");
        assert_eq!(FinishReason::Cancelled.event_name(), "cancelled");
        assert_eq!(FinishReason::Shutdown.event_name(), "shutdown");
    }
}
