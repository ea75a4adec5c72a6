//! # Broker Adapter
//!
//! Thin capability over Redis Streams standing in for the durable
//! exchange/queue topology: `XADD` onto the commands stream is
//! the durable topic publish, and a consumer group read + `XACK` on the
//! responses stream gives the at-least-once, redeliver-on-no-ack semantics
//! the command/response pipeline requires. Built on `redis`'s async
//! `ConnectionManager`, through its `tokio-comp` feature since both
//! producer (client reader) and consumer (response consumer) are async
//! tasks.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::models::{CommandEnvelope, ResponseEnvelope};

/// Narrow error type for the broker adapter.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    Connection(String),
    #[error("broker publish failed: {0}")]
    Publish(String),
    #[error("broker consume failed: {0}")]
    Consume(String),
}

impl From<RedisError> for BrokerError {
    fn from(err: RedisError) -> Self {
        BrokerError::Consume(err.to_string())
    }
}

/// One response pulled off the responses stream, paired with the opaque
/// stream entry id the caller must hand back to `ack_response` after a
/// successful handle. Not acknowledging leaves the entry pending so Redis
/// redelivers it to the group after its consumer goes away.
pub struct DeliveredResponse {
    pub entry_id: String,
    pub envelope: ResponseEnvelope,
}

/// Two logical streams: commands, produced by client
/// readers and consumed by the external stock worker; responses, produced
/// by that worker and consumed by the response consumer (§4.6).
#[async_trait]
pub trait Broker: Send + Sync {
    /// Durably publishes `envelope` onto the commands stream. At-least-once:
    /// duplicates are tolerated downstream.
    async fn publish_command(&self, envelope: &CommandEnvelope) -> Result<(), BrokerError>;

    /// Reads up to `count` not-yet-acked response entries for this
    /// consumer's group, blocking up to `block` for at least one to arrive.
    async fn read_responses(&self, count: usize, block: Duration) -> Result<Vec<DeliveredResponse>, BrokerError>;

    /// Acknowledges successful handling of one response entry. Must be
    /// skipped (never called) on handler failure so Redis redelivers it.
    async fn ack_response(&self, entry_id: &str) -> Result<(), BrokerError>;
}

/// Redis Streams implementation of [`Broker`].
pub struct RedisBroker {
    conn: ConnectionManager,
    commands_stream: String,
    responses_stream: String,
    responses_group: String,
    responses_consumer: String,
}

impl RedisBroker {
    /// Connects and ensures the responses consumer group exists
    /// (`XGROUP CREATE ... MKSTREAM`), tolerating the `BUSYGROUP` error a
    /// second process/restart hits when the group already exists.
    pub async fn connect(
        redis_url: &str,
        commands_stream: String,
        responses_stream: String,
        responses_group: String,
        responses_consumer: String,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url).map_err(|e| BrokerError::Connection(e.to_string()))?;
        let mut conn = ConnectionManager::new(client)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let create_group: Result<(), RedisError> = conn
            .xgroup_create_mkstream(&responses_stream, &responses_group, "$")
            .await;
        if let Err(e) = create_group {
            if !e.to_string().contains("BUSYGROUP") {
                return Err(BrokerError::Connection(e.to_string()));
            }
            debug!(stream = %responses_stream, group = %responses_group, "broker: consumer group already exists");
        }

        Ok(Self {
            conn,
            commands_stream,
            responses_stream,
            responses_group,
            responses_consumer,
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish_command(&self, envelope: &CommandEnvelope) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(envelope).map_err(|e| BrokerError::Publish(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: String = conn
            .xadd(&self.commands_stream, "*", &[("payload", payload.as_str())])
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn read_responses(&self, count: usize, block: Duration) -> Result<Vec<DeliveredResponse>, BrokerError> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(&self.responses_group, &self.responses_consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let reply: StreamReadReply = conn
            .xread_options(&[self.responses_stream.as_str()], &[">"], &opts)
            .await?;

        let mut out = Vec::new();
        for stream_key in reply.keys {
            for entry in stream_key.ids {
                let payload: Option<String> = entry
                    .map
                    .get("payload")
                    .and_then(|v| redis::from_redis_value::<String>(v).ok());
                match payload.and_then(|p| serde_json::from_str::<ResponseEnvelope>(&p).ok()) {
                    Some(envelope) => out.push(DeliveredResponse {
                        entry_id: entry.id,
                        envelope,
                    }),
                    None => {
                        warn!(entry_id = %entry.id, "broker: malformed response entry, acking to avoid a poison-pill loop");
                        let _ = self.ack_response(&entry.id).await;
                    }
                }
            }
        }
        Ok(out)
    }

    async fn ack_response(&self, entry_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(&self.responses_stream, &self.responses_group, &[entry_id])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// In-process fake broker used by integration tests elsewhere in this
    /// crate: an in-memory queue standing in for the
    /// responses stream, plus a `Vec` capturing published commands.
    #[derive(Default)]
    pub struct FakeBroker {
        published_commands: Mutex<Vec<CommandEnvelope>>,
        pending_responses: Mutex<Vec<DeliveredResponse>>,
        acked: Mutex<Vec<String>>,
        notify: Notify,
        fail_publish: Mutex<bool>,
    }

    impl FakeBroker {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_fail_publish(&self, fail: bool) {
            *self.fail_publish.lock().unwrap() = fail;
        }

        pub fn push_response(&self, entry_id: &str, envelope: ResponseEnvelope) {
            self.pending_responses.lock().unwrap().push(DeliveredResponse {
                entry_id: entry_id.to_string(),
                envelope,
            });
            self.notify.notify_one();
        }

        pub fn published_commands(&self) -> Vec<CommandEnvelope> {
            self.published_commands.lock().unwrap().clone()
        }

        pub fn acked(&self) -> Vec<String> {
            self.acked.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Broker for FakeBroker {
        async fn publish_command(&self, envelope: &CommandEnvelope) -> Result<(), BrokerError> {
            if *self.fail_publish.lock().unwrap() {
                return Err(BrokerError::Publish("simulated outage".into()));
            }
            self.published_commands.lock().unwrap().push(envelope.clone());
            Ok(())
        }

        async fn read_responses(&self, count: usize, block: Duration) -> Result<Vec<DeliveredResponse>, BrokerError> {
            loop {
                {
                    let mut pending = self.pending_responses.lock().unwrap();
                    if !pending.is_empty() {
                        let n = count.min(pending.len());
                        return Ok(pending.drain(0..n).collect());
                    }
                }
                if tokio::time::timeout(block, self.notify.notified()).await.is_err() {
                    return Ok(Vec::new());
                }
            }
        }

        async fn ack_response(&self, entry_id: &str) -> Result<(), BrokerError> {
            self.acked.lock().unwrap().push(entry_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn publish_failure_surfaces_as_broker_error() {
        let broker = FakeBroker::new();
        broker.set_fail_publish(true);
        let envelope = CommandEnvelope {
            stock_code: "AAPL.US".into(),
            chatroom_id: uuid::Uuid::new_v4(),
            requested_by: uuid::Uuid::new_v4(),
            timestamp: 0,
        };
        assert!(broker.publish_command(&envelope).await.is_err());
    }

    #[tokio::test]
    async fn read_responses_returns_pushed_entries() {
        let broker = FakeBroker::new();
        broker.push_response(
            "1-0",
            ResponseEnvelope {
                chatroom_id: uuid::Uuid::new_v4(),
                symbol: Some("AAPL.US".into()),
                price: Some(150.0),
                formatted_message: Some("AAPL.US quote is $150.00 per share".into()),
                error: None,
                timestamp: 0,
            },
        );
        let delivered = broker.read_responses(8, Duration::from_millis(50)).await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].entry_id, "1-0");
        broker.ack_response(&delivered[0].entry_id).await.unwrap();
        assert_eq!(broker.acked(), vec!["1-0".to_string()]);
    }
}
