//! # Response Consumer
//!
//! The single long-running task bridging the broker back into the live
//! fan-out: drain responses, persist a bot message, broadcast it into the
//! originating room, then ack. A persist failure skips the ack entirely so
//! the broker redelivers; a broker outage backs the whole loop off
//! exponentially rather than busy-spinning.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broker::Broker;
use super::hub::HubHandle;
use super::models::{OutboundFrame, BOT_USER_ID};
use super::store::ChatStore;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Counts responses whose `ack_response` call itself failed after the bot
/// reply was already persisted and broadcast, the one case where the
/// broker may redeliver an entry this process already handled. A metric
/// only; client-side id dedupe remains the sole correctness mechanism
/// (DESIGN.md resolves this Open Question).
#[derive(Default)]
pub struct ResponseConsumerMetrics {
    pub redelivered_total: AtomicU64,
}

/// Runs until `shutdown` fires. Intended to be spawned once at process
/// startup alongside the Hub.
pub async fn run(
    broker: Arc<dyn Broker>,
    store: Arc<dyn ChatStore>,
    hub: HubHandle,
    prefetch: usize,
    shutdown: CancellationToken,
    metrics: Arc<ResponseConsumerMetrics>,
) {
    let mut backoff = INITIAL_BACKOFF;
    info!("response consumer: starting");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let delivered = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = broker.read_responses(prefetch, Duration::from_secs(5)) => result,
        };

        let delivered = match delivered {
            Ok(entries) => {
                backoff = INITIAL_BACKOFF;
                entries
            }
            Err(e) => {
                warn!(error = %e, backoff_ms = backoff.as_millis(), "response consumer: broker read failed, backing off");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        for delivered in delivered {
            handle_one(&*broker, &*store, &hub, delivered, &metrics).await;
        }
    }

    info!("response consumer: stopped");
}

async fn handle_one(
    broker: &dyn Broker,
    store: &dyn ChatStore,
    hub: &HubHandle,
    delivered: super::broker::DeliveredResponse,
    metrics: &ResponseConsumerMetrics,
) {
    let envelope = delivered.envelope;
    let display_text = envelope.display_text();

    let persisted = match store
        .create_message(envelope.chatroom_id, BOT_USER_ID, &display_text, true)
        .await
    {
        Ok(persisted) => persisted,
        Err(e) => {
            error!(
                room_id = %envelope.chatroom_id,
                error = %e,
                "response consumer: failed to persist bot reply, leaving unacked for redelivery"
            );
            return;
        }
    };

    hub.broadcast(
        envelope.chatroom_id,
        OutboundFrame::ChatMessage {
            id: persisted.id,
            room_id: persisted.room_id,
            user_id: persisted.author_user_id,
            username: persisted.author_username,
            content: persisted.content,
            is_bot: true,
            created_at: persisted.created_at,
        },
    )
    .await;

    if let Err(e) = broker.ack_response(&delivered.entry_id).await {
        warn!(entry_id = %delivered.entry_id, error = %e, "response consumer: ack failed, broker may redeliver a message we already broadcast");
        metrics.redelivered_total.fetch_add(1, Ordering::Relaxed);
    } else {
        debug!(entry_id = %delivered.entry_id, room_id = %envelope.chatroom_id, "response consumer: bot reply broadcast and acked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::broker::tests::FakeBroker;
    use crate::chat::hub::Hub;
    use crate::chat::models::ResponseEnvelope;
    use crate::chat::store::tests::FakeChatStore;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[tokio::test]
    async fn success_path_persists_broadcasts_and_acks() {
        let (hub, hub_handle) = Hub::new();
        let shutdown = CancellationToken::new();
        let hub_task = tokio::spawn(hub.run(shutdown.clone()));

        let room = Uuid::new_v4();
        let client = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        hub_handle.register(room, client, Uuid::new_v4(), "alice".into(), tx).await;
        rx.recv().await; // join
        rx.recv().await; // count

        let fake_broker = Arc::new(FakeBroker::new());
        fake_broker.push_response(
            "1-0",
            ResponseEnvelope {
                chatroom_id: room,
                symbol: Some("AAPL.US".into()),
                price: Some(150.0),
                formatted_message: Some("AAPL.US quote is $150.00 per share".into()),
                error: None,
                timestamp: 0,
            },
        );
        let broker: Arc<dyn Broker> = fake_broker;
        let store: Arc<dyn ChatStore> = Arc::new(FakeChatStore::new());
        let metrics = Arc::new(ResponseConsumerMetrics::default());

        let consumer_shutdown = shutdown.clone();
        let consumer = tokio::spawn(run(broker.clone(), store, hub_handle, 8, consumer_shutdown, metrics));

        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(OutboundFrame::ChatMessage { content, is_bot, .. })) => {
                assert!(is_bot);
                assert_eq!(content, "AAPL.US quote is $150.00 per share");
            }
            other => panic!("expected bot chat message, got {other:?}"),
        }

        shutdown.cancel();
        consumer.await.unwrap();
        hub_task.await.unwrap();
    }
}
