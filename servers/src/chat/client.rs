//! # Client Reader & Writer Tasks
//!
//! Every accepted connection gets two independent tasks: a reader that owns
//! the socket's receive half and a writer that owns the send half, joined
//! only by the client's outbound queue. Splitting them this way means a
//! slow or silent peer on the write side never blocks the read side (and
//! vice versa), a deliberate split from the single-task `tokio::select!`
//! loop the market-data downstream server used, since here the two
//! directions have genuinely independent failure and pacing concerns
//! (inbound validation vs. outbound back-pressure).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broker::Broker;
use super::command::{classify, Classification};
use super::config::ChatConfig;
use super::error::ChatError;
use super::hub::HubHandle;
use super::models::{CommandEnvelope, InboundFrame, OutboundFrame};
use super::store::ChatStore;

/// Upper bound on `content` length after trimming, in UTF-8 characters
/// ("1-1000 characters after trim").
const MAX_CONTENT_CHARS: usize = 1000;

/// Identity and room membership a connection was authorized for, handed to
/// the reader/writer pair by the gateway after the upgrade.
pub struct ClientContext {
    pub client_id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
}

/// Runs the reader half: validates and classifies each inbound frame,
/// persists and broadcasts chat messages, publishes stock-quote commands to
/// the broker, and tears down (only this client, never the process) on a
/// read-deadline miss, an oversize frame, or a socket error.
pub async fn run_reader(
    mut stream: futures_util::stream::SplitStream<WebSocket>,
    ctx: Arc<ClientContext>,
    hub: HubHandle,
    store: Arc<dyn ChatStore>,
    broker: Arc<dyn Broker>,
    config: Arc<ChatConfig>,
) {
    loop {
        let next = timeout(config.read_deadline(), stream.next()).await;
        let msg = match next {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                warn!(client_id = %ctx.client_id, error = %e, "reader: socket error, closing");
                break;
            }
            Ok(None) => {
                debug!(client_id = %ctx.client_id, "reader: stream ended");
                break;
            }
            Err(_) => {
                info!(client_id = %ctx.client_id, "reader: read deadline exceeded, closing");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                if text.len() > config.max_frame_bytes {
                    hub.send_to(
                        ctx.client_id,
                        OutboundFrame::Error {
                            message: "message exceeds the maximum allowed size".to_string(),
                        },
                    )
                    .await;
                    continue;
                }
                handle_text_frame(&text, &ctx, &hub, &store, &broker).await;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Reaching here already reset the read deadline for the
                // next loop iteration; no further action needed.
            }
            Message::Close(_) => {
                debug!(client_id = %ctx.client_id, "reader: client sent close");
                break;
            }
            Message::Binary(_) => {
                hub.send_to(
                    ctx.client_id,
                    OutboundFrame::Error {
                        message: "binary frames are not supported".to_string(),
                    },
                )
                .await;
            }
        }
    }

    hub.unregister(ctx.client_id).await;
}

async fn handle_text_frame(
    text: &str,
    ctx: &Arc<ClientContext>,
    hub: &HubHandle,
    store: &Arc<dyn ChatStore>,
    broker: &Arc<dyn Broker>,
) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            debug!(client_id = %ctx.client_id, error = %e, "reader: malformed frame");
            hub.send_to(
                ctx.client_id,
                OutboundFrame::Error {
                    message: "malformed frame".to_string(),
                },
            )
            .await;
            return;
        }
    };

    let InboundFrame::ChatMessage { content } = frame;
    let trimmed = content.trim();
    let trimmed_len = trimmed.chars().count();
    if trimmed_len == 0 {
        hub.send_to(
            ctx.client_id,
            OutboundFrame::Error {
                message: "message must not be empty".to_string(),
            },
        )
        .await;
        return;
    }
    if trimmed_len > MAX_CONTENT_CHARS {
        hub.send_to(
            ctx.client_id,
            OutboundFrame::Error {
                message: "message exceeds the maximum allowed length".to_string(),
            },
        )
        .await;
        return;
    }

    match classify(trimmed) {
        Classification::Chat => {
            persist_and_broadcast(ctx, hub, store, trimmed, ctx.user_id, false).await;
        }
        Classification::Command { stock_code } => {
            // A command is never persisted or broadcast. Only chat frames
            // and bot replies reach the store.
            publish_command(ctx, hub, broker, stock_code).await;
        }
        Classification::Invalid => {
            hub.send_to(
                ctx.client_id,
                OutboundFrame::Error {
                    message: "invalid stock command".to_string(),
                },
            )
            .await;
        }
    }
}

async fn persist_and_broadcast(
    ctx: &Arc<ClientContext>,
    hub: &HubHandle,
    store: &Arc<dyn ChatStore>,
    content: &str,
    author_user_id: Uuid,
    is_bot: bool,
) {
    match store.create_message(ctx.room_id, author_user_id, content, is_bot).await {
        Ok(persisted) => {
            hub.broadcast(
                ctx.room_id,
                OutboundFrame::ChatMessage {
                    id: persisted.id,
                    room_id: persisted.room_id,
                    user_id: persisted.author_user_id,
                    username: persisted.author_username,
                    content: persisted.content,
                    is_bot: persisted.is_bot,
                    created_at: persisted.created_at,
                },
            )
            .await;
        }
        Err(e) => {
            // transient-external: the broadcast for this
            // message is suppressed, visible only to the client that sent it.
            let err = ChatError::from(e);
            warn!(client_id = %ctx.client_id, error = %err, "reader: failed to persist message");
            hub.send_to(
                ctx.client_id,
                OutboundFrame::Error {
                    message: "message could not be saved".to_string(),
                },
            )
            .await;
        }
    }
}

async fn publish_command(ctx: &Arc<ClientContext>, hub: &HubHandle, broker: &Arc<dyn Broker>, stock_code: String) {
    let envelope = CommandEnvelope {
        stock_code,
        chatroom_id: ctx.room_id,
        requested_by: ctx.user_id,
        timestamp: chrono::Utc::now().timestamp(),
    };
    if let Err(e) = broker.publish_command(&envelope).await {
        let err = ChatError::from(e);
        warn!(client_id = %ctx.client_id, error = %err, "reader: failed to publish stock command");
        hub.send_to(
            ctx.client_id,
            OutboundFrame::Error {
                message: "stock command could not be submitted".to_string(),
            },
        )
        .await;
    }
}

/// Runs the writer half: drains the outbound queue onto the socket and
/// sends a periodic ping so idle-but-alive connections aren't mistaken for
/// dead ones. Exits as soon as the queue closes (the Hub unregistered this
/// client), a write misses its deadline, or the process-wide `shutdown`
/// token fires, in which case it sends a close frame first before exiting.
/// Closing the transport here is what lets the reader observe EOF and run
/// its own teardown, without the writer ever touching the Hub directly.
pub async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<OutboundFrame>,
    client_id: Uuid,
    config: Arc<ChatConfig>,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut ping_ticker = interval(config.ping_interval());
    ping_ticker.tick().await; // first tick fires immediately; discard it

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(%client_id, "writer: shutdown signaled, sending close frame");
                let _ = write_with_deadline(&mut sink, Message::Close(None), &config).await;
                break;
            }
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if write_with_deadline(&mut sink, Message::Text(frame.to_json().into()), &config).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        debug!(%client_id, "writer: outbound queue closed");
                        break;
                    }
                }
            }
            _ = ping_ticker.tick() => {
                if write_with_deadline(&mut sink, Message::Ping(Vec::new().into()), &config).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

async fn write_with_deadline(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: Message,
    config: &ChatConfig,
) -> Result<(), ()> {
    match timeout(config.write_deadline(), sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            warn!(error = %e, "writer: send failed");
            Err(())
        }
        Err(_) => {
            warn!("writer: write deadline exceeded");
            Err(())
        }
    }
}

/// Builds the `mpsc` pair used as a connection's outbound queue, sized per
/// `ChatConfig::outbound_queue_capacity`.
pub fn outbound_channel(config: &ChatConfig) -> (mpsc::Sender<OutboundFrame>, mpsc::Receiver<OutboundFrame>) {
    mpsc::channel(config.outbound_queue_capacity)
}
