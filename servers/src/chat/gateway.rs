//! # Connection Gateway
//!
//! Upgrades an authenticated, room-member request to a live websocket
//! connection: verify session → verify room exists → verify
//! membership → perform the upgrade → allocate a `Client` with a fresh
//! bounded outbound queue → flush join history directly into that queue →
//! register with the Hub → spawn the reader/writer pair. Session
//! verification and room-membership lookup are the two external
//! collaborator contracts this module depends on; everything past the
//! upgrade belongs to the core.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use super::broker::Broker;
use super::client::{outbound_channel, run_reader, run_writer, ClientContext};
use super::config::ChatConfig;
use super::hub::HubHandle;
use super::models::OutboundFrame;
use super::store::ChatStore;

/// The one thing the core needs from the (out-of-scope) authentication
/// subsystem: turn an opaque session token into an identity, or refuse it.
/// Credential issuance, password checks, and session creation live
/// entirely outside this trait.
#[async_trait]
pub trait SessionVerifier: Send + Sync {
    async fn verify(&self, session_token: &str) -> Option<(Uuid, String)>;
}

/// Minimal concrete adapter so the gateway can run end-to-end without a
/// separate auth service: session tokens are looked up against the same
/// Postgres pool the chat store already requires. Real
/// credential issuance/rotation is still out of scope; this only answers
/// "does this token currently map to a user".
pub struct PostgresSessionVerifier {
    pool: sqlx::PgPool,
}

impl PostgresSessionVerifier {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionVerifier for PostgresSessionVerifier {
    async fn verify(&self, session_token: &str) -> Option<(Uuid, String)> {
        let row: Option<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT users.id, users.username
            FROM sessions
            JOIN users ON users.id = sessions.user_id
            WHERE sessions.token = $1 AND sessions.expires_at > now()
            "#,
        )
        .bind(session_token)
        .fetch_optional(&self.pool)
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "gateway: session lookup query failed, treating as unauthenticated");
            None
        });
        row
    }
}

/// Shared, cloneable state handed to every axum handler.
#[derive(Clone)]
pub struct GatewayState {
    pub hub: HubHandle,
    pub store: Arc<dyn ChatStore>,
    pub broker: Arc<dyn Broker>,
    pub sessions: Arc<dyn SessionVerifier>,
    pub config: Arc<ChatConfig>,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: String,
}

/// Pre-upgrade refusal, mapped onto the appropriate HTTP status.
#[derive(Debug, Error)]
enum Refusal {
    #[error("missing or invalid session")]
    Unauthenticated,
    #[error("not a member of this room")]
    Forbidden,
    #[error("room does not exist")]
    NotFound,
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Refusal {
    fn into_response(self) -> Response {
        let status = match &self {
            Refusal::Unauthenticated => StatusCode::UNAUTHORIZED,
            Refusal::Forbidden => StatusCode::FORBIDDEN,
            Refusal::NotFound => StatusCode::NOT_FOUND,
            Refusal::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Builds the axum router: the websocket upgrade route plus a plain health
/// check, ambient operational surface alongside the websocket route. Every
/// request is wrapped in `tower_http`'s request-tracing layer, the same
/// ambient-logging companion the teacher pairs `axum` with. CORS is left
/// off; the gateway is only ever meant to sit behind the REST origin that
/// already completed session verification.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws/{room_id}", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    Path(room_id): Path<Uuid>,
    Query(query): Query<WsQuery>,
) -> Response {
    match authorize(&state, room_id, &query.token).await {
        Ok((user_id, username)) => {
            ws.on_upgrade(move |socket| handle_socket(socket, state, room_id, user_id, username))
        }
        Err(refusal) => refusal.into_response(),
    }
}

async fn authorize(state: &GatewayState, room_id: Uuid, token: &str) -> Result<(Uuid, String), Refusal> {
    let (user_id, username) = state.sessions.verify(token).await.ok_or(Refusal::Unauthenticated)?;

    let exists = state
        .store
        .room_exists(room_id)
        .await
        .map_err(|e| Refusal::Internal(e.to_string()))?;
    if !exists {
        return Err(Refusal::NotFound);
    }

    let is_member = state
        .store
        .is_room_member(user_id, room_id)
        .await
        .map_err(|e| Refusal::Internal(e.to_string()))?;
    if !is_member {
        return Err(Refusal::Forbidden);
    }

    Ok((user_id, username))
}

async fn handle_socket(
    socket: axum::extract::ws::WebSocket,
    state: GatewayState,
    room_id: Uuid,
    user_id: Uuid,
    username: String,
) {
    let client_id = Uuid::new_v4();
    let (outbound_tx, outbound_rx) = outbound_channel(&state.config);

    // History must reach the client before any broadcast, so it is pushed
    // directly onto this connection's own queue ahead of registering with
    // the Hub.
    match state
        .store
        .recent_messages(room_id, state.config.history_replay_count)
        .await
    {
        Ok(history) => {
            for msg in history {
                let frame = OutboundFrame::ChatMessage {
                    id: msg.id,
                    room_id: msg.room_id,
                    user_id: msg.author_user_id,
                    username: msg.author_username,
                    content: msg.content,
                    is_bot: msg.is_bot,
                    created_at: msg.created_at,
                };
                if outbound_tx.send(frame).await.is_err() {
                    break;
                }
            }
        }
        Err(e) => {
            warn!(%room_id, error = %e, "gateway: failed to load join history, continuing without it");
        }
    }

    let ctx = Arc::new(ClientContext {
        client_id,
        room_id,
        user_id,
        username: username.clone(),
    });

    state
        .hub
        .register(room_id, client_id, user_id, username, outbound_tx)
        .await;
    info!(%client_id, %room_id, %user_id, "gateway: connection upgraded and registered");

    let (sink, stream) = socket.split();

    let writer = tokio::spawn(run_writer(
        sink,
        outbound_rx,
        client_id,
        state.config.clone(),
        state.shutdown.clone(),
    ));
    run_reader(stream, ctx, state.hub.clone(), state.store.clone(), state.broker.clone(), state.config.clone()).await;

    // The reader owns `hub.unregister` on its own exit; the
    // writer tears down on shutdown or once it observes the closed outbound
    // queue that unregister produces.
    let _ = writer.await;
}

/// Address the gateway's axum server binds to, parsed once at startup.
pub fn parse_bind_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    Ok(addr.parse()?)
}
