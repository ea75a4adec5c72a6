//! # Chat Server Binary
//!
//! Wires the chat core (Hub, gateway, response consumer) into a runnable
//! process: load config → init logging → open Postgres/Redis → bootstrap
//! the reserved bot user → spawn the Hub and response consumer → serve the
//! websocket gateway until a shutdown signal fires, then drain everything
//! within the configured grace period. Follows the same
//! `#[tokio::main]` + signal-driven shutdown shape as `server_yahoo.rs`,
//! generalized from a `broadcast::Receiver<()>` fan-out to a single
//! `tokio_util::sync::CancellationToken` as the process-wide root
//! cancellation token.

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use servers::chat::broker::{Broker, RedisBroker};
use servers::chat::config::ChatConfig;
use servers::chat::gateway::{self, GatewayState, PostgresSessionVerifier, SessionVerifier};
use servers::chat::hub::Hub;
use servers::chat::response_consumer::{self, ResponseConsumerMetrics};
use servers::chat::store::{ChatStore, PostgresChatStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Arc::new(ChatConfig::parse());
    info!(bind_addr = %config.bind_addr, "chat_server: configuration loaded");

    let pg_pool = lib_common::db_postgres::Database::new(&config.database_url, config.db_max_connections)
        .await?
        .pool;

    let store: Arc<dyn ChatStore> = Arc::new(PostgresChatStore::from_pool(pg_pool.clone()));
    store.ensure_bot_user().await?;
    info!("chat_server: bot user bootstrap complete");

    // Session verification shares the same pool as chat history.
    let sessions: Arc<dyn SessionVerifier> = Arc::new(PostgresSessionVerifier::new(pg_pool));

    let broker: Arc<dyn Broker> = Arc::new(
        RedisBroker::connect(
            &config.redis_url,
            config.commands_stream.clone(),
            config.responses_stream.clone(),
            config.responses_group.clone(),
            config.responses_consumer.clone(),
        )
        .await?,
    );

    let shutdown = CancellationToken::new();

    let (hub, hub_handle) = Hub::new();
    let hub_task = tokio::spawn(hub.run(shutdown.clone()));

    let metrics = Arc::new(ResponseConsumerMetrics::default());
    let response_consumer_task = tokio::spawn(response_consumer::run(
        broker.clone(),
        store.clone(),
        hub_handle.clone(),
        config.responses_prefetch,
        shutdown.clone(),
        metrics,
    ));

    let state = GatewayState {
        hub: hub_handle,
        store,
        broker,
        sessions,
        config: config.clone(),
        shutdown: shutdown.clone(),
    };
    let app = gateway::router(state);

    let addr = gateway::parse_bind_addr(&config.bind_addr)?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "chat_server: listening");

    let server_shutdown = shutdown.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                server_shutdown.cancelled().await;
                info!("chat_server: gateway draining in-flight connections");
            })
            .await
    });

    wait_for_shutdown_signal().await;
    info!("chat_server: shutdown signal received");
    shutdown.cancel();

    let grace = config.shutdown_grace();
    if tokio::time::timeout(grace, async {
        let (server_result, _, _) = tokio::join!(server_task, hub_task, response_consumer_task);
        if let Ok(Err(e)) = server_result {
            error!(error = %e, "chat_server: gateway server error");
        }
    })
    .await
    .is_err()
    {
        error!("chat_server: shutdown grace period elapsed before all tasks drained");
    }

    info!("chat_server: shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = signal::unix::signal(signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
