//! # Runtime Configuration
//!
//! Parsed with `clap::Parser`, one `env = "..."` attribute per field so
//! every binding can come from either a flag or the environment. Every
//! operational tunable gets a sensible default here instead of a magic
//! number buried in `hub.rs` / `client.rs`.

use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Real-time multi-room chat hub")]
pub struct ChatConfig {
    /// Address the websocket/HTTP gateway binds to.
    #[arg(long, env = "CHAT_BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: String,

    /// PostgreSQL connection URL for the chat store.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Max size of the Postgres connection pool.
    #[arg(long, env = "CHAT_DB_MAX_CONNECTIONS", default_value_t = 10)]
    pub db_max_connections: u32,

    /// Redis URL backing the durable commands/responses broker streams.
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1/")]
    pub redis_url: String,

    /// Redis stream key the command producer (client reader) publishes to.
    #[arg(long, env = "CHAT_COMMANDS_STREAM", default_value = "chat:commands")]
    pub commands_stream: String,

    /// Redis stream key the external stock worker publishes replies to.
    #[arg(long, env = "CHAT_RESPONSES_STREAM", default_value = "chat:responses")]
    pub responses_stream: String,

    /// Redis consumer group used when reading the responses stream.
    #[arg(long, env = "CHAT_RESPONSES_GROUP", default_value = "response-consumer")]
    pub responses_group: String,

    /// Consumer name this process registers under within the group.
    #[arg(long, env = "CHAT_RESPONSES_CONSUMER", default_value = "response-consumer-1")]
    pub responses_consumer: String,

    /// Max in-flight (unacked) responses read per XREADGROUP call.
    #[arg(long, env = "CHAT_RESPONSES_PREFETCH", default_value_t = 8)]
    pub responses_prefetch: usize,

    /// Per-connection outbound queue capacity before a client is considered
    /// stuck and forcibly dropped.
    #[arg(long, env = "CHAT_OUTBOUND_QUEUE_CAPACITY", default_value_t = 256)]
    pub outbound_queue_capacity: usize,

    /// Max accepted inbound text frame size, in bytes.
    #[arg(long, env = "CHAT_MAX_FRAME_BYTES", default_value_t = 4096)]
    pub max_frame_bytes: usize,

    /// Read deadline; reset by every inbound frame including pong control
    /// frames. Exceeding it tears the connection down.
    #[arg(long, env = "CHAT_READ_DEADLINE_SECS", default_value_t = 60)]
    pub read_deadline_secs: u64,

    /// Per-write deadline on the writer task.
    #[arg(long, env = "CHAT_WRITE_DEADLINE_SECS", default_value_t = 10)]
    pub write_deadline_secs: u64,

    /// Keepalive ping interval; must stay well under the read deadline.
    #[arg(long, env = "CHAT_PING_INTERVAL_SECS", default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Number of most recent messages replayed to a client on join.
    #[arg(long, env = "CHAT_HISTORY_REPLAY_COUNT", default_value_t = 50)]
    pub history_replay_count: i64,

    /// Grace period given to in-flight connections during shutdown.
    #[arg(long, env = "CHAT_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    pub shutdown_grace_secs: u64,
}

impl ChatConfig {
    /// Builds a config from defaults plus a placeholder database URL, for
    /// tests elsewhere in this crate that need a `ChatConfig` but aren't
    /// exercising its parsing.
    #[cfg(test)]
    pub(crate) fn parse_from_test_defaults() -> Self {
        Self::parse_from(["chat_server", "--database-url", "postgres://localhost/test"])
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }

    pub fn write_deadline(&self) -> Duration {
        Duration::from_secs(self.write_deadline_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_interval_is_comfortably_below_read_deadline() {
        let cfg = ChatConfig::parse_from([
            "chat_server",
            "--database-url",
            "postgres://localhost/test",
        ]);
        assert!(cfg.ping_interval() < cfg.read_deadline());
    }
}
