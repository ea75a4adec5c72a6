//! # Chat Store Adapter
//!
//! Persists chat messages and answers room-membership questions. The trait
//! keeps the rest of the core decoupled from `sqlx`/Postgres so the reader
//! task, gateway, and response consumer only ever see `StoreError`, never a
//! raw `sqlx::Error`, mirroring how `lib_common::connections::db_postgres`
//! wraps the driver behind its own `DbError`.

use async_trait::async_trait;
use chrono::Utc;
use lib_common::db_postgres::{Database, DbError};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use super::models::{PersistedMessage, BOT_USER_ID};

/// Narrow error type for the chat store adapter, in `DbError`'s shape.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to connect to chat store: {0}")]
    Connection(String),
    #[error("chat store query failed: {0}")]
    Query(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Query(err.to_string())
    }
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        StoreError::Connection(err.to_string())
    }
}

/// What the core needs from the relational store: persist messages, answer
/// membership, and replay recent history on join. Credential verification,
/// room creation, and schema migrations are external collaborators and
/// never appear here.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persists one chat frame. The store assigns `id` and `created_at`;
    /// callers never supply them. Never called for command-classified
    /// payloads.
    async fn create_message(
        &self,
        room_id: Uuid,
        author_user_id: Uuid,
        content: &str,
        is_bot: bool,
    ) -> Result<PersistedMessage, StoreError>;

    /// Most recent `limit` messages in `room_id`, oldest first, the shape
    /// the gateway replays into a newly joined client's outbound queue.
    async fn recent_messages(&self, room_id: Uuid, limit: i64) -> Result<Vec<PersistedMessage>, StoreError>;

    /// Whether `user_id` holds membership in `room_id`. Delegated
    /// membership bookkeeping (who may join) lives outside the core; this
    /// is the one membership fact the core actually consults.
    async fn is_room_member(&self, user_id: Uuid, room_id: Uuid) -> Result<bool, StoreError>;

    /// Whether `room_id` exists at all, distinguishing 404 from 403 at the
    /// gateway.
    async fn room_exists(&self, room_id: Uuid) -> Result<bool, StoreError>;

    /// Idempotently ensures the reserved bot user row exists. Called once
    /// at startup.
    async fn ensure_bot_user(&self) -> Result<(), StoreError>;
}

/// `sqlx`-backed `ChatStore`, pooled the same way
/// `lib_common::connections::db_postgres::Database` pools its connections.
pub struct PostgresChatStore {
    pool: PgPool,
}

impl PostgresChatStore {
    /// Opens the pool through `lib_common`'s shared `Database` wrapper, the
    /// same pooling path `chat_server` shares with any future sibling
    /// binary that also needs Postgres.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let db = Database::new(database_url, max_connections).await?;
        Ok(Self { pool: db.pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatStore for PostgresChatStore {
    async fn create_message(
        &self,
        room_id: Uuid,
        author_user_id: Uuid,
        content: &str,
        is_bot: bool,
    ) -> Result<PersistedMessage, StoreError> {
        let row: PersistedMessage = sqlx::query_as(
            r#"
            WITH inserted AS (
                INSERT INTO messages (id, room_id, author_user_id, content, is_bot, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING id, room_id, author_user_id, content, is_bot, created_at
            )
            SELECT inserted.id, inserted.room_id, inserted.author_user_id,
                   users.username AS author_username,
                   inserted.content, inserted.is_bot, inserted.created_at
            FROM inserted
            JOIN users ON users.id = inserted.author_user_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(room_id)
        .bind(author_user_id)
        .bind(content)
        .bind(is_bot)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn recent_messages(&self, room_id: Uuid, limit: i64) -> Result<Vec<PersistedMessage>, StoreError> {
        let rows: Vec<PersistedMessage> = sqlx::query_as(
            r#"
            SELECT messages.id, messages.room_id, messages.author_user_id,
                   users.username AS author_username,
                   messages.content, messages.is_bot, messages.created_at
            FROM messages
            JOIN users ON users.id = messages.author_user_id
            WHERE messages.room_id = $1
            ORDER BY messages.created_at DESC
            LIMIT $2
            "#,
        )
        .bind(room_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        // Query is newest-first for an efficient index scan; callers need
        // oldest-first so replay reads top-to-bottom like the live feed.
        Ok(rows.into_iter().rev().collect())
    }

    async fn is_room_member(&self, user_id: Uuid, room_id: Uuid) -> Result<bool, StoreError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM room_members WHERE user_id = $1 AND room_id = $2)")
                .bind(user_id)
                .bind(room_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn room_exists(&self, room_id: Uuid) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM rooms WHERE id = $1)")
            .bind(room_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn ensure_bot_user(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, is_bot)
            VALUES ($1, 'stockbot', true)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(BOT_USER_ID)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-process fake standing in for Postgres in integration tests
    /// elsewhere in this crate. Lives here so the
    /// trait and its one realistic test double travel together.
    #[derive(Default)]
    pub struct FakeChatStore {
        messages: Mutex<Vec<PersistedMessage>>,
        members: Mutex<HashMap<Uuid, Vec<Uuid>>>,
        rooms: Mutex<Vec<Uuid>>,
        usernames: Mutex<HashMap<Uuid, String>>,
    }

    impl FakeChatStore {
        pub fn new() -> Self {
            let store = Self::default();
            store.usernames.lock().unwrap().insert(BOT_USER_ID, "stockbot".to_string());
            store
        }

        pub fn with_room(self, room_id: Uuid) -> Self {
            self.rooms.lock().unwrap().push(room_id);
            self
        }

        pub fn with_member(self, room_id: Uuid, user_id: Uuid) -> Self {
            self.members.lock().unwrap().entry(room_id).or_default().push(user_id);
            self
        }

        pub fn with_username(self, user_id: Uuid, username: impl Into<String>) -> Self {
            self.usernames.lock().unwrap().insert(user_id, username.into());
            self
        }
    }

    #[async_trait]
    impl ChatStore for FakeChatStore {
        async fn create_message(
            &self,
            room_id: Uuid,
            author_user_id: Uuid,
            content: &str,
            is_bot: bool,
        ) -> Result<PersistedMessage, StoreError> {
            let author_username = self
                .usernames
                .lock()
                .unwrap()
                .get(&author_user_id)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            let msg = PersistedMessage {
                id: Uuid::new_v4(),
                room_id,
                author_user_id,
                author_username,
                content: content.to_string(),
                is_bot,
                created_at: Utc::now(),
            };
            self.messages.lock().unwrap().push(msg.clone());
            Ok(msg)
        }

        async fn recent_messages(&self, room_id: Uuid, limit: i64) -> Result<Vec<PersistedMessage>, StoreError> {
            let all = self.messages.lock().unwrap();
            let mut matching: Vec<PersistedMessage> =
                all.iter().filter(|m| m.room_id == room_id).cloned().collect();
            let overflow = matching.len().saturating_sub(limit.max(0) as usize);
            matching.drain(0..overflow);
            Ok(matching)
        }

        async fn is_room_member(&self, user_id: Uuid, room_id: Uuid) -> Result<bool, StoreError> {
            Ok(self
                .members
                .lock()
                .unwrap()
                .get(&room_id)
                .map(|members| members.contains(&user_id))
                .unwrap_or(false))
        }

        async fn room_exists(&self, room_id: Uuid) -> Result<bool, StoreError> {
            Ok(self.rooms.lock().unwrap().contains(&room_id))
        }

        async fn ensure_bot_user(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn fake_store_does_not_persist_commands_directly() {
        // The store itself has no notion of commands; callers never pass
        // one through. This test simply pins the "only caller decides"
        // invariant documented on `create_message`.
        let store = FakeChatStore::new();
        let room = Uuid::new_v4();
        store.create_message(room, Uuid::new_v4(), "hi", false).await.unwrap();
        assert_eq!(store.recent_messages(room, 50).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recent_messages_respects_limit_and_order() {
        let store = FakeChatStore::new();
        let room = Uuid::new_v4();
        for i in 0..5 {
            store
                .create_message(room, Uuid::new_v4(), &format!("m{i}"), false)
                .await
                .unwrap();
        }
        let recent = store.recent_messages(room, 3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].content, "m2");
        assert_eq!(recent[2].content, "m4");
    }
}
