//! # Wire & Domain Models
//!
//! The JSON shapes exchanged with clients (`InboundFrame`/`OutboundFrame`),
//! the row persisted by the chat store (`PersistedMessage`), and the two
//! envelope types that cross the broker (`CommandEnvelope`,
//! `ResponseEnvelope`). These are serialized verbatim over the wire, not an
//! internal representation translated at the edge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The reserved author id every bot-originated message is persisted under.
/// Fixed so the store bootstrap step and the response consumer agree on it
/// without a lookup.
pub const BOT_USER_ID: Uuid = Uuid::nil();

/// The only inbound frame a client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    ChatMessage { content: String },
}

/// Every frame the server ever writes back to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    ChatMessage {
        id: Uuid,
        room_id: Uuid,
        user_id: Uuid,
        username: String,
        content: String,
        is_bot: bool,
        created_at: DateTime<Utc>,
    },
    UserJoined {
        username: String,
        user_count: usize,
    },
    UserLeft {
        username: String,
        user_count: usize,
    },
    UserCountUpdate {
        user_count: usize,
    },
    Error {
        message: String,
    },
}

impl OutboundFrame {
    /// Serializes the frame to the JSON text sent over the wire. Infallible
    /// for our own well-formed types; a serialization failure here would be
    /// a programming error, not a runtime condition callers need to branch
    /// on, so callers may `expect` it.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("OutboundFrame always serializes")
    }
}

/// A chat message as stored by the chat store adapter. `id` and
/// `created_at` are assigned by the store, never by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PersistedMessage {
    pub id: Uuid,
    pub room_id: Uuid,
    pub author_user_id: Uuid,
    pub author_username: String,
    pub content: String,
    pub is_bot: bool,
    pub created_at: DateTime<Utc>,
}

/// Published to the commands stream when a chat payload classifies as a
/// stock-quote command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub stock_code: String,
    pub chatroom_id: Uuid,
    pub requested_by: Uuid,
    pub timestamp: i64,
}

/// Consumed from the responses stream by the response consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub chatroom_id: Uuid,
    pub symbol: Option<String>,
    pub price: Option<f64>,
    pub formatted_message: Option<String>,
    pub error: Option<String>,
    pub timestamp: i64,
}

impl ResponseEnvelope {
    /// The text to display in the bot's chat message: the broker-provided
    /// formatted message on success, else a short error string.
    pub fn display_text(&self) -> String {
        if let Some(msg) = &self.formatted_message {
            msg.clone()
        } else if let Some(err) = &self.error {
            err.clone()
        } else {
            "Stock quote request failed with no further detail.".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_chat_message_parses() {
        let raw = r#"{"type":"chat_message","content":"hi"}"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        match frame {
            InboundFrame::ChatMessage { content } => assert_eq!(content, "hi"),
        }
    }

    #[test]
    fn outbound_chat_message_serializes_with_snake_case_type() {
        let frame = OutboundFrame::ChatMessage {
            id: Uuid::nil(),
            room_id: Uuid::nil(),
            user_id: Uuid::nil(),
            username: "alice".into(),
            content: "hi".into(),
            is_bot: false,
            created_at: Utc::now(),
        };
        let json = frame.to_json();
        assert!(json.contains("\"type\":\"chat_message\""));
        assert!(json.contains("\"is_bot\":false"));
    }

    #[test]
    fn response_envelope_prefers_formatted_message() {
        let env = ResponseEnvelope {
            chatroom_id: Uuid::nil(),
            symbol: Some("AAPL.US".into()),
            price: Some(150.0),
            formatted_message: Some("AAPL.US quote is $150.00 per share".into()),
            error: None,
            timestamp: 0,
        };
        assert_eq!(env.display_text(), "AAPL.US quote is $150.00 per share");
    }

    #[test]
    fn response_envelope_falls_back_to_error() {
        let env = ResponseEnvelope {
            chatroom_id: Uuid::nil(),
            symbol: None,
            price: None,
            formatted_message: None,
            error: Some("Stock ZZZZ not found".into()),
            timestamp: 0,
        };
        assert_eq!(env.display_text(), "Stock ZZZZ not found");
    }
}
