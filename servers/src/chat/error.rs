//! # Chat Error Taxonomy
//!
//! Five error kinds, one per distinct recovery policy: `validation`, `auth`,
//! `transient-external`, `fatal-connection` and `shutdown`. Adapters
//! (`store`, `broker`) keep their own narrow error enums (`StoreError`,
//! `BrokerError`) and convert into `ChatError` only at the boundary where a
//! recovery policy actually applies, rather than leaking pool/driver error
//! types into connection-handling code.

use thiserror::Error;

/// Top-level error kind surfaced to the pieces of the core that decide how
/// to react: reply with an `error` frame, refuse a connection, tear down a
/// client, or let the broker redeliver.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Malformed frame, oversize content, or an invalid command. Local to
    /// the offending frame; the connection stays open.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing/invalid session or non-member room access. Refused before a
    /// `Client` is ever allocated.
    #[error("authorization failed: {0}")]
    Auth(String),

    /// Store or broker timeout/outage encountered while handling a single
    /// client-originated frame. The frame's broadcast is suppressed.
    #[error("transient external failure: {0}")]
    TransientExternal(String),

    /// Read/write/parse failure. Always terminates exactly the one
    /// `Client` it occurred on; never propagates past its tasks.
    #[error("fatal connection error: {0}")]
    FatalConnection(String),

    /// The process cancellation token fired.
    #[error("shutdown in progress")]
    Shutdown,
}

impl From<crate::chat::store::StoreError> for ChatError {
    fn from(err: crate::chat::store::StoreError) -> Self {
        ChatError::TransientExternal(err.to_string())
    }
}

impl From<crate::chat::broker::BrokerError> for ChatError {
    fn from(err: crate::chat::broker::BrokerError) -> Self {
        ChatError::TransientExternal(err.to_string())
    }
}
