//! Library surface for the `servers` crate, exposing the chat core so
//! `chat_server` (and its integration tests) can depend on it as a normal
//! module tree rather than duplicating types across a binary.

pub mod chat;
