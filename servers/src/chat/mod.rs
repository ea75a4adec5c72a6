//! # Chat Core
//!
//! The concurrent message-distribution engine: Hub, per-client
//! reader/writer tasks, command interpreter, broker adapter, response
//! consumer, and the connection gateway that wires an authenticated,
//! room-member upgrade request into a registered `Client`.

pub mod broker;
pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod models;
pub mod response_consumer;
pub mod store;
