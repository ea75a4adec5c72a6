//! # Connections Module
//!
//! This module handles persistent connections to external services used by
//! the chat binaries. Redis is owned directly by the broker adapter in
//! `servers` (it needs an async, stream-oriented API the old sync
//! `cache_redis` helper never provided), so only the Postgres pool lives
//! here.

/// Module for PostgreSQL database connection pooling and management.
pub mod db_postgres;