//! Shared, workspace-wide building blocks for the chat service binaries.
//!
//! Historically this crate gated a much larger set of folder-based feature
//! modules (configs, markets, loggers, ...); only the piece every chat
//! binary actually needs, a managed Postgres pool, survives here. The
//! `connections` feature exists so crates that don't touch Postgres (none,
//! currently) can still depend on this crate without pulling in `sqlx`.

pub mod connections;

pub use connections::db_postgres;
