//! # sqlx-sqlite-store
//!
//! The SQLite secondary store used by `analytics-pool` when the analytical
//! engine is unavailable or keeps failing.
//!
//! ## Core Types
//!
//! - **[`SqliteDatabase`]**: separate read and write connection pools
//! - **[`SqliteStore`]**: JSON-valued execute/fetch API over a database
//! - **[`WriteGuard`]**: RAII guard ensuring exclusive write access
//! - **[`Error`]**: error type for store operations
//!
//! ## Architecture
//!
//! - **Dual pools**: read-only pool plus a single-connection write pool
//! - **Lazy WAL mode**: enabled on the first write
//! - **JSON rows**: rows decode to ordered `column -> JSON` maps

mod config;
mod database;
pub mod decode;
mod error;
mod store;
mod write_guard;

pub use config::SqliteDatabaseConfig;
pub use database::SqliteDatabase;
pub use error::{Error, Result};
pub use store::{JsonRow, SqliteStore};
pub use write_guard::WriteGuard;
