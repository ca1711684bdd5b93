//! # analytics-pool
//!
//! A resilient front end to an embedded analytical engine (DuckDB).
//!
//! ## Core Types
//!
//! - **[`AnalyticsService`]**: public entry point (initialize, query, run, shutdown, stats)
//! - **[`ConnectionPool`]**: bounded engine connections with health tracking
//! - **[`OperationQueue`]**: FIFO, timeout-aware queue with bounded retry
//! - **[`FallbackExecutor`]**: runs operations on the SQLite secondary store
//! - **[`Error`]**: error type for service operations
//!
//! ## Architecture
//!
//! - **Single drain loop**: queued operations are dispatched one at a time, in order
//! - **Retry at the head**: a failed operation is retried before newer work, after a backoff
//! - **Graceful degradation**: exhausted retries, or an engine that cannot be
//!   opened at all, send work to the secondary store after dialect translation
//! - **Maintenance**: stale connections are evicted and idle ones probed periodically
//!
//! The engine is behind the `duckdb` cargo feature (on by default). Without
//! it the service always runs in fallback-only mode.

mod config;
pub mod dialect;
#[cfg(feature = "duckdb")]
mod duckdb_engine;
mod engine;
mod error;
mod events;
mod fallback;
mod pool;
mod queue;
pub mod schema;
mod service;

pub use config::{RetryBackoff, ServiceConfig};
#[cfg(feature = "duckdb")]
pub use duckdb_engine::{DuckDbConnection, DuckDbConnectionFactory};
pub use engine::{
   ConnectionFactory, EngineConnection, OperationKind, OperationOutput, OperationRequest, Row,
   UnavailableFactory, default_factory,
};
pub use error::{ConnectionError, Error, Result};
pub use events::{EventBus, ServiceEvent};
pub use fallback::{FallbackExecutor, SecondaryStore};
pub use pool::{
   ConnectionId, ConnectionPool, HealthCheckReport, PoolSettings, PoolStats, PooledConnection,
   UNHEALTHY_ERROR_THRESHOLD,
};
pub use queue::{OperationQueue, OperationReceiver, QueueSettings, RetryCoordinator};
pub use service::{AnalyticsService, AnalyticsServiceBuilder, PoolHealth, ServiceMode, ServiceStats};
