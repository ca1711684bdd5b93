//! Analytical engine abstraction.
//!
//! A [`ConnectionFactory`] produces physical [`EngineConnection`]s. Drivers
//! with blocking or callback APIs adapt them here so the pool and queue only
//! ever see async request/response calls.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{ConnectionError, Result};

/// One result row, keyed by column name in select order.
pub type Row = IndexMap<String, JsonValue>;

/// Whether an operation returns rows or an affected-row count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
   Query,
   Run,
}

/// A SQL statement with its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
   pub sql: String,
   pub params: Vec<JsonValue>,
   pub kind: OperationKind,
}

impl OperationRequest {
   pub fn query(sql: impl Into<String>, params: Vec<JsonValue>) -> Self {
      Self {
         sql: sql.into(),
         params,
         kind: OperationKind::Query,
      }
   }

   pub fn run(sql: impl Into<String>, params: Vec<JsonValue>) -> Self {
      Self {
         sql: sql.into(),
         params,
         kind: OperationKind::Run,
      }
   }
}

/// Successful result of an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutput {
   Rows(Vec<Row>),
   Affected(u64),
}

impl OperationOutput {
   pub fn into_rows(self) -> Vec<Row> {
      match self {
         OperationOutput::Rows(rows) => rows,
         OperationOutput::Affected(_) => Vec::new(),
      }
   }

   pub fn affected(&self) -> u64 {
      match self {
         OperationOutput::Rows(_) => 0,
         OperationOutput::Affected(n) => *n,
      }
   }
}

/// A physical connection to the analytical engine.
///
/// The pool guarantees a connection is used by at most one operation at a time.
#[async_trait]
pub trait EngineConnection: Send + Sync {
   async fn query(&self, sql: &str, params: &[JsonValue]) -> Result<Vec<Row>>;

   async fn run(&self, sql: &str, params: &[JsonValue]) -> Result<u64>;

   async fn close(&self) -> Result<()>;

   /// Execute `request` with the method matching its kind
   async fn execute(&self, request: &OperationRequest) -> Result<OperationOutput> {
      match request.kind {
         OperationKind::Query => self
            .query(&request.sql, &request.params)
            .await
            .map(OperationOutput::Rows),
         OperationKind::Run => self
            .run(&request.sql, &request.params)
            .await
            .map(OperationOutput::Affected),
      }
   }
}

/// Creates validated engine connections bound to one storage location.
///
/// Retrying is the caller's job.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
   async fn create(&self) -> std::result::Result<Arc<dyn EngineConnection>, ConnectionError>;

   /// Release process-wide engine resources after every connection closed
   fn reset(&self) {}
}

/// Factory for builds without an analytical engine.
#[derive(Debug, Clone)]
pub struct UnavailableFactory {
   reason: String,
}

impl UnavailableFactory {
   pub fn new(reason: impl Into<String>) -> Self {
      Self {
         reason: reason.into(),
      }
   }
}

#[async_trait]
impl ConnectionFactory for UnavailableFactory {
   async fn create(&self) -> std::result::Result<Arc<dyn EngineConnection>, ConnectionError> {
      Err(ConnectionError::Unavailable(self.reason.clone()))
   }
}

/// The engine factory compiled into this build.
///
/// With the `duckdb` feature this opens DuckDB at `storage_path`; without it
/// every `create()` reports [`ConnectionError::Unavailable`].
pub fn default_factory(storage_path: &std::path::Path) -> Arc<dyn ConnectionFactory> {
   #[cfg(feature = "duckdb")]
   {
      Arc::new(crate::duckdb_engine::DuckDbConnectionFactory::new(storage_path))
   }
   #[cfg(not(feature = "duckdb"))]
   {
      let _ = storage_path;
      Arc::new(UnavailableFactory::new(
         "built without the `duckdb` feature",
      ))
   }
}
