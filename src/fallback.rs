//! Execution against the secondary (SQLite) store.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx_sqlite_store::SqliteStore;
use tracing::{debug, warn};

use crate::dialect;
use crate::engine::{OperationKind, OperationOutput, OperationRequest, Row};
use crate::error::{Error, Result};
use crate::events::{EventBus, ServiceEvent};

/// The request/response surface the fallback path needs from the secondary store.
#[async_trait]
pub trait SecondaryStore: Send + Sync {
   async fn fetch_all(&self, sql: &str, params: &[JsonValue]) -> sqlx_sqlite_store::Result<Vec<Row>>;

   /// Returns the number of rows affected
   async fn execute(&self, sql: &str, params: &[JsonValue]) -> sqlx_sqlite_store::Result<u64>;
}

#[async_trait]
impl SecondaryStore for SqliteStore {
   async fn fetch_all(&self, sql: &str, params: &[JsonValue]) -> sqlx_sqlite_store::Result<Vec<Row>> {
      SqliteStore::fetch_all(self, sql.to_owned(), params.to_vec()).await
   }

   async fn execute(&self, sql: &str, params: &[JsonValue]) -> sqlx_sqlite_store::Result<u64> {
      SqliteStore::execute(self, sql.to_owned(), params.to_vec()).await
   }
}

/// Runs engine operations on the secondary store after dialect translation.
///
/// A failure here is terminal for the operation.
#[derive(Clone)]
pub struct FallbackExecutor {
   store: Arc<dyn SecondaryStore>,
   events: EventBus,
}

impl FallbackExecutor {
   pub fn new(store: Arc<dyn SecondaryStore>, events: EventBus) -> Self {
      Self { store, events }
   }

   /// Apply engine-dialect schema statements to the secondary store.
   ///
   /// Best effort: failures are logged and counted, not returned.
   pub async fn prepare(&self, statements: &[String]) -> usize {
      let mut failed = 0;
      for statement in statements {
         let sql = dialect::translate(statement);
         if let Err(e) = self.store.execute(&sql, &[]).await {
            warn!(error = %e, "Failed to apply schema statement to fallback store");
            failed += 1;
         }
      }
      failed
   }

   /// Execute `request` on the secondary store.
   ///
   /// `original` is the engine error that caused the fallback, if any; it is
   /// attached to [`Error::Fallback`] when the store fails too.
   pub async fn execute(
      &self,
      request: &OperationRequest,
      original: Option<Error>,
   ) -> Result<OperationOutput> {
      self.events.emit(ServiceEvent::FallbackUsed {
         sql: request.sql.clone(),
         kind: request.kind,
      });

      match &original {
         Some(error) => warn!(error = %error, kind = ?request.kind, "Engine operation failed; using fallback store"),
         None => debug!(kind = ?request.kind, "Executing on fallback store"),
      }

      let sql = dialect::translate(&request.sql);
      let result = match request.kind {
         OperationKind::Query => self
            .store
            .fetch_all(&sql, &request.params)
            .await
            .map(OperationOutput::Rows),
         OperationKind::Run => self
            .store
            .execute(&sql, &request.params)
            .await
            .map(OperationOutput::Affected),
      };

      result.map_err(|source| {
         warn!(error = %source, "Fallback store rejected operation");
         Error::Fallback {
            source,
            original: original.map(Box::new),
         }
      })
   }
}
