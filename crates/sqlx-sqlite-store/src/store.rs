use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Executor, Row};
use tracing::trace;

use crate::config::SqliteDatabaseConfig;
use crate::database::SqliteDatabase;
use crate::error::Result;

/// One decoded row, keyed by column name in select order.
pub type JsonRow = IndexMap<String, JsonValue>;

/// JSON-in, JSON-out access to a [`SqliteDatabase`].
///
/// Writes go through the exclusive writer; reads use the read pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
   inner: Arc<SqliteDatabase>,
}

impl SqliteStore {
   /// Open the store at an absolute or working-directory relative path
   pub async fn connect(
      path: impl AsRef<Path>,
      custom_config: Option<SqliteDatabaseConfig>,
   ) -> Result<Self> {
      let db = SqliteDatabase::connect(path, custom_config).await?;
      Ok(Self { inner: db })
   }

   /// Execute a write statement (DDL, INSERT/UPDATE/DELETE), returning the
   /// number of rows affected
   pub async fn execute(&self, query: String, values: Vec<JsonValue>) -> Result<u64> {
      let mut writer = self.inner.acquire_writer().await?;

      let mut q = sqlx::query(&query);
      for value in values {
         q = bind_value(q, value);
      }

      let result = q.execute(&mut *writer).await?;
      trace!(rows_affected = result.rows_affected(), "Store write completed");
      Ok(result.rows_affected())
   }

   /// Execute a SELECT query, possibly returning multiple rows
   pub async fn fetch_all(&self, query: String, values: Vec<JsonValue>) -> Result<Vec<JsonRow>> {
      let pool = self.inner.read_pool()?;

      let mut q = sqlx::query(&query);
      for value in values {
         q = bind_value(q, value);
      }

      let rows = pool.fetch_all(q).await?;
      decode_rows(rows)
   }

   pub async fn close(&self) -> Result<()> {
      self.inner.close().await
   }
}

fn decode_rows(rows: Vec<SqliteRow>) -> Result<Vec<JsonRow>> {
   let mut decoded = Vec::with_capacity(rows.len());
   for row in rows {
      let mut value = IndexMap::default();
      for (i, column) in row.columns().iter().enumerate() {
         let raw = row.try_get_raw(i)?;
         value.insert(column.name().to_string(), crate::decode::to_json(raw)?);
      }
      decoded.push(value);
   }
   Ok(decoded)
}

/// Bind a JSON value to a SQLx query
pub(crate) fn bind_value<'a>(
   query: sqlx::query::Query<'a, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'a>>,
   value: JsonValue,
) -> sqlx::query::Query<'a, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'a>> {
   match value {
      JsonValue::Null => query.bind(None::<String>),
      JsonValue::Bool(flag) => query.bind(flag),
      JsonValue::String(text) => query.bind(text),
      JsonValue::Number(number) => {
         // Preserve integer precision by binding as i64 when possible
         if let Some(int_val) = number.as_i64() {
            query.bind(int_val)
         } else if let Some(uint_val) = number.as_u64() {
            // Too large for SQLite's INTEGER, loses precision
            query.bind(uint_val as f64)
         } else {
            query.bind(number.as_f64().unwrap_or_default())
         }
      }
      // Arrays and objects are stored as their JSON text
      other => query.bind(other.to_string()),
   }
}
