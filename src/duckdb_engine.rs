//! DuckDB engine adapter.
//!
//! DuckDB's Rust driver is blocking, so every call is moved onto the blocking
//! thread pool. One database instance is opened per factory and further
//! connections are cloned from it, since DuckDB refuses a second instance of
//! the same file within a process.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ::duckdb::types::{TimeUnit, Value as DuckValue};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, Time};
use tracing::{debug, trace};

use crate::engine::{ConnectionFactory, EngineConnection, Row};
use crate::error::{ConnectionError, Error, Result};

const MEMORY_PATH: &str = ":memory:";

// Same text form as SQLite's CURRENT_TIMESTAMP, date('now') and time('now')
const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
   format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
const DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");
const TIME_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[hour]:[minute]:[second]");

/// Opens DuckDB connections for one storage path.
pub struct DuckDbConnectionFactory {
   path: PathBuf,
   root: Arc<Mutex<Option<::duckdb::Connection>>>,
}

impl DuckDbConnectionFactory {
   pub fn new(path: impl Into<PathBuf>) -> Self {
      Self {
         path: path.into(),
         root: Arc::new(Mutex::new(None)),
      }
   }

   pub fn path(&self) -> &Path {
      &self.path
   }
}

#[async_trait]
impl ConnectionFactory for DuckDbConnectionFactory {
   async fn create(&self) -> std::result::Result<Arc<dyn EngineConnection>, ConnectionError> {
      let path = self.path.clone();
      let root = Arc::clone(&self.root);

      let conn = tokio::task::spawn_blocking(move || open_connection(&path, &root))
         .await
         .map_err(|e| ConnectionError::Open(format!("engine open task failed: {e}")))??;

      debug!(path = %self.path.display(), "Opened DuckDB connection");
      Ok(Arc::new(DuckDbConnection::new(conn)))
   }

   fn reset(&self) {
      if let Some(root) = self.root.lock().take()
         && let Err((_, e)) = root.close()
      {
         debug!(error = %e, "DuckDB root connection close reported an error");
      }
   }
}

fn open_connection(
   path: &Path,
   root: &Mutex<Option<::duckdb::Connection>>,
) -> std::result::Result<::duckdb::Connection, ConnectionError> {
   let mut root = root.lock();

   if root.is_none() {
      let opened = if path.as_os_str() == MEMORY_PATH {
         ::duckdb::Connection::open_in_memory()
      } else {
         if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
         {
            std::fs::create_dir_all(parent).map_err(|source| ConnectionError::CreateDirectory {
               path: parent.to_path_buf(),
               source,
            })?;
         }
         ::duckdb::Connection::open(path)
      };
      *root = Some(opened.map_err(|e| ConnectionError::Open(e.to_string()))?);
   }

   let Some(root_conn) = root.as_ref() else {
      return Err(ConnectionError::Open("database handle missing".into()));
   };
   let conn = root_conn
      .try_clone()
      .map_err(|e| ConnectionError::Open(e.to_string()))?;

   // Validate before handing the connection out
   conn
      .execute_batch("SELECT 1")
      .map_err(|e| ConnectionError::Open(format!("validation query failed: {e}")))?;

   Ok(conn)
}

/// A single DuckDB connection.
///
/// Closing never waits for a running call: a busy connection is closed by
/// that call once it returns.
pub struct DuckDbConnection {
   conn: Arc<Mutex<Option<::duckdb::Connection>>>,
   closing: Arc<AtomicBool>,
}

impl DuckDbConnection {
   fn new(conn: ::duckdb::Connection) -> Self {
      Self {
         conn: Arc::new(Mutex::new(Some(conn))),
         closing: Arc::new(AtomicBool::new(false)),
      }
   }

   async fn with_conn<T, F>(&self, f: F) -> Result<T>
   where
      T: Send + 'static,
      F: FnOnce(&::duckdb::Connection) -> Result<T> + Send + 'static,
   {
      let conn = Arc::clone(&self.conn);
      let closing = Arc::clone(&self.closing);
      tokio::task::spawn_blocking(move || {
         let mut guard = conn.lock();
         let result = match guard.as_ref() {
            Some(conn) if !closing.load(Ordering::SeqCst) => f(conn),
            _ => Err(Error::Execution("connection is closed".into())),
         };
         if closing.load(Ordering::SeqCst)
            && let Some(conn) = guard.take()
         {
            close_quietly(conn);
         }
         result
      })
      .await
      .map_err(|e| Error::Execution(format!("engine task failed: {e}")))?
   }
}

#[async_trait]
impl EngineConnection for DuckDbConnection {
   async fn query(&self, sql: &str, params: &[JsonValue]) -> Result<Vec<Row>> {
      let sql = sql.to_owned();
      let params = to_duck_params(params);

      self
         .with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(execution_error)?;
            let mut rows = stmt
               .query(::duckdb::params_from_iter(params))
               .map_err(execution_error)?;

            // Column metadata is only available once the statement has run
            let column_names: Vec<String> = rows
               .as_ref()
               .map(|s| s.column_names().iter().map(|n| n.to_string()).collect())
               .unwrap_or_default();

            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(execution_error)? {
               let mut decoded = Row::with_capacity(column_names.len());
               for (idx, name) in column_names.iter().enumerate() {
                  let value: DuckValue = row.get(idx).map_err(execution_error)?;
                  decoded.insert(name.clone(), to_json(value));
               }
               out.push(decoded);
            }

            trace!(rows = out.len(), "DuckDB query completed");
            Ok(out)
         })
         .await
   }

   async fn run(&self, sql: &str, params: &[JsonValue]) -> Result<u64> {
      let sql = sql.to_owned();
      let params = to_duck_params(params);

      self
         .with_conn(move |conn| {
            let affected = conn
               .execute(&sql, ::duckdb::params_from_iter(params))
               .map_err(execution_error)?;
            trace!(affected, "DuckDB statement completed");
            Ok(affected as u64)
         })
         .await
   }

   async fn close(&self) -> Result<()> {
      self.closing.store(true, Ordering::SeqCst);
      let conn = Arc::clone(&self.conn);
      tokio::task::spawn_blocking(move || {
         let Some(mut guard) = conn.try_lock() else {
            debug!("DuckDB connection busy, closing once its call returns");
            return Ok(());
         };
         match guard.take() {
            Some(conn) => conn
               .close()
               .map_err(|(_, e)| Error::Execution(format!("close failed: {e}"))),
            None => Ok(()),
         }
      })
      .await
      .map_err(|e| Error::Execution(format!("engine task failed: {e}")))?
   }
}

fn close_quietly(conn: ::duckdb::Connection) {
   if let Err((_, e)) = conn.close() {
      debug!(error = %e, "DuckDB connection close reported an error");
   }
}

fn execution_error(e: ::duckdb::Error) -> Error {
   Error::Execution(e.to_string())
}

fn to_duck_params(params: &[JsonValue]) -> Vec<DuckValue> {
   params
      .iter()
      .map(|value| match value {
         JsonValue::Null => DuckValue::Null,
         JsonValue::Bool(b) => DuckValue::Boolean(*b),
         JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
               DuckValue::BigInt(i)
            } else if let Some(u) = n.as_u64() {
               DuckValue::UBigInt(u)
            } else {
               DuckValue::Double(n.as_f64().unwrap_or_default())
            }
         }
         JsonValue::String(s) => DuckValue::Text(s.clone()),
         other => DuckValue::Text(other.to_string()),
      })
      .collect()
}

fn to_json(value: DuckValue) -> JsonValue {
   match value {
      DuckValue::Null => JsonValue::Null,
      DuckValue::Boolean(b) => JsonValue::Bool(b),
      DuckValue::TinyInt(n) => JsonValue::from(n),
      DuckValue::SmallInt(n) => JsonValue::from(n),
      DuckValue::Int(n) => JsonValue::from(n),
      DuckValue::BigInt(n) => JsonValue::from(n),
      DuckValue::UTinyInt(n) => JsonValue::from(n),
      DuckValue::USmallInt(n) => JsonValue::from(n),
      DuckValue::UInt(n) => JsonValue::from(n),
      DuckValue::UBigInt(n) => JsonValue::from(n),
      // Outside the JSON number range; keep every digit as text
      DuckValue::HugeInt(n) => match i64::try_from(n) {
         Ok(small) => JsonValue::from(small),
         Err(_) => JsonValue::String(n.to_string()),
      },
      DuckValue::Float(n) => float_to_json(f64::from(n)),
      DuckValue::Double(n) => float_to_json(n),
      DuckValue::Text(s) => JsonValue::String(s),
      DuckValue::Blob(bytes) => JsonValue::String(STANDARD.encode(bytes)),
      DuckValue::Decimal(d) => match d.to_string().parse::<f64>() {
         Ok(n) => float_to_json(n),
         Err(_) => JsonValue::String(d.to_string()),
      },
      // Out-of-range values keep their raw count
      DuckValue::Timestamp(unit, raw) => {
         JsonValue::String(timestamp_text(unit, raw).unwrap_or_else(|| raw.to_string()))
      }
      DuckValue::Date32(days) => {
         JsonValue::String(date_text(days).unwrap_or_else(|| days.to_string()))
      }
      DuckValue::Time64(unit, raw) => {
         JsonValue::String(time_text(unit, raw).unwrap_or_else(|| raw.to_string()))
      }
      DuckValue::Interval {
         months,
         days,
         nanos,
      } => JsonValue::String(interval_text(months, days, nanos)),
      DuckValue::Enum(label) => JsonValue::String(label),
      DuckValue::List(items) | DuckValue::Array(items) => {
         JsonValue::Array(items.into_iter().map(to_json).collect())
      }
      DuckValue::Union(inner) => to_json(*inner),
      // Structs and maps have no SQLite counterpart
      other => JsonValue::String(format!("{other:?}")),
   }
}

fn unit_nanos(unit: TimeUnit, raw: i64) -> i128 {
   let scale: i128 = match unit {
      TimeUnit::Second => 1_000_000_000,
      TimeUnit::Millisecond => 1_000_000,
      TimeUnit::Microsecond => 1_000,
      TimeUnit::Nanosecond => 1,
   };
   i128::from(raw) * scale
}

fn timestamp_text(unit: TimeUnit, raw: i64) -> Option<String> {
   let at = OffsetDateTime::from_unix_timestamp_nanos(unit_nanos(unit, raw)).ok()?;
   let mut text = at.format(TIMESTAMP_FORMAT).ok()?;
   push_fraction(&mut text, at.nanosecond());
   Some(text)
}

fn date_text(days: i32) -> Option<String> {
   let at = OffsetDateTime::UNIX_EPOCH.checked_add(time::Duration::days(i64::from(days)))?;
   at.date().format(DATE_FORMAT).ok()
}

fn time_text(unit: TimeUnit, raw: i64) -> Option<String> {
   let nanos = i64::try_from(unit_nanos(unit, raw)).ok()?;
   let at = Time::MIDNIGHT + time::Duration::nanoseconds(nanos);
   let mut text = at.format(TIME_FORMAT).ok()?;
   push_fraction(&mut text, at.nanosecond());
   Some(text)
}

/// Sub-second digits, only when present, trimmed to microseconds
fn push_fraction(text: &mut String, nanos: u32) {
   let micros = nanos / 1_000;
   if micros != 0 {
      text.push_str(&format!(".{micros:06}"));
   }
}

/// ISO-8601 duration, e.g. `P1M2DT3.5S`
fn interval_text(months: i32, days: i32, nanos: i64) -> String {
   let mut text = format!("P{months}M{days}DT{}", nanos / 1_000_000_000);
   let fraction = (nanos % 1_000_000_000).unsigned_abs();
   if fraction != 0 {
      let digits = format!("{fraction:09}");
      text.push('.');
      text.push_str(digits.trim_end_matches('0'));
   }
   text.push('S');
   text
}

fn float_to_json(n: f64) -> JsonValue {
   serde_json::Number::from_f64(n)
      .map(JsonValue::Number)
      .unwrap_or(JsonValue::Null)
}

#[cfg(test)]
mod tests {
   use super::*;
   use serde_json::json;
   use tempfile::TempDir;

   #[tokio::test]
   async fn test_query_and_run_round_trip() {
      let temp = TempDir::new().unwrap();
      let factory = DuckDbConnectionFactory::new(temp.path().join("nested").join("engine.duckdb"));

      let conn = factory.create().await.unwrap();
      conn
         .run("CREATE TABLE t (id INTEGER, label VARCHAR)", &[])
         .await
         .unwrap();
      let affected = conn
         .run(
            "INSERT INTO t VALUES (?, ?), (?, ?)",
            &[json!(1), json!("a"), json!(2), json!(null)],
         )
         .await
         .unwrap();
      assert_eq!(affected, 2);

      // A second connection sees the same database
      let other = factory.create().await.unwrap();
      let rows = other
         .query("SELECT id, label FROM t ORDER BY id", &[])
         .await
         .unwrap();
      assert_eq!(rows.len(), 2);
      assert_eq!(rows[0]["id"], json!(1));
      assert_eq!(rows[0]["label"], json!("a"));
      assert_eq!(rows[1]["label"], JsonValue::Null);

      conn.close().await.unwrap();
      other.close().await.unwrap();
      factory.reset();
   }

   #[tokio::test]
   async fn test_execution_error_is_reported() {
      let factory = DuckDbConnectionFactory::new(MEMORY_PATH);
      let conn = factory.create().await.unwrap();

      let err = conn.query("SELEC nonsense", &[]).await.unwrap_err();
      assert!(matches!(err, Error::Execution(_)));
   }

   #[tokio::test]
   async fn test_closed_connection_rejects_work() {
      let factory = DuckDbConnectionFactory::new(MEMORY_PATH);
      let conn = factory.create().await.unwrap();
      conn.close().await.unwrap();

      let err = conn.run("SELECT 1", &[]).await.unwrap_err();
      assert!(err.to_string().contains("closed"));
   }

   #[tokio::test]
   async fn test_close_does_not_wait_for_running_call() {
      let conn = DuckDbConnection::new(::duckdb::Connection::open_in_memory().unwrap());

      // Stand-in for a long statement holding the connection
      let busy = conn.conn.lock();
      let closed = tokio::time::timeout(std::time::Duration::from_secs(5), conn.close()).await;
      assert!(matches!(closed, Ok(Ok(()))));
      assert!(busy.is_some());
      drop(busy);

      let err = conn.run("SELECT 1", &[]).await.unwrap_err();
      assert!(err.to_string().contains("closed"));
      assert!(conn.conn.lock().is_none());
   }

   #[test]
   fn test_json_conversion_of_engine_values() {
      assert_eq!(to_json(DuckValue::Int(1)), json!(1));
      assert_eq!(to_json(DuckValue::Double(f64::NAN)), JsonValue::Null);
      assert_eq!(
         to_json(DuckValue::HugeInt(i128::MAX)),
         json!(i128::MAX.to_string())
      );
   }

   #[test]
   fn test_temporal_values_match_sqlite_text() {
      // 2026-10-17 12:00:00 UTC
      let noon = 1_792_238_400_i64;
      assert_eq!(
         to_json(DuckValue::Timestamp(TimeUnit::Microsecond, noon * 1_000_000)),
         json!("2026-10-17 12:00:00")
      );
      assert_eq!(
         to_json(DuckValue::Timestamp(TimeUnit::Second, noon)),
         json!("2026-10-17 12:00:00")
      );
      assert_eq!(
         to_json(DuckValue::Timestamp(TimeUnit::Millisecond, noon * 1_000 + 250)),
         json!("2026-10-17 12:00:00.250000")
      );
      assert_eq!(to_json(DuckValue::Date32(0)), json!("1970-01-01"));
      assert_eq!(to_json(DuckValue::Date32(20_743)), json!("2026-10-17"));
      assert_eq!(
         to_json(DuckValue::Time64(TimeUnit::Microsecond, 45_296_000_000)),
         json!("12:34:56")
      );
      assert_eq!(
         to_json(DuckValue::Interval {
            months: 1,
            days: 2,
            nanos: 3_500_000_000,
         }),
         json!("P1M2DT3.5S")
      );
   }

   #[tokio::test]
   async fn test_decimal_and_timestamp_columns_convert() {
      let factory = DuckDbConnectionFactory::new(MEMORY_PATH);
      let conn = factory.create().await.unwrap();

      let rows = conn
         .query(
            "SELECT CAST(1.25 AS DECIMAL(10, 2)) AS amount, \
                    TIMESTAMP '2026-10-17 12:00:00' AS analyzed_at, \
                    DATE '2026-10-17' AS day",
            &[],
         )
         .await
         .unwrap();
      assert_eq!(rows[0]["amount"], json!(1.25));
      assert_eq!(rows[0]["analyzed_at"], json!("2026-10-17 12:00:00"));
      assert_eq!(rows[0]["day"], json!("2026-10-17"));
   }
}
