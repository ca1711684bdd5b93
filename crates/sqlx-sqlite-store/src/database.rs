//! SQLite database with a concurrent read pool and a single serialized writer

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::debug;

use crate::config::SqliteDatabaseConfig;
use crate::error::{Error, Result};
use crate::write_guard::WriteGuard;

/// SQLite database with connection pooling for concurrent reads and exclusive writes.
///
/// ## Architecture
///
/// - **`read_pool`**: read-only connections for concurrent reads
/// - **`write_conn`**: single-connection pool (max_connections=1) for serialized writes
///
/// WAL journal mode is enabled lazily on the first writer acquisition so that
/// readers never block the writer once the store sees write traffic.
#[derive(Debug)]
pub struct SqliteDatabase {
   read_pool: Pool<Sqlite>,
   write_conn: Pool<Sqlite>,
   wal_initialized: AtomicBool,
   closed: AtomicBool,
   path: PathBuf,
}

impl SqliteDatabase {
   /// Open (creating if needed) the database file at `path`.
   ///
   /// The writer pool connects first so the file exists before the read-only
   /// pool opens it.
   pub async fn connect(
      path: impl AsRef<Path>,
      custom_config: Option<SqliteDatabaseConfig>,
   ) -> Result<Arc<Self>> {
      let config = custom_config.unwrap_or_default();
      let path = path.as_ref().to_path_buf();

      if let Some(parent) = path.parent()
         && !parent.as_os_str().is_empty()
      {
         tokio::fs::create_dir_all(parent).await?;
      }

      let write_options = SqliteConnectOptions::new()
         .filename(&path)
         .create_if_missing(true)
         .busy_timeout(config.busy_timeout);

      let write_conn = SqlitePoolOptions::new()
         .max_connections(1)
         .idle_timeout(config.idle_timeout)
         .connect_with(write_options)
         .await?;

      let read_options = SqliteConnectOptions::new()
         .filename(&path)
         .read_only(true)
         .busy_timeout(config.busy_timeout);

      let read_pool = SqlitePoolOptions::new()
         .max_connections(config.max_read_connections.max(1))
         .idle_timeout(config.idle_timeout)
         .connect_with(read_options)
         .await?;

      debug!(
         path = %path.display(),
         max_read_connections = config.max_read_connections,
         "Connected SQLite store"
      );

      Ok(Arc::new(Self {
         read_pool,
         write_conn,
         wal_initialized: AtomicBool::new(false),
         closed: AtomicBool::new(false),
         path,
      }))
   }

   /// Returns the read-only pool, or `DatabaseClosed` after `close()`
   pub fn read_pool(&self) -> Result<&Pool<Sqlite>> {
      self.ensure_open()?;
      Ok(&self.read_pool)
   }

   /// Acquire exclusive write access.
   ///
   /// Waits for the single writer connection. The first acquisition switches
   /// the database to WAL journal mode.
   pub async fn acquire_writer(&self) -> Result<WriteGuard> {
      self.ensure_open()?;
      let mut conn = self.write_conn.acquire().await?;

      if !self.wal_initialized.load(Ordering::Acquire) {
         sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&mut *conn)
            .await?;
         self.wal_initialized.store(true, Ordering::Release);
         debug!(path = %self.path.display(), "Enabled WAL journal mode");
      }

      Ok(WriteGuard::new(conn))
   }

   /// Close both pools. Further use returns `DatabaseClosed`.
   pub async fn close(&self) -> Result<()> {
      if self.closed.swap(true, Ordering::AcqRel) {
         return Ok(());
      }
      self.write_conn.close().await;
      self.read_pool.close().await;
      debug!(path = %self.path.display(), "Closed SQLite store");
      Ok(())
   }

   fn ensure_open(&self) -> Result<()> {
      if self.closed.load(Ordering::Acquire) {
         return Err(Error::DatabaseClosed);
      }
      Ok(())
   }
}
