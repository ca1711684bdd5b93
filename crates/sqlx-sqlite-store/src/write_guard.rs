use std::ops::{Deref, DerefMut};

use sqlx::Sqlite;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqliteConnection;

/// RAII guard for exclusive write access.
///
/// Holds the only writer connection; dropping it returns the connection to the
/// single-connection write pool. SQLite rolls back any transaction left open.
#[must_use = "if unused, the write lock is immediately released"]
#[derive(Debug)]
pub struct WriteGuard {
   conn: PoolConnection<Sqlite>,
}

impl WriteGuard {
   pub(crate) fn new(conn: PoolConnection<Sqlite>) -> Self {
      Self { conn }
   }
}

impl Deref for WriteGuard {
   type Target = SqliteConnection;

   fn deref(&self) -> &Self::Target {
      &self.conn
   }
}

impl DerefMut for WriteGuard {
   fn deref_mut(&mut self) -> &mut Self::Target {
      &mut self.conn
   }
}
