//! Configuration for the SQLite secondary store

use std::time::Duration;

/// Configuration for `SqliteDatabase` connection pools
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_store::SqliteDatabaseConfig;
/// use std::time::Duration;
///
/// let config = SqliteDatabaseConfig {
///     max_read_connections: 2,
///     ..Default::default()
/// };
/// assert_eq!(config.idle_timeout, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct SqliteDatabaseConfig {
   /// Maximum number of concurrent read connections
   ///
   /// Fallback reads run here while the analytical engine is degraded, so
   /// this bounds how much read load the store absorbs at once.
   ///
   /// Default: 4
   pub max_read_connections: u32,

   /// Idle timeout for both read and write connections
   ///
   /// Default: 30 seconds
   pub idle_timeout: Duration,

   /// How long a statement waits on a locked database before failing
   ///
   /// Default: 5 seconds
   pub busy_timeout: Duration,
}

impl Default for SqliteDatabaseConfig {
   fn default() -> Self {
      Self {
         max_read_connections: 4,
         idle_timeout: Duration::from_secs(30),
         busy_timeout: Duration::from_secs(5),
      }
   }
}
