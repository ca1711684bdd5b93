//! Service configuration

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How the delay between retry attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetryBackoff {
   /// Every retry waits `retry_delay`
   Fixed,
   /// Retry `n` waits `retry_delay * n`
   #[default]
   Linear,
   /// Retry `n` waits `retry_delay * 2^(n-1)`
   Exponential,
}

impl RetryBackoff {
   /// Delay before retry number `attempt` (1-based)
   pub fn delay(self, base: Duration, attempt: u32) -> Duration {
      let attempt = attempt.max(1);
      match self {
         RetryBackoff::Fixed => base,
         RetryBackoff::Linear => base.saturating_mul(attempt),
         RetryBackoff::Exponential => {
            base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
         }
      }
   }
}

impl FromStr for RetryBackoff {
   type Err = Error;

   fn from_str(s: &str) -> Result<Self> {
      match s.trim().to_ascii_lowercase().as_str() {
         "fixed" => Ok(RetryBackoff::Fixed),
         "linear" => Ok(RetryBackoff::Linear),
         "exponential" => Ok(RetryBackoff::Exponential),
         other => Err(Error::Config(format!("unknown retry backoff '{other}'"))),
      }
   }
}

/// Configuration for [`AnalyticsService`](crate::AnalyticsService).
///
/// Immutable once the service is constructed.
///
/// # Examples
///
/// ```
/// use analytics_pool::ServiceConfig;
/// use std::time::Duration;
///
/// let config = ServiceConfig {
///     max_connections: 5,
///     retry_delay: Duration::from_millis(250),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ServiceConfig {
   /// Engine database file, or `:memory:`
   ///
   /// Default: `./data/analytics.duckdb`
   pub storage_path: PathBuf,

   /// Upper bound on physical engine connections, at least 1
   ///
   /// Default: 3
   pub max_connections: usize,

   /// Idle connections unused for longer than this are evicted (pool floor of 1)
   ///
   /// Default: 300 seconds
   pub max_idle_time: Duration,

   /// How long an operation may wait in the queue before dispatch
   ///
   /// Default: 30 seconds
   pub operation_timeout: Duration,

   /// Route exhausted or engine-less operations to the secondary store
   ///
   /// Default: true
   pub fallback_enabled: bool,

   /// Retries after the first failed attempt
   ///
   /// Default: 3
   pub retry_attempts: u32,

   /// Base delay between attempts, scaled by `retry_backoff`
   ///
   /// Default: 1 second
   pub retry_delay: Duration,

   /// Default: [`RetryBackoff::Linear`]
   pub retry_backoff: RetryBackoff,

   /// Longest a dispatch waits for a free connection
   ///
   /// Default: 10 seconds
   pub acquire_timeout: Duration,

   /// Re-check period while waiting for a connection
   ///
   /// Default: 100 milliseconds
   pub acquire_poll_interval: Duration,

   /// Period of the idle-eviction sweep
   ///
   /// Default: 60 seconds
   pub idle_check_interval: Duration,

   /// Period of the connection health probe
   ///
   /// Default: 120 seconds
   pub health_check_interval: Duration,

   /// Never touch the engine; run in fallback-only mode
   ///
   /// Default: false
   pub skip_engine: bool,

   /// Buffer size of the service event channel
   ///
   /// Default: 256
   pub event_capacity: usize,
}

impl Default for ServiceConfig {
   fn default() -> Self {
      Self {
         storage_path: PathBuf::from("./data/analytics.duckdb"),
         max_connections: 3,
         max_idle_time: Duration::from_millis(300_000),
         operation_timeout: Duration::from_millis(30_000),
         fallback_enabled: true,
         retry_attempts: 3,
         retry_delay: Duration::from_millis(1_000),
         retry_backoff: RetryBackoff::default(),
         acquire_timeout: Duration::from_secs(10),
         acquire_poll_interval: Duration::from_millis(100),
         idle_check_interval: Duration::from_secs(60),
         health_check_interval: Duration::from_secs(120),
         skip_engine: false,
         event_capacity: 256,
      }
   }
}

impl ServiceConfig {
   /// Build a configuration from `DUCKDB_*` environment variables.
   ///
   /// Unset variables keep their defaults; malformed values are an error.
   pub fn from_env() -> Result<Self> {
      Self::from_lookup(|key| std::env::var(key).ok())
   }

   /// Same as [`from_env`](Self::from_env) with an explicit variable source
   pub fn from_lookup<F>(lookup: F) -> Result<Self>
   where
      F: Fn(&str) -> Option<String>,
   {
      let mut config = Self::default();

      if let Some(path) = lookup("DUCKDB_PATH") {
         config.storage_path = PathBuf::from(path);
      }
      if let Some(v) = parse_var::<usize>(&lookup, "DUCKDB_MAX_CONNECTIONS")? {
         config.max_connections = v;
      }
      if let Some(v) = parse_var::<u64>(&lookup, "DUCKDB_MAX_IDLE_TIME_MS")? {
         config.max_idle_time = Duration::from_millis(v);
      }
      if let Some(v) = parse_var::<u64>(&lookup, "DUCKDB_OPERATION_TIMEOUT_MS")? {
         config.operation_timeout = Duration::from_millis(v);
      }
      if let Some(v) = parse_flag(&lookup, "DUCKDB_FALLBACK_ENABLED")? {
         config.fallback_enabled = v;
      }
      if let Some(v) = parse_var::<u32>(&lookup, "DUCKDB_RETRY_ATTEMPTS")? {
         config.retry_attempts = v;
      }
      if let Some(v) = parse_var::<u64>(&lookup, "DUCKDB_RETRY_DELAY_MS")? {
         config.retry_delay = Duration::from_millis(v);
      }
      if let Some(v) = parse_var::<RetryBackoff>(&lookup, "DUCKDB_RETRY_BACKOFF")? {
         config.retry_backoff = v;
      }
      if let Some(v) = parse_flag(&lookup, "SKIP_DUCKDB")? {
         config.skip_engine = v;
      }

      config.validate()?;
      Ok(config)
   }

   pub fn validate(&self) -> Result<()> {
      if self.max_connections == 0 {
         return Err(Error::Config("max_connections must be at least 1".into()));
      }
      for (name, interval) in [
         ("acquire_poll_interval", self.acquire_poll_interval),
         ("idle_check_interval", self.idle_check_interval),
         ("health_check_interval", self.health_check_interval),
      ] {
         if interval.is_zero() {
            return Err(Error::Config(format!("{name} must be greater than zero")));
         }
      }
      if self.event_capacity == 0 {
         return Err(Error::Config("event_capacity must be at least 1".into()));
      }
      Ok(())
   }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
   T: FromStr,
{
   match lookup(key) {
      None => Ok(None),
      Some(raw) => raw
         .trim()
         .parse::<T>()
         .map(Some)
         .map_err(|_| Error::Config(format!("{key} has invalid value '{raw}'"))),
   }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
   match lookup(key).as_deref().map(str::trim) {
      None => Ok(None),
      Some("1" | "true" | "TRUE" | "yes") => Ok(Some(true)),
      Some("0" | "false" | "FALSE" | "no") => Ok(Some(false)),
      Some(raw) => Err(Error::Config(format!("{key} has invalid flag '{raw}'"))),
   }
}
