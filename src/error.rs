//! Error types for analytics-pool

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Failures opening a physical engine connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
   /// The engine library is not available in this build
   #[error("Analytical engine unavailable: {0}")]
   Unavailable(String),

   /// The storage directory could not be created
   #[error("Failed to create storage directory {}: {source}", path.display())]
   CreateDirectory {
      path: PathBuf,
      #[source]
      source: std::io::Error,
   },

   /// The engine refused to open the database
   #[error("Failed to open analytical database: {0}")]
   Open(String),
}

/// Errors surfaced by the service and its components.
#[derive(Error, Debug)]
pub enum Error {
   #[error(transparent)]
   Connection(#[from] ConnectionError),

   /// No pooled connection became available before the deadline
   #[error("Timed out after {waited:?} waiting for a pooled connection")]
   AcquireTimeout { waited: Duration },

   /// The engine rejected the operation (syntax, constraint, runtime)
   #[error("Engine execution failed: {0}")]
   Execution(String),

   /// The operation waited in the queue past its deadline
   #[error("Operation timed out in queue after {waited:?} (timeout {timeout:?})")]
   Timeout { waited: Duration, timeout: Duration },

   /// The secondary store also failed
   #[error("Fallback execution failed: {source}{}", describe_original(.original))]
   Fallback {
      #[source]
      source: sqlx_sqlite_store::Error,
      original: Option<Box<Error>>,
   },

   /// The service shut down while the operation was pending
   #[error("Service shut down before the operation completed")]
   Shutdown,

   /// Initialization failed and fallback is disabled.
   ///
   /// Operations keep returning the same failure until the service is
   /// initialized again or shut down.
   #[error("Initialization failed: {source}")]
   Init {
      #[source]
      source: Arc<Error>,
   },

   #[error("Invalid configuration: {0}")]
   Config(String),
}

impl Error {
   /// True for the engine-side failures the retry coordinator retries
   pub fn is_retryable(&self) -> bool {
      matches!(
         self,
         Error::Execution(_) | Error::AcquireTimeout { .. } | Error::Connection(_)
      )
   }
}

fn describe_original(original: &Option<Box<Error>>) -> String {
   match original {
      Some(e) => format!(" (engine error: {e})"),
      None => String::new(),
   }
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;
