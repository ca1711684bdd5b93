//! Bounded pool of engine connections with per-connection health tracking.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::engine::{ConnectionFactory, EngineConnection};
use crate::error::{Error, Result};
use crate::events::{EventBus, ServiceEvent};

/// Consecutive-failure count above which a connection is marked unhealthy.
pub const UNHEALTHY_ERROR_THRESHOLD: u32 = 5;

const PROBE_SQL: &str = "SELECT 1";

/// Opaque identifier of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
   pub(crate) fn from_raw(raw: u64) -> Self {
      Self(raw)
   }

   pub fn get(self) -> u64 {
      self.0
   }
}

impl fmt::Display for ConnectionId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "conn-{}", self.0)
   }
}

/// Pool sizing and timing knobs.
#[derive(Debug, Clone)]
pub struct PoolSettings {
   pub max_connections: usize,
   pub max_idle_time: Duration,
   pub acquire_poll_interval: Duration,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
   pub total: usize,
   pub active: usize,
   pub healthy: usize,
   pub idle: usize,
}

/// Outcome of one health-probe sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthCheckReport {
   pub probed: usize,
   pub failed: usize,
}

struct PoolEntry {
   conn: Arc<dyn EngineConnection>,
   in_use: bool,
   healthy: bool,
   error_count: u32,
   last_used_at: Instant,
   created_at: Instant,
}

#[derive(Default)]
struct PoolState {
   entries: IndexMap<ConnectionId, PoolEntry>,
   /// Slots reserved by acquirers that are still opening a connection
   opening: usize,
   next_id: u64,
}

struct PoolShared {
   factory: Arc<dyn ConnectionFactory>,
   settings: PoolSettings,
   state: Mutex<PoolState>,
   released: Notify,
   events: EventBus,
}

enum Checkout {
   Ready(ConnectionId, Arc<dyn EngineConnection>),
   Open(ConnectionId),
   Full,
}

impl PoolShared {
   fn try_checkout(&self) -> Checkout {
      let mut state = self.state.lock();
      let now = Instant::now();

      if let Some((id, entry)) = state
         .entries
         .iter_mut()
         .find(|(_, e)| e.healthy && !e.in_use)
      {
         entry.in_use = true;
         entry.last_used_at = now;
         return Checkout::Ready(*id, Arc::clone(&entry.conn));
      }

      if state.entries.len() + state.opening < self.settings.max_connections {
         state.opening += 1;
         state.next_id += 1;
         return Checkout::Open(ConnectionId(state.next_id));
      }

      Checkout::Full
   }

   fn release(&self, id: ConnectionId, had_error: bool) {
      let mut became_unhealthy = false;
      {
         let mut state = self.state.lock();
         let Some(entry) = state.entries.get_mut(&id) else {
            trace!(%id, "Released connection is no longer pooled");
            return;
         };

         entry.in_use = false;
         entry.last_used_at = Instant::now();
         if had_error {
            entry.error_count += 1;
            if entry.error_count > UNHEALTHY_ERROR_THRESHOLD && entry.healthy {
               entry.healthy = false;
               became_unhealthy = true;
            }
         } else {
            entry.error_count = entry.error_count.saturating_sub(1);
         }
      }

      if became_unhealthy {
         warn!(%id, threshold = UNHEALTHY_ERROR_THRESHOLD, "Connection marked unhealthy");
         self.events.emit(ServiceEvent::ConnectionUnhealthy { id });
      }
      self.released.notify_one();
   }
}

/// Gives back a reserved-but-unfilled slot if opening fails or is abandoned.
struct OpeningSlot<'a> {
   shared: &'a PoolShared,
   armed: bool,
}

impl Drop for OpeningSlot<'_> {
   fn drop(&mut self) {
      if self.armed {
         self.shared.state.lock().opening -= 1;
         self.shared.released.notify_one();
      }
   }
}

/// Bounded set of engine connections.
///
/// Hands out [`PooledConnection`] checkouts; each connection is lent to at
/// most one holder at a time.
#[derive(Clone)]
pub struct ConnectionPool {
   shared: Arc<PoolShared>,
}

impl ConnectionPool {
   pub fn new(factory: Arc<dyn ConnectionFactory>, settings: PoolSettings, events: EventBus) -> Self {
      Self {
         shared: Arc::new(PoolShared {
            factory,
            settings,
            state: Mutex::new(PoolState::default()),
            released: Notify::new(),
            events,
         }),
      }
   }

   /// Check out a connection, waiting until `deadline` if the pool is full.
   ///
   /// Prefers an idle healthy connection, then opens a new one while below
   /// `max_connections`. Unhealthy connections are never handed out.
   pub async fn acquire(&self, deadline: Instant) -> Result<PooledConnection> {
      let started = Instant::now();

      loop {
         match self.shared.try_checkout() {
            Checkout::Ready(id, conn) => {
               trace!(%id, "Checked out pooled connection");
               return Ok(PooledConnection::new(id, conn, Arc::clone(&self.shared)));
            }
            Checkout::Open(id) => return self.open(id).await,
            Checkout::Full => {}
         }

         let now = Instant::now();
         if now >= deadline {
            return Err(Error::AcquireTimeout {
               waited: now.duration_since(started),
            });
         }

         // Woken early by releases; the poll interval bounds missed wakeups.
         let wait = (deadline - now).min(self.shared.settings.acquire_poll_interval);
         let _ = tokio::time::timeout(wait, self.shared.released.notified()).await;
      }
   }

   async fn open(&self, id: ConnectionId) -> Result<PooledConnection> {
      let mut slot = OpeningSlot {
         shared: &self.shared,
         armed: true,
      };

      let conn = self.shared.factory.create().await?;

      {
         let mut state = self.shared.state.lock();
         state.opening -= 1;
         let now = Instant::now();
         state.entries.insert(
            id,
            PoolEntry {
               conn: Arc::clone(&conn),
               in_use: true,
               healthy: true,
               error_count: 0,
               last_used_at: now,
               created_at: now,
            },
         );
      }
      slot.armed = false;

      debug!(%id, "Opened engine connection");
      self.shared.events.emit(ServiceEvent::ConnectionCreated { id });
      Ok(PooledConnection::new(id, conn, Arc::clone(&self.shared)))
   }

   /// Return a connection by id. Prefer [`PooledConnection::finish`].
   pub fn release(&self, id: ConnectionId, had_error: bool) {
      self.shared.release(id, had_error);
   }

   /// Close idle connections that are expired or unhealthy, keeping at least one.
   ///
   /// Unhealthy connections are evicted before merely idle ones.
   pub async fn evict_idle(&self, now: Instant) -> usize {
      let max_idle = self.shared.settings.max_idle_time;

      let evicted: Vec<(ConnectionId, Arc<dyn EngineConnection>)> = {
         let mut state = self.shared.state.lock();
         let mut candidates: Vec<(ConnectionId, bool)> = state
            .entries
            .iter()
            .filter(|(_, e)| {
               !e.in_use && (!e.healthy || now.saturating_duration_since(e.last_used_at) > max_idle)
            })
            .map(|(id, e)| (*id, e.healthy))
            .collect();
         candidates.sort_by_key(|(_, healthy)| *healthy);

         let mut remaining = state.entries.len();
         let mut evicted = Vec::new();
         for (id, _) in candidates {
            if remaining <= 1 {
               break;
            }
            if let Some(entry) = state.entries.shift_remove(&id) {
               remaining -= 1;
               evicted.push((id, entry.conn));
            }
         }
         evicted
      };

      let count = evicted.len();
      for (id, conn) in evicted {
         if let Err(e) = conn.close().await {
            warn!(%id, error = %e, "Failed to close evicted connection");
         }
         debug!(%id, "Evicted idle connection");
         self.shared.events.emit(ServiceEvent::ConnectionClosed { id });
      }
      count
   }

   /// Probe every idle connection with a trivial query.
   ///
   /// Probed connections are reserved for the duration of their probe.
   /// Success resets the error count and restores health; failure marks the
   /// connection unhealthy.
   pub async fn health_check(&self) -> HealthCheckReport {
      let probes: Vec<(ConnectionId, Arc<dyn EngineConnection>)> = {
         let mut state = self.shared.state.lock();
         state
            .entries
            .iter_mut()
            .filter(|(_, e)| !e.in_use)
            .map(|(id, e)| {
               e.in_use = true;
               (*id, Arc::clone(&e.conn))
            })
            .collect()
      };

      let mut report = HealthCheckReport {
         probed: probes.len(),
         failed: 0,
      };

      for (id, conn) in probes {
         let result = conn.query(PROBE_SQL, &[]).await;

         let was_healthy = {
            let mut state = self.shared.state.lock();
            let Some(entry) = state.entries.get_mut(&id) else {
               continue;
            };
            entry.in_use = false;
            let was_healthy = entry.healthy;
            match &result {
               Ok(_) => {
                  entry.error_count = 0;
                  entry.healthy = true;
               }
               Err(_) => {
                  entry.error_count += 1;
                  entry.healthy = false;
               }
            }
            was_healthy
         };
         self.shared.released.notify_one();

         if let Err(e) = result {
            report.failed += 1;
            warn!(%id, error = %e, "Connection health check failed");
            self.shared.events.emit(ServiceEvent::HealthCheckFailed {
               id,
               error: e.to_string(),
            });
            if was_healthy {
               self.shared.events.emit(ServiceEvent::ConnectionUnhealthy { id });
            }
         } else if !was_healthy {
            debug!(%id, "Connection recovered after health check");
         }
      }

      report
   }

   /// Close every connection, in use or not.
   ///
   /// Close failures are logged and do not stop the sweep.
   pub async fn close_all(&self) -> usize {
      let drained: Vec<(ConnectionId, PoolEntry)> = self.shared.state.lock().entries.drain(..).collect();

      let count = drained.len();
      for (id, entry) in drained {
         if let Err(e) = entry.conn.close().await {
            warn!(%id, error = %e, "Failed to close connection during shutdown");
         }
         debug!(
            %id,
            age_ms = entry.created_at.elapsed().as_millis() as u64,
            "Closed engine connection"
         );
         self.shared.events.emit(ServiceEvent::ConnectionClosed { id });
      }
      count
   }

   pub fn stats(&self) -> PoolStats {
      let state = self.shared.state.lock();
      let total = state.entries.len();
      let active = state.entries.values().filter(|e| e.in_use).count();
      let healthy = state.entries.values().filter(|e| e.healthy).count();
      PoolStats {
         total,
         active,
         healthy,
         idle: total - active,
      }
   }

   pub fn settings(&self) -> &PoolSettings {
      &self.shared.settings
   }
}

/// Checkout of one pooled connection.
///
/// Give it back with [`finish`](Self::finish). Dropping an unfinished
/// checkout returns the connection without recording an error.
#[must_use = "if unused, the connection is immediately returned to the pool"]
pub struct PooledConnection {
   id: ConnectionId,
   conn: Arc<dyn EngineConnection>,
   pool: Arc<PoolShared>,
   finished: bool,
}

impl PooledConnection {
   fn new(id: ConnectionId, conn: Arc<dyn EngineConnection>, pool: Arc<PoolShared>) -> Self {
      Self {
         id,
         conn,
         pool,
         finished: false,
      }
   }

   pub fn id(&self) -> ConnectionId {
      self.id
   }

   /// Return the connection, recording whether the operation failed
   pub fn finish(mut self, had_error: bool) {
      self.finished = true;
      self.pool.release(self.id, had_error);
   }
}

impl fmt::Debug for PooledConnection {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("PooledConnection")
         .field("id", &self.id)
         .field("finished", &self.finished)
         .finish_non_exhaustive()
   }
}

impl Deref for PooledConnection {
   type Target = dyn EngineConnection;

   fn deref(&self) -> &Self::Target {
      self.conn.as_ref()
   }
}

impl Drop for PooledConnection {
   fn drop(&mut self) {
      if !self.finished {
         trace!(id = %self.id, "Unfinished checkout dropped");
         self.pool.release(self.id, false);
      }
   }
}
