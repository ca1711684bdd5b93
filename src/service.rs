//! The public service facade.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ServiceConfig;
use crate::engine::{ConnectionFactory, OperationOutput, OperationRequest, Row, default_factory};
use crate::error::{ConnectionError, Error, Result};
use crate::events::{EventBus, ServiceEvent};
use crate::fallback::{FallbackExecutor, SecondaryStore};
use crate::pool::{ConnectionPool, PoolSettings};
use crate::queue::{OperationQueue, QueueSettings, RetryCoordinator};
use crate::schema::ANALYTICS_SCHEMA;

const WARNING_QUEUE_LENGTH: usize = 10;
const CRITICAL_QUEUE_LENGTH: usize = 50;

/// Where operations are currently routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceMode {
   Uninitialized,
   /// Operations go through the queue to the engine
   Engine,
   /// Operations bypass the engine and run on the secondary store
   FallbackOnly,
   /// Engine startup failed with fallback disabled; operations return the
   /// recorded [`Error::Init`] until `initialize` or `shutdown` is called
   Failed,
}

impl ServiceMode {
   /// True once operations can be served
   pub fn is_ready(self) -> bool {
      matches!(self, ServiceMode::Engine | ServiceMode::FallbackOnly)
   }
}

/// Coarse health classification derived from pool and queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolHealth {
   Healthy,
   Warning,
   Critical,
}

impl PoolHealth {
   pub fn classify(initialized: bool, total: usize, healthy: usize, queue_length: usize) -> Self {
      if !initialized || total == 0 || healthy == 0 || queue_length > CRITICAL_QUEUE_LENGTH {
         PoolHealth::Critical
      } else if queue_length > WARNING_QUEUE_LENGTH || healthy * 2 < total {
         PoolHealth::Warning
      } else {
         PoolHealth::Healthy
      }
   }
}

/// Point-in-time view of the service for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
   pub initialized: bool,
   /// Configured escalation to the secondary store
   pub fallback_enabled: bool,
   /// Running in fallback-only mode
   pub fallback_active: bool,
   pub total_connections: usize,
   pub active_connections: usize,
   pub healthy_connections: usize,
   pub queue_length: usize,
   pub pool_health: PoolHealth,
   pub last_init_error: Option<String>,
}

struct Maintenance {
   cancel: CancellationToken,
   task: JoinHandle<()>,
}

struct ServiceState {
   mode: ServiceMode,
   last_init_error: Option<String>,
   // Set while mode is Failed
   init_failure: Option<Arc<Error>>,
   maintenance: Option<Maintenance>,
}

struct ServiceInner {
   config: ServiceConfig,
   factory: Arc<dyn ConnectionFactory>,
   schema: Vec<String>,
   events: EventBus,
   pool: ConnectionPool,
   queue: OperationQueue,
   fallback: FallbackExecutor,
   state: RwLock<ServiceState>,
   // Serializes initialize() and shutdown()
   lifecycle: Mutex<()>,
}

/// Builder for [`AnalyticsService`].
pub struct AnalyticsServiceBuilder {
   config: ServiceConfig,
   factory: Option<Arc<dyn ConnectionFactory>>,
   schema: Vec<String>,
}

impl AnalyticsServiceBuilder {
   /// Use a specific engine factory instead of the compiled-in one
   pub fn factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
      self.factory = Some(factory);
      self
   }

   /// Replace the statements run when the engine starts.
   ///
   /// Defaults to [`ANALYTICS_SCHEMA`].
   pub fn schema<I, S>(mut self, statements: I) -> Self
   where
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      self.schema = statements.into_iter().map(Into::into).collect();
      self
   }

   pub fn build(self, store: Arc<dyn SecondaryStore>) -> Result<AnalyticsService> {
      let config = self.config;
      config.validate()?;

      let factory = self
         .factory
         .unwrap_or_else(|| default_factory(&config.storage_path));
      let events = EventBus::new(config.event_capacity);

      let pool = ConnectionPool::new(
         Arc::clone(&factory),
         PoolSettings {
            max_connections: config.max_connections,
            max_idle_time: config.max_idle_time,
            acquire_poll_interval: config.acquire_poll_interval,
         },
         events.clone(),
      );
      let fallback = FallbackExecutor::new(store, events.clone());
      let queue = OperationQueue::new(
         pool.clone(),
         config.fallback_enabled.then(|| fallback.clone()),
         QueueSettings {
            operation_timeout: config.operation_timeout,
            acquire_timeout: config.acquire_timeout,
            retry: RetryCoordinator {
               attempts: config.retry_attempts,
               delay: config.retry_delay,
               backoff: config.retry_backoff,
            },
         },
      );

      Ok(AnalyticsService {
         inner: Arc::new(ServiceInner {
            config,
            factory,
            schema: self.schema,
            events,
            pool,
            queue,
            fallback,
            state: RwLock::new(ServiceState {
               mode: ServiceMode::Uninitialized,
               last_init_error: None,
               init_failure: None,
               maintenance: None,
            }),
            lifecycle: Mutex::new(()),
         }),
      })
   }
}

/// Resilient front end to the analytical engine.
///
/// Queries and writes are queued onto a bounded connection pool, retried on
/// failure, and handed to the secondary store when the engine keeps failing
/// or is unavailable altogether. Cloning is cheap and every clone drives the
/// same service.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use analytics_pool::{AnalyticsService, ServiceConfig};
/// use sqlx_sqlite_store::SqliteStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = SqliteStore::connect("analytics-fallback.db", None).await?;
/// let service = AnalyticsService::new(ServiceConfig::from_env()?, Arc::new(store))?;
///
/// service.initialize().await?;
/// service.run("INSERT INTO t VALUES (?)", vec![1.into()]).await?;
/// let rows = service.query("SELECT * FROM t", vec![]).await?;
///
/// service.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct AnalyticsService {
   inner: Arc<ServiceInner>,
}

impl AnalyticsService {
   /// A service using the compiled-in engine factory and the default schema
   pub fn new(config: ServiceConfig, store: Arc<dyn SecondaryStore>) -> Result<Self> {
      Self::builder(config).build(store)
   }

   pub fn builder(config: ServiceConfig) -> AnalyticsServiceBuilder {
      AnalyticsServiceBuilder {
         config,
         factory: None,
         schema: ANALYTICS_SCHEMA.iter().map(|s| s.to_string()).collect(),
      }
   }

   pub fn config(&self) -> &ServiceConfig {
      &self.inner.config
   }

   pub fn mode(&self) -> ServiceMode {
      self.inner.state.read().mode
   }

   pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
      self.inner.events.subscribe()
   }

   /// Bring the service up. Calling it again once up is a no-op.
   ///
   /// An unavailable engine (or `skip_engine`) selects fallback-only mode.
   /// Any other startup failure selects fallback-only mode when fallback is
   /// enabled and is returned as [`Error::Init`] otherwise. After such a
   /// failure only an explicit call here tries the engine again.
   pub async fn initialize(&self) -> Result<()> {
      let _lifecycle = self.inner.lifecycle.lock().await;
      if self.mode().is_ready() {
         return Ok(());
      }

      let config = &self.inner.config;
      if config.skip_engine {
         self.enter_fallback_only("analytical engine disabled by configuration".to_string(), None)
            .await;
         return Ok(());
      }

      info!(path = %config.storage_path.display(), "Initializing analytics service");
      self.inner.queue.reopen();

      match self.start_engine().await {
         Ok(()) => {
            let maintenance = self.start_maintenance();
            {
               let mut state = self.inner.state.write();
               state.mode = ServiceMode::Engine;
               state.last_init_error = None;
               state.init_failure = None;
               state.maintenance = Some(maintenance);
            }
            if config.fallback_enabled {
               self.inner.fallback.prepare(&self.inner.schema).await;
            }
            info!(max_connections = config.max_connections, "Analytics service initialized");
            self.inner.events.emit(ServiceEvent::Initialized);
            Ok(())
         }
         Err(Error::Connection(ConnectionError::Unavailable(reason))) => {
            self.enter_fallback_only(reason.clone(), Some(reason)).await;
            Ok(())
         }
         Err(e) => {
            self.inner.pool.close_all().await;
            self.inner.factory.reset();
            let message = e.to_string();

            if config.fallback_enabled {
               warn!(error = %e, "Engine initialization failed; continuing in fallback-only mode");
               self.enter_fallback_only(message.clone(), Some(message)).await;
               Ok(())
            } else {
               error!(error = %e, "Engine initialization failed");
               let source = Arc::new(e);
               {
                  let mut state = self.inner.state.write();
                  state.mode = ServiceMode::Failed;
                  state.last_init_error = Some(message);
                  state.init_failure = Some(Arc::clone(&source));
               }
               Err(Error::Init { source })
            }
         }
      }
   }

   async fn start_engine(&self) -> Result<()> {
      let deadline = Instant::now() + self.inner.config.acquire_timeout;
      let conn = self.inner.pool.acquire(deadline).await?;

      for statement in &self.inner.schema {
         if let Err(e) = conn.run(statement, &[]).await {
            conn.finish(true);
            return Err(e);
         }
      }
      debug!(statements = self.inner.schema.len(), "Applied engine schema");

      conn.finish(false);
      Ok(())
   }

   async fn enter_fallback_only(&self, reason: String, init_error: Option<String>) {
      warn!(reason = %reason, "Analytics service running in fallback-only mode");
      {
         let mut state = self.inner.state.write();
         state.mode = ServiceMode::FallbackOnly;
         state.last_init_error = init_error;
         state.init_failure = None;
      }
      self.inner.fallback.prepare(&self.inner.schema).await;
      self.inner.events.emit(ServiceEvent::FallbackEnabled { reason });
   }

   fn start_maintenance(&self) -> Maintenance {
      let cancel = CancellationToken::new();
      let task = tokio::spawn(maintenance_loop(
         self.inner.pool.clone(),
         self.inner.config.idle_check_interval,
         self.inner.config.health_check_interval,
         cancel.clone(),
      ));
      Maintenance { cancel, task }
   }

   /// Run a statement that returns rows
   pub async fn query(&self, sql: impl Into<String>, params: Vec<JsonValue>) -> Result<Vec<Row>> {
      self
         .execute(OperationRequest::query(sql, params))
         .await
         .map(OperationOutput::into_rows)
   }

   /// Run a statement for its effect; returns the number of rows affected
   pub async fn run(&self, sql: impl Into<String>, params: Vec<JsonValue>) -> Result<u64> {
      self
         .execute(OperationRequest::run(sql, params))
         .await
         .map(|output| output.affected())
   }

   /// Route `request` by the current mode, initializing first if needed.
   ///
   /// A recorded initialization failure is returned without touching the
   /// engine again.
   pub async fn execute(&self, request: OperationRequest) -> Result<OperationOutput> {
      let mut route = self.route();
      if route.0 == ServiceMode::Uninitialized {
         self.initialize().await?;
         route = self.route();
      }

      match route {
         (ServiceMode::Engine, _) => {
            let rx = self.inner.queue.enqueue(request);
            // A dropped sender means the queue went away mid-shutdown
            rx.await.unwrap_or(Err(Error::Shutdown))
         }
         (ServiceMode::FallbackOnly, _) => self.inner.fallback.execute(&request, None).await,
         (ServiceMode::Failed, Some(source)) => Err(Error::Init { source }),
         (ServiceMode::Failed, None) | (ServiceMode::Uninitialized, _) => Err(Error::Shutdown),
      }
   }

   fn route(&self) -> (ServiceMode, Option<Arc<Error>>) {
      let state = self.inner.state.read();
      (state.mode, state.init_failure.clone())
   }

   /// Stop maintenance, resolve pending work with [`Error::Shutdown`] and close
   /// every connection.
   ///
   /// The service can be initialized again afterwards.
   pub async fn shutdown(&self) -> Result<()> {
      let _lifecycle = self.inner.lifecycle.lock().await;

      let maintenance = {
         let mut state = self.inner.state.write();
         state.mode = ServiceMode::Uninitialized;
         state.init_failure = None;
         state.maintenance.take()
      };

      if let Some(maintenance) = maintenance {
         maintenance.cancel.cancel();
         if let Err(e) = maintenance.task.await {
            warn!(error = %e, "Maintenance task ended abnormally");
         }
      }

      let cancelled = self.inner.queue.close().await;
      let closed = self.inner.pool.close_all().await;
      self.inner.factory.reset();

      info!(cancelled, closed, "Analytics service shut down");
      self.inner.events.emit(ServiceEvent::Shutdown);
      Ok(())
   }

   pub fn stats(&self) -> ServiceStats {
      let (mode, last_init_error) = {
         let state = self.inner.state.read();
         (state.mode, state.last_init_error.clone())
      };
      let pool = self.inner.pool.stats();
      let queue_length = self.inner.queue.len();
      let initialized = mode.is_ready();

      ServiceStats {
         initialized,
         fallback_enabled: self.inner.config.fallback_enabled,
         fallback_active: mode == ServiceMode::FallbackOnly,
         total_connections: pool.total,
         active_connections: pool.active,
         healthy_connections: pool.healthy,
         queue_length,
         pool_health: PoolHealth::classify(initialized, pool.total, pool.healthy, queue_length),
         last_init_error,
      }
   }
}

async fn maintenance_loop(
   pool: ConnectionPool,
   idle_every: Duration,
   health_every: Duration,
   cancel: CancellationToken,
) {
   let start = Instant::now();
   let mut idle_tick = tokio::time::interval_at(start + idle_every, idle_every);
   let mut health_tick = tokio::time::interval_at(start + health_every, health_every);
   idle_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
   health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

   loop {
      tokio::select! {
         biased;
         _ = cancel.cancelled() => break,
         _ = idle_tick.tick() => {
            let evicted = pool.evict_idle(Instant::now()).await;
            if evicted > 0 {
               debug!(evicted, "Evicted idle connections");
            }
         }
         _ = health_tick.tick() => {
            let report = pool.health_check().await;
            trace!(probed = report.probed, failed = report.failed, "Health check complete");
         }
      }
   }

   trace!("Maintenance stopped");
}
