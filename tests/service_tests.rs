use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use analytics_pool::{
   AnalyticsService, ConnectionError, ConnectionFactory, EngineConnection, Error, PoolHealth, Row,
   ServiceConfig, ServiceEvent, ServiceMode, UnavailableFactory,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value as JsonValue, json};
use sqlx_sqlite_store::SqliteStore;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Shared behaviour of every connection a [`ScriptedFactory`] opens
#[derive(Default)]
struct ScriptedEngine {
   /// Operations left to fail; `u32::MAX` fails forever
   failures: AtomicU32,
   delay: Mutex<Duration>,
   executed: Mutex<Vec<String>>,
   opens: AtomicU32,
   refuse_open: bool,
}

impl ScriptedEngine {
   fn fail_always(&self) {
      self.failures.store(u32::MAX, Ordering::SeqCst);
   }

   fn executed(&self) -> Vec<String> {
      self.executed.lock().clone()
   }

   async fn perform(&self, sql: &str) -> analytics_pool::Result<()> {
      self.executed.lock().push(sql.to_owned());
      let delay = *self.delay.lock();
      if !delay.is_zero() {
         tokio::time::sleep(delay).await;
      }
      let failed = self
         .failures
         .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
         .is_ok();
      if failed {
         return Err(Error::Execution(format!("engine rejected: {sql}")));
      }
      Ok(())
   }
}

struct ScriptedConnection(Arc<ScriptedEngine>);

#[async_trait]
impl EngineConnection for ScriptedConnection {
   async fn query(&self, sql: &str, _params: &[JsonValue]) -> analytics_pool::Result<Vec<Row>> {
      self.0.perform(sql).await?;
      let mut row = Row::new();
      row.insert("served_by".into(), json!("engine"));
      Ok(vec![row])
   }

   async fn run(&self, sql: &str, _params: &[JsonValue]) -> analytics_pool::Result<u64> {
      self.0.perform(sql).await?;
      Ok(1)
   }

   async fn close(&self) -> analytics_pool::Result<()> {
      Ok(())
   }
}

struct ScriptedFactory(Arc<ScriptedEngine>);

#[async_trait]
impl ConnectionFactory for ScriptedFactory {
   async fn create(&self) -> Result<Arc<dyn EngineConnection>, ConnectionError> {
      self.0.opens.fetch_add(1, Ordering::SeqCst);
      if self.0.refuse_open {
         return Err(ConnectionError::Open("database is locked".into()));
      }
      Ok(Arc::new(ScriptedConnection(Arc::clone(&self.0))))
   }
}

async fn create_store() -> (Arc<SqliteStore>, TempDir) {
   let _ = tracing_subscriber::fmt().with_test_writer().try_init();
   let temp_dir = TempDir::new().expect("Failed to create temp directory");
   let store = SqliteStore::connect(temp_dir.path().join("fallback.db"), None)
      .await
      .expect("Failed to open fallback store");
   (Arc::new(store), temp_dir)
}

fn fast_config() -> ServiceConfig {
   ServiceConfig {
      storage_path: ":memory:".into(),
      retry_attempts: 2,
      retry_delay: Duration::from_millis(10),
      acquire_timeout: Duration::from_millis(500),
      acquire_poll_interval: Duration::from_millis(10),
      ..Default::default()
   }
}

fn scripted_service(
   config: ServiceConfig,
   engine: &Arc<ScriptedEngine>,
   store: Arc<SqliteStore>,
) -> AnalyticsService {
   AnalyticsService::builder(config)
      .factory(Arc::new(ScriptedFactory(Arc::clone(engine))))
      .schema(Vec::<String>::new())
      .build(store)
      .expect("Failed to build service")
}

fn drain_events(rx: &mut broadcast::Receiver<ServiceEvent>) -> Vec<ServiceEvent> {
   let mut events = Vec::new();
   while let Ok(event) = rx.try_recv() {
      events.push(event);
   }
   events
}

#[tokio::test]
async fn engine_mode_serves_from_engine() {
   let (store, _temp) = create_store().await;
   let engine = Arc::new(ScriptedEngine::default());
   let service = scripted_service(fast_config(), &engine, store);

   service.initialize().await.unwrap();
   service.initialize().await.unwrap();
   assert_eq!(service.mode(), ServiceMode::Engine);
   assert_eq!(engine.opens.load(Ordering::SeqCst), 1);

   let rows = service.query("SELECT 1", vec![]).await.unwrap();
   assert_eq!(rows[0]["served_by"], json!("engine"));
   assert_eq!(service.run("INSERT INTO t VALUES (1)", vec![]).await.unwrap(), 1);

   let stats = service.stats();
   assert!(stats.initialized);
   assert!(!stats.fallback_active);
   assert_eq!(stats.total_connections, 1);
   assert_eq!(stats.healthy_connections, 1);
   assert_eq!(stats.active_connections, 0);
   assert_eq!(stats.pool_health, PoolHealth::Healthy);

   service.shutdown().await.unwrap();
}

#[tokio::test]
async fn first_operation_initializes_the_service() {
   let (store, _temp) = create_store().await;
   let engine = Arc::new(ScriptedEngine::default());
   let service = scripted_service(fast_config(), &engine, store);
   assert_eq!(service.stats().pool_health, PoolHealth::Critical);

   service.run("INSERT INTO t VALUES (1)", vec![]).await.unwrap();
   assert_eq!(service.mode(), ServiceMode::Engine);
   assert_eq!(engine.executed(), vec!["INSERT INTO t VALUES (1)".to_string()]);
}

#[tokio::test]
async fn exhausted_retries_fall_back_to_store() {
   let (store, _temp) = create_store().await;
   store
      .execute("CREATE TABLE t (id INTEGER)".into(), vec![])
      .await
      .unwrap();
   store
      .execute("INSERT INTO t (id) VALUES (?)".into(), vec![json!(5)])
      .await
      .unwrap();

   let engine = Arc::new(ScriptedEngine::default());
   let service = scripted_service(fast_config(), &engine, store);
   service.initialize().await.unwrap();
   engine.fail_always();
   let mut events = service.subscribe();

   let rows = service.query("SELECT id FROM t", vec![]).await.unwrap();
   assert_eq!(rows.len(), 1);
   assert_eq!(rows[0]["id"], json!(5));

   // One attempt plus two retries, then the fallback
   assert_eq!(engine.executed().len(), 3);
   let fallback_used = drain_events(&mut events)
      .into_iter()
      .filter(|e| matches!(e, ServiceEvent::FallbackUsed { .. }))
      .count();
   assert_eq!(fallback_used, 1);
}

#[tokio::test]
async fn exhausted_retries_without_fallback_surface_engine_error() {
   let (store, _temp) = create_store().await;
   let engine = Arc::new(ScriptedEngine::default());
   let config = ServiceConfig {
      fallback_enabled: false,
      ..fast_config()
   };
   let service = scripted_service(config, &engine, store);
   service.initialize().await.unwrap();
   engine.fail_always();
   let mut events = service.subscribe();

   let err = service
      .run("UPDATE t SET id = 2", vec![])
      .await
      .unwrap_err();
   assert!(matches!(err, Error::Execution(ref msg) if msg.contains("UPDATE t")), "{err}");
   assert_eq!(engine.executed().len(), 3);
   assert!(
      !drain_events(&mut events)
         .iter()
         .any(|e| matches!(e, ServiceEvent::FallbackUsed { .. }))
   );
}

#[tokio::test]
async fn unavailable_engine_runs_on_translated_fallback() {
   let (store, _temp) = create_store().await;
   let service = AnalyticsService::builder(fast_config())
      .factory(Arc::new(UnavailableFactory::new("no engine in this build")))
      .build(store.clone())
      .unwrap();
   let mut events = service.subscribe();

   service.initialize().await.unwrap();
   assert_eq!(service.mode(), ServiceMode::FallbackOnly);
   assert!(drain_events(&mut events).contains(&ServiceEvent::FallbackEnabled {
      reason: "no engine in this build".into()
   }));

   // Engine-dialect DDL is translated for the store
   service
      .run("CREATE TABLE t (id BIGINT, ref UUID DEFAULT gen_random_uuid())", vec![])
      .await
      .unwrap();
   let affected = service
      .run("INSERT INTO t (id) VALUES (?)", vec![json!(42)])
      .await
      .unwrap();
   assert_eq!(affected, 1);

   let rows = service.query("SELECT id FROM t", vec![]).await.unwrap();
   assert_eq!(rows.len(), 1);
   assert_eq!(rows[0]["id"], json!(42));

   let generated = service.query("SELECT ref FROM t", vec![]).await.unwrap();
   assert_eq!(generated[0]["ref"].as_str().map(str::len), Some(32));

   // The default schema was prepared on the store
   let tables = store
      .fetch_all(
         "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'sentiment_analytics'".into(),
         vec![],
      )
      .await
      .unwrap();
   assert_eq!(tables.len(), 1);

   let stats = service.stats();
   assert!(stats.initialized);
   assert!(stats.fallback_active);
   assert_eq!(stats.total_connections, 0);
   assert_eq!(stats.pool_health, PoolHealth::Critical);
   assert_eq!(stats.last_init_error.as_deref(), Some("no engine in this build"));
}

#[tokio::test]
async fn skip_engine_never_opens_connections() {
   let (store, _temp) = create_store().await;
   let engine = Arc::new(ScriptedEngine::default());
   let config = ServiceConfig {
      skip_engine: true,
      ..fast_config()
   };
   let service = scripted_service(config, &engine, store);

   service.initialize().await.unwrap();
   assert_eq!(service.mode(), ServiceMode::FallbackOnly);
   assert_eq!(engine.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_initialization_without_fallback_is_an_error() {
   let (store, _temp) = create_store().await;
   let engine = Arc::new(ScriptedEngine {
      refuse_open: true,
      ..Default::default()
   });
   let config = ServiceConfig {
      fallback_enabled: false,
      ..fast_config()
   };
   let service = scripted_service(config, &engine, store);

   let err = service.initialize().await.unwrap_err();
   assert!(matches!(
      err,
      Error::Init { ref source } if matches!(**source, Error::Connection(ConnectionError::Open(_)))
   ));
   assert_eq!(service.mode(), ServiceMode::Failed);

   let stats = service.stats();
   assert!(!stats.initialized);
   assert_eq!(stats.pool_health, PoolHealth::Critical);
   assert!(stats.last_init_error.unwrap().contains("database is locked"));
}

#[tokio::test]
async fn failed_initialization_is_not_retried_by_operations() {
   let (store, _temp) = create_store().await;
   let engine = Arc::new(ScriptedEngine {
      refuse_open: true,
      ..Default::default()
   });
   let config = ServiceConfig {
      fallback_enabled: false,
      ..fast_config()
   };
   let service = scripted_service(config, &engine, store);
   service.initialize().await.unwrap_err();

   for _ in 0..2 {
      let err = service.query("SELECT 1", vec![]).await.unwrap_err();
      assert!(err.to_string().contains("database is locked"), "{err}");
      assert!(matches!(err, Error::Init { .. }));
   }
   assert!(service.run("DELETE FROM t", vec![]).await.is_err());
   assert_eq!(engine.opens.load(Ordering::SeqCst), 1);
   assert!(engine.executed().is_empty());

   // Only an explicit call goes back to the engine
   service.initialize().await.unwrap_err();
   assert_eq!(engine.opens.load(Ordering::SeqCst), 2);

   // Shutdown clears the failure; the next operation initializes afresh
   service.shutdown().await.unwrap();
   assert_eq!(service.mode(), ServiceMode::Uninitialized);
   service.query("SELECT 1", vec![]).await.unwrap_err();
   assert_eq!(engine.opens.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn failed_initialization_with_fallback_degrades() {
   let (store, _temp) = create_store().await;
   let engine = Arc::new(ScriptedEngine {
      refuse_open: true,
      ..Default::default()
   });
   let service = scripted_service(fast_config(), &engine, store);

   service.initialize().await.unwrap();
   assert_eq!(service.mode(), ServiceMode::FallbackOnly);
   assert!(service.stats().last_init_error.is_some());

   // Init failures are not retried
   assert_eq!(engine.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_resolves_pending_operations() {
   let (store, _temp) = create_store().await;
   let engine = Arc::new(ScriptedEngine::default());
   let service = scripted_service(fast_config(), &engine, store);
   service.initialize().await.unwrap();
   *engine.delay.lock() = Duration::from_secs(30);
   let mut events = service.subscribe();

   let pending: Vec<_> = ["SELECT slow", "SELECT queued"]
      .into_iter()
      .map(|sql| {
         let service = service.clone();
         tokio::spawn(async move { service.query(sql, vec![]).await })
      })
      .collect();
   tokio::time::sleep(Duration::from_millis(50)).await;

   tokio::time::timeout(Duration::from_secs(5), service.shutdown())
      .await
      .expect("shutdown hung")
      .unwrap();

   for handle in pending {
      let result = handle.await.unwrap();
      assert!(matches!(result, Err(Error::Shutdown)), "{result:?}");
   }

   assert!(drain_events(&mut events).contains(&ServiceEvent::Shutdown));
   let stats = service.stats();
   assert!(!stats.initialized);
   assert_eq!(stats.total_connections, 0);
   assert_eq!(stats.queue_length, 0);
}

#[tokio::test]
async fn service_restarts_after_shutdown() {
   let (store, _temp) = create_store().await;
   let engine = Arc::new(ScriptedEngine::default());
   let service = scripted_service(fast_config(), &engine, store);

   service.initialize().await.unwrap();
   service.shutdown().await.unwrap();
   service.initialize().await.unwrap();

   assert_eq!(service.mode(), ServiceMode::Engine);
   assert_eq!(engine.opens.load(Ordering::SeqCst), 2);
   assert!(service.query("SELECT 1", vec![]).await.is_ok());
}

#[cfg(feature = "duckdb")]
#[tokio::test]
async fn duckdb_happy_path() {
   let (store, temp) = create_store().await;
   let config = ServiceConfig {
      storage_path: temp.path().join("data").join("analytics.duckdb"),
      ..fast_config()
   };
   let service = AnalyticsService::new(config, store).unwrap();

   service.initialize().await.unwrap();
   assert_eq!(service.mode(), ServiceMode::Engine);

   service
      .run("CREATE TABLE t (id INTEGER)", vec![])
      .await
      .unwrap();
   service
      .run("INSERT INTO t VALUES (1)", vec![])
      .await
      .unwrap();
   let rows = service.query("SELECT * FROM t", vec![]).await.unwrap();
   assert_eq!(rows.len(), 1);
   assert_eq!(rows[0]["id"], json!(1));

   service
      .run(
         "INSERT INTO sentiment_analytics (source, sentiment_score, sentiment_label) VALUES (?, ?, ?)",
         vec![json!("review"), json!(0.75), json!("positive")],
      )
      .await
      .unwrap();
   let rows = service
      .query(
         "SELECT sentiment_label, count(*) AS n FROM sentiment_analytics GROUP BY sentiment_label",
         vec![],
      )
      .await
      .unwrap();
   assert_eq!(rows[0]["sentiment_label"], json!("positive"));
   assert_eq!(rows[0]["n"], json!(1));

   service.shutdown().await.unwrap();
   assert!(temp.path().join("data").join("analytics.duckdb").exists());
}
