use serde_json::json;
use sqlx_sqlite_store::{Error, SqliteDatabaseConfig, SqliteStore};
use tempfile::TempDir;

async fn create_test_store() -> (SqliteStore, TempDir) {
   let temp_dir = TempDir::new().expect("Failed to create temp directory");
   // Nested path exercises parent directory creation
   let db_path = temp_dir.path().join("nested").join("store.db");
   let config = SqliteDatabaseConfig {
      max_read_connections: 2,
      ..Default::default()
   };
   let store = SqliteStore::connect(&db_path, Some(config))
      .await
      .expect("Failed to connect to test database");

   (store, temp_dir)
}

#[tokio::test]
async fn writes_are_visible_to_readers() {
   let (store, temp) = create_test_store().await;
   assert!(temp.path().join("nested").join("store.db").exists());

   store
      .execute(
         "CREATE TABLE accounts (id INTEGER PRIMARY KEY, balance INTEGER NOT NULL)".into(),
         vec![],
      )
      .await
      .unwrap();
   store
      .execute(
         "INSERT INTO accounts (id, balance) VALUES (?, ?), (?, ?)".into(),
         vec![json!(1), json!(100), json!(2), json!(50)],
      )
      .await
      .unwrap();

   let rows = store
      .fetch_all(
         "SELECT balance FROM accounts WHERE id = ?".into(),
         vec![json!(2)],
      )
      .await
      .unwrap();
   assert_eq!(rows.len(), 1);
   assert_eq!(rows[0].get("balance"), Some(&json!(50)));
}

#[tokio::test]
async fn column_order_is_preserved() {
   let (store, _temp) = create_test_store().await;
   store
      .execute("CREATE TABLE t (z TEXT, a TEXT, m TEXT)".into(), vec![])
      .await
      .unwrap();
   store
      .execute(
         "INSERT INTO t VALUES (?, ?, ?)".into(),
         vec![json!("z"), json!("a"), json!("m")],
      )
      .await
      .unwrap();

   let rows = store
      .fetch_all("SELECT z, a, m FROM t".into(), vec![])
      .await
      .unwrap();
   let keys: Vec<&String> = rows[0].keys().collect();
   assert_eq!(keys, vec!["z", "a", "m"]);
}

#[tokio::test]
async fn closed_store_rejects_writes() {
   let (store, _temp) = create_test_store().await;
   store.close().await.unwrap();
   store.close().await.unwrap();

   let err = store
      .execute("CREATE TABLE t (id INTEGER)".into(), vec![])
      .await
      .unwrap_err();
   assert!(matches!(err, Error::DatabaseClosed));
}
