//! Shared setup for integration tests.

#![allow(dead_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tempfile::TempDir;

use keyforge::protocol::VerificationRequest;
use keyforge::server::audit::{AuditRecorder, AuditWorker};
use keyforge::server::database::Database;
use keyforge::server::engine::{ActivationEngine, CodeItem, GenerateRequest};
use keyforge::signer::Signer;

pub const SECRET: &str = "test-signing-secret";
pub const APP_ID: &str = "demo";

/// In-memory SQLite store with the schema applied.
///
/// A single connection keeps every query on the same in-memory database.
pub async fn memory_db() -> Arc<Database> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("db connect failed");

    let db = Database::SQLite(pool);
    db.migrate().await.expect("migrate failed");
    Arc::new(db)
}

/// File-backed SQLite store with several pooled connections, for tests that
/// need real concurrent transactions.
pub async fn file_db(dir: &TempDir, connections: u32) -> Arc<Database> {
    let path = dir.path().join("keyforge-test.db");
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
        .expect("valid sqlite url")
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(connections)
        .connect_with(options)
        .await
        .expect("db connect failed");

    let db = Database::SQLite(pool);
    db.migrate().await.expect("migrate failed");
    Arc::new(db)
}

/// Raw pool behind a test store, for tests that tamper with the schema.
#[allow(irrefutable_let_patterns)]
pub fn sqlite_pool(db: &Database) -> &SqlitePool {
    let Database::SQLite(pool) = db else {
        panic!("integration tests run against SQLite");
    };
    pool
}

pub fn engine(db: &Arc<Database>) -> (ActivationEngine, AuditWorker) {
    let signer = Signer::new(SECRET).expect("signer");
    let (audit, worker) = AuditRecorder::spawn(Arc::clone(db), 256);
    (ActivationEngine::new(Arc::clone(db), signer, audit), worker)
}

pub fn generate_request(max_uses: i64, device_limit: Option<i64>) -> GenerateRequest {
    GenerateRequest {
        app_id: APP_ID.to_string(),
        count: 1,
        expires_in_days: None,
        max_uses,
        device_limit,
        notes: String::new(),
        created_by: "tests".to_string(),
    }
}

/// Issue a single code and return it.
pub async fn issue(engine: &ActivationEngine, max_uses: i64, device_limit: Option<i64>) -> CodeItem {
    let mut response = engine
        .generate(&generate_request(max_uses, device_limit))
        .await
        .unwrap();
    assert_eq!(response.generated, 1);
    response.codes.remove(0)
}

pub fn verify_request(code: &str, device_id: &str) -> VerificationRequest {
    let mut info = Map::new();
    info.insert(
        "device_name".to_string(),
        Value::String(format!("{device_id} phone")),
    );
    info.insert("model".to_string(), Value::String("Pixel 8".to_string()));
    info.insert("app_version".to_string(), Value::String("1.2.0".to_string()));

    VerificationRequest {
        code: code.to_string(),
        app_id: APP_ID.to_string(),
        device_id: device_id.to_string(),
        device_info: Some(info),
        timestamp: chrono::Utc::now().timestamp(),
    }
}
