//! Caps must hold when many verifications of one code race each other.
//!
//! These run against a file-backed SQLite database with several pooled
//! connections so transactions genuinely overlap.

mod common;

use tempfile::TempDir;

use common::{engine, file_db, issue, verify_request, APP_ID};
use keyforge::protocol::VerifyErrorCode;

const CONNECTIONS: u32 = 8;
const CONTENDERS: usize = 24;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn usage_cap_holds_under_concurrency() {
    let dir = TempDir::new().unwrap();
    let db = file_db(&dir, CONNECTIONS).await;
    let (engine, _worker) = engine(&db);
    let item = issue(&engine, 5, None).await;

    let mut handles = Vec::new();
    for i in 0..CONTENDERS {
        let engine = engine.clone();
        let code = item.code.clone();
        handles.push(tokio::spawn(async move {
            engine
                .verify(&verify_request(&code, &format!("device-{i}")))
                .await
                .unwrap()
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        let response = handle.await.unwrap();
        if response.success {
            admitted += 1;
        } else {
            assert!(matches!(
                response.code,
                Some(VerifyErrorCode::CodeLimitExceeded) | Some(VerifyErrorCode::CodeUsed)
            ));
        }
    }

    assert_eq!(admitted, 5);
    let record = db.get_activation(item.id).await.unwrap().unwrap();
    assert_eq!(record.used_count, 5);
    assert_eq!(db.count_bound_devices(item.id).await.unwrap(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn device_cap_holds_under_concurrency() {
    let dir = TempDir::new().unwrap();
    let db = file_db(&dir, CONNECTIONS).await;
    let (engine, _worker) = engine(&db);
    let item = issue(&engine, 0, Some(3)).await;

    let mut handles = Vec::new();
    for i in 0..CONTENDERS {
        let engine = engine.clone();
        let code = item.code.clone();
        handles.push(tokio::spawn(async move {
            engine
                .verify(&verify_request(&code, &format!("device-{i}")))
                .await
                .unwrap()
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        let response = handle.await.unwrap();
        if response.success {
            admitted += 1;
            assert!(response.data.unwrap().devices_used <= 3);
        } else {
            assert_eq!(response.code, Some(VerifyErrorCode::DeviceLimitExceeded));
        }
    }

    assert_eq!(admitted, 3);
    assert_eq!(db.count_bound_devices(item.id).await.unwrap(), 3);
    let record = db.get_activation(item.id).await.unwrap().unwrap();
    assert_eq!(record.used_count, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_device_increments_are_not_lost() {
    let dir = TempDir::new().unwrap();
    let db = file_db(&dir, CONNECTIONS).await;
    let (engine, _worker) = engine(&db);
    let item = issue(&engine, 0, Some(1)).await;

    // Bind first so every racer is an already-bound device.
    assert!(engine.verify(&verify_request(&item.code, "d1")).await.unwrap().success);

    let mut handles = Vec::new();
    for _ in 0..CONTENDERS {
        let engine = engine.clone();
        let code = item.code.clone();
        handles.push(tokio::spawn(async move {
            engine.verify(&verify_request(&code, "d1")).await.unwrap()
        }));
    }

    for handle in handles {
        assert!(handle.await.unwrap().success);
    }

    let expected = CONTENDERS as i64 + 1;
    let record = db.get_activation(item.id).await.unwrap().unwrap();
    assert_eq!(record.used_count, expected);
    let binding = db.get_device_binding("d1", APP_ID).await.unwrap().unwrap();
    assert_eq!(binding.activation_count, expected);
    assert_eq!(db.count_bound_devices(item.id).await.unwrap(), 1);
}
