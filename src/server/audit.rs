//! Fire-and-forget audit recorder.
//!
//! Request handlers push entries into a bounded queue; a single worker task
//! drains it into `audit_logs`. The request path never waits on the audit
//! write and never sees its failure:
//!
//! - a full queue drops the entry with a warning,
//! - a failed or panicking write is logged and the worker moves on.
//!
//! Dropping every [`AuditRecorder`] closes the queue; [`AuditWorker::shutdown`]
//! then waits for the backlog to drain.

use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::server::database::{Database, NewAuditEntry};

/// Kind of operation an audit entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Verify,
    Generate,
    Revoke,
    DeviceStatus,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Verify => "verify",
            AuditAction::Generate => "generate",
            AuditAction::Revoke => "revoke",
            AuditAction::DeviceStatus => "device_status",
        }
    }
}

/// Outcome column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
        }
    }
}

/// Build an entry stamped with the current time.
pub fn audit_entry(
    action: AuditAction,
    activation_id: Option<i64>,
    device_id: &str,
    outcome: AuditOutcome,
    error_message: &str,
    device_info: Option<&Map<String, Value>>,
) -> NewAuditEntry {
    NewAuditEntry {
        action: action.as_str().to_string(),
        activation_id,
        device_id: device_id.to_string(),
        result: outcome.as_str().to_string(),
        error_message: error_message.to_string(),
        device_info: device_info
            .map(|info| Value::Object(info.clone()).to_string())
            .unwrap_or_default(),
        created_at: Utc::now().naive_utc(),
    }
}

/// Producer side of the audit queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AuditRecorder {
    tx: mpsc::Sender<NewAuditEntry>,
}

/// Handle to the worker task draining the audit queue.
#[derive(Debug)]
pub struct AuditWorker {
    handle: JoinHandle<()>,
}

impl AuditRecorder {
    /// Spawn the worker and return the producer handle plus the worker handle.
    pub fn spawn(db: Arc<Database>, capacity: usize) -> (AuditRecorder, AuditWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_worker(db, rx));
        info!(capacity, "Audit recorder started");
        (AuditRecorder { tx }, AuditWorker { handle })
    }

    /// Enqueue an entry without waiting.
    ///
    /// Returns `false` if the entry was dropped because the queue is full or
    /// the worker is gone.
    pub fn record(&self, entry: NewAuditEntry) -> bool {
        match self.tx.try_send(entry) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(entry)) => {
                warn!(
                    action = %entry.action,
                    device_id = %entry.device_id,
                    "Audit queue full, dropping entry"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(entry)) => {
                warn!(action = %entry.action, "Audit worker stopped, dropping entry");
                false
            }
        }
    }
}

impl AuditWorker {
    /// Wait for the worker to drain the queue and exit.
    ///
    /// Only returns once every [`AuditRecorder`] clone has been dropped.
    pub async fn shutdown(self) {
        if let Err(e) = self.handle.await {
            error!("Audit worker terminated abnormally: {e}");
        }
        info!("Audit recorder stopped");
    }
}

async fn run_worker(db: Arc<Database>, mut rx: mpsc::Receiver<NewAuditEntry>) {
    while let Some(entry) = rx.recv().await {
        let action = entry.action.clone();
        let db = Arc::clone(&db);

        // Each write runs in its own task so a panic inside the driver only
        // loses that entry.
        match tokio::spawn(async move { db.insert_audit_entry(&entry).await }).await {
            Ok(Ok(())) => debug!(action = %action, "Audit entry persisted"),
            Ok(Err(e)) => error!(action = %action, "Failed to persist audit entry: {e}"),
            Err(e) => error!(action = %action, "Audit write panicked: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_serializes_device_info() {
        let mut info = Map::new();
        info.insert("model".to_string(), Value::String("Pixel".to_string()));

        let entry = audit_entry(
            AuditAction::Verify,
            Some(3),
            "dev-1",
            AuditOutcome::Success,
            "",
            Some(&info),
        );

        assert_eq!(entry.action, "verify");
        assert_eq!(entry.result, "success");
        assert_eq!(entry.activation_id, Some(3));
        assert_eq!(entry.device_info, r#"{"model":"Pixel"}"#);
    }

    #[test]
    fn entry_without_device_info_is_empty() {
        let entry = audit_entry(
            AuditAction::Revoke,
            None,
            "",
            AuditOutcome::Failure,
            "CODE_NOT_FOUND",
            None,
        );
        assert!(entry.device_info.is_empty());
        assert_eq!(entry.error_message, "CODE_NOT_FOUND");
    }
}
