//! Activation verification engine.
//!
//! Decides whether a presented code is honoured for a device. The gates run in
//! a fixed order and the first failing gate wins:
//!
//! 1. lookup by `(code, app_id)`
//! 2. status must be `active`
//! 3. expiry (lazily marks the code `expired`)
//! 4. usage cap (lazily marks the code `used`)
//! 5. device status, device cap, binding upsert and counter advance, in one
//!    store transaction ([`Database::consume_activation`])
//!
//! Successful responses are signed with a fresh server timestamp. Every
//! outcome for which a record was found is handed to the audit recorder.

use chrono::{Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::code_generator::generate_activation_code;
use crate::errors::{ActivationError, ActivationResult};
use crate::protocol::{
    extract_device_field, ActivationData, VerificationRequest, VerificationResponse,
    VerifyErrorCode,
};
use crate::server::audit::{audit_entry, AuditAction, AuditOutcome, AuditRecorder};
use crate::server::database::{
    ActivationPage, ActivationRecord, ActivationStatus, ConsumeOutcome, Database, DeviceStatus,
    DeviceUpsert, NewActivation,
};
use crate::server::logging::{log_activation_event, ActivationEvent};
use crate::signer::Signer;

/// Attempts to insert a freshly generated code before giving up on that item.
const MAX_CODE_ATTEMPTS: usize = 5;

/// Re-reads allowed when the record changes between the gate checks and the
/// consume transaction.
const MAX_CONSUME_ATTEMPTS: usize = 3;

/// Bulk issuance request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerateRequest {
    pub app_id: String,
    pub count: u32,
    #[serde(default)]
    pub expires_in_days: Option<i64>,
    /// 0 means unlimited
    #[serde(default = "default_max_uses")]
    pub max_uses: i64,
    #[serde(default)]
    pub device_limit: Option<i64>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub created_by: String,
}

fn default_max_uses() -> i64 {
    1
}

/// One persisted code.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CodeItem {
    pub code: String,
    pub id: i64,
    /// Milliseconds since epoch
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerateResponse {
    pub success: bool,
    /// Number of codes actually persisted; may be below the requested count
    pub generated: usize,
    pub codes: Vec<CodeItem>,
}

/// Result of the gates that run before the consume transaction.
enum Gate {
    Open,
    Rejected(VerifyErrorCode),
}

/// The verification hub. Cheap to share behind an `Arc`.
#[derive(Debug, Clone)]
pub struct ActivationEngine {
    db: Arc<Database>,
    signer: Signer,
    audit: AuditRecorder,
}

impl ActivationEngine {
    pub fn new(db: Arc<Database>, signer: Signer, audit: AuditRecorder) -> Self {
        Self { db, signer, audit }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    // ------------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------------

    /// Run a verification request through the state machine.
    ///
    /// Business-rule rejections are `Ok` responses with `success = false`.
    /// `Err` is returned only for storage or signing faults.
    pub async fn verify(
        &self,
        request: &VerificationRequest,
    ) -> ActivationResult<VerificationResponse> {
        let now = Utc::now().naive_utc();

        let Some(mut record) = self
            .db
            .get_activation_by_code(&request.code, &request.app_id)
            .await?
        else {
            return Ok(self.reject(request, None, VerifyErrorCode::CodeNotFound));
        };

        let device = device_upsert(request);

        for attempt in 1..=MAX_CONSUME_ATTEMPTS {
            if let Gate::Rejected(code) = self.check_record(&record, now).await? {
                return Ok(self.reject(request, Some(record.id), code));
            }

            let outcome = self
                .db
                .consume_activation(record.id, record.device_limit, &device, now)
                .await?;

            match outcome {
                ConsumeOutcome::Admitted {
                    used_count,
                    devices_used,
                    activation_count,
                } => {
                    debug!(
                        activation_id = record.id,
                        used_count, devices_used, activation_count, "Consume committed"
                    );
                    return self.admit(request, &record, used_count, devices_used);
                }
                ConsumeOutcome::DeviceLimitReached { devices_used } => {
                    debug!(activation_id = record.id, devices_used, "Device limit reached");
                    return Ok(self.reject(
                        request,
                        Some(record.id),
                        VerifyErrorCode::DeviceLimitExceeded,
                    ));
                }
                ConsumeOutcome::DeviceBlocked { status } => {
                    debug!(activation_id = record.id, status = %status, "Device not active");
                    return Ok(self.reject(
                        request,
                        Some(record.id),
                        VerifyErrorCode::DeviceBlocked,
                    ));
                }
                ConsumeOutcome::Stale => {
                    debug!(activation_id = record.id, attempt, "Record changed, re-reading");
                    record = match self.db.get_activation(record.id).await? {
                        Some(fresh) => fresh,
                        None => {
                            return Ok(self.reject(request, None, VerifyErrorCode::CodeNotFound))
                        }
                    };
                }
            }
        }

        error!(
            activation_id = record.id,
            "Activation record kept changing during verification"
        );
        Err(ActivationError::Server(
            "activation record changed concurrently".to_string(),
        ))
    }

    /// Status, expiry and usage gates. Applies lazy transitions.
    async fn check_record(
        &self,
        record: &ActivationRecord,
        now: NaiveDateTime,
    ) -> ActivationResult<Gate> {
        match record.status() {
            ActivationStatus::Active => {}
            ActivationStatus::Used => return Ok(Gate::Rejected(VerifyErrorCode::CodeUsed)),
            ActivationStatus::Expired => return Ok(Gate::Rejected(VerifyErrorCode::CodeExpired)),
            ActivationStatus::Revoked => return Ok(Gate::Rejected(VerifyErrorCode::CodeRevoked)),
        }

        if record.is_expired_at(now) {
            if self
                .db
                .transition_status_if_active(record.id, ActivationStatus::Expired)
                .await?
            {
                log_activation_event(ActivationEvent::Expired, &record.code, "", None);
            }
            return Ok(Gate::Rejected(VerifyErrorCode::CodeExpired));
        }

        if record.uses_exhausted() {
            if self
                .db
                .transition_status_if_active(record.id, ActivationStatus::Used)
                .await?
            {
                log_activation_event(ActivationEvent::Exhausted, &record.code, "", None);
            }
            return Ok(Gate::Rejected(VerifyErrorCode::CodeLimitExceeded));
        }

        Ok(Gate::Open)
    }

    fn admit(
        &self,
        request: &VerificationRequest,
        record: &ActivationRecord,
        used_count: i64,
        devices_used: i64,
    ) -> ActivationResult<VerificationResponse> {
        let data = ActivationData {
            activation_id: record.id,
            devices_used,
            device_limit: record.device_limit,
            expires_at: record.expires_at.map(|exp| exp.and_utc().timestamp_millis()),
            remaining_uses: (record.max_uses - used_count).max(0),
            created_at: record.created_at.and_utc().timestamp(),
        };

        let timestamp = Utc::now().timestamp();
        let signature = self.signer.sign(&data, timestamp)?;

        self.audit.record(audit_entry(
            AuditAction::Verify,
            Some(record.id),
            &request.device_id,
            AuditOutcome::Success,
            "",
            request.device_info.as_ref(),
        ));
        log_activation_event(
            ActivationEvent::Verified,
            &record.code,
            &request.device_id,
            None,
        );

        Ok(VerificationResponse {
            success: true,
            message: "Activation successful".to_string(),
            data: Some(data),
            signature,
            timestamp,
            code: None,
        })
    }

    fn reject(
        &self,
        request: &VerificationRequest,
        activation_id: Option<i64>,
        code: VerifyErrorCode,
    ) -> VerificationResponse {
        self.audit.record(audit_entry(
            AuditAction::Verify,
            activation_id,
            &request.device_id,
            AuditOutcome::Failure,
            code.as_str(),
            request.device_info.as_ref(),
        ));
        log_activation_event(
            ActivationEvent::VerificationFailed,
            &request.code,
            &request.device_id,
            Some(code.as_str()),
        );

        VerificationResponse::failure(code, Utc::now().timestamp())
    }

    // ------------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------------

    /// Issue `request.count` codes.
    ///
    /// Items that fail to persist are logged and skipped; the response lists
    /// only what was stored. An expiry that cannot be represented is a
    /// `Validation` error and nothing is issued.
    pub async fn generate(&self, request: &GenerateRequest) -> ActivationResult<GenerateResponse> {
        let created_at = Utc::now().naive_utc();
        let expires_at = match request.expires_in_days.filter(|days| *days > 0) {
            Some(days) => Some(
                Duration::try_days(days)
                    .and_then(|span| created_at.checked_add_signed(span))
                    .ok_or_else(|| {
                        ActivationError::Validation(format!(
                            "expires_in_days: {days} is out of range"
                        ))
                    })?,
            ),
            None => None,
        };

        let mut codes = Vec::with_capacity(request.count as usize);

        for _ in 0..request.count {
            let Some(item) = self.generate_one(request, created_at, expires_at).await else {
                continue;
            };

            self.audit.record(audit_entry(
                AuditAction::Generate,
                Some(item.id),
                "",
                AuditOutcome::Success,
                "",
                None,
            ));
            codes.push(item);
        }

        info!(
            app_id = %request.app_id,
            requested = request.count,
            generated = codes.len(),
            "Activation codes generated"
        );

        Ok(GenerateResponse {
            success: true,
            generated: codes.len(),
            codes,
        })
    }

    async fn generate_one(
        &self,
        request: &GenerateRequest,
        created_at: NaiveDateTime,
        expires_at: Option<NaiveDateTime>,
    ) -> Option<CodeItem> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let new = NewActivation {
                code: generate_activation_code(),
                app_id: request.app_id.clone(),
                max_uses: request.max_uses,
                device_limit: request.device_limit,
                expires_at,
                notes: request.notes.clone(),
                created_by: request.created_by.clone(),
                created_at,
            };

            match self.db.insert_activation(&new).await {
                Ok(id) => {
                    log_activation_event(ActivationEvent::Generated, &new.code, "", None);
                    return Some(CodeItem {
                        code: new.code,
                        id,
                        expires_at: expires_at.map(|exp| exp.and_utc().timestamp_millis()),
                    });
                }
                Err(ActivationError::Conflict(_)) => {
                    warn!(app_id = %request.app_id, "Generated code collided, regenerating");
                }
                Err(e) => {
                    error!(app_id = %request.app_id, "Failed to create activation code: {e}");
                    return None;
                }
            }
        }

        error!(
            app_id = %request.app_id,
            "Gave up on activation code after {MAX_CODE_ATTEMPTS} collisions"
        );
        None
    }

    /// Revoke a code from any status. Returns `false` if no such code exists.
    pub async fn revoke(&self, app_id: &str, code: &str) -> ActivationResult<bool> {
        let found = self.db.revoke_activation(app_id, code).await?;

        let activation_id = if found {
            self.db
                .get_activation_by_code(code, app_id)
                .await?
                .map(|record| record.id)
        } else {
            None
        };

        let (outcome, detail) = if found {
            (AuditOutcome::Success, "")
        } else {
            (AuditOutcome::Failure, VerifyErrorCode::CodeNotFound.as_str())
        };
        self.audit.record(audit_entry(
            AuditAction::Revoke,
            activation_id,
            "",
            outcome,
            detail,
            None,
        ));

        if found {
            log_activation_event(ActivationEvent::Revoked, code, "", None);
        }
        Ok(found)
    }

    /// Page through an app's codes, newest first.
    pub async fn list(
        &self,
        app_id: &str,
        status: Option<ActivationStatus>,
        page: u32,
        limit: u32,
    ) -> ActivationResult<ActivationPage> {
        self.db.list_activations(app_id, status, page, limit).await
    }

    /// Change a device binding's administrative status.
    ///
    /// Returns `false` if the device was never bound in this app.
    pub async fn set_device_status(
        &self,
        app_id: &str,
        device_id: &str,
        status: DeviceStatus,
    ) -> ActivationResult<bool> {
        let found = self.db.set_device_status(app_id, device_id, status).await?;

        self.audit.record(audit_entry(
            AuditAction::DeviceStatus,
            None,
            device_id,
            if found {
                AuditOutcome::Success
            } else {
                AuditOutcome::Failure
            },
            status.as_str(),
            None,
        ));

        if found {
            log_activation_event(
                ActivationEvent::DeviceStatusChanged,
                "",
                device_id,
                Some(status.as_str()),
            );
        }
        Ok(found)
    }
}

fn device_upsert(request: &VerificationRequest) -> DeviceUpsert {
    let info = request.device_info.as_ref();
    DeviceUpsert {
        device_id: request.device_id.clone(),
        app_id: request.app_id.clone(),
        device_name: extract_device_field(info, "device_name"),
        model: extract_device_field(info, "model"),
        os_version: extract_device_field(info, "os_version"),
        app_version: extract_device_field(info, "app_version"),
        device_info: info
            .map(|map| Value::Object(map.clone()).to_string())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn device_upsert_extracts_known_fields() {
        let request = VerificationRequest {
            code: "AAAA-BBBB-CCCC-DDDD".to_string(),
            app_id: "demo".to_string(),
            device_id: "d1".to_string(),
            device_info: json!({
                "device_name": "Living room tablet",
                "model": "X1",
                "battery": 80
            })
            .as_object()
            .cloned(),
            timestamp: 0,
        };

        let upsert = device_upsert(&request);
        assert_eq!(upsert.device_name.as_deref(), Some("Living room tablet"));
        assert_eq!(upsert.model.as_deref(), Some("X1"));
        assert_eq!(upsert.os_version, None);
        assert!(upsert.device_info.contains("\"battery\":80"));
    }

    #[test]
    fn generate_request_defaults() {
        let request: GenerateRequest =
            serde_json::from_value(json!({"app_id": "demo", "count": 3})).unwrap();
        assert_eq!(request.max_uses, 1);
        assert_eq!(request.device_limit, None);
        assert!(request.notes.is_empty());
    }
}
