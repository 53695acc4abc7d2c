//! Wire types shared by the server and the client.
//!
//! `ActivationData` is the signed payload. Its fields serialize in declaration
//! order, which is the canonical form fed to the signer, so the field order is
//! part of the protocol and must not change.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Inbound verification request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub code: String,
    pub app_id: String,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info: Option<Map<String, Value>>,
    /// Client clock, seconds since epoch. Reserved for replay-window checks.
    pub timestamp: i64,
}

/// Signed payload of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationData {
    pub activation_id: i64,
    /// Distinct devices bound to the record
    pub devices_used: i64,
    pub device_limit: Option<i64>,
    /// Milliseconds since epoch
    pub expires_at: Option<i64>,
    /// `max(0, max_uses - used_count)`; independent of `devices_used`
    pub remaining_uses: i64,
    /// Seconds since epoch
    pub created_at: i64,
}

/// Stable error codes carried by failed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerifyErrorCode {
    CodeNotFound,
    CodeUsed,
    CodeExpired,
    CodeRevoked,
    CodeLimitExceeded,
    DeviceLimitExceeded,
    DeviceBlocked,
    InvalidRequest,
    InternalError,
}

impl VerifyErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyErrorCode::CodeNotFound => "CODE_NOT_FOUND",
            VerifyErrorCode::CodeUsed => "CODE_USED",
            VerifyErrorCode::CodeExpired => "CODE_EXPIRED",
            VerifyErrorCode::CodeRevoked => "CODE_REVOKED",
            VerifyErrorCode::CodeLimitExceeded => "CODE_LIMIT_EXCEEDED",
            VerifyErrorCode::DeviceLimitExceeded => "DEVICE_LIMIT_EXCEEDED",
            VerifyErrorCode::DeviceBlocked => "DEVICE_BLOCKED",
            VerifyErrorCode::InvalidRequest => "INVALID_REQUEST",
            VerifyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Default human-readable message.
    pub fn message(&self) -> &'static str {
        match self {
            VerifyErrorCode::CodeNotFound => "Activation code not found",
            VerifyErrorCode::CodeUsed => "Activation code is used",
            VerifyErrorCode::CodeExpired => "Activation code expired",
            VerifyErrorCode::CodeRevoked => "Activation code is revoked",
            VerifyErrorCode::CodeLimitExceeded => "Activation code usage limit exceeded",
            VerifyErrorCode::DeviceLimitExceeded => "Device limit exceeded",
            VerifyErrorCode::DeviceBlocked => "Device is blocked",
            VerifyErrorCode::InvalidRequest => "Invalid request",
            VerifyErrorCode::InternalError => "Internal server error",
        }
    }
}

impl std::fmt::Display for VerifyErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound verification response.
///
/// Failures carry `code` instead of `data` and an empty `signature`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ActivationData>,
    #[serde(default)]
    pub signature: String,
    /// Seconds since epoch; the exact value bound into `signature`
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<VerifyErrorCode>,
}

impl VerificationResponse {
    pub fn failure(code: VerifyErrorCode, timestamp: i64) -> Self {
        Self {
            success: false,
            message: code.message().to_string(),
            data: None,
            signature: String::new(),
            timestamp,
            code: Some(code),
        }
    }
}

/// Extract a string field from free-form device metadata.
///
/// Non-string values are ignored.
pub fn extract_device_field(info: Option<&Map<String, Value>>, key: &str) -> Option<String> {
    info?.get(key)?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_codes_serialize_screaming_snake() {
        let value = serde_json::to_value(VerifyErrorCode::DeviceLimitExceeded).unwrap();
        assert_eq!(value, json!("DEVICE_LIMIT_EXCEEDED"));
        assert_eq!(VerifyErrorCode::CodeUsed.as_str(), "CODE_USED");
    }

    #[test]
    fn failure_response_omits_data() {
        let response = VerificationResponse::failure(VerifyErrorCode::CodeNotFound, 10);
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["code"], json!("CODE_NOT_FOUND"));
        assert!(value.get("data").is_none());
    }

    #[test]
    fn activation_data_field_order_is_stable() {
        let data = ActivationData {
            activation_id: 1,
            devices_used: 2,
            device_limit: None,
            expires_at: Some(5),
            remaining_uses: 0,
            created_at: 9,
        };
        assert_eq!(
            serde_json::to_string(&data).unwrap(),
            r#"{"activation_id":1,"devices_used":2,"device_limit":null,"expires_at":5,"remaining_uses":0,"created_at":9}"#
        );
    }

    #[test]
    fn extract_device_field_only_reads_strings() {
        let info = json!({"model": "Pixel 8", "os_version": 14})
            .as_object()
            .cloned()
            .unwrap();
        assert_eq!(
            extract_device_field(Some(&info), "model").as_deref(),
            Some("Pixel 8")
        );
        assert_eq!(extract_device_field(Some(&info), "os_version"), None);
        assert_eq!(extract_device_field(None, "model"), None);
    }
}
