//! Request validation for the Keyforge API.
//!
//! Validation is shallow: it rejects empty, oversized or
//! control-character fields before the engine runs. A well-formed but unknown
//! code is not an input error; the engine reports it as `CODE_NOT_FOUND`.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

use crate::protocol::VerificationRequest;
use crate::server::database::{ActivationStatus, DeviceStatus};
use crate::server::engine::GenerateRequest;

pub const MAX_CODE_LEN: usize = 64;
pub const MAX_APP_ID_LEN: usize = 128;
pub const MAX_DEVICE_ID_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 1024;
pub const MAX_GENERATE_COUNT: u32 = 1000;
pub const MAX_EXPIRES_IN_DAYS: i64 = 36_500;

static PRINTABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\x00-\x1F\x7F]*$").expect("static pattern compiles"));

/// Validation error type.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validate that a string is not empty or whitespace only.
///
/// # Example
/// ```
/// use keyforge::server::validation::validate_not_empty;
///
/// assert!(validate_not_empty("hello", "name").is_ok());
/// assert!(validate_not_empty("   ", "name").is_err());
/// ```
pub fn validate_not_empty(value: &str, field_name: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        Err(ValidationError::new(field_name, "cannot be empty"))
    } else {
        Ok(())
    }
}

/// Validate string length (in bytes) is within bounds.
pub fn validate_length(
    value: &str,
    min: usize,
    max: usize,
    field_name: &str,
) -> ValidationResult<()> {
    let len = value.len();
    if len < min {
        Err(ValidationError::new(
            field_name,
            format!("must be at least {} characters", min),
        ))
    } else if len > max {
        Err(ValidationError::new(
            field_name,
            format!("must be at most {} characters", max),
        ))
    } else {
        Ok(())
    }
}

/// Non-empty, at most `max` bytes, no control characters.
pub fn validate_identifier(value: &str, max: usize, field_name: &str) -> ValidationResult<()> {
    validate_not_empty(value, field_name)?;
    validate_length(value, 1, max, field_name)?;
    if !PRINTABLE.is_match(value) {
        return Err(ValidationError::new(
            field_name,
            "must not contain control characters",
        ));
    }
    Ok(())
}

pub fn validate_verification_request(request: &VerificationRequest) -> ValidationResult<()> {
    validate_identifier(&request.code, MAX_CODE_LEN, "code")?;
    validate_identifier(&request.app_id, MAX_APP_ID_LEN, "app_id")?;
    validate_identifier(&request.device_id, MAX_DEVICE_ID_LEN, "device_id")?;
    Ok(())
}

pub fn validate_generate_request(request: &GenerateRequest) -> ValidationResult<()> {
    validate_identifier(&request.app_id, MAX_APP_ID_LEN, "app_id")?;

    if request.count == 0 || request.count > MAX_GENERATE_COUNT {
        return Err(ValidationError::new(
            "count",
            format!("must be between 1 and {MAX_GENERATE_COUNT}"),
        ));
    }
    if request.max_uses < 0 {
        return Err(ValidationError::new("max_uses", "must be 0 (unlimited) or greater"));
    }
    if request.device_limit.is_some_and(|limit| limit < 1) {
        return Err(ValidationError::new("device_limit", "must be at least 1 when set"));
    }
    if request.expires_in_days.is_some_and(|days| days < 0) {
        return Err(ValidationError::new("expires_in_days", "cannot be negative"));
    }
    if request
        .expires_in_days
        .is_some_and(|days| days > MAX_EXPIRES_IN_DAYS)
    {
        return Err(ValidationError::new(
            "expires_in_days",
            format!("must be at most {MAX_EXPIRES_IN_DAYS}"),
        ));
    }
    validate_length(&request.notes, 0, MAX_NOTES_LEN, "notes")?;
    Ok(())
}

/// Parse an optional `status` filter for listings.
pub fn parse_status_filter(value: Option<&str>) -> ValidationResult<Option<ActivationStatus>> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => ActivationStatus::parse(v).map(Some).ok_or_else(|| {
            ValidationError::new("status", "must be one of: active, used, expired, revoked")
        }),
    }
}

pub fn parse_device_status(value: &str) -> ValidationResult<DeviceStatus> {
    DeviceStatus::parse(value.trim()).ok_or_else(|| {
        ValidationError::new("status", "must be one of: active, blocked, suspended")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate(count: u32) -> GenerateRequest {
        GenerateRequest {
            app_id: "demo".to_string(),
            count,
            expires_in_days: None,
            max_uses: 1,
            device_limit: None,
            notes: String::new(),
            created_by: String::new(),
        }
    }

    #[test]
    fn test_validate_not_empty() {
        assert!(validate_not_empty("hello", "field").is_ok());
        assert!(validate_not_empty("", "field").is_err());
        assert!(validate_not_empty("\t\n", "field").is_err());
    }

    #[test]
    fn test_validate_length() {
        assert!(validate_length("hello", 1, 10, "field").is_ok());
        assert!(validate_length("", 1, 10, "field").is_err());
        assert!(validate_length("hello world", 1, 10, "field").is_err());
    }

    #[test]
    fn identifier_rejects_control_characters() {
        assert!(validate_identifier("device-42", 64, "device_id").is_ok());
        assert!(validate_identifier("dev\u{0}ice", 64, "device_id").is_err());
        assert!(validate_identifier(&"x".repeat(65), 64, "device_id").is_err());
    }

    #[test]
    fn malformed_code_is_not_an_input_error() {
        let request = VerificationRequest {
            code: "not-a-real-code".to_string(),
            app_id: "demo".to_string(),
            device_id: "d1".to_string(),
            device_info: None,
            timestamp: 0,
        };
        assert!(validate_verification_request(&request).is_ok());
    }

    #[test]
    fn generate_count_bounds() {
        assert!(validate_generate_request(&generate(1)).is_ok());
        assert!(validate_generate_request(&generate(1000)).is_ok());

        let err = validate_generate_request(&generate(0)).unwrap_err();
        assert_eq!(err.field, "count");
        assert!(validate_generate_request(&generate(1001)).is_err());
    }

    #[test]
    fn generate_rejects_negative_limits() {
        let mut request = generate(1);
        request.max_uses = -1;
        assert_eq!(validate_generate_request(&request).unwrap_err().field, "max_uses");

        let mut request = generate(1);
        request.device_limit = Some(0);
        assert_eq!(
            validate_generate_request(&request).unwrap_err().field,
            "device_limit"
        );
    }

    #[test]
    fn expiry_days_are_bounded() {
        let mut request = generate(1);
        request.expires_in_days = Some(MAX_EXPIRES_IN_DAYS);
        assert!(validate_generate_request(&request).is_ok());

        request.expires_in_days = Some(MAX_EXPIRES_IN_DAYS + 1);
        assert_eq!(
            validate_generate_request(&request).unwrap_err().field,
            "expires_in_days"
        );

        request.expires_in_days = Some(-1);
        assert!(validate_generate_request(&request).is_err());
    }

    #[test]
    fn status_filter_parsing() {
        assert_eq!(parse_status_filter(None).unwrap(), None);
        assert_eq!(parse_status_filter(Some("")).unwrap(), None);
        assert_eq!(
            parse_status_filter(Some("revoked")).unwrap(),
            Some(ActivationStatus::Revoked)
        );
        assert!(parse_status_filter(Some("deleted")).is_err());
    }

    #[test]
    fn device_status_parsing() {
        assert_eq!(parse_device_status("blocked").unwrap(), DeviceStatus::Blocked);
        assert!(parse_device_status("banned").is_err());
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::new("test_field", "is invalid");
        assert_eq!(err.to_string(), "test_field: is invalid");
    }
}
