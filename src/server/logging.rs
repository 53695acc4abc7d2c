//! Structured logging for Keyforge.
//!
//! - `request_logging_middleware` tags every HTTP request with a unique id,
//!   times it and echoes the id in `X-Request-Id`.
//! - `log_activation_event` records engine decisions inside a span carrying
//!   the event kind, code and device.
//!
//! # Usage
//!
//! ```rust,ignore
//! use axum::middleware;
//! use keyforge::server::logging::request_logging_middleware;
//!
//! let app = Router::new()
//!     .route("/api/health", get(health_handler))
//!     .layer(middleware::from_fn(request_logging_middleware));
//! ```

use axum::{
    body::Body,
    extract::Request,
    http::{HeaderValue, Response},
    middleware::Next,
};
use std::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Activation state change and decision events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationEvent {
    /// A code was issued
    Generated,
    /// A verification was admitted
    Verified,
    /// A verification was rejected
    VerificationFailed,
    /// A code was lazily moved to `expired`
    Expired,
    /// A code was lazily moved to `used`
    Exhausted,
    /// A code was revoked by an operator
    Revoked,
    /// A device binding's status was changed by an operator
    DeviceStatusChanged,
}

impl std::fmt::Display for ActivationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActivationEvent::Generated => "generated",
            ActivationEvent::Verified => "verified",
            ActivationEvent::VerificationFailed => "verification_failed",
            ActivationEvent::Expired => "expired",
            ActivationEvent::Exhausted => "exhausted",
            ActivationEvent::Revoked => "revoked",
            ActivationEvent::DeviceStatusChanged => "device_status_changed",
        };
        write!(f, "{}", s)
    }
}

/// Log an activation event.
///
/// `device_id` is empty for operations that do not involve a device.
pub fn log_activation_event(
    event: ActivationEvent,
    code: &str,
    device_id: &str,
    details: Option<&str>,
) {
    let span = info_span!(
        "activation_event",
        event = %event,
        code = %code,
        device_id = %device_id,
    );
    let _enter = span.enter();

    match (event, details) {
        (ActivationEvent::VerificationFailed, Some(d)) => {
            warn!(reason = %d, "Activation event occurred")
        }
        (ActivationEvent::VerificationFailed, None) => warn!("Activation event occurred"),
        (_, Some(d)) => info!(details = %d, "Activation event occurred"),
        (_, None) => info!("Activation event occurred"),
    }
}

/// Header name for the request ID.
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Generate a new unique request ID.
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Logging middleware that tracks request timing and generates request IDs.
pub async fn request_logging_middleware(request: Request, next: Next) -> Response<Body> {
    let request_id = generate_request_id();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %path,
    );

    let start = Instant::now();

    let response = async move {
        info!("Started processing request");
        next.run(request).await
    }
    .instrument(span.clone())
    .await;

    let duration = start.elapsed();
    let status = response.status();

    let _enter = span.enter();
    info!(
        status = %status.as_u16(),
        duration_ms = %duration.as_millis(),
        "Request completed"
    );

    let (mut parts, body) = response.into_parts();
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        parts.headers.insert(REQUEST_ID_HEADER, header_value);
    }

    Response::from_parts(parts, body)
}

/// Health check response structure.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HealthResponse {
    /// "healthy" or "degraded"
    pub status: String,
    pub service: String,
    pub version: String,
    pub database: DatabaseHealth,
}

/// Database health status.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DatabaseHealth {
    pub connected: bool,
    /// sqlite or postgres
    pub db_type: String,
}

impl HealthResponse {
    pub fn new(db_connected: bool, db_type: &str) -> Self {
        Self {
            status: if db_connected { "healthy" } else { "degraded" }.to_string(),
            service: "keyforge".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: DatabaseHealth {
                connected: db_connected,
                db_type: db_type.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_is_valid_uuid() {
        let id = generate_request_id();
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn event_names_are_snake_case() {
        assert_eq!(
            ActivationEvent::VerificationFailed.to_string(),
            "verification_failed"
        );
        assert_eq!(
            ActivationEvent::DeviceStatusChanged.to_string(),
            "device_status_changed"
        );
    }

    #[test]
    fn health_response_healthy() {
        let health = HealthResponse::new(true, "sqlite");
        assert_eq!(health.status, "healthy");
        assert_eq!(health.service, "keyforge");
        assert!(health.database.connected);
    }

    #[test]
    fn health_response_degraded() {
        let health = HealthResponse::new(false, "postgres");
        assert_eq!(health.status, "degraded");
        assert!(!health.database.connected);
    }
}
