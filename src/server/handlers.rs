//! HTTP handlers.
//!
//! The verification route always answers with a `VerificationResponse`:
//! business rejections are HTTP 200 with `success = false`, malformed input
//! is 400 `INVALID_REQUEST`, and store faults are 500 `INTERNAL_ERROR` with no
//! storage detail. Administrative routes answer with `ApiError` on failure and
//! sit behind [`require_admin_key`].

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, Request, State,
    },
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};

use crate::config::{ListingConfig, RateLimitConfig};
use crate::protocol::{VerificationRequest, VerificationResponse, VerifyErrorCode};
use crate::server::api_error::{ApiError, ErrorCode};
use crate::server::database::{ActivationRecord, Database};
use crate::server::engine::{ActivationEngine, GenerateRequest, GenerateResponse};
use crate::server::logging::HealthResponse;
use crate::server::validation::{
    parse_device_status, parse_status_filter, validate_generate_request, validate_identifier,
    validate_verification_request, MAX_APP_ID_LEN, MAX_CODE_LEN, MAX_DEVICE_ID_LEN,
};

/// Header carrying the administrative key.
pub const ADMIN_KEY_HEADER: &str = "X-API-Key";

/// Shared application state for handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub engine: Arc<ActivationEngine>,
    /// SHA-256 of the configured admin key; `None` disables admin routes
    pub admin_key_hash: Option<[u8; 32]>,
    pub listing: ListingConfig,
    pub rate_limit: RateLimitConfig,
}

impl AppState {
    /// Build state around an engine. An empty `admin_api_key` disables the
    /// administrative routes. Rate limiting starts disabled.
    pub fn new(engine: ActivationEngine, admin_api_key: &str, listing: ListingConfig) -> Self {
        let admin_key_hash = (!admin_api_key.is_empty()).then(|| digest(admin_api_key));

        Self {
            db: Arc::clone(engine.database()),
            engine: Arc::new(engine),
            admin_key_hash,
            listing,
            rate_limit: RateLimitConfig {
                enabled: false,
                ..RateLimitConfig::default()
            },
        }
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

/// Constant-time digest comparison.
fn digests_match(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a[..].ct_eq(&b[..]).into()
}

// ============================================================================
// Admin authentication
// ============================================================================

/// Middleware guarding administrative routes.
///
/// - no key configured: 503 `ADMIN_DISABLED`
/// - header missing or wrong: 401 `INVALID_API_KEY`
pub async fn require_admin_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.admin_key_hash else {
        warn!("Admin request rejected: no admin key configured");
        return ApiError::new(ErrorCode::AdminDisabled).into_response();
    };

    let presented = request
        .headers()
        .get(ADMIN_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(digest);

    match presented {
        Some(hash) if digests_match(&expected, &hash) => next.run(request).await,
        _ => {
            warn!(path = %request.uri().path(), "Admin request rejected: invalid API key");
            ApiError::new(ErrorCode::InvalidApiKey).into_response()
        }
    }
}

// ============================================================================
// Health
// ============================================================================

/// `GET /api/health`
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connected = state.db.ping().await;
    Json(HealthResponse::new(connected, state.db.db_type()))
}

// ============================================================================
// Verification
// ============================================================================

fn invalid_verification(message: String) -> (StatusCode, Json<VerificationResponse>) {
    let mut response =
        VerificationResponse::failure(VerifyErrorCode::InvalidRequest, Utc::now().timestamp());
    response.message = message;
    (StatusCode::BAD_REQUEST, Json(response))
}

/// `POST /api/activation/verify`
pub async fn verify_handler(
    State(state): State<AppState>,
    payload: Result<Json<VerificationRequest>, JsonRejection>,
) -> (StatusCode, Json<VerificationResponse>) {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!("Rejected malformed verification request: {}", rejection.body_text());
            return invalid_verification(rejection.body_text());
        }
    };

    if let Err(e) = validate_verification_request(&request) {
        warn!("Rejected invalid verification request: {e}");
        return invalid_verification(e.to_string());
    }

    info!(
        app_id = %request.app_id,
        device_id = %request.device_id,
        "Verifying activation code"
    );

    match state.engine.verify(&request).await {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(e) => {
            error!(app_id = %request.app_id, "Verification failed internally: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(VerificationResponse::failure(
                    VerifyErrorCode::InternalError,
                    Utc::now().timestamp(),
                )),
            )
        }
    }
}

// ============================================================================
// Administration
// ============================================================================

/// `POST /api/activation/generate`
pub async fn generate_handler(
    State(state): State<AppState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let Json(request) = payload.map_err(|r| ApiError::invalid_request(r.body_text()))?;
    validate_generate_request(&request)?;

    info!(
        "Generating {} activation codes for app_id={}",
        request.count, request.app_id
    );

    Ok(Json(state.engine.generate(&request).await?))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub app_id: Option<String>,
    pub status: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub success: bool,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
    pub items: Vec<ActivationRecord>,
}

/// Resolve paging against the configured defaults: page 0 or absent is 1,
/// limit 0 or absent is the default, and limit is capped at the maximum.
fn resolve_paging(query: &ListQuery, listing: &ListingConfig) -> (u32, u32) {
    let page = query.page.filter(|p| *p > 0).unwrap_or(1);
    let limit = query
        .limit
        .filter(|l| *l > 0)
        .unwrap_or(listing.default_limit)
        .min(listing.max_limit);
    (page, limit)
}

/// `GET /api/activation/list?app_id&status&page&limit`
pub async fn list_handler(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<ListResponse>, ApiError> {
    let Query(query) = query.map_err(|r| ApiError::invalid_request(r.body_text()))?;

    let app_id = query.app_id.clone().unwrap_or_default();
    validate_identifier(&app_id, MAX_APP_ID_LEN, "app_id")?;
    let status = parse_status_filter(query.status.as_deref())?;
    let (page, limit) = resolve_paging(&query, &state.listing);

    info!(
        "Listing activation codes app_id={} status={:?} page={} limit={}",
        app_id, status, page, limit
    );

    let result = state.engine.list(&app_id, status, page, limit).await?;

    Ok(Json(ListResponse {
        success: true,
        total: result.total,
        page,
        limit,
        items: result.items,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RevokeResponse {
    pub success: bool,
    pub message: String,
}

/// `DELETE /api/activation/:app_id/:code`
pub async fn revoke_handler(
    State(state): State<AppState>,
    Path((app_id, code)): Path<(String, String)>,
) -> Result<Json<RevokeResponse>, ApiError> {
    validate_identifier(&app_id, MAX_APP_ID_LEN, "app_id")?;
    validate_identifier(&code, MAX_CODE_LEN, "code")?;

    info!("Revoking activation code for app_id={}", app_id);

    if !state.engine.revoke(&app_id, &code).await? {
        return Err(ApiError::new(ErrorCode::CodeNotFound));
    }

    Ok(Json(RevokeResponse {
        success: true,
        message: "Activation code revoked".to_string(),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceStatusRequest {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceStatusResponse {
    pub success: bool,
    pub device_id: String,
    pub status: String,
}

/// `PUT /api/devices/:app_id/:device_id/status`
pub async fn device_status_handler(
    State(state): State<AppState>,
    Path((app_id, device_id)): Path<(String, String)>,
    payload: Result<Json<DeviceStatusRequest>, JsonRejection>,
) -> Result<Json<DeviceStatusResponse>, ApiError> {
    let Json(request) = payload.map_err(|r| ApiError::invalid_request(r.body_text()))?;
    validate_identifier(&app_id, MAX_APP_ID_LEN, "app_id")?;
    validate_identifier(&device_id, MAX_DEVICE_ID_LEN, "device_id")?;
    let status = parse_device_status(&request.status)?;

    info!(
        "Setting device status app_id={} device_id={} status={}",
        app_id,
        device_id,
        status.as_str()
    );

    if !state
        .engine
        .set_device_status(&app_id, &device_id, status)
        .await?
    {
        return Err(ApiError::new(ErrorCode::DeviceNotFound));
    }

    Ok(Json(DeviceStatusResponse {
        success: true,
        device_id,
        status: status.as_str().to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(page: Option<u32>, limit: Option<u32>) -> ListQuery {
        ListQuery {
            app_id: Some("demo".to_string()),
            status: None,
            page,
            limit,
        }
    }

    #[test]
    fn paging_defaults_and_caps() {
        let listing = ListingConfig::default();
        assert_eq!(resolve_paging(&query(None, None), &listing), (1, 20));
        assert_eq!(resolve_paging(&query(Some(0), Some(0)), &listing), (1, 20));
        assert_eq!(resolve_paging(&query(Some(3), Some(500)), &listing), (3, 100));
        assert_eq!(resolve_paging(&query(Some(2), Some(5)), &listing), (2, 5));
    }

    #[test]
    fn digest_comparison() {
        let a = digest("admin-key");
        assert!(digests_match(&a, &digest("admin-key")));
        assert!(!digests_match(&a, &digest("admin-kez")));
    }
}
