use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};

use crate::server::handlers::{
    device_status_handler, generate_handler, health_handler, list_handler, require_admin_key,
    revoke_handler, verify_handler, AppState,
};
use crate::server::logging::request_logging_middleware;

/// Build the application router.
///
/// # Routes
///
/// ## Public
/// - `GET  /api/health` - Service and database health
/// - `POST /api/activation/verify` - Verify an activation code for a device
///
/// ## Admin (`X-API-Key` required)
/// - `POST   /api/activation/generate` - Issue a batch of codes
/// - `GET    /api/activation/list` - Page through an app's codes
/// - `DELETE /api/activation/:app_id/:code` - Revoke a code
/// - `PUT    /api/devices/:app_id/:device_id/status` - Block or unblock a device
pub fn build_router(state: AppState) -> Router {
    let verify = Router::new().route("/api/activation/verify", post(verify_handler));

    #[cfg(feature = "rate-limiting")]
    let verify = apply_verify_rate_limit(verify, &state);

    let admin = Router::new()
        .route("/api/activation/generate", post(generate_handler))
        .route("/api/activation/list", get(list_handler))
        .route("/api/activation/:app_id/:code", delete(revoke_handler))
        .route(
            "/api/devices/:app_id/:device_id/status",
            put(device_status_handler),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_key,
        ));

    Router::new()
        .route("/api/health", get(health_handler))
        .merge(verify)
        .merge(admin)
        .layer(middleware::from_fn(request_logging_middleware))
        .with_state(state)
}

#[cfg(feature = "rate-limiting")]
fn apply_verify_rate_limit(
    router: Router<AppState>,
    state: &AppState,
) -> Router<AppState> {
    use crate::server::rate_limit::create_verify_rate_limiter;

    if !state.rate_limit.enabled {
        return router;
    }

    match create_verify_rate_limiter(&state.rate_limit) {
        Some(layer) => router.layer(layer),
        None => {
            tracing::warn!("Invalid rate limit configuration, verification is not rate limited");
            router
        }
    }
}
