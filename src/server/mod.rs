// src/server/mod.rs

//! Server-side components for Keyforge.
//!
//! - `database`    → store abstraction over SQLite/Postgres
//! - `engine`      → activation verification engine
//! - `audit`       → fire-and-forget audit recorder
//! - `handlers`    → Axum HTTP handlers and admin key middleware
//! - `routes`      → router builder
//! - `api_error`   → error envelope for admin routes
//! - `logging`     → request logging middleware and activation events
//! - `validation`  → request validation
//! - `rate_limit`  → verification rate limiter (requires `rate-limiting` feature)

pub mod api_error;
pub mod audit;
pub mod database;
pub mod engine;
pub mod handlers;
pub mod logging;
pub mod routes;
pub mod validation;

#[cfg(feature = "rate-limiting")]
pub mod rate_limit;

pub use api_error::{ApiError, ErrorCode};
pub use audit::{AuditRecorder, AuditWorker};
pub use database::{
    ActivationRecord, ActivationStatus, ConsumeOutcome, Database, DeviceBinding, DeviceStatus,
};
pub use engine::{ActivationEngine, CodeItem, GenerateRequest, GenerateResponse};
pub use handlers::{AppState, ADMIN_KEY_HEADER};
pub use routes::build_router;
