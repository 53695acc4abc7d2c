//! Keyforge - activation code issuance and verification
//!
//! Codes are bound to devices, capped by usage and device limits, and every
//! successful verification is answered with an HMAC-signed payload the client
//! can authenticate with the shared secret.
//!
//! # Features
//!
//! - `server` - Verification engine, store, audit worker and HTTP API. Enabled by default.
//! - `sqlite` - SQLite backend. Enabled by default.
//! - `postgres` - PostgreSQL backend.
//! - `rate-limiting` - Per-IP rate limit on the verification endpoint.
//!
//! # Example
//!
//! ```toml
//! # Server with SQLite (default)
//! keyforge = "0.1"
//!
//! # Client-only (code format checks and response authentication)
//! keyforge = { version = "0.1", default-features = false }
//!
//! # Server with PostgreSQL
//! keyforge = { version = "0.1", features = ["server", "postgres"] }
//! ```

// Core modules (always available)
pub mod client;
pub mod code_generator;
pub mod config;
pub mod errors;
pub mod protocol;
pub mod signer;

// Server-related modules (requires "server" feature)
#[cfg(feature = "server")]
#[path = "server/mod.rs"]
pub mod server;
