//! Relational store for activation codes, device bindings and audit entries.
//!
//! The store is the single source of truth and the only synchronization point
//! between concurrent verifications. The verification engine owns every write
//! to `activation_keys` and `device_records`; the audit recorder owns writes
//! to `audit_logs`.

use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::{query, query_as, query_scalar, FromRow};
use std::sync::Arc;
use tracing::{debug, error};

#[cfg(feature = "sqlite")]
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

#[cfg(feature = "postgres")]
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::config::{get_config, DatabaseConfig};
use crate::errors::{ActivationError, ActivationResult};

// ============================================================================
// Row types
// ============================================================================

/// Lifecycle state of an activation code.
///
/// Only `Active` has outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationStatus {
    Active,
    Used,
    Expired,
    Revoked,
}

impl ActivationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationStatus::Active => "active",
            ActivationStatus::Used => "used",
            ActivationStatus::Expired => "expired",
            ActivationStatus::Revoked => "revoked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(ActivationStatus::Active),
            "used" => Some(ActivationStatus::Used),
            "expired" => Some(ActivationStatus::Expired),
            "revoked" => Some(ActivationStatus::Revoked),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActivationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Administrative state of a device binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Active,
    Blocked,
    Suspended,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Active => "active",
            DeviceStatus::Blocked => "blocked",
            DeviceStatus::Suspended => "suspended",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(DeviceStatus::Active),
            "blocked" => Some(DeviceStatus::Blocked),
            "suspended" => Some(DeviceStatus::Suspended),
            _ => None,
        }
    }
}

/// A row of `activation_keys`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ActivationRecord {
    pub id: i64,
    pub code: String,
    pub app_id: String,
    pub status: String,
    pub created_at: NaiveDateTime,
    pub expires_at: Option<NaiveDateTime>,
    pub used_at: Option<NaiveDateTime>,
    /// 0 means unlimited
    pub max_uses: i64,
    pub used_count: i64,
    /// `None` means unlimited devices
    pub device_limit: Option<i64>,
    pub notes: String,
    pub created_by: String,
}

impl ActivationRecord {
    /// Parsed status. Unknown strings are treated as revoked so a corrupted
    /// row can never be honoured.
    pub fn status(&self) -> ActivationStatus {
        ActivationStatus::parse(&self.status).unwrap_or(ActivationStatus::Revoked)
    }

    pub fn is_expired_at(&self, now: NaiveDateTime) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    pub fn uses_exhausted(&self) -> bool {
        self.max_uses > 0 && self.used_count >= self.max_uses
    }
}

/// A row of `device_records`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DeviceBinding {
    pub id: i64,
    pub device_id: String,
    pub app_id: String,
    pub activation_id: Option<i64>,
    pub device_name: Option<String>,
    pub model: Option<String>,
    pub os_version: Option<String>,
    pub app_version: Option<String>,
    pub device_info: Option<String>,
    pub first_activated_at: NaiveDateTime,
    pub last_activated_at: Option<NaiveDateTime>,
    pub activation_count: i64,
    pub status: String,
}

/// A row of `audit_logs`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub action: String,
    pub activation_id: Option<i64>,
    pub device_id: String,
    pub result: String,
    pub error_message: String,
    pub device_info: String,
    pub created_at: NaiveDateTime,
}

/// Fields needed to insert a new activation code.
#[derive(Debug, Clone)]
pub struct NewActivation {
    pub code: String,
    pub app_id: String,
    pub max_uses: i64,
    pub device_limit: Option<i64>,
    pub expires_at: Option<NaiveDateTime>,
    pub notes: String,
    pub created_by: String,
    pub created_at: NaiveDateTime,
}

/// Device fields written by a successful verification.
#[derive(Debug, Clone, Default)]
pub struct DeviceUpsert {
    pub device_id: String,
    pub app_id: String,
    pub device_name: Option<String>,
    pub model: Option<String>,
    pub os_version: Option<String>,
    pub app_version: Option<String>,
    /// Serialized device metadata map
    pub device_info: String,
}

/// Fields of an audit entry before it is persisted.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub action: String,
    pub activation_id: Option<i64>,
    pub device_id: String,
    pub result: String,
    pub error_message: String,
    pub device_info: String,
    pub created_at: NaiveDateTime,
}

/// Outcome of the transactional device-limit check, binding upsert and
/// counter advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// All writes committed.
    Admitted {
        used_count: i64,
        devices_used: i64,
        activation_count: i64,
    },
    /// The record has no free device slot for this device. Nothing was written.
    DeviceLimitReached { devices_used: i64 },
    /// The device's binding is blocked or suspended. Nothing was written.
    DeviceBlocked { status: String },
    /// The record stopped being consumable (status changed, uses exhausted or
    /// expired) between the caller's read and the transaction. Nothing was
    /// written; the caller should re-read and re-run its checks.
    Stale,
}

/// Page of activation records plus the filtered total.
#[derive(Debug, Clone)]
pub struct ActivationPage {
    pub items: Vec<ActivationRecord>,
    pub total: i64,
}

// ============================================================================
// Schema
// ============================================================================

#[cfg(feature = "sqlite")]
const SQLITE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS activation_keys (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        code            TEXT NOT NULL UNIQUE,
        app_id          TEXT NOT NULL,
        status          TEXT NOT NULL DEFAULT 'active',
        created_at      TEXT NOT NULL,
        expires_at      TEXT,
        used_at         TEXT,
        max_uses        INTEGER NOT NULL DEFAULT 1,
        used_count      INTEGER NOT NULL DEFAULT 0,
        device_limit    INTEGER,
        notes           TEXT NOT NULL DEFAULT '',
        created_by      TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS device_records (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id           TEXT NOT NULL,
        app_id              TEXT NOT NULL,
        activation_id       INTEGER REFERENCES activation_keys(id),
        device_name         TEXT,
        model               TEXT,
        os_version          TEXT,
        app_version         TEXT,
        device_info         TEXT,
        first_activated_at  TEXT NOT NULL,
        last_activated_at   TEXT,
        activation_count    INTEGER NOT NULL DEFAULT 1,
        status              TEXT NOT NULL DEFAULT 'active',
        UNIQUE (device_id, app_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS audit_logs (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        action          TEXT NOT NULL,
        activation_id   INTEGER,
        device_id       TEXT NOT NULL DEFAULT '',
        result          TEXT NOT NULL,
        error_message   TEXT NOT NULL DEFAULT '',
        device_info     TEXT NOT NULL DEFAULT '',
        created_at      TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_activation_app_id ON activation_keys(app_id)",
    "CREATE INDEX IF NOT EXISTS idx_activation_status ON activation_keys(status)",
    "CREATE INDEX IF NOT EXISTS idx_device_activation ON device_records(activation_id)",
    "CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_logs(action)",
    "CREATE INDEX IF NOT EXISTS idx_audit_device_id ON audit_logs(device_id)",
    "CREATE INDEX IF NOT EXISTS idx_audit_created_at ON audit_logs(created_at)",
];

#[cfg(feature = "postgres")]
const POSTGRES_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS activation_keys (
        id              BIGSERIAL PRIMARY KEY,
        code            TEXT NOT NULL UNIQUE,
        app_id          TEXT NOT NULL,
        status          TEXT NOT NULL DEFAULT 'active',
        created_at      TIMESTAMP NOT NULL,
        expires_at      TIMESTAMP,
        used_at         TIMESTAMP,
        max_uses        BIGINT NOT NULL DEFAULT 1,
        used_count      BIGINT NOT NULL DEFAULT 0,
        device_limit    BIGINT,
        notes           TEXT NOT NULL DEFAULT '',
        created_by      TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS device_records (
        id                  BIGSERIAL PRIMARY KEY,
        device_id           TEXT NOT NULL,
        app_id              TEXT NOT NULL,
        activation_id       BIGINT REFERENCES activation_keys(id),
        device_name         TEXT,
        model               TEXT,
        os_version          TEXT,
        app_version         TEXT,
        device_info         TEXT,
        first_activated_at  TIMESTAMP NOT NULL,
        last_activated_at   TIMESTAMP,
        activation_count    BIGINT NOT NULL DEFAULT 1,
        status              TEXT NOT NULL DEFAULT 'active',
        UNIQUE (device_id, app_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS audit_logs (
        id              BIGSERIAL PRIMARY KEY,
        action          TEXT NOT NULL,
        activation_id   BIGINT,
        device_id       TEXT NOT NULL DEFAULT '',
        result          TEXT NOT NULL,
        error_message   TEXT NOT NULL DEFAULT '',
        device_info     TEXT NOT NULL DEFAULT '',
        created_at      TIMESTAMP NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_activation_app_id ON activation_keys(app_id)",
    "CREATE INDEX IF NOT EXISTS idx_activation_status ON activation_keys(status)",
    "CREATE INDEX IF NOT EXISTS idx_device_activation ON device_records(activation_id)",
    "CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_logs(action)",
    "CREATE INDEX IF NOT EXISTS idx_audit_device_id ON audit_logs(device_id)",
    "CREATE INDEX IF NOT EXISTS idx_audit_created_at ON audit_logs(created_at)",
];

/// Log a failed store operation and convert it.
///
/// Unique violations become `Conflict` so callers can retry.
fn db_err(op: &'static str) -> impl FnOnce(sqlx::Error) -> ActivationError {
    move |e| {
        error!("{op} failed: {e}");
        ActivationError::from(e)
    }
}

// ============================================================================
// Database
// ============================================================================

/// Unified database abstraction over SQLite and Postgres.
///
/// Available variants depend on enabled features:
/// - `sqlite` feature enables `Database::SQLite`
/// - `postgres` feature enables `Database::Postgres`
#[derive(Debug, Clone)]
pub enum Database {
    #[cfg(feature = "sqlite")]
    SQLite(SqlitePool),
    #[cfg(feature = "postgres")]
    Postgres(PgPool),
}

impl Database {
    /// Connect using the global configuration.
    pub async fn new() -> ActivationResult<Arc<Self>> {
        let config = get_config()?;
        Self::connect(&config.database).await.map(Arc::new)
    }

    /// Connect using an explicit database configuration.
    pub async fn connect(db_config: &DatabaseConfig) -> ActivationResult<Self> {
        match db_config.db_type.as_str() {
            #[cfg(feature = "sqlite")]
            "sqlite" => {
                let pool = SqlitePoolOptions::new()
                    .max_connections(db_config.max_connections)
                    .connect(&db_config.sqlite_url)
                    .await
                    .map_err(|e| {
                        error!("Failed to connect to SQLite: {e}");
                        ActivationError::Storage(format!("failed to connect to SQLite: {e}"))
                    })?;

                Ok(Database::SQLite(pool))
            }
            #[cfg(not(feature = "sqlite"))]
            "sqlite" => Err(ActivationError::Config(
                "SQLite support not compiled in. Enable the 'sqlite' feature.".to_string(),
            )),
            #[cfg(feature = "postgres")]
            "postgres" => {
                let pool = PgPoolOptions::new()
                    .max_connections(db_config.max_connections)
                    .connect(&db_config.postgres_url)
                    .await
                    .map_err(|e| {
                        error!("Failed to connect to PostgreSQL: {e}");
                        ActivationError::Storage(format!("failed to connect to PostgreSQL: {e}"))
                    })?;

                Ok(Database::Postgres(pool))
            }
            #[cfg(not(feature = "postgres"))]
            "postgres" => Err(ActivationError::Config(
                "PostgreSQL support not compiled in. Enable the 'postgres' feature.".to_string(),
            )),
            other => Err(ActivationError::Config(format!(
                "unsupported database type: {other}"
            ))),
        }
    }

    /// Backend name for health reporting.
    pub fn db_type(&self) -> &'static str {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(_) => "sqlite",
            #[cfg(feature = "postgres")]
            Database::Postgres(_) => "postgres",
        }
    }

    /// Create tables and indexes if they do not exist.
    pub async fn migrate(&self) -> ActivationResult<()> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                for statement in SQLITE_SCHEMA {
                    query(statement)
                        .execute(pool)
                        .await
                        .map_err(db_err("SQLite migrate"))?;
                }
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                for statement in POSTGRES_SCHEMA {
                    query(statement)
                        .execute(pool)
                        .await
                        .map_err(db_err("Postgres migrate"))?;
                }
            }
        }
        Ok(())
    }

    /// Round-trip a trivial query.
    pub async fn ping(&self) -> bool {
        let result = match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => query("SELECT 1").execute(pool).await.map(|_| ()),
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => query("SELECT 1").execute(pool).await.map(|_| ()),
        };
        result.is_ok()
    }

    // ------------------------------------------------------------------------
    // Activation records
    // ------------------------------------------------------------------------

    /// Insert a new `active` activation code and return its id.
    ///
    /// A duplicate code surfaces as `ActivationError::Conflict`.
    pub async fn insert_activation(&self, new: &NewActivation) -> ActivationResult<i64> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                let result = query(
                    r#"
                    INSERT INTO activation_keys (
                        code, app_id, status, created_at, expires_at,
                        max_uses, used_count, device_limit, notes, created_by
                    )
                    VALUES (?, ?, 'active', ?, ?, ?, 0, ?, ?, ?)
                    "#,
                )
                .bind(&new.code)
                .bind(&new.app_id)
                .bind(new.created_at)
                .bind(new.expires_at)
                .bind(new.max_uses)
                .bind(new.device_limit)
                .bind(&new.notes)
                .bind(&new.created_by)
                .execute(pool)
                .await
                .map_err(db_err("SQLite insert_activation"))?;

                Ok(result.last_insert_rowid())
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => query_scalar::<_, i64>(
                r#"
                INSERT INTO activation_keys (
                    code, app_id, status, created_at, expires_at,
                    max_uses, used_count, device_limit, notes, created_by
                )
                VALUES ($1, $2, 'active', $3, $4, $5, 0, $6, $7, $8)
                RETURNING id
                "#,
            )
            .bind(&new.code)
            .bind(&new.app_id)
            .bind(new.created_at)
            .bind(new.expires_at)
            .bind(new.max_uses)
            .bind(new.device_limit)
            .bind(&new.notes)
            .bind(&new.created_by)
            .fetch_one(pool)
            .await
            .map_err(db_err("Postgres insert_activation")),
        }
    }

    /// Find an activation record by its code within an app.
    pub async fn get_activation_by_code(
        &self,
        code: &str,
        app_id: &str,
    ) -> ActivationResult<Option<ActivationRecord>> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => query_as::<_, ActivationRecord>(
                "SELECT * FROM activation_keys WHERE code = ? AND app_id = ?",
            )
            .bind(code)
            .bind(app_id)
            .fetch_optional(pool)
            .await
            .map_err(db_err("SQLite get_activation_by_code")),
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => query_as::<_, ActivationRecord>(
                "SELECT * FROM activation_keys WHERE code = $1 AND app_id = $2",
            )
            .bind(code)
            .bind(app_id)
            .fetch_optional(pool)
            .await
            .map_err(db_err("Postgres get_activation_by_code")),
        }
    }

    /// Fetch an activation record by id.
    pub async fn get_activation(&self, id: i64) -> ActivationResult<Option<ActivationRecord>> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                query_as::<_, ActivationRecord>("SELECT * FROM activation_keys WHERE id = ?")
                    .bind(id)
                    .fetch_optional(pool)
                    .await
                    .map_err(db_err("SQLite get_activation"))
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query_as::<_, ActivationRecord>("SELECT * FROM activation_keys WHERE id = $1")
                    .bind(id)
                    .fetch_optional(pool)
                    .await
                    .map_err(db_err("Postgres get_activation"))
            }
        }
    }

    /// Move an `active` record to `status`.
    ///
    /// Guarded by the current status, so concurrent callers observe exactly
    /// one successful transition. Returns whether this call performed it.
    pub async fn transition_status_if_active(
        &self,
        id: i64,
        status: ActivationStatus,
    ) -> ActivationResult<bool> {
        let rows = match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => query(
                "UPDATE activation_keys SET status = ? WHERE id = ? AND status = 'active'",
            )
            .bind(status.as_str())
            .bind(id)
            .execute(pool)
            .await
            .map_err(db_err("SQLite transition_status_if_active"))?
            .rows_affected(),
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => query(
                "UPDATE activation_keys SET status = $1 WHERE id = $2 AND status = 'active'",
            )
            .bind(status.as_str())
            .bind(id)
            .execute(pool)
            .await
            .map_err(db_err("Postgres transition_status_if_active"))?
            .rows_affected(),
        };

        Ok(rows > 0)
    }

    /// Set `status = 'revoked'` regardless of the current status.
    ///
    /// Returns `Ok(false)` if no record matches.
    pub async fn revoke_activation(&self, app_id: &str, code: &str) -> ActivationResult<bool> {
        let rows = match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => query(
                "UPDATE activation_keys SET status = 'revoked' WHERE app_id = ? AND code = ?",
            )
            .bind(app_id)
            .bind(code)
            .execute(pool)
            .await
            .map_err(db_err("SQLite revoke_activation"))?
            .rows_affected(),
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => query(
                "UPDATE activation_keys SET status = 'revoked' WHERE app_id = $1 AND code = $2",
            )
            .bind(app_id)
            .bind(code)
            .execute(pool)
            .await
            .map_err(db_err("Postgres revoke_activation"))?
            .rows_affected(),
        };

        Ok(rows > 0)
    }

    /// Page through an app's activation codes, newest first.
    ///
    /// `page` is 1-indexed. `total` applies the same status filter as the page.
    pub async fn list_activations(
        &self,
        app_id: &str,
        status: Option<ActivationStatus>,
        page: u32,
        limit: u32,
    ) -> ActivationResult<ActivationPage> {
        let status = status.map(|s| s.as_str());
        let limit = i64::from(limit);
        let offset = i64::from(page.saturating_sub(1)) * limit;

        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                let total = query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM activation_keys \
                     WHERE app_id = ? AND (? IS NULL OR status = ?)",
                )
                .bind(app_id)
                .bind(status)
                .bind(status)
                .fetch_one(pool)
                .await
                .map_err(db_err("SQLite list_activations count"))?;

                let items = query_as::<_, ActivationRecord>(
                    "SELECT * FROM activation_keys \
                     WHERE app_id = ? AND (? IS NULL OR status = ?) \
                     ORDER BY id DESC LIMIT ? OFFSET ?",
                )
                .bind(app_id)
                .bind(status)
                .bind(status)
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await
                .map_err(db_err("SQLite list_activations"))?;

                Ok(ActivationPage { items, total })
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                let total = query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM activation_keys \
                     WHERE app_id = $1 AND ($2::TEXT IS NULL OR status = $2)",
                )
                .bind(app_id)
                .bind(status)
                .fetch_one(pool)
                .await
                .map_err(db_err("Postgres list_activations count"))?;

                let items = query_as::<_, ActivationRecord>(
                    "SELECT * FROM activation_keys \
                     WHERE app_id = $1 AND ($2::TEXT IS NULL OR status = $2) \
                     ORDER BY id DESC LIMIT $3 OFFSET $4",
                )
                .bind(app_id)
                .bind(status)
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await
                .map_err(db_err("Postgres list_activations"))?;

                Ok(ActivationPage { items, total })
            }
        }
    }

    // ------------------------------------------------------------------------
    // Consumption (device-limit check + binding upsert + counter advance)
    // ------------------------------------------------------------------------

    /// Atomically admit `device` against activation record `activation_id`.
    ///
    /// Runs in one transaction whose first statement is the guarded counter
    /// increment on the activation row. That write takes the row lock
    /// (Postgres) or the database write lock (SQLite) before the device count
    /// is read, so concurrent verifications of the same code are serialized:
    /// they cannot both see a free device slot and their increments cannot
    /// overwrite each other. Any rejection rolls the increment back.
    pub async fn consume_activation(
        &self,
        activation_id: i64,
        device_limit: Option<i64>,
        device: &DeviceUpsert,
        now: NaiveDateTime,
    ) -> ActivationResult<ConsumeOutcome> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                let mut tx = pool.begin().await.map_err(db_err("SQLite begin"))?;

                let used_count = query_scalar::<_, i64>(
                    r#"
                    UPDATE activation_keys
                       SET used_count = used_count + 1, used_at = ?
                     WHERE id = ?
                       AND status = 'active'
                       AND (max_uses = 0 OR used_count < max_uses)
                       AND (expires_at IS NULL OR expires_at > ?)
                    RETURNING used_count
                    "#,
                )
                .bind(now)
                .bind(activation_id)
                .bind(now)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err("SQLite consume_activation claim"))?;

                let Some(used_count) = used_count else {
                    tx.rollback().await.map_err(db_err("SQLite rollback"))?;
                    return Ok(ConsumeOutcome::Stale);
                };

                let existing = query_as::<_, DeviceBinding>(
                    "SELECT * FROM device_records WHERE device_id = ? AND app_id = ?",
                )
                .bind(&device.device_id)
                .bind(&device.app_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err("SQLite consume_activation binding lookup"))?;

                if let Some(binding) = &existing {
                    if binding.status != DeviceStatus::Active.as_str() {
                        tx.rollback().await.map_err(db_err("SQLite rollback"))?;
                        return Ok(ConsumeOutcome::DeviceBlocked {
                            status: binding.status.clone(),
                        });
                    }
                }

                let already_bound = existing
                    .as_ref()
                    .is_some_and(|b| b.activation_id == Some(activation_id));

                if let (Some(limit), false) = (device_limit, already_bound) {
                    let bound = query_scalar::<_, i64>(
                        "SELECT COUNT(DISTINCT device_id) FROM device_records WHERE activation_id = ?",
                    )
                    .bind(activation_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(db_err("SQLite consume_activation device count"))?;

                    if bound >= limit {
                        tx.rollback().await.map_err(db_err("SQLite rollback"))?;
                        return Ok(ConsumeOutcome::DeviceLimitReached {
                            devices_used: bound,
                        });
                    }
                }

                let activation_count = query_scalar::<_, i64>(
                    r#"
                    INSERT INTO device_records (
                        device_id, app_id, activation_id, device_name, model,
                        os_version, app_version, device_info,
                        first_activated_at, last_activated_at, activation_count, status
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, 'active')
                    ON CONFLICT (device_id, app_id) DO UPDATE SET
                        activation_id     = excluded.activation_id,
                        activation_count  = device_records.activation_count + 1,
                        last_activated_at = excluded.last_activated_at
                    RETURNING activation_count
                    "#,
                )
                .bind(&device.device_id)
                .bind(&device.app_id)
                .bind(activation_id)
                .bind(&device.device_name)
                .bind(&device.model)
                .bind(&device.os_version)
                .bind(&device.app_version)
                .bind(&device.device_info)
                .bind(now)
                .bind(now)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err("SQLite consume_activation binding upsert"))?;

                let devices_used = query_scalar::<_, i64>(
                    "SELECT COUNT(DISTINCT device_id) FROM device_records WHERE activation_id = ?",
                )
                .bind(activation_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err("SQLite consume_activation device count"))?;

                tx.commit().await.map_err(db_err("SQLite commit"))?;

                Ok(ConsumeOutcome::Admitted {
                    used_count,
                    devices_used,
                    activation_count,
                })
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                let mut tx = pool.begin().await.map_err(db_err("Postgres begin"))?;

                let used_count = query_scalar::<_, i64>(
                    r#"
                    UPDATE activation_keys
                       SET used_count = used_count + 1, used_at = $1
                     WHERE id = $2
                       AND status = 'active'
                       AND (max_uses = 0 OR used_count < max_uses)
                       AND (expires_at IS NULL OR expires_at > $1)
                    RETURNING used_count
                    "#,
                )
                .bind(now)
                .bind(activation_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err("Postgres consume_activation claim"))?;

                let Some(used_count) = used_count else {
                    tx.rollback().await.map_err(db_err("Postgres rollback"))?;
                    return Ok(ConsumeOutcome::Stale);
                };

                let existing = query_as::<_, DeviceBinding>(
                    "SELECT * FROM device_records WHERE device_id = $1 AND app_id = $2 FOR UPDATE",
                )
                .bind(&device.device_id)
                .bind(&device.app_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err("Postgres consume_activation binding lookup"))?;

                if let Some(binding) = &existing {
                    if binding.status != DeviceStatus::Active.as_str() {
                        tx.rollback().await.map_err(db_err("Postgres rollback"))?;
                        return Ok(ConsumeOutcome::DeviceBlocked {
                            status: binding.status.clone(),
                        });
                    }
                }

                let already_bound = existing
                    .as_ref()
                    .is_some_and(|b| b.activation_id == Some(activation_id));

                if let (Some(limit), false) = (device_limit, already_bound) {
                    let bound = query_scalar::<_, i64>(
                        "SELECT COUNT(DISTINCT device_id) FROM device_records WHERE activation_id = $1",
                    )
                    .bind(activation_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(db_err("Postgres consume_activation device count"))?;

                    if bound >= limit {
                        tx.rollback().await.map_err(db_err("Postgres rollback"))?;
                        return Ok(ConsumeOutcome::DeviceLimitReached {
                            devices_used: bound,
                        });
                    }
                }

                let activation_count = query_scalar::<_, i64>(
                    r#"
                    INSERT INTO device_records (
                        device_id, app_id, activation_id, device_name, model,
                        os_version, app_version, device_info,
                        first_activated_at, last_activated_at, activation_count, status
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9, 1, 'active')
                    ON CONFLICT (device_id, app_id) DO UPDATE SET
                        activation_id     = EXCLUDED.activation_id,
                        activation_count  = device_records.activation_count + 1,
                        last_activated_at = EXCLUDED.last_activated_at
                    RETURNING activation_count
                    "#,
                )
                .bind(&device.device_id)
                .bind(&device.app_id)
                .bind(activation_id)
                .bind(&device.device_name)
                .bind(&device.model)
                .bind(&device.os_version)
                .bind(&device.app_version)
                .bind(&device.device_info)
                .bind(now)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err("Postgres consume_activation binding upsert"))?;

                let devices_used = query_scalar::<_, i64>(
                    "SELECT COUNT(DISTINCT device_id) FROM device_records WHERE activation_id = $1",
                )
                .bind(activation_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err("Postgres consume_activation device count"))?;

                tx.commit().await.map_err(db_err("Postgres commit"))?;

                Ok(ConsumeOutcome::Admitted {
                    used_count,
                    devices_used,
                    activation_count,
                })
            }
        }
    }

    // ------------------------------------------------------------------------
    // Device bindings
    // ------------------------------------------------------------------------

    /// Number of distinct devices currently bound to an activation record.
    pub async fn count_bound_devices(&self, activation_id: i64) -> ActivationResult<i64> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => query_scalar::<_, i64>(
                "SELECT COUNT(DISTINCT device_id) FROM device_records WHERE activation_id = ?",
            )
            .bind(activation_id)
            .fetch_one(pool)
            .await
            .map_err(db_err("SQLite count_bound_devices")),
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => query_scalar::<_, i64>(
                "SELECT COUNT(DISTINCT device_id) FROM device_records WHERE activation_id = $1",
            )
            .bind(activation_id)
            .fetch_one(pool)
            .await
            .map_err(db_err("Postgres count_bound_devices")),
        }
    }

    /// Fetch the binding for a `(device_id, app_id)` pair.
    pub async fn get_device_binding(
        &self,
        device_id: &str,
        app_id: &str,
    ) -> ActivationResult<Option<DeviceBinding>> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => query_as::<_, DeviceBinding>(
                "SELECT * FROM device_records WHERE device_id = ? AND app_id = ?",
            )
            .bind(device_id)
            .bind(app_id)
            .fetch_optional(pool)
            .await
            .map_err(db_err("SQLite get_device_binding")),
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => query_as::<_, DeviceBinding>(
                "SELECT * FROM device_records WHERE device_id = $1 AND app_id = $2",
            )
            .bind(device_id)
            .bind(app_id)
            .fetch_optional(pool)
            .await
            .map_err(db_err("Postgres get_device_binding")),
        }
    }

    /// Block, suspend or re-activate a device binding.
    ///
    /// Returns `Ok(false)` if the device has never been bound in this app.
    pub async fn set_device_status(
        &self,
        app_id: &str,
        device_id: &str,
        status: DeviceStatus,
    ) -> ActivationResult<bool> {
        let rows = match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => query(
                "UPDATE device_records SET status = ? WHERE app_id = ? AND device_id = ?",
            )
            .bind(status.as_str())
            .bind(app_id)
            .bind(device_id)
            .execute(pool)
            .await
            .map_err(db_err("SQLite set_device_status"))?
            .rows_affected(),
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => query(
                "UPDATE device_records SET status = $1 WHERE app_id = $2 AND device_id = $3",
            )
            .bind(status.as_str())
            .bind(app_id)
            .bind(device_id)
            .execute(pool)
            .await
            .map_err(db_err("Postgres set_device_status"))?
            .rows_affected(),
        };

        Ok(rows > 0)
    }

    // ------------------------------------------------------------------------
    // Audit log
    // ------------------------------------------------------------------------

    /// Append an audit entry.
    pub async fn insert_audit_entry(&self, entry: &NewAuditEntry) -> ActivationResult<()> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                query(
                    "INSERT INTO audit_logs \
                     (action, activation_id, device_id, result, error_message, device_info, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&entry.action)
                .bind(entry.activation_id)
                .bind(&entry.device_id)
                .bind(&entry.result)
                .bind(&entry.error_message)
                .bind(&entry.device_info)
                .bind(entry.created_at)
                .execute(pool)
                .await
                .map_err(db_err("SQLite insert_audit_entry"))?;
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query(
                    "INSERT INTO audit_logs \
                     (action, activation_id, device_id, result, error_message, device_info, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7)",
                )
                .bind(&entry.action)
                .bind(entry.activation_id)
                .bind(&entry.device_id)
                .bind(&entry.result)
                .bind(&entry.error_message)
                .bind(&entry.device_info)
                .bind(entry.created_at)
                .execute(pool)
                .await
                .map_err(db_err("Postgres insert_audit_entry"))?;
            }
        }

        debug!(action = %entry.action, result = %entry.result, "audit entry written");
        Ok(())
    }

    /// Most recent audit entries, newest first.
    ///
    /// Inspection only: the verification path never reads audit entries.
    pub async fn list_audit_entries(&self, limit: u32) -> ActivationResult<Vec<AuditEntry>> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                query_as::<_, AuditEntry>("SELECT * FROM audit_logs ORDER BY id DESC LIMIT ?")
                    .bind(i64::from(limit))
                    .fetch_all(pool)
                    .await
                    .map_err(db_err("SQLite list_audit_entries"))
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query_as::<_, AuditEntry>("SELECT * FROM audit_logs ORDER BY id DESC LIMIT $1")
                    .bind(i64::from(limit))
                    .fetch_all(pool)
                    .await
                    .map_err(db_err("Postgres list_audit_entries"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_status_round_trip() {
        for status in [
            ActivationStatus::Active,
            ActivationStatus::Used,
            ActivationStatus::Expired,
            ActivationStatus::Revoked,
        ] {
            assert_eq!(ActivationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ActivationStatus::parse("ACTIVE"), None);
    }

    #[test]
    fn unknown_status_is_never_active() {
        let record = ActivationRecord {
            id: 1,
            code: "AAAA-BBBB-CCCC-DDDD".to_string(),
            app_id: "demo".to_string(),
            status: "garbage".to_string(),
            created_at: chrono::Utc::now().naive_utc(),
            expires_at: None,
            used_at: None,
            max_uses: 0,
            used_count: 0,
            device_limit: None,
            notes: String::new(),
            created_by: String::new(),
        };
        assert_eq!(record.status(), ActivationStatus::Revoked);
    }

    #[test]
    fn uses_exhausted_respects_unlimited() {
        let mut record = ActivationRecord {
            id: 1,
            code: String::new(),
            app_id: String::new(),
            status: "active".to_string(),
            created_at: chrono::Utc::now().naive_utc(),
            expires_at: None,
            used_at: None,
            max_uses: 0,
            used_count: 500,
            device_limit: None,
            notes: String::new(),
            created_by: String::new(),
        };
        assert!(!record.uses_exhausted());

        record.max_uses = 500;
        assert!(record.uses_exhausted());
    }
}
