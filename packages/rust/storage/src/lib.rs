//! Turso Embedded / libSQL storage layer for the control plane.
//!
//! The [`Storage`] struct wraps a libSQL database holding the three
//! control-plane tables:
//! - `source_config`: the source registry (see [`sources`])
//! - `watermark`: per-source, per-column checkpoints (see [`watermarks`])
//! - `execution_log`: the append-only run history (see [`executions`])
//!
//! **Access rules:**
//! - Orchestrator and workers: read-write via [`Storage::open`]
//! - Reporting and inspection: read-only via [`Storage::open_readonly`]

mod executions;
mod migrations;
mod sources;
mod watermarks;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, Value, params};
use loadctl_shared::{LoadCtlError, Result};

/// Lock wait used by [`Storage::open`] when no timeout is configured.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT_MS).await
    }

    /// Open or create a database, waiting up to `busy_timeout_ms` on locks.
    ///
    /// The timeout is in place before migrations run, so many workers can
    /// open the same file at once.
    pub async fn open_with_busy_timeout(path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LoadCtlError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.set_busy_timeout(busy_timeout_ms).await?;
        storage.enable_foreign_keys().await?;
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(LoadCtlError::Storage(format!(
                "database {} does not exist",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Wait up to `millis` on a locked database instead of failing immediately.
    pub async fn set_busy_timeout(&self, millis: u64) -> Result<()> {
        self.conn
            .execute_batch(&format!("PRAGMA busy_timeout = {millis};"))
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn enable_foreign_keys(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await?;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                self.apply_migration(&migration).await?;
            }
        }
        Ok(())
    }

    /// Apply one migration under a write lock.
    ///
    /// The version is re-read inside the transaction; a concurrent opener that
    /// got there first turns this into a no-op.
    async fn apply_migration(&self, migration: &migrations::Migration) -> Result<()> {
        self.conn
            .execute_batch("BEGIN IMMEDIATE;")
            .await
            .map_err(|e| migration_err(migration, e))?;

        match self.apply_migration_locked(migration).await {
            Ok(()) => {
                self.conn
                    .execute_batch("COMMIT;")
                    .await
                    .map_err(|e| migration_err(migration, e))?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK;").await {
                    tracing::warn!(error = %rollback, "rollback after failed migration failed");
                }
                Err(e)
            }
        }
    }

    async fn apply_migration_locked(&self, migration: &migrations::Migration) -> Result<()> {
        if self.get_schema_version().await? >= migration.version {
            tracing::debug!(version = migration.version, "migration already applied");
            return Ok(());
        }

        tracing::info!(
            version = migration.version,
            description = migration.description,
            "applying migration"
        );
        self.conn
            .execute_batch(migration.sql)
            .await
            .map_err(|e| migration_err(migration, e))?;
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> Result<u32> {
        let mut rows = match self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await
        {
            Ok(rows) => rows,
            Err(e) if e.to_string().contains("no such table") => return Ok(0),
            Err(e) => return Err(db_err(e)),
        };

        match rows.next().await.map_err(db_err)? {
            Some(row) => match get_opt_i64(&row, 0)? {
                Some(v) => u32::try_from(v)
                    .map_err(|_| LoadCtlError::parse(format!("invalid schema version {v}"))),
                None => Ok(0),
            },
            None => Ok(0),
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(LoadCtlError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Classify a libSQL error into the control-plane taxonomy.
///
/// Constraint failures surface as [`LoadCtlError::ConstraintViolation`]; a
/// UNIQUE failure on `source_config.source_name` is reported by the registry
/// itself as a duplicate name.
pub(crate) fn db_err(e: libsql::Error) -> LoadCtlError {
    let message = e.to_string();
    if is_constraint_failure(&message) {
        LoadCtlError::ConstraintViolation(message)
    } else {
        LoadCtlError::Storage(message)
    }
}

fn migration_err(migration: &migrations::Migration, e: libsql::Error) -> LoadCtlError {
    LoadCtlError::Storage(format!("migration v{} failed: {e}", migration.version))
}

fn is_constraint_failure(message: &str) -> bool {
    message.contains("constraint failed")
        || message.contains("SQLITE_CONSTRAINT")
        || message.contains("already terminal")
        || message.contains("append-only")
        || message.contains("not deleted")
}

/// Current time in the fixed-width RFC 3339 form stored in every table.
///
/// Microsecond precision and a `Z` suffix keep text order equal to time order.
pub(crate) fn now_ts() -> String {
    to_ts(Utc::now())
}

pub(crate) fn to_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LoadCtlError::parse(format!("invalid timestamp '{s}': {e}")))
}

pub(crate) fn get_string(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(db_err)
}

/// Read a nullable text column. Only SQL NULL maps to `None`.
pub(crate) fn get_opt_string(row: &libsql::Row, idx: i32) -> Result<Option<String>> {
    match row.get_value(idx).map_err(db_err)? {
        Value::Null => Ok(None),
        Value::Text(s) => Ok(Some(s)),
        other => Err(LoadCtlError::parse(format!(
            "column {idx}: expected text or NULL, found {other:?}"
        ))),
    }
}

/// Read a nullable integer column. Only SQL NULL maps to `None`.
pub(crate) fn get_opt_i64(row: &libsql::Row, idx: i32) -> Result<Option<i64>> {
    match row.get_value(idx).map_err(db_err)? {
        Value::Null => Ok(None),
        Value::Integer(v) => Ok(Some(v)),
        other => Err(LoadCtlError::parse(format!(
            "column {idx}: expected integer or NULL, found {other:?}"
        ))),
    }
}

pub(crate) fn get_i64(row: &libsql::Row, idx: i32) -> Result<i64> {
    row.get::<i64>(idx).map_err(db_err)
}
