//! SQL migration definitions for the control database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: source_config, watermark, execution_log",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Source registry
CREATE TABLE IF NOT EXISTS source_config (
    source_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    source_name   TEXT NOT NULL UNIQUE,
    source_type   TEXT NOT NULL CHECK (source_type IN ('FILE', 'API', 'DATABASE')),
    location      TEXT NOT NULL,
    target_table  TEXT NOT NULL,
    load_strategy TEXT NOT NULL CHECK (load_strategy IN ('FULL', 'INCREMENTAL')),
    merge_key     TEXT,
    is_active     INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    CHECK (load_strategy = 'FULL' OR (merge_key IS NOT NULL AND merge_key <> ''))
);

-- Watermark checkpoints, one row per (source, column)
CREATE TABLE IF NOT EXISTS watermark (
    watermark_id  INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id     INTEGER NOT NULL REFERENCES source_config(source_id),
    column_name   TEXT NOT NULL,
    last_value    TEXT,
    current_value TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    UNIQUE(source_id, column_name)
);

-- Execution audit log
CREATE TABLE IF NOT EXISTS execution_log (
    execution_id   TEXT PRIMARY KEY,
    source_id      INTEGER REFERENCES source_config(source_id),
    run_id         TEXT,
    pipeline_name  TEXT NOT NULL,
    activity_name  TEXT NOT NULL,
    status         TEXT NOT NULL
                   CHECK (status IN ('STARTED', 'SUCCESS', 'FAILED', 'QUARANTINED')),
    started_at     TEXT NOT NULL,
    completed_at   TEXT,
    rows_processed INTEGER NOT NULL DEFAULT 0 CHECK (rows_processed >= 0),
    rows_failed    INTEGER NOT NULL DEFAULT 0 CHECK (rows_failed >= 0),
    error_message  TEXT,
    CHECK ((status = 'STARTED') = (completed_at IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_execution_log_source ON execution_log(source_id);
CREATE INDEX IF NOT EXISTS idx_execution_log_pipeline ON execution_log(pipeline_name);
CREATE INDEX IF NOT EXISTS idx_execution_log_status ON execution_log(status, started_at);

-- Sources are soft-deleted, the execution log is append-only
CREATE TRIGGER IF NOT EXISTS source_config_no_delete BEFORE DELETE ON source_config BEGIN
    SELECT RAISE(ABORT, 'sources are deactivated, not deleted');
END;

CREATE TRIGGER IF NOT EXISTS execution_log_no_delete BEFORE DELETE ON execution_log BEGIN
    SELECT RAISE(ABORT, 'execution log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS execution_log_terminal_final BEFORE UPDATE ON execution_log
WHEN old.status <> 'STARTED' BEGIN
    SELECT RAISE(ABORT, 'execution record is already terminal');
END;

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
    ]
}
