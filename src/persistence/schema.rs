//! `SQLite` schema bootstrap logic.
//!
//! Every statement is idempotent and runs on each startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS mutation_queue (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    id              TEXT NOT NULL UNIQUE,
    entity_type     TEXT NOT NULL,
    entity_kind     TEXT NOT NULL CHECK(entity_kind IN ('temporary','permanent')),
    entity_id       TEXT NOT NULL,
    kind            TEXT NOT NULL CHECK(kind IN ('create','update','delete')),
    payload         TEXT NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('pending','in_flight','synced','failed','conflict')),
    attempts        INTEGER NOT NULL DEFAULT 0,
    last_error      TEXT,
    next_retry_at   TEXT,
    resend          INTEGER NOT NULL DEFAULT 0,
    metadata        TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS identity_alias (
    entity_type     TEXT NOT NULL,
    temporary_id    TEXT NOT NULL,
    permanent_id    TEXT NOT NULL,
    resolved_at     TEXT NOT NULL,
    PRIMARY KEY (entity_type, temporary_id)
);

CREATE TABLE IF NOT EXISTS local_kv (
    store           TEXT NOT NULL,
    key             TEXT NOT NULL,
    value           TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (store, key)
);

CREATE INDEX IF NOT EXISTS idx_queue_entity ON mutation_queue(entity_type, entity_kind, entity_id);
CREATE INDEX IF NOT EXISTS idx_queue_status ON mutation_queue(status);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
