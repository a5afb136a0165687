//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The SQLite
//! `user_version` pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS integration_connections (
            id                              INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id                       TEXT    NOT NULL,
            provider                        TEXT    NOT NULL,
            client_id                       TEXT,
            client_secret                   TEXT,
            redirect_uri                    TEXT,
            access_token                    TEXT,
            refresh_token                   TEXT,
            api_domain                      TEXT,
            token_expires_at                TEXT,
            is_enabled                      INTEGER NOT NULL DEFAULT 1,
            is_active                       INTEGER NOT NULL DEFAULT 0,
            organization_field_mapping      TEXT    NOT NULL DEFAULT '{}',
            person_field_mapping            TEXT    NOT NULL DEFAULT '{}',
            advanced_organization_mapping   TEXT    NOT NULL DEFAULT '{}',
            advanced_person_mapping         TEXT    NOT NULL DEFAULT '{}',
            sync_config                     TEXT    NOT NULL DEFAULT '{}',
            created_at                      TEXT    NOT NULL,
            updated_at                      TEXT    NOT NULL,
            UNIQUE (tenant_id, provider)
        );

        CREATE TABLE IF NOT EXISTS sync_logs (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            connection_id           INTEGER NOT NULL REFERENCES integration_connections (id),
            sync_type               TEXT    NOT NULL CHECK (sync_type IN ('full', 'incremental', 'manual')),
            started_at              TEXT    NOT NULL,
            completed_at            TEXT,
            status                  TEXT    NOT NULL CHECK (status IN ('running', 'success', 'partial', 'failed')),
            organizations_fetched   INTEGER NOT NULL DEFAULT 0,
            organizations_created   INTEGER NOT NULL DEFAULT 0,
            organizations_updated   INTEGER NOT NULL DEFAULT 0,
            persons_fetched         INTEGER NOT NULL DEFAULT 0,
            persons_created         INTEGER NOT NULL DEFAULT 0,
            persons_updated         INTEGER NOT NULL DEFAULT 0,
            errors                  TEXT    NOT NULL DEFAULT '[]'
        );

        CREATE INDEX IF NOT EXISTS idx_sync_logs_connection ON sync_logs (connection_id, started_at);
        CREATE INDEX IF NOT EXISTS idx_sync_logs_status ON sync_logs (status);

        CREATE TABLE IF NOT EXISTS customers (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id               TEXT    NOT NULL,
            name                    TEXT    NOT NULL,
            fields                  TEXT    NOT NULL DEFAULT '{}',
            pipedrive_id            INTEGER,
            pipedrive_synced_at     TEXT,
            created_sync_log_id     INTEGER,
            last_sync_log_id        INTEGER,
            created_at              TEXT    NOT NULL,
            updated_at              TEXT    NOT NULL,
            UNIQUE (tenant_id, pipedrive_id)
        );

        CREATE INDEX IF NOT EXISTS idx_customers_last_sync ON customers (tenant_id, last_sync_log_id);

        CREATE TABLE IF NOT EXISTS contacts (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id               TEXT    NOT NULL,
            customer_id             INTEGER REFERENCES customers (id),
            name                    TEXT    NOT NULL,
            fields                  TEXT    NOT NULL DEFAULT '{}',
            pipedrive_id            INTEGER,
            pipedrive_synced_at     TEXT,
            created_sync_log_id     INTEGER,
            last_sync_log_id        INTEGER,
            created_at              TEXT    NOT NULL,
            updated_at              TEXT    NOT NULL,
            UNIQUE (tenant_id, pipedrive_id)
        );

        CREATE INDEX IF NOT EXISTS idx_contacts_last_sync ON contacts (tenant_id, last_sync_log_id);
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
