//! Connection and sync-log queries.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use super::{fmt_opt_ts, fmt_ts, json_col, opt_ts_col, to_json, ts_col, versioned_col, Database};
use crate::errors::DatabaseError;
use crate::models::{
    AdvancedMapping, IntegrationConnection, SyncLog, SyncSettings, SyncStatus, SyncType,
};
use crate::store::{CredentialStore, SyncLogStore};

const CONNECTION_COLUMNS: &str = "id, tenant_id, provider, client_id, client_secret, redirect_uri,
     access_token, refresh_token, api_domain, token_expires_at, is_enabled, is_active,
     organization_field_mapping, person_field_mapping, advanced_organization_mapping,
     advanced_person_mapping, sync_config, created_at, updated_at";

const SYNC_LOG_COLUMNS: &str = "id, connection_id, sync_type, started_at, completed_at, status,
     organizations_fetched, organizations_created, organizations_updated,
     persons_fetched, persons_created, persons_updated, errors";

fn connection_from_row(row: &Row<'_>) -> rusqlite::Result<IntegrationConnection> {
    Ok(IntegrationConnection {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        provider: row.get(2)?,
        client_id: row.get(3)?,
        client_secret: row.get(4)?,
        redirect_uri: row.get(5)?,
        access_token: row.get(6)?,
        refresh_token: row.get(7)?,
        api_domain: row.get(8)?,
        token_expires_at: opt_ts_col(row, 9)?,
        is_enabled: row.get(10)?,
        is_active: row.get(11)?,
        organization_field_mapping: json_col(row, 12)?,
        person_field_mapping: json_col(row, 13)?,
        advanced_organization_mapping: versioned_col(row, 14, AdvancedMapping::from_json)?,
        advanced_person_mapping: versioned_col(row, 15, AdvancedMapping::from_json)?,
        sync_config: versioned_col(row, 16, SyncSettings::from_json)?,
        created_at: ts_col(row, 17)?,
        updated_at: ts_col(row, 18)?,
    })
}

fn sync_log_from_row(row: &Row<'_>) -> rusqlite::Result<SyncLog> {
    let sync_type: String = row.get(2)?;
    let status: String = row.get(5)?;
    Ok(SyncLog {
        id: row.get(0)?,
        connection_id: row.get(1)?,
        // The CHECK constraint restricts the column to known values.
        sync_type: SyncType::from_str_val(&sync_type).unwrap_or(SyncType::Manual),
        started_at: ts_col(row, 3)?,
        completed_at: opt_ts_col(row, 4)?,
        status: SyncStatus::from_str_val(&status),
        organizations_fetched: row.get(6)?,
        organizations_created: row.get(7)?,
        organizations_updated: row.get(8)?,
        persons_fetched: row.get(9)?,
        persons_created: row.get(10)?,
        persons_updated: row.get(11)?,
        errors: json_col(row, 12)?,
    })
}

impl Database {
    fn query_connection(
        &self,
        clause: &str,
        param: &dyn rusqlite::ToSql,
    ) -> Result<Option<IntegrationConnection>, DatabaseError> {
        let conn = self.conn();
        let sql = format!("SELECT {CONNECTION_COLUMNS} FROM integration_connections WHERE {clause}");
        let found = conn
            .query_row(&sql, &[param], connection_from_row)
            .optional()?;
        Ok(found)
    }

    fn query_sync_log(
        &self,
        clause: &str,
        param: i64,
    ) -> Result<Option<SyncLog>, DatabaseError> {
        let conn = self.conn();
        let sql = format!("SELECT {SYNC_LOG_COLUMNS} FROM sync_logs WHERE {clause}");
        let found = conn.query_row(&sql, params![param], sync_log_from_row).optional()?;
        Ok(found)
    }
}

// ---------------------------------------------------------------------------
// integration_connections
// ---------------------------------------------------------------------------

impl CredentialStore for Database {
    fn get_connection(&self, tenant_id: &str) -> Result<Option<IntegrationConnection>, DatabaseError> {
        self.query_connection(
            "tenant_id = ?1 AND provider = 'pipedrive'",
            &tenant_id,
        )
    }

    fn get_connection_by_id(&self, id: i64) -> Result<Option<IntegrationConnection>, DatabaseError> {
        self.query_connection("id = ?1", &id)
    }

    fn save_connection(
        &self,
        c: &IntegrationConnection,
    ) -> Result<IntegrationConnection, DatabaseError> {
        let now = fmt_ts(&Utc::now());
        let org_mapping = to_json("organization_field_mapping", &c.organization_field_mapping)?;
        let person_mapping = to_json("person_field_mapping", &c.person_field_mapping)?;
        let adv_org = to_json("advanced_organization_mapping", &c.advanced_organization_mapping)?;
        let adv_person = to_json("advanced_person_mapping", &c.advanced_person_mapping)?;
        let sync_config = to_json("sync_config", &c.sync_config)?;

        let id: i64 = {
            let conn = self.conn();
            conn.query_row(
                "INSERT INTO integration_connections (tenant_id, provider, client_id, client_secret,
                    redirect_uri, access_token, refresh_token, api_domain, token_expires_at,
                    is_enabled, is_active, organization_field_mapping, person_field_mapping,
                    advanced_organization_mapping, advanced_person_mapping, sync_config,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)
                 ON CONFLICT (tenant_id, provider) DO UPDATE SET
                    client_id = excluded.client_id,
                    client_secret = excluded.client_secret,
                    redirect_uri = excluded.redirect_uri,
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    api_domain = excluded.api_domain,
                    token_expires_at = excluded.token_expires_at,
                    is_enabled = excluded.is_enabled,
                    is_active = excluded.is_active,
                    organization_field_mapping = excluded.organization_field_mapping,
                    person_field_mapping = excluded.person_field_mapping,
                    advanced_organization_mapping = excluded.advanced_organization_mapping,
                    advanced_person_mapping = excluded.advanced_person_mapping,
                    sync_config = excluded.sync_config,
                    updated_at = excluded.updated_at
                 RETURNING id",
                params![
                    c.tenant_id,
                    c.provider,
                    c.client_id,
                    c.client_secret,
                    c.redirect_uri,
                    c.access_token,
                    c.refresh_token,
                    c.api_domain,
                    fmt_opt_ts(&c.token_expires_at),
                    c.is_enabled,
                    c.is_active,
                    org_mapping,
                    person_mapping,
                    adv_org,
                    adv_person,
                    sync_config,
                    now,
                ],
                |row| row.get(0),
            )?
        };
        debug!(id, tenant_id = %c.tenant_id, active = c.is_active, "saved integration connection");

        self.get_connection_by_id(id)?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "integration_connection".into(),
                id: id.to_string(),
            })
    }

    fn list_active_connections(&self) -> Result<Vec<IntegrationConnection>, DatabaseError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {CONNECTION_COLUMNS} FROM integration_connections
             WHERE is_enabled = 1 AND is_active = 1 ORDER BY id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], connection_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// sync_logs
// ---------------------------------------------------------------------------

impl SyncLogStore for Database {
    fn insert_sync_log(&self, log: &SyncLog) -> Result<i64, DatabaseError> {
        let errors = to_json("errors", &log.errors)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sync_logs (connection_id, sync_type, started_at, status, errors)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                log.connection_id,
                log.sync_type.as_str(),
                fmt_ts(&log.started_at),
                log.status.as_str(),
                errors
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, connection_id = log.connection_id, sync_type = %log.sync_type, "inserted sync_log");
        Ok(id)
    }

    fn finalize_sync_log(&self, log: &SyncLog) -> Result<(), DatabaseError> {
        let errors = to_json("errors", &log.errors)?;
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE sync_logs SET completed_at = ?1, status = ?2,
                organizations_fetched = ?3, organizations_created = ?4, organizations_updated = ?5,
                persons_fetched = ?6, persons_created = ?7, persons_updated = ?8, errors = ?9
             WHERE id = ?10 AND completed_at IS NULL",
            params![
                fmt_opt_ts(&log.completed_at),
                log.status.as_str(),
                log.organizations_fetched,
                log.organizations_created,
                log.organizations_updated,
                log.persons_fetched,
                log.persons_created,
                log.persons_updated,
                errors,
                log.id
            ],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "running sync_log".into(),
                id: log.id.to_string(),
            });
        }
        debug!(id = log.id, status = %log.status, "finalized sync_log");
        Ok(())
    }

    fn get_sync_log(&self, id: i64) -> Result<Option<SyncLog>, DatabaseError> {
        self.query_sync_log("id = ?1", id)
    }

    fn last_successful_sync(&self, connection_id: i64) -> Result<Option<SyncLog>, DatabaseError> {
        self.query_sync_log(
            "connection_id = ?1 AND status = 'success' AND completed_at IS NOT NULL
             ORDER BY completed_at DESC LIMIT 1",
            connection_id,
        )
    }

    fn latest_sync_log(&self, connection_id: i64) -> Result<Option<SyncLog>, DatabaseError> {
        self.query_sync_log(
            "connection_id = ?1 ORDER BY started_at DESC, id DESC LIMIT 1",
            connection_id,
        )
    }

    fn list_sync_logs(
        &self,
        connection_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<SyncLog>, i64), DatabaseError> {
        let conn = self.conn();
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_logs WHERE connection_id = ?1",
            params![connection_id],
            |row| row.get(0),
        )?;
        let sql = format!(
            "SELECT {SYNC_LOG_COLUMNS} FROM sync_logs WHERE connection_id = ?1
             ORDER BY started_at DESC, id DESC LIMIT ?2 OFFSET ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let logs = stmt
            .query_map(params![connection_id, limit, offset], sync_log_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok((logs, total))
    }
}
