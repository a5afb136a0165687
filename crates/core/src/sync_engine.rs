//! CRM → application synchronization engine.
//!
//! The [`SyncEngine`] runs one sync per call and walks the run state machine
//! `running → success | partial | failed`:
//!
//! 1. Claim the connection's run flag (fail fast if another run holds it).
//! 2. Insert a running [`SyncLog`].
//! 3. Make sure the access token is valid.
//! 4. Page through organizations, upserting customers by `pipedrive_id`.
//! 5. Page through persons (if enabled), upserting contacts and linking them
//!    to the customers of their organizations.
//! 6. Finalize and persist the log.
//!
//! Failures of single records are recorded in the log and never abort the
//! run. A failing page fetch ends its phase only.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::crm::{CrmApi, Resource};
use crate::errors::{DatabaseError, MappingError, SyncError, TokenError};
use crate::locks::ConnectionLocks;
use crate::mapping::{self, CrmRecord};
use crate::models::{
    AdvancedMapping, ContactLink, CrmSession, IntegrationConnection, SyncAction, SyncLog,
    SyncStatus, SyncType, SyncedWrite,
};
use crate::store::Stores;
use crate::token::TokenLifecycleManager;

/// Why a single record could not be written.
#[derive(Debug, Error)]
enum RecordError {
    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("persistence failed: {0}")]
    Database(#[from] DatabaseError),
}

/// Result of writing one record. `warning` is recorded in the run's errors
/// even though the write itself succeeded.
struct RecordOutcome {
    action: SyncAction,
    warning: Option<MappingError>,
}

impl From<SyncAction> for RecordOutcome {
    fn from(action: SyncAction) -> Self {
        Self {
            action,
            warning: None,
        }
    }
}

pub struct SyncEngine {
    api: Arc<dyn CrmApi>,
    stores: Stores,
    tokens: Arc<TokenLifecycleManager>,
    locks: ConnectionLocks,
}

impl SyncEngine {
    pub fn new(
        api: Arc<dyn CrmApi>,
        stores: Stores,
        tokens: Arc<TokenLifecycleManager>,
        locks: ConnectionLocks,
    ) -> Self {
        info!("initializing sync engine");
        Self {
            api,
            stores,
            tokens,
            locks,
        }
    }

    /// True while a run holds the connection's run flag.
    pub fn is_running(&self, connection_id: i64) -> bool {
        self.locks.is_running(connection_id)
    }

    /// Run one sync for `connection` and return its finalized log.
    ///
    /// Returns [`SyncError::AlreadyRunning`] without side effects when
    /// another run holds the connection. When the token cannot be validated
    /// the run's log is persisted as `failed` before
    /// [`SyncError::Token`] is returned.
    #[instrument(skip(self, connection), fields(tenant_id = %connection.tenant_id, connection_id = connection.id))]
    pub async fn run_sync(
        &self,
        connection: &IntegrationConnection,
        sync_type: SyncType,
    ) -> Result<SyncLog, SyncError> {
        // Released when `_run` drops, including on panic.
        let _run = self
            .locks
            .try_begin_run(connection.id)
            .ok_or(SyncError::AlreadyRunning {
                connection_id: connection.id,
            })?;

        let mut log = SyncLog::start(connection.id, sync_type);
        log.id = self.stores.sync_logs.insert_sync_log(&log)?;
        info!(sync_log_id = log.id, %sync_type, "sync started");

        let connection = match self.tokens.ensure_valid(connection).await {
            Ok(conn) => conn,
            Err(e) => return Err(self.abort(log, e)),
        };
        let session = match connection.session() {
            Some(session) => session,
            None => {
                let e = TokenError::NotConnected(connection.tenant_id.clone());
                return Err(self.abort(log, e));
            }
        };

        let since = self.watermark(&connection, sync_type, &mut log);
        debug!(since = ?since, "resolved watermark");

        // Organizations first: person linkage depends on them.
        self.run_phase(Resource::Organizations, &connection, &session, since, &mut log)
            .await;
        if connection.sync_config.sync_persons {
            self.run_phase(Resource::Persons, &connection, &session, since, &mut log)
                .await;
        }

        log.finalize();
        if let Err(e) = self.stores.sync_logs.finalize_sync_log(&log) {
            return Err(self.mark_unfinalized(log, e));
        }
        info!(
            sync_log_id = log.id,
            status = %log.status,
            organizations_fetched = log.organizations_fetched,
            persons_fetched = log.persons_fetched,
            errors = log.errors.len(),
            duration_ms = log.duration_ms(),
            "sync finished"
        );
        Ok(log)
    }

    /// Persist `log` as failed because of a token problem.
    fn abort(&self, mut log: SyncLog, error: TokenError) -> SyncError {
        warn!(sync_log_id = log.id, error = %error, "sync aborted before fetching");
        log.record_error("token", error.to_string());
        log.finalize();
        if let Err(db) = self.stores.sync_logs.finalize_sync_log(&log) {
            return SyncError::Database(db);
        }
        SyncError::Token {
            sync_log_id: log.id,
            source: error,
        }
    }

    /// Best effort to leave a log that could not be finalized as failed
    /// rather than running. Returns the original error.
    fn mark_unfinalized(&self, mut log: SyncLog, error: DatabaseError) -> SyncError {
        error!(sync_log_id = log.id, error = %error, "could not finalize sync log");
        log.record_error("finalize", error.to_string());
        log.status = SyncStatus::Failed;
        if let Err(retry) = self.stores.sync_logs.finalize_sync_log(&log) {
            error!(sync_log_id = log.id, error = %retry, "sync log left running");
        }
        SyncError::Database(error)
    }

    /// `since` filter for the run: completion time of the last successful
    /// run for incremental syncs, nothing otherwise.
    fn watermark(
        &self,
        connection: &IntegrationConnection,
        sync_type: SyncType,
        log: &mut SyncLog,
    ) -> Option<DateTime<Utc>> {
        if sync_type != SyncType::Incremental || !connection.sync_config.incremental_sync {
            return None;
        }
        match self.stores.sync_logs.last_successful_sync(connection.id) {
            Ok(last) => last.and_then(|l| l.completed_at),
            Err(e) => {
                warn!(error = %e, "could not read watermark, running as full sync");
                log.record_error("watermark", e.to_string());
                None
            }
        }
    }

    async fn run_phase(
        &self,
        resource: Resource,
        connection: &IntegrationConnection,
        session: &CrmSession,
        since: Option<DateTime<Utc>>,
        log: &mut SyncLog,
    ) {
        let mapping = match resource {
            Resource::Organizations => connection.effective_organization_mapping(),
            Resource::Persons => connection.effective_person_mapping(),
        };
        let mut cursor: Option<String> = None;
        let mut pages = 0u32;

        loop {
            let page = match self
                .api
                .list(resource, session, since, cursor.as_deref())
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(resource = resource.as_str(), pages, error = %e, "page fetch failed, ending phase");
                    log.record_error(resource.as_str(), e.to_string());
                    break;
                }
            };
            pages += 1;

            for record in &page.records {
                self.sync_record(resource, connection, record, &mapping, log);
            }

            match page.next_cursor {
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    warn!(resource = resource.as_str(), cursor = %next, "CRM repeated a cursor, ending phase");
                    break;
                }
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        debug!(resource = resource.as_str(), pages, "phase complete");
    }

    fn sync_record(
        &self,
        resource: Resource,
        connection: &IntegrationConnection,
        record: &CrmRecord,
        mapping: &AdvancedMapping,
        log: &mut SyncLog,
    ) {
        let (label, result) = match resource {
            Resource::Organizations => {
                log.organizations_fetched += 1;
                ("organization", self.upsert_customer(connection, record, mapping, log.id))
            }
            Resource::Persons => {
                log.persons_fetched += 1;
                ("person", self.upsert_contact(connection, record, mapping, log.id))
            }
        };
        let context = match mapping::integer_field(record, "id") {
            Some(id) => format!("{label}:{id}"),
            None => label.to_string(),
        };

        match result {
            Ok(outcome) => {
                let counter = match (resource, outcome.action) {
                    (Resource::Organizations, SyncAction::Created) => &mut log.organizations_created,
                    (Resource::Organizations, SyncAction::Updated) => &mut log.organizations_updated,
                    (Resource::Persons, SyncAction::Created) => &mut log.persons_created,
                    (Resource::Persons, SyncAction::Updated) => &mut log.persons_updated,
                };
                *counter += 1;
                if let Some(warning) = outcome.warning {
                    log.record_error(context, warning.to_string());
                }
            }
            Err(e) => {
                debug!(context = %context, error = %e, "record failed");
                log.record_error(context, e.to_string());
            }
        }
    }

    fn upsert_customer(
        &self,
        connection: &IntegrationConnection,
        record: &CrmRecord,
        mapping: &AdvancedMapping,
        sync_log_id: i64,
    ) -> Result<RecordOutcome, RecordError> {
        let write = build_write(connection, record, mapping, sync_log_id)?;
        let customers = &self.stores.customers;
        let action = match customers.find_customer_by_pipedrive_id(&write.tenant_id, write.pipedrive_id)? {
            Some(existing) => {
                customers.update_customer(existing.id, &write)?;
                SyncAction::Updated
            }
            None => {
                customers.create_customer(&write)?;
                SyncAction::Created
            }
        };
        Ok(action.into())
    }

    fn upsert_contact(
        &self,
        connection: &IntegrationConnection,
        record: &CrmRecord,
        mapping: &AdvancedMapping,
        sync_log_id: i64,
    ) -> Result<RecordOutcome, RecordError> {
        let mut write = build_write(connection, record, mapping, sync_log_id)?;

        // No organization clears the link. An organization without a
        // customer keeps the stored link and is flagged.
        let mut warning = None;
        if let Some(org_id) = mapping::integer_field(record, "org_id") {
            match self
                .stores
                .customers
                .find_customer_by_pipedrive_id(&write.tenant_id, org_id)?
            {
                Some(customer) => write.link = ContactLink::Customer(customer.id),
                None => {
                    write.link = ContactLink::Unresolved;
                    warning = Some(MappingError::LinkResolution {
                        person_id: write.pipedrive_id,
                        org_id,
                    })
                }
            }
        }

        let contacts = &self.stores.contacts;
        let action = match contacts.find_contact_by_pipedrive_id(&write.tenant_id, write.pipedrive_id)? {
            Some(existing) => {
                contacts.update_contact(existing.id, &write)?;
                SyncAction::Updated
            }
            None => {
                contacts.create_contact(&write)?;
                SyncAction::Created
            }
        };
        Ok(RecordOutcome { action, warning })
    }
}

/// Map a CRM record into the write applied to a customer or contact.
fn build_write(
    connection: &IntegrationConnection,
    record: &CrmRecord,
    mapping: &AdvancedMapping,
    sync_log_id: i64,
) -> Result<SyncedWrite, MappingError> {
    let pipedrive_id = mapping::integer_field(record, "id").ok_or(MappingError::MissingId)?;
    let mut fields = mapping::resolve(record, mapping);
    let mut mapped_fields = mapping::target_fields(mapping);
    mapped_fields.remove("name");
    let non_blank = |s: &String| !s.trim().is_empty();
    let name = fields
        .remove("name")
        .filter(non_blank)
        .or_else(|| record.get("name").and_then(mapping::stringify).filter(non_blank))
        .ok_or(MappingError::MissingName(pipedrive_id))?;

    Ok(SyncedWrite {
        tenant_id: connection.tenant_id.clone(),
        pipedrive_id,
        name,
        fields,
        mapped_fields,
        link: ContactLink::None,
        synced_at: Utc::now(),
        sync_log_id,
    })
}
