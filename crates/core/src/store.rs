//! Storage seams used by the token manager, OAuth controller, and sync
//! engine. [`crate::db::Database`] implements all of them; tests may swap
//! in fakes.

use std::sync::Arc;

use crate::db::Database;
use crate::errors::DatabaseError;
use crate::models::{Contact, Customer, IntegrationConnection, SyncLog, SyncedWrite};

/// Persists per-tenant [`IntegrationConnection`] rows.
pub trait CredentialStore: Send + Sync {
    fn get_connection(&self, tenant_id: &str) -> Result<Option<IntegrationConnection>, DatabaseError>;

    fn get_connection_by_id(&self, id: i64) -> Result<Option<IntegrationConnection>, DatabaseError>;

    /// Insert or update by `(tenant_id, provider)`; returns the stored row.
    fn save_connection(
        &self,
        connection: &IntegrationConnection,
    ) -> Result<IntegrationConnection, DatabaseError>;

    /// Enabled and active connections, for the auto-sync scheduler.
    fn list_active_connections(&self) -> Result<Vec<IntegrationConnection>, DatabaseError>;
}

/// Persists [`SyncLog`] rows.
pub trait SyncLogStore: Send + Sync {
    /// Insert a running log and return its id.
    fn insert_sync_log(&self, log: &SyncLog) -> Result<i64, DatabaseError>;

    /// Write the final counters and status. Fails if the log is already
    /// completed; a completed log is immutable.
    fn finalize_sync_log(&self, log: &SyncLog) -> Result<(), DatabaseError>;

    fn get_sync_log(&self, id: i64) -> Result<Option<SyncLog>, DatabaseError>;

    /// Most recent log with status `success` for the connection.
    fn last_successful_sync(&self, connection_id: i64) -> Result<Option<SyncLog>, DatabaseError>;

    fn latest_sync_log(&self, connection_id: i64) -> Result<Option<SyncLog>, DatabaseError>;

    /// Page of logs, newest first, plus the total count.
    fn list_sync_logs(
        &self,
        connection_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<SyncLog>, i64), DatabaseError>;
}

/// Tenant-scoped customer repository keyed by the CRM organization id.
pub trait CustomerRepository: Send + Sync {
    fn find_customer_by_pipedrive_id(
        &self,
        tenant_id: &str,
        pipedrive_id: i64,
    ) -> Result<Option<Customer>, DatabaseError>;

    fn create_customer(&self, write: &SyncedWrite) -> Result<Customer, DatabaseError>;

    fn update_customer(&self, id: i64, write: &SyncedWrite) -> Result<Customer, DatabaseError>;

    /// Customers created or last written by the given run.
    fn customers_for_sync_log(
        &self,
        tenant_id: &str,
        sync_log_id: i64,
    ) -> Result<Vec<Customer>, DatabaseError>;
}

/// Tenant-scoped contact repository keyed by the CRM person id.
pub trait ContactRepository: Send + Sync {
    fn find_contact_by_pipedrive_id(
        &self,
        tenant_id: &str,
        pipedrive_id: i64,
    ) -> Result<Option<Contact>, DatabaseError>;

    fn create_contact(&self, write: &SyncedWrite) -> Result<Contact, DatabaseError>;

    /// Update a contact. A `None` customer link keeps the existing link.
    fn update_contact(&self, id: i64, write: &SyncedWrite) -> Result<Contact, DatabaseError>;

    /// Contacts created or last written by the given run.
    fn contacts_for_sync_log(
        &self,
        tenant_id: &str,
        sync_log_id: i64,
    ) -> Result<Vec<Contact>, DatabaseError>;
}

/// The full set of stores, shared between components.
#[derive(Clone)]
pub struct Stores {
    pub credentials: Arc<dyn CredentialStore>,
    pub sync_logs: Arc<dyn SyncLogStore>,
    pub customers: Arc<dyn CustomerRepository>,
    pub contacts: Arc<dyn ContactRepository>,
}

impl Stores {
    /// Back every store with the same SQLite database.
    pub fn from_database(db: Arc<Database>) -> Self {
        Self {
            credentials: db.clone(),
            sync_logs: db.clone(),
            customers: db.clone(),
            contacts: db,
        }
    }
}
