//! Customer and contact rows written by the sync engine.
//!
//! Both tables are keyed for sync purposes by `(tenant_id, pipedrive_id)`.
//! Updates merge the mapped fields into the stored ones: mapped fields the
//! CRM no longer delivers are removed, fields outside the mapping survive.

use std::collections::{BTreeMap, BTreeSet};


use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::{fmt_ts, json_col, opt_ts_col, to_json, ts_col, Database};
use crate::errors::DatabaseError;
use crate::models::{Contact, ContactLink, Customer, SyncedWrite};
use crate::store::{ContactRepository, CustomerRepository};

const CUSTOMER_COLUMNS: &str = "id, tenant_id, name, fields, pipedrive_id, pipedrive_synced_at,
     created_sync_log_id, last_sync_log_id, created_at, updated_at";

const CONTACT_COLUMNS: &str = "id, tenant_id, customer_id, name, fields, pipedrive_id,
     pipedrive_synced_at, created_sync_log_id, last_sync_log_id, created_at, updated_at";

fn customer_from_row(row: &Row<'_>) -> rusqlite::Result<Customer> {
    Ok(Customer {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        fields: json_col(row, 3)?,
        pipedrive_id: row.get(4)?,
        pipedrive_synced_at: opt_ts_col(row, 5)?,
        created_sync_log_id: row.get(6)?,
        last_sync_log_id: row.get(7)?,
        created_at: ts_col(row, 8)?,
        updated_at: ts_col(row, 9)?,
    })
}

fn contact_from_row(row: &Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        customer_id: row.get(2)?,
        name: row.get(3)?,
        fields: json_col(row, 4)?,
        pipedrive_id: row.get(5)?,
        pipedrive_synced_at: opt_ts_col(row, 6)?,
        created_sync_log_id: row.get(7)?,
        last_sync_log_id: row.get(8)?,
        created_at: ts_col(row, 9)?,
        updated_at: ts_col(row, 10)?,
    })
}

fn not_found(entity: &str, id: i64) -> DatabaseError {
    DatabaseError::NotFound {
        entity: entity.into(),
        id: id.to_string(),
    }
}

/// Stored fields of row `id` in `table`, merged with `incoming`. Keys in
/// `mapped` that `incoming` lacks are dropped.
fn merged_fields(
    conn: &Connection,
    table: &str,
    id: i64,
    incoming: &BTreeMap<String, String>,
    mapped: &BTreeSet<String>,
) -> Result<String, DatabaseError> {
    let raw: Option<String> = conn
        .query_row(
            &format!("SELECT fields FROM {table} WHERE id = ?1"),
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    let raw = raw.ok_or_else(|| not_found(table, id))?;
    let mut fields: BTreeMap<String, String> =
        serde_json::from_str(&raw).map_err(|e| DatabaseError::Json {
            column: format!("{table}.fields"),
            detail: e.to_string(),
        })?;
    fields.retain(|key, _| !mapped.contains(key) || incoming.contains_key(key));
    fields.extend(incoming.iter().map(|(k, v)| (k.clone(), v.clone())));
    to_json("fields", &fields)
}

impl Database {
    fn customer_by_id(&self, conn: &Connection, id: i64) -> Result<Customer, DatabaseError> {
        conn.query_row(
            &format!("SELECT {CUSTOMER_COLUMNS} FROM customers WHERE id = ?1"),
            params![id],
            customer_from_row,
        )
        .optional()?
        .ok_or_else(|| not_found("customer", id))
    }

    fn contact_by_id(&self, conn: &Connection, id: i64) -> Result<Contact, DatabaseError> {
        conn.query_row(
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
            params![id],
            contact_from_row,
        )
        .optional()?
        .ok_or_else(|| not_found("contact", id))
    }
}

// ---------------------------------------------------------------------------
// customers
// ---------------------------------------------------------------------------

impl CustomerRepository for Database {
    fn find_customer_by_pipedrive_id(
        &self,
        tenant_id: &str,
        pipedrive_id: i64,
    ) -> Result<Option<Customer>, DatabaseError> {
        let conn = self.conn();
        let found = conn
            .query_row(
                &format!(
                    "SELECT {CUSTOMER_COLUMNS} FROM customers WHERE tenant_id = ?1 AND pipedrive_id = ?2"
                ),
                params![tenant_id, pipedrive_id],
                customer_from_row,
            )
            .optional()?;
        Ok(found)
    }

    fn create_customer(&self, write: &SyncedWrite) -> Result<Customer, DatabaseError> {
        let fields = to_json("fields", &write.fields)?;
        let now = fmt_ts(&write.synced_at);
        self.transaction(|conn| {
            conn.execute(
                "INSERT INTO customers (tenant_id, name, fields, pipedrive_id, pipedrive_synced_at,
                    created_sync_log_id, last_sync_log_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?5, ?5)",
                params![
                    write.tenant_id,
                    write.name,
                    fields,
                    write.pipedrive_id,
                    now,
                    write.sync_log_id
                ],
            )?;
            let id = conn.last_insert_rowid();
            debug!(id, pipedrive_id = write.pipedrive_id, "created customer");
            self.customer_by_id(conn, id)
        })
    }

    fn update_customer(&self, id: i64, write: &SyncedWrite) -> Result<Customer, DatabaseError> {
        let now = fmt_ts(&write.synced_at);
        self.transaction(|conn| {
            let fields = merged_fields(conn, "customers", id, &write.fields, &write.mapped_fields)?;
            conn.execute(
                "UPDATE customers SET name = ?1, fields = ?2, pipedrive_synced_at = ?3,
                    last_sync_log_id = ?4, updated_at = ?3
                 WHERE id = ?5 AND tenant_id = ?6",
                params![write.name, fields, now, write.sync_log_id, id, write.tenant_id],
            )?;
            debug!(id, pipedrive_id = write.pipedrive_id, "updated customer");
            self.customer_by_id(conn, id)
        })
    }

    fn customers_for_sync_log(
        &self,
        tenant_id: &str,
        sync_log_id: i64,
    ) -> Result<Vec<Customer>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers
             WHERE tenant_id = ?1 AND (created_sync_log_id = ?2 OR last_sync_log_id = ?2)
             ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![tenant_id, sync_log_id], customer_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// contacts
// ---------------------------------------------------------------------------

impl ContactRepository for Database {
    fn find_contact_by_pipedrive_id(
        &self,
        tenant_id: &str,
        pipedrive_id: i64,
    ) -> Result<Option<Contact>, DatabaseError> {
        let conn = self.conn();
        let found = conn
            .query_row(
                &format!(
                    "SELECT {CONTACT_COLUMNS} FROM contacts WHERE tenant_id = ?1 AND pipedrive_id = ?2"
                ),
                params![tenant_id, pipedrive_id],
                contact_from_row,
            )
            .optional()?;
        Ok(found)
    }

    fn create_contact(&self, write: &SyncedWrite) -> Result<Contact, DatabaseError> {
        let fields = to_json("fields", &write.fields)?;
        let now = fmt_ts(&write.synced_at);
        self.transaction(|conn| {
            conn.execute(
                "INSERT INTO contacts (tenant_id, customer_id, name, fields, pipedrive_id,
                    pipedrive_synced_at, created_sync_log_id, last_sync_log_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?6, ?6)",
                params![
                    write.tenant_id,
                    write.link.customer_id(),
                    write.name,
                    fields,
                    write.pipedrive_id,
                    now,
                    write.sync_log_id
                ],
            )?;
            let id = conn.last_insert_rowid();
            debug!(id, pipedrive_id = write.pipedrive_id, linked = write.link.customer_id().is_some(), "created contact");
            self.contact_by_id(conn, id)
        })
    }

    fn update_contact(&self, id: i64, write: &SyncedWrite) -> Result<Contact, DatabaseError> {
        let now = fmt_ts(&write.synced_at);
        self.transaction(|conn| {
            let fields = merged_fields(conn, "contacts", id, &write.fields, &write.mapped_fields)?;
            conn.execute(
                "UPDATE contacts SET name = ?1, fields = ?2, pipedrive_synced_at = ?3,
                    last_sync_log_id = ?4, updated_at = ?3,
                    customer_id = CASE WHEN ?8 THEN customer_id ELSE ?5 END
                 WHERE id = ?6 AND tenant_id = ?7",
                params![
                    write.name,
                    fields,
                    now,
                    write.sync_log_id,
                    write.link.customer_id(),
                    id,
                    write.tenant_id,
                    write.link == ContactLink::Unresolved
                ],
            )?;
            debug!(id, pipedrive_id = write.pipedrive_id, "updated contact");
            self.contact_by_id(conn, id)
        })
    }

    fn contacts_for_sync_log(
        &self,
        tenant_id: &str,
        sync_log_id: i64,
    ) -> Result<Vec<Contact>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts
             WHERE tenant_id = ?1 AND (created_sync_log_id = ?2 OR last_sync_log_id = ?2)
             ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![tenant_id, sync_log_id], contact_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn write(pipedrive_id: i64, name: &str, log: i64) -> SyncedWrite {
        SyncedWrite {
            tenant_id: "acme".into(),
            pipedrive_id,
            name: name.into(),
            fields: BTreeMap::from([("city".to_string(), "Vienna".to_string())]),
            mapped_fields: BTreeSet::from(["city".to_string()]),
            link: ContactLink::None,
            synced_at: Utc::now(),
            sync_log_id: log,
        }
    }

    #[test]
    fn test_customer_create_find_update() {
        let db = setup_db();
        assert!(db.find_customer_by_pipedrive_id("acme", 10).unwrap().is_none());

        let created = db.create_customer(&write(10, "Acme GmbH", 1)).unwrap();
        assert_eq!(created.pipedrive_id, Some(10));
        assert_eq!(created.created_sync_log_id, Some(1));

        let found = db.find_customer_by_pipedrive_id("acme", 10).unwrap().unwrap();
        assert_eq!(found.id, created.id);
        // Other tenants never see it.
        assert!(db.find_customer_by_pipedrive_id("globex", 10).unwrap().is_none());

        let mut update = write(10, "Acme AG", 2);
        update.fields = BTreeMap::from([("zip".to_string(), "1010".to_string())]);
        update.mapped_fields = BTreeSet::from(["zip".to_string()]);
        let updated = db.update_customer(created.id, &update).unwrap();
        assert_eq!(updated.name, "Acme AG");
        assert_eq!(updated.fields["city"], "Vienna");
        assert_eq!(updated.fields["zip"], "1010");
        assert_eq!(updated.created_sync_log_id, Some(1));
        assert_eq!(updated.last_sync_log_id, Some(2));

        assert_eq!(db.customers_for_sync_log("acme", 2).unwrap().len(), 1);
        // Still listed for the run that created it.
        assert_eq!(db.customers_for_sync_log("acme", 1).unwrap().len(), 1);
        assert!(db.customers_for_sync_log("acme", 3).unwrap().is_empty());
    }

    #[test]
    fn test_update_drops_mapped_field_cleared_in_crm() {
        let db = setup_db();
        let mut first = write(10, "Acme", 1);
        first.fields.insert("address".into(), "Main St 1".into());
        first.fields.insert("notes".into(), "kept by the app".into());
        first.mapped_fields.insert("address".into());
        let created = db.create_customer(&first).unwrap();

        // The CRM cleared the address; `notes` is not part of the mapping.
        let mut second = write(10, "Acme", 2);
        second.mapped_fields.insert("address".into());
        let updated = db.update_customer(created.id, &second).unwrap();
        assert!(!updated.fields.contains_key("address"));
        assert_eq!(updated.fields["city"], "Vienna");
        assert_eq!(updated.fields["notes"], "kept by the app");
    }

    #[test]
    fn test_duplicate_pipedrive_id_rejected() {
        let db = setup_db();
        db.create_customer(&write(10, "Acme", 1)).unwrap();
        assert!(db.create_customer(&write(10, "Acme again", 1)).is_err());
    }

    #[test]
    fn test_contact_link_kept_when_unresolved() {
        let db = setup_db();
        let customer = db.create_customer(&write(10, "Acme", 1)).unwrap();

        let mut linked = write(77, "Hans Mueller", 1);
        linked.link = ContactLink::Customer(customer.id);
        let contact = db.create_contact(&linked).unwrap();
        assert_eq!(contact.customer_id, Some(customer.id));

        let mut unresolved = write(77, "Hans Müller", 2);
        unresolved.link = ContactLink::Unresolved;
        let updated = db.update_contact(contact.id, &unresolved).unwrap();
        assert_eq!(updated.customer_id, Some(customer.id));
        assert_eq!(updated.name, "Hans Müller");
        assert_eq!(db.contacts_for_sync_log("acme", 2).unwrap().len(), 1);
    }

    #[test]
    fn test_contact_link_cleared_without_organization() {
        let db = setup_db();
        let customer = db.create_customer(&write(10, "Acme", 1)).unwrap();

        let mut linked = write(77, "Hans Mueller", 1);
        linked.link = ContactLink::Customer(customer.id);
        let contact = db.create_contact(&linked).unwrap();

        let detached = write(77, "Hans Mueller", 2);
        assert_eq!(detached.link, ContactLink::None);
        let updated = db.update_contact(contact.id, &detached).unwrap();
        assert_eq!(updated.customer_id, None);

        // Unresolved on insert means no link.
        let mut fresh = write(78, "Jane Roe", 2);
        fresh.link = ContactLink::Unresolved;
        assert_eq!(db.create_contact(&fresh).unwrap().customer_id, None);
    }

    #[test]
    fn test_update_missing_row() {
        let db = setup_db();
        let result = db.update_customer(999, &write(1, "x", 1));
        assert!(matches!(result, Err(DatabaseError::NotFound { .. })));
    }
}
