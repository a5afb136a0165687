//! In-memory [`CrmApi`] used by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{CrmApi, FieldDefinition, Page, Resource};
use crate::errors::CrmApiError;
use crate::mapping::CrmRecord;
use crate::models::{ClientCredentials, CrmSession, TokenGrant};

pub(crate) struct FakeCrm {
    organizations: Mutex<Vec<CrmRecord>>,
    persons: Mutex<Vec<CrmRecord>>,
    page_size: usize,
    /// Listing of this resource fails with this status.
    pub fail_listing: Mutex<Option<(Resource, u16)>>,
    /// Status answered by the token endpoint on refresh; 200 grants.
    pub refresh_status: Mutex<u16>,
    pub refreshes: AtomicUsize,
    pub exchanges: AtomicUsize,
    /// Every listing call as `(resource, since, cursor)`.
    pub list_calls: Mutex<Vec<(Resource, Option<DateTime<Utc>>, Option<String>)>>,
    /// Sleep before answering listing calls.
    pub list_delay: Mutex<Option<Duration>>,
}

impl FakeCrm {
    pub fn new() -> Self {
        Self {
            organizations: Mutex::new(Vec::new()),
            persons: Mutex::new(Vec::new()),
            page_size: 2,
            fail_listing: Mutex::new(None),
            refresh_status: Mutex::new(200),
            refreshes: AtomicUsize::new(0),
            exchanges: AtomicUsize::new(0),
            list_calls: Mutex::new(Vec::new()),
            list_delay: Mutex::new(None),
        }
    }

    pub fn with_organizations(self, records: Vec<Value>) -> Self {
        self.set_organizations(records);
        self
    }

    pub fn with_persons(self, records: Vec<Value>) -> Self {
        self.set_persons(records);
        self
    }

    /// Replace what the next organization listing returns.
    pub fn set_organizations(&self, records: Vec<Value>) {
        *self.organizations.lock().unwrap() = into_records(records);
    }

    pub fn set_persons(&self, records: Vec<Value>) {
        *self.persons.lock().unwrap() = into_records(records);
    }

    pub fn set_refresh_status(&self, status: u16) {
        *self.refresh_status.lock().unwrap() = status;
    }

    pub fn calls_for(&self, resource: Resource) -> Vec<(Option<DateTime<Utc>>, Option<String>)> {
        self.list_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _, _)| *r == resource)
            .map(|(_, since, cursor)| (*since, cursor.clone()))
            .collect()
    }

    async fn page(
        &self,
        resource: Resource,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<Page, CrmApiError> {
        self.list_calls
            .lock()
            .unwrap()
            .push((resource, since, cursor.map(str::to_string)));
        let delay = *self.list_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((failing, status)) = *self.fail_listing.lock().unwrap() {
            if failing == resource {
                return Err(CrmApiError::Status {
                    status,
                    message: "listing unavailable".into(),
                });
            }
        }

        let records = match resource {
            Resource::Organizations => self.organizations.lock().unwrap().clone(),
            Resource::Persons => self.persons.lock().unwrap().clone(),
        };
        let start: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
        let end = (start + self.page_size).min(records.len());
        Ok(Page {
            records: records[start..end].to_vec(),
            next_cursor: (end < records.len()).then(|| end.to_string()),
        })
    }
}

fn into_records(values: Vec<Value>) -> Vec<CrmRecord> {
    values
        .into_iter()
        .map(|v| match v {
            Value::Object(map) => map,
            other => panic!("fake record must be an object: {other}"),
        })
        .collect()
}

#[async_trait]
impl CrmApi for FakeCrm {
    async fn exchange_code(
        &self,
        _credentials: &ClientCredentials,
        code: &str,
        _redirect_uri: &str,
    ) -> Result<TokenGrant, CrmApiError> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        if code == "rejected" {
            return Err(CrmApiError::Status {
                status: 400,
                message: "{\"error\":\"invalid_grant\"}".into(),
            });
        }
        Ok(TokenGrant {
            access_token: format!("access-{code}"),
            refresh_token: Some(format!("refresh-{code}")),
            expires_in: 3600,
            api_domain: Some("https://acme.pipedrive.com".into()),
        })
    }

    async fn refresh_token(
        &self,
        _credentials: &ClientCredentials,
        refresh_token: &str,
    ) -> Result<TokenGrant, CrmApiError> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::task::yield_now().await;
        let status = *self.refresh_status.lock().unwrap();
        if status != 200 {
            return Err(CrmApiError::Status {
                status,
                message: "{\"error\":\"invalid_grant\"}".into(),
            });
        }
        Ok(TokenGrant {
            access_token: format!("access-{n}"),
            refresh_token: Some(format!("{refresh_token}-rotated")),
            expires_in: 3600,
            api_domain: None,
        })
    }

    async fn list_organizations(
        &self,
        _session: &CrmSession,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<Page, CrmApiError> {
        self.page(Resource::Organizations, since, cursor).await
    }

    async fn list_persons(
        &self,
        _session: &CrmSession,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<Page, CrmApiError> {
        self.page(Resource::Persons, since, cursor).await
    }

    async fn get_organization_fields(
        &self,
        _session: &CrmSession,
    ) -> Result<Vec<FieldDefinition>, CrmApiError> {
        Ok(vec![FieldDefinition {
            key: "name".into(),
            name: "Name".into(),
            field_type: Some("varchar".into()),
            options: None,
        }])
    }

    async fn get_person_fields(
        &self,
        _session: &CrmSession,
    ) -> Result<Vec<FieldDefinition>, CrmApiError> {
        Ok(vec![
            FieldDefinition {
                key: "first_name".into(),
                name: "First name".into(),
                field_type: Some("varchar".into()),
                options: None,
            },
            FieldDefinition {
                key: "last_name".into(),
                name: "Last name".into(),
                field_type: Some("varchar".into()),
                options: None,
            },
        ])
    }
}
