//! CRM API seam.
//!
//! [`CrmApi`] is what the token manager, OAuth controller and sync engine
//! talk to. [`PipedriveClient`] implements it over HTTP; tests substitute
//! in-memory fakes.

pub mod client;
#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::CrmApiError;
use crate::mapping::CrmRecord;
use crate::models::{ClientCredentials, CrmSession, TokenGrant};

pub use client::PipedriveClient;

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<CrmRecord>,
    /// `None` once the listing is exhausted.
    pub next_cursor: Option<String>,
}

/// Field metadata shown in the mapping UI.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FieldDefinition {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub field_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

/// Resource kinds that can be listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Organizations,
    Persons,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Organizations => "organizations",
            Self::Persons => "persons",
        }
    }
}

/// Authenticated calls against the CRM. Implementations never retry.
#[async_trait]
pub trait CrmApi: Send + Sync {
    /// Trade an authorization code for a token grant.
    async fn exchange_code(
        &self,
        credentials: &ClientCredentials,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, CrmApiError>;

    async fn refresh_token(
        &self,
        credentials: &ClientCredentials,
        refresh_token: &str,
    ) -> Result<TokenGrant, CrmApiError>;

    async fn list_organizations(
        &self,
        session: &CrmSession,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<Page, CrmApiError>;

    async fn list_persons(
        &self,
        session: &CrmSession,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<Page, CrmApiError>;

    async fn get_organization_fields(
        &self,
        session: &CrmSession,
    ) -> Result<Vec<FieldDefinition>, CrmApiError>;

    async fn get_person_fields(
        &self,
        session: &CrmSession,
    ) -> Result<Vec<FieldDefinition>, CrmApiError>;

    /// Dispatch to the listing call for `resource`.
    async fn list(
        &self,
        resource: Resource,
        session: &CrmSession,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<Page, CrmApiError> {
        match resource {
            Resource::Organizations => self.list_organizations(session, since, cursor).await,
            Resource::Persons => self.list_persons(session, since, cursor).await,
        }
    }
}
