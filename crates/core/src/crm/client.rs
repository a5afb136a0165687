//! Pipedrive REST client.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::{CrmApi, FieldDefinition, Page, Resource};
use crate::config::CrmConfig;
use crate::errors::CrmApiError;
use crate::mapping::CrmRecord;
use crate::models::{ClientCredentials, CrmSession, TokenGrant};

/// Page size for field metadata; Pipedrive's maximum.
const FIELDS_PAGE_LIMIT: &str = "500";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
    #[serde(default)]
    api_domain: Option<String>,
}

impl From<TokenResponse> for TokenGrant {
    fn from(resp: TokenResponse) -> Self {
        Self {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token.filter(|t| !t.is_empty()),
            expires_in: resp.expires_in,
            api_domain: resp.api_domain.filter(|d| !d.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    data: Option<Vec<T>>,
    additional_data: Option<AdditionalData>,
}

#[derive(Debug, Default, Deserialize)]
struct AdditionalData {
    #[serde(default)]
    next_cursor: Option<String>,
}

/// Asynchronous Pipedrive API client. Cheap to clone.
#[derive(Clone)]
pub struct PipedriveClient {
    http: reqwest::Client,
    token_url: String,
    page_size: u32,
}

impl PipedriveClient {
    pub fn new(config: &CrmConfig) -> Result<Self, CrmApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("crmsync/0.1"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .build()?;
        info!(token_url = %config.token_url, "created PipedriveClient");
        Ok(Self {
            http,
            token_url: config.token_url.clone(),
            page_size: config.page_size,
        })
    }

    async fn token_request(
        &self,
        credentials: &ClientCredentials,
        form: &[(&str, &str)],
    ) -> Result<TokenGrant, CrmApiError> {
        let resp = self
            .http
            .post(&self.token_url)
            .basic_auth(&credentials.client_id, Some(&credentials.client_secret))
            .form(form)
            .send()
            .await?;
        let token: TokenResponse = read_json(resp).await?;
        Ok(token.into())
    }

    #[instrument(skip(self, session))]
    async fn list_page(
        &self,
        resource: Resource,
        session: &CrmSession,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<Page, CrmApiError> {
        let url = format!("{}/api/v2/{}", base_url(session), resource.as_str());
        let mut req = self
            .http
            .get(&url)
            .bearer_auth(&session.access_token)
            .query(&[("limit", self.page_size.to_string())]);
        if let Some(cursor) = cursor {
            req = req.query(&[("cursor", cursor)]);
        }
        if let Some(since) = since {
            req = req.query(&[(
                "updated_since",
                since.to_rfc3339_opts(SecondsFormat::Secs, true),
            )]);
        }

        let resp = req.send().await?;
        let body: ListResponse<CrmRecord> = read_json(resp).await?;
        let records = body.data.unwrap_or_default();
        let next_cursor = body
            .additional_data
            .and_then(|a| a.next_cursor)
            .filter(|c| !c.is_empty());
        debug!(
            count = records.len(),
            has_more = next_cursor.is_some(),
            "fetched page"
        );
        Ok(Page {
            records,
            next_cursor,
        })
    }

    async fn fields(
        &self,
        session: &CrmSession,
        endpoint: &str,
    ) -> Result<Vec<FieldDefinition>, CrmApiError> {
        let url = format!("{}/api/v1/{}", base_url(session), endpoint);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&session.access_token)
            .query(&[("limit", FIELDS_PAGE_LIMIT)])
            .send()
            .await?;
        let body: ListResponse<FieldDefinition> = read_json(resp).await?;
        let fields = body.data.unwrap_or_default();
        debug!(endpoint, count = fields.len(), "fetched field metadata");
        Ok(fields)
    }
}

fn base_url(session: &CrmSession) -> &str {
    session.api_domain.trim_end_matches('/')
}

/// Turn a non-2xx response into [`CrmApiError::Status`] carrying the body,
/// otherwise decode the JSON payload.
async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, CrmApiError> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        warn!(status = status.as_u16(), "CRM request failed");
        return Err(CrmApiError::Status {
            status: status.as_u16(),
            message: body,
        });
    }
    serde_json::from_str(&body).map_err(|e| CrmApiError::Parse(e.to_string()))
}

#[async_trait]
impl CrmApi for PipedriveClient {
    #[instrument(skip_all)]
    async fn exchange_code(
        &self,
        credentials: &ClientCredentials,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, CrmApiError> {
        self.token_request(
            credentials,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ],
        )
        .await
    }

    #[instrument(skip_all)]
    async fn refresh_token(
        &self,
        credentials: &ClientCredentials,
        refresh_token: &str,
    ) -> Result<TokenGrant, CrmApiError> {
        self.token_request(
            credentials,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ],
        )
        .await
    }

    async fn list_organizations(
        &self,
        session: &CrmSession,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<Page, CrmApiError> {
        self.list_page(Resource::Organizations, session, since, cursor)
            .await
    }

    async fn list_persons(
        &self,
        session: &CrmSession,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<Page, CrmApiError> {
        self.list_page(Resource::Persons, session, since, cursor)
            .await
    }

    async fn get_organization_fields(
        &self,
        session: &CrmSession,
    ) -> Result<Vec<FieldDefinition>, CrmApiError> {
        self.fields(session, "organizationFields").await
    }

    async fn get_person_fields(
        &self,
        session: &CrmSession,
    ) -> Result<Vec<FieldDefinition>, CrmApiError> {
        self.fields(session, "personFields").await
    }
}
