//! Integration facade consumed by the HTTP handlers and the scheduler.
//!
//! Every operation is scoped to a tenant id resolved by the caller. Writes
//! to a stored connection are serialized through its connection lock.

use std::sync::Arc;

use chrono::{Duration, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::config::AppConfig;
use crate::crm::{CrmApi, FieldDefinition, PipedriveClient};
use crate::db::Database;
use crate::errors::{CoreError, DatabaseError, OAuthError, TokenError, ValidationError};
use crate::locks::ConnectionLocks;
use crate::models::{
    validate_simple, AdvancedMapping, ConnectionConfigView, ConnectionStatus, Contact, Customer,
    FieldMappings, IntegrationConnection, SimpleMapping, SyncAction, SyncLog, SyncSettings,
    SyncSettingsPatch, SyncSummary, SyncType, SyncedEntity,
};
use crate::oauth::{OAuthFlowController, OAuthSettings};
use crate::store::Stores;
use crate::sync_engine::SyncEngine;
use crate::token::TokenLifecycleManager;

/// Largest page `list_sync_history` returns.
pub const MAX_HISTORY_LIMIT: u32 = 100;

/// Input of `save_config`. An empty or missing secret keeps the stored one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveConfigRequest {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Field metadata for both resources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteFields {
    pub organization_fields: Vec<FieldDefinition>,
    pub person_fields: Vec<FieldDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncHistory {
    pub logs: Vec<SyncLog>,
    pub total: i64,
}

/// A run together with the entities it wrote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncDetail {
    pub log: SyncLog,
    pub customers: Vec<SyncedEntity<Customer>>,
    pub contacts: Vec<SyncedEntity<Contact>>,
}

pub struct IntegrationService {
    api: Arc<dyn CrmApi>,
    stores: Stores,
    locks: ConnectionLocks,
    tokens: Arc<TokenLifecycleManager>,
    oauth: OAuthFlowController,
    engine: Arc<SyncEngine>,
}

impl IntegrationService {
    /// Wire the token manager, OAuth controller and sync engine around one
    /// shared lock registry.
    pub fn new(
        api: Arc<dyn CrmApi>,
        stores: Stores,
        oauth_settings: OAuthSettings,
        safety_margin: Duration,
    ) -> Self {
        let locks = ConnectionLocks::new();
        let tokens = Arc::new(TokenLifecycleManager::new(
            api.clone(),
            stores.credentials.clone(),
            locks.clone(),
            safety_margin,
        ));
        let oauth = OAuthFlowController::new(
            api.clone(),
            stores.credentials.clone(),
            locks.clone(),
            oauth_settings,
        );
        let engine = Arc::new(SyncEngine::new(
            api.clone(),
            stores.clone(),
            tokens.clone(),
            locks.clone(),
        ));
        Self {
            api,
            stores,
            locks,
            tokens,
            oauth,
            engine,
        }
    }

    /// Production wiring: Pipedrive over HTTP, SQLite for every store.
    pub fn from_config(config: &AppConfig, db: Arc<Database>) -> Result<Self, CoreError> {
        let client = PipedriveClient::new(&config.crm)?;
        let settings = OAuthSettings::from_config(config)?;
        Ok(Self::new(
            Arc::new(client),
            Stores::from_database(db),
            settings,
            config.sync.safety_margin(),
        ))
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    fn connection(&self, tenant_id: &str) -> Result<Option<IntegrationConnection>, CoreError> {
        Ok(self.stores.credentials.get_connection(tenant_id)?)
    }

    /// Load, modify and save the tenant's connection under its lock,
    /// creating the row if needed.
    async fn mutate<F>(&self, tenant_id: &str, f: F) -> Result<IntegrationConnection, CoreError>
    where
        F: FnOnce(&mut IntegrationConnection) -> Result<(), CoreError> + Send,
    {
        let existing = self.connection(tenant_id)?;
        let (_guard, mut conn) = match existing {
            Some(found) => {
                let guard = self.locks.lock(found.id).await;
                let current = self
                    .stores
                    .credentials
                    .get_connection_by_id(found.id)?
                    .unwrap_or(found);
                (Some(guard), current)
            }
            None => (None, IntegrationConnection::new(tenant_id)),
        };
        f(&mut conn)?;
        conn.updated_at = Utc::now();
        Ok(self.stores.credentials.save_connection(&conn)?)
    }

    // -- OAuth ----------------------------------------------------------------

    pub fn get_authorization_url(&self, tenant_id: &str) -> Result<String, CoreError> {
        Ok(self.oauth.build_authorization_url(tenant_id)?)
    }

    /// Returns the tenant the callback was issued for.
    pub async fn complete_oauth_callback(
        &self,
        code: Option<&str>,
        state: Option<&str>,
        provider_error: Option<&str>,
    ) -> Result<String, CoreError> {
        let conn = self
            .oauth
            .complete_callback(code, state, provider_error)
            .await?;
        Ok(conn.tenant_id)
    }

    // -- connection config ----------------------------------------------------

    pub fn get_config(&self, tenant_id: &str) -> Result<ConnectionConfigView, CoreError> {
        Ok(match self.connection(tenant_id)? {
            Some(conn) => config_view(&conn),
            None => ConnectionConfigView {
                client_id: None,
                has_client_secret: false,
                redirect_uri: None,
                is_enabled: false,
            },
        })
    }

    #[instrument(skip(self, request), fields(client_id = %request.client_id))]
    pub async fn save_config(
        &self,
        tenant_id: &str,
        request: SaveConfigRequest,
    ) -> Result<ConnectionConfigView, CoreError> {
        let client_id = request.client_id.trim().to_string();
        if client_id.is_empty() {
            return Err(invalid("client_id", "must not be empty"));
        }
        match Url::parse(&request.redirect_uri) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            _ => return Err(invalid("redirect_uri", "must be an absolute http(s) URL")),
        }
        let secret = request.client_secret.filter(|s| !s.trim().is_empty());

        let saved = self
            .mutate(tenant_id, move |conn| {
                if conn.client_id.as_deref() != Some(client_id.as_str()) && conn.access_token.is_some() {
                    // Tokens belong to the previous OAuth app.
                    info!("client id changed, dropping stored tokens");
                    conn.access_token = None;
                    conn.refresh_token = None;
                    conn.token_expires_at = None;
                    conn.is_active = false;
                }
                conn.client_id = Some(client_id);
                if let Some(secret) = secret {
                    conn.client_secret = Some(secret);
                }
                conn.redirect_uri = Some(request.redirect_uri);
                conn.is_enabled = request.is_enabled;
                Ok(())
            })
            .await?;
        info!(tenant_id, is_enabled = saved.is_enabled, "integration config saved");
        Ok(config_view(&saved))
    }

    // -- field mapping --------------------------------------------------------

    pub fn get_field_mapping(&self, tenant_id: &str) -> Result<FieldMappings, CoreError> {
        Ok(self
            .connection(tenant_id)?
            .map(|conn| FieldMappings {
                organization: conn.organization_field_mapping,
                person: conn.person_field_mapping,
                advanced_organization: conn.advanced_organization_mapping,
                advanced_person: conn.advanced_person_mapping,
            })
            .unwrap_or_default())
    }

    /// Replace the organization mapping; `None` leaves it unchanged.
    pub async fn update_field_mapping(
        &self,
        tenant_id: &str,
        mapping: Option<SimpleMapping>,
    ) -> Result<FieldMappings, CoreError> {
        if let Some(mapping) = mapping {
            validate_simple(&mapping, "organization_field_mapping")?;
            self.mutate(tenant_id, move |conn| {
                conn.organization_field_mapping = mapping;
                Ok(())
            })
            .await?;
        }
        self.get_field_mapping(tenant_id)
    }

    /// Replace the person mapping; `None` leaves it unchanged.
    pub async fn update_person_field_mapping(
        &self,
        tenant_id: &str,
        mapping: Option<SimpleMapping>,
    ) -> Result<FieldMappings, CoreError> {
        if let Some(mapping) = mapping {
            validate_simple(&mapping, "person_field_mapping")?;
            self.mutate(tenant_id, move |conn| {
                conn.person_field_mapping = mapping;
                Ok(())
            })
            .await?;
        }
        self.get_field_mapping(tenant_id)
    }

    /// Replace either advanced mapping. Inputs may use the legacy
    /// unversioned shape; they are migrated before validation.
    pub async fn update_advanced_field_mapping(
        &self,
        tenant_id: &str,
        organization: Option<serde_json::Value>,
        person: Option<serde_json::Value>,
    ) -> Result<FieldMappings, CoreError> {
        let decode = |value: Option<serde_json::Value>,
                      field: &str|
         -> Result<Option<AdvancedMapping>, ValidationError> {
            value
                .map(|v| {
                    let mapping = AdvancedMapping::from_json(v)?;
                    mapping.validate(field)?;
                    Ok(mapping)
                })
                .transpose()
        };
        let organization = decode(organization, "advanced_organization_mapping")?;
        let person = decode(person, "advanced_person_mapping")?;

        if organization.is_some() || person.is_some() {
            self.mutate(tenant_id, move |conn| {
                if let Some(mapping) = organization {
                    conn.advanced_organization_mapping = mapping;
                }
                if let Some(mapping) = person {
                    conn.advanced_person_mapping = mapping;
                }
                Ok(())
            })
            .await?;
        }
        self.get_field_mapping(tenant_id)
    }

    /// CRM field metadata for the mapping UI.
    pub async fn get_remote_fields(&self, tenant_id: &str) -> Result<RemoteFields, CoreError> {
        let conn = self
            .connection(tenant_id)?
            .ok_or_else(|| TokenError::NotConnected(tenant_id.to_string()))?;
        let conn = self.tokens.ensure_valid(&conn).await?;
        let session = conn
            .session()
            .ok_or_else(|| TokenError::NotConnected(tenant_id.to_string()))?;

        let organization_fields = self.api.get_organization_fields(&session).await?;
        let person_fields = self.api.get_person_fields(&session).await?;
        Ok(RemoteFields {
            organization_fields,
            person_fields,
        })
    }

    // -- status and sync config -----------------------------------------------

    pub fn get_connection_status(&self, tenant_id: &str) -> Result<ConnectionStatus, CoreError> {
        let Some(conn) = self.connection(tenant_id)? else {
            return Ok(ConnectionStatus {
                configured: false,
                enabled: false,
                connected: false,
                is_active: false,
                api_domain: None,
                token_expires_at: None,
                sync_running: false,
                last_sync: None,
            });
        };
        let last_sync = self
            .stores
            .sync_logs
            .latest_sync_log(conn.id)?
            .map(|log| log.summary());
        Ok(ConnectionStatus {
            configured: conn.client_credentials().is_some(),
            enabled: conn.is_enabled,
            connected: conn.is_connected(),
            is_active: conn.is_active,
            api_domain: conn.api_domain.clone(),
            token_expires_at: conn.token_expires_at,
            sync_running: self.engine.is_running(conn.id),
            last_sync,
        })
    }

    pub fn get_sync_config(&self, tenant_id: &str) -> Result<SyncSettings, CoreError> {
        Ok(self
            .connection(tenant_id)?
            .map(|conn| conn.sync_config)
            .unwrap_or_default())
    }

    pub async fn update_sync_config(
        &self,
        tenant_id: &str,
        patch: SyncSettingsPatch,
    ) -> Result<SyncSettings, CoreError> {
        let saved = self
            .mutate(tenant_id, move |conn| {
                let mut settings = conn.sync_config.clone();
                settings.apply(patch);
                settings.validate()?;
                conn.sync_config = settings;
                Ok(())
            })
            .await?;
        info!(
            tenant_id,
            auto_sync_enabled = saved.sync_config.auto_sync_enabled,
            "sync config updated"
        );
        Ok(saved.sync_config)
    }

    // -- sync -----------------------------------------------------------------

    /// Run a sync now and return its summary. Fails with
    /// `sync_already_running` instead of waiting for an active run.
    pub async fn trigger_sync(
        &self,
        tenant_id: &str,
        sync_type: SyncType,
    ) -> Result<SyncSummary, CoreError> {
        let conn = self
            .connection(tenant_id)?
            .ok_or_else(|| TokenError::NotConnected(tenant_id.to_string()))?;
        if !conn.is_enabled {
            return Err(OAuthError::NotConfigured(tenant_id.to_string()).into());
        }
        let log = self.engine.run_sync(&conn, sync_type).await?;
        Ok(log.summary())
    }

    /// Runs newest first. `limit` is clamped to `1..=MAX_HISTORY_LIMIT`.
    pub fn list_sync_history(
        &self,
        tenant_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<SyncHistory, CoreError> {
        let Some(conn) = self.connection(tenant_id)? else {
            return Ok(SyncHistory {
                logs: Vec::new(),
                total: 0,
            });
        };
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);
        let (logs, total) = self.stores.sync_logs.list_sync_logs(conn.id, limit, offset)?;
        Ok(SyncHistory { logs, total })
    }

    /// A run and the customers and contacts it wrote, classified by the
    /// run id each write was tagged with.
    pub fn get_sync_detail(&self, tenant_id: &str, sync_log_id: i64) -> Result<SyncDetail, CoreError> {
        let not_found = || DatabaseError::NotFound {
            entity: "sync_log".into(),
            id: sync_log_id.to_string(),
        };
        let conn = self.connection(tenant_id)?.ok_or_else(not_found)?;
        let log = self
            .stores
            .sync_logs
            .get_sync_log(sync_log_id)?
            .filter(|log| log.connection_id == conn.id)
            .ok_or_else(not_found)?;

        let classify = |created_by: Option<i64>| {
            if created_by == Some(sync_log_id) {
                SyncAction::Created
            } else {
                SyncAction::Updated
            }
        };
        let customers = self
            .stores
            .customers
            .customers_for_sync_log(tenant_id, sync_log_id)?
            .into_iter()
            .map(|entity| SyncedEntity {
                action: classify(entity.created_sync_log_id),
                entity,
            })
            .collect();
        let contacts = self
            .stores
            .contacts
            .contacts_for_sync_log(tenant_id, sync_log_id)?
            .into_iter()
            .map(|entity| SyncedEntity {
                action: classify(entity.created_sync_log_id),
                entity,
            })
            .collect();

        Ok(SyncDetail {
            log,
            customers,
            contacts,
        })
    }
}

fn config_view(conn: &IntegrationConnection) -> ConnectionConfigView {
    ConnectionConfigView {
        client_id: conn.client_id.clone(),
        has_client_secret: conn.client_secret.as_deref().is_some_and(|s| !s.is_empty()),
        redirect_uri: conn.redirect_uri.clone(),
        is_enabled: conn.is_enabled,
    }
}

fn invalid(field: &str, detail: &str) -> CoreError {
    ValidationError::InvalidField {
        field: field.into(),
        detail: detail.into(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use serde_json::json;

    use crate::crm::fake::FakeCrm;
    use crate::oauth::StateSigner;

    fn service_with(api: FakeCrm) -> IntegrationService {
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let settings = OAuthSettings {
            authorize_url: "https://oauth.pipedrive.com/oauth/authorize".into(),
            scope: Some("base".into()),
            signer: StateSigner::new("secret", 600).unwrap(),
        };
        IntegrationService::new(
            Arc::new(api),
            Stores::from_database(db),
            settings,
            Duration::seconds(60),
        )
    }

    fn config_request() -> SaveConfigRequest {
        SaveConfigRequest {
            client_id: "abc".into(),
            client_secret: Some("s3cret".into()),
            redirect_uri: "https://app/x/callback".into(),
            is_enabled: true,
        }
    }

    async fn connected(service: &IntegrationService) {
        service.save_config("acme", config_request()).await.unwrap();
        let url = service.get_authorization_url("acme").unwrap();
        let params: HashMap<String, String> =
            Url::parse(&url).unwrap().query_pairs().into_owned().collect();
        assert_eq!(params["scope"], "base");
        let tenant = service
            .complete_oauth_callback(Some("code"), Some(&params["state"]), None)
            .await
            .unwrap();
        assert_eq!(tenant, "acme");
    }

    #[tokio::test]
    async fn test_config_never_exposes_secret() {
        let service = service_with(FakeCrm::new());
        let empty = service.get_config("acme").unwrap();
        assert!(!empty.has_client_secret);

        let view = service.save_config("acme", config_request()).await.unwrap();
        assert!(view.has_client_secret);
        assert_eq!(view.client_id.as_deref(), Some("abc"));

        // Empty secret keeps the stored one.
        let mut request = config_request();
        request.client_secret = Some(String::new());
        request.is_enabled = false;
        let view = service.save_config("acme", request).await.unwrap();
        assert!(view.has_client_secret);
        assert!(!view.is_enabled);

        let stored = service.stores().credentials.get_connection("acme").unwrap().unwrap();
        assert_eq!(stored.client_secret.as_deref(), Some("s3cret"));
    }

    #[tokio::test]
    async fn test_save_config_validation() {
        let service = service_with(FakeCrm::new());
        let mut request = config_request();
        request.redirect_uri = "not a url".into();
        let err = service.save_config("acme", request).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");

        let mut request = config_request();
        request.client_id = "  ".into();
        assert!(service.save_config("acme", request).await.is_err());
    }

    #[tokio::test]
    async fn test_mapping_updates() {
        let service = service_with(FakeCrm::new());
        let mapping = SimpleMapping::from([("name".to_string(), "name".to_string())]);
        let result = service
            .update_field_mapping("acme", Some(mapping.clone()))
            .await
            .unwrap();
        assert_eq!(result.organization, mapping);
        assert!(result.person.is_empty());

        // Absent input is a no-op.
        let result = service.update_person_field_mapping("acme", None).await.unwrap();
        assert!(result.person.is_empty());

        let legacy = json!({
            "simple": {"city": "address_locality"},
            "composite": [{"appField": "name", "sources": [
                {"pipedriveField": "first_name", "order": 0},
                {"pipedriveField": "last_name", "order": 1}
            ]}]
        });
        let result = service
            .update_advanced_field_mapping("acme", None, Some(legacy))
            .await
            .unwrap();
        assert_eq!(result.advanced_person.composite.len(), 1);
        assert_eq!(result.advanced_person.version, 1);

        let duplicate_orders = json!({"composite": [{"app_field": "name", "sources": [
            {"source_field_key": "a", "order": 0},
            {"source_field_key": "b", "order": 0}
        ]}]});
        let err = service
            .update_advanced_field_mapping("acme", Some(duplicate_orders), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn test_sync_config_patch() {
        let service = service_with(FakeCrm::new());
        assert!(service.get_sync_config("acme").unwrap().sync_persons);

        let patch: SyncSettingsPatch =
            serde_json::from_value(json!({"auto_sync_enabled": true, "auto_sync_time": "03:15"}))
                .unwrap();
        let settings = service.update_sync_config("acme", patch).await.unwrap();
        assert!(settings.auto_sync_enabled);
        assert!(settings.sync_persons);

        let clear: SyncSettingsPatch =
            serde_json::from_value(json!({"auto_sync_time": null})).unwrap();
        let err = service.update_sync_config("acme", clear).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");

        let bad: SyncSettingsPatch =
            serde_json::from_value(json!({"auto_sync_time": "25:99"})).unwrap();
        assert!(service.update_sync_config("acme", bad).await.is_err());
        assert_eq!(
            service.get_sync_config("acme").unwrap().auto_sync_time.as_deref(),
            Some("03:15")
        );
    }

    #[tokio::test]
    async fn test_trigger_sync_history_and_detail() {
        let api = FakeCrm::new().with_organizations(vec![
            json!({"id": 1, "name": "Acme"}),
            json!({"id": 2, "name": "Globex"}),
        ]);
        let service = service_with(api);
        connected(&service).await;

        let status = service.get_connection_status("acme").unwrap();
        assert!(status.connected);
        assert!(status.last_sync.is_none());

        let first = service.trigger_sync("acme", SyncType::Full).await.unwrap();
        assert_eq!(first.organizations_created, 2);
        assert_eq!(first.error_count, 0);
        let second = service.trigger_sync("acme", SyncType::Manual).await.unwrap();
        assert_eq!(second.organizations_updated, 2);

        let history = service.list_sync_history("acme", 500, 0).unwrap();
        assert_eq!(history.total, 2);
        assert_eq!(history.logs[0].id, second.sync_log_id);

        let detail = service.get_sync_detail("acme", first.sync_log_id).unwrap();
        assert_eq!(detail.customers.len(), 2);
        assert!(detail.customers.iter().all(|c| c.action == SyncAction::Created));
        let detail = service.get_sync_detail("acme", second.sync_log_id).unwrap();
        assert!(detail.customers.iter().all(|c| c.action == SyncAction::Updated));

        // Other tenants cannot read the run.
        let err = service.get_sync_detail("globex", first.sync_log_id).unwrap_err();
        assert_eq!(err.kind(), "not_found");

        let status = service.get_connection_status("acme").unwrap();
        assert_eq!(status.last_sync.unwrap().sync_log_id, second.sync_log_id);
    }

    #[tokio::test]
    async fn test_remote_fields_require_connection() {
        let service = service_with(FakeCrm::new());
        let err = service.get_remote_fields("acme").await.unwrap_err();
        assert_eq!(err.kind(), "not_connected");

        connected(&service).await;
        let fields = service.get_remote_fields("acme").await.unwrap();
        assert_eq!(fields.organization_fields[0].key, "name");
        assert_eq!(fields.person_fields.len(), 2);
    }

    #[tokio::test]
    async fn test_changing_client_id_drops_tokens() {
        let service = service_with(FakeCrm::new());
        connected(&service).await;

        let mut request = config_request();
        request.client_id = "other-app".into();
        service.save_config("acme", request).await.unwrap();
        let status = service.get_connection_status("acme").unwrap();
        assert!(status.configured);
        assert!(!status.connected);
    }
}
