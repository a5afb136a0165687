//! Domain model types used throughout crmsync.
//!
//! These types bridge the sync engine, the database layer, and the service
//! facade consumed by the web API. Per-tenant JSON settings (mappings and
//! sync options) carry a `version` field; see [`decode_versioned`] for the
//! migration path.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;

/// Provider identifier stored on every connection row.
pub const PROVIDER_PIPEDRIVE: &str = "pipedrive";

/// Schema version written for mapping and sync-setting JSON blobs.
pub const CURRENT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Versioned JSON settings
// ---------------------------------------------------------------------------

/// Decode a stored settings blob, migrating older layouts.
///
/// - version 0 (no `version` key): the legacy camelCase layout. Field
///   aliases on the target type accept it directly.
/// - version 1: the current snake_case layout.
///
/// Newer versions are rejected rather than silently misread. When a v2 is
/// introduced, add a step here that rewrites v1 values before decoding.
pub fn decode_versioned<T: DeserializeOwned>(
    what: &str,
    value: serde_json::Value,
) -> Result<T, ValidationError> {
    if !value.is_object() {
        return Err(ValidationError::Malformed {
            what: what.to_string(),
            detail: "expected a JSON object".into(),
        });
    }
    let found = match value.get("version") {
        None | Some(serde_json::Value::Null) => 0,
        Some(v) => v.as_u64().ok_or_else(|| ValidationError::Malformed {
            what: what.to_string(),
            detail: format!("version must be a non-negative integer, got {v}"),
        })?,
    };
    if found > u64::from(CURRENT_VERSION) {
        return Err(ValidationError::UnsupportedVersion {
            what: what.to_string(),
            found,
            supported: CURRENT_VERSION,
        });
    }
    serde_json::from_value(value).map_err(|e| ValidationError::Malformed {
        what: what.to_string(),
        detail: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Field mappings
// ---------------------------------------------------------------------------

/// Simple mapping: application field -> CRM field key.
pub type SimpleMapping = BTreeMap<String, String>;

/// One source of a composite field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompositeSource {
    #[serde(alias = "sourceFieldKey", alias = "pipedriveField")]
    pub source_field_key: String,
    pub order: u32,
}

/// An application field built by joining several CRM fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompositeFieldEntry {
    #[serde(alias = "appField")]
    pub app_field: String,
    #[serde(alias = "sourceFields")]
    pub sources: Vec<CompositeSource>,
    #[serde(default)]
    pub separator: Option<String>,
}

impl CompositeFieldEntry {
    pub const DEFAULT_SEPARATOR: &'static str = " ";

    pub fn new(app_field: &str, sources: &[(&str, u32)], separator: Option<&str>) -> Self {
        Self {
            app_field: app_field.to_string(),
            sources: sources
                .iter()
                .map(|(key, order)| CompositeSource {
                    source_field_key: key.to_string(),
                    order: *order,
                })
                .collect(),
            separator: separator.map(str::to_string),
        }
    }

    pub fn separator(&self) -> &str {
        self.separator.as_deref().unwrap_or(Self::DEFAULT_SEPARATOR)
    }

    fn validate(&self, field: &str) -> Result<(), ValidationError> {
        if self.app_field.trim().is_empty() {
            return Err(ValidationError::InvalidField {
                field: field.to_string(),
                detail: "composite entry has an empty app field".into(),
            });
        }
        if self.sources.is_empty() {
            return Err(ValidationError::InvalidField {
                field: field.to_string(),
                detail: format!("composite entry '{}' has no sources", self.app_field),
            });
        }
        let mut seen = BTreeSet::new();
        for source in &self.sources {
            if source.source_field_key.trim().is_empty() {
                return Err(ValidationError::InvalidField {
                    field: field.to_string(),
                    detail: format!("composite entry '{}' has an empty source key", self.app_field),
                });
            }
            if !seen.insert(source.order) {
                return Err(ValidationError::InvalidField {
                    field: field.to_string(),
                    detail: format!(
                        "composite entry '{}' repeats order {}",
                        self.app_field, source.order
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Simple plus composite mapping for one CRM entity type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AdvancedMapping {
    #[serde(default)]
    pub version: u32,
    #[serde(default, alias = "simpleMapping")]
    pub simple: SimpleMapping,
    #[serde(default, alias = "compositeFields")]
    pub composite: Vec<CompositeFieldEntry>,
}

impl AdvancedMapping {
    pub fn from_json(value: serde_json::Value) -> Result<Self, ValidationError> {
        let mut mapping: Self = decode_versioned("advanced mapping", value)?;
        mapping.version = CURRENT_VERSION;
        Ok(mapping)
    }

    pub fn validate(&self, field: &str) -> Result<(), ValidationError> {
        validate_simple(&self.simple, field)?;
        for entry in &self.composite {
            entry.validate(field)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.simple.is_empty() && self.composite.is_empty()
    }
}

/// Reject empty keys or values in a simple mapping.
pub fn validate_simple(mapping: &SimpleMapping, field: &str) -> Result<(), ValidationError> {
    for (app_field, crm_key) in mapping {
        if app_field.trim().is_empty() || crm_key.trim().is_empty() {
            return Err(ValidationError::InvalidField {
                field: field.to_string(),
                detail: format!("empty key in mapping entry '{app_field}' -> '{crm_key}'"),
            });
        }
    }
    Ok(())
}

/// Organization mapping used when a tenant has configured none.
pub fn default_organization_mapping() -> SimpleMapping {
    [("name", "name"), ("address", "address")]
        .into_iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect()
}

/// Person mapping used when a tenant has configured none.
pub fn default_person_mapping() -> SimpleMapping {
    [("name", "name"), ("email", "emails"), ("phone", "phones")]
        .into_iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect()
}

// ---------------------------------------------------------------------------
// Sync settings
// ---------------------------------------------------------------------------

/// Per-connection sync options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSettings {
    #[serde(default)]
    pub version: u32,
    #[serde(default, alias = "syncCustomFields")]
    pub sync_custom_fields: bool,
    /// App field -> CRM custom field key, applied to organizations.
    #[serde(default, alias = "customFieldMapping")]
    pub custom_field_mapping: SimpleMapping,
    #[serde(default = "default_true", alias = "syncPersons")]
    pub sync_persons: bool,
    #[serde(default = "default_true", alias = "incrementalSync")]
    pub incremental_sync: bool,
    #[serde(default, alias = "autoSyncEnabled")]
    pub auto_sync_enabled: bool,
    /// Daily auto-sync slot, `HH:MM` in UTC.
    #[serde(default, alias = "autoSyncTime")]
    pub auto_sync_time: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            sync_custom_fields: false,
            custom_field_mapping: SimpleMapping::new(),
            sync_persons: true,
            incremental_sync: true,
            auto_sync_enabled: false,
            auto_sync_time: None,
        }
    }
}

impl SyncSettings {
    pub fn from_json(value: serde_json::Value) -> Result<Self, ValidationError> {
        let mut settings: Self = decode_versioned("sync config", value)?;
        settings.version = CURRENT_VERSION;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_simple(&self.custom_field_mapping, "custom_field_mapping")?;
        if let Some(time) = &self.auto_sync_time {
            parse_auto_sync_time(time)?;
        }
        if self.auto_sync_enabled && self.auto_sync_time.is_none() {
            return Err(ValidationError::InvalidField {
                field: "auto_sync_time".into(),
                detail: "required when auto sync is enabled".into(),
            });
        }
        Ok(())
    }

    /// Parsed auto-sync slot, if one is configured and well-formed.
    pub fn auto_sync_slot(&self) -> Option<NaiveTime> {
        self.auto_sync_time
            .as_deref()
            .and_then(|t| parse_auto_sync_time(t).ok())
    }

    /// Apply a partial update, leaving unspecified fields untouched.
    pub fn apply(&mut self, patch: SyncSettingsPatch) {
        if let Some(v) = patch.sync_custom_fields {
            self.sync_custom_fields = v;
        }
        if let Some(v) = patch.custom_field_mapping {
            self.custom_field_mapping = v;
        }
        if let Some(v) = patch.sync_persons {
            self.sync_persons = v;
        }
        if let Some(v) = patch.incremental_sync {
            self.incremental_sync = v;
        }
        if let Some(v) = patch.auto_sync_enabled {
            self.auto_sync_enabled = v;
        }
        if let Some(v) = patch.auto_sync_time {
            self.auto_sync_time = v;
        }
    }
}

/// Parse an `HH:MM` auto-sync slot.
pub fn parse_auto_sync_time(value: &str) -> Result<NaiveTime, ValidationError> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| ValidationError::InvalidField {
        field: "auto_sync_time".into(),
        detail: format!("'{value}' is not in HH:MM format"),
    })
}

/// Partial update for [`SyncSettings`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncSettingsPatch {
    #[serde(default)]
    pub sync_custom_fields: Option<bool>,
    #[serde(default)]
    pub custom_field_mapping: Option<SimpleMapping>,
    #[serde(default)]
    pub sync_persons: Option<bool>,
    #[serde(default)]
    pub incremental_sync: Option<bool>,
    #[serde(default)]
    pub auto_sync_enabled: Option<bool>,
    /// `Some(None)` clears the slot.
    #[serde(default, with = "double_option")]
    pub auto_sync_time: Option<Option<String>>,
}

mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Option<String>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(inner) => inner.serialize(s),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Option<String>>, D::Error> {
        Option::<String>::deserialize(d).map(Some)
    }
}

// ---------------------------------------------------------------------------
// Integration connection
// ---------------------------------------------------------------------------

/// Per-tenant OAuth2 credential and configuration record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntegrationConnection {
    pub id: i64,
    pub tenant_id: String,
    pub provider: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub api_domain: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Configuration toggle set through `SaveConfig`.
    pub is_enabled: bool,
    /// Authorization health; cleared when a refresh is rejected.
    pub is_active: bool,
    pub organization_field_mapping: SimpleMapping,
    pub person_field_mapping: SimpleMapping,
    pub advanced_organization_mapping: AdvancedMapping,
    pub advanced_person_mapping: AdvancedMapping,
    pub sync_config: SyncSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IntegrationConnection {
    /// A fresh, unauthorized connection for `tenant_id`.
    pub fn new(tenant_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            tenant_id: tenant_id.to_string(),
            provider: PROVIDER_PIPEDRIVE.to_string(),
            client_id: None,
            client_secret: None,
            redirect_uri: None,
            access_token: None,
            refresh_token: None,
            api_domain: None,
            token_expires_at: None,
            is_enabled: true,
            is_active: false,
            organization_field_mapping: SimpleMapping::new(),
            person_field_mapping: SimpleMapping::new(),
            advanced_organization_mapping: AdvancedMapping::default(),
            advanced_person_mapping: AdvancedMapping::default(),
            sync_config: SyncSettings::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Client id and secret, if both are present and non-empty.
    pub fn client_credentials(&self) -> Option<ClientCredentials> {
        match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => {
                Some(ClientCredentials {
                    client_id: id.clone(),
                    client_secret: secret.clone(),
                })
            }
            _ => None,
        }
    }

    /// Bearer session for listing calls, if the connection holds a token.
    pub fn session(&self) -> Option<CrmSession> {
        match (&self.access_token, &self.api_domain) {
            (Some(token), Some(domain)) => Some(CrmSession {
                access_token: token.clone(),
                api_domain: domain.clone(),
            }),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.is_active && self.access_token.is_some()
    }

    /// Store a fresh token grant and mark the connection active. The
    /// refresh token and API domain are kept when the grant omits them.
    pub fn apply_grant(&mut self, grant: TokenGrant, now: DateTime<Utc>) {
        self.access_token = Some(grant.access_token);
        if let Some(refresh) = grant.refresh_token {
            self.refresh_token = Some(refresh);
        }
        if let Some(domain) = grant.api_domain {
            self.api_domain = Some(domain);
        }
        self.token_expires_at = Some(now + chrono::Duration::seconds(grant.expires_in));
        self.is_active = true;
        self.updated_at = now;
    }

    /// The mapping applied to organizations: simple entries from the
    /// advanced mapping override the legacy simple mapping; falls back to
    /// the defaults when nothing is configured.
    pub fn effective_organization_mapping(&self) -> AdvancedMapping {
        let extra = if self.sync_config.sync_custom_fields {
            Some(&self.sync_config.custom_field_mapping)
        } else {
            None
        };
        effective_mapping(
            &self.organization_field_mapping,
            &self.advanced_organization_mapping,
            default_organization_mapping,
            extra,
        )
    }

    pub fn effective_person_mapping(&self) -> AdvancedMapping {
        effective_mapping(
            &self.person_field_mapping,
            &self.advanced_person_mapping,
            default_person_mapping,
            None,
        )
    }
}

fn effective_mapping(
    simple: &SimpleMapping,
    advanced: &AdvancedMapping,
    default: fn() -> SimpleMapping,
    custom: Option<&SimpleMapping>,
) -> AdvancedMapping {
    let mut merged = if simple.is_empty() && advanced.is_empty() {
        default()
    } else {
        simple.clone()
    };
    merged.extend(advanced.simple.iter().map(|(k, v)| (k.clone(), v.clone())));
    if let Some(custom) = custom {
        merged.extend(custom.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    AdvancedMapping {
        version: CURRENT_VERSION,
        simple: merged,
        composite: advanced.composite.clone(),
    }
}

/// OAuth client credentials registered with the CRM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Access token plus the tenant-specific API base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrmSession {
    pub access_token: String,
    pub api_domain: String,
}

/// Tokens returned by the code exchange or a refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Absent when the provider did not rotate the refresh token.
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    pub api_domain: Option<String>,
}

// ---------------------------------------------------------------------------
// Sync log
// ---------------------------------------------------------------------------

/// How a run selects records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Full,
    Incremental,
    Manual,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::Manual => "manual",
        }
    }

    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "full" => Some(Self::Full),
            "incremental" => Some(Self::Incremental),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn from_str_val(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "success" => Self::Success,
            "partial" => Self::Partial,
            _ => Self::Failed,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded failure inside a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncErrorEntry {
    /// What failed, e.g. `organization:42` or `persons`.
    pub context: String,
    pub message: String,
}

/// The record of one sync run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncLog {
    pub id: i64,
    pub connection_id: i64,
    pub sync_type: SyncType,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub organizations_fetched: u32,
    pub organizations_created: u32,
    pub organizations_updated: u32,
    pub persons_fetched: u32,
    pub persons_created: u32,
    pub persons_updated: u32,
    pub errors: Vec<SyncErrorEntry>,
}

impl SyncLog {
    pub fn start(connection_id: i64, sync_type: SyncType) -> Self {
        Self {
            id: 0,
            connection_id,
            sync_type,
            started_at: Utc::now(),
            completed_at: None,
            status: SyncStatus::Running,
            organizations_fetched: 0,
            organizations_created: 0,
            organizations_updated: 0,
            persons_fetched: 0,
            persons_created: 0,
            persons_updated: 0,
            errors: Vec::new(),
        }
    }

    pub fn record_error(&mut self, context: impl Into<String>, message: impl Into<String>) {
        self.errors.push(SyncErrorEntry {
            context: context.into(),
            message: message.into(),
        });
    }

    /// Successful creates plus updates across both phases.
    pub fn successful_writes(&self) -> u32 {
        self.organizations_created
            + self.organizations_updated
            + self.persons_created
            + self.persons_updated
    }

    /// Set `completed_at` and derive the terminal status.
    pub fn finalize(&mut self) {
        self.completed_at = Some(Utc::now());
        self.status = if self.errors.is_empty() {
            SyncStatus::Success
        } else if self.successful_writes() > 0 {
            SyncStatus::Partial
        } else {
            SyncStatus::Failed
        };
    }

    pub fn duration_ms(&self) -> i64 {
        self.completed_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0))
            .unwrap_or(0)
    }

    pub fn summary(&self) -> SyncSummary {
        SyncSummary {
            sync_log_id: self.id,
            sync_type: self.sync_type,
            status: self.status,
            organizations_fetched: self.organizations_fetched,
            organizations_created: self.organizations_created,
            organizations_updated: self.organizations_updated,
            persons_fetched: self.persons_fetched,
            persons_created: self.persons_created,
            persons_updated: self.persons_updated,
            error_count: self.errors.len(),
            duration_ms: self.duration_ms(),
        }
    }
}

/// Compact result returned by `TriggerSync`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSummary {
    pub sync_log_id: i64,
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub organizations_fetched: u32,
    pub organizations_created: u32,
    pub organizations_updated: u32,
    pub persons_fetched: u32,
    pub persons_created: u32,
    pub persons_updated: u32,
    pub error_count: usize,
    pub duration_ms: i64,
}

// ---------------------------------------------------------------------------
// Synced entities
// ---------------------------------------------------------------------------

/// Application customer, the counterpart of a CRM organization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Customer {
    pub id: i64,
    pub tenant_id: String,
    pub name: String,
    /// Mapped application fields other than `name`.
    pub fields: BTreeMap<String, String>,
    pub pipedrive_id: Option<i64>,
    pub pipedrive_synced_at: Option<DateTime<Utc>>,
    pub created_sync_log_id: Option<i64>,
    pub last_sync_log_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Application contact, the counterpart of a CRM person.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    pub id: i64,
    pub tenant_id: String,
    pub customer_id: Option<i64>,
    pub name: String,
    pub fields: BTreeMap<String, String>,
    pub pipedrive_id: Option<i64>,
    pub pipedrive_synced_at: Option<DateTime<Utc>>,
    pub created_sync_log_id: Option<i64>,
    pub last_sync_log_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values written by the sync engine on create or update.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedWrite {
    pub tenant_id: String,
    pub pipedrive_id: i64,
    pub name: String,
    pub fields: BTreeMap<String, String>,
    /// Application fields the mapping targets. On update, stored values of
    /// these fields that are absent from `fields` are removed.
    pub mapped_fields: BTreeSet<String>,
    /// Owning customer; only meaningful for contacts.
    pub link: ContactLink,
    pub synced_at: DateTime<Utc>,
    pub sync_log_id: i64,
}

/// How a contact write treats its customer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContactLink {
    /// The person belongs to no organization; any stored link is cleared.
    #[default]
    None,
    /// Link to this customer id.
    Customer(i64),
    /// The organization is not synced yet; a stored link is kept.
    Unresolved,
}

impl ContactLink {
    /// Customer id to store on insert.
    pub fn customer_id(&self) -> Option<i64> {
        match self {
            Self::Customer(id) => Some(*id),
            Self::None | Self::Unresolved => None,
        }
    }
}

/// Whether a run created or updated an entity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Created,
    Updated,
}

/// An entity touched by a run, as shown in the sync detail view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncedEntity<T> {
    pub action: SyncAction,
    pub entity: T,
}

// ---------------------------------------------------------------------------
// Views for the service facade
// ---------------------------------------------------------------------------

/// Connection configuration as returned to callers; never exposes the secret.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfigView {
    pub client_id: Option<String>,
    pub has_client_secret: bool,
    pub redirect_uri: Option<String>,
    pub is_enabled: bool,
}

/// All four mapping tables of a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FieldMappings {
    pub organization: SimpleMapping,
    pub person: SimpleMapping,
    pub advanced_organization: AdvancedMapping,
    pub advanced_person: AdvancedMapping,
}

/// Connection health summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionStatus {
    pub configured: bool,
    pub enabled: bool,
    pub connected: bool,
    pub is_active: bool,
    pub api_domain: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub sync_running: bool,
    pub last_sync: Option<SyncSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_legacy_sync_config_migrates() {
        let legacy = json!({
            "syncCustomFields": true,
            "customFieldMapping": {"industry": "abc123"},
            "syncPersons": false,
            "incrementalSync": true,
            "autoSyncEnabled": true,
            "autoSyncTime": "02:30"
        });
        let settings = SyncSettings::from_json(legacy).unwrap();
        assert_eq!(settings.version, CURRENT_VERSION);
        assert!(settings.sync_custom_fields);
        assert!(!settings.sync_persons);
        assert_eq!(settings.custom_field_mapping["industry"], "abc123");
        assert_eq!(
            settings.auto_sync_slot(),
            NaiveTime::from_hms_opt(2, 30, 0)
        );
    }

    #[test]
    fn test_future_version_rejected() {
        let result = SyncSettings::from_json(json!({"version": 7}));
        assert!(matches!(
            result,
            Err(ValidationError::UnsupportedVersion { found: 7, .. })
        ));
    }

    #[test]
    fn test_oversized_version_not_read_as_legacy() {
        let result = AdvancedMapping::from_json(json!({"version": 4_294_967_296u64}));
        assert!(matches!(
            result,
            Err(ValidationError::UnsupportedVersion {
                found: 4_294_967_296,
                ..
            })
        ));
        assert!(matches!(
            SyncSettings::from_json(json!({"version": "1"})),
            Err(ValidationError::Malformed { .. })
        ));
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(matches!(
            AdvancedMapping::from_json(json!([1, 2])),
            Err(ValidationError::Malformed { .. })
        ));
    }

    #[test]
    fn test_legacy_advanced_mapping_migrates() {
        let legacy = json!({
            "simple": {"name": "name"},
            "composite": [{
                "appField": "contact_name",
                "sources": [
                    {"pipedriveField": "last_name", "order": 1},
                    {"pipedriveField": "first_name", "order": 0}
                ]
            }]
        });
        let mapping = AdvancedMapping::from_json(legacy).unwrap();
        assert_eq!(mapping.composite[0].app_field, "contact_name");
        assert_eq!(mapping.composite[0].separator(), " ");
        assert!(mapping.validate("advanced").is_ok());
    }

    #[test]
    fn test_duplicate_composite_order_rejected() {
        let mapping = AdvancedMapping {
            version: CURRENT_VERSION,
            simple: SimpleMapping::new(),
            composite: vec![CompositeFieldEntry::new(
                "full",
                &[("a", 0), ("b", 0)],
                None,
            )],
        };
        assert!(mapping.validate("advanced").is_err());
    }

    #[test]
    fn test_auto_sync_requires_time() {
        let settings = SyncSettings {
            auto_sync_enabled: true,
            ..SyncSettings::default()
        };
        assert!(settings.validate().is_err());

        let settings = SyncSettings {
            auto_sync_enabled: true,
            auto_sync_time: Some("25:00".into()),
            ..SyncSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_patch_clears_time() {
        let mut settings = SyncSettings {
            auto_sync_time: Some("03:00".into()),
            ..SyncSettings::default()
        };
        let patch: SyncSettingsPatch =
            serde_json::from_value(json!({"auto_sync_time": null, "sync_persons": false}))
                .unwrap();
        settings.apply(patch);
        assert_eq!(settings.auto_sync_time, None);
        assert!(!settings.sync_persons);

        let untouched: SyncSettingsPatch = serde_json::from_value(json!({})).unwrap();
        assert!(untouched.auto_sync_time.is_none());
    }

    #[test]
    fn test_finalize_status() {
        let mut log = SyncLog::start(1, SyncType::Full);
        log.finalize();
        assert_eq!(log.status, SyncStatus::Success);

        let mut log = SyncLog::start(1, SyncType::Full);
        log.organizations_created = 4;
        log.record_error("organization:3", "boom");
        log.finalize();
        assert_eq!(log.status, SyncStatus::Partial);

        let mut log = SyncLog::start(1, SyncType::Full);
        log.record_error("organizations", "HTTP 500");
        log.finalize();
        assert_eq!(log.status, SyncStatus::Failed);
        assert!(log.completed_at.is_some());
    }

    #[test]
    fn test_effective_mapping_defaults_and_precedence() {
        let mut conn = IntegrationConnection::new("acme");
        let mapping = conn.effective_organization_mapping();
        assert_eq!(mapping.simple, default_organization_mapping());

        conn.organization_field_mapping
            .insert("name".into(), "legal_name".into());
        conn.advanced_organization_mapping
            .simple
            .insert("name".into(), "display_name".into());
        let mapping = conn.effective_organization_mapping();
        assert_eq!(mapping.simple["name"], "display_name");
        assert!(!mapping.simple.contains_key("address"));
    }

    #[test]
    fn test_custom_fields_only_when_enabled() {
        let mut conn = IntegrationConnection::new("acme");
        conn.sync_config
            .custom_field_mapping
            .insert("industry".into(), "9f3a".into());
        assert!(!conn
            .effective_organization_mapping()
            .simple
            .contains_key("industry"));

        conn.sync_config.sync_custom_fields = true;
        assert_eq!(
            conn.effective_organization_mapping().simple["industry"],
            "9f3a"
        );
    }
}
