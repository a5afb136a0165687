//! Error types for the crmsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them for the service facade. Every
//! error exposes a stable machine-readable kind via [`CoreError::kind`].

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type returned by [`crate::service::IntegrationService`].
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Crm(#[from] CrmApiError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    OAuth(#[from] OAuthError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl CoreError {
    /// Stable identifier for the error category, used by API layers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Crm(_) => "crm_api_error",
            Self::Token(e) => e.kind(),
            Self::OAuth(e) => e.kind(),
            Self::Sync(e) => e.kind(),
            Self::Validation(_) => "validation_error",
            Self::Config(_) => "config_error",
            Self::Database(DatabaseError::NotFound { .. }) => "not_found",
            Self::Database(_) => "database_error",
        }
    }
}

// ---------------------------------------------------------------------------
// CRM API errors
// ---------------------------------------------------------------------------

/// Errors from the external CRM REST API.
#[derive(Debug, Error)]
pub enum CrmApiError {
    /// The API returned a non-success status code.
    #[error("CRM API error (HTTP {status}): {message}")]
    Status { status: u16, message: String },

    /// Transport-level failure (connect, TLS, timeout).
    #[error("CRM HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The response body did not have the expected shape.
    #[error("CRM response parse error: {0}")]
    Parse(String),
}

impl CrmApiError {
    /// HTTP status of the failed call, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            Self::Parse(_) => None,
        }
    }

    /// True for responses meaning the grant itself is no longer valid.
    pub fn is_grant_rejected(&self) -> bool {
        matches!(self.status(), Some(400) | Some(401))
    }
}

// ---------------------------------------------------------------------------
// Token lifecycle errors
// ---------------------------------------------------------------------------

/// Errors from access-token validation and refresh.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The tenant has never completed the OAuth flow.
    #[error("tenant '{0}' has no authorized CRM connection")]
    NotConnected(String),

    /// Refresh failed irrecoverably; the connection is deactivated until the
    /// tenant re-authorizes.
    #[error("CRM authorization for tenant '{tenant_id}' was revoked: {detail}")]
    Revoked { tenant_id: String, detail: String },

    /// Refresh failed for a transient reason (network, 5xx).
    #[error("token refresh failed: {0}")]
    Refresh(#[from] CrmApiError),

    #[error("token store error: {0}")]
    Database(#[from] DatabaseError),
}

impl TokenError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConnected(_) => "not_connected",
            Self::Revoked { .. } => "token_revoked",
            Self::Refresh(_) => "crm_api_error",
            Self::Database(_) => "database_error",
        }
    }
}

// ---------------------------------------------------------------------------
// OAuth errors
// ---------------------------------------------------------------------------

/// Errors from building the authorization URL or completing the callback.
#[derive(Debug, Error)]
pub enum OAuthError {
    /// The tenant has no client id / secret, or the integration is disabled.
    #[error("CRM integration is not configured for tenant '{0}'")]
    NotConfigured(String),

    /// The callback carried no authorization code.
    #[error("OAuth callback is missing the authorization code")]
    MissingCode,

    /// The state parameter is missing, forged, malformed, or expired.
    #[error("invalid OAuth state: {0}")]
    InvalidState(String),

    /// The provider redirected back with an `error` parameter.
    #[error("OAuth provider returned an error: {0}")]
    Provider(String),

    /// The code-for-token exchange failed.
    #[error("OAuth token exchange failed: {0}")]
    Exchange(#[source] CrmApiError),

    #[error("OAuth store error: {0}")]
    Database(#[from] DatabaseError),
}

impl OAuthError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConfigured(_) => "not_configured",
            Self::MissingCode | Self::InvalidState(_) => "invalid_oauth_state",
            Self::Provider(_) | Self::Exchange(_) => "oauth_provider_error",
            Self::Database(_) => "database_error",
        }
    }
}

// ---------------------------------------------------------------------------
// Sync engine errors
// ---------------------------------------------------------------------------

/// Errors that abort a sync run as a whole.
///
/// Per-record failures never surface here; they are recorded in the run's
/// [`crate::models::SyncLog`] instead.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another run holds the lock for this connection.
    #[error("a sync is already running for connection {connection_id}")]
    AlreadyRunning { connection_id: i64 },

    /// Token validation failed before any record was fetched. The run's log
    /// has already been persisted with status `failed`.
    #[error("sync aborted (log {sync_log_id}): {source}")]
    Token {
        sync_log_id: i64,
        #[source]
        source: TokenError,
    },

    #[error("sync database error: {0}")]
    Database(#[from] DatabaseError),
}

impl SyncError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyRunning { .. } => "sync_already_running",
            Self::Token { source, .. } => source.kind(),
            Self::Database(_) => "database_error",
        }
    }
}

// ---------------------------------------------------------------------------
// Per-record mapping errors
// ---------------------------------------------------------------------------

/// Failures turning one CRM record into an application entity.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("record has no integer 'id'")]
    MissingId,

    #[error("record {0} has no name after mapping")]
    MissingName(i64),

    /// The person's owning organization has not been synced.
    #[error("organization {org_id} for person {person_id} is not synced; contact stored without customer link")]
    LinkResolution { person_id: i64, org_id: i64 },
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// Malformed configuration input from a caller.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid value for '{field}': {detail}")]
    InvalidField { field: String, detail: String },

    #[error("unsupported {what} schema version {found} (max {supported})")]
    UnsupportedVersion {
        what: String,
        found: u64,
        supported: u32,
    },

    #[error("malformed {what}: {detail}")]
    Malformed { what: String, detail: String },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing { var: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A JSON column could not be encoded or decoded.
    #[error("database JSON error in '{column}': {detail}")]
    Json { column: String, detail: String },

    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = CrmApiError::Status {
            status: 401,
            message: "unauthorized".into(),
        };
        assert_eq!(err.to_string(), "CRM API error (HTTP 401): unauthorized");

        let err = OAuthError::NotConfigured("acme".into());
        assert!(err.to_string().contains("acme"));

        let err = MappingError::LinkResolution {
            person_id: 7,
            org_id: 3,
        };
        assert!(err.to_string().contains("organization 3"));
    }

    #[test]
    fn test_kinds() {
        let err: CoreError = SyncError::AlreadyRunning { connection_id: 1 }.into();
        assert_eq!(err.kind(), "sync_already_running");

        let err: CoreError = TokenError::Revoked {
            tenant_id: "acme".into(),
            detail: "invalid_grant".into(),
        }
        .into();
        assert_eq!(err.kind(), "token_revoked");

        let err: CoreError = OAuthError::InvalidState("expired".into()).into();
        assert_eq!(err.kind(), "invalid_oauth_state");

        let err: CoreError = DatabaseError::NotFound {
            entity: "sync_log".into(),
            id: "9".into(),
        }
        .into();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_grant_rejection() {
        let revoked = CrmApiError::Status {
            status: 400,
            message: "invalid_grant".into(),
        };
        assert!(revoked.is_grant_rejected());

        let outage = CrmApiError::Status {
            status: 503,
            message: "unavailable".into(),
        };
        assert!(!outage.is_grant_rejected());
    }
}
