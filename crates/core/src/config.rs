//! TOML-based configuration for the crmsync daemon.
//!
//! Sensitive values (the OAuth state-signing secret) are stored as `_env`
//! fields that reference environment variable names. The actual secrets are
//! resolved at runtime via [`AppConfig::resolve_env_vars`].
//!
//! Per-tenant settings (client credentials, mappings, sync options) are not
//! part of this file; they live in the database, see [`crate::models`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Daemon / scheduler settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// CRM provider endpoints and HTTP behaviour.
    #[serde(default)]
    pub crm: CrmConfig,

    /// OAuth state signing.
    #[serde(default)]
    pub oauth: OAuthConfig,

    /// Sync engine settings.
    #[serde(default)]
    pub sync: SyncEngineConfig,

    /// Web API settings.
    #[serde(default)]
    pub web: WebConfig,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for persistent data (the SQLite database).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Seconds between auto-sync schedule checks (default 60).
    #[serde(default = "default_scheduler_tick")]
    pub scheduler_tick_secs: u64,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/crmsync")
}
fn default_scheduler_tick() -> u64 {
    60
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            scheduler_tick_secs: default_scheduler_tick(),
        }
    }
}

// ---------------------------------------------------------------------------
// CRM provider
// ---------------------------------------------------------------------------

/// CRM (Pipedrive) OAuth endpoints and request settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmConfig {
    /// Provider authorize endpoint users are redirected to.
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,

    /// Provider token endpoint for code exchange and refresh.
    #[serde(default = "default_token_url")]
    pub token_url: String,

    /// Optional OAuth scope. Pipedrive derives scopes from the app
    /// registration, so this is usually left empty.
    #[serde(default)]
    pub scope: Option<String>,

    /// Per-request timeout in seconds (default 30).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Records requested per listing page (default 100, max 500).
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_authorize_url() -> String {
    "https://oauth.pipedrive.com/oauth/authorize".into()
}
fn default_token_url() -> String {
    "https://oauth.pipedrive.com/oauth/token".into()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_page_size() -> u32 {
    100
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            authorize_url: default_authorize_url(),
            token_url: default_token_url(),
            scope: None,
            request_timeout_secs: default_request_timeout(),
            page_size: default_page_size(),
        }
    }
}

impl CrmConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// OAuth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Environment variable holding the HMAC key used to sign `state`.
    #[serde(default = "default_state_secret_env")]
    pub state_secret_env: String,

    /// Seconds an issued `state` stays valid (default 600).
    #[serde(default = "default_state_ttl")]
    pub state_ttl_secs: u64,

    /// Resolved signing secret (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub state_secret: Option<String>,
}

fn default_state_secret_env() -> String {
    "CRMSYNC_STATE_SECRET".into()
}
fn default_state_ttl() -> u64 {
    600
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            state_secret_env: default_state_secret_env(),
            state_ttl_secs: default_state_ttl(),
            state_secret: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Sync engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEngineConfig {
    /// Refresh the access token when it expires within this many seconds.
    #[serde(default = "default_safety_margin")]
    pub token_safety_margin_secs: u64,
}

fn default_safety_margin() -> u64 {
    60
}

/// Largest accepted token safety margin (one day).
pub const MAX_SAFETY_MARGIN_SECS: u64 = 86_400;

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            token_safety_margin_secs: default_safety_margin(),
        }
    }
}

impl SyncEngineConfig {
    /// The margin as a duration, capped at [`MAX_SAFETY_MARGIN_SECS`].
    pub fn safety_margin(&self) -> chrono::Duration {
        let secs = self.token_safety_margin_secs.min(MAX_SAFETY_MARGIN_SECS);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// Web
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Listen address (default `127.0.0.1:3000`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:3000".into()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all `*_env` fields from environment variables.
    ///
    /// The state secret is mandatory: without it callbacks could not be
    /// verified, so a missing variable is an error rather than a warning.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        self.oauth.state_secret =
            resolve_optional_env(&self.oauth.state_secret_env, "oauth.state_secret_env");
        if self.oauth.state_secret.is_none() {
            return Err(ConfigError::EnvVarMissing {
                var: self.oauth.state_secret_env.clone(),
                field: "oauth.state_secret_env".into(),
            });
        }

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all values are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.crm.authorize_url.is_empty() || reqwest::Url::parse(&self.crm.authorize_url).is_err()
        {
            return Err(ConfigError::InvalidValue {
                field: "crm.authorize_url".into(),
                detail: "must be an absolute URL".into(),
            });
        }
        if reqwest::Url::parse(&self.crm.token_url).is_err() {
            return Err(ConfigError::InvalidValue {
                field: "crm.token_url".into(),
                detail: "must be an absolute URL".into(),
            });
        }
        if self.crm.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "crm.request_timeout_secs".into(),
                detail: "timeout must be > 0".into(),
            });
        }
        if self.crm.page_size == 0 || self.crm.page_size > 500 {
            return Err(ConfigError::InvalidValue {
                field: "crm.page_size".into(),
                detail: "page size must be between 1 and 500".into(),
            });
        }
        if self.daemon.scheduler_tick_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "daemon.scheduler_tick_secs".into(),
                detail: "scheduler tick must be > 0".into(),
            });
        }
        if self.sync.token_safety_margin_secs > MAX_SAFETY_MARGIN_SECS {
            return Err(ConfigError::InvalidValue {
                field: "sync.token_safety_margin_secs".into(),
                detail: format!("must be at most {MAX_SAFETY_MARGIN_SECS}"),
            });
        }
        if self.oauth.state_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "oauth.state_ttl_secs".into(),
                detail: "state TTL must be > 0".into(),
            });
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
