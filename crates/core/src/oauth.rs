//! OAuth authorization-code flow against the CRM.
//!
//! The `state` parameter is a signed, self-describing token:
//!
//! ```text
//! base64url(tenant_id "." issued_at "." nonce) "." hex(hmac_sha256(secret, first_part))
//! ```
//!
//! so the callback recovers the tenant without any server-side session and
//! without trusting anything else the browser sends.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::crm::CrmApi;
use crate::errors::{ConfigError, OAuthError};
use crate::locks::ConnectionLocks;
use crate::models::IntegrationConnection;
use crate::store::CredentialStore;

type HmacSha256 = Hmac<Sha256>;

/// Issued states dated this far in the future are still accepted.
const CLOCK_SKEW_SECS: i64 = 60;

// ---------------------------------------------------------------------------
// State signing
// ---------------------------------------------------------------------------

/// Issues and verifies signed `state` tokens.
#[derive(Clone)]
pub struct StateSigner {
    mac: HmacSha256,
    ttl_secs: i64,
}

impl StateSigner {
    pub fn new(secret: impl AsRef<[u8]>, ttl_secs: u64) -> Result<Self, ConfigError> {
        let mac = HmacSha256::new_from_slice(secret.as_ref()).map_err(|e| {
            ConfigError::InvalidValue {
                field: "oauth.state_secret_env".into(),
                detail: e.to_string(),
            }
        })?;
        Ok(Self {
            mac,
            ttl_secs: i64::try_from(ttl_secs).unwrap_or(i64::MAX),
        })
    }

    pub fn issue(&self, tenant_id: &str, now: DateTime<Utc>) -> String {
        let nonce = hex::encode(rand::random::<[u8; 16]>());
        let payload = format!("{tenant_id}.{}.{nonce}", now.timestamp());
        let encoded = URL_SAFE_NO_PAD.encode(payload);
        let signature = self.sign(&encoded);
        format!("{encoded}.{signature}")
    }

    /// Recover the tenant id from a state token issued by [`Self::issue`].
    pub fn verify(&self, state: &str, now: DateTime<Utc>) -> Result<String, OAuthError> {
        let (encoded, signature) = state
            .split_once('.')
            .ok_or_else(|| OAuthError::InvalidState("malformed state".into()))?;

        let expected = self.sign(encoded);
        if !bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
            return Err(OAuthError::InvalidState("signature mismatch".into()));
        }

        let payload = URL_SAFE_NO_PAD
            .decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| OAuthError::InvalidState("undecodable state".into()))?;

        // Tenant ids may contain dots; the last two segments are fixed.
        let mut parts = payload.rsplitn(3, '.');
        let (_nonce, issued_at, tenant_id) = match (parts.next(), parts.next(), parts.next()) {
            (Some(nonce), Some(issued), Some(tenant)) if !tenant.is_empty() => {
                (nonce, issued, tenant)
            }
            _ => return Err(OAuthError::InvalidState("incomplete state".into())),
        };
        let issued_at: i64 = issued_at
            .parse()
            .map_err(|_| OAuthError::InvalidState("bad timestamp".into()))?;

        let age = now.timestamp() - issued_at;
        if age > self.ttl_secs {
            return Err(OAuthError::InvalidState("state expired".into()));
        }
        if age < -CLOCK_SKEW_SECS {
            return Err(OAuthError::InvalidState("state issued in the future".into()));
        }
        Ok(tenant_id.to_string())
    }

    fn sign(&self, encoded: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(encoded.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

// ---------------------------------------------------------------------------
// Flow controller
// ---------------------------------------------------------------------------

/// Provider endpoint settings for the flow.
#[derive(Clone)]
pub struct OAuthSettings {
    pub authorize_url: String,
    pub scope: Option<String>,
    pub signer: StateSigner,
}

impl OAuthSettings {
    /// Build from the loaded config; the state secret must be resolved.
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        let secret = config
            .oauth
            .state_secret
            .as_deref()
            .ok_or_else(|| ConfigError::EnvVarMissing {
                var: config.oauth.state_secret_env.clone(),
                field: "oauth.state_secret_env".into(),
            })?;
        Ok(Self {
            authorize_url: config.crm.authorize_url.clone(),
            scope: config.crm.scope.clone().filter(|s| !s.is_empty()),
            signer: StateSigner::new(secret, config.oauth.state_ttl_secs)?,
        })
    }
}

/// Drives the two halves of the authorization-code flow.
pub struct OAuthFlowController {
    api: Arc<dyn CrmApi>,
    credentials: Arc<dyn CredentialStore>,
    locks: ConnectionLocks,
    settings: OAuthSettings,
}

impl OAuthFlowController {
    pub fn new(
        api: Arc<dyn CrmApi>,
        credentials: Arc<dyn CredentialStore>,
        locks: ConnectionLocks,
        settings: OAuthSettings,
    ) -> Self {
        Self {
            api,
            credentials,
            locks,
            settings,
        }
    }

    /// Provider URL the tenant's user is redirected to.
    pub fn build_authorization_url(&self, tenant_id: &str) -> Result<String, OAuthError> {
        let conn = self
            .credentials
            .get_connection(tenant_id)?
            .ok_or_else(|| OAuthError::NotConfigured(tenant_id.to_string()))?;
        let (credentials, redirect_uri) = configured(&conn)?;

        let state = self.settings.signer.issue(tenant_id, Utc::now());
        let mut params = vec![
            ("client_id", credentials.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("state", state.as_str()),
        ];
        if let Some(scope) = &self.settings.scope {
            params.push(("scope", scope.as_str()));
        }
        let url = Url::parse_with_params(&self.settings.authorize_url, &params).map_err(|e| {
            warn!(error = %e, "authorize_url is not a valid URL");
            OAuthError::NotConfigured(tenant_id.to_string())
        })?;

        debug!(tenant_id, "built authorization URL");
        Ok(url.into())
    }

    /// Finish the flow: validate the callback, exchange the code, and store
    /// the token grant on the tenant's connection.
    pub async fn complete_callback(
        &self,
        code: Option<&str>,
        state: Option<&str>,
        provider_error: Option<&str>,
    ) -> Result<IntegrationConnection, OAuthError> {
        if let Some(error) = provider_error.filter(|e| !e.is_empty()) {
            warn!(provider_error = error, "provider rejected authorization");
            return Err(OAuthError::Provider(error.to_string()));
        }
        let state = state
            .filter(|s| !s.is_empty())
            .ok_or_else(|| OAuthError::InvalidState("missing state".into()))?;
        let tenant_id = self.settings.signer.verify(state, Utc::now())?;
        let code = code
            .filter(|c| !c.is_empty())
            .ok_or(OAuthError::MissingCode)?;

        let conn = self
            .credentials
            .get_connection(&tenant_id)?
            .ok_or_else(|| OAuthError::NotConfigured(tenant_id.clone()))?;
        let (credentials, redirect_uri) = configured(&conn)?;

        let grant = self
            .api
            .exchange_code(&credentials, code, redirect_uri)
            .await
            .map_err(|e| {
                warn!(tenant_id = %tenant_id, error = %e, "authorization code exchange failed");
                OAuthError::Exchange(e)
            })?;

        let _guard = self.locks.lock(conn.id).await;
        let mut current = self
            .credentials
            .get_connection_by_id(conn.id)?
            .unwrap_or(conn);
        current.apply_grant(grant, Utc::now());
        let saved = self.credentials.save_connection(&current)?;

        info!(tenant_id = %tenant_id, api_domain = ?saved.api_domain, "CRM connection authorized");
        Ok(saved)
    }
}

/// Client credentials and redirect URI of an enabled connection.
fn configured(
    conn: &IntegrationConnection,
) -> Result<(crate::models::ClientCredentials, &str), OAuthError> {
    let not_configured = || OAuthError::NotConfigured(conn.tenant_id.clone());
    if !conn.is_enabled {
        return Err(not_configured());
    }
    let credentials = conn.client_credentials().ok_or_else(not_configured)?;
    let redirect_uri = conn
        .redirect_uri
        .as_deref()
        .filter(|r| !r.is_empty())
        .ok_or_else(not_configured)?;
    Ok((credentials, redirect_uri))
}
