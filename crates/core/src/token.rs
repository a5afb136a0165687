//! Access-token lifecycle: decide when to refresh, refresh, persist.
//!
//! Refreshes run under the connection lock from [`ConnectionLocks`] and
//! re-read the stored connection first, so concurrent callers never issue
//! two refreshes or persist conflicting token pairs.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::crm::CrmApi;
use crate::errors::TokenError;
use crate::locks::ConnectionLocks;
use crate::models::IntegrationConnection;
use crate::store::CredentialStore;

/// True when a token expiring at `expires_at` must be refreshed at `now`.
/// A missing expiry always needs a refresh.
pub fn needs_refresh(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>, margin: Duration) -> bool {
    match expires_at {
        Some(expires_at) => now + margin >= expires_at,
        None => true,
    }
}

pub struct TokenLifecycleManager {
    api: Arc<dyn CrmApi>,
    credentials: Arc<dyn CredentialStore>,
    locks: ConnectionLocks,
    safety_margin: Duration,
}

impl TokenLifecycleManager {
    pub fn new(
        api: Arc<dyn CrmApi>,
        credentials: Arc<dyn CredentialStore>,
        locks: ConnectionLocks,
        safety_margin: Duration,
    ) -> Self {
        Self {
            api,
            credentials,
            locks,
            safety_margin,
        }
    }

    /// Return a connection whose access token is valid for at least the
    /// safety margin, refreshing and persisting it if needed.
    ///
    /// A deactivated connection fails with [`TokenError::Revoked`] without
    /// touching the network. A refresh rejected by the provider deactivates
    /// the connection and fails the same way.
    pub async fn ensure_valid(
        &self,
        connection: &IntegrationConnection,
    ) -> Result<IntegrationConnection, TokenError> {
        check_usable(connection)?;
        if self.is_fresh(connection, Utc::now()) {
            return Ok(connection.clone());
        }

        let _guard = self.locks.lock(connection.id).await;

        // Another caller may have refreshed while we waited.
        let current = self
            .credentials
            .get_connection_by_id(connection.id)?
            .ok_or_else(|| TokenError::NotConnected(connection.tenant_id.clone()))?;
        check_usable(&current)?;
        if self.is_fresh(&current, Utc::now()) {
            debug!(connection_id = current.id, "token already refreshed by another caller");
            return Ok(current);
        }

        self.refresh_locked(current).await
    }

    fn is_fresh(&self, connection: &IntegrationConnection, now: DateTime<Utc>) -> bool {
        connection.session().is_some()
            && !needs_refresh(connection.token_expires_at, now, self.safety_margin)
    }

    /// Caller must hold the connection lock.
    async fn refresh_locked(
        &self,
        mut connection: IntegrationConnection,
    ) -> Result<IntegrationConnection, TokenError> {
        let tenant_id = connection.tenant_id.clone();
        let (credentials, refresh_token) =
            match (connection.client_credentials(), connection.refresh_token.clone()) {
                (Some(credentials), Some(token)) => (credentials, token),
                _ => return Err(TokenError::NotConnected(tenant_id)),
            };

        info!(tenant_id = %tenant_id, connection_id = connection.id, "refreshing CRM access token");
        match self.api.refresh_token(&credentials, &refresh_token).await {
            Ok(grant) => {
                connection.apply_grant(grant, Utc::now());
                let saved = self.credentials.save_connection(&connection)?;
                debug!(
                    tenant_id = %tenant_id,
                    expires_at = ?saved.token_expires_at,
                    "access token refreshed"
                );
                Ok(saved)
            }
            Err(e) if e.is_grant_rejected() => {
                warn!(tenant_id = %tenant_id, error = %e, "refresh grant rejected, deactivating connection");
                connection.is_active = false;
                connection.updated_at = Utc::now();
                self.credentials.save_connection(&connection)?;
                Err(TokenError::Revoked {
                    tenant_id,
                    detail: e.to_string(),
                })
            }
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "token refresh failed");
                Err(TokenError::Refresh(e))
            }
        }
    }
}

/// Fail fast for connections that were never authorized or are deactivated.
fn check_usable(connection: &IntegrationConnection) -> Result<(), TokenError> {
    if connection.refresh_token.is_none() {
        return Err(TokenError::NotConnected(connection.tenant_id.clone()));
    }
    if !connection.is_active {
        return Err(TokenError::Revoked {
            tenant_id: connection.tenant_id.clone(),
            detail: "connection is deactivated; re-authorize to continue".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::crm::fake::FakeCrm;
    use crate::db::Database;

    fn setup(expires_in_secs: i64, api: Arc<FakeCrm>) -> (TokenLifecycleManager, Arc<Database>, IntegrationConnection) {
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();

        let mut conn = IntegrationConnection::new("acme");
        conn.client_id = Some("abc".into());
        conn.client_secret = Some("secret".into());
        conn.access_token = Some("access-0".into());
        conn.refresh_token = Some("refresh".into());
        conn.api_domain = Some("https://acme.pipedrive.com".into());
        conn.token_expires_at = Some(Utc::now() + Duration::seconds(expires_in_secs));
        conn.is_active = true;
        let conn = db.save_connection(&conn).unwrap();

        let manager = TokenLifecycleManager::new(
            api,
            db.clone(),
            ConnectionLocks::new(),
            Duration::seconds(60),
        );
        (manager, db, conn)
    }

    #[test]
    fn test_needs_refresh_margin() {
        let now = Utc::now();
        let margin = Duration::seconds(60);
        assert!(needs_refresh(Some(now + Duration::seconds(10)), now, margin));
        assert!(needs_refresh(Some(now + Duration::seconds(60)), now, margin));
        assert!(!needs_refresh(Some(now + Duration::seconds(3600)), now, margin));
        assert!(needs_refresh(None, now, margin));
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed_and_persisted() {
        let api = Arc::new(FakeCrm::new());
        let (manager, db, conn) = setup(10, api.clone());

        let refreshed = manager.ensure_valid(&conn).await.unwrap();
        assert_eq!(api.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(refreshed.access_token.as_deref(), Some("access-1"));
        assert_eq!(refreshed.refresh_token.as_deref(), Some("refresh-rotated"));
        assert!(refreshed.token_expires_at.unwrap() > Utc::now() + Duration::seconds(3000));

        let stored = db.get_connection("acme").unwrap().unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("access-1"));
    }

    #[tokio::test]
    async fn test_valid_token_is_untouched() {
        let api = Arc::new(FakeCrm::new());
        let (manager, _db, conn) = setup(3600, api.clone());

        let same = manager.ensure_valid(&conn).await.unwrap();
        assert_eq!(api.refreshes.load(Ordering::SeqCst), 0);
        assert_eq!(same.access_token.as_deref(), Some("access-0"));
    }

    #[tokio::test]
    async fn test_rejected_refresh_deactivates() {
        let api = Arc::new(FakeCrm::new());
        api.set_refresh_status(400);
        let (manager, db, conn) = setup(10, api.clone());

        let err = manager.ensure_valid(&conn).await.unwrap_err();
        assert!(matches!(err, TokenError::Revoked { .. }));
        let stored = db.get_connection("acme").unwrap().unwrap();
        assert!(!stored.is_active);

        // Later calls fail fast without another refresh attempt.
        let err = manager.ensure_valid(&stored).await.unwrap_err();
        assert_eq!(err.kind(), "token_revoked");
        assert_eq!(api.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_error_keeps_connection_active() {
        let api = Arc::new(FakeCrm::new());
        api.set_refresh_status(502);
        let (manager, db, conn) = setup(10, api);

        let err = manager.ensure_valid(&conn).await.unwrap_err();
        assert!(matches!(err, TokenError::Refresh(_)));
        assert!(db.get_connection("acme").unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_never_authorized_is_not_connected() {
        let api = Arc::new(FakeCrm::new());
        let (manager, _db, mut conn) = setup(10, api);
        conn.refresh_token = None;
        let err = manager.ensure_valid(&conn).await.unwrap_err();
        assert!(matches!(err, TokenError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_concurrent_callers_refresh_once() {
        let api = Arc::new(FakeCrm::new());
        let (manager, _db, conn) = setup(10, api.clone());
        let manager = Arc::new(manager);

        let a = {
            let (m, c) = (manager.clone(), conn.clone());
            tokio::spawn(async move { m.ensure_valid(&c).await })
        };
        let b = {
            let (m, c) = (manager.clone(), conn.clone());
            tokio::spawn(async move { m.ensure_valid(&c).await })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_eq!(api.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(a.access_token, b.access_token);
    }
}
