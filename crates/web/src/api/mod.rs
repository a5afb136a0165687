//! REST API endpoint modules.

pub mod integration;
pub mod status;
pub mod sync;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::api::status::AppError;

/// Header carrying the tenant resolved by the gateway.
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Route prefix of the integration API.
pub const PREFIX: &str = "/api/integrations/pipedrive";

/// The calling tenant, taken from [`TENANT_HEADER`].
pub struct Tenant(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Tenant {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Tenant(v.to_string()))
            .ok_or_else(|| AppError::BadRequest(format!("missing {TENANT_HEADER} header")))
    }
}
