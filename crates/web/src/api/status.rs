//! Health endpoint and the error type shared by all handlers.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::{error, warn};

use crmsync_core::CoreError;

use crate::AppState;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: String,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/health", get(health_check))
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ---------------------------------------------------------------------------
// Shared error type for API handlers
// ---------------------------------------------------------------------------

/// API error that converts to a `{"error", "kind"}` JSON response.
pub enum AppError {
    BadRequest(String),
    Core(CoreError),
}

impl From<CoreError> for AppError {
    fn from(e: CoreError) -> Self {
        AppError::Core(e)
    }
}

/// HTTP status for a [`CoreError::kind`].
pub fn status_for_kind(kind: &str) -> StatusCode {
    match kind {
        "validation_error" | "not_configured" => StatusCode::BAD_REQUEST,
        "invalid_oauth_state" | "oauth_provider_error" | "not_connected" => {
            StatusCode::UNAUTHORIZED
        }
        "token_revoked" => StatusCode::FORBIDDEN,
        "not_found" => StatusCode::NOT_FOUND,
        "sync_already_running" => StatusCode::CONFLICT,
        "crm_api_error" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::Core(e) => {
                let kind = e.kind();
                let status = status_for_kind(kind);
                if status.is_server_error() {
                    error!(kind, error = %e, "request failed");
                } else {
                    warn!(kind, error = %e, "request rejected");
                }
                (status, kind, e.to_string())
            }
        };

        let body = serde_json::json!({ "error": message, "kind": kind });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_status_mapping() {
        assert_eq!(status_for_kind("validation_error"), StatusCode::BAD_REQUEST);
        assert_eq!(status_for_kind("not_configured"), StatusCode::BAD_REQUEST);
        assert_eq!(status_for_kind("invalid_oauth_state"), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for_kind("token_revoked"), StatusCode::FORBIDDEN);
        assert_eq!(status_for_kind("not_found"), StatusCode::NOT_FOUND);
        assert_eq!(status_for_kind("sync_already_running"), StatusCode::CONFLICT);
        assert_eq!(status_for_kind("crm_api_error"), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for_kind("database_error"),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
