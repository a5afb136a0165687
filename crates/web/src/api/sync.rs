//! Sync settings, manual trigger and history endpoints.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;

use crmsync_core::errors::{CoreError, ValidationError};
use crmsync_core::models::{SyncSettings, SyncSettingsPatch, SyncSummary, SyncType};
use crmsync_core::service::{SyncDetail, SyncHistory};

use crate::api::status::AppError;
use crate::api::{Tenant, PREFIX};
use crate::AppState;

#[derive(Deserialize)]
pub struct TriggerSyncRequest {
    #[serde(default)]
    pub sync_type: Option<SyncType>,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            &format!("{PREFIX}/sync-config"),
            get(get_sync_config).put(update_sync_config),
        )
        .route(&format!("{PREFIX}/sync"), post(trigger_sync))
        .route(&format!("{PREFIX}/sync/history"), get(list_history))
        .route(&format!("{PREFIX}/sync/history/:id"), get(get_detail))
}

async fn get_sync_config(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
) -> Result<Json<SyncSettings>, AppError> {
    Ok(Json(state.service.get_sync_config(&tenant)?))
}

async fn update_sync_config(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Json(patch): Json<SyncSettingsPatch>,
) -> Result<Json<SyncSettings>, AppError> {
    Ok(Json(state.service.update_sync_config(&tenant, patch).await?))
}

/// Runs to completion before answering. An empty body means `manual`;
/// any other body must be a valid request.
async fn trigger_sync(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    body: Bytes,
) -> Result<Json<SyncSummary>, AppError> {
    let sync_type = parse_sync_type(&body)?;
    info!(tenant_id = %tenant, sync_type = sync_type.as_str(), "manual sync requested");
    Ok(Json(state.service.trigger_sync(&tenant, sync_type).await?))
}

fn parse_sync_type(body: &[u8]) -> Result<SyncType, CoreError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(SyncType::Manual);
    }
    let request: TriggerSyncRequest =
        serde_json::from_slice(body).map_err(|e| ValidationError::Malformed {
            what: "sync request".into(),
            detail: e.to_string(),
        })?;
    Ok(request.sync_type.unwrap_or(SyncType::Manual))
}

async fn list_history(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<SyncHistory>, AppError> {
    let limit = query.limit.unwrap_or(20);
    let offset = query.offset.unwrap_or(0);
    Ok(Json(
        state.service.list_sync_history(&tenant, limit, offset)?,
    ))
}

async fn get_detail(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Path(id): Path<i64>,
) -> Result<Json<SyncDetail>, AppError> {
    Ok(Json(state.service.get_sync_detail(&tenant, id)?))
}
