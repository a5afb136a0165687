//! Connection, OAuth and field-mapping endpoints.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crmsync_core::models::{ConnectionConfigView, ConnectionStatus, FieldMappings, SimpleMapping};
use crmsync_core::service::{RemoteFields, SaveConfigRequest};

use crate::api::status::AppError;
use crate::api::{Tenant, PREFIX};
use crate::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct AuthorizeResponse {
    url: String,
}

/// Query string the provider redirects back with.
#[derive(Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(Serialize)]
struct CallbackResponse {
    connected: bool,
    tenant_id: String,
}

#[derive(Deserialize)]
pub struct MappingRequest {
    #[serde(default)]
    pub mapping: Option<SimpleMapping>,
}

#[derive(Deserialize)]
pub struct AdvancedMappingRequest {
    #[serde(default)]
    pub organization: Option<Value>,
    #[serde(default)]
    pub person: Option<Value>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(&format!("{PREFIX}/config"), get(get_config).put(save_config))
        .route(&format!("{PREFIX}/authorize"), get(authorize))
        .route(&format!("{PREFIX}/callback"), get(callback))
        .route(
            &format!("{PREFIX}/field-mapping"),
            get(get_field_mapping).put(update_field_mapping),
        )
        .route(
            &format!("{PREFIX}/field-mapping/person"),
            put(update_person_field_mapping),
        )
        .route(
            &format!("{PREFIX}/field-mapping/advanced"),
            put(update_advanced_field_mapping),
        )
        .route(&format!("{PREFIX}/remote-fields"), get(get_remote_fields))
        .route(&format!("{PREFIX}/status"), get(get_status))
}

async fn get_config(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
) -> Result<Json<ConnectionConfigView>, AppError> {
    Ok(Json(state.service.get_config(&tenant)?))
}

async fn save_config(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Json(body): Json<SaveConfigRequest>,
) -> Result<Json<ConnectionConfigView>, AppError> {
    Ok(Json(state.service.save_config(&tenant, body).await?))
}

async fn authorize(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
) -> Result<Json<AuthorizeResponse>, AppError> {
    let url = state.service.get_authorization_url(&tenant)?;
    Ok(Json(AuthorizeResponse { url }))
}

/// Provider redirect target. The tenant comes from the signed `state`, so
/// no tenant header is read here.
async fn callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<CallbackResponse>, AppError> {
    let tenant_id = state
        .service
        .complete_oauth_callback(
            query.code.as_deref(),
            query.state.as_deref(),
            query.error.as_deref(),
        )
        .await?;
    Ok(Json(CallbackResponse {
        connected: true,
        tenant_id,
    }))
}

async fn get_field_mapping(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
) -> Result<Json<FieldMappings>, AppError> {
    Ok(Json(state.service.get_field_mapping(&tenant)?))
}

async fn update_field_mapping(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Json(body): Json<MappingRequest>,
) -> Result<Json<FieldMappings>, AppError> {
    Ok(Json(
        state
            .service
            .update_field_mapping(&tenant, body.mapping)
            .await?,
    ))
}

async fn update_person_field_mapping(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Json(body): Json<MappingRequest>,
) -> Result<Json<FieldMappings>, AppError> {
    Ok(Json(
        state
            .service
            .update_person_field_mapping(&tenant, body.mapping)
            .await?,
    ))
}

async fn update_advanced_field_mapping(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Json(body): Json<AdvancedMappingRequest>,
) -> Result<Json<FieldMappings>, AppError> {
    Ok(Json(
        state
            .service
            .update_advanced_field_mapping(&tenant, body.organization, body.person)
            .await?,
    ))
}

async fn get_remote_fields(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
) -> Result<Json<RemoteFields>, AppError> {
    Ok(Json(state.service.get_remote_fields(&tenant).await?))
}

async fn get_status(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
) -> Result<Json<ConnectionStatus>, AppError> {
    Ok(Json(state.service.get_connection_status(&tenant)?))
}
