//! crmsync web server and REST API.
//!
//! Provides an Axum-based HTTP server with:
//! - a health endpoint
//! - the per-tenant Pipedrive integration API under
//!   `/api/integrations/pipedrive`
//!
//! Tenant resolution happens upstream; handlers read the `X-Tenant-Id`
//! header set by the fronting gateway.

pub mod api;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderName, Method};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crmsync_core::IntegrationService;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub service: Arc<IntegrationService>,
}

/// The web server.
pub struct WebServer {
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(service: Arc<IntegrationService>) -> Self {
        Self {
            state: Arc::new(AppState { service }),
        }
    }

    /// The full application router, middleware included.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::PUT])
            .allow_headers([
                header::CONTENT_TYPE,
                header::AUTHORIZATION,
                HeaderName::from_static(api::TENANT_HEADER),
            ]);

        Router::new()
            .merge(api::status::routes())
            .merge(api::integration::routes())
            .merge(api::sync::routes())
            .layer(DefaultBodyLimit::max(256 * 1024))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(self.state.clone())
    }

    /// Start the web server, listening on the given address.
    pub async fn start(self, listen_addr: &str) -> anyhow::Result<()> {
        let addr: SocketAddr = listen_addr.parse()?;
        let app = self.router();

        info!(addr = %addr, "starting web server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
