//! crmsync core library.
//!
//! This crate provides the components of the per-tenant CRM integration:
//! configuration, database persistence, field mapping, the Pipedrive API
//! client, token lifecycle, the OAuth flow, the sync engine, and the
//! [`IntegrationService`] facade that ties them together.

pub mod config;
pub mod crm;
pub mod db;
pub mod errors;
pub mod locks;
pub mod mapping;
pub mod models;
pub mod oauth;
pub mod service;
pub mod store;
pub mod sync_engine;
pub mod token;

// Re-exports for convenience.
pub use config::AppConfig;
pub use crm::{CrmApi, PipedriveClient};
pub use db::Database;
pub use errors::CoreError;
pub use service::IntegrationService;
pub use store::Stores;
pub use sync_engine::SyncEngine;
