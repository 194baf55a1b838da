pub mod config;
pub mod db;
pub mod errors;
pub mod executor;
pub mod forge;
pub mod models;
pub mod parsers;
pub mod queue;
pub mod routes;
pub mod services;

use std::sync::Arc;

use crate::db::Store;
use crate::services::dispatch::Dispatcher;

/// Shared application state passed to all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub dispatcher: Arc<Dispatcher>,
    pub config: config::AppConfig,
}
