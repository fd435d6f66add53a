pub mod collab;
pub mod config;
pub mod error;
pub mod gateway;

use std::sync::Arc;

use gateway::router::EventRouter;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<EventRouter>,
}
