//! Shared handler state

use std::sync::Arc;
use wacast_core::Dispatcher;
use wacast_storage::DatabasePool;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    /// Absent when running on the in-memory store
    pub db_pool: Option<DatabasePool>,
}
