//! wacast API - REST API server
//!
//! Campaign management, dispatch control, health and metrics endpoints.
//! Authentication is expected to be handled in front of this service.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::AppState;
