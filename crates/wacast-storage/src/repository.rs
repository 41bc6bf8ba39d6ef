//! Repository layer for data access

pub mod campaigns;
pub mod contacts;
pub mod dispatch_tasks;

// Re-export concrete repository implementations
pub use campaigns::DbCampaignRepository;
pub use contacts::DbContactRepository;
pub use dispatch_tasks::DbTaskRepository;

// Re-export repository traits
pub use campaigns::CampaignStore;
pub use contacts::ContactStore;
pub use dispatch_tasks::TaskStore;

/// Whether a sqlx error is a unique constraint violation
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map_or(false, |db| db.is_unique_violation())
}
