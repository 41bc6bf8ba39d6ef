//! Store bundle handed to the dispatch core

use crate::db::DatabasePool;
use crate::memory::MemoryStore;
use crate::repository::{
    CampaignStore, ContactStore, DbCampaignRepository, DbContactRepository, DbTaskRepository,
    TaskStore,
};
use std::sync::Arc;

/// The three stores the dispatch core depends on
#[derive(Clone)]
pub struct Stores {
    pub contacts: Arc<dyn ContactStore>,
    pub campaigns: Arc<dyn CampaignStore>,
    pub tasks: Arc<dyn TaskStore>,
}

impl Stores {
    /// PostgreSQL repositories sharing one pool
    pub fn postgres(pool: DatabasePool) -> Self {
        Self {
            contacts: Arc::new(DbContactRepository::new(pool.clone())),
            campaigns: Arc::new(DbCampaignRepository::new(pool.clone())),
            tasks: Arc::new(DbTaskRepository::new(pool)),
        }
    }

    /// One in-memory store behind every trait
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            contacts: store.clone(),
            campaigns: store.clone(),
            tasks: store,
        }
    }
}
