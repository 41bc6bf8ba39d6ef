//! wacast Storage - Database access for campaigns, contacts and dispatch tasks
//!
//! Every store is exposed as an async trait with a PostgreSQL implementation
//! and an in-memory implementation used for tests and single-node demos.

pub mod db;
pub mod memory;
pub mod models;
pub mod repository;
pub mod stores;

pub use db::DatabasePool;
pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;
pub use stores::Stores;
