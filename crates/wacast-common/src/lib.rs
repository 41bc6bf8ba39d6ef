//! wacast Common - Shared types and utilities
//!
//! This crate provides configuration, the shared error type, identifier
//! aliases and phone-number normalization used by every wacast component.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
