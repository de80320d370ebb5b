//! Database module for linkwatch.
//!
//! Provides the storage contract used by the engine and its SQLite implementation.

mod gateway;
mod models;
mod store;

pub use gateway::*;
pub use models::*;
pub use store::*;
