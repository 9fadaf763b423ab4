//! # leasekeep-core
//!
//! Lease lock kernel for named resources.
//! Provides the per-resource Free/Held state machine, compare-and-set
//! resource stores, and durable, self-validating expiry reclaims.

pub mod clock;
pub mod config;
pub mod error;
pub mod infrastructure;
#[path = "infrastructure_in_memory.rs"]
pub mod infrastructure_in_memory;
#[cfg(feature = "sqlite")]
#[path = "infrastructure_sqlite.rs"]
pub mod infrastructure_sqlite;
pub mod manager;
pub mod scheduler;
pub mod state;
pub mod types;

pub use error::{LeaseError, StoreError};
pub use manager::LeaseManager;

#[cfg(test)]
mod manager_test;
