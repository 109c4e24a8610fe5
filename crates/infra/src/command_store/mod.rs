//! Command store boundary.
//!
//! Defines the storage contract the command service is built on (atomic
//! compare-and-transition per id) without making any storage assumptions.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryCommandStore;
pub use r#trait::{CommandFilter, CommandStore, CommandStoreError};
