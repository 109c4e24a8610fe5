//! Infrastructure layer: command store, lease-based dispatch service, workers.

pub mod command_service;
pub mod command_store;
pub mod config;
pub mod lease;
pub mod registry;
pub mod retention;
pub mod workers;

pub use command_service::{CommandService, CommandStats};
pub use command_store::{CommandFilter, CommandStore, CommandStoreError, InMemoryCommandStore};
pub use config::{ConfigError, ServiceConfig};
pub use lease::{LeaseError, LeaseManager};
pub use registry::{PayloadValidator, TypeRegistry};
pub use retention::RetentionPolicy;
