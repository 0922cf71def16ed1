//! Build Sentinel
//!
//! Detects when a long-lived client is running an outdated build and coordinates
//! background worker activation and cache invalidation so the client picks up the
//! new one.

pub mod checker;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod fetch;
pub mod models;
pub mod registry;
pub mod store;
pub mod worker;

pub use checker::VersionChecker;
pub use config::{CacheStrategy, CheckConfig, Config, ConfigPatch, WorkerOptions};
pub use coordinator::{Coordinator, CoordinatorDeps, CoordinatorOptions, SystemStatus};
pub use errors::CheckError;
pub use events::{EventBus, Subscription, UpdateEvent, UpdateOrigin};
pub use models::{CheckOutcome, CheckState, VersionDescriptor};
pub use worker::WorkerAwareChecker;

#[cfg(test)]
mod test_support;
