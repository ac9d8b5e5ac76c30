//! # Pegboard Core
//!
//! Core library for the Pegboard plugin manager.
//! Provides plugin discovery, the registry with enable/disable state,
//! schedule parsing, the process runner, background scheduling,
//! configuration, and fundamental types.

pub mod config;
pub mod discovery;
pub mod error;
pub mod manager;
pub mod metadata;
pub mod plugin;
pub mod runner;
pub mod schedule;
pub mod scheduler;
pub mod store;

// Re-export commonly used types at the crate root.
pub use config::{PegboardConfig, load_config};
pub use discovery::{DirectorySource, DiscoveredPlugin, PluginSource};
pub use error::{ConfigError, PegboardError, RegistryError, Result, ScheduleError};
pub use manager::{PluginEvent, PluginManager, RefreshOutcome, RefreshReport};
pub use metadata::{PluginMetadata, parse_metadata};
pub use plugin::{Plugin, RunRecord, RunStatus};
pub use runner::PluginRunner;
pub use schedule::Schedule;
pub use scheduler::PluginScheduler;
pub use store::StateStore;
