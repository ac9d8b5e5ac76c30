//! Error types for the Pegboard core library.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering the plugin registry, schedule parsing, and configuration domains.

/// Top-level error type for the Pegboard core library.
#[derive(Debug, thiserror::Error)]
pub enum PegboardError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from plugin registry lookups and discovery.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Plugin not found: {id}")]
    NotFound { id: String },

    #[error("Plugin source unavailable: {reason}")]
    SourceUnavailable { reason: String },
}

/// Errors from schedule parsing.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid interval '{token}': {reason}")]
    InvalidInterval { token: String, reason: String },

    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// A type alias for results using the top-level `PegboardError`.
pub type Result<T> = std::result::Result<T, PegboardError>;
