//! # Pipeline Core Errors
//!
//! Per-subsystem error enums, composed into a single [`EngineError`], mirroring
//! the teacher's `kernel::error::Error` composing `StageSystemError` /
//! `PluginSystemError` / etc. with `#[from]`.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while extracting top-level config keys or flattening the
/// remainder (spec.md §4.1, §7).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("top-level config lacks 'working_directory'")]
    MissingWorkspace,

    #[error("top-level config lacks 'stages'")]
    MissingStagesList,

    #[error("config key contains '.': {key}")]
    InvalidConfigKey { key: String },

    #[error("config leaf is not a scalar: {key}")]
    InvalidConfigValueType { key: String },
}

/// Errors raised during stage discovery and requirement resolution
/// (spec.md §4.2, §7).
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("stage '{name}' could not be loaded from the registry")]
    StageNotFound { name: String },

    #[error("stage '{stage}' requires unknown config key: {key}")]
    MissingConfigKey { stage: String, key: String },

    #[error(
        "conflicting default values for key '{key}': {}",
        conflicts
            .iter()
            .map(|(value, stages)| format!("{value} (from {})", stages.join(", ")))
            .collect::<Vec<_>>()
            .join("; ")
    )]
    DefaultValueConflict {
        key: String,
        /// (default value rendered as string, stages declaring it)
        conflicts: Vec<(String, Vec<String>)>,
    },
}

/// Errors raised while topologically ordering the discovered stages
/// (spec.md §4.3, §7).
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("circular dependency among stages: {remaining:?}")]
    CircularDependency { remaining: Vec<String> },
}

/// Errors raised during staleness analysis and stage execution
/// (spec.md §4.4, §7).
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("stage '{stage}' accessed undeclared upstream/cache: {target}")]
    UnrequestedStageAccess { stage: String, target: String },

    #[error("path is not a directory: {path}")]
    WorkspaceNotDirectory { path: PathBuf },

    #[error("stage '{stage}' failed: {source}")]
    StageFailure {
        stage: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("io error during '{operation}' on '{}': {source}", path.display())]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize {what} for stage '{stage}': {source}")]
    Codec {
        stage: String,
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised by the progress service transport (spec.md §4.5).
#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("failed to bind progress server socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to connect to progress server: {0}")]
    Connect(#[source] std::io::Error),

    #[error("progress protocol io error: {0}")]
    Io(#[source] std::io::Error),

    #[error("malformed progress message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("failed to spawn progress server process: {0}")]
    Spawn(#[source] std::io::Error),
}

/// The unified, top-level error type returned by [`crate::run`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("progress service error: {0}")]
    Progress(#[from] ProgressError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
