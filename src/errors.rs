// src/errors.rs

//! Crate-wide error type and result alias.

use thiserror::Error;

use crate::data::{DataId, DataStatus};

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Process already registered: {0}")]
    DuplicateProcess(String),

    #[error("Data object not found: {0}")]
    UnknownData(DataId),

    #[error("Data object {id} has unresolved inputs: waiting on {waiting_on:?}")]
    UnresolvedInput { id: DataId, waiting_on: Vec<DataId> },

    #[error("Data object {id} cannot run: dependencies {failed:?} failed")]
    DependencyFailed { id: DataId, failed: Vec<DataId> },

    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Launch error for data object {id}: {message}")]
    Launch { id: DataId, message: String },

    #[error("Execution error for data object {id}: {message}")]
    Execution { id: DataId, message: String },

    #[error("Data directory {} already exists and was not created for this data object", .0.display())]
    DataDirTaken(std::path::PathBuf),

    #[error("Invalid transition for data object {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: DataId,
        from: DataStatus,
        to: DataStatus,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Cycle detected in batch: {0}")]
    BatchCycle(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure to bind inputs into a command template.
///
/// Always terminal for the data object being resolved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("missing input '{0}'")]
    MissingInput(String),

    #[error("input '{name}' expected {expected}, got {found}")]
    TypeMismatch {
        name: String,
        expected: String,
        found: String,
    },

    #[error("unknown input '{0}' is not declared by the process")]
    UndeclaredInput(String),

    #[error("unknown workflow step '{0}'")]
    UnknownStep(String),

    #[error("unknown filter '{0}'")]
    UnknownFilter(String),

    #[error("malformed placeholder at byte {offset}: {reason}")]
    Malformed { offset: usize, reason: String },
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for FlowError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        FlowError::ChannelError(err.to_string())
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, FlowError>;
