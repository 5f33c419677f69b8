//! Error taxonomy for bridge operations.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::codec::CodecError;

/// Errors that can occur during bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Isolated environment not found at {}", .0.display())]
    EnvironmentNotFound(PathBuf),

    #[error("Isolated environment is unusable: {0}")]
    EnvironmentInvalid(String),

    #[error("Failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Worker session has not been started")]
    NotStarted,

    #[error("Worker session is busy with another call")]
    WorkerBusy,

    #[error("Worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Failed to load {model} model: {message}")]
    ModelLoad { model: &'static str, message: String },

    #[error("Worker did not respond within {0:?}")]
    Timeout(Duration),

    #[error("Worker call `{method}` failed: {message}")]
    Remote { method: String, message: String },
}

impl BridgeError {
    /// Whether the error leaves the session terminated.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Spawn(_) | Self::WorkerCrashed(_) | Self::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
