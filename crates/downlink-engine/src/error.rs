//! Errors returned by the queue and the reactor.

use downlink_core::ValidationError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("no transfer registered at {path}")]
    UnknownTransfer { path: String },

    #[error("a transfer is already registered at {path}")]
    DuplicatePath { path: String },

    #[error("transfer at {path} is invalid: {source}")]
    InvalidTransfer {
        path: String,
        #[source]
        source: ValidationError,
    },

    #[error("reactor is not running")]
    Stopped,

    #[error("adapter setup failed: {message}")]
    Backend { message: String },
}

impl EngineError {
    pub fn unknown(path: impl Into<String>) -> Self {
        Self::UnknownTransfer { path: path.into() }
    }

    pub fn duplicate(path: impl Into<String>) -> Self {
        Self::DuplicatePath { path: path.into() }
    }
}
