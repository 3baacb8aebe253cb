//! Core domain types and port definitions for downlink.
//!
//! This crate holds everything the transfer engine and its adapters agree on:
//!
//! - [`state`] - transfer lifecycle state and network modes
//! - [`errors`] - the error taxonomy (validation, transfer, setup)
//! - [`events`] - events a transfer publishes to its owner
//! - [`hash`] - supported checksum algorithms
//! - [`metadata`] - the metadata map attached to a download
//! - [`config`] - engine configuration
//! - [`ports`] - collaborator traits (network, files, processes, hashing)
//!
//! No I/O happens here. Adapters live in `downlink-system`, the state
//! machines in `downlink-engine`.

pub mod config;
pub mod errors;
pub mod events;
pub mod hash;
pub mod metadata;
pub mod ports;
pub mod state;

pub use config::EngineConfig;
pub use errors::{
    AuthErrorKind, NetworkErrorCode, ProcessFailure, SetupError, TransferError, ValidationError,
};
pub use events::TransferEvent;
pub use hash::HashAlgorithm;
pub use metadata::Metadata;
pub use state::{NetworkMode, TransferState};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One declared member of a group download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDownloadStruct {
    /// Remote location of the member.
    pub url: String,
    /// Where the member must be written.
    pub local_file: PathBuf,
    /// Expected checksum, empty when no verification is wanted.
    #[serde(default)]
    pub hash: String,
}

impl GroupDownloadStruct {
    pub fn new(url: impl Into<String>, local_file: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            local_file: local_file.into(),
            hash: String::new(),
        }
    }

    #[must_use]
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = hash.into();
        self
    }
}
