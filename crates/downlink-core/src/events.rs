//! Events a transfer publishes to whoever owns it.
//!
//! A download or group owns an outbound stream of these; the queue, the
//! group and the reactor are readers of that stream.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::TransferError;
use crate::state::TransferState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferEvent {
    /// The lifecycle state moved.
    StateChanged { state: TransferState },
    Started { success: bool },
    Paused { success: bool },
    Resumed { success: bool },
    Canceled { success: bool },
    /// Bytes on disk versus the expected total of the current exchange.
    Progress { received: u64, total: u64 },
    /// Verification or post-download command started.
    Processing { path: PathBuf },
    Finished { path: PathBuf },
    /// Every member of a group finished.
    GroupFinished { paths: Vec<PathBuf> },
    /// The specific cause of a fatal error.
    Failed { error: TransferError },
    /// A group member failed; carries the member URL.
    MemberFailed { url: String, error: TransferError },
    /// Generic, user-facing error message.
    Error { message: String },
}

impl TransferEvent {
    pub const fn state_changed(state: TransferState) -> Self {
        Self::StateChanged { state }
    }

    pub const fn is_state_change(&self) -> bool {
        matches!(self, Self::StateChanged { .. })
    }
}
