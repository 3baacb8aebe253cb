//! Transfer lifecycle state and network classification.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state shared by every transfer.
///
/// `Cancel`, `Finish` and `Error` are terminal: once a transfer reaches one
/// of them it never moves again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    #[default]
    Idle,
    Start,
    Pause,
    Resume,
    Cancel,
    Finish,
    Error,
}

impl TransferState {
    /// Whether the state ends the transfer.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancel | Self::Finish | Self::Error)
    }

    /// Whether a start or resume has been requested and is still pending.
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Start | Self::Resume)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::Finish => "finish",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bearer the host is currently connected through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    #[default]
    Unknown,
    Gsm,
    Cdma,
    Wcdma,
    Wlan,
    Ethernet,
    Bluetooth,
    Wimax,
    Lte,
    Tdscdma,
}

impl NetworkMode {
    /// Cellular bearers, where data is usually metered.
    pub const fn is_metered(self) -> bool {
        matches!(
            self,
            Self::Unknown
                | Self::Gsm
                | Self::Cdma
                | Self::Wcdma
                | Self::Wimax
                | Self::Lte
                | Self::Tdscdma
        )
    }

    /// Bearers that never need the metered-data permission.
    pub const fn is_unmetered(self) -> bool {
        matches!(self, Self::Wlan | Self::Ethernet | Self::Bluetooth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TransferState::Cancel.is_terminal());
        assert!(TransferState::Finish.is_terminal());
        assert!(TransferState::Error.is_terminal());
        assert!(!TransferState::Idle.is_terminal());
        assert!(!TransferState::Pause.is_terminal());
        assert!(!TransferState::Resume.is_terminal());
    }

    #[test]
    fn test_unknown_mode_counts_as_metered() {
        assert!(NetworkMode::Unknown.is_metered());
        assert!(NetworkMode::Lte.is_metered());
        assert!(NetworkMode::Wlan.is_unmetered());
        assert!(!NetworkMode::Gsm.is_unmetered());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&TransferState::Finish).unwrap();
        assert_eq!(json, "\"finish\"");
    }
}
