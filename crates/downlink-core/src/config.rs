//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::state::NetworkMode;

/// Configuration shared by the engine and its adapters.
///
/// Embeddable in a host configuration file; missing fields fall back to
/// [`EngineConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sandbox root for confined downloads.
    pub root_path: PathBuf,
    /// Whether new downloads are confined to `root_path`.
    pub confined: bool,
    /// Default read cap in bytes/sec (0 = unlimited).
    pub default_throttle: u64,
    /// Whether metered (cellular) bearers may be used by default.
    pub allow_gsm_download: bool,
    /// Bearer reported by the static network information adapter.
    pub network_mode: NetworkMode,
    /// Connectivity reported by the static network information adapter.
    pub online: bool,
    /// Suffix of the staging file written while a transfer is in flight.
    pub temp_suffix: String,
    /// PEM certificates trusted in addition to the system roots.
    pub accepted_certificates: Vec<String>,
    /// User agent sent with every request.
    pub user_agent: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root_path: dirs::download_dir().unwrap_or_else(std::env::temp_dir),
            confined: true,
            default_throttle: 0,
            allow_gsm_download: true,
            network_mode: NetworkMode::Ethernet,
            online: true,
            temp_suffix: ".tmp".to_string(),
            accepted_certificates: Vec::new(),
            user_agent: None,
        }
    }
}

impl EngineConfig {
    /// Create a new config rooted at `root_path`.
    #[must_use]
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub const fn with_confined(mut self, confined: bool) -> Self {
        self.confined = confined;
        self
    }

    #[must_use]
    pub const fn with_default_throttle(mut self, throttle: u64) -> Self {
        self.default_throttle = throttle;
        self
    }

    #[must_use]
    pub const fn with_allow_gsm_download(mut self, allowed: bool) -> Self {
        self.allow_gsm_download = allowed;
        self
    }

    #[must_use]
    pub const fn with_network_mode(mut self, mode: NetworkMode) -> Self {
        self.network_mode = mode;
        self
    }

    #[must_use]
    pub const fn with_online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    #[must_use]
    pub fn with_temp_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.temp_suffix = suffix.into();
        self
    }

    #[must_use]
    pub fn with_accepted_certificates(mut self, pems: Vec<String>) -> Self {
        self.accepted_certificates = pems;
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides_defaults() {
        let config = EngineConfig::new("/srv/downloads")
            .with_confined(false)
            .with_default_throttle(1024)
            .with_network_mode(NetworkMode::Lte);

        assert_eq!(config.root_path, PathBuf::from("/srv/downloads"));
        assert!(!config.confined);
        assert_eq!(config.default_throttle, 1024);
        assert_eq!(config.network_mode, NetworkMode::Lte);
        assert_eq!(config.temp_suffix, ".tmp");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"root_path": "/data", "allow_gsm_download": false}"#)
                .unwrap();
        assert_eq!(config.root_path, PathBuf::from("/data"));
        assert!(!config.allow_gsm_download);
        assert!(config.confined);
        assert!(config.online);
    }
}
