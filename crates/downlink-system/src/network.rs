//! Network information seeded from configuration.
//!
//! There is no portable way to ask the OS for the current bearer, so the
//! host reports changes through [`StaticNetworkInfo::set_online`] and
//! [`StaticNetworkInfo::set_network_mode`].

use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use downlink_core::ports::SystemNetworkInfo;
use downlink_core::{EngineConfig, NetworkMode};

#[derive(Debug)]
pub struct StaticNetworkInfo {
    online: AtomicBool,
    mode: RwLock<NetworkMode>,
}

impl StaticNetworkInfo {
    pub const fn new(online: bool, mode: NetworkMode) -> Self {
        Self {
            online: AtomicBool::new(online),
            mode: RwLock::new(mode),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.online, config.network_mode)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_network_mode(&self, mode: NetworkMode) {
        match self.mode.write() {
            Ok(mut guard) => *guard = mode,
            Err(poisoned) => *poisoned.into_inner() = mode,
        }
    }
}

impl SystemNetworkInfo for StaticNetworkInfo {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn current_network_mode(&self) -> NetworkMode {
        match self.mode.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_from_config() {
        let config = EngineConfig::new("/tmp")
            .with_online(false)
            .with_network_mode(NetworkMode::Gsm);
        let info = StaticNetworkInfo::from_config(&config);

        assert!(!info.is_online());
        assert_eq!(info.current_network_mode(), NetworkMode::Gsm);
    }

    #[test]
    fn test_updates_are_visible() {
        let info = StaticNetworkInfo::new(true, NetworkMode::Wlan);

        info.set_online(false);
        info.set_network_mode(NetworkMode::Lte);

        assert!(!info.is_online());
        assert_eq!(info.current_network_mode(), NetworkMode::Lte);
    }
}
