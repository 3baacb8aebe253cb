//! Transfer engine for downlink.
//!
//! - [`download`] - the single-file download state machine
//! - [`queue`] - admission control, one current transfer at a time
//! - [`group`] - several downloads finishing or failing together
//! - [`filename_mutex`] - destination name reservations
//! - [`reactor`] - the task every state change is funneled through
//!
//! Collaborators (HTTP, files, processes, hashing, network information) are
//! injected through [`TransferDeps`]. [`build_engine`] wires the production
//! adapters from `downlink-system`.

pub mod download;
pub mod error;
pub mod events;
pub mod filename_mutex;
pub mod group;
pub mod queue;
pub mod reactor;
pub mod transfer;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use downlink_core::ports::SystemNetworkInfo;
use downlink_core::{EngineConfig, NetworkMode};
use downlink_system::{
    DigestHashFactory, FsFileManager, HttpRequestFactory, StaticNetworkInfo, TokioProcessFactory,
};
use tokio::sync::mpsc;

pub use download::{Download, DownloadDescriptor};
pub use error::EngineError;
pub use filename_mutex::FileNameMutex;
pub use group::{GroupDownload, GroupDownloadDescriptor};
pub use queue::{Queue, QueueEvent};
pub use reactor::{ReactorEvent, ReactorHandle, spawn_reactor};
pub use transfer::{TransferDeps, Transferable};

/// A running reactor plus the network information it reads.
///
/// The host owns connectivity detection and reports it here; every report
/// is written to the network info port before the reactor is told.
#[derive(Clone)]
pub struct Engine {
    reactor: ReactorHandle,
    network: Arc<StaticNetworkInfo>,
}

impl Engine {
    pub const fn reactor(&self) -> &ReactorHandle {
        &self.reactor
    }

    pub fn network_mode(&self) -> NetworkMode {
        self.network.current_network_mode()
    }

    pub fn is_online(&self) -> bool {
        self.network.is_online()
    }

    /// Switch the bearer. Transfers held back by the metered policy start
    /// once the new bearer admits them.
    pub async fn set_network_mode(&self, mode: NetworkMode) -> Result<(), EngineError> {
        self.network.set_network_mode(mode);
        self.reactor.network_mode_changed(mode).await
    }

    pub async fn set_online(&self, online: bool) -> Result<(), EngineError> {
        self.network.set_online(online);
        self.reactor.set_online(online).await
    }
}

/// Start a reactor backed by the production adapters.
///
/// Must be called from within a tokio runtime.
pub fn build_engine(config: &EngineConfig) -> Result<Engine, EngineError> {
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let (process_tx, process_rx) = mpsc::unbounded_channel();

    let request_factory =
        HttpRequestFactory::new(config, reply_tx).map_err(|err| EngineError::Backend {
            message: format!("{err:#}"),
        })?;
    let network = Arc::new(StaticNetworkInfo::from_config(config));

    let deps = TransferDeps {
        request_factory: Arc::new(request_factory),
        file_manager: Arc::new(FsFileManager::new()),
        process_factory: Arc::new(TokioProcessFactory::new(process_tx)),
        network_info: network.clone(),
        hash_factory: Arc::new(DigestHashFactory::new()),
        filename_mutex: Arc::new(FileNameMutex::new()),
    };

    tracing::info!(
        target: "downlink.reactor",
        root = %config.root_path.display(),
        confined = config.confined,
        "building reactor"
    );
    Ok(Engine {
        reactor: spawn_reactor(deps, reply_rx, process_rx),
        network,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connectivity_reports_reach_the_port() {
        let config = EngineConfig::new(std::env::temp_dir()).with_network_mode(NetworkMode::Gsm);
        let engine = build_engine(&config).unwrap();
        assert_eq!(engine.network_mode(), NetworkMode::Gsm);

        engine.set_network_mode(NetworkMode::Wlan).await.unwrap();
        engine.set_online(false).await.unwrap();

        assert_eq!(engine.network_mode(), NetworkMode::Wlan);
        assert!(!engine.is_online());
        engine.reactor().shutdown();
    }
}
