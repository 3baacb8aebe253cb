//! The capability set shared by downloads and groups.

use std::sync::Arc;

use downlink_core::TransferEvent;
use downlink_core::TransferState;
use downlink_core::ports::{
    FileManager, HashFactory, ProcessFactory, ProcessMessage, ReplyMessage, RequestFactory,
    SystemNetworkInfo,
};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::filename_mutex::FileNameMutex;

/// Something the queue or reactor can schedule.
///
/// The lifecycle calls come in two families. `start`, `pause`, `resume` and
/// `cancel` only record the requested state and publish `StateChanged`.
/// The `*_transfer` calls perform the network side effects; the owner
/// decides when they run.
pub trait Transferable {
    /// Registration key, unique per engine.
    fn path(&self) -> &str;

    fn state(&self) -> TransferState;

    fn is_valid(&self) -> bool;

    /// Managed transfers wait for the queue to admit them.
    fn add_to_queue(&self) -> bool;

    /// Whether the transfer may use the network right now.
    fn can_transfer(&self) -> bool;

    fn subscribe(&mut self) -> UnboundedReceiver<TransferEvent>;

    fn start(&mut self);
    fn pause(&mut self);
    fn resume(&mut self);
    fn cancel(&mut self);

    fn start_transfer(&mut self);
    fn pause_transfer(&mut self);
    fn resume_transfer(&mut self);
    fn cancel_transfer(&mut self);

    /// Route a reply event. Returns `false` when the owner is unknown here.
    fn handle_reply(&mut self, message: &ReplyMessage) -> bool;

    /// Route a process event. Returns `false` when the owner is unknown here.
    fn handle_process(&mut self, message: &ProcessMessage) -> bool;

    fn set_throttle(&mut self, speed: u64);

    fn allow_gsm_download(&mut self, allowed: bool);

    fn on_online_state_changed(&mut self, online: bool);
}

/// Collaborators a transfer needs, injected at construction.
#[derive(Clone)]
pub struct TransferDeps {
    pub request_factory: Arc<dyn RequestFactory>,
    pub file_manager: Arc<dyn FileManager>,
    pub process_factory: Arc<dyn ProcessFactory>,
    pub network_info: Arc<dyn SystemNetworkInfo>,
    pub hash_factory: Arc<dyn HashFactory>,
    pub filename_mutex: Arc<FileNameMutex>,
}
