//! Several downloads behind one identity.
//!
//! A [`GroupDownload`] owns its member [`Download`]s for its whole lifetime
//! and is all-or-nothing: it finishes once every member finished, fails on
//! the first member error, and a cancel or failure removes the files of the
//! members that had already finished.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::PathBuf;

use downlink_core::ports::{ProcessMessage, ReplyMessage};
use downlink_core::{
    EngineConfig, GroupDownloadStruct, HashAlgorithm, Metadata, TransferEvent, TransferState,
    ValidationError,
};
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;

use crate::download::{Download, DownloadDescriptor};
use crate::events::{EventSink, drain};
use crate::transfer::{TransferDeps, Transferable};

/// Everything needed to create a [`GroupDownload`].
#[derive(Debug, Clone, PartialEq)]
pub struct GroupDownloadDescriptor {
    pub id: String,
    pub path: String,
    pub downloads: Vec<GroupDownloadStruct>,
    /// Checksum algorithm shared by every member.
    pub algorithm: String,
    pub headers: BTreeMap<String, String>,
    pub metadata: Metadata,
    pub confined: bool,
    pub root_path: PathBuf,
    pub throttle: u64,
    pub allow_gsm_download: bool,
    pub temp_suffix: String,
}

impl GroupDownloadDescriptor {
    pub fn new(path: impl Into<String>, downloads: Vec<GroupDownloadStruct>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            path: path.into(),
            downloads,
            algorithm: String::new(),
            headers: BTreeMap::new(),
            metadata: Metadata::new(),
            confined: false,
            root_path: std::env::temp_dir(),
            throttle: 0,
            allow_gsm_download: true,
            temp_suffix: ".tmp".to_string(),
        }
    }

    pub fn from_config(
        path: impl Into<String>,
        downloads: Vec<GroupDownloadStruct>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            confined: config.confined,
            root_path: config.root_path.clone(),
            throttle: config.default_throttle,
            allow_gsm_download: config.allow_gsm_download,
            temp_suffix: config.temp_suffix.clone(),
            ..Self::new(path, downloads)
        }
    }

    #[must_use]
    pub fn with_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.algorithm = algorithm.into();
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_confinement(mut self, confined: bool, root_path: impl Into<PathBuf>) -> Self {
        self.confined = confined;
        self.root_path = root_path.into();
        self
    }

    #[must_use]
    pub const fn with_throttle(mut self, throttle: u64) -> Self {
        self.throttle = throttle;
        self
    }

    #[must_use]
    pub const fn with_allow_gsm_download(mut self, allowed: bool) -> Self {
        self.allow_gsm_download = allowed;
        self
    }
}

struct Member {
    url: String,
    download: Download,
    events: UnboundedReceiver<TransferEvent>,
}

pub struct GroupDownload {
    id: String,
    path: String,
    state: TransferState,
    last_error: Option<ValidationError>,
    allow_gsm: bool,
    members: Vec<Member>,
    finished: Vec<PathBuf>,
    errored: bool,
    deps: TransferDeps,
    events: EventSink<TransferEvent>,
}

impl GroupDownload {
    /// Validate the declared members and create them.
    ///
    /// An invalid group has no members and reports the first problem found
    /// through [`GroupDownload::last_error`].
    pub fn new(descriptor: GroupDownloadDescriptor, deps: TransferDeps) -> Self {
        let mut group = Self {
            id: descriptor.id.clone(),
            path: descriptor.path.clone(),
            state: TransferState::Idle,
            last_error: None,
            allow_gsm: descriptor.allow_gsm_download,
            members: Vec::new(),
            finished: Vec::new(),
            errored: false,
            deps,
            events: EventSink::new(),
        };

        match group.create_members(&descriptor) {
            Ok(members) => {
                tracing::debug!(
                    target: "downlink.group",
                    path = %group.path,
                    members = members.len(),
                    "group created"
                );
                group.members = members;
            }
            Err(err) => {
                tracing::warn!(target: "downlink.group", path = %group.path, error = %err, "invalid group");
                group.last_error = Some(err);
            }
        }
        group
    }

    fn create_members(
        &self,
        descriptor: &GroupDownloadDescriptor,
    ) -> Result<Vec<Member>, ValidationError> {
        if !HashAlgorithm::is_valid(&descriptor.algorithm) {
            return Err(ValidationError::InvalidHashAlgorithm {
                algorithm: descriptor.algorithm.clone(),
            });
        }

        let mut seen = HashSet::new();
        for entry in &descriptor.downloads {
            if entry.url.is_empty() || Url::parse(&entry.url).is_err() {
                return Err(ValidationError::InvalidUrl {
                    url: entry.url.clone(),
                });
            }
            if !seen.insert(entry.local_file.clone()) {
                return Err(ValidationError::DuplicatedLocalPath {
                    path: entry.local_file.clone(),
                });
            }
            if self.deps.file_manager.exists(&entry.local_file) {
                return Err(ValidationError::FileExists {
                    path: entry.local_file.clone(),
                });
            }
        }

        let mut members = Vec::with_capacity(descriptor.downloads.len());
        for (index, entry) in descriptor.downloads.iter().enumerate() {
            let member = DownloadDescriptor::new(
                format!("{}/member/{index}", descriptor.path),
                entry.url.clone(),
            )
            .with_hash(entry.hash.clone(), descriptor.algorithm.clone())
            .with_headers(descriptor.headers.clone())
            .with_metadata(
                descriptor
                    .metadata
                    .clone()
                    .with_local_path(entry.local_file.clone()),
            )
            .with_confinement(descriptor.confined, descriptor.root_path.clone())
            .with_throttle(descriptor.throttle)
            .with_allow_gsm_download(descriptor.allow_gsm_download)
            .with_add_to_queue(false)
            .with_temp_suffix(descriptor.temp_suffix.clone());

            let mut download = Download::new(member, self.deps.clone());
            if let Some(err) = download.last_error() {
                return Err(ValidationError::InvalidMember {
                    url: entry.url.clone(),
                    reason: err.to_string(),
                });
            }
            let events = download.subscribe();
            members.push(Member {
                url: entry.url.clone(),
                download,
                events,
            });
        }
        Ok(members)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub const fn last_error(&self) -> Option<&ValidationError> {
        self.last_error.as_ref()
    }

    pub fn downloads(&self) -> impl Iterator<Item = &Download> {
        self.members.iter().map(|member| &member.download)
    }

    /// Destinations of the members that finished so far.
    pub fn finished_paths(&self) -> &[PathBuf] {
        &self.finished
    }

    /// Sum of the members' on-disk progress.
    pub fn progress(&self) -> u64 {
        self.members.iter().map(|m| m.download.progress()).sum()
    }

    pub fn total_size(&self) -> u64 {
        self.members.iter().map(|m| m.download.total_size()).sum()
    }

    fn set_state(&mut self, state: TransferState) {
        if self.state == state || self.state.is_terminal() {
            return;
        }
        tracing::debug!(
            target: "downlink.group",
            path = %self.path,
            from = %self.state,
            to = %state,
            "state changed"
        );
        self.state = state;
        self.events.emit(TransferEvent::state_changed(state));
    }

    /// Apply `op` to every member still in flight.
    fn for_each_active(&mut self, mut op: impl FnMut(&mut Download)) {
        for member in &mut self.members {
            if !member.download.state().is_terminal() {
                op(&mut member.download);
            }
        }
    }

    /// Cancel unfinished members and delete what finished members produced.
    fn cancel_all(&mut self) {
        self.for_each_active(|download| {
            download.cancel();
            download.cancel_download();
        });

        for path in &self.finished {
            if !self.deps.file_manager.exists(path) {
                continue;
            }
            match self.deps.file_manager.remove(path) {
                Ok(()) => {
                    tracing::debug!(target: "downlink.group", path = %self.path, file = %path.display(), "removed finished member file");
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(target: "downlink.group", path = %self.path, file = %path.display(), error = %err, "could not remove finished member file");
                }
            }
        }
    }

    /// Drain member streams until quiet and fold their events into the
    /// group's own.
    fn pump(&mut self) {
        loop {
            let mut batch = Vec::new();
            for (index, member) in self.members.iter_mut().enumerate() {
                batch.extend(drain(&mut member.events).into_iter().map(|e| (index, e)));
            }
            if batch.is_empty() {
                return;
            }
            for (index, event) in batch {
                self.on_member_event(index, event);
            }
        }
    }

    fn on_member_event(&mut self, index: usize, event: TransferEvent) {
        match event {
            TransferEvent::Progress { .. } => {
                self.events.emit(TransferEvent::Progress {
                    received: self.progress(),
                    total: self.total_size(),
                });
            }
            TransferEvent::Finished { path } => {
                self.finished.push(path);
                if self.finished.len() == self.members.len() && !self.state.is_terminal() {
                    tracing::info!(target: "downlink.group", path = %self.path, "group finished");
                    self.set_state(TransferState::Finish);
                    self.events.emit(TransferEvent::GroupFinished {
                        paths: self.finished.clone(),
                    });
                }
            }
            TransferEvent::Failed { error } if !self.errored => {
                self.events.emit(TransferEvent::MemberFailed {
                    url: self.members[index].url.clone(),
                    error,
                });
            }
            TransferEvent::Error { message } if !self.errored => {
                self.errored = true;
                let url = self.members[index].url.clone();
                tracing::error!(target: "downlink.group", path = %self.path, url = %url, error = %message, "member failed");
                self.cancel_all();
                self.set_state(TransferState::Error);
                self.events.emit(TransferEvent::Error {
                    message: format!("{url}:{message}"),
                });
            }
            _ => {}
        }
    }

    fn route(&mut self, owner: &str, op: impl FnOnce(&mut Download) -> bool) -> bool {
        let handled = self
            .members
            .iter_mut()
            .find(|m| m.download.path() == owner)
            .is_some_and(|m| op(&mut m.download));
        if handled {
            self.pump();
        }
        handled
    }
}

impl Transferable for GroupDownload {
    fn path(&self) -> &str {
        &self.path
    }

    fn state(&self) -> TransferState {
        self.state
    }

    fn is_valid(&self) -> bool {
        self.last_error.is_none()
    }

    fn add_to_queue(&self) -> bool {
        false
    }

    fn can_transfer(&self) -> bool {
        self.is_valid() && self.members.iter().all(|m| m.download.can_transfer())
    }

    fn subscribe(&mut self) -> UnboundedReceiver<TransferEvent> {
        self.events.subscribe()
    }

    fn start(&mut self) {
        self.set_state(TransferState::Start);
        self.for_each_active(Transferable::start);
        self.pump();
    }

    fn pause(&mut self) {
        self.set_state(TransferState::Pause);
        self.for_each_active(Transferable::pause);
        self.pump();
    }

    fn resume(&mut self) {
        self.set_state(TransferState::Resume);
        self.for_each_active(Transferable::resume);
        self.pump();
    }

    fn cancel(&mut self) {
        self.set_state(TransferState::Cancel);
    }

    fn start_transfer(&mut self) {
        if !self.is_valid() {
            self.events.emit(TransferEvent::Started { success: false });
            return;
        }
        if self.members.is_empty() {
            self.events.emit(TransferEvent::Started { success: true });
            self.set_state(TransferState::Finish);
            self.events.emit(TransferEvent::GroupFinished { paths: Vec::new() });
            return;
        }

        tracing::info!(target: "downlink.group", path = %self.path, members = self.members.len(), "starting group");
        self.for_each_active(Download::start_download);
        self.events.emit(TransferEvent::Started { success: true });
        self.pump();
    }

    fn pause_transfer(&mut self) {
        self.for_each_active(|download| {
            if download.state() != TransferState::Idle {
                download.pause_download();
            }
        });
        self.events.emit(TransferEvent::Paused {
            success: self.is_valid(),
        });
        self.pump();
    }

    fn resume_transfer(&mut self) {
        self.for_each_active(|download| {
            if download.state() == TransferState::Resume {
                download.resume_download();
            }
        });
        self.events.emit(TransferEvent::Resumed {
            success: self.is_valid(),
        });
        self.pump();
    }

    fn cancel_transfer(&mut self) {
        tracing::info!(target: "downlink.group", path = %self.path, "canceling group");
        self.cancel_all();
        self.events.emit(TransferEvent::Canceled { success: true });
        self.pump();
    }

    fn handle_reply(&mut self, message: &ReplyMessage) -> bool {
        self.route(&message.owner, |download| download.handle_reply(message))
    }

    fn handle_process(&mut self, message: &ProcessMessage) -> bool {
        self.route(&message.owner, |download| download.handle_process(message))
    }

    fn set_throttle(&mut self, speed: u64) {
        for member in &mut self.members {
            member.download.set_throttle(speed);
        }
    }

    fn allow_gsm_download(&mut self, allowed: bool) {
        if self.allow_gsm != allowed {
            self.allow_gsm = allowed;
            self.events.emit(TransferEvent::state_changed(self.state));
        }
        for member in &mut self.members {
            member.download.allow_gsm_download(allowed);
        }
        self.pump();
    }

    fn on_online_state_changed(&mut self, online: bool) {
        for member in &mut self.members {
            member.download.on_online_state_changed(online);
        }
        self.pump();
    }
}

impl std::fmt::Debug for GroupDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupDownload")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("state", &self.state)
            .field("members", &self.members.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
