//! Single-file download state machine.
//!
//! A [`Download`] drives one URL into one destination file. It never spawns
//! anything on its own: requests, file handles and processes come from the
//! injected collaborators, and their notifications are fed back in through
//! [`Download::on_reply_event`] and [`Download::on_process_event`] by the
//! owner running the serialization point.
//!
//! # Exchanges
//!
//! Every request issued (first start, resume, redirect hop, reconnect)
//! opens a new exchange with a fresh id. Reply events carrying any other id
//! are stale and ignored. The announced total size is fixed by the first
//! progress callback that reports one and only resets across a redirect.
//!
//! # Staging
//!
//! Bytes land in `<destination><temp suffix>` and are renamed to the final
//! destination once the transfer is verified (before a post-download command
//! runs, or on finish).

mod naming;
mod request;


use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use downlink_core::errors::{AuthErrorKind, NetworkErrorCode, ProcessFailure};
use downlink_core::ports::{
    ExitStatus, File, NetworkReply, OpenMode, Process, ProcessEvent, ProcessMessage, ReplyEvent,
    ReplyMessage, SslError,
};
use downlink_core::{
    EngineConfig, HashAlgorithm, Metadata, SetupError, TransferError, TransferEvent, TransferState,
    ValidationError,
};
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;

use crate::events::EventSink;
use crate::transfer::{TransferDeps, Transferable};

const HASH_CHUNK_SIZE: usize = 64 * 1024;
const CONTENT_DISPOSITION_HEADER: &str = "Content-Disposition";

/// Everything needed to create a [`Download`].
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadDescriptor {
    pub id: String,
    /// Registration key (e.g. the object path handed to clients).
    pub path: String,
    pub url: String,
    /// Expected checksum, empty for none.
    pub hash: String,
    /// Checksum algorithm name, empty for the default.
    pub algorithm: String,
    pub headers: BTreeMap<String, String>,
    pub metadata: Metadata,
    pub confined: bool,
    pub root_path: PathBuf,
    pub throttle: u64,
    pub allow_gsm_download: bool,
    pub add_to_queue: bool,
    pub temp_suffix: String,
}

impl DownloadDescriptor {
    pub fn new(path: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            path: path.into(),
            url: url.into(),
            hash: String::new(),
            algorithm: String::new(),
            headers: BTreeMap::new(),
            metadata: Metadata::new(),
            confined: false,
            root_path: std::env::temp_dir(),
            throttle: 0,
            allow_gsm_download: true,
            add_to_queue: true,
            temp_suffix: ".tmp".to_string(),
        }
    }

    /// Start from the engine-wide defaults.
    pub fn from_config(path: impl Into<String>, url: impl Into<String>, config: &EngineConfig) -> Self {
        Self {
            confined: config.confined,
            root_path: config.root_path.clone(),
            throttle: config.default_throttle,
            allow_gsm_download: config.allow_gsm_download,
            temp_suffix: config.temp_suffix.clone(),
            ..Self::new(path, url)
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_hash(mut self, hash: impl Into<String>, algorithm: impl Into<String>) -> Self {
        self.hash = hash.into();
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

    #[must_use]
    pub const fn with_add_to_queue(mut self, add_to_queue: bool) -> Self {
        self.add_to_queue = add_to_queue;
        self
    }

    #[must_use]
    pub fn with_temp_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.temp_suffix = suffix.into();
        self
    }
}

pub struct Download {
    id: String,
    path: String,
    url: String,
    hash: String,
    algorithm: HashAlgorithm,
    headers: BTreeMap<String, String>,
    metadata: Metadata,
    confined: bool,
    throttle: u64,
    allow_gsm: bool,
    add_to_queue: bool,
    state: TransferState,
    last_error: Option<ValidationError>,

    file_path: PathBuf,
    temp_file_path: PathBuf,
    temp_suffix: String,
    name_locked: bool,
    committed: bool,

    exchange: u64,
    total_size: Option<u64>,
    progress: u64,
    reply: Option<Box<dyn NetworkReply>>,
    current_data: Option<Box<dyn File>>,
    process: Option<Box<dyn Process>>,
    visited_urls: HashSet<String>,
    downloading: bool,
    connected: bool,

    deps: TransferDeps,
    events: EventSink<TransferEvent>,
}

impl Download {
    /// Create a download and reserve its destination.
    ///
    /// Construction never fails; a rejected descriptor yields a download
    /// with `is_valid() == false` and the reason in [`Download::last_error`].
    pub fn new(descriptor: DownloadDescriptor, deps: TransferDeps) -> Self {
        let DownloadDescriptor {
            id,
            path,
            url,
            hash,
            algorithm,
            headers,
            metadata,
            confined,
            root_path,
            throttle,
            allow_gsm_download,
            add_to_queue,
            temp_suffix,
        } = descriptor;

        let mut last_error = None;

        let parsed = Url::parse(&url).ok();
        if parsed.is_none() {
            last_error = Some(ValidationError::InvalidUrl { url: url.clone() });
        }

        let parsed_algorithm = HashAlgorithm::parse(&algorithm);
        if parsed_algorithm.is_none() && !hash.is_empty() && last_error.is_none() {
            last_error = Some(ValidationError::InvalidHashAlgorithm {
                algorithm: algorithm.clone(),
            });
        }

        let basename = parsed
            .as_ref()
            .and_then(naming::basename_from_url)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let local_path = metadata.local_path().filter(|_| !confined);
        let mut name_locked = false;
        let file_path = match local_path {
            Some(local) if local.exists() => {
                if last_error.is_none() {
                    last_error = Some(ValidationError::FileExists { path: local.clone() });
                }
                local
            }
            Some(local) if last_error.is_none() => {
                name_locked = true;
                deps.filename_mutex.lock_file_name(&local)
            }
            Some(local) => local,
            None if last_error.is_none() => {
                name_locked = true;
                deps.filename_mutex.lock_file_name(&root_path.join(&basename))
            }
            None => root_path.join(&basename),
        };
        let temp_file_path = naming::temp_path(&file_path, &temp_suffix);
        let connected = deps.network_info.is_online();

        if let Some(err) = &last_error {
            tracing::warn!(target: "downlink.download", path = %path, error = %err, "invalid download");
        } else {
            tracing::debug!(
                target: "downlink.download",
                path = %path,
                url = %url,
                file = %file_path.display(),
                "download created"
            );
        }

        Self {
            id,
            path,
            url,
            hash,
            algorithm: parsed_algorithm.unwrap_or_default(),
            headers,
            metadata,
            confined,
            throttle,
            allow_gsm: allow_gsm_download,
            add_to_queue,
            state: TransferState::Idle,
            last_error,
            file_path,
            temp_file_path,
            temp_suffix,
            name_locked,
            committed: false,
            exchange: 0,
            total_size: None,
            progress: 0,
            reply: None,
            current_data: None,
            process: None,
            visited_urls: HashSet::new(),
            downloading: false,
            connected,
            deps,
            events: EventSink::new(),
        }
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn temp_file_path(&self) -> &Path {
        &self.temp_file_path
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub const fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub const fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub const fn is_confined(&self) -> bool {
        self.confined
    }

    pub const fn throttle(&self) -> u64 {
        self.throttle
    }

    pub const fn is_gsm_download_allowed(&self) -> bool {
        self.allow_gsm
    }

    /// Bytes written to disk so far.
    pub const fn progress(&self) -> u64 {
        self.progress
    }

    /// Total announced by the current exchange, 0 while unknown.
    pub fn total_size(&self) -> u64 {
        self.total_size.unwrap_or(0)
    }

    /// Id of the exchange replies must carry to be accepted.
    pub const fn exchange(&self) -> u64 {
        self.exchange
    }

    pub const fn is_downloading(&self) -> bool {
        self.downloading
    }

    pub const fn last_error(&self) -> Option<&ValidationError> {
        self.last_error.as_ref()
    }

    /// Metered-network policy check.
    pub fn can_download(&self) -> bool {
        let mode = self.deps.network_info.current_network_mode();
        mode.is_unmetered() || (mode.is_metered() && self.allow_gsm)
    }

    // ── Configuration ──────────────────────────────────────────────

    /// Move the destination into `dir`. Only allowed before the first start.
    pub fn set_destination_dir(&mut self, dir: &Path) -> Result<(), SetupError> {
        if self.state != TransferState::Idle {
            return Err(SetupError::AlreadyStarted { state: self.state });
        }
        if !dir.is_absolute() {
            return Err(SetupError::RelativePath {
                path: dir.to_path_buf(),
            });
        }
        if !dir.exists() {
            return Err(SetupError::NotFound {
                path: dir.to_path_buf(),
            });
        }
        if !dir.is_dir() {
            return Err(SetupError::NotADirectory {
                path: dir.to_path_buf(),
            });
        }

        let name = self
            .file_path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        self.release_name();
        self.file_path = self.deps.filename_mutex.lock_file_name(&dir.join(name));
        self.name_locked = true;
        self.temp_file_path = naming::temp_path(&self.file_path, &self.temp_suffix);
        Ok(())
    }

    /// Replace the caller headers. Only allowed before the first start.
    pub fn set_headers(&mut self, headers: BTreeMap<String, String>) -> Result<(), SetupError> {
        if self.state != TransferState::Idle {
            return Err(SetupError::AlreadyStarted { state: self.state });
        }
        self.headers = headers;
        Ok(())
    }

    // ── State-only operations ──────────────────────────────────────

    fn set_state(&mut self, state: TransferState) {
        if self.state == state {
            return;
        }
        if self.state.is_terminal() {
            tracing::debug!(
                target: "downlink.download",
                path = %self.path,
                from = %self.state,
                to = %state,
                "ignoring transition out of terminal state"
            );
            return;
        }
        tracing::debug!(
            target: "downlink.download",
            path = %self.path,
            from = %self.state,
            to = %state,
            "state changed"
        );
        self.state = state;
        self.events.emit(TransferEvent::state_changed(state));
    }

    // ── Network operations ─────────────────────────────────────────

    /// Open the first exchange. Repeated calls never issue a second request.
    pub fn start_download(&mut self) {
        if self.reply.is_some() {
            self.events.emit(TransferEvent::Started { success: true });
            return;
        }
        if !self.is_valid() {
            self.events.emit(TransferEvent::Started { success: false });
            return;
        }
        // a start after a pause continues the partial file instead of
        // appending a second copy of the body to it
        let offset = self
            .current_data
            .as_ref()
            .map(|file| file.size())
            .filter(|size| *size > 0);
        if offset.is_none() {
            if let Err(err) = self.open_current_data(true) {
                self.events.emit(TransferEvent::Started { success: false });
                self.fail(TransferError::from_io_error(&err));
                return;
            }
        }

        tracing::info!(target: "downlink.download", path = %self.path, url = %self.url, ?offset, "starting download");
        self.issue_request(offset);
        self.events.emit(TransferEvent::Started { success: true });
    }

    /// Abort the live exchange, keeping every byte already received.
    pub fn pause_download(&mut self) {
        let Some(mut reply) = self.reply.take() else {
            self.events.emit(TransferEvent::Paused { success: false });
            return;
        };

        reply.abort();
        let data = reply.read_all();
        drop(reply);
        self.downloading = false;

        if !self.persist(&data) {
            self.events.emit(TransferEvent::Paused { success: false });
            return;
        }

        tracing::info!(
            target: "downlink.download",
            path = %self.path,
            offset = self.progress,
            "download paused"
        );
        self.events.emit(TransferEvent::Paused { success: true });
    }

    /// Continue from the bytes already on disk with a range request.
    pub fn resume_download(&mut self) {
        if self.reply.is_some() {
            self.events.emit(TransferEvent::Resumed { success: false });
            return;
        }
        if !self.is_valid() {
            self.events.emit(TransferEvent::Resumed { success: false });
            return;
        }

        let offset = match self.current_data.as_ref() {
            Some(file) => Some(file.size()),
            None => {
                if let Err(err) = self.open_current_data(true) {
                    self.events.emit(TransferEvent::Resumed { success: false });
                    self.fail(TransferError::from_io_error(&err));
                    return;
                }
                None
            }
        };

        tracing::info!(target: "downlink.download", path = %self.path, ?offset, "resuming download");
        self.issue_request(offset);
        self.events.emit(TransferEvent::Resumed { success: true });
    }

    /// Abort everything in flight and discard partial data.
    pub fn cancel_download(&mut self) {
        if let Some(mut reply) = self.reply.take() {
            reply.abort();
        }
        if let Some(mut process) = self.process.take() {
            process.kill();
        }
        self.remove_partial_files();
        self.release_name();
        self.downloading = false;
        self.visited_urls.clear();

        tracing::info!(target: "downlink.download", path = %self.path, "download canceled");
        self.events.emit(TransferEvent::Canceled { success: true });
    }

    pub fn set_throttle(&mut self, speed: u64) {
        if self.throttle == speed {
            return;
        }
        self.throttle = speed;
        if let Some(reply) = self.reply.as_mut() {
            reply.set_read_buffer_size(speed);
        }
    }

    /// Toggle the metered-network permission.
    pub fn allow_gsm_download(&mut self, allowed: bool) {
        if self.allow_gsm == allowed {
            return;
        }
        self.allow_gsm = allowed;
        self.events.emit(TransferEvent::state_changed(self.state));
    }

    /// Connectivity changed: park the exchange while offline, reconnect
    /// with a range request when back online.
    pub fn on_online_state_changed(&mut self, online: bool) {
        self.connected = online;

        if !online {
            if let Some(mut reply) = self.reply.take() {
                reply.abort();
                let data = reply.read_all();
                drop(reply);
                if self.persist(&data) {
                    tracing::info!(target: "downlink.download", path = %self.path, "offline, exchange parked");
                }
            }
            return;
        }

        if self.downloading && self.reply.is_none() && self.state.is_running() {
            let offset = self.current_data.as_ref().map(|file| file.size());
            tracing::info!(target: "downlink.download", path = %self.path, ?offset, "online again, reconnecting");
            self.issue_request(offset);
        }
    }

    // ── Reply handling ─────────────────────────────────────────────

    /// Feed a notification from the reply of exchange `exchange`.
    pub fn on_reply_event(&mut self, exchange: u64, event: ReplyEvent) {
        if exchange != self.exchange || self.reply.is_none() {
            tracing::debug!(
                target: "downlink.download",
                path = %self.path,
                exchange,
                current = self.exchange,
                "dropping stale reply event"
            );
            return;
        }

        match event {
            ReplyEvent::DownloadProgress { total, .. } => self.on_download_progress(total),
            ReplyEvent::Finished => self.on_finished(),
            ReplyEvent::Error(code) => self.on_error(code),
            ReplyEvent::SslErrors(errors) => self.on_ssl_errors(errors),
        }
    }

    fn on_download_progress(&mut self, total: Option<u64>) {
        let data = self.reply.as_mut().map(|r| r.read_all()).unwrap_or_default();
        if !self.persist(&data) {
            return;
        }

        let received = self.progress;
        let total = match total {
            None => received,
            Some(announced) => *self.total_size.get_or_insert(announced),
        };
        self.events.emit(TransferEvent::Progress { received, total });
    }

    fn on_finished(&mut self) {
        let Some(reply) = self.reply.as_mut() else {
            return;
        };
        let status = reply.status_code();
        let redirect = reply.redirect_target().filter(|t| !t.is_empty());
        let disposition = reply.raw_header(CONTENT_DISPOSITION_HEADER);

        if let Some(target) = redirect {
            self.on_redirect(&target);
            return;
        }

        if let Some(status) = status.filter(|s| !(200..300).contains(s)) {
            let reason = reply.reason_phrase().unwrap_or_default();
            self.fail(TransferError::http(status, reason));
            return;
        }

        let data = reply.read_all();
        if !self.persist(&data) {
            return;
        }
        self.reply = None;

        if let Some(header) = disposition {
            self.apply_content_disposition(&header);
        }
        self.on_download_completed();
    }

    fn on_redirect(&mut self, target: &str) {
        let target = Url::parse(&self.url)
            .and_then(|base| base.join(target))
            .map_or_else(|_| target.to_string(), String::from);

        if target == self.url || self.visited_urls.contains(&target) {
            tracing::warn!(target: "downlink.download", path = %self.path, url = %target, "redirect loop");
            self.fail(TransferError::network(
                NetworkErrorCode::ContentNotFound,
                format!("Redirect loop detected: {target}"),
            ));
            return;
        }

        tracing::debug!(
            target: "downlink.download",
            path = %self.path,
            from = %self.url,
            to = %target,
            "following redirect"
        );
        let previous = std::mem::replace(&mut self.url, target);
        self.visited_urls.insert(previous);
        self.reply = None;

        // the name stays reserved across the hop, only the bytes go
        self.discard_current_data();
        self.total_size = None;

        if let Err(err) = self.open_current_data(true) {
            self.fail(TransferError::from_io_error(&err));
            return;
        }
        self.issue_request(None);
    }

    fn on_error(&mut self, code: NetworkErrorCode) {
        let Some(reply) = self.reply.as_ref() else {
            return;
        };

        let error = match reply.status_code() {
            Some(status) if status >= 300 => {
                TransferError::http(status, reply.reason_phrase().unwrap_or_default())
            }
            _ => match code {
                NetworkErrorCode::AuthenticationRequired => {
                    TransferError::auth(AuthErrorKind::Server, reply.error_string())
                }
                NetworkErrorCode::ProxyAuthenticationRequired => {
                    TransferError::auth(AuthErrorKind::Proxy, reply.error_string())
                }
                other => TransferError::network(other, reply.error_string()),
            },
        };
        self.fail(error);
    }

    fn on_ssl_errors(&mut self, errors: Vec<SslError>) {
        let ignorable = self
            .reply
            .as_ref()
            .is_some_and(|reply| reply.can_ignore_ssl_errors(&errors));
        if ignorable {
            tracing::debug!(target: "downlink.download", path = %self.path, "ignoring allowed ssl errors");
            return;
        }
        self.downloading = false;
        self.fail(TransferError::Ssl { errors });
    }

    // ── Completion ─────────────────────────────────────────────────

    fn apply_content_disposition(&mut self, header: &str) {
        if !self.confined && self.metadata.has_local_path() {
            return;
        }
        let Some(name) = naming::filename_from_content_disposition(header) else {
            return;
        };
        if self.file_path.file_name().is_some_and(|current| current == name.as_str()) {
            return;
        }

        let desired = self.file_path.with_file_name(&name);
        let assigned = self.deps.filename_mutex.lock_file_name(&desired);
        self.release_name();
        tracing::debug!(
            target: "downlink.download",
            path = %self.path,
            file = %assigned.display(),
            "destination renamed by server"
        );
        self.file_path = assigned;
        self.name_locked = true;
    }

    fn on_download_completed(&mut self) {
        if !self.hash.is_empty() {
            self.events.emit(TransferEvent::Processing {
                path: self.file_path.clone(),
            });
            match self.compute_hash() {
                Ok(actual) if actual.eq_ignore_ascii_case(&self.hash) => {
                    tracing::debug!(target: "downlink.download", path = %self.path, "checksum verified");
                }
                Ok(actual) => {
                    let error =
                        TransferError::hash_mismatch(self.algorithm.as_str(), &self.hash, actual);
                    self.fail(error);
                    return;
                }
                Err(err) => {
                    self.fail(TransferError::from_io_error(&err));
                    return;
                }
            }
        }

        if let Some(command) = self.metadata.command() {
            if self.hash.is_empty() {
                self.events.emit(TransferEvent::Processing {
                    path: self.file_path.clone(),
                });
            }
            self.run_command(&command);
            return;
        }

        self.emit_finished();
    }

    fn compute_hash(&mut self) -> io::Result<String> {
        let file = self
            .current_data
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no data to verify"))?;
        file.flush()?;
        file.reset()?;

        let mut hasher = self.deps.hash_factory.create_hash(self.algorithm);
        let mut buf = vec![0u8; HASH_CHUNK_SIZE];
        loop {
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.add_data(&buf[..read]);
        }
        Ok(hasher.hex_digest())
    }

    fn run_command(&mut self, command: &[String]) {
        let Some((program, args)) = command.split_first() else {
            self.fail(TransferError::command("post-download command is empty"));
            return;
        };
        if let Err(err) = self.commit_file() {
            self.fail(TransferError::from_io_error(&err));
            return;
        }

        // only a whole `$file` argument is substituted
        let file = self.file_path.to_string_lossy();
        let args: Vec<String> = args
            .iter()
            .map(|arg| {
                if arg == downlink_core::metadata::COMMAND_FILE_KEY {
                    file.to_string()
                } else {
                    arg.clone()
                }
            })
            .collect();

        tracing::info!(target: "downlink.download", path = %self.path, program = %program, ?args, "running post-download command");
        let mut process = self.deps.process_factory.create_process(&self.path);
        process.start(program, &args);
        self.process = Some(process);
    }

    /// Feed the outcome of the post-download command.
    pub fn on_process_event(&mut self, event: ProcessEvent) {
        let Some(mut process) = self.process.take() else {
            return;
        };

        let (failure, exit_code) = match event {
            ProcessEvent::Finished {
                exit_code: 0,
                status: ExitStatus::Normal,
            } => {
                self.emit_finished();
                // the command took ownership of the file
                if let Err(err) = self.deps.file_manager.remove(&self.file_path) {
                    if err.kind() != io::ErrorKind::NotFound {
                        tracing::warn!(target: "downlink.download", path = %self.path, error = %err, "could not remove processed file");
                    }
                }
                self.committed = false;
                return;
            }
            ProcessEvent::Finished {
                exit_code,
                status: ExitStatus::Crash,
            } => (ProcessFailure::Crashed, exit_code),
            ProcessEvent::Finished { exit_code, .. } => (ProcessFailure::ErrorInProcess, exit_code),
            ProcessEvent::Error(code) => (code.into(), -1),
        };

        let error = TransferError::Process {
            failure,
            exit_code,
            standard_output: process.read_all_standard_output(),
            standard_error: process.read_all_standard_error(),
        };
        self.fail(error);
    }

    fn emit_finished(&mut self) {
        self.reply = None;
        if let Err(err) = self.commit_file() {
            self.fail(TransferError::from_io_error(&err));
            return;
        }
        self.downloading = false;
        self.release_name();
        self.visited_urls.clear();
        self.set_state(TransferState::Finish);

        tracing::info!(target: "downlink.download", path = %self.path, file = %self.file_path.display(), "download finished");
        self.events.emit(TransferEvent::Finished {
            path: self.file_path.clone(),
        });
    }

    /// Fatal error: drop everything, release the name and publish both the
    /// specific and the generic error.
    fn fail(&mut self, error: TransferError) {
        let message = error.generic_message();
        tracing::error!(target: "downlink.download", path = %self.path, error = %error, "download failed");

        self.events.emit(TransferEvent::Failed { error });
        if let Some(mut reply) = self.reply.take() {
            reply.abort();
        }
        self.process = None;
        self.remove_partial_files();
        self.release_name();
        self.downloading = false;
        self.visited_urls.clear();
        self.set_state(TransferState::Error);
        self.events.emit(TransferEvent::Error { message });
    }

    // ── File plumbing ──────────────────────────────────────────────

    fn open_current_data(&mut self, fresh: bool) -> io::Result<()> {
        if self.current_data.is_some() {
            return Ok(());
        }
        if fresh && self.deps.file_manager.exists(&self.temp_file_path) {
            self.deps.file_manager.remove(&self.temp_file_path)?;
        }
        let mut file = self.deps.file_manager.create_file(&self.temp_file_path);
        file.open(OpenMode::Append)?;
        self.progress = file.size();
        self.current_data = Some(file);
        Ok(())
    }

    /// Append and flush. A failure is fatal and reported before returning
    /// `false`.
    fn persist(&mut self, data: &[u8]) -> bool {
        let result = match self.current_data.as_mut() {
            Some(file) => file.write(data).and_then(|()| file.flush()).map(|()| file.size()),
            None => Ok(self.progress),
        };
        match result {
            Ok(size) => {
                self.progress = size;
                true
            }
            Err(err) => {
                self.fail(TransferError::from_io_error(&err));
                false
            }
        }
    }

    fn issue_request(&mut self, resume_from: Option<u64>) {
        self.exchange += 1;
        let request =
            request::build_request(&self.url, &self.headers, &self.path, self.exchange, resume_from);
        let mut reply = self.deps.request_factory.get(request);
        reply.set_read_buffer_size(self.throttle);
        self.reply = Some(reply);
        self.downloading = true;
    }

    fn commit_file(&mut self) -> io::Result<()> {
        if self.committed {
            return Ok(());
        }
        if let Some(mut file) = self.current_data.take() {
            file.close();
        }
        self.deps
            .file_manager
            .rename(&self.temp_file_path, &self.file_path)?;
        self.committed = true;
        Ok(())
    }

    fn discard_current_data(&mut self) {
        if let Some(mut file) = self.current_data.take() {
            file.close();
            if let Err(err) = file.remove() {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(target: "downlink.download", path = %self.path, error = %err, "could not remove partial file");
                }
            }
        }
        self.progress = 0;
    }

    fn remove_partial_files(&mut self) {
        self.discard_current_data();
        if self.committed {
            if let Err(err) = self.deps.file_manager.remove(&self.file_path) {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(target: "downlink.download", path = %self.path, error = %err, "could not remove file");
                }
            }
            self.committed = false;
        }
    }

    fn release_name(&mut self) {
        if self.name_locked {
            self.deps.filename_mutex.unlock_file_name(&self.file_path);
            self.name_locked = false;
        }
    }
}

impl Transferable for Download {
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
        self.add_to_queue
    }

    fn can_transfer(&self) -> bool {
        self.is_valid() && self.connected && self.can_download()
    }

    fn subscribe(&mut self) -> UnboundedReceiver<TransferEvent> {
        self.events.subscribe()
    }

    fn start(&mut self) {
        self.set_state(TransferState::Start);
    }

    fn pause(&mut self) {
        self.set_state(TransferState::Pause);
    }

    fn resume(&mut self) {
        self.set_state(TransferState::Resume);
    }

    fn cancel(&mut self) {
        self.set_state(TransferState::Cancel);
    }

    fn start_transfer(&mut self) {
        self.start_download();
    }

    fn pause_transfer(&mut self) {
        self.pause_download();
    }

    fn resume_transfer(&mut self) {
        self.resume_download();
    }

    fn cancel_transfer(&mut self) {
        self.cancel_download();
    }

    fn handle_reply(&mut self, message: &ReplyMessage) -> bool {
        if message.owner != self.path {
            return false;
        }
        self.on_reply_event(message.exchange, message.event.clone());
        true
    }

    fn handle_process(&mut self, message: &ProcessMessage) -> bool {
        if message.owner != self.path {
            return false;
        }
        self.on_process_event(message.event);
        true
    }

    fn set_throttle(&mut self, speed: u64) {
        Self::set_throttle(self, speed);
    }

    fn allow_gsm_download(&mut self, allowed: bool) {
        Self::allow_gsm_download(self, allowed);
    }

    fn on_online_state_changed(&mut self, online: bool) {
        Self::on_online_state_changed(self, online);
    }
}

impl Drop for Download {
    fn drop(&mut self) {
        self.release_name();
    }
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("url", &self.url)
            .field("state", &self.state)
            .field("file_path", &self.file_path)
            .field("exchange", &self.exchange)
            .finish_non_exhaustive()
    }
}
