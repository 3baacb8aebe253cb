//! Shared fixtures for the engine's unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use downlink_core::ports::{
    FileManager, MockNetworkReply, MockProcessFactory, MockRequestFactory, NetworkReply,
    ProcessFactory, Request,
};
use downlink_core::{NetworkMode, TransferEvent};
use downlink_system::{DigestHashFactory, FsFileManager, StaticNetworkInfo};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::download::{Download, DownloadDescriptor};
use crate::filename_mutex::FileNameMutex;
use crate::transfer::{TransferDeps, Transferable};

pub const HELLO_MD5: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";

/// Script for one mocked reply.
#[derive(Clone, Default)]
pub struct ReplyScript {
    /// Returned one per `read_all` call, then empty.
    pub chunks: Vec<Vec<u8>>,
    pub status: Option<u16>,
    pub reason: Option<String>,
    pub redirect: Option<String>,
    pub content_disposition: Option<String>,
    pub ignore_ssl: bool,
    pub aborts: Option<usize>,
    pub buffer_sizes: Option<Arc<Mutex<Vec<u64>>>>,
}

impl ReplyScript {
    pub fn ok(body: &[u8]) -> Self {
        Self {
            chunks: vec![body.to_vec()],
            status: Some(200),
            reason: Some("OK".to_string()),
            ..Self::default()
        }
    }

    pub fn chunked(chunks: &[&[u8]]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_vec()).collect(),
            ..Self::ok(b"")
        }
    }

    pub fn redirect(target: &str) -> Self {
        Self {
            chunks: Vec::new(),
            status: Some(302),
            reason: Some("Found".to_string()),
            redirect: Some(target.to_string()),
            ..Self::default()
        }
    }

    pub fn status(status: u16, reason: &str) -> Self {
        Self {
            status: Some(status),
            reason: Some(reason.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_aborts(mut self, times: usize) -> Self {
        self.aborts = Some(times);
        self
    }

    #[must_use]
    pub fn with_content_disposition(mut self, header: &str) -> Self {
        self.content_disposition = Some(header.to_string());
        self
    }

    #[must_use]
    pub const fn with_ignore_ssl(mut self, ignore: bool) -> Self {
        self.ignore_ssl = ignore;
        self
    }

    #[must_use]
    pub fn with_buffer_sizes(mut self, sink: Arc<Mutex<Vec<u64>>>) -> Self {
        self.buffer_sizes = Some(sink);
        self
    }
}

pub fn mock_reply(script: ReplyScript) -> MockNetworkReply {
    let mut reply = MockNetworkReply::new();

    let chunks = Arc::new(Mutex::new(VecDeque::from(script.chunks)));
    reply
        .expect_read_all()
        .returning(move || chunks.lock().unwrap().pop_front().unwrap_or_default());
    reply.expect_status_code().return_const(script.status);
    reply.expect_reason_phrase().return_const(script.reason);
    reply.expect_redirect_target().return_const(script.redirect);
    let disposition = script.content_disposition;
    reply.expect_raw_header().returning(move |name| {
        if name.eq_ignore_ascii_case("content-disposition") {
            disposition.clone()
        } else {
            None
        }
    });
    reply
        .expect_error_string()
        .return_const("Connection closed".to_string());
    reply
        .expect_can_ignore_ssl_errors()
        .return_const(script.ignore_ssl);
    match script.aborts {
        Some(times) => {
            reply.expect_abort().times(times).return_const(());
        }
        None => {
            reply.expect_abort().return_const(());
        }
    }
    match script.buffer_sizes {
        Some(sink) => {
            reply
                .expect_set_read_buffer_size()
                .returning(move |size| sink.lock().unwrap().push(size));
        }
        None => {
            reply.expect_set_read_buffer_size().return_const(());
        }
    }
    reply
}

/// Temp directory plus scripted collaborators.
pub struct Fixture {
    pub dir: TempDir,
    pub mutex: Arc<FileNameMutex>,
    requests: Arc<Mutex<Vec<Request>>>,
    replies: Arc<Mutex<VecDeque<Box<dyn NetworkReply>>>>,
    network: Arc<StaticNetworkInfo>,
    process_factory: Arc<dyn ProcessFactory>,
    file_manager: Arc<dyn FileManager>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            mutex: Arc::new(FileNameMutex::new()),
            requests: Arc::new(Mutex::new(Vec::new())),
            replies: Arc::new(Mutex::new(VecDeque::new())),
            network: Arc::new(StaticNetworkInfo::new(true, NetworkMode::Wlan)),
            process_factory: Arc::new(MockProcessFactory::new()),
            file_manager: Arc::new(FsFileManager::new()),
        }
    }

    #[must_use]
    pub fn with_network_mode(self, mode: NetworkMode) -> Self {
        self.set_network_mode(mode);
        self
    }

    /// Switch the bearer seen by every transfer built from this fixture.
    pub fn set_network_mode(&self, mode: NetworkMode) {
        self.network.set_network_mode(mode);
    }

    #[must_use]
    pub fn with_process_factory(mut self, factory: MockProcessFactory) -> Self {
        self.process_factory = Arc::new(factory);
        self
    }

    #[must_use]
    pub fn with_file_manager(mut self, manager: impl FileManager + 'static) -> Self {
        self.file_manager = Arc::new(manager);
        self
    }

    /// Queue the reply handed out by the next `get`.
    pub fn push_reply(&self, script: ReplyScript) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Box::new(mock_reply(script)));
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn deps(&self) -> TransferDeps {
        let mut factory = MockRequestFactory::new();
        let requests = Arc::clone(&self.requests);
        let replies = Arc::clone(&self.replies);
        factory.expect_get().returning(move |request| {
            requests.lock().unwrap().push(request);
            replies
                .lock()
                .unwrap()
                .pop_front()
                .expect("request issued without a scripted reply")
        });

        TransferDeps {
            request_factory: Arc::new(factory),
            file_manager: Arc::clone(&self.file_manager),
            process_factory: Arc::clone(&self.process_factory),
            network_info: self.network.clone(),
            hash_factory: Arc::new(DigestHashFactory::new()),
            filename_mutex: Arc::clone(&self.mutex),
        }
    }

    /// Unconfined descriptor writing `name` into the fixture directory.
    pub fn descriptor(&self, path: &str, name: &str) -> DownloadDescriptor {
        DownloadDescriptor::new(path, format!("http://example.com/{name}"))
            .with_confinement(false, self.dir.path())
    }

    pub fn download(
        &self,
        descriptor: DownloadDescriptor,
    ) -> (Download, UnboundedReceiver<TransferEvent>) {
        let mut download = Download::new(descriptor, self.deps());
        let rx = download.subscribe();
        (download, rx)
    }
}

pub fn count(events: &[TransferEvent], pred: impl Fn(&TransferEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

pub fn errors(events: &[TransferEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::Error { message } => Some(message.clone()),
            _ => None,
        })
        .collect()
}
