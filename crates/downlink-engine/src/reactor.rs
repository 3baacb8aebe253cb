//! The serialization point.
//!
//! A single task owns the [`Queue`] and every registered [`GroupDownload`].
//! Client commands, reply notifications from the HTTP adapter and process
//! notifications from the subprocess adapter all arrive over channels and
//! are applied one at a time, so no two transitions of the same transfer
//! ever overlap. Everything the transfers publish is re-broadcast to
//! subscribers as [`ReactorEvent`]s.

use downlink_core::ports::{ProcessMessage, ReplyMessage};
use downlink_core::{NetworkMode, TransferEvent, TransferState};
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use crate::download::{Download, DownloadDescriptor};
use crate::error::EngineError;
use crate::events::drain;
use crate::group::{GroupDownload, GroupDownloadDescriptor};
use crate::queue::{Queue, QueueEvent};
use crate::transfer::{TransferDeps, Transferable};

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 1024;

/// Something observable happened inside the reactor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ReactorEvent {
    Queue(QueueEvent),
    GroupAdded { path: String },
    Group { path: String, event: TransferEvent },
    GroupRemoved { path: String },
}

type Responder = oneshot::Sender<Result<(), EngineError>>;

/// Requests accepted by the reactor task.
#[derive(Debug)]
enum Command {
    AddDownload {
        descriptor: Box<DownloadDescriptor>,
        respond_to: Responder,
    },
    AddGroup {
        descriptor: Box<GroupDownloadDescriptor>,
        respond_to: Responder,
    },
    Start { path: String, respond_to: Responder },
    Pause { path: String, respond_to: Responder },
    Resume { path: String, respond_to: Responder },
    Cancel { path: String, respond_to: Responder },
    SetThrottle {
        path: String,
        speed: u64,
        respond_to: Responder,
    },
    AllowGsmDownload { allowed: bool, respond_to: Responder },
    OnlineChanged { online: bool, respond_to: Responder },
    NetworkModeChanged {
        mode: NetworkMode,
        respond_to: Responder,
    },
}

struct GroupEntry {
    group: GroupDownload,
    events: UnboundedReceiver<TransferEvent>,
}

/// Cloneable client side of a running reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ReactorEvent>,
    cancel: CancellationToken,
}

impl ReactorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ReactorEvent> {
        self.events.subscribe()
    }

    pub async fn add_download(&self, descriptor: DownloadDescriptor) -> Result<(), EngineError> {
        self.request(|respond_to| Command::AddDownload {
            descriptor: Box::new(descriptor),
            respond_to,
        })
        .await
    }

    pub async fn add_group(&self, descriptor: GroupDownloadDescriptor) -> Result<(), EngineError> {
        self.request(|respond_to| Command::AddGroup {
            descriptor: Box::new(descriptor),
            respond_to,
        })
        .await
    }

    pub async fn start(&self, path: impl Into<String>) -> Result<(), EngineError> {
        let path = path.into();
        self.request(|respond_to| Command::Start { path, respond_to })
            .await
    }

    pub async fn pause(&self, path: impl Into<String>) -> Result<(), EngineError> {
        let path = path.into();
        self.request(|respond_to| Command::Pause { path, respond_to })
            .await
    }

    pub async fn resume(&self, path: impl Into<String>) -> Result<(), EngineError> {
        let path = path.into();
        self.request(|respond_to| Command::Resume { path, respond_to })
            .await
    }

    pub async fn cancel(&self, path: impl Into<String>) -> Result<(), EngineError> {
        let path = path.into();
        self.request(|respond_to| Command::Cancel { path, respond_to })
            .await
    }

    pub async fn set_throttle(&self, path: impl Into<String>, speed: u64) -> Result<(), EngineError> {
        let path = path.into();
        self.request(|respond_to| Command::SetThrottle {
            path,
            speed,
            respond_to,
        })
        .await
    }

    pub async fn allow_gsm_download(&self, allowed: bool) -> Result<(), EngineError> {
        self.request(|respond_to| Command::AllowGsmDownload {
            allowed,
            respond_to,
        })
        .await
    }

    pub async fn set_online(&self, online: bool) -> Result<(), EngineError> {
        self.request(|respond_to| Command::OnlineChanged { online, respond_to })
            .await
    }

    /// Tell the reactor the bearer changed. The network info port must
    /// already report `mode`.
    pub async fn network_mode_changed(&self, mode: NetworkMode) -> Result<(), EngineError> {
        self.request(|respond_to| Command::NetworkModeChanged { mode, respond_to })
            .await
    }

    /// Stop the reactor task. Transfers still registered are dropped.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn request(
        &self,
        make: impl FnOnce(Responder) -> Command,
    ) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }
}

/// Spawn the reactor on the current tokio runtime.
///
/// `replies` and `processes` are the receiving ends of the channels the
/// request and process factories in `deps` publish on.
pub fn spawn_reactor(
    deps: TransferDeps,
    replies: UnboundedReceiver<ReplyMessage>,
    processes: UnboundedReceiver<ProcessMessage>,
) -> ReactorHandle {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
    let cancel = CancellationToken::new();

    let mut queue = Queue::new();
    let queue_events = queue.subscribe();
    let reactor = Reactor {
        queue,
        queue_events,
        groups: IndexMap::new(),
        deferred: IndexSet::new(),
        deps,
        commands: command_rx,
        replies,
        processes,
        events: event_tx.clone(),
        cancel: cancel.clone(),
    };
    tokio::spawn(reactor.run());

    ReactorHandle {
        commands: command_tx,
        events: event_tx,
        cancel,
    }
}

struct Reactor {
    queue: Queue<Download>,
    queue_events: UnboundedReceiver<QueueEvent>,
    groups: IndexMap<String, GroupEntry>,
    /// Groups started while the network policy forbade transferring.
    deferred: IndexSet<String>,
    deps: TransferDeps,
    commands: mpsc::Receiver<Command>,
    replies: UnboundedReceiver<ReplyMessage>,
    processes: UnboundedReceiver<ProcessMessage>,
    events: broadcast::Sender<ReactorEvent>,
    cancel: CancellationToken,
}

impl Reactor {
    async fn run(mut self) {
        tracing::info!(target: "downlink.reactor", "reactor started");
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(message) = self.replies.recv() => self.handle_reply(&message),
                Some(message) = self.processes.recv() => self.handle_process(&message),
            }
            self.publish();
        }
        tracing::info!(
            target: "downlink.reactor",
            downloads = self.queue.size(),
            groups = self.groups.len(),
            "reactor stopped"
        );
    }

    fn handle_command(&mut self, command: Command) {
        let (result, respond_to) = match command {
            Command::AddDownload {
                descriptor,
                respond_to,
            } => (self.add_download(*descriptor), respond_to),
            Command::AddGroup {
                descriptor,
                respond_to,
            } => (self.add_group(*descriptor), respond_to),
            Command::Start { path, respond_to } => (
                self.dispatch(&path, Queue::start, |group| {
                    group.start();
                    open_group(group, GroupDownload::start_transfer)
                }),
                respond_to,
            ),
            Command::Pause { path, respond_to } => (
                self.dispatch(&path, Queue::pause, |group| {
                    group.pause();
                    group.pause_transfer();
                    false
                }),
                respond_to,
            ),
            Command::Resume { path, respond_to } => (
                self.dispatch(&path, Queue::resume, |group| {
                    group.resume();
                    open_group(group, GroupDownload::resume_transfer)
                }),
                respond_to,
            ),
            Command::Cancel { path, respond_to } => (
                self.dispatch(&path, Queue::cancel, |group| {
                    group.cancel();
                    group.cancel_transfer();
                    false
                }),
                respond_to,
            ),
            Command::SetThrottle {
                path,
                speed,
                respond_to,
            } => (
                self.dispatch(
                    &path,
                    |queue, path| queue.set_throttle(path, speed),
                    |group| {
                        group.set_throttle(speed);
                        false
                    },
                ),
                respond_to,
            ),
            Command::AllowGsmDownload {
                allowed,
                respond_to,
            } => {
                self.queue.allow_gsm_download(allowed);
                for entry in self.groups.values_mut() {
                    entry.group.allow_gsm_download(allowed);
                }
                self.run_deferred();
                (Ok(()), respond_to)
            }
            Command::OnlineChanged { online, respond_to } => {
                tracing::info!(target: "downlink.reactor", online, "connectivity changed");
                self.queue.on_online_state_changed(online);
                for entry in self.groups.values_mut() {
                    entry.group.on_online_state_changed(online);
                }
                if online {
                    self.run_deferred();
                }
                (Ok(()), respond_to)
            }
            Command::NetworkModeChanged { mode, respond_to } => {
                tracing::info!(target: "downlink.reactor", ?mode, "network mode changed");
                self.queue.on_network_mode_changed(mode);
                if mode != NetworkMode::Unknown {
                    self.run_deferred();
                }
                (Ok(()), respond_to)
            }
        };

        if let Err(err) = &result {
            tracing::debug!(target: "downlink.reactor", error = %err, "command rejected");
        }
        // the caller may have stopped waiting
        let _ = respond_to.send(result);
    }

    fn is_registered(&self, path: &str) -> bool {
        self.queue.contains(path) || self.groups.contains_key(path)
    }

    fn add_download(&mut self, descriptor: DownloadDescriptor) -> Result<(), EngineError> {
        if self.is_registered(&descriptor.path) {
            return Err(EngineError::duplicate(descriptor.path));
        }
        let download = Download::new(descriptor, self.deps.clone());
        if let Some(err) = download.last_error() {
            return Err(EngineError::InvalidTransfer {
                path: download.path().to_string(),
                source: err.clone(),
            });
        }
        tracing::info!(target: "downlink.reactor", path = %download.path(), url = %download.url(), "download registered");
        self.queue.add(download)
    }

    fn add_group(&mut self, descriptor: GroupDownloadDescriptor) -> Result<(), EngineError> {
        if self.is_registered(&descriptor.path) {
            return Err(EngineError::duplicate(descriptor.path));
        }
        let mut group = GroupDownload::new(descriptor, self.deps.clone());
        if let Some(err) = group.last_error() {
            return Err(EngineError::InvalidTransfer {
                path: group.path().to_string(),
                source: err.clone(),
            });
        }

        let path = group.path().to_string();
        tracing::info!(target: "downlink.reactor", path = %path, "group registered");
        let events = group.subscribe();
        self.groups.insert(path.clone(), GroupEntry { group, events });
        let _ = self.events.send(ReactorEvent::GroupAdded { path });
        Ok(())
    }

    /// Apply a lifecycle request to whichever owner knows `path`.
    ///
    /// Groups are not scheduled by the queue. The network side of the
    /// request runs right away unless `on_group` reports it was held back by
    /// the network policy, in which case [`Self::run_deferred`] picks it up.
    fn dispatch(
        &mut self,
        path: &str,
        on_queue: impl FnOnce(&mut Queue<Download>, &str) -> Result<(), EngineError>,
        on_group: impl FnOnce(&mut GroupDownload) -> bool,
    ) -> Result<(), EngineError> {
        if self.queue.contains(path) {
            return on_queue(&mut self.queue, path);
        }
        let entry = self
            .groups
            .get_mut(path)
            .ok_or_else(|| EngineError::unknown(path))?;
        if on_group(&mut entry.group) {
            self.deferred.insert(path.to_string());
        } else {
            self.deferred.shift_remove(path);
        }
        Ok(())
    }

    /// Open the network side of held-back groups the policy now admits.
    fn run_deferred(&mut self) {
        let ready: Vec<String> = self
            .deferred
            .iter()
            .filter(|path| {
                self.groups
                    .get(path.as_str())
                    .is_some_and(|entry| entry.group.can_transfer())
            })
            .cloned()
            .collect();

        for path in ready {
            self.deferred.shift_remove(&path);
            let Some(entry) = self.groups.get_mut(&path) else {
                continue;
            };
            tracing::debug!(target: "downlink.reactor", path = %path, "running deferred group");
            match entry.group.state() {
                TransferState::Start => entry.group.start_transfer(),
                TransferState::Resume => entry.group.resume_transfer(),
                _ => {}
            }
        }
    }

    fn handle_reply(&mut self, message: &ReplyMessage) {
        if self.queue.handle_reply(message) {
            return;
        }
        let routed = self
            .groups
            .values_mut()
            .any(|entry| entry.group.handle_reply(message));
        if !routed {
            tracing::debug!(target: "downlink.reactor", owner = %message.owner, "reply for unknown transfer");
        }
    }

    fn handle_process(&mut self, message: &ProcessMessage) {
        if self.queue.handle_process(message) {
            return;
        }
        let routed = self
            .groups
            .values_mut()
            .any(|entry| entry.group.handle_process(message));
        if !routed {
            tracing::debug!(target: "downlink.reactor", owner = %message.owner, "process event for unknown transfer");
        }
    }

    /// Re-broadcast everything published since the last call and collect
    /// groups that reached a terminal state.
    fn publish(&mut self) {
        for event in drain(&mut self.queue_events) {
            let _ = self.events.send(ReactorEvent::Queue(event));
        }

        let mut finished = Vec::new();
        for (path, entry) in &mut self.groups {
            for event in drain(&mut entry.events) {
                let _ = self.events.send(ReactorEvent::Group {
                    path: path.clone(),
                    event,
                });
            }
            if entry.group.state().is_terminal() {
                finished.push(path.clone());
            }
        }
        for path in finished {
            self.groups.shift_remove(&path);
            self.deferred.shift_remove(&path);
            tracing::debug!(target: "downlink.reactor", path = %path, "group removed");
            let _ = self.events.send(ReactorEvent::GroupRemoved { path });
        }
    }
}

/// Run `open` unless the group is valid but barred from the network right
/// now. Returns whether the call was held back.
///
/// An invalid group still gets `open` so it can report its own failure.
fn open_group(group: &mut GroupDownload, open: impl FnOnce(&mut GroupDownload)) -> bool {
    if group.is_valid() && !group.can_transfer() {
        tracing::debug!(target: "downlink.reactor", path = %group.path(), "network policy holds group back");
        return true;
    }
    open(group);
    false
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use downlink_core::ValidationError;
    use downlink_core::ports::{ReplyEvent, ReplyMessage};
    use tokio::sync::mpsc::UnboundedSender;

    use super::*;
    use crate::testing::{Fixture, ReplyScript};

    struct Harness {
        handle: ReactorHandle,
        events: broadcast::Receiver<ReactorEvent>,
        replies: UnboundedSender<ReplyMessage>,
        _processes: UnboundedSender<ProcessMessage>,
    }

    fn harness(fixture: &Fixture) -> Harness {
        let (replies, reply_rx) = mpsc::unbounded_channel();
        let (processes, process_rx) = mpsc::unbounded_channel();
        let handle = spawn_reactor(fixture.deps(), reply_rx, process_rx);
        let events = handle.subscribe();
        Harness {
            handle,
            events,
            replies,
            _processes: processes,
        }
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<ReactorEvent>,
        pred: impl Fn(&ReactorEvent) -> bool,
    ) -> Vec<ReactorEvent> {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                let done = pred(&event);
                seen.push(event);
                if done {
                    break;
                }
            }
        })
        .await
        .expect("timed out waiting for reactor event");
        seen
    }

    #[tokio::test]
    async fn test_download_runs_to_completion() {
        let fixture = Fixture::new();
        fixture.push_reply(ReplyScript::ok(b"payload"));
        let mut h = harness(&fixture);

        h.handle
            .add_download(fixture.descriptor("/d/1", "a.bin"))
            .await
            .unwrap();
        h.handle.start("/d/1").await.unwrap();
        h.replies
            .send(ReplyMessage::new("/d/1", 1, ReplyEvent::Finished))
            .unwrap();

        let seen = wait_for(&mut h.events, |e| {
            matches!(e, ReactorEvent::Queue(QueueEvent::DownloadRemoved { .. }))
        })
        .await;

        assert!(seen.contains(&ReactorEvent::Queue(QueueEvent::CurrentChanged {
            path: "/d/1".to_string()
        })));
        assert!(seen.contains(&ReactorEvent::Queue(QueueEvent::Transfer {
            path: "/d/1".to_string(),
            event: TransferEvent::Finished {
                path: fixture.dir.path().join("a.bin")
            }
        })));
        assert_eq!(
            std::fs::read(fixture.dir.path().join("a.bin")).unwrap(),
            b"payload"
        );
        h.handle.shutdown();
    }

    #[tokio::test]
    async fn test_registration_errors() {
        let fixture = Fixture::new();
        let h = harness(&fixture);

        h.handle
            .add_download(fixture.descriptor("/d/1", "a.bin"))
            .await
            .unwrap();
        assert_eq!(
            h.handle
                .add_download(fixture.descriptor("/d/1", "b.bin"))
                .await,
            Err(EngineError::duplicate("/d/1"))
        );
        assert_eq!(
            h.handle.start("/missing").await,
            Err(EngineError::unknown("/missing"))
        );

        let invalid = h
            .handle
            .add_download(DownloadDescriptor::new("/d/2", "::"))
            .await;
        assert!(matches!(
            invalid,
            Err(EngineError::InvalidTransfer {
                source: ValidationError::InvalidUrl { .. },
                ..
            })
        ));
        h.handle.shutdown();
    }

    #[tokio::test]
    async fn test_empty_group_finishes_and_is_collected() {
        let fixture = Fixture::new();
        let mut h = harness(&fixture);

        h.handle
            .add_group(GroupDownloadDescriptor::new("/g/1", Vec::new()))
            .await
            .unwrap();
        h.handle.start("/g/1").await.unwrap();

        let seen = wait_for(&mut h.events, |e| {
            matches!(e, ReactorEvent::GroupRemoved { .. })
        })
        .await;
        assert!(seen.contains(&ReactorEvent::Group {
            path: "/g/1".to_string(),
            event: TransferEvent::GroupFinished { paths: Vec::new() }
        }));
        assert_eq!(
            h.handle.cancel("/g/1").await,
            Err(EngineError::unknown("/g/1"))
        );
        h.handle.shutdown();
    }

    #[tokio::test]
    async fn test_group_member_replies_are_routed() {
        let fixture = Fixture::new();
        fixture.push_reply(ReplyScript::ok(b"member"));
        let mut h = harness(&fixture);
        let member = downlink_core::GroupDownloadStruct::new(
            "http://example.com/m.bin",
            fixture.dir.path().join("m.bin"),
        );

        h.handle
            .add_group(
                GroupDownloadDescriptor::new("/g/1", vec![member])
                    .with_confinement(false, fixture.dir.path()),
            )
            .await
            .unwrap();
        h.handle.start("/g/1").await.unwrap();
        h.replies
            .send(ReplyMessage::new("/g/1/member/0", 1, ReplyEvent::Finished))
            .unwrap();

        let seen = wait_for(&mut h.events, |e| {
            matches!(e, ReactorEvent::GroupRemoved { .. })
        })
        .await;
        assert!(seen.contains(&ReactorEvent::Group {
            path: "/g/1".to_string(),
            event: TransferEvent::GroupFinished {
                paths: vec![fixture.dir.path().join("m.bin")]
            }
        }));
        h.handle.shutdown();
    }

    fn gsm_blocked_group(fixture: &Fixture) -> GroupDownloadDescriptor {
        let member = downlink_core::GroupDownloadStruct::new(
            "http://example.com/m.bin",
            fixture.dir.path().join("m.bin"),
        );
        GroupDownloadDescriptor::new("/g/1", vec![member])
            .with_confinement(false, fixture.dir.path())
            .with_allow_gsm_download(false)
    }

    #[tokio::test]
    async fn test_group_start_waits_for_gsm_permission() {
        let fixture = Fixture::new().with_network_mode(NetworkMode::Gsm);
        fixture.push_reply(ReplyScript::ok(b"member"));
        let h = harness(&fixture);

        h.handle.add_group(gsm_blocked_group(&fixture)).await.unwrap();
        h.handle.start("/g/1").await.unwrap();
        assert_eq!(fixture.request_count(), 0);

        h.handle.allow_gsm_download(true).await.unwrap();
        assert_eq!(fixture.request_count(), 1);

        // a second policy change must not open the group again
        h.handle.set_online(true).await.unwrap();
        assert_eq!(fixture.request_count(), 1);
        h.handle.shutdown();
    }

    #[tokio::test]
    async fn test_network_mode_change_releases_held_back_transfers() {
        let fixture = Fixture::new().with_network_mode(NetworkMode::Gsm);
        fixture.push_reply(ReplyScript::ok(b"member"));
        fixture.push_reply(ReplyScript::ok(b"single"));
        let mut h = harness(&fixture);

        h.handle.add_group(gsm_blocked_group(&fixture)).await.unwrap();
        h.handle
            .add_download(
                fixture
                    .descriptor("/d/1", "a.bin")
                    .with_allow_gsm_download(false),
            )
            .await
            .unwrap();
        h.handle.start("/g/1").await.unwrap();
        h.handle.start("/d/1").await.unwrap();

        h.handle.network_mode_changed(NetworkMode::Unknown).await.unwrap();
        assert_eq!(fixture.request_count(), 0);

        fixture.set_network_mode(NetworkMode::Wlan);
        h.handle.network_mode_changed(NetworkMode::Wlan).await.unwrap();
        assert_eq!(fixture.request_count(), 2);
        wait_for(&mut h.events, |e| {
            *e == ReactorEvent::Queue(QueueEvent::CurrentChanged {
                path: "/d/1".to_string(),
            })
        })
        .await;
        h.handle.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting_commands() {
        let fixture = Fixture::new();
        let h = harness(&fixture);

        h.handle.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(h.handle.start("/d/1").await, Err(EngineError::Stopped));
    }
}
