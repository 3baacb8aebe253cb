//! Admission control across registered downloads.
//!
//! The queue holds every registered transfer keyed by its path and lets at
//! most one of them, the *current* transfer, open a network exchange.
//!
//! # Scheduling
//!
//! - A managed transfer asks to run by moving to `Start` or `Resume`. Its
//!   request is remembered in arrival order and the first eligible request
//!   (still running, `can_transfer()`) is promoted when nothing is current.
//! - When the current transfer pauses, cancels, finishes or errors the next
//!   eligible request is promoted and `CurrentChanged` fires, with an empty
//!   path if nobody is waiting.
//! - Unmanaged transfers (`add_to_queue() == false`) drive their own network
//!   operations as soon as their state changes. They still count in
//!   [`Queue::size`] and can be picked as current.
//! - Terminal transfers are removed and `DownloadRemoved` fires.
//!
//! The queue performs no I/O of its own. Every entry point drains the
//! transfers' event streams until they are quiet, so callers observe a
//! settled queue when a method returns.

use std::collections::VecDeque;

use downlink_core::ports::{ProcessMessage, ReplyMessage};
use downlink_core::{NetworkMode, TransferEvent, TransferState};
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::download::Download;
use crate::error::EngineError;
use crate::events::{EventSink, drain};
use crate::transfer::Transferable;

/// Notifications published by the [`Queue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    DownloadAdded { path: String },
    DownloadRemoved { path: String },
    /// Empty `path` when nothing is current.
    CurrentChanged { path: String },
    /// An event of a registered transfer, forwarded as is.
    Transfer { path: String, event: TransferEvent },
}

struct Entry<T> {
    transfer: T,
    events: UnboundedReceiver<TransferEvent>,
}

pub struct Queue<T: Transferable = Download> {
    entries: IndexMap<String, Entry<T>>,
    /// Paths that asked to run, oldest first.
    requested: VecDeque<String>,
    current: Option<String>,
    events: EventSink<QueueEvent>,
}

impl<T: Transferable> Default for Queue<T> {
    fn default() -> Self {
        Self {
            entries: IndexMap::new(),
            requested: VecDeque::new(),
            current: None,
            events: EventSink::new(),
        }
    }
}

impl<T: Transferable> Queue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> UnboundedReceiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Register a transfer under its path.
    pub fn add(&mut self, mut transfer: T) -> Result<(), EngineError> {
        let path = transfer.path().to_string();
        if self.entries.contains_key(&path) {
            return Err(EngineError::duplicate(path));
        }

        let events = transfer.subscribe();
        tracing::debug!(
            target: "downlink.queue",
            path = %path,
            managed = transfer.add_to_queue(),
            "transfer added"
        );
        self.entries.insert(path.clone(), Entry { transfer, events });
        self.events.emit(QueueEvent::DownloadAdded { path });
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Registered paths in registration order.
    pub fn paths(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn downloads(&self) -> impl Iterator<Item = &T> {
        self.entries.values().map(|entry| &entry.transfer)
    }

    pub fn get(&self, path: &str) -> Option<&T> {
        self.entries.get(path).map(|entry| &entry.transfer)
    }

    pub fn current_path(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn current_download(&self) -> Option<&T> {
        self.current.as_deref().and_then(|path| self.get(path))
    }

    // =========================================================================
    // Lifecycle requests
    // =========================================================================

    pub fn start(&mut self, path: &str) -> Result<(), EngineError> {
        self.with_transfer(path, Transferable::start)
    }

    pub fn pause(&mut self, path: &str) -> Result<(), EngineError> {
        self.with_transfer(path, Transferable::pause)
    }

    pub fn resume(&mut self, path: &str) -> Result<(), EngineError> {
        self.with_transfer(path, Transferable::resume)
    }

    pub fn cancel(&mut self, path: &str) -> Result<(), EngineError> {
        self.with_transfer(path, Transferable::cancel)
    }

    pub fn set_throttle(&mut self, path: &str, speed: u64) -> Result<(), EngineError> {
        self.with_transfer(path, |transfer| transfer.set_throttle(speed))
    }

    /// Toggle the metered-network permission of every transfer.
    pub fn allow_gsm_download(&mut self, allowed: bool) {
        for entry in self.entries.values_mut() {
            entry.transfer.allow_gsm_download(allowed);
        }
        self.pump();
        if self.current.is_none() {
            self.update_current();
            self.pump();
        }
    }

    /// Connectivity changed.
    ///
    /// Going offline keeps the current transfer in place; it parks its own
    /// exchange and picks it up again once back online.
    pub fn on_online_state_changed(&mut self, online: bool) {
        for entry in self.entries.values_mut() {
            entry.transfer.on_online_state_changed(online);
        }
        if online {
            self.update_current();
        }
        self.pump();
    }

    /// The bearer changed. A transfer held back by the metered policy may be
    /// eligible now, and the current one may have lost its eligibility.
    pub fn on_network_mode_changed(&mut self, mode: NetworkMode) {
        if mode == NetworkMode::Unknown {
            return;
        }
        tracing::debug!(target: "downlink.queue", ?mode, "network mode changed");
        self.update_current();
        self.pump();
    }

    // =========================================================================
    // Collaborator notifications
    // =========================================================================

    /// Route a reply notification to its owner. Returns `false` if no
    /// registered transfer owns it.
    pub fn handle_reply(&mut self, message: &ReplyMessage) -> bool {
        let handled = self
            .entries
            .get_mut(&message.owner)
            .is_some_and(|entry| entry.transfer.handle_reply(message));
        if handled {
            self.pump();
        }
        handled
    }

    /// Route a process notification to its owner.
    pub fn handle_process(&mut self, message: &ProcessMessage) -> bool {
        let handled = self
            .entries
            .get_mut(&message.owner)
            .is_some_and(|entry| entry.transfer.handle_process(message));
        if handled {
            self.pump();
        }
        handled
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    fn with_transfer(
        &mut self,
        path: &str,
        op: impl FnOnce(&mut T),
    ) -> Result<(), EngineError> {
        let entry = self
            .entries
            .get_mut(path)
            .ok_or_else(|| EngineError::unknown(path))?;
        op(&mut entry.transfer);
        self.pump();
        Ok(())
    }

    /// Drain every transfer's stream until nothing new arrives, reacting to
    /// state changes on the way.
    ///
    /// A batch is forwarded whole before any state reaction runs, so the
    /// reason a transfer ended is published before it is removed.
    fn pump(&mut self) {
        loop {
            let mut batch = Vec::new();
            for (path, entry) in &mut self.entries {
                batch.extend(drain(&mut entry.events).into_iter().map(|e| (path.clone(), e)));
            }
            if batch.is_empty() {
                return;
            }

            let mut changes = Vec::new();
            for (path, event) in batch {
                if let TransferEvent::StateChanged { state } = &event {
                    changes.push((path.clone(), *state));
                }
                self.events.emit(QueueEvent::Transfer { path, event });
            }
            for (path, state) in changes {
                self.on_state_changed(&path, state);
            }
        }
    }

    fn on_state_changed(&mut self, path: &str, state: TransferState) {
        let is_current = self.current.as_deref() == Some(path);
        let Some(entry) = self.entries.get_mut(path) else {
            return;
        };
        let managed = entry.transfer.add_to_queue();

        match state {
            TransferState::Idle => {}
            TransferState::Start | TransferState::Resume => {
                if !managed {
                    if state == TransferState::Start {
                        entry.transfer.start_transfer();
                    } else {
                        entry.transfer.resume_transfer();
                    }
                }
                if !self.requested.iter().any(|p| p == path) {
                    self.requested.push_back(path.to_string());
                }
                if self.current.is_none() {
                    self.update_current();
                }
            }
            TransferState::Pause => {
                entry.transfer.pause_transfer();
                self.requested.retain(|p| p != path);
                if is_current {
                    self.update_current();
                }
            }
            TransferState::Cancel => {
                entry.transfer.cancel_transfer();
                if is_current {
                    self.update_current();
                } else {
                    self.remove(path);
                }
            }
            TransferState::Finish | TransferState::Error => {
                if is_current {
                    self.update_current();
                } else {
                    self.remove(path);
                }
            }
        }
    }

    /// Re-evaluate the current transfer and promote the next one if needed.
    fn update_current(&mut self) {
        let previous = self.current.clone();
        if let Some(path) = previous.clone() {
            match self.entries.get(&path).map(|e| &e.transfer) {
                Some(transfer)
                    if !transfer.state().is_terminal()
                        && transfer.state() != TransferState::Pause
                        && transfer.can_transfer() =>
                {
                    return;
                }
                Some(transfer) => {
                    let terminal = transfer.state().is_terminal();
                    self.current = None;
                    if terminal {
                        self.remove(&path);
                    }
                }
                None => self.current = None,
            }
        }

        let next = self
            .requested
            .iter()
            .find(|path| {
                self.entries.get(path.as_str()).is_some_and(|entry| {
                    entry.transfer.state().is_running() && entry.transfer.can_transfer()
                })
            })
            .cloned();

        if let Some(path) = &next {
            if let Some(entry) = self.entries.get_mut(path) {
                tracing::info!(target: "downlink.queue", path = %path, "promoting transfer");
                if entry.transfer.state() == TransferState::Resume {
                    entry.transfer.resume_transfer();
                } else {
                    entry.transfer.start_transfer();
                }
            }
        }

        self.current.clone_from(&next);
        if previous != next {
            tracing::debug!(target: "downlink.queue", current = ?next, "current changed");
            self.events.emit(QueueEvent::CurrentChanged {
                path: next.unwrap_or_default(),
            });
        }
    }

    fn remove(&mut self, path: &str) {
        let Some(mut entry) = self.entries.shift_remove(path) else {
            return;
        };
        self.requested.retain(|p| p != path);
        if self.current.as_deref() == Some(path) {
            self.current = None;
        }

        for event in drain(&mut entry.events) {
            self.events.emit(QueueEvent::Transfer {
                path: path.to_string(),
                event,
            });
        }
        tracing::debug!(
            target: "downlink.queue",
            path = %path,
            state = %entry.transfer.state(),
            "transfer removed"
        );
        self.events.emit(QueueEvent::DownloadRemoved {
            path: path.to_string(),
        });
    }
}
