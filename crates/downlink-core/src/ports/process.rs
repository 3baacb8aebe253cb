//! Subprocess port used for post-download commands.

use serde::{Deserialize, Serialize};

use crate::errors::ProcessFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    Normal,
    Crash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessErrorCode {
    FailedToStart,
    Crashed,
    Timedout,
    WriteError,
    ReadError,
    Unknown,
}

impl From<ProcessErrorCode> for ProcessFailure {
    fn from(code: ProcessErrorCode) -> Self {
        match code {
            ProcessErrorCode::FailedToStart => Self::FailedToStart,
            ProcessErrorCode::Crashed => Self::Crashed,
            ProcessErrorCode::Timedout => Self::Timedout,
            ProcessErrorCode::WriteError => Self::WriteError,
            ProcessErrorCode::ReadError => Self::ReadError,
            ProcessErrorCode::Unknown => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    Finished { exit_code: i32, status: ExitStatus },
    Error(ProcessErrorCode),
}

/// A process event addressed to the transfer that spawned the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMessage {
    pub owner: String,
    pub event: ProcessEvent,
}

impl ProcessMessage {
    pub fn new(owner: impl Into<String>, event: ProcessEvent) -> Self {
        Self {
            owner: owner.into(),
            event,
        }
    }
}

#[cfg_attr(feature = "mock", mockall::automock)]
pub trait Process: Send {
    /// Launch the program; the outcome arrives later as a [`ProcessEvent`].
    fn start(&mut self, program: &str, args: &[String]);

    fn kill(&mut self);

    fn read_all_standard_output(&mut self) -> String;

    fn read_all_standard_error(&mut self) -> String;
}

#[cfg_attr(feature = "mock", mockall::automock)]
pub trait ProcessFactory: Send + Sync {
    /// Create an idle process whose events are addressed to `owner`.
    fn create_process(&self, owner: &str) -> Box<dyn Process>;
}
