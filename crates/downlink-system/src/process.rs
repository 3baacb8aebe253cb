//! Post-download commands spawned on the tokio runtime.
//!
//! A [`TokioProcess`] runs its program on a background task and reports the
//! outcome as a [`ProcessMessage`] addressed to its owner. Captured output
//! is kept until the owner reads it.

use std::process::Stdio;
use std::sync::{Arc, Mutex};

use downlink_core::ports::{
    ExitStatus, Process, ProcessErrorCode, ProcessEvent, ProcessFactory, ProcessMessage,
};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct Captured {
    stdout: String,
    stderr: String,
}

#[derive(Debug)]
pub struct TokioProcess {
    owner: String,
    tx: UnboundedSender<ProcessMessage>,
    captured: Arc<Mutex<Captured>>,
    cancel: CancellationToken,
}

impl TokioProcess {
    pub fn new(owner: impl Into<String>, tx: UnboundedSender<ProcessMessage>) -> Self {
        Self {
            owner: owner.into(),
            tx,
            captured: Arc::new(Mutex::new(Captured::default())),
            cancel: CancellationToken::new(),
        }
    }

    fn report(&self, event: ProcessEvent) {
        if self.tx.send(ProcessMessage::new(&self.owner, event)).is_err() {
            tracing::debug!(target: "downlink.process", owner = %self.owner, "process listener gone");
        }
    }

    fn take_captured(&self, pick: impl FnOnce(&mut Captured) -> &mut String) -> String {
        let mut guard = match self.captured.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(pick(&mut guard))
    }
}

impl Process for TokioProcess {
    fn start(&mut self, program: &str, args: &[String]) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(target: "downlink.process", owner = %self.owner, program, "no runtime to spawn the command on");
            self.report(ProcessEvent::Error(ProcessErrorCode::FailedToStart));
            return;
        };

        let spawned = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(target: "downlink.process", owner = %self.owner, program, error = %err, "command failed to start");
                self.report(ProcessEvent::Error(ProcessErrorCode::FailedToStart));
                return;
            }
        };
        tracing::debug!(target: "downlink.process", owner = %self.owner, program, ?args, "command started");

        let owner = self.owner.clone();
        let tx = self.tx.clone();
        let captured = Arc::clone(&self.captured);
        let cancel = self.cancel.clone();

        runtime.spawn(async move {
            let event = tokio::select! {
                () = cancel.cancelled() => ProcessEvent::Error(ProcessErrorCode::Crashed),
                output = child.wait_with_output() => match output {
                    Ok(output) => {
                        if let Ok(mut guard) = captured.lock() {
                            guard.stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                            guard.stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                        }
                        match output.status.code() {
                            Some(exit_code) => ProcessEvent::Finished {
                                exit_code,
                                status: ExitStatus::Normal,
                            },
                            None => ProcessEvent::Finished {
                                exit_code: -1,
                                status: ExitStatus::Crash,
                            },
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target: "downlink.process", owner = %owner, error = %err, "lost track of command");
                        ProcessEvent::Error(ProcessErrorCode::ReadError)
                    }
                },
            };
            let _ = tx.send(ProcessMessage::new(owner, event));
        });
    }

    fn kill(&mut self) {
        self.cancel.cancel();
    }

    fn read_all_standard_output(&mut self) -> String {
        self.take_captured(|c| &mut c.stdout)
    }

    fn read_all_standard_error(&mut self) -> String {
        self.take_captured(|c| &mut c.stderr)
    }
}

impl Drop for TokioProcess {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Creates [`TokioProcess`]es that report on a shared channel.
#[derive(Debug, Clone)]
pub struct TokioProcessFactory {
    tx: UnboundedSender<ProcessMessage>,
}

impl TokioProcessFactory {
    pub const fn new(tx: UnboundedSender<ProcessMessage>) -> Self {
        Self { tx }
    }
}

impl ProcessFactory for TokioProcessFactory {
    fn create_process(&self, owner: &str) -> Box<dyn Process> {
        Box::new(TokioProcess::new(owner, self.tx.clone()))
    }
}
