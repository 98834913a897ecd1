//! Streaming progress from a running workflow back to its caller.

use slog::{debug, Logger};
use thiserror::Error;
use tokio::sync::mpsc;

/// One line of workflow progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressMessage {
    pub success: bool,
    pub message: String,
}

/// The caller went away; no further steps may be issued.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("progress stream closed by the caller")]
pub struct StreamClosed;

/// How a workflow ended, mirrored by the flag on its last message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        self == Outcome::Succeeded
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
        }
    }
}

/// Sending half handed to workflows. Clones share the same stream, so
/// fan-out tasks can report concurrently.
#[derive(Clone)]
pub struct ProgressSink {
    tx: mpsc::Sender<ProgressMessage>,
    log: Logger,
}

impl ProgressSink {
    pub fn new(tx: mpsc::Sender<ProgressMessage>, log: Logger) -> Self {
        Self { tx, log }
    }

    /// A sink plus the receiver the transport drains.
    pub fn channel(capacity: usize, log: Logger) -> (ProgressSink, mpsc::Receiver<ProgressMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ProgressSink::new(tx, log), rx)
    }

    pub async fn send(&self, success: bool, message: impl Into<String>) -> Result<(), StreamClosed> {
        let message = message.into();
        debug!(self.log, "progress"; "success" => success, "message" => &message);
        self.tx
            .send(ProgressMessage { success, message })
            .await
            .map_err(|_| StreamClosed)
    }

    /// Announce a step that is about to run.
    pub async fn step(&self, message: impl Into<String>) -> Result<(), StreamClosed> {
        self.send(true, message).await
    }

    /// Report a problem that does not change the outcome.
    pub async fn warn(&self, message: impl AsRef<str>) -> Result<(), StreamClosed> {
        self.send(true, format!("Warning: {}", message.as_ref())).await
    }

    /// Report a failure that does not end the workflow (one node of many).
    pub async fn error(&self, message: impl Into<String>) -> Result<(), StreamClosed> {
        self.send(false, message).await
    }

    /// Final failure message.
    pub async fn fail(&self, message: impl Into<String>) -> Result<Outcome, StreamClosed> {
        self.send(false, message).await?;
        Ok(Outcome::Failed)
    }

    /// Final success message.
    pub async fn done(&self, message: impl Into<String>) -> Result<Outcome, StreamClosed> {
        self.send(true, message).await?;
        Ok(Outcome::Succeeded)
    }
}
