//! Local process execution.
//!
//! Every external tool the daemon drives (kubeadm, kubectl, salt, helm,
//! kustomize, etcdctl, certstrap, systemctl) goes through a [CommandRunner].
//! A runner never fails: the outcome of a process is always reported as a
//! [CommandOutput] so that fan-out and best-effort code can keep going.

use async_trait::async_trait;
use slog::{debug, info, warn, Logger};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Outcome of one external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    /// Captured stdout on success, a diagnostic on failure.
    pub output: String,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self { success: true, output: output.into() }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self { success: false, output: output.into() }
    }

    /// Output with surrounding whitespace removed.
    pub fn trimmed(&self) -> &str {
        self.output.trim()
    }
}

impl fmt::Display for CommandOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.output.trim_end())
    }
}

/// Render a program and its arguments as a single line for logs and fakes.
pub fn command_line(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

pub type BoxedRunner = Arc<dyn CommandRunner>;

/// Runs an external program and reports its outcome.
///
/// - In production this is a [HostRunner].
/// - Under test a [super::FakeRunner] scripts the responses.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> CommandOutput;
}

/// Runs commands on the local host with `tokio::process`.
pub struct HostRunner {
    log: Logger,
    counter: AtomicU64,
}

impl HostRunner {
    pub fn new(log: Logger) -> Arc<Self> {
        Arc::new(Self { log, counter: AtomicU64::new(0) })
    }

    pub fn as_runner(self: Arc<Self>) -> BoxedRunner {
        self
    }
}

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, program: &str, args: &[&str]) -> CommandOutput {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        debug!(self.log, "running command"; "id" => id, "command" => command_line(program, args));

        let output = match tokio::process::Command::new(program).args(args).output().await {
            Ok(output) => output,
            Err(err) => {
                warn!(self.log, "could not start command"; "id" => id, "program" => program, "error" => %err);
                return CommandOutput::failed(format!("Error invoking {}: {}", program, err));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            info!(self.log, "command finished"; "id" => id, "result" => "OK");
            return CommandOutput::ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let status = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        warn!(self.log, "command failed"; "id" => id, "program" => program, "status" => &status);

        let mut message = format!("Error invoking {}: exit status {}", program, status);
        for text in [stdout.trim_end(), stderr.trim_end()] {
            if !text.is_empty() {
                message.push('\n');
                message.push_str(text);
            }
        }
        CommandOutput::failed(message)
    }
}
