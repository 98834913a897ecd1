//! Process-wide cache of the cluster join command.

use crate::exec::{parse, CommandOutput, RemoteExecutor};
use slog::{info, Logger};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// A join token is regenerated once it is older than this.
pub const TOKEN_TTL: Duration = Duration::from_secs(23 * 60 * 60);

#[derive(Debug, Clone)]
struct JoinToken {
    command: String,
    created_at: Instant,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedJoin {
    /// Full `kubeadm join ...` command line.
    pub command: String,
    /// True when this lookup created a new token.
    pub regenerated: bool,
}

/// Holds at most one live join token.
///
/// The lock is held across generation, so concurrent callers that all find
/// the token expired wait for a single regeneration and then share it.
pub struct JoinTokenCache {
    inner: Mutex<Option<JoinToken>>,
    ttl: Duration,
    log: Logger,
}

impl JoinTokenCache {
    pub fn new(log: Logger) -> Self {
        Self::with_ttl(TOKEN_TTL, log)
    }

    pub fn with_ttl(ttl: Duration, log: Logger) -> Self {
        Self { inner: Mutex::new(None), ttl, log }
    }

    /// Return the cached join command, regenerating it when missing or expired.
    ///
    /// A failed generation leaves the cache untouched.
    pub async fn get(&self, exec: &RemoteExecutor, kubeconfig_arg: &str) -> Result<CachedJoin, CommandOutput> {
        let mut guard = self.inner.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.created_at.elapsed() <= self.ttl {
                return Ok(CachedJoin { command: token.command.clone(), regenerated: false });
            }
        }

        let out = exec
            .local("kubeadm", &[kubeconfig_arg, "token", "create", "--print-join-command"])
            .await;
        if !out.success {
            return Err(out);
        }
        let command = parse::join_command(&out.output);
        if command.is_empty() {
            return Err(CommandOutput::failed("kubeadm printed no join command"));
        }
        info!(self.log, "generated new join token");
        *guard = Some(JoinToken { command: command.clone(), created_at: Instant::now() });
        Ok(CachedJoin { command, regenerated: true })
    }
}
