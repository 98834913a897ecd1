//! Node lifecycle workflows.
//!
//! Each workflow is an explicit state machine driven by an [Orchestrator]
//! method. Progress is streamed through a [ProgressSink]; the returned
//! [Outcome] always matches the success flag of the final message. The only
//! error a workflow returns is [StreamClosed], after which it issues no
//! further steps.

pub mod add_node;
pub mod artifacts;
pub mod deploy;
pub mod destroy;
pub mod drift;
pub mod init_master;
pub mod nodes;
pub mod progress;
pub mod remove_node;
pub mod status;
pub mod token;
pub mod upgrade;

pub use add_node::AddNodeRequest;
pub use artifacts::{Artifact, ArtifactDeployer, HelmRelease};
pub use drift::{content_hash, DriftDetector};
pub use init_master::{InitRequest, InitState};
pub use progress::{Outcome, ProgressMessage, ProgressSink, StreamClosed};
pub use token::JoinTokenCache;

use crate::config::DaemonConfig;
use crate::exec::{BoxedRunner, RemoteExecutor};
use crate::state::StateStore;
use slog::{o, Logger};
use std::sync::Arc;

/// Result type of every workflow.
pub type WorkflowResult = Result<Outcome, StreamClosed>;

/// Shared context of all workflows. Cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<DaemonConfig>,
    exec: RemoteExecutor,
    store: StateStore,
    deployer: ArtifactDeployer,
    tokens: Arc<JoinTokenCache>,
    log: Logger,
}

impl Orchestrator {
    pub fn new(config: Arc<DaemonConfig>, runner: BoxedRunner, log: Logger) -> Self {
        let log = log.new(o!("component" => "orchestrator"));
        let exec = RemoteExecutor::new(runner, log.new(o!("component" => "exec")));
        let store = StateStore::new(&config.state_dir);
        let deployer = ArtifactDeployer::new(
            config.clone(),
            exec.clone(),
            DriftDetector::new(store.clone()),
            log.new(o!("component" => "artifacts")),
        );
        let tokens = Arc::new(JoinTokenCache::new(log.new(o!("component" => "join-token"))));
        Self { config, exec, store, deployer, tokens, log }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn exec(&self) -> &RemoteExecutor {
        &self.exec
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn deployer(&self) -> &ArtifactDeployer {
        &self.deployer
    }

    pub fn tokens(&self) -> &JoinTokenCache {
        &self.tokens
    }
}

/// Join per-node failures as `node (step), node (step)`.
pub(crate) fn failure_list(failures: &[(String, &'static str)]) -> String {
    failures
        .iter()
        .map(|(node, step)| format!("{} ({})", node, step))
        .collect::<Vec<_>>()
        .join(", ")
}
