//! Node discovery and the kubectl steps shared by several workflows.

use super::{failure_list, Orchestrator};
use crate::exec::{CommandOutput, Selector};
use futures::future::join_all;
use slog::{info, warn};

pub const ROLE_MASTER: &str = "master";
pub const ROLE_WORKER: &str = "worker";

impl Orchestrator {
    /// Run kubectl against the cluster with admin credentials.
    pub(crate) async fn kubectl(&self, args: &[&str]) -> CommandOutput {
        let kubeconfig = self.config().kubeconfig_arg();
        let mut full = vec![kubeconfig.as_str()];
        full.extend_from_slice(args);
        self.exec().local("kubectl", &full).await
    }

    pub(crate) async fn drain(&self, hostname: &str) -> CommandOutput {
        self.kubectl(&[
            "drain",
            hostname,
            "--timeout",
            "10m",
            "--delete-emptydir-data",
            "--force",
            "--ignore-daemonsets",
        ])
        .await
    }

    pub(crate) async fn uncordon(&self, hostname: &str) -> CommandOutput {
        self.kubectl(&["uncordon", hostname]).await
    }

    /// Minions matching operator input that answer a ping.
    pub async fn resolve(&self, pattern: &str) -> Vec<String> {
        self.exec().ping(&Selector::parse(pattern)).await
    }

    /// Every node carrying a master or worker grain, masters first.
    pub async fn members(&self) -> Vec<String> {
        let mut nodes = self.exec().role_members(ROLE_MASTER).await;
        for worker in self.exec().role_members(ROLE_WORKER).await {
            if !nodes.contains(&worker) {
                nodes.push(worker);
            }
        }
        nodes
    }

    /// Responding nodes from operator input that are already cluster members.
    /// `*` selects every member.
    pub async fn resolve_members(&self, pattern: &str) -> Vec<String> {
        let members = self.members().await;
        if pattern.trim() == "*" {
            return members;
        }
        self.resolve(pattern)
            .await
            .into_iter()
            .filter(|node| members.contains(node))
            .collect()
    }

    /// Fleet ids of all cluster members.
    pub async fn list_nodes(&self) -> Result<Vec<String>, CommandOutput> {
        let masters = self.exec().list_role(ROLE_MASTER).await;
        let workers = self.exec().list_role(ROLE_WORKER).await;
        let mut nodes = crate::exec::parse::minions(&masters.output);
        for worker in crate::exec::parse::minions(&workers.output) {
            if !nodes.contains(&worker) {
                nodes.push(worker);
            }
        }
        if nodes.is_empty() && !masters.success {
            return Err(masters);
        }
        Ok(nodes)
    }

    /// Drain and reboot members; a drain failure is only logged.
    ///
    /// Returns the failure summary when any reboot could not be issued.
    pub async fn reboot_nodes(&self, pattern: &str) -> Result<String, String> {
        let nodes = self.resolve_members(pattern).await;
        if nodes.is_empty() {
            return Err(format!("No cluster member matches '{}'", pattern));
        }

        let reboots = nodes.iter().map(|node| async move {
            match self.exec().node_name(node).await {
                Ok(hostname) => {
                    let drained = self.drain(&hostname).await;
                    if !drained.success {
                        warn!(self.log, "drain before reboot failed"; "node" => node.as_str(), "error" => %drained);
                    }
                }
                Err(err) => warn!(self.log, "hostname lookup failed"; "node" => node.as_str(), "error" => %err),
            }
            let out = self.exec().call(node, "system.reboot", &[]).await;
            if out.success {
                info!(self.log, "reboot issued"; "node" => node.as_str());
                None
            } else {
                Some((node.clone(), "reboot"))
            }
        });
        let failures: Vec<_> = join_all(reboots).await.into_iter().flatten().collect();

        if failures.is_empty() {
            Ok(format!("Reboot of {} initiated", nodes.join(", ")))
        } else {
            Err(format!("Reboot failed for: {}", failure_list(&failures)))
        }
    }
}
