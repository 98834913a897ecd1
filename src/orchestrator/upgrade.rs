//! Rolling upgrade: the first master, then the other masters, then workers.

use super::nodes::{ROLE_MASTER, ROLE_WORKER};
use super::{failure_list, Orchestrator, ProgressSink, StreamClosed, WorkflowResult};
use crate::exec::{parse, CommandOutput, Target};
use crate::state::{ClusterMetadata, Mechanism};
use futures::future::join_all;
use slog::{info, warn};

/// `v1.18.3` -> `1.18`, the form the kubelet package selector expects.
fn kubelet_minor(version: &str) -> String {
    version
        .trim_start_matches('v')
        .split('.')
        .take(2)
        .collect::<Vec<_>>()
        .join(".")
}

fn pin_kubelet_cmdline(version: &str) -> String {
    format!(
        "sed -i -e 's|^KUBELET_VER=.*|KUBELET_VER={}|g' /etc/sysconfig/kubelet",
        kubelet_minor(version)
    )
}

type Failure = (String, &'static str);

/// Phases of a rolling upgrade. A failing node in `Masters` or `Workers`
/// does not stop the upgrade; only `Plan` and `FirstMaster` fail it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradePhase {
    Plan,
    FirstMaster,
    Masters,
    Workers,
    Reapply,
    Done,
    Failed(String),
}

impl UpgradePhase {
    pub fn next(&self) -> UpgradePhase {
        match self {
            UpgradePhase::Plan => UpgradePhase::FirstMaster,
            UpgradePhase::FirstMaster => UpgradePhase::Masters,
            UpgradePhase::Masters => UpgradePhase::Workers,
            UpgradePhase::Workers => UpgradePhase::Reapply,
            UpgradePhase::Reapply => UpgradePhase::Done,
            terminal => terminal.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UpgradePhase::Done | UpgradePhase::Failed(_))
    }
}

#[derive(Debug, Default)]
struct UpgradeRun {
    metadata: ClusterMetadata,
    version: String,
    master_failures: Vec<Failure>,
    worker_failures: Vec<Failure>,
}

impl Orchestrator {
    pub async fn upgrade_kubernetes(&self, requested: &str, sink: ProgressSink) -> WorkflowResult {
        let mut run = UpgradeRun::default();
        let mut phase = UpgradePhase::Plan;
        loop {
            let result = match &phase {
                UpgradePhase::Plan => self.upgrade_plan(requested, &mut run, &sink).await?,
                UpgradePhase::FirstMaster => {
                    sink.step("Upgrade the control plane...").await?;
                    match self.upgrade_first_master(&run.version, &sink).await? {
                        Ok(()) => {
                            run.metadata.kubernetes_version = run.version.clone();
                            if let Err(err) = self.store().save_metadata(&run.metadata) {
                                warn!(self.log, "saving cluster metadata failed"; "error" => %err);
                                sink.warn(format!("cannot record the new version: {}", err)).await?;
                            }
                            Ok(())
                        }
                        Err(message) => Err(format!("Upgrade of the control plane failed: {}", message)),
                    }
                }
                UpgradePhase::Masters => {
                    if run.metadata.is_multi_master() {
                        let masters: Vec<String> = self
                            .exec()
                            .role_members(ROLE_MASTER)
                            .await
                            .into_iter()
                            .filter(|node| *node != run.metadata.first_master)
                            .collect();
                        if !masters.is_empty() {
                            sink.step("Upgrade remaining masters...").await?;
                            run.master_failures = self.upgrade_nodes(&masters, &run.version, &sink).await?;
                        }
                    }
                    Ok(())
                }
                UpgradePhase::Workers => {
                    let workers = self.exec().role_members(ROLE_WORKER).await;
                    if !workers.is_empty() {
                        sink.step("Upgrade worker nodes...").await?;
                        run.worker_failures = self.upgrade_nodes(&workers, &run.version, &sink).await?;
                    }
                    Ok(())
                }
                UpgradePhase::Reapply => {
                    sink.step("Update deployed add-ons...").await?;
                    self.reapply_artifacts(&sink).await?;
                    Ok(())
                }
                UpgradePhase::Done => return self.upgrade_finish(&run, &sink).await,
                UpgradePhase::Failed(message) => return sink.fail(message.clone()).await,
            };
            phase = match result {
                Ok(()) => phase.next(),
                Err(message) => UpgradePhase::Failed(message),
            };
        }
    }

    /// Settle the target version and let kubeadm validate it. Nothing is
    /// changed on any machine before this passes.
    async fn upgrade_plan(
        &self,
        requested: &str,
        run: &mut UpgradeRun,
        sink: &ProgressSink,
    ) -> Result<Result<(), String>, StreamClosed> {
        run.metadata = match self.store().metadata() {
            Ok(metadata) => metadata,
            Err(err) => return Ok(Err(format!("Cannot load cluster metadata: {}", err))),
        };

        run.version = if requested.trim().is_empty() {
            let out = self
                .exec()
                .local("rpm", &["-q", "--qf", "'%{VERSION}'", "kubernetes-kubeadm"])
                .await;
            if !out.success {
                return Ok(Err(out.output));
            }
            parse::normalize_version(&parse::package_version(&out.output))
        } else {
            parse::normalize_version(requested)
        };

        sink.step("Validate whether the cluster is upgradeable...").await?;
        let plan = self.exec().local("kubeadm", &["upgrade", "plan", &run.version]).await;
        if !plan.success {
            return Ok(Err(plan.output));
        }
        Ok(Ok(()))
    }

    async fn upgrade_finish(&self, run: &UpgradeRun, sink: &ProgressSink) -> WorkflowResult {
        let version = &run.version;
        if run.master_failures.is_empty() && run.worker_failures.is_empty() {
            info!(self.log, "cluster upgraded"; "version" => version);
            return sink
                .done(format!("Kubernetes cluster was successfully upgraded to version {}", version))
                .await;
        }
        let mut summary = Vec::new();
        if !run.master_failures.is_empty() {
            summary.push(format!("masters: {}", failure_list(&run.master_failures)));
        }
        if !run.worker_failures.is_empty() {
            summary.push(format!("workers: {}", failure_list(&run.worker_failures)));
        }
        sink.fail(format!("Upgrade to {} failed on {}", version, summary.join("; "))).await
    }

    /// The master this daemon runs on. Err carries the reason of a failure.
    async fn upgrade_first_master(
        &self,
        version: &str,
        sink: &ProgressSink,
    ) -> Result<Result<(), String>, StreamClosed> {
        let hostname = self.exec().local("hostname", &[]).await;
        if !hostname.success {
            return Ok(Err(hostname.output));
        }
        let hostname = hostname.trimmed().to_string();

        let drained = self.drain(&hostname).await;
        if !drained.success {
            sink.warn(format!("{}: drain failed (ignored): {}", hostname, drained)).await?;
        }

        let local = Target::Local;
        let mut result = Ok(());
        let applied = self.exec().local("kubeadm", &["upgrade", "apply", version, "--yes"]).await;
        if !applied.success {
            result = Err(applied.output);
        } else {
            let pinned = self.exec().shell(&local, &pin_kubelet_cmdline(version)).await;
            let restarted = if pinned.success {
                self.exec().restart_service(&local, "kubelet").await
            } else {
                pinned
            };
            if !restarted.success {
                result = Err(restarted.output);
            }
        }

        let uncordoned = self.uncordon(&hostname).await;
        if !uncordoned.success {
            sink.warn(format!("{}: uncordon failed: {}", hostname, uncordoned)).await?;
        }
        Ok(result)
    }

    async fn upgrade_nodes(
        &self,
        nodes: &[String],
        version: &str,
        sink: &ProgressSink,
    ) -> Result<Vec<Failure>, StreamClosed> {
        let upgrades = nodes.iter().map(|node| self.upgrade_node(node, version, sink));
        let mut failures = Vec::new();
        for result in join_all(upgrades).await {
            if let Some(failure) = result? {
                failures.push(failure);
            }
        }
        Ok(failures)
    }

    async fn upgrade_node(
        &self,
        node: &str,
        version: &str,
        sink: &ProgressSink,
    ) -> Result<Option<Failure>, StreamClosed> {
        sink.step(format!("{}: upgrading...", node)).await?;
        let hostname = match self.exec().node_name(node).await {
            Ok(hostname) => hostname,
            Err(out) => {
                sink.error(format!("{}: cannot determine hostname: {}", node, out)).await?;
                return Ok(Some((node.to_string(), "hostname")));
            }
        };

        let drained = self.drain(&hostname).await;
        if !drained.success {
            sink.warn(format!("{}: drain failed (ignored): {}", node, drained)).await?;
        }

        let target = Target::Node(node.to_string());
        let mut failed = None;
        let steps: [(&'static str, Option<String>); 3] = [
            ("kubeadm", Some("kubeadm upgrade node".to_string())),
            ("pin", Some(pin_kubelet_cmdline(version))),
            ("restart", None),
        ];
        for (step, cmdline) in steps {
            let out: CommandOutput = match cmdline {
                Some(cmdline) => self.exec().shell(&target, &cmdline).await,
                None => self.exec().restart_service(&target, "kubelet").await,
            };
            if !out.success {
                sink.error(format!("{}: {}", node, out)).await?;
                failed = Some((node.to_string(), step));
                break;
            }
        }

        let uncordoned = self.uncordon(&hostname).await;
        if !uncordoned.success {
            sink.warn(format!("{}: uncordon failed: {}", node, uncordoned)).await?;
        }
        if failed.is_none() {
            sink.step(format!("{}: upgraded to {}", node, version)).await?;
        }
        Ok(failed)
    }

    /// Force a re-apply of every tracked artifact; failures are warnings.
    async fn reapply_artifacts(&self, sink: &ProgressSink) -> Result<(), StreamClosed> {
        for mechanism in Mechanism::ALL {
            let artifacts = match self.deployer().tracked(mechanism) {
                Ok(artifacts) => artifacts,
                Err(err) => {
                    sink.warn(format!("cannot read {} records: {}", mechanism, err)).await?;
                    continue;
                }
            };
            for artifact in artifacts {
                if let Err(err) = self.deployer().apply(&artifact, true).await {
                    sink.warn(err.to_string()).await?;
                }
            }
        }
        Ok(())
    }
}
