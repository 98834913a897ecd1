//! Joining machines to the cluster, one independent task per machine.

use super::nodes::{ROLE_MASTER, ROLE_WORKER};
use super::{failure_list, Orchestrator, ProgressSink, StreamClosed, WorkflowResult};
use crate::exec::{parse, Target};
use crate::state::ClusterMetadata;
use futures::future::join_all;
use slog::{info, warn};

const REBOOT_METHOD_KURED: &str = "if [ -f /etc/transactional-update.conf ]; then \
     grep -q ^REBOOT_METHOD= /etc/transactional-update.conf && \
     sed -i -e 's|REBOOT_METHOD=.*|REBOOT_METHOD=kured|g' /etc/transactional-update.conf || \
     echo REBOOT_METHOD=kured >> /etc/transactional-update.conf ; \
     else echo REBOOT_METHOD=kured > /etc/transactional-update.conf ; fi";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddNodeRequest {
    /// A fleet id, a comma separated list, or a glob.
    pub node_names: String,
    /// `master` or `worker`; empty means worker.
    pub role: String,
}

fn normalize_role(role: &str) -> Option<&'static str> {
    match role.trim() {
        "" => Some(ROLE_WORKER),
        r if r.eq_ignore_ascii_case(ROLE_WORKER) => Some(ROLE_WORKER),
        r if r.eq_ignore_ascii_case(ROLE_MASTER) => Some(ROLE_MASTER),
        _ => None,
    }
}

/// Phases of AddNode. Every phase but `Join` applies to the whole batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddNodePhase {
    Validate,
    Resolve,
    Token,
    /// Masters only: upload the control-plane certificates.
    CertificateKey,
    Join,
    Done,
    Failed(String),
}

impl AddNodePhase {
    pub fn next(&self, master: bool) -> AddNodePhase {
        match self {
            AddNodePhase::Validate => AddNodePhase::Resolve,
            AddNodePhase::Resolve => AddNodePhase::Token,
            AddNodePhase::Token if master => AddNodePhase::CertificateKey,
            AddNodePhase::Token | AddNodePhase::CertificateKey => AddNodePhase::Join,
            AddNodePhase::Join => AddNodePhase::Done,
            terminal => terminal.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AddNodePhase::Done | AddNodePhase::Failed(_))
    }
}

/// What the batch phases established.
#[derive(Debug)]
struct JoinPlan {
    role: &'static str,
    metadata: ClusterMetadata,
    nodes: Vec<String>,
    joincmd: String,
}

impl Default for JoinPlan {
    fn default() -> Self {
        Self { role: ROLE_WORKER, metadata: ClusterMetadata::default(), nodes: Vec::new(), joincmd: String::new() }
    }
}

impl Orchestrator {
    pub async fn add_node(&self, req: AddNodeRequest, sink: ProgressSink) -> WorkflowResult {
        let mut plan = JoinPlan::default();
        let mut phase = AddNodePhase::Validate;
        loop {
            let result = match &phase {
                AddNodePhase::Validate => self.add_validate(&req, &mut plan),
                AddNodePhase::Resolve => {
                    sink.step("Looking for reachable nodes...").await?;
                    plan.nodes = self.resolve(&req.node_names).await;
                    if plan.nodes.is_empty() {
                        Err("No node responded".to_string())
                    } else {
                        Ok(())
                    }
                }
                AddNodePhase::Token => self.add_token(&mut plan).await,
                AddNodePhase::CertificateKey => {
                    sink.step("Upload certificates...").await?;
                    self.add_certificate_key(&mut plan).await
                }
                AddNodePhase::Join => self.add_join(&plan, &sink).await?,
                AddNodePhase::Done => return sink.done("Node(s) successfully added").await,
                AddNodePhase::Failed(message) => return sink.fail(message.clone()).await,
            };
            phase = match result {
                Ok(()) => phase.next(plan.role == ROLE_MASTER),
                Err(message) => AddNodePhase::Failed(message),
            };
        }
    }

    fn add_validate(&self, req: &AddNodeRequest, plan: &mut JoinPlan) -> Result<(), String> {
        plan.role = normalize_role(&req.role).ok_or_else(|| format!("Unknown node type '{}'", req.role))?;
        plan.metadata = self
            .store()
            .metadata()
            .map_err(|err| format!("Cannot load cluster metadata: {}", err))?;
        if plan.role == ROLE_MASTER && !plan.metadata.is_multi_master() {
            return Err("Additional masters can only be added to a multi-master cluster".to_string());
        }
        Ok(())
    }

    async fn add_token(&self, plan: &mut JoinPlan) -> Result<(), String> {
        let join = self
            .tokens()
            .get(self.exec(), &self.config().kubeconfig_arg())
            .await
            .map_err(|out| out.output)?;
        if join.regenerated {
            info!(self.log, "using new join token"; "nodes" => plan.nodes.len());
        }
        plan.joincmd = join.command;
        Ok(())
    }

    async fn add_certificate_key(&self, plan: &mut JoinPlan) -> Result<(), String> {
        let out = self
            .exec()
            .local("kubeadm", &["init", "phase", "upload-certs", "--upload-certs"])
            .await;
        if !out.success {
            return Err(out.output);
        }
        let key = parse::certificate_key(&out.output)
            .ok_or_else(|| "kubeadm did not print a certificate key".to_string())?;
        plan.joincmd = format!("{} --control-plane --certificate-key {}", plan.joincmd, key);
        Ok(())
    }

    /// One independent task per node; failures are collected, not fatal.
    async fn add_join(&self, plan: &JoinPlan, sink: &ProgressSink) -> Result<Result<(), String>, StreamClosed> {
        let members = plan
            .nodes
            .iter()
            .map(|node| self.add_one(node, plan.role, &plan.joincmd, &plan.metadata, sink));
        let mut failures = Vec::new();
        for result in join_all(members).await {
            if let Some(failure) = result? {
                failures.push(failure);
            }
        }
        if failures.is_empty() {
            Ok(Ok(()))
        } else {
            Ok(Err(format!(
                "An error occurred during adding Node(s): {}",
                failure_list(&failures)
            )))
        }
    }

    /// Steps for one machine; the first failing step ends this machine only.
    async fn add_one(
        &self,
        node: &str,
        role: &'static str,
        joincmd: &str,
        metadata: &ClusterMetadata,
        sink: &ProgressSink,
    ) -> Result<Option<(String, &'static str)>, StreamClosed> {
        let target = Target::Node(node.to_string());
        sink.step(format!("{}: adding node...", node)).await?;

        let failed = |step: &'static str| Some((node.to_string(), step));

        let out = self.exec().enable_service(&target, "crio").await;
        if !out.success {
            sink.error(format!("{}: {}", node, out)).await?;
            return Ok(failed("container runtime"));
        }
        let out = self.exec().enable_service(&target, "kubelet").await;
        if !out.success {
            sink.error(format!("{}: {}", node, out)).await?;
            return Ok(failed("kubelet"));
        }

        sink.step(format!("{}: joining cluster...", node)).await?;
        let out = self.exec().shell(&target, joincmd).await;
        if !out.success {
            sink.error(format!("{}: {}", node, out)).await?;
            return Ok(failed("join"));
        }
        let out = self.exec().set_role(node, role).await;
        if !out.success {
            sink.error(format!("{}: {}", node, out)).await?;
            return Ok(failed("grain"));
        }
        let out = self.exec().shell(&target, REBOOT_METHOD_KURED).await;
        if !out.success {
            sink.error(format!("{}: {}", node, out)).await?;
            return Ok(failed("reboot configuration"));
        }

        if role == ROLE_MASTER && metadata.has_load_balancer() {
            let lb = Target::Node(metadata.load_balancer_node.clone());
            let out = self.exec().shell(&lb, &format!("haproxycfg server add {}", node)).await;
            if !out.success {
                warn!(self.log, "adding master to load balancer failed"; "node" => node, "error" => %out);
                sink.warn(format!("{}: adding to load balancer failed: {}", node, out)).await?;
            }
        }

        info!(self.log, "node added"; "node" => node, "role" => role);
        sink.step(format!("{}: node successfully added", node)).await?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{run, sink_closed_after, texts, Harness};
    use super::super::Outcome;
    use super::*;

    fn harness() -> Harness {
        let h = Harness::new();
        h.fake.on("token create", "kubeadm join 10.0.0.1:6443 --token abc.def\n");
        h
    }

    fn workers(names: &str) -> AddNodeRequest {
        AddNodeRequest { node_names: names.into(), role: "worker".into() }
    }

    #[test]
    fn test_phase_transitions() {
        for (master, expected) in [
            (false, vec![AddNodePhase::Resolve, AddNodePhase::Token, AddNodePhase::Join, AddNodePhase::Done]),
            (
                true,
                vec![
                    AddNodePhase::Resolve,
                    AddNodePhase::Token,
                    AddNodePhase::CertificateKey,
                    AddNodePhase::Join,
                    AddNodePhase::Done,
                ],
            ),
        ] {
            let mut phase = AddNodePhase::Validate;
            let mut seen = Vec::new();
            while !phase.is_terminal() {
                phase = phase.next(master);
                seen.push(phase.clone());
            }
            assert_eq!(seen, expected);
        }
        let failed = AddNodePhase::Failed("x".into());
        assert_eq!(failed.next(true), failed);
    }

    #[tokio::test]
    async fn test_non_responding_node_is_silent() {
        let h = harness();
        h.fake.on("test.ping", "host1: True\n");
        let o = h.orchestrator.clone();
        let (outcome, messages) = run(|sink| async move { o.add_node(workers("host1,host2"), sink).await }).await;

        assert_eq!(outcome, Outcome::Succeeded);
        assert!(texts(&messages).contains(&"host1: node successfully added"));
        assert!(messages.iter().all(|m| !m.message.contains("host2")));
        assert_eq!(h.fake.count("host2"), 1); // the ping only
        assert_eq!(h.fake.count("salt host1 cmd.run kubeadm join 10.0.0.1:6443 --token abc.def"), 1);
        assert_eq!(h.fake.count("salt host1 grains.append kubicd kubic-worker-node"), 1);
    }

    #[tokio::test]
    async fn test_one_failing_join_does_not_stop_others() {
        let h = harness();
        h.fake.on("test.ping", "n1: True\nn2: True\nn3: True\n");
        h.fake.fail("salt n2 cmd.run kubeadm join", "preflight errors");
        let o = h.orchestrator.clone();
        let (outcome, messages) = run(|sink| async move { o.add_node(workers("n*"), sink).await }).await;

        assert_eq!(outcome, Outcome::Failed);
        let texts = texts(&messages);
        assert!(texts.contains(&"n1: node successfully added"));
        assert!(texts.contains(&"n3: node successfully added"));
        assert!(!texts.contains(&"n2: node successfully added"));
        assert!(messages.iter().any(|m| !m.success && m.message == "n2: preflight errors"));
        assert_eq!(
            messages.last().unwrap().message,
            "An error occurred during adding Node(s): n2 (join)"
        );
        assert_eq!(h.fake.count("salt n2 grains.append"), 0);
        assert_eq!(h.fake.count("token create"), 1);
    }

    #[tokio::test]
    async fn test_token_generated_once_per_batch_and_reused() {
        let h = harness();
        h.fake.on("test.ping", "n1: True\nn2: True\n");
        for _ in 0..2 {
            let o = h.orchestrator.clone();
            let (outcome, _) = run(|sink| async move { o.add_node(workers("n1,n2"), sink).await }).await;
            assert_eq!(outcome, Outcome::Succeeded);
        }
        assert_eq!(h.fake.count("token create"), 1);
    }

    #[tokio::test]
    async fn test_token_failure_stops_before_nodes() {
        let h = harness();
        h.fake.on("test.ping", "n1: True\n");
        h.fake.fail("token create", "admin.conf missing");
        let o = h.orchestrator.clone();
        let (outcome, messages) = run(|sink| async move { o.add_node(workers("n1"), sink).await }).await;

        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(messages.last().unwrap().message, "admin.conf missing");
        assert_eq!(h.fake.count("service.start"), 0);
    }

    #[tokio::test]
    async fn test_master_requires_multi_master() {
        let h = harness();
        let o = h.orchestrator.clone();
        let req = AddNodeRequest { node_names: "m2".into(), role: "master".into() };
        let (outcome, _) = run(|sink| async move { o.add_node(req, sink).await }).await;
        assert_eq!(outcome, Outcome::Failed);
        assert!(h.fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_master_join_uses_certificate_key_and_load_balancer() {
        let h = harness();
        h.orchestrator
            .store()
            .save_metadata(&ClusterMetadata {
                multi_master: "lb.example.com".into(),
                load_balancer: "lb.example.com".into(),
                load_balancer_node: "haproxy1".into(),
                first_master: "m1".into(),
                ..Default::default()
            })
            .unwrap();
        h.fake.on("test.ping", "m2: True\n");
        h.fake.on("upload-certs", "[upload-certs] Using certificate key:\nfeedbeef\n");
        h.fake.fail("haproxycfg server add", "haproxy not running");

        let o = h.orchestrator.clone();
        let req = AddNodeRequest { node_names: "m2".into(), role: "Master".into() };
        let (outcome, messages) = run(|sink| async move { o.add_node(req, sink).await }).await;

        assert_eq!(outcome, Outcome::Succeeded);
        assert_eq!(
            h.fake.count("salt m2 cmd.run kubeadm join 10.0.0.1:6443 --token abc.def --control-plane --certificate-key feedbeef"),
            1
        );
        assert_eq!(h.fake.count("grains.append kubicd kubic-master-node"), 1);
        assert!(messages.iter().any(|m| m.message.starts_with("Warning: m2: adding to load balancer failed")));
    }

    #[tokio::test]
    async fn test_unknown_role() {
        let h = harness();
        let o = h.orchestrator.clone();
        let req = AddNodeRequest { node_names: "n1".into(), role: "etcd".into() };
        let (outcome, messages) = run(|sink| async move { o.add_node(req, sink).await }).await;
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(messages.last().unwrap().message, "Unknown node type 'etcd'");
    }

    #[tokio::test]
    async fn test_closed_stream_stops_before_joining() {
        let h = harness();
        h.fake.on("test.ping", "n1: True\nn2: True\n");
        let sink = sink_closed_after(&h.fake, "token create");

        let result = h.orchestrator.add_node(workers("n1,n2"), sink).await;
        assert_eq!(result, Err(StreamClosed));
        assert!(h.fake.calls().last().unwrap().contains("token create"));
        assert_eq!(h.fake.count("service.start"), 0);
    }
}
