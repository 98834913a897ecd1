//! Removing machines from the cluster, cleaning up as much as possible.

use super::destroy::node_cleanup_steps;
use super::{failure_list, Orchestrator, ProgressSink, StreamClosed, WorkflowResult};
use crate::exec::{parse, CommandOutput, Target};
use crate::state::ClusterMetadata;
use futures::future::join_all;
use slog::{info, warn};

/// Phases of RemoveNode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovePhase {
    Validate,
    Resolve,
    Remove,
    Done,
    Failed(String),
}

impl RemovePhase {
    pub fn next(&self) -> RemovePhase {
        match self {
            RemovePhase::Validate => RemovePhase::Resolve,
            RemovePhase::Resolve => RemovePhase::Remove,
            RemovePhase::Remove => RemovePhase::Done,
            terminal => terminal.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RemovePhase::Done | RemovePhase::Failed(_))
    }
}

impl Orchestrator {
    pub async fn remove_node(&self, node_names: &str, sink: ProgressSink) -> WorkflowResult {
        let mut metadata = ClusterMetadata::default();
        let mut nodes = Vec::new();
        let mut phase = RemovePhase::Validate;
        loop {
            let result = match &phase {
                RemovePhase::Validate => match self.store().metadata() {
                    Ok(loaded) => {
                        metadata = loaded;
                        Ok(())
                    }
                    Err(err) => Err(format!("Cannot load cluster metadata: {}", err)),
                },
                RemovePhase::Resolve => {
                    sink.step("Looking for cluster members...").await?;
                    nodes = self.removable_members(node_names, &metadata, &sink).await?;
                    if nodes.is_empty() {
                        Err("No matching cluster member found".to_string())
                    } else {
                        Ok(())
                    }
                }
                RemovePhase::Remove => {
                    let members = nodes.iter().map(|node| self.remove_one(node, &metadata, &sink));
                    let mut failures = Vec::new();
                    for result in join_all(members).await {
                        if let Some(failure) = result? {
                            failures.push(failure);
                        }
                    }
                    if failures.is_empty() {
                        Ok(())
                    } else {
                        Err(format!(
                            "An error occurred during removing Node(s): {}",
                            failure_list(&failures)
                        ))
                    }
                }
                RemovePhase::Done => return sink.done("Node(s) successfully removed").await,
                RemovePhase::Failed(message) => return sink.fail(message.clone()).await,
            };
            phase = match result {
                Ok(()) => phase.next(),
                Err(message) => RemovePhase::Failed(message),
            };
        }
    }

    /// Members matching `node_names`, without the first master.
    async fn removable_members(
        &self,
        node_names: &str,
        metadata: &ClusterMetadata,
        sink: &ProgressSink,
    ) -> Result<Vec<String>, StreamClosed> {
        let mut nodes = self.resolve_members(node_names).await;
        if !metadata.first_master.is_empty() && nodes.contains(&metadata.first_master) {
            nodes.retain(|node| *node != metadata.first_master);
            sink.warn(format!(
                "{}: the first master cannot be removed, use DestroyMaster instead",
                metadata.first_master
            ))
            .await?;
        }
        Ok(nodes)
    }

    async fn etcdctl(&self, args: &[&str]) -> CommandOutput {
        let pki = self.config().kubernetes_dir.join("pki").join("etcd");
        let ca = pki.join("ca.crt").display().to_string();
        let cert = pki.join("server.crt").display().to_string();
        let key = pki.join("server.key").display().to_string();
        let mut full = vec![
            "--endpoints",
            "https://localhost:2379",
            "--cacert",
            ca.as_str(),
            "--cert",
            cert.as_str(),
            "--key",
            key.as_str(),
        ];
        full.extend_from_slice(args);
        self.exec().local("etcdctl", &full).await
    }

    /// Drop `hostname` from the etcd member list if it is a member.
    async fn remove_etcd_member(&self, hostname: &str) -> CommandOutput {
        let list = self.etcdctl(&["member", "list"]).await;
        if !list.success {
            return list;
        }
        match parse::etcd_member_id(&list.output, hostname) {
            Some(id) => self.etcdctl(&["member", "remove", &id]).await,
            None => CommandOutput::ok(""),
        }
    }

    /// Steps for one machine. Only the reset and the node deletion decide
    /// whether the machine counts as failed.
    async fn remove_one(
        &self,
        node: &str,
        metadata: &ClusterMetadata,
        sink: &ProgressSink,
    ) -> Result<Option<(String, &'static str)>, StreamClosed> {
        let target = Target::Node(node.to_string());
        sink.step(format!("{}: removing node...", node)).await?;

        if metadata.has_load_balancer() {
            let lb = Target::Node(metadata.load_balancer_node.clone());
            let out = self.exec().shell(&lb, &format!("haproxycfg server remove {}", node)).await;
            if !out.success {
                sink.warn(format!("{}: removing from load balancer failed: {}", node, out)).await?;
            }
        }

        let hostname = match self.exec().node_name(node).await {
            Ok(hostname) => hostname,
            Err(out) => {
                sink.error(format!("{}: cannot determine hostname: {}", node, out)).await?;
                return Ok(Some((node.to_string(), "hostname")));
            }
        };

        sink.step(format!("{}: draining node...", node)).await?;
        let out = self.drain(&hostname).await;
        if !out.success {
            sink.warn(format!("{}: drain failed (ignored): {}", node, out)).await?;
        }

        sink.step(format!("{}: verify etcd cluster...", node)).await?;
        let out = self.remove_etcd_member(&hostname).await;
        if !out.success {
            warn!(self.log, "etcd member removal failed"; "node" => node, "error" => %out);
            sink.warn(format!("{}: {} (ignored)", node, out)).await?;
        }

        let mut failed = None;

        sink.step(format!("{}: reset node...", node)).await?;
        let out = self.exec().shell(&target, "kubeadm reset --force").await;
        if !out.success {
            sink.error(format!("{}: {}", node, out)).await?;
            failed = Some((node.to_string(), "reset"));
        }

        sink.step(format!("{}: final node deletion...", node)).await?;
        let out = self.kubectl(&["delete", "node", &hostname]).await;
        if !out.success {
            sink.error(format!("{}: {}", node, out)).await?;
            failed.get_or_insert((node.to_string(), "delete"));
        }

        sink.step(format!("{}: cleanup after kubeadm...", node)).await?;
        for (step, cmdline) in node_cleanup_steps() {
            let out = self.exec().shell(&target, cmdline).await;
            if !out.success {
                sink.warn(format!("{}: {} failed: {}", node, step, out)).await?;
            }
        }
        let out = self.exec().clear_role(node).await;
        if !out.success {
            sink.warn(format!("{}: clearing role failed: {}", node, out)).await?;
        }
        for service in ["kubelet", "crio"] {
            let out = self.exec().disable_service(&target, service).await;
            if !out.success {
                sink.warn(format!("{}: disabling {} failed: {}", node, service, out)).await?;
            }
        }

        if failed.is_none() {
            info!(self.log, "node removed"; "node" => node);
            sink.step(format!("{}: node successfully removed", node)).await?;
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{run, sink_closed_after, texts, Harness};
    use super::super::Outcome;
    use super::*;

    fn harness() -> Harness {
        let h = Harness::new();
        h.fake.on("-G kubicd:kubic-master-node grains.get", "m1: kubic-master-node\nm2: kubic-master-node\n");
        h.fake.on("-G kubicd:kubic-worker-node grains.get", "w1: kubic-worker-node\nw2: kubic-worker-node\n");
        h.fake.on("network.get_hostname", "m1: master1\nm2: master2\nw1: worker1\nw2: worker2\n");
        h.orchestrator
            .store()
            .save_metadata(&ClusterMetadata { first_master: "m1".into(), ..Default::default() })
            .unwrap();
        h
    }

    #[test]
    fn test_phase_transitions() {
        let mut phase = RemovePhase::Validate;
        let mut seen = vec![phase.clone()];
        while !phase.is_terminal() {
            phase = phase.next();
            seen.push(phase.clone());
        }
        assert_eq!(
            seen,
            vec![RemovePhase::Validate, RemovePhase::Resolve, RemovePhase::Remove, RemovePhase::Done]
        );
        assert_eq!(RemovePhase::Failed("x".into()).next(), RemovePhase::Failed("x".into()));
    }

    #[tokio::test]
    async fn test_drain_failure_is_only_a_warning() {
        let h = harness();
        h.fake.on("test.ping", "w1: True\n");
        h.fake.fail("drain worker1", "cannot evict pod");
        let o = h.orchestrator.clone();
        let (outcome, messages) = run(|sink| async move { o.remove_node("w1", sink).await }).await;

        assert_eq!(outcome, Outcome::Succeeded);
        assert!(texts(&messages).contains(&"w1: node successfully removed"));
        assert!(messages.iter().any(|m| m.success && m.message.contains("drain failed (ignored)")));
        assert_eq!(h.fake.count("delete node worker1"), 1);
    }

    #[tokio::test]
    async fn test_cleanup_failures_do_not_abort() {
        let h = harness();
        h.fake.on("test.ping", "w1: True\n");
        h.fake.fail("iptables", "iptables: not found");
        h.fake.fail("grains.delkey", "minion error");
        let o = h.orchestrator.clone();
        let (outcome, _) = run(|sink| async move { o.remove_node("w1", sink).await }).await;

        assert_eq!(outcome, Outcome::Succeeded);
        assert_eq!(h.fake.count("ip link delete cni0"), 1);
        assert_eq!(h.fake.count("salt w1 service.disable crio"), 1);
    }

    #[tokio::test]
    async fn test_reset_failure_marks_node_failed() {
        let h = harness();
        h.fake.on("test.ping", "w1: True\nw2: True\n");
        h.fake.fail("salt w2 cmd.run kubeadm reset", "reset failed");
        let o = h.orchestrator.clone();
        let (outcome, messages) = run(|sink| async move { o.remove_node("w1,w2", sink).await }).await;

        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(
            messages.last().unwrap().message,
            "An error occurred during removing Node(s): w2 (reset)"
        );
        assert!(texts(&messages).contains(&"w1: node successfully removed"));
        // Deletion and cleanup still run for the failed node.
        assert_eq!(h.fake.count("delete node worker2"), 1);
        assert_eq!(h.fake.count("salt w2 grains.delkey"), 1);
    }

    #[tokio::test]
    async fn test_etcd_member_removed() {
        let h = harness();
        h.fake.on("test.ping", "m2: True\n");
        h.fake.on(
            "member list",
            "8e9e05c52164694d, started, master1, https://10.0.0.1:2380, https://10.0.0.1:2379, false\n\
             91bc3c398fb3c146, started, master2, https://10.0.0.2:2380, https://10.0.0.2:2379, false\n",
        );
        let o = h.orchestrator.clone();
        let (outcome, _) = run(|sink| async move { o.remove_node("m2", sink).await }).await;

        assert_eq!(outcome, Outcome::Succeeded);
        assert_eq!(h.fake.count("member remove 91bc3c398fb3c146"), 1);
    }

    #[tokio::test]
    async fn test_wildcard_skips_first_master() {
        let h = harness();
        let o = h.orchestrator.clone();
        let (outcome, messages) = run(|sink| async move { o.remove_node("*", sink).await }).await;

        assert_eq!(outcome, Outcome::Succeeded);
        assert!(messages[1].message.contains("m1: the first master cannot be removed"));
        assert_eq!(h.fake.count("salt m1 cmd.run kubeadm reset"), 0);
        for node in ["m2", "w1", "w2"] {
            assert_eq!(h.fake.count(&format!("salt {} cmd.run kubeadm reset --force", node)), 1);
        }
    }

    #[tokio::test]
    async fn test_load_balancer_removal_failure_is_warning() {
        let h = harness();
        h.orchestrator
            .store()
            .save_metadata(&ClusterMetadata {
                first_master: "m1".into(),
                multi_master: "lb.example.com".into(),
                load_balancer_node: "haproxy1".into(),
                ..Default::default()
            })
            .unwrap();
        h.fake.on("test.ping", "m2: True\n");
        h.fake.fail("haproxycfg server remove", "unknown server");
        let o = h.orchestrator.clone();
        let (outcome, _) = run(|sink| async move { o.remove_node("m2", sink).await }).await;

        assert_eq!(outcome, Outcome::Succeeded);
        let lb = h.fake.position("haproxycfg server remove m2").unwrap();
        let drain = h.fake.position("drain master2").unwrap();
        assert!(lb < drain);
    }

    #[tokio::test]
    async fn test_closed_stream_stops_after_current_command() {
        let h = harness();
        h.fake.on("test.ping", "w1: True\n");
        let sink = sink_closed_after(&h.fake, "drain worker1");

        let result = h.orchestrator.remove_node("w1", sink).await;
        assert_eq!(result, Err(StreamClosed));
        assert!(h.fake.calls().last().unwrap().contains("drain worker1"));
        assert_eq!(h.fake.count("kubeadm reset"), 0);
        assert_eq!(h.fake.count("delete node worker1"), 0);
    }
}
