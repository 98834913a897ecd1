//! Tearing down the local control plane.

use super::{Orchestrator, ProgressSink, WorkflowResult};
use crate::exec::{CommandOutput, Target};
use slog::{info, warn};

const RESTORE_REBOOT_METHOD: &str =
    "sed -i -e 's|^REBOOT_METHOD=kured|REBOOT_METHOD=auto|g' /etc/transactional-update.conf";
const FLUSH_FIREWALL: &str = "iptables -F && iptables -t nat -F && iptables -t mangle -F && iptables -X";
const DELETE_INTERFACES: &str =
    "ip link delete cni0; ip link delete flannel.1; ip link delete cilium_vxlan; ip link delete weave";

impl Orchestrator {
    /// Undo `kubeadm init` on this host and forget the cluster.
    ///
    /// Returns the outcome of `kubeadm reset`; the cleanup after it is best effort.
    pub async fn reset_master(&self) -> CommandOutput {
        let reset = self.exec().local("kubeadm", &["reset", "--force"]).await;
        let local = Target::Local;
        self.exec().shell(&local, "rm -rf /var/lib/etcd/* /var/lib/cni/*").await;
        if let Err(err) = self.store().clear() {
            warn!(self.log, "clearing cluster state failed"; "error" => %err);
        }
        self.exec().disable_service(&local, "crio").await;
        self.exec().disable_service(&local, "kubelet").await;
        reset
    }

    pub async fn destroy_master(&self, sink: ProgressSink) -> WorkflowResult {
        sink.step("Resetting control-plane...").await?;
        let reset = self.reset_master().await;
        if !reset.success {
            sink.step(format!("{} (ignored)", reset)).await?;
        }

        sink.step("Cleaning up host configuration...").await?;
        let local = Target::Local;
        let hook = format!(
            "sed -i -e 's|^REBOOT_METHOD=kured|REBOOT_METHOD=auto|g' {}",
            self.config().transactional_update_conf.display()
        );
        if !self.exec().shell(&local, &hook).await.success {
            sink.warn("restoring the reboot method failed.").await?;
        }
        if !self.exec().shell(&local, FLUSH_FIREWALL).await.success {
            sink.warn("removal of iptables failed.").await?;
        }
        self.exec().shell(&local, DELETE_INTERFACES).await;

        info!(self.log, "control-plane destroyed");
        sink.done("Kubernetes control-plane removed.").await
    }
}

/// Best-effort cleanup run on a removed node, in order.
pub(crate) fn node_cleanup_steps() -> [(&'static str, &'static str); 3] {
    [
        ("restore reboot method", RESTORE_REBOOT_METHOD),
        ("flush firewall", FLUSH_FIREWALL),
        ("delete virtual interfaces", DELETE_INTERFACES),
    ]
}

#[cfg(test)]
mod tests {
    use super::super::testing::{run, texts, Harness};
    use super::super::Outcome;
    use crate::state::{ClusterMetadata, Mechanism};

    #[tokio::test]
    async fn test_destroy_ignores_reset_failure_and_clears_state() {
        let h = Harness::new();
        let store = h.orchestrator.store().clone();
        store
            .save_metadata(&ClusterMetadata { kubernetes_version: "v1.18.3".into(), ..Default::default() })
            .unwrap();
        let mut hashes = store.hashes(Mechanism::Helm).unwrap();
        hashes.set("stable/nginx", "abc");
        hashes.save().unwrap();
        h.fake.fail("kubeadm reset", "reset failed");
        h.fake.fail("iptables", "no iptables");

        let o = h.orchestrator.clone();
        let (outcome, messages) = run(|sink| async move { o.destroy_master(sink).await }).await;

        assert_eq!(outcome, Outcome::Succeeded);
        let texts = texts(&messages);
        assert!(texts.contains(&"reset failed (ignored)"));
        assert!(texts.contains(&"Warning: removal of iptables failed."));
        assert!(messages.iter().all(|m| m.success));
        assert!(!store.metadata_path().exists());
        assert!(!store.hashes_path(Mechanism::Helm).exists());
        assert_eq!(h.fake.count("systemctl disable --now kubelet"), 1);
    }
}
