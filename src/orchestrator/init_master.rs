//! Bootstrapping the first control-plane node on the local host.

use super::artifacts::{pod_network, PodNetwork, KURED_MANIFEST};
use super::nodes::ROLE_MASTER;
use super::{Orchestrator, ProgressSink, WorkflowResult};
use crate::exec::{parse, Target};
use crate::state::{ClusterMetadata, KvFile};
use slog::{error, info, warn};

const CRI_SOCKET: &str = "/run/crio/crio.sock";
const DEVEL_IMAGE_REPOSITORY: &str = "registry.opensuse.org/devel/kubic/containers/container/kubic";
const CONTROL_PLANE_MANIFESTS: [&str; 3] = ["kube-apiserver.yaml", "kube-scheduler.yaml", "etcd.yaml"];

/// Parameters of a control-plane bootstrap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitRequest {
    /// Pod network add-on; empty selects the default.
    pub pod_networking: String,
    pub adv_addr: String,
    /// Control-plane endpoint (usually a load balancer DNS name); non-empty
    /// makes the cluster multi-master.
    pub multi_master: String,
    /// Empty means the version of the installed kubeadm package.
    pub kubernetes_version: String,
    pub stage: String,
    /// Fleet id of the haproxy machine in front of the API servers.
    pub load_balancer_node: String,
    /// Comma separated extra SANs for the API server certificate.
    pub apiserver_cert_extra_sans: String,
    /// Fleet id of this host; empty means its hostname.
    pub first_master_node: String,
}

/// Steps of the bootstrap. Each non-terminal variant names the step in
/// flight; a progress message is sent when it is entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitState {
    /// Validate the host and the request. No side effects.
    Preflight,
    /// Enable the container runtime, then the kubelet.
    ServicesEnabled,
    /// Run kubeadm init.
    ClusterBootstrapped,
    /// Apply the pod network.
    NetworkDeployed,
    /// Apply kured.
    RebootDaemonDeployed,
    /// Record the cluster; reached only when every step succeeded.
    Done,
    Failed(String),
}

impl InitState {
    pub fn next(&self) -> InitState {
        match self {
            InitState::Preflight => InitState::ServicesEnabled,
            InitState::ServicesEnabled => InitState::ClusterBootstrapped,
            InitState::ClusterBootstrapped => InitState::NetworkDeployed,
            InitState::NetworkDeployed => InitState::RebootDaemonDeployed,
            InitState::RebootDaemonDeployed => InitState::Done,
            terminal => terminal.clone(),
        }
    }

    /// Whether a failure of this step must reset the host.
    pub fn resets_on_failure(&self) -> bool {
        matches!(
            self,
            InitState::ClusterBootstrapped | InitState::NetworkDeployed | InitState::RebootDaemonDeployed
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InitState::Done | InitState::Failed(_))
    }
}

/// Facts established by the preflight step.
#[derive(Debug, Default)]
struct InitPlan {
    network: Option<PodNetwork>,
    version: String,
    image_repository: Option<&'static str>,
    first_master: String,
}

impl InitPlan {
    fn network_name(&self) -> &str {
        self.network.map(|n| n.name).unwrap_or("pod network")
    }
}

fn announcement(state: &InitState, plan: &InitPlan) -> Option<String> {
    let text = match state {
        InitState::Preflight => "Checking prerequisites...".to_string(),
        InitState::ServicesEnabled => "Enabling container runtime and kubelet...".to_string(),
        InitState::ClusterBootstrapped => "Initialize Kubernetes control-plane...".to_string(),
        InitState::NetworkDeployed => format!("Deploy pod network ({})...", plan.network_name()),
        InitState::RebootDaemonDeployed => "Deploy Kubernetes Reboot Daemon (kured)...".to_string(),
        InitState::Done | InitState::Failed(_) => return None,
    };
    Some(text)
}

impl Orchestrator {
    pub async fn init_master(&self, req: InitRequest, sink: ProgressSink) -> WorkflowResult {
        let mut plan = InitPlan::default();
        let mut state = InitState::Preflight;
        loop {
            if let Some(text) = announcement(&state, &plan) {
                sink.step(text).await?;
            }
            let result = match &state {
                InitState::Preflight => self.init_preflight(&req, &mut plan).await,
                InitState::ServicesEnabled => self.init_services().await,
                InitState::ClusterBootstrapped => self.init_bootstrap(&req, &plan).await,
                InitState::NetworkDeployed => match plan.network {
                    Some(network) => self.init_apply(network.manifest).await,
                    None => Err("no pod network selected".to_string()),
                },
                InitState::RebootDaemonDeployed => self.init_apply(KURED_MANIFEST).await,
                InitState::Done => return self.init_finish(&req, &plan, &sink).await,
                InitState::Failed(message) => return sink.fail(message.clone()).await,
            };
            state = match result {
                Ok(()) => state.next(),
                Err(message) => {
                    warn!(self.log, "control-plane initialization failed"; "step" => ?state, "error" => &message);
                    if state.resets_on_failure() {
                        sink.step("Resetting control-plane...").await?;
                        let reset = self.reset_master().await;
                        if !reset.success {
                            sink.warn(format!("reset failed: {}", reset)).await?;
                        }
                    }
                    InitState::Failed(message)
                }
            };
        }
    }

    async fn init_preflight(&self, req: &InitRequest, plan: &mut InitPlan) -> Result<(), String> {
        for manifest in CONTROL_PLANE_MANIFESTS {
            if self.config().static_manifest(manifest).exists() {
                return Err("Seems like a kubernetes control-plane is already running. \
                            If not, please use \"kubeadm reset\" to clean up the system."
                    .to_string());
            }
        }

        plan.image_repository = match req.stage.trim() {
            "" | "official" => None,
            "devel" => Some(DEVEL_IMAGE_REPOSITORY),
            other => return Err(format!("Unknown stage '{}'", other)),
        };

        let network = pod_network(&req.pod_networking)
            .ok_or_else(|| format!("Unsupported pod network '{}'", req.pod_networking))?;
        if !self.deployer().is_installed(&self.deployer().manifest(network.manifest)) {
            return Err(format!("Pod network '{}' is not installed", network.name));
        }
        plan.network = Some(network);
        if !self.deployer().is_installed(&self.deployer().manifest(KURED_MANIFEST)) {
            return Err("Kubernetes Reboot Daemon (kured) is not installed".to_string());
        }

        plan.version = if req.kubernetes_version.trim().is_empty() {
            let out = self
                .exec()
                .local("rpm", &["-q", "--qf", "'%{VERSION}'", "kubernetes-kubeadm"])
                .await;
            if out.success {
                parse::normalize_version(&parse::package_version(&out.output))
            } else {
                String::new()
            }
        } else {
            parse::normalize_version(&req.kubernetes_version)
        };

        plan.first_master = if req.first_master_node.trim().is_empty() {
            let out = self.exec().local("hostname", &[]).await;
            if out.success { out.trimmed().to_string() } else { String::new() }
        } else {
            req.first_master_node.trim().to_string()
        };
        Ok(())
    }

    async fn init_services(&self) -> Result<(), String> {
        let crio = self.exec().enable_service(&Target::Local, "crio").await;
        if !crio.success {
            return Err(crio.output);
        }
        let kubelet = self.exec().enable_service(&Target::Local, "kubelet").await;
        if !kubelet.success {
            self.exec().disable_service(&Target::Local, "crio").await;
            return Err(kubelet.output);
        }
        Ok(())
    }

    async fn init_bootstrap(&self, req: &InitRequest, plan: &InitPlan) -> Result<(), String> {
        if !req.load_balancer_node.trim().is_empty() {
            let cmdline = format!("haproxycfg initialize {} {}", req.multi_master.trim(), plan.first_master);
            let out = self
                .exec()
                .shell(&Target::Node(req.load_balancer_node.trim().to_string()), &cmdline)
                .await;
            if !out.success {
                return Err(out.output);
            }
        }

        let args = if req.multi_master.trim().is_empty() {
            single_master_args(req, plan)
        } else {
            let path = self.config().state_dir.join("kubeadm-init.yaml");
            let contents = multi_master_config(req, plan);
            if let Err(err) = tokio::fs::create_dir_all(&self.config().state_dir).await {
                return Err(format!("Cannot create {}: {}", self.config().state_dir.display(), err));
            }
            if let Err(err) = tokio::fs::write(&path, contents).await {
                return Err(format!("Cannot write {}: {}", path.display(), err));
            }
            vec![
                "init".to_string(),
                "--config".to_string(),
                path.display().to_string(),
                "--upload-certs".to_string(),
            ]
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.exec().local("kubeadm", &args).await;
        if out.success {
            Ok(())
        } else {
            Err(out.output)
        }
    }

    async fn init_apply(&self, manifest: &str) -> Result<(), String> {
        // Hash records of an earlier cluster do not describe this one.
        self.deployer()
            .apply(&self.deployer().manifest(manifest), true)
            .await
            .map(|_| ())
            .map_err(|err| err.to_string())
    }

    async fn init_finish(&self, req: &InitRequest, plan: &InitPlan, sink: &ProgressSink) -> WorkflowResult {
        let metadata = ClusterMetadata {
            kubernetes_version: plan.version.clone(),
            multi_master: req.multi_master.trim().to_string(),
            load_balancer: if req.load_balancer_node.trim().is_empty() {
                String::new()
            } else {
                req.multi_master.trim().to_string()
            },
            load_balancer_node: req.load_balancer_node.trim().to_string(),
            first_master: plan.first_master.clone(),
        };
        if let Err(err) = self.store().save_metadata(&metadata) {
            error!(self.log, "saving cluster metadata failed after bootstrap"; "error" => %err);
            sink.warn(
                "The control-plane is running without cluster metadata. \
                 Run DestroyMaster (kubicctl destroy-cluster) before initializing again.",
            )
            .await?;
            return sink
                .fail(format!("Kubernetes is running but the cluster metadata could not be saved: {}", err))
                .await;
        }

        if !plan.first_master.is_empty() {
            let tagged = self.exec().set_role(&plan.first_master, ROLE_MASTER).await;
            if !tagged.success {
                sink.warn(format!("{}: tagging as master failed: {}", plan.first_master, tagged)).await?;
            }
        }

        let hook = &self.config().transactional_update_conf;
        let configured = KvFile::load(hook).and_then(|mut conf| {
            conf.set("REBOOT_METHOD", "kured");
            conf.save()
        });
        if let Err(err) = configured {
            warn!(self.log, "configuring transactional-update failed"; "error" => %err);
            sink.warn(format!(
                "Adjusting transactional-update to use kured for reboot failed.\n\
                 Please adjust {} yourself.",
                hook.display()
            ))
            .await?;
        }

        info!(self.log, "control-plane initialized"; "version" => &plan.version);
        sink.done("Kubernetes master was successfully setup.").await
    }
}

fn single_master_args(req: &InitRequest, plan: &InitPlan) -> Vec<String> {
    let mut args = vec!["init".to_string(), format!("--cri-socket={}", CRI_SOCKET)];
    if let Some(cidr) = plan.network.and_then(|n| n.cidr) {
        args.push(format!("--pod-network-cidr={}", cidr));
    }
    if !plan.version.is_empty() {
        args.push(format!("--kubernetes-version={}", plan.version));
    }
    if !req.adv_addr.trim().is_empty() {
        args.push(format!("--apiserver-advertise-address={}", req.adv_addr.trim()));
    }
    if !req.apiserver_cert_extra_sans.trim().is_empty() {
        args.push(format!("--apiserver-cert-extra-sans={}", req.apiserver_cert_extra_sans.trim()));
    }
    if let Some(repository) = plan.image_repository {
        args.push(format!("--image-repository={}", repository));
    }
    args
}

/// kubeadm configuration for a cluster behind a shared control-plane endpoint.
fn multi_master_config(req: &InitRequest, plan: &InitPlan) -> String {
    let endpoint = req.multi_master.trim();
    let endpoint_with_port = if endpoint.contains(':') {
        endpoint.to_string()
    } else {
        format!("{}:6443", endpoint)
    };
    let host = endpoint.split(':').next().unwrap_or(endpoint);

    let mut yaml = String::from("apiVersion: kubeadm.k8s.io/v1beta2\nkind: InitConfiguration\n");
    yaml.push_str(&format!("nodeRegistration:\n  criSocket: {}\n", CRI_SOCKET));
    if !req.adv_addr.trim().is_empty() {
        yaml.push_str(&format!("localAPIEndpoint:\n  advertiseAddress: {}\n", req.adv_addr.trim()));
    }
    yaml.push_str("---\napiVersion: kubeadm.k8s.io/v1beta2\nkind: ClusterConfiguration\n");
    if !plan.version.is_empty() {
        yaml.push_str(&format!("kubernetesVersion: {}\n", plan.version));
    }
    yaml.push_str(&format!("controlPlaneEndpoint: \"{}\"\n", endpoint_with_port));
    if let Some(repository) = plan.image_repository {
        yaml.push_str(&format!("imageRepository: {}\n", repository));
    }
    yaml.push_str(&format!("apiServer:\n  certSANs:\n  - \"{}\"\n", host));
    for san in req.apiserver_cert_extra_sans.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        yaml.push_str(&format!("  - \"{}\"\n", san));
    }
    if let Some(cidr) = plan.network.and_then(|n| n.cidr) {
        yaml.push_str(&format!("networking:\n  podSubnet: {}\n", cidr));
    }
    yaml
}

#[cfg(test)]
mod tests {
    use super::super::testing::{run, texts, Harness};
    use super::super::Outcome;
    use super::*;

    fn installed() -> Harness {
        let h = Harness::new();
        h.install_manifest("flannel/kube-flannel.yaml", "kind: DaemonSet\nmetadata:\n  name: flannel\n");
        h.install_manifest("kured/kured.yaml", "kind: DaemonSet\nmetadata:\n  name: kured\n");
        h.fake.on("rpm -q", "'1.18.3'");
        h.fake.on("hostname", "master1\n");
        h
    }

    fn flannel() -> InitRequest {
        InitRequest { pod_networking: "flannel".into(), ..Default::default() }
    }

    #[test]
    fn test_state_transitions() {
        let mut state = InitState::Preflight;
        let mut seen = vec![state.clone()];
        while !state.is_terminal() {
            state = state.next();
            seen.push(state.clone());
        }
        assert_eq!(
            seen,
            vec![
                InitState::Preflight,
                InitState::ServicesEnabled,
                InitState::ClusterBootstrapped,
                InitState::NetworkDeployed,
                InitState::RebootDaemonDeployed,
                InitState::Done,
            ]
        );
        assert!(!InitState::Preflight.resets_on_failure());
        assert!(!InitState::ServicesEnabled.resets_on_failure());
        assert!(InitState::NetworkDeployed.resets_on_failure());
        assert_eq!(InitState::Failed("x".into()).next(), InitState::Failed("x".into()));
    }

    #[tokio::test]
    async fn test_init_flannel_end_to_end() {
        let h = installed();
        let o = h.orchestrator.clone();
        let (outcome, messages) = run(|sink| async move { o.init_master(flannel(), sink).await }).await;

        assert_eq!(outcome, Outcome::Succeeded);
        assert!(messages.iter().all(|m| m.success));
        assert_eq!(
            texts(&messages),
            vec![
                "Checking prerequisites...",
                "Enabling container runtime and kubelet...",
                "Initialize Kubernetes control-plane...",
                "Deploy pod network (flannel)...",
                "Deploy Kubernetes Reboot Daemon (kured)...",
                "Kubernetes master was successfully setup.",
            ]
        );

        let init = h.fake.calls().into_iter().find(|c| c.starts_with("kubeadm init")).unwrap();
        assert_eq!(
            init,
            "kubeadm init --cri-socket=/run/crio/crio.sock --pod-network-cidr=10.244.0.0/16 --kubernetes-version=v1.18.3"
        );

        let meta = h.orchestrator.store().metadata().unwrap();
        assert_eq!(meta.kubernetes_version, "v1.18.3");
        assert!(!meta.is_multi_master());
        assert_eq!(meta.first_master, "master1");

        let hook = std::fs::read_to_string(&h.orchestrator.config().transactional_update_conf).unwrap();
        assert!(hook.contains("REBOOT_METHOD=kured"));
    }

    #[tokio::test]
    async fn test_metadata_save_failure_points_to_destroy() {
        let h = installed();
        // A directory where the metadata file belongs makes the save fail.
        std::fs::create_dir_all(h.orchestrator.store().metadata_path()).unwrap();
        let o = h.orchestrator.clone();
        let (outcome, messages) = run(|sink| async move { o.init_master(flannel(), sink).await }).await;

        assert_eq!(outcome, Outcome::Failed);
        let n = messages.len();
        assert!(messages[n - 2].success);
        assert!(messages[n - 2].message.starts_with("Warning: The control-plane is running"));
        assert!(messages[n - 2].message.contains("DestroyMaster"));
        assert!(messages[n - 1]
            .message
            .starts_with("Kubernetes is running but the cluster metadata could not be saved"));
        // The cluster is left up for the operator to tear down.
        assert_eq!(h.fake.count("kubeadm reset"), 0);
    }

    #[tokio::test]
    async fn test_existing_control_plane_rejected_without_side_effects() {
        let h = installed();
        let manifest = h.orchestrator.config().static_manifest("etcd.yaml");
        std::fs::create_dir_all(manifest.parent().unwrap()).unwrap();
        std::fs::write(&manifest, "").unwrap();

        let o = h.orchestrator.clone();
        let (outcome, messages) = run(|sink| async move { o.init_master(flannel(), sink).await }).await;
        assert_eq!(outcome, Outcome::Failed);
        assert!(messages.last().unwrap().message.contains("already running"));
        assert_eq!(h.fake.count("systemctl"), 0);
        assert_eq!(h.fake.count("kubeadm"), 0);
    }

    #[tokio::test]
    async fn test_unknown_network_and_stage_fail_preflight() {
        let h = installed();
        let o = h.orchestrator.clone();
        let req = InitRequest { pod_networking: "calico".into(), ..Default::default() };
        let (outcome, _) = run(|sink| async move { o.init_master(req, sink).await }).await;
        assert_eq!(outcome, Outcome::Failed);

        let o = h.orchestrator.clone();
        let req = InitRequest { stage: "nightly".into(), ..flannel() };
        let (outcome, messages) = run(|sink| async move { o.init_master(req, sink).await }).await;
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(messages.last().unwrap().message, "Unknown stage 'nightly'");
        assert_eq!(h.fake.count("systemctl"), 0);
    }

    #[tokio::test]
    async fn test_missing_network_manifest() {
        let h = installed();
        let o = h.orchestrator.clone();
        let req = InitRequest { pod_networking: "cilium".into(), ..Default::default() };
        let (outcome, messages) = run(|sink| async move { o.init_master(req, sink).await }).await;
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(messages.last().unwrap().message, "Pod network 'cilium' is not installed");
    }

    #[tokio::test]
    async fn test_kubelet_failure_disables_runtime() {
        let h = installed();
        h.fake.fail("enable --now kubelet", "unit not found");
        let o = h.orchestrator.clone();
        let (outcome, messages) = run(|sink| async move { o.init_master(flannel(), sink).await }).await;

        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(messages.last().unwrap().message, "unit not found");
        assert_eq!(h.fake.count("systemctl disable --now crio"), 1);
        assert_eq!(h.fake.count("kubeadm init"), 0);
    }

    #[tokio::test]
    async fn test_network_failure_resets() {
        let h = installed();
        h.fake.fail("kube-flannel.yaml", "connection refused");
        let o = h.orchestrator.clone();
        let (outcome, messages) = run(|sink| async move { o.init_master(flannel(), sink).await }).await;

        assert_eq!(outcome, Outcome::Failed);
        assert!(texts(&messages).contains(&"Resetting control-plane..."));
        assert_eq!(h.fake.count("kubeadm reset --force"), 1);
        assert_eq!(h.fake.count("kured.yaml"), 0);
        assert_eq!(h.orchestrator.store().metadata().unwrap(), ClusterMetadata::default());
    }

    #[tokio::test]
    async fn test_multi_master_with_load_balancer() {
        let h = installed();
        let o = h.orchestrator.clone();
        let req = InitRequest {
            multi_master: "lb.example.com".into(),
            load_balancer_node: "haproxy1".into(),
            stage: "devel".into(),
            apiserver_cert_extra_sans: "10.0.0.10, api.example.com".into(),
            ..flannel()
        };
        let (outcome, _) = run(|sink| async move { o.init_master(req, sink).await }).await;
        assert_eq!(outcome, Outcome::Succeeded);

        let lb = h.fake.position("haproxycfg initialize lb.example.com master1").unwrap();
        let init = h.fake.position("kubeadm init --config").unwrap();
        assert!(lb < init);
        assert_eq!(h.fake.count("--upload-certs"), 1);

        let config = std::fs::read_to_string(h.orchestrator.config().state_dir.join("kubeadm-init.yaml")).unwrap();
        assert!(config.contains("controlPlaneEndpoint: \"lb.example.com:6443\""));
        assert!(config.contains("- \"api.example.com\""));
        assert!(config.contains("podSubnet: 10.244.0.0/16"));
        assert!(config.contains(DEVEL_IMAGE_REPOSITORY));

        let meta = h.orchestrator.store().metadata().unwrap();
        assert!(meta.is_multi_master());
        assert_eq!(meta.load_balancer, "lb.example.com");
        assert_eq!(meta.load_balancer_node, "haproxy1");
    }
}
