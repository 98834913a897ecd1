//! Tracked cluster add-ons and how each is rendered and applied.

use super::drift::{DriftCheck, DriftDetector, DriftError};
use crate::config::DaemonConfig;
use crate::exec::{CommandOutput, RemoteExecutor};
use crate::state::{Mechanism, StoreError};
use slog::{info, Logger};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// A pod network add-on shipped as a manifest below the manifest directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PodNetwork {
    pub name: &'static str,
    pub manifest: &'static str,
    pub cidr: Option<&'static str>,
}

pub const POD_NETWORKS: [PodNetwork; 3] = [
    PodNetwork { name: "flannel", manifest: "flannel/kube-flannel.yaml", cidr: Some("10.244.0.0/16") },
    PodNetwork { name: "cilium", manifest: "cilium/cilium.yaml", cidr: Some("10.217.0.0/16") },
    PodNetwork { name: "weave", manifest: "weave/weave.yaml", cidr: None },
];

/// Reboot coordination daemon.
pub const KURED_MANIFEST: &str = "kured/kured.yaml";

/// Look up a pod network by name; empty means weave.
pub fn pod_network(choice: &str) -> Option<PodNetwork> {
    let choice = choice.trim();
    let choice = if choice.is_empty() { "weave" } else { choice };
    POD_NETWORKS.iter().copied().find(|net| net.name.eq_ignore_ascii_case(choice))
}

/// Something the daemon applied to the cluster and keeps a hash of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// Plain manifest, keyed by its full path.
    Manifest(PathBuf),
    Helm(HelmRelease),
    /// Overlay below `<state_dir>/kustomize/<service>`.
    Kustomize(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelmRelease {
    pub chart: String,
    pub release: String,
    pub values_path: String,
    pub namespace: String,
}

impl HelmRelease {
    fn metadata(&self) -> Vec<(String, String)> {
        vec![
            (format!("{}.releaseName", self.chart), self.release.clone()),
            (format!("{}.valuesPath", self.chart), self.values_path.clone()),
            (format!("{}.namespace", self.chart), self.namespace.clone()),
        ]
    }
}

impl Artifact {
    pub fn mechanism(&self) -> Mechanism {
        match self {
            Artifact::Manifest(_) => Mechanism::Manifest,
            Artifact::Helm(_) => Mechanism::Helm,
            Artifact::Kustomize(_) => Mechanism::Kustomize,
        }
    }

    /// Key of the hash record.
    pub fn key(&self) -> String {
        match self {
            Artifact::Manifest(path) => path.display().to_string(),
            Artifact::Helm(release) => release.chart.clone(),
            Artifact::Kustomize(service) => service.clone(),
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// What a gated apply did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Unchanged,
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Drift(#[from] DriftError),
    #[error("applying {artifact} failed: {message}")]
    Apply { artifact: String, message: String },
    #[error("recording hash of {artifact} failed: {err}")]
    Record {
        artifact: String,
        #[source]
        err: StoreError,
    },
}

/// Renders and applies artifacts, keeping the hash records current.
#[derive(Clone)]
pub struct ArtifactDeployer {
    config: Arc<DaemonConfig>,
    exec: RemoteExecutor,
    drift: DriftDetector,
    log: Logger,
}

impl ArtifactDeployer {
    pub fn new(config: Arc<DaemonConfig>, exec: RemoteExecutor, drift: DriftDetector, log: Logger) -> Self {
        Self { config, exec, drift, log }
    }

    pub fn drift(&self) -> &DriftDetector {
        &self.drift
    }

    pub fn manifest(&self, relative: &str) -> Artifact {
        Artifact::Manifest(self.config.manifest_dir.join(relative))
    }

    /// A manifest counts as installed when its file exists.
    pub fn is_installed(&self, artifact: &Artifact) -> bool {
        match artifact {
            Artifact::Manifest(path) => path.is_file(),
            Artifact::Helm(_) => true,
            Artifact::Kustomize(service) => self.kustomize_overlay(service).is_dir(),
        }
    }

    fn kustomize_overlay(&self, service: &str) -> PathBuf {
        self.config.state_dir.join("kustomize").join(service).join("overlay")
    }

    fn kustomize_output(&self, service: &str) -> PathBuf {
        self.config.state_dir.join("kustomize").join(service).join(format!("{}.yaml", service))
    }

    fn helm_args<'a>(&'a self, verb: &'a str, release: &'a HelmRelease, kubeconfig: &'a str) -> Vec<&'a str> {
        let mut args = vec![verb, release.release.as_str(), release.chart.as_str(), kubeconfig];
        if !release.values_path.is_empty() {
            args.push("-f");
            args.push(release.values_path.as_str());
        }
        args.push("--namespace");
        args.push(if release.namespace.is_empty() { "default" } else { release.namespace.as_str() });
        args
    }

    /// Produce the current form of an artifact.
    pub async fn render(&self, artifact: &Artifact) -> CommandOutput {
        match artifact {
            Artifact::Manifest(path) => match tokio::fs::read_to_string(path).await {
                Ok(contents) => CommandOutput::ok(contents),
                Err(err) => CommandOutput::failed(format!("Cannot read {}: {}", path.display(), err)),
            },
            Artifact::Helm(release) => {
                let kubeconfig = self.config.kubeconfig_arg();
                let args = self.helm_args("template", release, &kubeconfig);
                self.exec.local("helm", &args).await
            }
            Artifact::Kustomize(service) => {
                let overlay = self.kustomize_overlay(service).display().to_string();
                self.exec.local("kustomize", &["build", &overlay]).await
            }
        }
    }

    async fn apply_rendered(&self, artifact: &Artifact, rendered: &str, first: bool) -> CommandOutput {
        let kubeconfig = self.config.kubeconfig_arg();
        match artifact {
            Artifact::Manifest(path) => {
                let path = path.display().to_string();
                self.exec.local("kubectl", &[&kubeconfig, "apply", "-f", &path]).await
            }
            Artifact::Helm(release) => {
                let verb = if first { "install" } else { "upgrade" };
                let args = self.helm_args(verb, release, &kubeconfig);
                self.exec.local("helm", &args).await
            }
            Artifact::Kustomize(service) => {
                let output = self.kustomize_output(service);
                if let Err(err) = tokio::fs::write(&output, rendered).await {
                    return CommandOutput::failed(format!("Cannot write {}: {}", output.display(), err));
                }
                let output = output.display().to_string();
                self.exec.local("kubectl", &[&kubeconfig, "apply", "-f", &output]).await
            }
        }
    }

    pub async fn check(&self, artifact: &Artifact) -> Result<DriftCheck, DriftError> {
        self.drift
            .needs_update(artifact.mechanism(), &artifact.key(), || self.render(artifact))
            .await
    }

    /// Apply when drifted or forced; the hash is recorded only after success.
    pub async fn apply(&self, artifact: &Artifact, force: bool) -> Result<ApplyOutcome, ApplyError> {
        let check = self.check(artifact).await?;
        if !check.needs_update && !force {
            info!(self.log, "artifact unchanged"; "artifact" => %artifact);
            return Ok(ApplyOutcome::Unchanged);
        }

        let first = self
            .drift
            .recorded(artifact.mechanism(), &artifact.key())
            .map_err(DriftError::from)?
            .is_none();
        let out = self.apply_rendered(artifact, &check.rendered, first).await;
        if !out.success {
            return Err(ApplyError::Apply { artifact: artifact.key(), message: out.output });
        }

        let extra = match artifact {
            Artifact::Helm(release) => release.metadata(),
            _ => Vec::new(),
        };
        self.drift
            .record_with(artifact.mechanism(), &artifact.key(), &check.hash, &extra)
            .map_err(|err| ApplyError::Record { artifact: artifact.key(), err })?;
        info!(self.log, "artifact applied"; "artifact" => %artifact, "mechanism" => %artifact.mechanism());
        Ok(ApplyOutcome::Applied)
    }

    /// Every artifact with a hash record for `mechanism`.
    pub fn tracked(&self, mechanism: Mechanism) -> Result<Vec<Artifact>, StoreError> {
        let records = self.drift.records(mechanism)?;
        let artifacts = match mechanism {
            Mechanism::Manifest => records
                .keys()
                .into_iter()
                .map(|key| Artifact::Manifest(PathBuf::from(key)))
                .collect(),
            Mechanism::Helm => records
                .keys()
                .into_iter()
                .filter(|key| !is_helm_metadata_key(key))
                .map(|chart| {
                    let field = |suffix: &str| {
                        records.get(&format!("{}.{}", chart, suffix)).unwrap_or_default().to_string()
                    };
                    Artifact::Helm(HelmRelease {
                        release: field("releaseName"),
                        values_path: field("valuesPath"),
                        namespace: field("namespace"),
                        chart,
                    })
                })
                .collect(),
            Mechanism::Kustomize => records.keys().into_iter().map(Artifact::Kustomize).collect(),
        };
        Ok(artifacts)
    }
}

fn is_helm_metadata_key(key: &str) -> bool {
    [".releaseName", ".valuesPath", ".namespace"]
        .iter()
        .any(|suffix| key.ends_with(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::FakeRunner;
    use crate::logging::test_logger;
    use crate::state::StateStore;

    fn deployer(root: &std::path::Path, fake: &Arc<FakeRunner>) -> ArtifactDeployer {
        let config = Arc::new(DaemonConfig::rooted_at(root));
        let exec = RemoteExecutor::new(fake.clone().as_runner(), test_logger());
        let drift = DriftDetector::new(StateStore::new(&config.state_dir));
        ArtifactDeployer::new(config, exec, drift, test_logger())
    }

    #[test]
    fn test_pod_network_lookup() {
        assert_eq!(pod_network("").map(|n| n.name), Some("weave"));
        assert_eq!(pod_network("Flannel").and_then(|n| n.cidr), Some("10.244.0.0/16"));
        assert_eq!(pod_network("cilium").map(|n| n.manifest), Some("cilium/cilium.yaml"));
        assert_eq!(pod_network("calico"), None);
    }

    #[tokio::test]
    async fn test_manifest_apply_is_gated() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeRunner::new(test_logger());
        let deployer = deployer(dir.path(), &fake);

        let kured = deployer.manifest(KURED_MANIFEST);
        let Artifact::Manifest(path) = &kured else { panic!("not a manifest") };
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "kind: DaemonSet\n").unwrap();
        assert!(deployer.is_installed(&kured));

        assert_eq!(deployer.apply(&kured, false).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(deployer.apply(&kured, false).await.unwrap(), ApplyOutcome::Unchanged);
        assert_eq!(deployer.apply(&kured, true).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(fake.count("apply -f"), 2);
        assert_eq!(deployer.tracked(Mechanism::Manifest).unwrap(), vec![kured]);
    }

    #[tokio::test]
    async fn test_failed_apply_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeRunner::new(test_logger());
        fake.fail("kubectl", "the server could not find the requested resource");
        let deployer = deployer(dir.path(), &fake);

        let flannel = deployer.manifest("flannel/kube-flannel.yaml");
        let Artifact::Manifest(path) = &flannel else { panic!("not a manifest") };
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "kind: DaemonSet\n").unwrap();

        let err = deployer.apply(&flannel, false).await.unwrap_err();
        assert!(matches!(err, ApplyError::Apply { .. }));
        assert_eq!(deployer.drift().recorded(Mechanism::Manifest, &flannel.key()).unwrap(), None);
    }

    #[tokio::test]
    async fn test_helm_install_then_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeRunner::new(test_logger());
        fake.on("helm template", "rendered-v1");
        let deployer = deployer(dir.path(), &fake);

        let release = Artifact::Helm(HelmRelease {
            chart: "stable/nginx".into(),
            release: "web".into(),
            values_path: String::new(),
            namespace: String::new(),
        });
        deployer.apply(&release, false).await.unwrap();
        assert_eq!(fake.count("helm install web stable/nginx"), 1);

        fake.on("helm template", "rendered-v2");
        deployer.apply(&release, false).await.unwrap();
        assert_eq!(fake.count("helm upgrade web stable/nginx"), 1);
        assert_eq!(fake.count("--namespace default"), 4);

        let tracked = deployer.tracked(Mechanism::Helm).unwrap();
        assert_eq!(tracked, vec![release]);
    }
}
