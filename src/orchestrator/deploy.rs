//! Add-on deployment through Kustomize overlays and Helm charts.

use super::artifacts::{Artifact, HelmRelease};
use super::Orchestrator;
use slog::{info, warn};
use std::io;
use std::path::Path;

const METALLB_KUSTOMIZATION: &str = "resources:\n  - ../base\n  - layer2-config.yaml\n";
const HELLO_KUBIC_BASE: &str = "resources:\n  - ../base\n";
const HELLO_KUBIC_PATCHED: &str = "resources:\n  - ../base\npatchesStrategicMerge:\n  - patch.yaml\n";

fn metallb_layer2(range: &str) -> String {
    format!(
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  namespace: metallb-system\n  name: config\n\
         data:\n  config: |\n    address-pools:\n    - name: my-ip-space\n      protocol: layer2\n\
         \x20     addresses:\n      - {}\n",
        range
    )
}

fn hello_kubic_patch(line: &str) -> String {
    format!(
        "apiVersion: v1\nkind: Service\nmetadata:\n  name: hello-kubic\nspec:\n  {}\n",
        line
    )
}

/// Files of the overlay for a supported service.
fn overlay_files(service: &str, argument: &str) -> Result<Vec<(&'static str, String)>, String> {
    let argument = argument.trim();
    match service {
        "metallb" => {
            if argument.is_empty() {
                return Err("metallb needs an address range".to_string());
            }
            Ok(vec![
                ("kustomization.yaml", METALLB_KUSTOMIZATION.to_string()),
                ("layer2-config.yaml", metallb_layer2(argument)),
            ])
        }
        "hello-kubic" => {
            if argument.eq_ignore_ascii_case("NodePort") {
                Ok(vec![
                    ("kustomization.yaml", HELLO_KUBIC_PATCHED.to_string()),
                    ("patch.yaml", hello_kubic_patch("type: NodePort")),
                ])
            } else if argument.is_empty() || argument.eq_ignore_ascii_case("LoadBalancer") {
                Ok(vec![("kustomization.yaml", HELLO_KUBIC_BASE.to_string())])
            } else {
                Ok(vec![
                    ("kustomization.yaml", HELLO_KUBIC_PATCHED.to_string()),
                    ("patch.yaml", hello_kubic_patch(&format!("loadBalancerIP: {}", argument))),
                ])
            }
        }
        other => Err(format!("Unsupported service '{}'", other)),
    }
}

async fn remove_dir_if_present(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

impl Orchestrator {
    /// Create the overlay for `service`, apply it, and record its hash.
    /// A previous overlay is kept aside and restored when anything fails.
    pub async fn deploy_kustomize(&self, service: &str, argument: &str) -> Result<String, String> {
        let files = overlay_files(service, argument)?;
        let dir = self.store().kustomize_dir(service);
        let base = self.config().manifest_dir.join(service);
        if !base.is_dir() {
            return Err(format!("{} is not installed", service));
        }

        let previous = dir.with_file_name(format!("{}.previous", service));
        if let Err(err) = self.set_aside(&dir, &previous).await {
            return Err(format!("Cannot create overlay for {}: {}", service, err));
        }

        if let Err(err) = self.prepare_overlay(&dir, &base, &files).await {
            self.restore_overlay(service, &dir, &previous).await;
            return Err(format!("Cannot create overlay for {}: {}", service, err));
        }

        match self.deployer().apply(&Artifact::Kustomize(service.to_string()), true).await {
            Ok(_) => {
                if let Err(err) = remove_dir_if_present(&previous).await {
                    warn!(self.log, "removing previous overlay failed"; "service" => service, "error" => %err);
                }
                info!(self.log, "kustomize service deployed"; "service" => service);
                Ok(format!("{} deployed", service))
            }
            Err(err) => {
                self.restore_overlay(service, &dir, &previous).await;
                Err(err.to_string())
            }
        }
    }

    /// Move an existing overlay to `previous`, replacing a stale copy.
    async fn set_aside(&self, dir: &Path, previous: &Path) -> io::Result<()> {
        remove_dir_if_present(previous).await?;
        match tokio::fs::rename(dir, previous).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// Drop the new overlay and put the previous one back, if there was one.
    async fn restore_overlay(&self, service: &str, dir: &Path, previous: &Path) {
        if let Err(err) = remove_dir_if_present(dir).await {
            warn!(self.log, "removing overlay failed"; "service" => service, "error" => %err);
        }
        if !previous.exists() {
            return;
        }
        if let Err(err) = tokio::fs::rename(previous, dir).await {
            warn!(self.log, "restoring previous overlay failed"; "service" => service, "error" => %err);
        }
    }

    async fn prepare_overlay(&self, dir: &Path, base: &Path, files: &[(&'static str, String)]) -> io::Result<()> {
        let overlay = dir.join("overlay");
        tokio::fs::create_dir_all(&overlay).await?;
        tokio::fs::symlink(base, dir.join("base")).await?;
        for (name, contents) in files {
            tokio::fs::write(overlay.join(name), contents).await?;
        }
        Ok(())
    }

    /// Install a Helm chart and record the rendered release.
    pub async fn deploy_helm(&self, mut release: HelmRelease) -> Result<String, String> {
        if release.chart.trim().is_empty() {
            return Err("No chart given".to_string());
        }
        if release.namespace.trim().is_empty() {
            release.namespace = "default".to_string();
        }
        let name = release.chart.clone();
        self.deployer()
            .apply(&Artifact::Helm(release), true)
            .await
            .map(|_| format!("{} deployed", name))
            .map_err(|err| err.to_string())
    }

    /// Contents of the cluster admin kubeconfig.
    pub async fn fetch_kubeconfig(&self) -> Result<String, String> {
        let path = self.config().admin_conf();
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| format!("Cannot read {}: {}", path.display(), err))
    }
}
