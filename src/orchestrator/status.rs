//! Read-only report of versions and artifact drift.

use super::{Orchestrator, ProgressSink, WorkflowResult};
use crate::exec::parse;
use crate::state::Mechanism;

impl Orchestrator {
    pub async fn status(&self, sink: ProgressSink) -> WorkflowResult {
        sink.step(format!("Kubicd version: {}", env!("CARGO_PKG_VERSION"))).await?;

        let out = self
            .exec()
            .local("rpm", &["-q", "--qf", "'%{VERSION}'", "kubernetes-kubeadm"])
            .await;
        let kubeadm = if out.success {
            parse::normalize_version(&parse::package_version(&out.output))
        } else {
            out.to_string()
        };
        sink.step(format!("kubeadm version: {}", kubeadm)).await?;

        let mut current = 0;
        let mut outdated = 0;
        for mechanism in Mechanism::ALL {
            let artifacts = match self.deployer().tracked(mechanism) {
                Ok(artifacts) => artifacts,
                Err(err) => {
                    sink.error(format!("Cannot load {} records: {}", mechanism, err)).await?;
                    continue;
                }
            };
            if artifacts.is_empty() {
                continue;
            }
            sink.step(format!("Status of deployed {} artifacts:", mechanism)).await?;
            for artifact in artifacts {
                match self.deployer().check(&artifact).await {
                    Ok(check) if check.needs_update => {
                        outdated += 1;
                        sink.step(format!("- {}: newer version available", artifact)).await?;
                    }
                    Ok(_) => {
                        current += 1;
                        sink.step(format!("- {}: up to date", artifact)).await?;
                    }
                    Err(err) => sink.error(format!("- {}: {}", artifact, err)).await?,
                }
            }
        }

        sink.done(format!(
            "{} artifact(s) up to date, {} with a newer version available",
            current, outdated
        ))
        .await
    }
}
