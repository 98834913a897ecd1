//! Issuing client certificates signed by the control CA.

use crate::exec::RemoteExecutor;
use slog::{info, Logger};
use std::path::PathBuf;

/// Name of the CA in the certstrap depot.
pub const CONTROL_CA: &str = "Kubic-Control-CA";

/// Common name of the daemon's server certificate.
pub const SERVER_IDENTITY: &str = "KubicD";

/// The client identity created together with the CA.
pub const ADMIN_IDENTITY: &str = "admin";

/// Key and certificate of a freshly issued identity, both PEM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub key: String,
    pub crt: String,
}

/// Names end up as file names in the depot.
fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

/// Runs certstrap against the daemon's depot.
#[derive(Clone)]
pub struct CertificateIssuer {
    exec: RemoteExecutor,
    depot: PathBuf,
    log: Logger,
}

impl CertificateIssuer {
    pub fn new(exec: RemoteExecutor, depot: impl Into<PathBuf>, log: Logger) -> Self {
        Self { exec, depot: depot.into(), log }
    }

    /// Request and sign a certificate whose common name is `name`.
    pub async fn create(&self, name: &str) -> Result<IssuedCertificate, String> {
        let name = name.trim();
        if !valid_name(name) {
            return Err(format!("Invalid certificate name '{}'", name));
        }
        self.request(name, None).await?;
        self.sign(name).await?;

        let read = |ext: &str| {
            let path = self.depot.join(format!("{}.{}", name, ext));
            async move {
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|err| format!("Cannot read {}: {}", path.display(), err))
            }
        };
        let key = read("key").await?;
        let crt = read("crt").await?;
        info!(self.log, "client certificate issued"; "name" => name);
        Ok(IssuedCertificate { key, crt })
    }

    /// Bootstrap the depot: the control CA, the daemon's server identity
    /// and a first `admin` client identity.
    pub async fn initialize(&self) -> Result<(), String> {
        let depot = self.depot.display().to_string();
        let out = self
            .exec
            .local(
                "certstrap",
                &["--depot-path", &depot, "init", "--common-name", CONTROL_CA, "--passphrase", ""],
            )
            .await;
        if !out.success {
            return Err(format!("Error creating CA: {}", out.output));
        }

        for (name, domain) in [(SERVER_IDENTITY, Some(SERVER_IDENTITY)), (ADMIN_IDENTITY, None)] {
            self.request(name, domain)
                .await
                .map_err(|err| format!("Error creating user '{}': {}", name, err))?;
            self.sign(name)
                .await
                .map_err(|err| format!("Error signing user '{}': {}", name, err))?;
        }
        info!(self.log, "certificate depot initialized"; "depot" => &depot);
        Ok(())
    }

    async fn request(&self, name: &str, domain: Option<&str>) -> Result<(), String> {
        let depot = self.depot.display().to_string();
        let mut args = vec!["--depot-path", depot.as_str(), "request-cert", "--common-name", name];
        if let Some(domain) = domain {
            args.extend_from_slice(&["--domain", domain]);
        }
        args.extend_from_slice(&["--passphrase", ""]);
        let out = self.exec.local("certstrap", &args).await;
        if out.success {
            Ok(())
        } else {
            Err(out.output)
        }
    }

    async fn sign(&self, name: &str) -> Result<(), String> {
        let depot = self.depot.display().to_string();
        let out = self
            .exec
            .local("certstrap", &["--depot-path", &depot, "sign", name, "--CA", CONTROL_CA])
            .await;
        if out.success {
            Ok(())
        } else {
            Err(out.output)
        }
    }
}
