//! Configuration for the kubicd daemon

use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default location of the daemon configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/kubicd/kubicd.toml";

/// Default port kubicd listens on and kubicctl connects to.
pub const DEFAULT_PORT: u16 = 7148;

/// Settings for one kubicd instance. Every field has a default so a partial
/// (or absent) file is valid.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Address to bind; empty means all interfaces
    pub server: String,
    pub port: u16,

    /// Server certificate presented to kubicctl
    pub crt_file: PathBuf,
    pub key_file: PathBuf,
    /// CA that client certificates must chain to
    pub ca_file: PathBuf,
    /// certstrap depot used when issuing client certificates
    pub pki_dir: PathBuf,

    /// Access policy shipped by the distribution
    pub rbac_default: PathBuf,
    /// Local access policy; wins over the default on key collision
    pub rbac_override: PathBuf,

    /// Cluster metadata, artifact hashes, and Kustomize work trees
    pub state_dir: PathBuf,
    /// Installed manifests (pod networks, kured)
    pub manifest_dir: PathBuf,
    /// kubeadm's configuration directory (admin.conf, manifests/)
    pub kubernetes_dir: PathBuf,
    pub transactional_update_conf: PathBuf,

    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: DEFAULT_PORT,
            crt_file: PathBuf::from("/etc/kubicd/pki/KubicD.crt"),
            key_file: PathBuf::from("/etc/kubicd/pki/KubicD.key"),
            ca_file: PathBuf::from("/etc/kubicd/pki/Kubic-Control-CA.crt"),
            pki_dir: PathBuf::from("/etc/kubicd/pki"),
            rbac_default: PathBuf::from("/usr/share/defaults/kubicd/rbac.conf"),
            rbac_override: PathBuf::from("/etc/kubicd/rbac.conf"),
            state_dir: PathBuf::from("/var/lib/kubic-control"),
            manifest_dir: PathBuf::from("/usr/share/k8s-yaml"),
            kubernetes_dir: PathBuf::from("/etc/kubernetes"),
            transactional_update_conf: PathBuf::from("/etc/transactional-update.conf"),
            log_level: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load a `DaemonConfig` from the given TOML file
    ///
    /// A missing file yields the defaults; anything else that prevents reading
    /// or parsing it is an error naming the path.
    pub fn from_file(path: &Path) -> Result<DaemonConfig, LoadError> {
        let file_contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(DaemonConfig::default()),
            Err(err) => return Err(LoadError::Io { path: path.into(), err }),
        };
        let config_parsed: DaemonConfig = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        Ok(config_parsed)
    }

    /// `server:port` for binding the listener.
    pub fn listen_address(&self) -> String {
        let host = if self.server.is_empty() { "0.0.0.0" } else { self.server.as_str() };
        if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, self.port)
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    /// Kubeconfig with cluster-admin rights written by `kubeadm init`.
    pub fn admin_conf(&self) -> PathBuf {
        self.kubernetes_dir.join("admin.conf")
    }

    /// `--kubeconfig=<admin.conf>` for kubectl, kubeadm, and helm.
    pub fn kubeconfig_arg(&self) -> String {
        format!("--kubeconfig={}", self.admin_conf().display())
    }

    pub fn static_manifest(&self, name: &str) -> PathBuf {
        self.kubernetes_dir.join("manifests").join(name)
    }

    /// Point every writable location below `root` (used by tests).
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            pki_dir: root.join("pki"),
            rbac_default: root.join("defaults").join("rbac.conf"),
            rbac_override: root.join("etc").join("rbac.conf"),
            state_dir: root.join("state"),
            manifest_dir: root.join("k8s-yaml"),
            kubernetes_dir: root.join("kubernetes"),
            transactional_update_conf: root.join("etc").join("transactional-update.conf"),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{}\": {err}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("error parsing \"{}\": {err}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::from_file(&dir.path().join("kubicd.toml")).unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.listen_address(), "0.0.0.0:7148");
        assert_eq!(config.kubeconfig_arg(), "--kubeconfig=/etc/kubernetes/admin.conf");
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubicd.toml");
        std::fs::write(&path, "server = \"10.0.0.1\"\nport = 9000\nlog_level = \"debug\"\n").unwrap();

        let config = DaemonConfig::from_file(&path).unwrap();
        assert_eq!(config.listen_address(), "10.0.0.1:9000");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/kubic-control"));
    }

    #[test]
    fn test_ipv6_listen_address() {
        let config = DaemonConfig { server: "::1".into(), ..Default::default() };
        assert_eq!(config.listen_address(), "[::1]:7148");
    }

    #[test]
    fn test_parse_error_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubicd.toml");
        std::fs::write(&path, "port = \"not a number\"\n").unwrap();

        let err = DaemonConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, LoadError::Parse { .. }));
        assert!(err.to_string().contains("kubicd.toml"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubicd.toml");
        std::fs::write(&path, "servername = \"KubicD\"\n").unwrap();
        assert!(DaemonConfig::from_file(&path).is_err());
    }
}
