//! Role based access control for RPC methods.
//!
//! The policy is a flat `key = value` table where the key is the method name
//! without its `/api.` prefix (`Kubeadm/InitMaster`) and the value lists the
//! identities allowed to call it, comma separated. It is read from disk on
//! every check so edits apply without a restart.

use crate::state::{KvFile, StoreError};
use std::path::PathBuf;
use thiserror::Error;

const METHOD_PREFIX: &str = "/api.";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("access policy unavailable: {0}")]
    Load(#[from] StoreError),
    #[error("writing access policy failed: {0}")]
    Save(#[source] StoreError),
    #[error("no policy entry for {method}")]
    NoEntry { method: String },
    #[error("{caller} is not allowed to call {method}")]
    NotAllowed { caller: String, method: String },
}

/// Strip the package prefix from a full gRPC method path.
pub fn policy_key(method: &str) -> &str {
    method.strip_prefix(METHOD_PREFIX).unwrap_or(method)
}

/// Result of [AccessPolicy::grant].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    /// The user was appended; `new_entry` when the method had none before.
    Added { new_entry: bool },
    AlreadyListed,
}

/// Two overlaid policy files; the override wins on key collision.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    default_file: PathBuf,
    override_file: PathBuf,
}

impl AccessPolicy {
    pub fn new(default_file: impl Into<PathBuf>, override_file: impl Into<PathBuf>) -> Self {
        Self { default_file: default_file.into(), override_file: override_file.into() }
    }

    fn load(&self) -> Result<KvFile, StoreError> {
        KvFile::load_overlay(&[self.default_file.as_path(), self.override_file.as_path()])
    }

    /// Every entry of the merged policy.
    pub fn entries(&self) -> Result<Vec<(String, String)>, PolicyError> {
        Ok(self.load()?.entries())
    }

    /// Add `user` to the identities allowed for `key`. Only the override
    /// file is written; the default file stays untouched.
    pub fn grant(&self, key: &str, user: &str) -> Result<Grant, PolicyError> {
        let merged = self.load()?;
        let current = merged.get(key).map(str::to_string);
        if let Some(current) = &current {
            if current.split(',').map(str::trim).any(|id| id == user) {
                return Ok(Grant::AlreadyListed);
            }
        }
        let entry = match &current {
            Some(current) if !current.trim().is_empty() => format!("{},{}", current, user),
            _ => user.to_string(),
        };

        let mut local = KvFile::load(&self.override_file)?;
        local.set(key, &entry);
        local.save().map_err(PolicyError::Save)?;
        Ok(Grant::Added { new_entry: current.is_none() })
    }

    /// Allow `caller` to invoke `method` or say why not. Methods without an
    /// entry are denied.
    pub fn authorize(&self, method: &str, caller: &str) -> Result<(), PolicyError> {
        let table = self.load()?;
        let key = policy_key(method);
        let allowed = table
            .get(key)
            .ok_or_else(|| PolicyError::NoEntry { method: key.to_string() })?;
        if allowed.split(',').map(str::trim).any(|id| !id.is_empty() && id == caller) {
            Ok(())
        } else {
            Err(PolicyError::NotAllowed { caller: caller.to_string(), method: key.to_string() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(dir: &std::path::Path, default: &str, local: Option<&str>) -> AccessPolicy {
        let default_file = dir.join("defaults.conf");
        let override_file = dir.join("rbac.conf");
        std::fs::write(&default_file, default).unwrap();
        if let Some(local) = local {
            std::fs::write(&override_file, local).unwrap();
        }
        AccessPolicy::new(default_file, override_file)
    }

    #[test]
    fn test_policy_key() {
        assert_eq!(policy_key("/api.Kubeadm/InitMaster"), "Kubeadm/InitMaster");
        assert_eq!(policy_key("Deploy/DeployHelm"), "Deploy/DeployHelm");
    }

    #[test]
    fn test_identity_list_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(dir.path(), "Kubeadm/InitMaster = admin ,  ops\n", None);
        policy.authorize("/api.Kubeadm/InitMaster", "ops").unwrap();
        policy.authorize("/api.Kubeadm/InitMaster", "admin").unwrap();
        assert!(matches!(
            policy.authorize("/api.Kubeadm/InitMaster", "adm"),
            Err(PolicyError::NotAllowed { .. })
        ));
    }

    #[test]
    fn test_missing_entry_denies() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(dir.path(), "Kubeadm/GetStatus = admin\n", None);
        assert!(matches!(
            policy.authorize("/api.Kubeadm/DestroyMaster", "admin"),
            Err(PolicyError::NoEntry { .. })
        ));
        assert!(policy.authorize("/api.Kubeadm/GetStatus", "").is_err());
    }

    #[test]
    fn test_override_wins_and_is_reread() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(dir.path(), "Kubeadm/AddNode = admin\n", Some("Kubeadm/AddNode = ops\n"));
        assert!(policy.authorize("/api.Kubeadm/AddNode", "admin").is_err());
        policy.authorize("/api.Kubeadm/AddNode", "ops").unwrap();

        std::fs::write(dir.path().join("rbac.conf"), "Kubeadm/AddNode = admin, ops\n").unwrap();
        policy.authorize("/api.Kubeadm/AddNode", "admin").unwrap();
    }

    #[test]
    fn test_unparsable_policy_denies_everyone() {
        let broken_override = tempfile::tempdir().unwrap();
        let unclosed = policy(broken_override.path(), "Kubeadm/GetStatus = admin\n", Some("[unclosed\n"));
        assert!(matches!(
            unclosed.authorize("/api.Kubeadm/GetStatus", "admin"),
            Err(PolicyError::Load(_))
        ));

        let broken_default = tempfile::tempdir().unwrap();
        let no_separator = policy(broken_default.path(), "Kubeadm/GetStatus admin\n", None);
        assert!(matches!(
            no_separator.authorize("/api.Kubeadm/GetStatus", "admin"),
            Err(PolicyError::Load(_))
        ));
    }

    #[test]
    fn test_entries_merge_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(
            dir.path(),
            "Kubeadm/GetStatus = admin\nKubeadm/AddNode = admin\n",
            Some("Kubeadm/AddNode = ops\nDeploy/DeployHelm = ops\n"),
        );
        let mut entries = policy.entries().unwrap();
        entries.sort();
        assert_eq!(
            entries,
            vec![
                ("Deploy/DeployHelm".to_string(), "ops".to_string()),
                ("Kubeadm/AddNode".to_string(), "ops".to_string()),
                ("Kubeadm/GetStatus".to_string(), "admin".to_string()),
            ]
        );
    }

    #[test]
    fn test_grant_writes_override_only() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(dir.path(), "Kubeadm/GetStatus = admin\n", None);

        assert_eq!(policy.grant("Kubeadm/GetStatus", "ops").unwrap(), Grant::Added { new_entry: false });
        policy.authorize("/api.Kubeadm/GetStatus", "ops").unwrap();
        policy.authorize("/api.Kubeadm/GetStatus", "admin").unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("defaults.conf")).unwrap(), "Kubeadm/GetStatus = admin\n");
        let local = KvFile::load(dir.path().join("rbac.conf")).unwrap();
        assert_eq!(local.get("Kubeadm/GetStatus"), Some("admin,ops"));

        assert_eq!(policy.grant("Kubeadm/GetStatus", "ops").unwrap(), Grant::AlreadyListed);
        assert_eq!(policy.grant("Kubeadm/AddNode", "ops").unwrap(), Grant::Added { new_entry: true });
        policy.authorize("/api.Kubeadm/AddNode", "ops").unwrap();
    }
}
