//! Commands run on the master itself, against kubicd's files rather than
//! over the wire.

use crate::ClientError;
use kubic_control::grpc::{AccessPolicy, CertificateIssuer, Grant};
use kubic_control::logging::root_logger;
use kubic_control::{HostRunner, RemoteExecutor};
use std::io::Write;
use std::path::Path;

/// Print every policy entry as `<method>: <identities>`.
pub fn list_roles<W: Write>(policy: &AccessPolicy, out: &mut W) -> Result<(), ClientError> {
    for (role, users) in policy.entries()? {
        writeln!(out, "{}: {}", role, users)?;
    }
    Ok(())
}

/// Allow `user` to call `role`, recording it in the override file.
pub fn add_account<W: Write>(policy: &AccessPolicy, role: &str, user: &str, out: &mut W) -> Result<(), ClientError> {
    match policy.grant(role, user)? {
        Grant::Added { new_entry: true } => writeln!(out, "Adding new role: '{}'", role)?,
        Grant::Added { new_entry: false } => {}
        Grant::AlreadyListed => writeln!(out, "User already part of '{}'", role)?,
    }
    Ok(())
}

/// Create the CA, the KubicD server certificate and an admin client
/// certificate in `pki_dir` with certstrap.
pub async fn initialize_certificates(pki_dir: &Path) -> Result<(), ClientError> {
    let log = root_logger("kubicctl", "warn");
    let exec = RemoteExecutor::new(HostRunner::new(log.clone()).as_runner(), log.clone());
    CertificateIssuer::new(exec, pki_dir, log)
        .initialize()
        .await
        .map_err(ClientError::Certificates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(dir: &Path) -> AccessPolicy {
        let default_file = dir.join("defaults.conf");
        std::fs::write(&default_file, "Kubeadm/GetStatus = admin\n").unwrap();
        AccessPolicy::new(default_file, dir.join("rbac.conf"))
    }

    #[test]
    fn test_add_account_messages() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(dir.path());
        let mut out = Vec::new();

        add_account(&policy, "Kubeadm/GetStatus", "ops", &mut out).unwrap();
        add_account(&policy, "Kubeadm/GetStatus", "ops", &mut out).unwrap();
        add_account(&policy, "Deploy/DeployHelm", "ops", &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "User already part of 'Kubeadm/GetStatus'\nAdding new role: 'Deploy/DeployHelm'\n"
        );

        let mut listed = Vec::new();
        list_roles(&policy, &mut listed).unwrap();
        let listed = String::from_utf8(listed).unwrap();
        assert!(listed.contains("Kubeadm/GetStatus: admin,ops\n"));
        assert!(listed.contains("Deploy/DeployHelm: ops\n"));
    }

    #[test]
    fn test_unreadable_policy_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(dir.path());
        std::fs::write(dir.path().join("rbac.conf"), "[broken\n").unwrap();

        let err = list_roles(&policy, &mut Vec::<u8>::new()).unwrap_err();
        assert!(err.to_string().starts_with("access policy unavailable"));
        assert!(add_account(&policy, "Kubeadm/GetStatus", "ops", &mut Vec::<u8>::new()).is_err());
    }
}
