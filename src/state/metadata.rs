//! Cluster metadata kept in `control-plane.conf`.

use super::store::{KvFile, StoreError};
use std::path::Path;

const KUBERNETES_VERSION: &str = "kubernetes_version";
const MULTI_MASTER: &str = "multi_master";
const LOAD_BALANCER: &str = "load_balancer";
const LOAD_BALANCER_NODE: &str = "load_balancer_node";
const FIRST_MASTER: &str = "first_master";

/// What the daemon remembers about the cluster it bootstrapped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterMetadata {
    pub kubernetes_version: String,
    /// Control-plane endpoint of a multi-master cluster; empty for single master.
    pub multi_master: String,
    /// DNS name of the load balancer in front of the API servers.
    pub load_balancer: String,
    /// Fleet id of the load balancer machine.
    pub load_balancer_node: String,
    /// Fleet id of the master that ran the initial bootstrap.
    pub first_master: String,
}

impl ClusterMetadata {
    /// Load the record; a missing file yields the empty record.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let kv = KvFile::load(path)?;
        let field = |key: &str| kv.get(key).unwrap_or_default().to_string();
        Ok(Self {
            kubernetes_version: field(KUBERNETES_VERSION),
            multi_master: field(MULTI_MASTER),
            load_balancer: field(LOAD_BALANCER),
            load_balancer_node: field(LOAD_BALANCER_NODE),
            first_master: field(FIRST_MASTER),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let mut kv = KvFile::load(path)?;
        for (key, value) in [
            (KUBERNETES_VERSION, &self.kubernetes_version),
            (MULTI_MASTER, &self.multi_master),
            (LOAD_BALANCER, &self.load_balancer),
            (LOAD_BALANCER_NODE, &self.load_balancer_node),
            (FIRST_MASTER, &self.first_master),
        ] {
            if value.is_empty() {
                kv.remove(key);
            } else {
                kv.set(key, value);
            }
        }
        kv.save()
    }

    pub fn delete(path: &Path) -> Result<(), StoreError> {
        KvFile::delete(path)
    }

    pub fn is_multi_master(&self) -> bool {
        !self.multi_master.is_empty()
    }

    pub fn has_load_balancer(&self) -> bool {
        !self.load_balancer_node.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_omits_empty_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control-plane.conf");

        let meta = ClusterMetadata {
            kubernetes_version: "v1.18.3".into(),
            first_master: "master1".into(),
            ..Default::default()
        };
        meta.save(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains(MULTI_MASTER));

        let loaded = ClusterMetadata::load(&path).unwrap();
        assert_eq!(loaded, meta);
        assert!(!loaded.is_multi_master());
        assert!(!loaded.has_load_balancer());
    }

    #[test]
    fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control-plane.conf");
        ClusterMetadata { multi_master: "lb.example.com".into(), ..Default::default() }
            .save(&path)
            .unwrap();
        assert!(ClusterMetadata::load(&path).unwrap().is_multi_master());

        ClusterMetadata::delete(&path).unwrap();
        assert_eq!(ClusterMetadata::load(&path).unwrap(), ClusterMetadata::default());
    }
}
