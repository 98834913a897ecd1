//! Persistent daemon state: cluster metadata and applied-artifact hashes,
//! all kept as flat key/value files under one state directory.
//!
//! Files are read and written per call without cross-process locking, so a
//! single writer is assumed.

pub mod metadata;
pub mod store;

pub use metadata::ClusterMetadata;
pub use store::{KvFile, StoreError};

use std::fmt;
use std::path::{Path, PathBuf};

/// How an artifact reaches the cluster. Each mechanism has its own hash file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    Manifest,
    Helm,
    Kustomize,
}

impl Mechanism {
    pub const ALL: [Mechanism; 3] = [Mechanism::Manifest, Mechanism::Helm, Mechanism::Kustomize];

    pub fn file_name(self) -> &'static str {
        match self {
            Mechanism::Manifest => "k8s-yaml.conf",
            Mechanism::Helm => "k8s-helm.conf",
            Mechanism::Kustomize => "k8s-kustomize.conf",
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mechanism::Manifest => "manifest",
            Mechanism::Helm => "helm",
            Mechanism::Kustomize => "kustomize",
        })
    }
}

/// Locations of the state files.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join("control-plane.conf")
    }

    pub fn hashes_path(&self, mechanism: Mechanism) -> PathBuf {
        self.dir.join(mechanism.file_name())
    }

    pub fn metadata(&self) -> Result<ClusterMetadata, StoreError> {
        ClusterMetadata::load(&self.metadata_path())
    }

    pub fn save_metadata(&self, metadata: &ClusterMetadata) -> Result<(), StoreError> {
        metadata.save(&self.metadata_path())
    }

    pub fn hashes(&self, mechanism: Mechanism) -> Result<KvFile, StoreError> {
        KvFile::load(self.hashes_path(mechanism))
    }

    /// Working directory for a Kustomize service.
    pub fn kustomize_dir(&self, service: &str) -> PathBuf {
        self.dir.join("kustomize").join(service)
    }

    /// Forget the cluster: metadata and every hash record.
    pub fn clear(&self) -> Result<(), StoreError> {
        ClusterMetadata::delete(&self.metadata_path())?;
        for mechanism in Mechanism::ALL {
            KvFile::delete(self.hashes_path(mechanism))?;
        }
        Ok(())
    }
}
