//! Detecting whether an applied artifact differs from its current rendering.

use crate::exec::CommandOutput;
use crate::state::{KvFile, Mechanism, StateStore, StoreError};
use sha2::{Digest, Sha256};
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriftError {
    #[error("rendering {name} failed: {message}")]
    Render { name: String, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Hex SHA-256 of rendered content.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Result of comparing a fresh rendering against the recorded hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftCheck {
    pub needs_update: bool,
    pub rendered: String,
    pub hash: String,
}

/// Compares renderings with the hashes recorded per mechanism.
///
/// The detector never writes; [DriftDetector::record] is called by the
/// deployer once an apply has succeeded.
#[derive(Debug, Clone)]
pub struct DriftDetector {
    store: StateStore,
}

impl DriftDetector {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn records(&self, mechanism: Mechanism) -> Result<KvFile, StoreError> {
        self.store.hashes(mechanism)
    }

    pub fn recorded(&self, mechanism: Mechanism, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self.records(mechanism)?.get(name).map(str::to_string))
    }

    pub async fn needs_update<F, Fut>(
        &self,
        mechanism: Mechanism,
        name: &str,
        render: F,
    ) -> Result<DriftCheck, DriftError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CommandOutput>,
    {
        let rendered = render().await;
        if !rendered.success {
            return Err(DriftError::Render { name: name.to_string(), message: rendered.output });
        }
        let hash = content_hash(&rendered.output);
        let recorded = self.recorded(mechanism, name)?;
        Ok(DriftCheck {
            needs_update: recorded.as_deref() != Some(hash.as_str()),
            rendered: rendered.output,
            hash,
        })
    }

    /// Remember `hash` as the last successfully applied version of `name`.
    pub fn record(&self, mechanism: Mechanism, name: &str, hash: &str) -> Result<(), StoreError> {
        self.record_with(mechanism, name, hash, &[])
    }

    /// Record a hash together with extra keys (Helm release metadata).
    pub fn record_with(
        &self,
        mechanism: Mechanism,
        name: &str,
        hash: &str,
        extra: &[(String, String)],
    ) -> Result<(), StoreError> {
        let mut records = self.records(mechanism)?;
        records.set(name, hash);
        for (key, value) in extra {
            records.set(key, value);
        }
        records.save()
    }
}
