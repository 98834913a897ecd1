//! Flat `key = value` files.
//!
//! Only the unnamed (general) section is used, which keeps the files
//! compatible with what the command line tools and administrators write.

use ini::Ini;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {path}")]
    Io {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// One key/value file loaded into memory.
#[derive(Debug, Clone)]
pub struct KvFile {
    path: PathBuf,
    ini: Ini,
}

impl KvFile {
    /// Load `path`; a missing file is an empty record set.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let ini = match std::fs::read_to_string(&path) {
            Ok(contents) => Ini::load_from_str(&contents).map_err(|err| StoreError::Parse {
                path: path.clone(),
                message: err.to_string(),
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ini::new(),
            Err(err) => return Err(StoreError::Io { path, err }),
        };
        Ok(Self { path, ini })
    }

    /// Load several files in order; later files win on key collision.
    pub fn load_overlay(paths: &[&Path]) -> Result<Self, StoreError> {
        let mut merged = KvFile { path: PathBuf::new(), ini: Ini::new() };
        for path in paths {
            let layer = KvFile::load(path)?;
            for (key, value) in layer.entries() {
                merged.set(&key, &value);
            }
            merged.path = path.to_path_buf();
        }
        Ok(merged)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.ini.get_from(None::<String>, key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.ini.with_general_section().set(key, value);
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.ini.delete_from(None::<String>, key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries().into_iter().map(|(key, _)| key).collect()
    }

    pub fn entries(&self) -> Vec<(String, String)> {
        self.ini
            .section(None::<String>)
            .map(|props| {
                props
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Write to a sibling temporary file and rename it over the target.
    pub fn save(&self) -> Result<(), StoreError> {
        let io_err = |err| StoreError::Io { path: self.path.clone(), err };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        self.ini.write_to_file(&tmp).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)
    }

    /// Remove the backing file; a missing file is not an error.
    pub fn delete(path: impl AsRef<Path>) -> Result<(), StoreError> {
        match std::fs::remove_file(path.as_ref()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Io { path: path.as_ref().to_path_buf(), err }),
        }
    }
}
