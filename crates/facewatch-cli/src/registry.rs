//! JSON-file identity registry.

use facewatch_core::{Embedding, IdentityRecord};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry io ({path}): {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("registry file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all identities. A missing file is an empty registry.
    pub fn load(&self) -> Result<Vec<IdentityRecord>, RegistryError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_error(source)),
        };
        serde_json::from_str(&text).map_err(|source| RegistryError::Json {
            path: self.path.clone(),
            source,
        })
    }

    pub fn save(&self, records: &[IdentityRecord]) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let json = serde_json::to_string_pretty(records).map_err(|source| RegistryError::Json {
            path: self.path.clone(),
            source,
        })?;
        std::fs::write(&self.path, json).map_err(|e| self.io_error(e))
    }

    /// Store a new identity under a fresh id.
    pub fn enroll(&self, name: &str, embedding: Embedding) -> Result<IdentityRecord, RegistryError> {
        let mut records = self.load()?;
        let record = IdentityRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            embedding,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        records.push(record.clone());
        self.save(&records)?;
        tracing::info!(id = %record.id, name, total = records.len(), "identity enrolled");
        Ok(record)
    }

    /// Remove an identity by id. Returns whether it existed.
    pub fn remove(&self, id: &str) -> Result<bool, RegistryError> {
        let mut records = self.load()?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Ok(false);
        }
        self.save(&records)?;
        tracing::info!(id, "identity removed");
        Ok(true)
    }

    fn io_error(&self, source: std::io::Error) -> RegistryError {
        RegistryError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding() -> Embedding {
        Embedding { values: vec![0.6, 0.8], model_version: Some("w600k_r50".into()) }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("none.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_enroll_creates_parent_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("nested/registry.json"));

        let alice = store.enroll("Alice", embedding()).unwrap();
        let bob = store.enroll("Bob", embedding()).unwrap();
        assert_ne!(alice.id, bob.id);
        assert!(chrono::DateTime::parse_from_rfc3339(&alice.created_at).is_ok());

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name, "Alice");
        assert_eq!(loaded[1].embedding, embedding());
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("registry.json"));
        let alice = store.enroll("Alice", embedding()).unwrap();

        assert!(!store.remove("no-such-id").unwrap());
        assert!(store.remove(&alice.id).unwrap());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = RegistryStore::new(&path).load().unwrap_err();
        assert!(matches!(err, RegistryError::Json { .. }));
    }
}
