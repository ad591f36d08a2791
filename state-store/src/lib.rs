//! Persistent key/value progress storage.
//!
//! Ingestion jobs save their progress as small JSON documents addressed by a
//! key and a field, mirroring a hash in an external store. The file-backed
//! implementation keeps one document per field under a state directory.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Key/field addressed JSON storage consumed by the ingestion engines.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str, field: &str) -> Result<Option<Value>, StateStoreError>;
    async fn set(&self, key: &str, field: &str, value: Value) -> Result<(), StateStoreError>;
}

/// File-backed state store: `<root>/<key>/<field>.json`, overwrite on set.
pub struct FileStateStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    fn file_path(&self, key: &str, field: &str) -> PathBuf {
        self.root
            .join(sanitized_component(key))
            .join(format!("{}.json", sanitized_component(field)))
    }
}

fn sanitized_component(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn ensure_parent(path: &Path) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, key: &str, field: &str) -> Result<Option<Value>, StateStoreError> {
        let path = self.file_path(key, field);
        if !path.exists() {
            return Ok(None);
        }
        let _guard = self.lock.lock();
        let data = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    async fn set(&self, key: &str, field: &str, value: Value) -> Result<(), StateStoreError> {
        let path = self.file_path(key, field);
        ensure_parent(&path)?;
        let _guard = self.lock.lock();
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, &value)?;
        Ok(())
    }
}

/// In-memory state store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: Mutex<HashMap<(String, String), Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str, field: &str) -> Result<Option<Value>, StateStoreError> {
        Ok(self
            .entries
            .lock()
            .get(&(key.to_string(), field.to_string()))
            .cloned())
    }

    async fn set(&self, key: &str, field: &str, value: Value) -> Result<(), StateStoreError> {
        self.entries
            .lock()
            .insert((key.to_string(), field.to_string()), value);
        Ok(())
    }
}
