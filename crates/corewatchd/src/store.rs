//! Key-path addressed persistent storage.
//!
//! Keys are dotted paths into a single JSON document (`"core.lastState"`).
//! [`JsonFileStore`] writes the whole document atomically on every `set`;
//! [`MemoryStore`] keeps it in memory for tests and ephemeral runs.
//!
//! # Panic-Free Guarantees
//!
//! Poisoned locks are recovered with `into_inner()`; I/O failures make
//! `set` return `false` and are logged.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// Durable key-path storage.
pub trait StateStore: Send + Sync {
    fn get(&self, key_path: &str) -> Option<Value>;

    /// Stores `value` at `key_path`. Returns false if it could not be persisted.
    fn set(&self, key_path: &str, value: Value) -> bool;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to read store {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write store {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode store document: {0}")]
    Encode(#[from] serde_json::Error),
}

// ============================================================================
// Key paths
// ============================================================================

fn lookup<'a>(root: &'a Value, key_path: &str) -> Option<&'a Value> {
    key_path
        .split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(root, |node, segment| node.get(segment))
}

fn insert(root: &mut Value, key_path: &str, value: Value) -> bool {
    let segments: Vec<&str> = key_path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };

    let mut node = root;
    for segment in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Some(map) = node.as_object_mut() else {
            return false;
        };
        node = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node.as_object_mut() {
        Some(map) => {
            map.insert((*last).to_string(), value);
            true
        }
        None => false,
    }
}

// ============================================================================
// JSON file store
// ============================================================================

/// Single JSON document on disk.
pub struct JsonFileStore {
    path: PathBuf,
    document: Mutex<Value>,
}

impl JsonFileStore {
    /// Opens the store, loading the existing document if present.
    ///
    /// A corrupt document is replaced by an empty one on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let document = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "State store is corrupt, starting empty");
                Value::Object(Map::new())
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Value::Object(Map::new()),
            Err(source) => return Err(StoreError::Read { path, source }),
        };

        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, document: &Value) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec_pretty(document)?;
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&tmp).map_err(write_err)?;
        file.write_all(&encoded).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        std::fs::rename(&tmp, &self.path).map_err(write_err)?;
        Ok(())
    }
}

impl StateStore for JsonFileStore {
    fn get(&self, key_path: &str) -> Option<Value> {
        let document = self.document.lock().unwrap_or_else(|e| e.into_inner());
        lookup(&document, key_path).cloned()
    }

    fn set(&self, key_path: &str, value: Value) -> bool {
        let mut document = self.document.lock().unwrap_or_else(|e| e.into_inner());
        let mut updated = document.clone();
        if !insert(&mut updated, key_path, value) {
            return false;
        }

        match self.persist(&updated) {
            Ok(()) => {
                *document = updated;
                debug!(key = key_path, path = %self.path.display(), "State persisted");
                true
            }
            Err(e) => {
                warn!(key = key_path, error = %e, "Failed to persist state");
                false
            }
        }
    }
}

// ============================================================================
// Memory store
// ============================================================================

#[derive(Default)]
pub struct MemoryStore {
    document: Mutex<Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            document: Mutex::new(Value::Object(Map::new())),
        }
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key_path: &str) -> Option<Value> {
        let document = self.document.lock().unwrap_or_else(|e| e.into_inner());
        lookup(&document, key_path).cloned()
    }

    fn set(&self, key_path: &str, value: Value) -> bool {
        let mut document = self.document.lock().unwrap_or_else(|e| e.into_inner());
        insert(&mut document, key_path, value)
    }
}
