//! Durable flags that outlive the process.
//!
//! The lifecycle state machine reads `service_running` at boot to decide
//! whether tracking should resume; the user preference `auto_start_enabled`
//! lives next to it.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by a state store backend
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Keys persisted by the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKey {
    /// Tracking was running when the process last changed state
    ServiceRunning,
    /// User preference for starting tracking automatically
    AutoStartEnabled,
}

impl StateKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKey::ServiceRunning => "service_running",
            StateKey::AutoStartEnabled => "auto_start_enabled",
        }
    }
}

/// Small durable boolean map.
///
/// `set` and `clear` are durable before they return. Backends serialize
/// individual writes; there is no batching.
pub trait StateStore: Send + Sync {
    fn get(&self, key: StateKey, default: bool) -> bool;
    fn set(&self, key: StateKey, value: bool) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

/// JSON file backed store.
///
/// Every write rewrites the whole document through a temporary file and an
/// atomic rename, so a crash mid-write leaves the previous contents intact.
pub struct FileStateStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, bool>>,
}

impl FileStateStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let values = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Read { path, source }),
        };

        debug!(path = %path.display(), entries = values.len(), "Opened state store");

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, bool>) -> Result<(), StoreError> {
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(write_err)?;
            }
        }

        let bytes = serde_json::to_vec_pretty(values).map_err(|e| write_err(e.into()))?;
        let tmp_path = self.path.with_extension("tmp");

        let mut file = fs::File::create(&tmp_path).map_err(write_err)?;
        file.write_all(&bytes).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        fs::rename(&tmp_path, &self.path).map_err(write_err)?;

        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn get(&self, key: StateKey, default: bool) -> bool {
        self.values
            .lock()
            .get(key.as_str())
            .copied()
            .unwrap_or(default)
    }

    fn set(&self, key: StateKey, value: bool) -> Result<(), StoreError> {
        let mut values = self.values.lock();
        let previous = values.insert(key.as_str().to_string(), value);

        if let Err(e) = self.persist(&values) {
            // Keep memory in line with what is on disk
            match previous {
                Some(old) => values.insert(key.as_str().to_string(), old),
                None => values.remove(key.as_str()),
            };
            warn!(key = key.as_str(), error = %e, "Failed to persist state");
            return Err(e);
        }

        debug!(key = key.as_str(), value = value, "State persisted");
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut values = self.values.lock();
        let empty = BTreeMap::new();
        self.persist(&empty)?;
        *values = empty;
        Ok(())
    }
}

/// Process-local store, lost on exit
#[derive(Default)]
pub struct MemoryStateStore {
    values: Mutex<BTreeMap<&'static str, bool>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: StateKey, default: bool) -> bool {
        self.values
            .lock()
            .get(key.as_str())
            .copied()
            .unwrap_or(default)
    }

    fn set(&self, key: StateKey, value: bool) -> Result<(), StoreError> {
        self.values.lock().insert(key.as_str(), value);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.values.lock().clear();
        Ok(())
    }
}
