//! Durable key/value records backing the credential store.

use std::{
    collections::HashMap,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

/// Record holding the ordered credential list.
pub const CREDENTIALS_KEY: &str = "gw2_api_keys_v2";
/// Record holding the selected credential id.
pub const SELECTED_CREDENTIAL_KEY: &str = "gw2_selected_key_id";

/// Failure reading or writing a durable record.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing file could not be read.
    #[error("failed to read {key}: {source}")]
    Read {
        /// Record key.
        key: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The backing file could not be written or removed.
    #[error("failed to write {key}: {source}")]
    Write {
        /// Record key.
        key: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The blocking writer task panicked or was cancelled.
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Storage result alias.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Minimal async key/value contract. Callers serialise their own access.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a record, returning `None` when it has never been written.
    async fn load(&self, key: &str) -> Result<Option<String>>;
    /// Replace a record.
    async fn save(&self, key: &str, value: &str) -> Result<()>;
    /// Delete a record. Deleting a missing record succeeds.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// One file per record inside a state directory.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Store records beneath `root`, creating it lazily on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the record files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize_key(key)))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Read {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn save(&self, key: &str, value: &str) -> Result<()> {
        let root = self.root.clone();
        let path = self.path_for(key);
        let value = value.to_string();
        let owned_key = key.to_string();

        // Write to a sibling temp file and rename over the target so a crash
        // never leaves a half-written record behind.
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            std::fs::create_dir_all(&root)?;
            let mut file = tempfile::NamedTempFile::new_in(&root)?;
            file.write_all(value.as_bytes())?;
            file.flush()?;
            file.persist(&path).map_err(|err| err.error)?;
            Ok(())
        })
        .await?
        .map_err(|source| StorageError::Write {
            key: owned_key,
            source,
        })?;

        debug!(key, "record saved");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Write {
                key: key.to_string(),
                source,
            }),
        }
    }
}

/// Process-local store, used for ephemeral sessions and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    records: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store with existing records.
    pub fn with_records<I, K, V>(records: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let records = records
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        Self {
            records: Arc::new(RwLock::new(records)),
        }
    }

    /// Synchronous peek at a record.
    pub fn get(&self, key: &str) -> Option<String> {
        self.records.read().get(key).cloned()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get(key))
    }

    async fn save(&self, key: &str, value: &str) -> Result<()> {
        self.records
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.records.write().remove(key);
        Ok(())
    }
}

fn sanitize_key(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_') {
            result.push(ch);
        }
    }
    if result.is_empty() {
        "record".to_string()
    } else {
        result
    }
}
