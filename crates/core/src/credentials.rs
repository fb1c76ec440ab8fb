//! API key list, selection, and their durable mirror.

use std::{fmt, sync::Arc};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    fingerprint::fingerprint,
    storage::{StateStore, CREDENTIALS_KEY, SELECTED_CREDENTIAL_KEY},
};

/// One stored API key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialEntry {
    /// Opaque id, generated once and never reused.
    pub id: String,
    /// The raw key, trimmed.
    pub secret: String,
    /// Display fragment captured when the entry was created.
    pub fingerprint: String,
}

impl CredentialEntry {
    fn new(secret: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            secret: secret.to_string(),
            fingerprint: fingerprint(secret),
        }
    }
}

impl fmt::Debug for CredentialEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialEntry")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Which key and character the consumer is looking at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionState {
    /// Always refers to an existing entry when set.
    pub selected_credential_id: Option<String>,
    /// Trimmed, never empty.
    pub selected_character: Option<String>,
}

/// Lifecycle of the durable mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationState {
    /// Nothing has been read yet.
    Uninitialized,
    /// Durable records are being read; mutations stay in memory only.
    Hydrating,
    /// Every mutation is mirrored to durable storage.
    Ready,
}

/// Result of [`CredentialStore::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// Input was blank after trimming.
    Empty,
    /// The key was already stored; the existing entry is now selected.
    Duplicate {
        /// Id of the existing entry.
        id: String,
    },
    /// A new entry was created, prepended and selected.
    Added {
        /// The new entry.
        entry: CredentialEntry,
    },
}

/// Result of [`CredentialStore::remove`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOutcome {
    /// An entry with the id existed.
    pub removed: bool,
    /// The removed entry was the selected one.
    pub was_selected: bool,
}

struct Inner {
    phase: HydrationState,
    entries: Vec<CredentialEntry>,
    selection: SelectionState,
}

/// Owns the ordered key list (most recent first) and the selection.
///
/// Every mutation is a single read-modify-replace under the write lock, and
/// the lock is never held across an await.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<RwLock<Inner>>,
    persistence: Arc<dyn StateStore>,
    persist_lock: Arc<tokio::sync::Mutex<()>>,
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl CredentialStore {
    /// Create an empty, not yet hydrated store.
    pub fn new(persistence: Arc<dyn StateStore>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                phase: HydrationState::Uninitialized,
                entries: Vec::new(),
                selection: SelectionState::default(),
            })),
            persistence,
            persist_lock: Arc::new(tokio::sync::Mutex::new(())),
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Current lifecycle phase.
    pub fn hydration_state(&self) -> HydrationState {
        self.inner.read().phase
    }

    /// Whether hydration has completed.
    pub fn is_ready(&self) -> bool {
        self.hydration_state() == HydrationState::Ready
    }

    /// Snapshot of the ordered entries.
    pub fn entries(&self) -> Vec<CredentialEntry> {
        self.inner.read().entries.clone()
    }

    /// Snapshot of the selection.
    pub fn selection(&self) -> SelectionState {
        self.inner.read().selection.clone()
    }

    /// Look up one entry by id.
    pub fn entry(&self, id: &str) -> Option<CredentialEntry> {
        self.inner
            .read()
            .entries
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
    }

    /// Currently selected entry, if any.
    pub fn selected_entry(&self) -> Option<CredentialEntry> {
        let inner = self.inner.read();
        let id = inner.selection.selected_credential_id.as_deref()?;
        inner.entries.iter().find(|entry| entry.id == id).cloned()
    }

    /// Whether `id` still maps to `secret`.
    pub fn holds(&self, id: &str, secret: &str) -> bool {
        self.inner
            .read()
            .entries
            .iter()
            .any(|entry| entry.id == id && entry.secret == secret)
    }

    /// Read durable records into memory, then start mirroring.
    ///
    /// Unreadable or malformed records degrade to an empty list. Entries
    /// added while hydration was in progress are kept ahead of loaded ones.
    pub async fn hydrate(&self) {
        {
            let mut inner = self.inner.write();
            if inner.phase != HydrationState::Uninitialized {
                debug!(phase = ?inner.phase, "hydration already started");
                return;
            }
            inner.phase = HydrationState::Hydrating;
        }

        let raw_entries = self.load_record(CREDENTIALS_KEY).await;
        let raw_selected = self.load_record(SELECTED_CREDENTIAL_KEY).await;
        let loaded = raw_entries
            .as_deref()
            .map(parse_entries)
            .unwrap_or_default();

        {
            let mut inner = self.inner.write();
            let mut merged = std::mem::take(&mut inner.entries);
            for entry in loaded {
                let clash = merged.iter().any(|existing| {
                    existing.id == entry.id || existing.secret.trim() == entry.secret.trim()
                });
                if !clash {
                    merged.push(entry);
                }
            }

            let exists = |id: &str| merged.iter().any(|entry| entry.id == id);
            let selected = inner
                .selection
                .selected_credential_id
                .clone()
                .filter(|id| exists(id.as_str()))
                .or_else(|| raw_selected.filter(|id| exists(id.as_str())))
                .or_else(|| merged.first().map(|entry| entry.id.clone()));

            inner.selection.selected_credential_id = selected;
            inner.entries = merged;
            inner.phase = HydrationState::Ready;
            info!(
                count = inner.entries.len(),
                selected = inner.selection.selected_credential_id.as_deref().unwrap_or("-"),
                "credentials hydrated"
            );
        }

        self.persist().await;
    }

    /// Store a new API key, or select the existing entry for a duplicate.
    pub async fn add(&self, raw_secret: &str) -> AddOutcome {
        let trimmed = raw_secret.trim();
        if trimmed.is_empty() {
            debug!("ignoring blank API key");
            return AddOutcome::Empty;
        }

        // Snapshot check only decides whether to prepare a candidate; the
        // authoritative check happens under the write lock below.
        let candidate = if self.find_by_secret(trimmed).is_some() {
            None
        } else {
            Some(CredentialEntry::new(trimmed))
        };

        let outcome = {
            let mut inner = self.inner.write();
            let existing = inner
                .entries
                .iter()
                .find(|entry| entry.secret.trim() == trimmed)
                .map(|entry| entry.id.clone());
            match existing {
                Some(id) => {
                    inner.selection.selected_credential_id = Some(id.clone());
                    AddOutcome::Duplicate { id }
                }
                None => {
                    let entry = candidate.unwrap_or_else(|| CredentialEntry::new(trimmed));
                    inner.entries.insert(0, entry.clone());
                    inner.selection.selected_credential_id = Some(entry.id.clone());
                    AddOutcome::Added { entry }
                }
            }
        };

        match &outcome {
            AddOutcome::Added { entry } => {
                info!(id = %entry.id, fp = %entry.fingerprint, "API key added")
            }
            AddOutcome::Duplicate { id } => info!(%id, "API key already stored"),
            AddOutcome::Empty => {}
        }

        self.schedule_persist();
        outcome
    }

    /// Delete an entry. Selection falls back to the first remaining entry.
    pub async fn remove(&self, id: &str) -> RemoveOutcome {
        let outcome = {
            let mut inner = self.inner.write();
            let before = inner.entries.len();
            inner.entries.retain(|entry| entry.id != id);
            let removed = inner.entries.len() != before;

            let was_selected = inner.selection.selected_credential_id.as_deref() == Some(id);
            if was_selected {
                inner.selection.selected_credential_id =
                    inner.entries.first().map(|entry| entry.id.clone());
                inner.selection.selected_character = None;
            }
            RemoveOutcome {
                removed,
                was_selected,
            }
        };

        if outcome.removed {
            info!(%id, was_selected = outcome.was_selected, "API key removed");
            self.schedule_persist();
        } else {
            debug!(%id, "remove ignored, unknown id");
        }
        outcome
    }

    /// Select a character, optionally switching to the key that owns it.
    ///
    /// An unknown `credential_id` is ignored; the character is still set.
    pub async fn select(&self, character_name: Option<&str>, credential_id: Option<&str>) {
        let character = character_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        let credential_changed = {
            let mut inner = self.inner.write();
            let mut changed = false;
            if let Some(id) = credential_id {
                if inner.entries.iter().any(|entry| entry.id == id) {
                    changed = inner.selection.selected_credential_id.as_deref() != Some(id);
                    inner.selection.selected_credential_id = Some(id.to_string());
                } else {
                    warn!(%id, "cannot select unknown API key");
                }
            }
            inner.selection.selected_character = character;
            changed
        };

        if credential_changed {
            self.schedule_persist();
        }
    }

    /// Wait until every write scheduled so far has landed.
    pub async fn flush(&self) {
        loop {
            let handles = std::mem::take(&mut *self.pending.lock());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(err) = handle.await {
                    warn!("persist task failed: {err}");
                }
            }
        }
    }

    /// Start a background write of the current state. Mutations never wait
    /// on storage; use [`CredentialStore::flush`] to wait for it.
    fn schedule_persist(&self) {
        if !self.is_ready() {
            debug!("skipping persist before hydration");
            return;
        }
        let store = self.clone();
        let handle = tokio::spawn(async move { store.persist().await });
        let mut pending = self.pending.lock();
        pending.retain(|handle| !handle.is_finished());
        pending.push(handle);
    }

    fn find_by_secret(&self, trimmed: &str) -> Option<String> {
        self.inner
            .read()
            .entries
            .iter()
            .find(|entry| entry.secret.trim() == trimmed)
            .map(|entry| entry.id.clone())
    }

    async fn load_record(&self, key: &str) -> Option<String> {
        match self.persistence.load(key).await {
            Ok(value) => value,
            Err(err) => {
                warn!(key, "failed to read record: {err}");
                None
            }
        }
    }

    /// Mirror the current state. Writes are serialised and each one reads
    /// the state at write time, so the last write always reflects the
    /// latest mutation. Failures are logged and dropped.
    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let (entries, selected) = {
            let inner = self.inner.read();
            if inner.phase != HydrationState::Ready {
                debug!(phase = ?inner.phase, "skipping persist before hydration");
                return;
            }
            (
                inner.entries.clone(),
                inner.selection.selected_credential_id.clone(),
            )
        };

        match serde_json::to_string(&entries) {
            Ok(json) => {
                if let Err(err) = self.persistence.save(CREDENTIALS_KEY, &json).await {
                    warn!("saveKeys: write failed: {err}");
                }
            }
            Err(err) => warn!("saveKeys: serialisation failed: {err}"),
        }

        let result = match selected.as_deref() {
            Some(id) => self.persistence.save(SELECTED_CREDENTIAL_KEY, id).await,
            None => self.persistence.remove(SELECTED_CREDENTIAL_KEY).await,
        };
        if let Err(err) = result {
            if selected.is_some() {
                warn!("saveKeyId: write failed: {err}");
            } else {
                warn!("removeKeyId: write failed: {err}");
            }
        }
    }
}

/// Decode and normalise a stored key list.
///
/// Accepts both the current field names and the legacy `key`/`fp` ones.
fn parse_entries(raw: &str) -> Vec<CredentialEntry> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            warn!("stored API keys are malformed, starting empty: {err}");
            return Vec::new();
        }
    };
    let Value::Array(items) = value else {
        warn!("stored API keys are not a list, starting empty");
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let object = item.as_object()?;
            let id = object.get("id")?.as_str()?.to_string();
            let secret = ["secret", "key"]
                .iter()
                .find_map(|field| object.get(*field).and_then(Value::as_str))
                .unwrap_or_default()
                .to_string();
            let stored_fingerprint = ["fingerprint", "fp"]
                .iter()
                .find_map(|field| object.get(*field).and_then(Value::as_str))
                .filter(|fp| !fp.is_empty())
                .map(str::to_string);
            Some(CredentialEntry {
                id,
                fingerprint: stored_fingerprint.unwrap_or_else(|| fingerprint(&secret)),
                secret,
            })
        })
        .collect()
}
