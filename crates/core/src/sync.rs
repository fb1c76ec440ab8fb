use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    api::{
        endpoints, Account, ApiError, CharacterNameList, Dispatcher, RequestOptions, Result,
    },
    credentials::{CredentialEntry, CredentialStore},
    fingerprint::{auth_hash, fingerprint},
};

const EVENT_BUFFER: usize = 32;

/// Events emitted as per-key refreshes settle.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Account and character list were stored for the key.
    Refreshed {
        /// Key id.
        credential_id: String,
        /// Account display name.
        account_name: String,
        /// Number of characters visible to the key.
        characters: usize,
    },
    /// One of the two requests failed; cached data was left untouched.
    Failed {
        /// Key id.
        credential_id: String,
        /// Rendered error.
        error: String,
    },
    /// The key was removed or replaced while its refresh was in flight.
    Discarded {
        /// Key id.
        credential_id: String,
    },
}

/// Account profile and character names fetched together for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountSnapshot {
    /// Key id the data belongs to.
    pub credential_id: String,
    /// Profile from `/account`.
    pub account: Account,
    /// Names from `/characters`.
    pub characters: CharacterNameList,
}

#[derive(Default)]
struct AccountCache {
    accounts: HashMap<String, Account>,
    characters: HashMap<String, CharacterNameList>,
}

/// Holds the process-wide loading flag up for as long as it lives.
pub struct LoadingGuard {
    counter: Arc<AtomicUsize>,
}

impl LoadingGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Fetches and indexes account data per API key.
#[derive(Clone)]
pub struct AccountSyncEngine {
    dispatcher: Dispatcher,
    credentials: CredentialStore,
    cache: Arc<RwLock<AccountCache>>,
    in_flight: Arc<AtomicUsize>,
    events: Arc<RwLock<Option<mpsc::Sender<SyncEvent>>>>,
}

impl AccountSyncEngine {
    /// Create an engine that commits only for keys still held by `credentials`.
    pub fn new(dispatcher: Dispatcher, credentials: CredentialStore) -> Self {
        Self {
            dispatcher,
            credentials,
            cache: Arc::new(RwLock::new(AccountCache::default())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            events: Arc::new(RwLock::new(None)),
        }
    }

    /// Start receiving [`SyncEvent`]s. Replaces any earlier subscriber.
    pub fn subscribe(&self) -> mpsc::Receiver<SyncEvent> {
        let (sender, receiver) = mpsc::channel(EVENT_BUFFER);
        *self.events.write() = Some(sender);
        receiver
    }

    /// Whether a [`AccountSyncEngine::refresh_all`] is in flight.
    pub fn is_loading(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) > 0
    }

    /// Cached account for a key.
    pub fn account(&self, credential_id: &str) -> Option<Account> {
        self.cache.read().accounts.get(credential_id).cloned()
    }

    /// Cached character names for a key.
    pub fn characters(&self, credential_id: &str) -> Option<CharacterNameList> {
        self.cache.read().characters.get(credential_id).cloned()
    }

    /// All cached accounts keyed by key id.
    pub fn accounts_by_credential(&self) -> HashMap<String, Account> {
        self.cache.read().accounts.clone()
    }

    /// All cached character lists keyed by key id.
    pub fn characters_by_credential(&self) -> HashMap<String, CharacterNameList> {
        self.cache.read().characters.clone()
    }

    /// Drop everything cached for a key.
    pub fn forget(&self, credential_id: &str) {
        let mut cache = self.cache.write();
        cache.accounts.remove(credential_id);
        cache.characters.remove(credential_id);
        debug!(credential_id, "cached account data dropped");
    }

    /// Fetch account and characters for one key concurrently.
    ///
    /// Both are stored only when both succeed. A result for a key that was
    /// removed while the requests were in flight is returned but not stored.
    pub async fn refresh(&self, credential_id: &str, secret: &str) -> Result<AccountSnapshot> {
        debug!(
            credential_id,
            fp = %fingerprint(secret),
            key_hash = %auth_hash(secret),
            "refreshing account"
        );

        let (account, characters) = tokio::join!(
            self.dispatcher.dispatch_as::<Account>(
                endpoints::ACCOUNT,
                RequestOptions::authenticated(Some(secret)),
            ),
            self.dispatcher.dispatch_as::<CharacterNameList>(
                endpoints::CHARACTERS,
                RequestOptions::authenticated(Some(secret)),
            ),
        );

        let (account, characters) = match (account, characters) {
            (Ok(account), Ok(characters)) => (account, characters),
            (Err(err), _) | (_, Err(err)) => {
                warn!(credential_id, "account refresh failed: {err}");
                self.emit(SyncEvent::Failed {
                    credential_id: credential_id.to_string(),
                    error: err.to_string(),
                });
                return Err(err);
            }
        };

        let snapshot = AccountSnapshot {
            credential_id: credential_id.to_string(),
            account,
            characters,
        };

        // The membership check and the write share one critical section so
        // a concurrent removal either wins entirely or loses entirely.
        let committed = {
            let mut cache = self.cache.write();
            if self.credentials.holds(credential_id, secret) {
                cache
                    .accounts
                    .insert(credential_id.to_string(), snapshot.account.clone());
                cache
                    .characters
                    .insert(credential_id.to_string(), snapshot.characters.clone());
                true
            } else {
                false
            }
        };

        if committed {
            info!(
                credential_id,
                account = %snapshot.account.name,
                characters = snapshot.characters.len(),
                "account refreshed"
            );
            self.emit(SyncEvent::Refreshed {
                credential_id: credential_id.to_string(),
                account_name: snapshot.account.name.clone(),
                characters: snapshot.characters.len(),
            });
        } else {
            debug!(credential_id, "discarding refresh for a key no longer stored");
            self.emit(SyncEvent::Discarded {
                credential_id: credential_id.to_string(),
            });
        }

        Ok(snapshot)
    }

    /// Refresh every entry concurrently.
    ///
    /// Each key commits independently. After everything settles, the first
    /// failure (in entry order) becomes the aggregate error.
    pub async fn refresh_all(&self, entries: &[CredentialEntry]) -> Result<Vec<AccountSnapshot>> {
        let _loading = LoadingGuard::new(&self.in_flight);
        info!(count = entries.len(), "refreshing all API keys");

        let results = join_all(
            entries
                .iter()
                .map(|entry| self.refresh(&entry.id, &entry.secret)),
        )
        .await;

        let mut snapshots = Vec::with_capacity(results.len());
        let mut first_error: Option<ApiError> = None;
        for result in results {
            match result {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Some(err) = first_error {
            self.dispatcher.last_error().set(err.to_string());
            return Err(err);
        }
        Ok(snapshots)
    }

    fn emit(&self, event: SyncEvent) {
        let events = self.events.read();
        if let Some(sender) = events.as_ref() {
            if let Err(err) = sender.try_send(event) {
                debug!("sync event dropped: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{credentials::AddOutcome, storage::MemoryStateStore};
    use mockito::{Matcher, Mock, Server, ServerGuard};
    use std::time::Duration;

    async fn engine(server: &Server) -> (AccountSyncEngine, CredentialStore) {
        let dispatcher = Dispatcher::new(&server.url(), Duration::from_secs(5), "test")
            .expect("dispatcher");
        let store = CredentialStore::new(Arc::new(MemoryStateStore::new()));
        store.hydrate().await;
        (AccountSyncEngine::new(dispatcher, store.clone()), store)
    }

    async fn add(store: &CredentialStore, secret: &str) -> CredentialEntry {
        match store.add(secret).await {
            AddOutcome::Added { entry } => entry,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    async fn mock_endpoint(
        server: &mut ServerGuard,
        path: &str,
        secret: &str,
        status: usize,
        body: &str,
    ) -> Mock {
        server
            .mock("GET", path)
            .match_query(Matcher::Any)
            .match_header("authorization", format!("Bearer {secret}").as_str())
            .with_status(status)
            .with_body(body)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn refresh_stores_account_and_characters() {
        let mut server = Server::new_async().await;
        mock_endpoint(&mut server, "/account", "KEY-1", 200, r#"{"id":"a1","name":"One.1234"}"#)
            .await;
        mock_endpoint(&mut server, "/characters", "KEY-1", 200, r#"["Alpha","Beta"]"#).await;

        let (engine, store) = engine(&server).await;
        let mut events = engine.subscribe();
        let entry = add(&store, "KEY-1").await;

        let snapshot = engine.refresh(&entry.id, &entry.secret).await.expect("refresh");
        assert_eq!(snapshot.account.name, "One.1234");
        assert_eq!(
            engine.characters(&entry.id),
            Some(vec!["Alpha".to_string(), "Beta".to_string()])
        );
        assert_eq!(engine.account(&entry.id).map(|a| a.id), Some("a1".to_string()));
        assert_eq!(
            events.try_recv().expect("event"),
            SyncEvent::Refreshed {
                credential_id: entry.id.clone(),
                account_name: "One.1234".to_string(),
                characters: 2,
            }
        );
    }

    #[tokio::test]
    async fn failed_half_leaves_previous_data_untouched() {
        let mut server = Server::new_async().await;
        let account = mock_endpoint(&mut server, "/account", "KEY-1", 200, r#"{"id":"a1","name":"Old"}"#)
            .await;
        let chars = mock_endpoint(&mut server, "/characters", "KEY-1", 200, r#"["Alpha"]"#).await;

        let (engine, store) = engine(&server).await;
        let entry = add(&store, "KEY-1").await;
        engine.refresh(&entry.id, &entry.secret).await.expect("first refresh");

        account.remove_async().await;
        chars.remove_async().await;
        mock_endpoint(&mut server, "/account", "KEY-1", 200, r#"{"id":"a1","name":"New"}"#).await;
        mock_endpoint(&mut server, "/characters", "KEY-1", 500, "boom").await;

        let err = engine
            .refresh(&entry.id, &entry.secret)
            .await
            .expect_err("second refresh fails");
        assert_eq!(err.status(), Some(500));
        assert_eq!(engine.account(&entry.id).map(|a| a.name), Some("Old".to_string()));
        assert_eq!(engine.characters(&entry.id), Some(vec!["Alpha".to_string()]));
    }

    #[tokio::test]
    async fn refresh_for_removed_key_is_not_stored() {
        let mut server = Server::new_async().await;
        mock_endpoint(&mut server, "/account", "KEY-1", 200, r#"{"id":"a1","name":"One"}"#).await;
        mock_endpoint(&mut server, "/characters", "KEY-1", 200, "[]").await;

        let (engine, store) = engine(&server).await;
        let mut events = engine.subscribe();
        let entry = add(&store, "KEY-1").await;
        store.remove(&entry.id).await;

        engine
            .refresh(&entry.id, &entry.secret)
            .await
            .expect("requests still succeed");
        assert!(engine.accounts_by_credential().is_empty());
        assert_eq!(
            events.try_recv().expect("event"),
            SyncEvent::Discarded {
                credential_id: entry.id
            }
        );
    }

    #[tokio::test]
    async fn refresh_all_clears_loading_and_reports_failure() {
        let mut server = Server::new_async().await;
        mock_endpoint(&mut server, "/account", "KEY-1", 401, "invalid key").await;
        mock_endpoint(&mut server, "/characters", "KEY-1", 200, "[]").await;

        let (engine, store) = engine(&server).await;
        add(&store, "KEY-1").await;

        let err = engine
            .refresh_all(&store.entries())
            .await
            .expect_err("aggregate failure");
        assert_eq!(err.status(), Some(401));
        assert!(!engine.is_loading());
        assert_eq!(
            engine.dispatcher.last_error().get().as_deref(),
            Some("GW2 API error 401: invalid key")
        );
    }

    #[tokio::test]
    async fn refresh_all_with_no_entries_is_empty() {
        let server = Server::new_async().await;
        let (engine, _store) = engine(&server).await;
        let results = engine.refresh_all(&[]).await.expect("empty refresh");
        assert!(results.is_empty());
        assert!(!engine.is_loading());
    }

    #[test]
    fn loading_guard_tracks_nesting() {
        let counter = Arc::new(AtomicUsize::new(0));
        let outer = LoadingGuard::new(&counter);
        {
            let _inner = LoadingGuard::new(&counter);
            assert_eq!(counter.load(Ordering::Acquire), 2);
        }
        assert_eq!(counter.load(Ordering::Acquire), 1);
        drop(outer);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    #[test]
    fn forget_drops_both_records() {
        let dispatcher =
            Dispatcher::new("https://example.com/v2", Duration::from_secs(1), "t").expect("d");
        let store = CredentialStore::new(Arc::new(MemoryStateStore::new()));
        let engine = AccountSyncEngine::new(dispatcher, store);
        {
            let mut cache = engine.cache.write();
            cache.characters.insert("k".to_string(), vec!["A".to_string()]);
        }
        engine.forget("k");
        assert!(engine.characters("k").is_none());
    }
}
