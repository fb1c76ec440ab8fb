//! Consumer-facing facade over the credential store, sync engine and
//! resolution pipeline.

use std::{collections::HashMap, sync::Arc};

use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    api::{
        Account, ApiError, BuildTab, CharacterEquipment, CharacterNameList, Dispatcher,
        RequestOptions, Result,
    },
    config::AppConfig,
    credentials::{AddOutcome, CredentialEntry, CredentialStore, RemoveOutcome, SelectionState},
    resolve::{ResolutionPipeline, ResolvedBuild, ResolvedEquipment},
    storage::StateStore,
    sync::{AccountSnapshot, AccountSyncEngine, SyncEvent},
};

/// Point-in-time view of everything a frontend renders.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Durable records have been read.
    pub hydrated: bool,
    /// Stored keys, most recent first.
    pub credentials: Vec<CredentialEntry>,
    /// Cached accounts keyed by key id.
    pub accounts_by_credential: HashMap<String, Account>,
    /// Cached character names keyed by key id.
    pub characters_by_credential: HashMap<String, CharacterNameList>,
    /// Selected key and character.
    pub selection: SelectionState,
    /// A full refresh is in flight.
    pub loading: bool,
    /// Message of the most recent dispatch failure.
    pub last_error: Option<String>,
}

impl Snapshot {
    /// The selected key entry.
    pub fn selected_entry(&self) -> Option<&CredentialEntry> {
        let id = self.selection.selected_credential_id.as_deref()?;
        self.credentials.iter().find(|entry| entry.id == id)
    }

    /// Cached account of the selected key.
    pub fn account(&self) -> Option<&Account> {
        let id = self.selection.selected_credential_id.as_deref()?;
        self.accounts_by_credential.get(id)
    }

    /// Cached character names of the selected key.
    pub fn characters(&self) -> Option<&CharacterNameList> {
        let id = self.selection.selected_credential_id.as_deref()?;
        self.characters_by_credential.get(id)
    }
}

/// Result of [`Gw2Client::add_credential`].
#[derive(Debug)]
pub enum AddResult {
    /// Input was blank.
    Empty,
    /// Already stored; the existing entry was selected and nothing fetched.
    Duplicate {
        /// Existing entry id.
        id: String,
    },
    /// Stored and selected; its first refresh is running in the background.
    Added {
        /// The new entry.
        entry: CredentialEntry,
        /// Handle to the initial refresh.
        refresh: JoinHandle<Result<AccountSnapshot>>,
    },
}

/// The multi-key GW2 data engine.
#[derive(Clone)]
pub struct Gw2Client {
    dispatcher: Dispatcher,
    credentials: CredentialStore,
    sync: AccountSyncEngine,
    resolver: ResolutionPipeline,
}

impl Gw2Client {
    /// Build a client from configuration and a durable store.
    pub fn new(config: &AppConfig, persistence: Arc<dyn StateStore>) -> Result<Self> {
        Ok(Self::with_dispatcher(
            Dispatcher::from_config(config)?,
            persistence,
        ))
    }

    /// Build a client around an existing dispatcher.
    pub fn with_dispatcher(dispatcher: Dispatcher, persistence: Arc<dyn StateStore>) -> Self {
        let credentials = CredentialStore::new(persistence);
        let sync = AccountSyncEngine::new(dispatcher.clone(), credentials.clone());
        let resolver = ResolutionPipeline::new(dispatcher.clone());
        Self {
            dispatcher,
            credentials,
            sync,
            resolver,
        }
    }

    /// Read stored keys and selection. Mutations before this stay in memory.
    pub async fn hydrate(&self) {
        self.credentials.hydrate().await;
    }

    /// Wait for pending key and selection writes to reach storage.
    pub async fn flush(&self) {
        self.credentials.flush().await;
    }

    /// Receive refresh events.
    pub fn subscribe(&self) -> mpsc::Receiver<SyncEvent> {
        self.sync.subscribe()
    }

    /// Current state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            hydrated: self.credentials.is_ready(),
            credentials: self.credentials.entries(),
            accounts_by_credential: self.sync.accounts_by_credential(),
            characters_by_credential: self.sync.characters_by_credential(),
            selection: self.credentials.selection(),
            loading: self.sync.is_loading(),
            last_error: self.dispatcher.last_error().get(),
        }
    }

    /// Forget the last error message.
    pub fn clear_error(&self) {
        self.dispatcher.last_error().clear();
    }

    /// Store a key and, if it is new, start fetching its account data.
    pub async fn add_credential(&self, raw_secret: &str) -> AddResult {
        match self.credentials.add(raw_secret).await {
            AddOutcome::Empty => AddResult::Empty,
            AddOutcome::Duplicate { id } => AddResult::Duplicate { id },
            AddOutcome::Added { entry } => {
                let sync = self.sync.clone();
                let (id, secret) = (entry.id.clone(), entry.secret.clone());
                let refresh = tokio::spawn(async move { sync.refresh(&id, &secret).await });
                AddResult::Added { entry, refresh }
            }
        }
    }

    /// Delete a key together with its cached account data.
    pub async fn remove_credential(&self, id: &str) -> RemoveOutcome {
        let outcome = self.credentials.remove(id).await;
        self.sync.forget(id);
        outcome
    }

    /// Select a character, optionally switching to the key that owns it.
    pub async fn select_character(&self, character_name: Option<&str>, credential_id: Option<&str>) {
        self.credentials.select(character_name, credential_id).await;
    }

    /// Refresh one stored key.
    pub async fn refresh(&self, credential_id: &str) -> Result<AccountSnapshot> {
        let entry = self.credentials.entry(credential_id).ok_or_else(|| {
            ApiError::InvalidInput(format!("Unknown API key id {credential_id}"))
        })?;
        self.sync.refresh(&entry.id, &entry.secret).await
    }

    /// Refresh every stored key concurrently.
    pub async fn refresh_all(&self) -> Result<Vec<AccountSnapshot>> {
        self.sync.refresh_all(&self.credentials.entries()).await
    }

    /// Resolve a character's active build using the selected key.
    pub async fn resolve_build(
        &self,
        character_name: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolvedBuild> {
        let secret = self.selected_secret();
        self.resolver
            .resolve_build(character_name, secret.as_deref(), cancel)
            .await
    }

    /// Resolve a character's equipment using the selected key.
    pub async fn resolve_equipment(
        &self,
        character_name: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolvedEquipment> {
        let secret = self.selected_secret();
        self.resolver
            .resolve_equipment(character_name, secret.as_deref(), cancel)
            .await
    }

    /// Active build tab without id resolution.
    pub async fn active_build(&self, character_name: &str) -> Result<BuildTab> {
        let secret = self.selected_secret();
        self.resolver
            .active_build(character_name, secret.as_deref())
            .await
    }

    /// Equipment list without id resolution.
    pub async fn equipment(&self, character_name: &str) -> Result<CharacterEquipment> {
        let secret = self.selected_secret();
        self.resolver.equipment(character_name, secret.as_deref()).await
    }

    /// Raw dispatch. Authenticated calls without an explicit key use the
    /// selected one.
    pub async fn request(&self, path: &str, mut options: RequestOptions) -> Result<Value> {
        if options.auth && options.secret.is_none() {
            options.secret = self.selected_secret();
        }
        self.dispatcher.dispatch(path, options).await
    }

    fn selected_secret(&self) -> Option<String> {
        let entry = self.credentials.selected_entry();
        if entry.is_none() {
            debug!("no API key selected");
        }
        entry.map(|entry| entry.secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{resolve::LatestRequest, storage::MemoryStateStore};
    use mockito::{Matcher, Server, ServerGuard};
    use std::time::Duration;

    fn client(server: &ServerGuard) -> Gw2Client {
        let dispatcher =
            Dispatcher::new(&server.url(), Duration::from_secs(5), "test").expect("dispatcher");
        Gw2Client::with_dispatcher(dispatcher, Arc::new(MemoryStateStore::new()))
    }

    #[tokio::test]
    async fn request_uses_selected_key() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/tokeninfo")
            .match_query(Matcher::Any)
            .match_header("authorization", "Bearer SELECTED")
            .with_status(200)
            .with_body(r#"{"name":"phone"}"#)
            .create_async()
            .await;
        server
            .mock("GET", Matcher::Regex("^/(account|characters)".to_string()))
            .with_status(404)
            .create_async()
            .await;

        let client = client(&server);
        client.hydrate().await;
        let err = client
            .request("/tokeninfo", RequestOptions::authenticated(None))
            .await
            .expect_err("no key yet");
        assert!(matches!(err, ApiError::CredentialMissing));

        client.add_credential("SELECTED").await;
        let value = client
            .request("/tokeninfo", RequestOptions::authenticated(None))
            .await
            .expect("request");
        assert_eq!(value["name"], "phone");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn remove_drops_cached_account_data() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/account")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"id":"a","name":"Hero.1"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/characters")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"["Hero"]"#)
            .create_async()
            .await;

        let client = client(&server);
        client.hydrate().await;
        let AddResult::Added { entry, refresh } = client.add_credential("KEY").await else {
            panic!("expected add");
        };
        refresh.await.expect("join").expect("refresh");

        let snapshot = client.snapshot();
        assert_eq!(snapshot.account().map(|a| a.name.as_str()), Some("Hero.1"));
        assert_eq!(snapshot.characters().map(Vec::len), Some(1));

        client.select_character(Some("Hero"), None).await;
        client.remove_credential(&entry.id).await;

        let snapshot = client.snapshot();
        assert!(snapshot.accounts_by_credential.is_empty());
        assert!(snapshot.characters_by_credential.is_empty());
        assert_eq!(snapshot.selection, SelectionState::default());
    }

    #[tokio::test]
    async fn refresh_unknown_id_is_invalid_input() {
        let server = Server::new_async().await;
        let client = client(&server);
        let err = client.refresh("nope").await.expect_err("unknown");
        assert!(matches!(err, ApiError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn clear_error_resets_last_error() {
        let server = Server::new_async().await;
        let client = client(&server);
        let _ = client
            .resolve_equipment("Hero", &CancellationToken::new())
            .await;
        assert_eq!(client.snapshot().last_error.as_deref(), Some("Missing API key."));
        client.clear_error();
        assert_eq!(client.snapshot().last_error, None);
    }

    async fn account_mocks(server: &mut ServerGuard, secret: &str, name: &str, characters: &str) {
        let bearer = format!("Bearer {secret}");
        server
            .mock("GET", "/account")
            .match_query(Matcher::Any)
            .match_header("authorization", bearer.as_str())
            .with_status(200)
            .with_body(format!(r#"{{"id":"{name}","name":"{name}"}}"#))
            .create_async()
            .await;
        server
            .mock("GET", "/characters")
            .match_query(Matcher::Any)
            .match_header("authorization", bearer.as_str())
            .with_status(200)
            .with_body(characters)
            .create_async()
            .await;
    }

    #[tokio::test]
    async fn added_key_is_fingerprinted_selected_and_refreshed() {
        let mut server = Server::new_async().await;
        account_mocks(&mut server, "AAAA-1111-BBBB-2222", "Alpha.1", r#"["Hero","Sidekick"]"#)
            .await;
        let client = client(&server);
        client.hydrate().await;
        let mut events = client.subscribe();

        let AddResult::Added { entry, refresh } = client.add_credential(" AAAA-1111-BBBB-2222 ").await
        else {
            panic!("expected add");
        };
        assert_eq!(entry.fingerprint, "BB2222");
        assert_eq!(entry.secret, "AAAA-1111-BBBB-2222");
        refresh.await.expect("join").expect("refresh");

        let snapshot = client.snapshot();
        assert_eq!(snapshot.selected_entry().map(|e| e.id.as_str()), Some(entry.id.as_str()));
        assert_eq!(snapshot.account().map(|a| a.name.as_str()), Some("Alpha.1"));
        assert_eq!(snapshot.characters().map(Vec::len), Some(2));
        assert_eq!(
            events.recv().await,
            Some(SyncEvent::Refreshed {
                credential_id: entry.id.clone(),
                account_name: "Alpha.1".to_string(),
                characters: 2,
            })
        );
    }

    #[tokio::test]
    async fn duplicate_add_selects_existing_without_fetching() {
        let mut server = Server::new_async().await;
        let account = server
            .mock("GET", "/account")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"id":"a","name":"Alpha.1"}"#)
            .expect(2)
            .create_async()
            .await;
        server
            .mock("GET", "/characters")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;
        let client = client(&server);
        client.hydrate().await;

        let AddResult::Added { entry, refresh } = client.add_credential("KEY-ONE").await else {
            panic!("expected add");
        };
        refresh.await.expect("join").expect("refresh");
        let AddResult::Added { refresh, .. } = client.add_credential("KEY-TWO").await else {
            panic!("expected add");
        };
        let _ = refresh.await;

        match client.add_credential("KEY-ONE").await {
            AddResult::Duplicate { id } => assert_eq!(id, entry.id),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            client.snapshot().selection.selected_credential_id.as_deref(),
            Some(entry.id.as_str())
        );
        assert!(matches!(client.add_credential("   ").await, AddResult::Empty));
        assert_eq!(client.snapshot().credentials.len(), 2);
        account.assert_async().await;
    }

    #[tokio::test]
    async fn refresh_all_keeps_healthy_keys_and_reports_failure() {
        let mut server = Server::new_async().await;
        account_mocks(&mut server, "GOOD", "Good.1", r#"["Hero"]"#).await;
        server
            .mock("GET", "/account")
            .match_query(Matcher::Any)
            .match_header("authorization", "Bearer BAD")
            .with_status(200)
            .with_body(r#"{"id":"b","name":"Bad.1"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/characters")
            .match_query(Matcher::Any)
            .match_header("authorization", "Bearer BAD")
            .with_status(401)
            .with_body("Invalid access token")
            .create_async()
            .await;

        let client = client(&server);
        client.hydrate().await;
        let mut ids = Vec::new();
        for secret in ["GOOD", "BAD"] {
            let AddResult::Added { entry, refresh } = client.add_credential(secret).await else {
                panic!("expected add");
            };
            let _ = refresh.await;
            ids.push(entry.id);
        }

        let err = client.refresh_all().await.expect_err("one key fails");
        assert_eq!(err.status(), Some(401));

        let snapshot = client.snapshot();
        assert!(!snapshot.loading);
        assert_eq!(
            snapshot.accounts_by_credential.get(&ids[0]).map(|a| a.name.as_str()),
            Some("Good.1")
        );
        assert_eq!(
            snapshot.characters_by_credential.get(&ids[0]),
            Some(&vec!["Hero".to_string()])
        );
        assert!(!snapshot.accounts_by_credential.contains_key(&ids[1]));
        assert_eq!(
            snapshot.last_error.as_deref(),
            Some("GW2 API error 401: Invalid access token")
        );
    }

    #[tokio::test]
    async fn build_without_elite_or_lines_skips_trait_lookups() {
        let mut server = Server::new_async().await;
        account_mocks(&mut server, "KEY", "Alpha.1", r#"["Hero"]"#).await;
        server
            .mock("GET", "/characters/Hero/buildtabs/active")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"tab":1,"is_active":true,"build":{"name":"Bare","profession":"Warrior",
                    "specializations":[],"skills":{"heal":14402,"utilities":[14404,null,14405],"elite":null}}}"#,
            )
            .create_async()
            .await;
        let skills = server
            .mock("GET", "/skills")
            .match_query(Matcher::UrlEncoded(
                "ids".to_string(),
                "14402,14404,14405".to_string(),
            ))
            .with_status(200)
            .with_body(r#"[{"id":14402,"name":"Mending"},{"id":14404,"name":"Shake It Off!"},{"id":14405,"name":"Banner"}]"#)
            .create_async()
            .await;
        let specializations = server
            .mock("GET", "/specializations")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let traits = server
            .mock("GET", "/traits")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let client = client(&server);
        client.hydrate().await;
        let _ = client.add_credential("KEY").await;

        let build = client
            .resolve_build("Hero", &CancellationToken::new())
            .await
            .expect("build");
        assert!(build.specializations.is_empty());
        assert!(build.specializations_by_id.is_empty());
        assert!(build.traits_by_id.is_empty());
        assert_eq!(build.land_skills.as_ref().and_then(|bar| bar.elite), None);
        assert_eq!(build.skills_by_id.len(), 3);

        skills.assert_async().await;
        specializations.assert_async().await;
        traits.assert_async().await;
    }

    #[tokio::test]
    async fn latest_equipment_request_wins() {
        let mut server = Server::new_async().await;
        account_mocks(&mut server, "KEY", "Alpha.1", r#"["First","Second"]"#).await;
        for (name, item) in [("First", 100), ("Second", 200)] {
            server
                .mock("GET", format!("/characters/{name}/equipment").as_str())
                .match_query(Matcher::Any)
                .with_status(200)
                .with_body(format!(r#"{{"equipment":[{{"id":{item},"slot":"Helm"}}]}}"#))
                .create_async()
                .await;
        }
        server
            .mock("GET", "/items")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"[{"id":100,"name":"Old"},{"id":200,"name":"New"}]"#)
            .create_async()
            .await;

        let client = client(&server);
        client.hydrate().await;
        let _ = client.add_credential("KEY").await;

        let latest = LatestRequest::<ResolvedEquipment>::new();
        let first_token = latest.begin();
        let second_token = latest.begin();
        let (first, second) = tokio::join!(
            client.resolve_equipment("First", &first_token),
            client.resolve_equipment("Second", &second_token),
        );

        assert!(matches!(first, Err(ApiError::Cancelled)));
        if let Ok(value) = first {
            latest.commit(&first_token, value);
        }
        assert!(latest.commit(&second_token, second.expect("second")));

        let current = latest.current().expect("committed");
        assert_eq!(current.character_name, "Second");
        assert_eq!(current.equipment[0].id, Some(200));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slow_earlier_equipment_request_cannot_overwrite_later_one() {
        let mut server = Server::new_async().await;
        account_mocks(&mut server, "KEY", "Alpha.1", r#"["First","Second"]"#).await;
        let first_mock = server
            .mock("GET", "/characters/First/equipment")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body_from_request(|_| {
                std::thread::sleep(Duration::from_millis(400));
                br#"{"equipment":[{"id":100,"slot":"Helm"}]}"#.to_vec()
            })
            .create_async()
            .await;
        server
            .mock("GET", "/characters/Second/equipment")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"equipment":[{"id":200,"slot":"Helm"}]}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/items")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"[{"id":100,"name":"Old"},{"id":200,"name":"New"}]"#)
            .create_async()
            .await;

        let client = client(&server);
        client.hydrate().await;
        let _ = client.add_credential("KEY").await;

        let latest = LatestRequest::<ResolvedEquipment>::new();
        let first_token = latest.begin();
        let first = async {
            let result = client.resolve_equipment("First", &first_token).await;
            let committed = match &result {
                Ok(value) => latest.commit(&first_token, value.clone()),
                Err(_) => false,
            };
            (result, committed)
        };
        let second = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let second_token = latest.begin();
            let result = client.resolve_equipment("Second", &second_token).await;
            let committed = match &result {
                Ok(value) => latest.commit(&second_token, value.clone()),
                Err(_) => false,
            };
            (result, committed)
        };
        let ((first, first_committed), (second, second_committed)) = tokio::join!(first, second);

        assert!(matches!(first, Err(ApiError::Cancelled)));
        assert!(!first_committed);
        first_mock.assert_async().await;
        assert!(second.is_ok());
        assert!(second_committed);

        let current = latest.current().expect("committed");
        assert_eq!(current.character_name, "Second");
        assert_eq!(current.items_by_id.get(&200).and_then(|i| i.name.as_deref()), Some("New"));
    }
}
