use std::{
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use parking_lot::RwLock;
use reqwest::{header, Client, Method, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::{
    error::{ApiError, Result},
    models::Identified,
};
use crate::{config::AppConfig, fingerprint::auth_hash};

/// Query parameter carrying the cache-defeat stamp on authenticated calls.
pub const CACHE_DEFEAT_PARAM: &str = "_";

/// Process-wide "last error" shared by everything that dispatches.
#[derive(Debug, Clone, Default)]
pub struct ErrorSlot {
    inner: Arc<RwLock<Option<String>>>,
}

impl ErrorSlot {
    /// Current message, if any.
    pub fn get(&self) -> Option<String> {
        self.inner.read().clone()
    }

    /// Overwrite the current message.
    pub fn set(&self, message: impl Into<String>) {
        *self.inner.write() = Some(message.into());
    }

    /// Forget the current message.
    pub fn clear(&self) {
        *self.inner.write() = None;
    }
}

/// Per-call options for [`Dispatcher::dispatch`].
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// HTTP method, `GET` unless overridden.
    pub method: Method,
    /// Query pairs appended in order.
    pub query: Vec<(String, String)>,
    /// Optional JSON body.
    pub body: Option<Value>,
    /// Attach the bearer key and defeat caches.
    pub auth: bool,
    /// Raw API key used when `auth` is set.
    pub secret: Option<String>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            query: Vec::new(),
            body: None,
            auth: true,
            secret: None,
        }
    }
}

impl RequestOptions {
    /// Authenticated GET using `secret`.
    pub fn authenticated(secret: Option<&str>) -> Self {
        Self {
            secret: secret.map(str::to_string),
            ..Self::default()
        }
    }

    /// Unauthenticated GET against a credential-independent endpoint.
    pub fn public() -> Self {
        Self {
            auth: false,
            ..Self::default()
        }
    }

    /// Append a query pair.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Override the HTTP method.
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Attach a JSON body.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Issues single HTTP calls against the API and classifies the outcome.
///
/// Cheap to clone; clones share the HTTP connection pool, the last-error
/// slot and the cache-defeat counter.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: Client,
    base_url: Url,
    last_error: ErrorSlot,
    last_stamp: Arc<AtomicI64>,
}

impl Dispatcher {
    /// Build a dispatcher rooted at `base_url`.
    pub fn new(base_url: &str, timeout: Duration, user_agent: &str) -> Result<Self> {
        let base_url =
            Url::parse(base_url).map_err(|err| ApiError::InvalidUrl(format!("{base_url}: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(base_url.to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .gzip(true)
            .build()
            .map_err(ApiError::Network)?;

        Ok(Self {
            client,
            base_url,
            last_error: ErrorSlot::default(),
            last_stamp: Arc::new(AtomicI64::new(0)),
        })
    }

    /// Build a dispatcher from application configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::new(
            &config.api_base_url,
            Duration::from_secs(config.request_timeout_secs),
            &config.user_agent,
        )
    }

    /// Shared last-error slot.
    pub fn last_error(&self) -> &ErrorSlot {
        &self.last_error
    }

    /// Issue one call and return the parsed JSON body.
    ///
    /// `path` is split on `/` and each segment is percent-encoded, so callers
    /// may interpolate raw character names.
    pub async fn dispatch(&self, path: &str, options: RequestOptions) -> Result<Value> {
        self.last_error.clear();
        let result = self.execute(path, options).await;
        if let Err(err) = &result {
            self.record(err);
        }
        result
    }

    /// [`Dispatcher::dispatch`] followed by a typed decode of the body.
    pub async fn dispatch_as<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<T> {
        let value = self.dispatch(path, options).await?;
        serde_json::from_value(value).map_err(|err| {
            let err = ApiError::Parse(err);
            self.record(&err);
            err
        })
    }

    /// Fetch full records for `ids` from a public bulk endpoint.
    ///
    /// Ids are deduplicated before the call; an empty set returns without
    /// touching the network.
    pub async fn bulk_get<T>(&self, endpoint: &str, ids: &[u32]) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Identified,
    {
        let unique = unique_ids(ids.iter().copied());
        if unique.is_empty() {
            debug!(endpoint, "bulk lookup skipped, no ids");
            return Ok(Vec::new());
        }

        let joined = unique
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        debug!(endpoint, count = unique.len(), "bulk lookup");
        self.dispatch_as(endpoint, RequestOptions::public().with_query("ids", joined))
            .await
    }

    async fn execute(&self, path: &str, options: RequestOptions) -> Result<Value> {
        let RequestOptions {
            method,
            mut query,
            body,
            auth,
            secret,
        } = options;

        let secret = match (auth, secret.as_deref().map(str::trim)) {
            (false, _) => None,
            (true, Some(secret)) if !secret.is_empty() => Some(secret.to_string()),
            (true, _) => {
                warn!(path, "authenticated request without an API key");
                return Err(ApiError::CredentialMissing);
            }
        };

        if secret.is_some() {
            query.push((CACHE_DEFEAT_PARAM.to_string(), self.next_stamp().to_string()));
        }
        let url = self.build_url(path, &query)?;

        let key_hash = secret.as_deref().map(auth_hash);
        debug!(
            %method,
            path,
            auth,
            key_hash = key_hash.as_deref().unwrap_or("-"),
            "dispatching request"
        );

        let mut request = self
            .client
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        if let Some(secret) = &secret {
            request = request
                .bearer_auth(secret)
                .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
                .header(header::PRAGMA, "no-cache")
                .header(header::EXPIRES, "0");
        }
        if let Some(body) = &body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(ApiError::Network)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let body = if text.is_empty() {
                status.canonical_reason().unwrap_or_default().to_string()
            } else {
                text
            };
            return Err(ApiError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await.map_err(ApiError::Network)?;
        serde_json::from_slice(&bytes).map_err(ApiError::Parse)
    }

    fn build_url(&self, path: &str, query: &[(String, String)]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(path.split('/').filter(|segment| !segment.is_empty()));

        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Strictly increasing millisecond stamp, so no two authenticated
    /// requests from this process share a URL.
    fn next_stamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let previous = self
            .last_stamp
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }

    fn record(&self, err: &ApiError) {
        if err.is_dispatch_failure() {
            warn!(error = %err, "request failed");
            self.last_error.set(err.to_string());
        }
    }
}

/// Deduplicate ids while keeping first-seen order.
pub fn unique_ids(ids: impl IntoIterator<Item = u32>) -> Vec<u32> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}
