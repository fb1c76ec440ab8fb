//! Application configuration.
//!
//! Values are layered: built-in defaults, then `config.toml` in the user
//! config directory, then `GW2DASH_*` environment variables.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Directory name used under the platform config/data roots.
pub const APP_DIR: &str = "gw2dash";
/// Default public API root.
pub const DEFAULT_API_BASE_URL: &str = "https://api.guildwars2.com/v2";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const ENV_PREFIX: &str = "GW2DASH";

const DEFAULT_CONFIG: &str = r#"# gw2dash configuration
#
# Every value may also be set through the environment, e.g.
# GW2DASH_API_BASE_URL or GW2DASH_REQUEST_TIMEOUT_SECS.

# Root of the public API.
api_base_url = "https://api.guildwars2.com/v2"

# Per-request timeout in seconds.
request_timeout_secs = 30

# Directory holding saved API keys and logs. Defaults to the platform data dir.
# state_dir = "/home/me/.local/share/gw2dash"
"#;

/// Runtime configuration for the engine and its frontends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Root URL every endpoint path is appended to.
    pub api_base_url: String,
    /// Per-request timeout.
    pub request_timeout_secs: u64,
    /// `User-Agent` header sent with every request.
    pub user_agent: String,
    /// Directory for durable state and log files.
    pub state_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            user_agent: default_user_agent(),
            state_dir: default_state_dir(),
        }
    }
}

impl AppConfig {
    /// Load from the default config file location plus the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    /// Load using `path` as the optional config file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let defaults = Self::default();
        let config = Config::builder()
            .set_default("api_base_url", defaults.api_base_url)?
            .set_default("request_timeout_secs", defaults.request_timeout_secs)?
            .set_default("user_agent", defaults.user_agent)?
            .set_default(
                "state_dir",
                defaults.state_dir.to_string_lossy().into_owned(),
            )?
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()
            .with_context(|| format!("failed to read configuration from {}", path.display()))?;

        let app_config: Self = config
            .try_deserialize()
            .context("invalid configuration values")?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.api_base_url)
            .with_context(|| format!("api_base_url is not a valid URL: {}", self.api_base_url))?;
        if url.cannot_be_a_base() {
            bail!("api_base_url cannot be used as a base: {}", self.api_base_url);
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    /// Directory holding persisted records.
    pub fn records_dir(&self) -> PathBuf {
        self.state_dir.join("state")
    }

    /// Directory holding log files.
    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }
}

/// Location of the user config file.
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("config.toml")
}

/// Write a commented default config file if none exists yet.
pub fn ensure_default_config() -> Result<()> {
    ensure_default_config_at(&config_path())
}

/// [`ensure_default_config`] for an explicit path.
pub fn ensure_default_config_at(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {}", parent.display()))?;
    }
    fs::write(path, DEFAULT_CONFIG)
        .with_context(|| format!("failed to write default config {}", path.display()))
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn default_user_agent() -> String {
    format!("{APP_DIR}/{}", env!("CARGO_PKG_VERSION"))
}
