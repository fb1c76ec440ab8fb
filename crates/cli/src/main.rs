mod render;

use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gw2dash_core::{
    config::{self, AppConfig},
    storage::StateStore,
    AddResult, FileStateStore, Gw2Client, MemoryStateStore, RequestOptions,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "gw2dash")]
#[command(about = "Guild Wars 2 account, build and equipment dashboard")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "GW2DASH_CONFIG")]
    config: Option<PathBuf>,

    /// Keep keys in memory only
    #[arg(long)]
    ephemeral: bool,

    /// API key added before the command runs
    #[arg(long, env = "GW2DASH_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store an API key and fetch its account
    AddKey {
        /// The key as issued by the account page
        secret: String,
    },
    /// Delete a stored key by id or fingerprint
    RemoveKey {
        key: String,
    },
    /// List stored keys with cached account data
    List,
    /// Select a character, and optionally the key that owns it
    Select {
        character: Option<String>,
        #[arg(long)]
        key: Option<String>,
    },
    /// Refresh one key, or all keys when none is given
    Refresh {
        key: Option<String>,
    },
    /// Resolve a character's active build
    Build {
        character: Option<String>,
    },
    /// Resolve a character's equipment
    Equipment {
        character: Option<String>,
    },
    /// Send a raw request and print the JSON response
    Request {
        path: String,
        /// Send without the selected key
        #[arg(long)]
        public: bool,
        /// Query pair, repeatable
        #[arg(short, long = "query", value_parser = parse_query_pair)]
        query: Vec<(String, String)>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(config::config_path);
    config::ensure_default_config_at(&config_path)?;
    let config = AppConfig::load_from(&config_path)?;
    init_logging(&config.log_dir(), &cli.log_level)?;
    debug!(config = %config_path.display(), "configuration loaded");

    let persistence: Arc<dyn StateStore> = if cli.ephemeral {
        Arc::new(MemoryStateStore::new())
    } else {
        Arc::new(FileStateStore::new(config.records_dir()))
    };
    let client = Gw2Client::new(&config, persistence)?;
    client.hydrate().await;

    if let Some(secret) = cli.api_key.as_deref() {
        settle(client.add_credential(secret).await).await;
    }

    let result = run(&client, cli.command).await;
    client.flush().await;
    result
}

async fn run(client: &Gw2Client, command: Command) -> Result<()> {
    match command {
        Command::AddKey { secret } => match client.add_credential(&secret).await {
            AddResult::Empty => bail!("API key is empty"),
            AddResult::Duplicate { id } => {
                println!("Key already stored ({id}); selected it.");
            }
            AddResult::Added { entry, refresh } => {
                println!("Added key {} ({})", entry.fingerprint, entry.id);
                refresh.await.context("refresh task failed")??;
                print!("{}", render::accounts(&client.snapshot()));
            }
        },
        Command::RemoveKey { key } => {
            let id = resolve_key(client, &key)?;
            let outcome = client.remove_credential(&id).await;
            if outcome.was_selected {
                println!("Removed selected key {id}.");
            } else {
                println!("Removed key {id}.");
            }
        }
        Command::List => print!("{}", render::accounts(&client.snapshot())),
        Command::Select { character, key } => {
            let id = key.map(|key| resolve_key(client, &key)).transpose()?;
            client
                .select_character(character.as_deref(), id.as_deref())
                .await;
            print!("{}", render::selection(&client.snapshot()));
        }
        Command::Refresh { key: Some(key) } => {
            let id = resolve_key(client, &key)?;
            let snapshot = client.refresh(&id).await?;
            println!(
                "{} ({} characters)",
                snapshot.account.name,
                snapshot.characters.len()
            );
        }
        Command::Refresh { key: None } => {
            let result = client.refresh_all().await;
            print!("{}", render::accounts(&client.snapshot()));
            result?;
        }
        Command::Build { character } => {
            let name = character_or_selected(client, character)?;
            let build = client
                .resolve_build(&name, &CancellationToken::new())
                .await?;
            print!("{}", render::build(&build));
        }
        Command::Equipment { character } => {
            let name = character_or_selected(client, character)?;
            let equipment = client
                .resolve_equipment(&name, &CancellationToken::new())
                .await?;
            print!("{}", render::equipment(&equipment));
        }
        Command::Request {
            path,
            public,
            query,
        } => {
            let options = if public {
                RequestOptions::public()
            } else {
                RequestOptions::authenticated(None)
            };
            let options = query
                .into_iter()
                .fold(options, |options, (key, value)| options.with_query(key, value));
            let value = client.request(&path, options).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }
    Ok(())
}

async fn settle(result: AddResult) {
    if let AddResult::Added { entry, refresh } = result {
        match refresh.await {
            Ok(Ok(_)) => info!(fp = %entry.fingerprint, "API key from environment ready"),
            Ok(Err(err)) => eprintln!("warning: refresh for {} failed: {err}", entry.fingerprint),
            Err(err) => eprintln!("warning: refresh task failed: {err}"),
        }
    }
}

/// Accept a key id or its fingerprint.
fn resolve_key(client: &Gw2Client, key: &str) -> Result<String> {
    let snapshot = client.snapshot();
    let mut matches = snapshot
        .credentials
        .iter()
        .filter(|entry| entry.id == key || entry.fingerprint.eq_ignore_ascii_case(key));
    match (matches.next(), matches.next()) {
        (Some(entry), None) => Ok(entry.id.clone()),
        (Some(_), Some(_)) => bail!("{key} matches more than one stored key; use the id"),
        (None, _) => bail!("no stored key matches {key}"),
    }
}

fn character_or_selected(client: &Gw2Client, character: Option<String>) -> Result<String> {
    match character {
        Some(name) => Ok(name),
        None => client
            .snapshot()
            .selection
            .selected_character
            .context("no character given and none selected"),
    }
}

fn parse_query_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw}"))
}

fn init_logging(log_dir: &Path, default_level: &str) -> Result<()> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let log_path = log_dir.join("gw2dash.log");
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open log file {}", log_path.display()))?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .compact()
        .with_writer(Mutex::new(log_file));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs_split_on_first_equals() {
        assert_eq!(
            parse_query_pair("ids=1,2"),
            Ok(("ids".to_string(), "1,2".to_string()))
        );
        assert_eq!(
            parse_query_pair("lang=en=x"),
            Ok(("lang".to_string(), "en=x".to_string()))
        );
        assert!(parse_query_pair("nope").is_err());
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["gw2dash", "--ephemeral", "build", "Sir Hero"])
            .expect("parse");
        assert!(cli.ephemeral);
        assert!(matches!(
            cli.command,
            Command::Build { character: Some(ref name) } if name == "Sir Hero"
        ));

        let cli = Cli::try_parse_from(["gw2dash", "request", "/items", "--public", "-q", "ids=1"])
            .expect("parse");
        match cli.command {
            Command::Request { path, public, query } => {
                assert_eq!(path, "/items");
                assert!(public);
                assert_eq!(query, vec![("ids".to_string(), "1".to_string())]);
            }
            _ => panic!("expected request"),
        }
    }
}
