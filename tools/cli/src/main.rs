//! FieldSync CLI - Command line interface for the offline sync core.
//!
//! Inspects and drives the pending-action queue and entity cache stored in a
//! local data directory, and runs sync passes against an HTTP entity API.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use fieldsync_storage::{KeyValueStore, StoreConfig};
use fieldsync_sync::{
    ActionKind, HttpActionExecutor, NetworkMonitor, NetworkState, Payload, RemoteConfig,
    RemoteDispatcher, RemoteEntityService, SyncConfig, SyncContext, SyncMode, SyncOutcome,
};

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "FieldSync - Offline-first sync queue and cache")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Store backend.
    #[arg(long, value_enum)]
    store: Option<StoreBackend>,

    /// Directory holding the store (default: platform data dir).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
enum StoreBackend {
    Local,
    Sqlite,
    Memory,
}

impl StoreBackend {
    fn config(self, data_dir: &Path) -> StoreConfig {
        match self {
            StoreBackend::Local => StoreConfig::Local {
                root: data_dir.join("store"),
            },
            StoreBackend::Sqlite => StoreConfig::Sqlite {
                path: data_dir.join("fieldsync.db"),
            },
            StoreBackend::Memory => StoreConfig::Memory,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Queue an action for remote execution.
    Enqueue {
        /// Action kind, e.g. "create-entity" or "UpdateEntity".
        #[arg(short, long)]
        kind: String,

        /// JSON object payload.
        #[arg(short, long, default_value = "{}")]
        payload: String,
    },

    /// List pending actions.
    Pending,

    /// Remove a pending action.
    Remove {
        /// Action id.
        #[arg(short, long)]
        id: String,
    },

    /// Remove every pending action.
    Clear,

    /// Replace the cached collection for an entity kind.
    CachePut {
        /// Entity kind.
        #[arg(short, long)]
        kind: String,

        /// File containing a JSON array of items.
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show the cached collection for an entity kind.
    CacheGet {
        /// Entity kind.
        #[arg(short, long)]
        kind: String,
    },

    /// Show sync status.
    Status {
        /// Report the device as offline.
        #[arg(long)]
        offline: bool,
    },

    /// Run a sync pass against an HTTP entity API.
    Sync {
        /// Base URL of the entity API (overrides the config file).
        #[arg(short, long)]
        endpoint: Option<String>,

        /// Bearer token sent with every request.
        #[arg(long)]
        token: Option<String>,

        /// Pretend the device is offline.
        #[arg(long)]
        offline: bool,
    },
}

/// Contents of the `--config` file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CliConfig {
    store: Option<StoreBackend>,
    data_dir: Option<PathBuf>,
    sync: SyncConfig,
    remote: Option<RemoteConfig>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => CliConfig::default(),
    };
    let store = open_store(&cli, &config)?;

    match cli.command {
        Commands::Enqueue { kind, payload } => cmd_enqueue(store, config, &kind, &payload).await,

        Commands::Pending => cmd_pending(store, config).await,

        Commands::Remove { id } => cmd_remove(store, config, &id).await,

        Commands::Clear => cmd_clear(store, config).await,

        Commands::CachePut { kind, file } => cmd_cache_put(store, config, &kind, &file).await,

        Commands::CacheGet { kind } => cmd_cache_get(store, config, &kind).await,

        Commands::Status { offline } => cmd_status(store, config, offline).await,

        Commands::Sync {
            endpoint,
            token,
            offline,
        } => cmd_sync(store, config, endpoint, token, offline).await,
    }
}

fn load_config(path: &Path) -> Result<CliConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: CliConfig = serde_json::from_str(&content)
        .with_context(|| format!("Invalid config {}", path.display()))?;
    config.sync.validate().context("Invalid sync configuration")?;
    Ok(config)
}

/// Resolve the store backend from flags, then config, then defaults.
fn store_config(cli: &Cli, config: &CliConfig) -> Result<StoreConfig> {
    let backend = cli.store.or(config.store).unwrap_or(StoreBackend::Local);
    let data_dir = match cli.data_dir.clone().or_else(|| config.data_dir.clone()) {
        Some(dir) => dir,
        None => dirs::data_local_dir()
            .context("No platform data directory; pass --data-dir")?
            .join("fieldsync"),
    };

    info!("Using {:?} store in {}", backend, data_dir.display());
    Ok(backend.config(&data_dir))
}

fn open_store(cli: &Cli, config: &CliConfig) -> Result<Arc<dyn KeyValueStore>> {
    store_config(cli, config)?
        .open()
        .context("Failed to open store")
}

/// Build a context for one command. No background scheduling or status pushes.
fn open_context(
    store: Arc<dyn KeyValueStore>,
    config: &CliConfig,
    remote: Arc<dyn RemoteEntityService>,
    online: bool,
) -> Result<SyncContext> {
    let state = if online {
        NetworkState::online(None)
    } else {
        NetworkState::offline()
    };
    let sync_config = SyncConfig {
        status_refresh: false,
        sync_mode: SyncMode::Manual,
        ..config.sync.clone()
    };

    SyncContext::new(store, remote, Arc::new(NetworkMonitor::new(state)), sync_config)
        .context("Failed to start sync core")
}

fn offline_context(store: Arc<dyn KeyValueStore>, config: &CliConfig) -> Result<SyncContext> {
    open_context(store, config, Arc::new(RemoteDispatcher::new()), false)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Queue an action.
async fn cmd_enqueue(
    store: Arc<dyn KeyValueStore>,
    config: CliConfig,
    kind: &str,
    payload: &str,
) -> Result<()> {
    let kind: ActionKind = kind.parse().context("Invalid action kind")?;
    let payload: Payload =
        serde_json::from_str(payload).context("Payload must be a JSON object")?;

    let ctx = offline_context(store, &config)?;
    let action = ctx
        .enqueue_action(kind, payload)
        .await
        .context("Failed to enqueue action")?;

    println!("Action queued: {}", action.id);
    Ok(())
}

/// List pending actions.
async fn cmd_pending(store: Arc<dyn KeyValueStore>, config: CliConfig) -> Result<()> {
    let ctx = offline_context(store, &config)?;
    let actions = ctx
        .get_pending_actions()
        .await
        .context("Failed to read queue")?;

    if actions.is_empty() {
        println!("No pending actions.");
        return Ok(());
    }

    for action in actions {
        println!(
            "{}  {:<16} retries={}  queued {}",
            action.id,
            action.kind,
            action.retry_count,
            action.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

/// Remove one pending action.
async fn cmd_remove(store: Arc<dyn KeyValueStore>, config: CliConfig, id: &str) -> Result<()> {
    let ctx = offline_context(store, &config)?;
    if ctx
        .remove_pending_action(id)
        .await
        .context("Failed to update queue")?
    {
        println!("Removed {}", id);
    } else {
        anyhow::bail!("No pending action with id {}", id);
    }
    Ok(())
}

/// Clear the queue.
async fn cmd_clear(store: Arc<dyn KeyValueStore>, config: CliConfig) -> Result<()> {
    let ctx = offline_context(store, &config)?;
    let cleared = ctx
        .clear_pending_actions()
        .await
        .context("Failed to clear queue")?;
    println!("Removed {} pending actions", cleared);
    Ok(())
}

/// Replace a cached collection from a JSON file.
async fn cmd_cache_put(
    store: Arc<dyn KeyValueStore>,
    config: CliConfig,
    kind: &str,
    file: &Path,
) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let items: Vec<serde_json::Value> =
        serde_json::from_str(&content).context("File must contain a JSON array")?;

    let ctx = offline_context(store, &config)?;
    let stamped = ctx
        .cache_entities(kind, &items)
        .await
        .context("Failed to write cache")?;

    println!("Cached {} {} at {}", items.len(), kind, stamped.to_rfc3339());
    Ok(())
}

/// Print a cached collection.
async fn cmd_cache_get(
    store: Arc<dyn KeyValueStore>,
    config: CliConfig,
    kind: &str,
) -> Result<()> {
    let ctx = offline_context(store, &config)?;
    match ctx.cache().get_snapshot::<serde_json::Value>(kind).await {
        Some(snapshot) => print_json(&snapshot),
        None => {
            println!("Nothing cached for {}", kind);
            Ok(())
        }
    }
}

/// Print the current status.
async fn cmd_status(
    store: Arc<dyn KeyValueStore>,
    config: CliConfig,
    offline: bool,
) -> Result<()> {
    let ctx = open_context(store, &config, Arc::new(RemoteDispatcher::new()), !offline)?;
    let status = ctx.get_status().await.context("Failed to read status")?;
    print_json(&status)?;

    let kinds = ctx.cache().cached_kinds().await;
    if !kinds.is_empty() {
        println!("Cached kinds: {}", kinds.join(", "));
    }
    Ok(())
}

/// Run one sync pass.
async fn cmd_sync(
    store: Arc<dyn KeyValueStore>,
    config: CliConfig,
    endpoint: Option<String>,
    token: Option<String>,
    offline: bool,
) -> Result<()> {
    let mut remote_config = match (endpoint, config.remote.clone()) {
        (Some(url), Some(base)) => RemoteConfig {
            base_url: url,
            ..base
        },
        (Some(url), None) => RemoteConfig::new(url),
        (None, Some(base)) => base,
        (None, None) => anyhow::bail!("No endpoint configured; pass --endpoint"),
    };
    if token.is_some() {
        remote_config.bearer_token = token;
    }

    let executor = Arc::new(HttpActionExecutor::new(remote_config).context("Invalid remote")?);
    let mut dispatcher = RemoteDispatcher::new();
    dispatcher.register_all(executor)?;

    let ctx = open_context(store, &config, Arc::new(dispatcher), !offline)?;
    let outcome = ctx.trigger_sync().await.context("Sync failed")?;
    ctx.shutdown().await;

    match outcome {
        SyncOutcome::Completed(report) => {
            println!(
                "Sync completed in {:?}: {} succeeded, {} retried, {} dropped",
                report.duration,
                report.succeeded,
                report.retried,
                report.dropped.len()
            );
            for dropped in &report.dropped {
                println!(
                    "  dropped {} ({}) after {} attempts: {}",
                    dropped.action.id, dropped.action.kind, dropped.attempts, dropped.last_error
                );
            }
        }
        SyncOutcome::AlreadySyncing => println!("A sync is already running."),
        SyncOutcome::Offline => println!("Offline; nothing was sent."),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_enqueue() {
        let cli = Cli::try_parse_from([
            "fieldsync",
            "--store",
            "sqlite",
            "enqueue",
            "--kind",
            "update-entity",
            "--payload",
            r#"{"id": 7}"#,
        ])
        .unwrap();

        assert_eq!(cli.store, Some(StoreBackend::Sqlite));
        assert!(matches!(cli.command, Commands::Enqueue { .. }));
    }

    #[test]
    fn test_store_config_prefers_flags() {
        let cli = Cli::try_parse_from([
            "fieldsync",
            "--store",
            "sqlite",
            "--data-dir",
            "/srv/fieldsync",
            "pending",
        ])
        .unwrap();
        let config = CliConfig {
            store: Some(StoreBackend::Memory),
            data_dir: Some(PathBuf::from("/elsewhere")),
            ..Default::default()
        };

        assert_eq!(
            store_config(&cli, &config).unwrap(),
            StoreConfig::Sqlite {
                path: PathBuf::from("/srv/fieldsync/fieldsync.db")
            }
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_data_dir_opens() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp = tempfile::TempDir::new().unwrap();
        let data_dir = temp.path().join(OsStr::from_bytes(b"data\xfe"));
        let cli = Cli::try_parse_from(["fieldsync", "--store", "sqlite", "pending"]).unwrap();
        let config = CliConfig {
            data_dir: Some(data_dir.clone()),
            ..Default::default()
        };

        let store = open_store(&cli, &config).unwrap();
        assert_eq!(store.name(), "sqlite");
        assert!(data_dir.join("fieldsync.db").exists());
    }

    #[test]
    fn test_config_file_defaults() {
        let config: CliConfig =
            serde_json::from_str(r#"{"store": "memory", "remote": {"base_url": "http://x"}}"#)
                .unwrap();
        assert_eq!(config.store, Some(StoreBackend::Memory));
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.remote.unwrap().timeout_secs, 30);
    }
}
