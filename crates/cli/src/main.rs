use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, TimeZone};
use clap::{Parser, Subcommand, ValueEnum};
use hangar_sync::{
    FieldEvent, FieldEventKind, FieldId, FileStore, GridSurface, HangarClient, HttpGateway,
    LocalStore, MemoryStore, NotificationLevel, PersistenceGateway, PushOutcome, SyncConfig,
    SyncRole, Timestamp, UiEvent,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hangar-cli")]
#[command(about = "Hangar planner sync client - headless operations against the shared snapshot")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON client configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Endpoint URL, overrides the configuration file
    #[arg(short, long, global = true)]
    endpoint: Option<String>,

    /// Directory for the local cache (in memory when omitted)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the stored snapshot timestamp
    Timestamp,

    /// Download the stored snapshot
    Pull {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Poll once in the given role and print the client status
    Status {
        #[arg(long, value_enum, default_value_t = RoleArg::Sync)]
        role: RoleArg,
    },

    /// Follow the snapshot read-only and report every applied change
    Follow,

    /// Write one field as master, e.g. `set-field aircraft-3 D-ABCD`
    SetField {
        /// Field id `{field-kind}-{cellId}`
        field: String,

        value: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoleArg {
    Standalone,
    Sync,
    Master,
}

impl From<RoleArg> for SyncRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Standalone => SyncRole::Standalone,
            RoleArg::Sync => SyncRole::Sync,
            RoleArg::Master => SyncRole::Master,
        }
    }
}

#[derive(Serialize)]
struct TimestampReport {
    timestamp: Timestamp,
    local_time: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "hangar_sync=debug,hangar_cli=debug"
    } else {
        "hangar_sync=info,hangar_cli=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = load_config(cli.config.as_ref(), cli.endpoint.clone())?;

    match cli.command {
        Commands::Timestamp => timestamp_command(&config).await,
        Commands::Pull { output } => pull_command(&config, output).await,
        Commands::Status { role } => status_command(config, cli.cache_dir, role.into()).await,
        Commands::Follow => follow_command(config, cli.cache_dir).await,
        Commands::SetField { field, value } => {
            set_field_command(config, cli.cache_dir, &field, &value).await
        }
    }
}

fn load_config(path: Option<&PathBuf>, endpoint: Option<String>) -> Result<SyncConfig> {
    let mut config = match path {
        Some(path) => SyncConfig::from_json_file(path)?,
        None => SyncConfig::default(),
    };
    if let Some(endpoint) = endpoint {
        config.endpoint = endpoint;
    }
    config.validate()?;
    Ok(config)
}

fn local_time(timestamp: Timestamp) -> Option<String> {
    if timestamp == Timestamp::ZERO {
        return None;
    }
    let time: DateTime<Local> = Local.timestamp_millis_opt(timestamp.as_millis()).single()?;
    Some(time.format("%d.%m.%Y %H:%M:%S").to_string())
}

async fn open_client(config: SyncConfig, cache_dir: Option<PathBuf>) -> Result<HangarClient> {
    let store: Arc<dyn LocalStore> = match cache_dir {
        Some(dir) => Arc::new(FileStore::open(&dir).await?),
        None => Arc::new(MemoryStore::new()),
    };
    // Render every slot the planner can address.
    let surface = Arc::new(GridSurface::with_tiles(100, 100));
    Ok(HangarClient::connect(config, surface, store)?)
}

async fn timestamp_command(config: &SyncConfig) -> Result<()> {
    let gateway = HttpGateway::new(config)?;
    let timestamp = gateway.timestamp().await?;
    let report = TimestampReport {
        timestamp,
        local_time: local_time(timestamp),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn pull_command(config: &SyncConfig, output: Option<PathBuf>) -> Result<()> {
    let gateway = HttpGateway::new(config)?;
    let Some(snapshot) = gateway.load().await? else {
        bail!("no snapshot stored at {}", config.endpoint);
    };
    info!(
        "Snapshot {} with {} tiles",
        snapshot.timestamp(),
        snapshot.tiles.len()
    );

    let json = serde_json::to_string_pretty(&snapshot)?;
    match output {
        Some(path) => {
            tokio::fs::write(&path, json)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Saved to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

async fn status_command(
    config: SyncConfig,
    cache_dir: Option<PathBuf>,
    role: SyncRole,
) -> Result<()> {
    let client = open_client(config, cache_dir).await?;
    client
        .update_sync_mode(role.can_read(), role.can_write())
        .await;
    println!("{}", serde_json::to_string_pretty(&client.status())?);
    Ok(())
}

async fn follow_command(config: SyncConfig, cache_dir: Option<PathBuf>) -> Result<()> {
    let client = open_client(config, cache_dir).await?;
    let mut events = client.subscribe();
    client.update_sync_mode(true, false).await;
    info!("Following; press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(UiEvent::ServerDataApplied { timestamp, fields_written }) => {
                    println!(
                        "{}  {} fields updated",
                        local_time(timestamp).unwrap_or_else(|| timestamp.to_string()),
                        fields_written
                    );
                }
                Ok(UiEvent::Notification(notice)) => match notice.level {
                    NotificationLevel::Warning | NotificationLevel::Error => {
                        warn!("{}", notice.message)
                    }
                    _ => info!("{}", notice.message),
                },
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => warn!("missed {} events", missed),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.update_sync_mode(false, false).await;
    Ok(())
}

/// Timestamp of the save that carried an edit, whichever push performed it.
fn saved_at(outcome: PushOutcome, before: Timestamp, latest: Timestamp) -> Option<Timestamp> {
    match outcome {
        PushOutcome::Saved(timestamp) => Some(timestamp),
        _ if latest > before => Some(latest),
        _ => None,
    }
}

async fn set_field_command(
    config: SyncConfig,
    cache_dir: Option<PathBuf>,
    field: &str,
    value: &str,
) -> Result<()> {
    let field: FieldId = field.parse()?;
    let settle = config.commit_debounce() + Duration::from_millis(50);
    let client = open_client(config, cache_dir).await?;

    // Entering master pulls the current snapshot first.
    client.update_sync_mode(true, true).await;
    let before = client.status().last_applied;
    client.handle_event(FieldEvent::new(field.to_string(), value, FieldEventKind::Change));

    while client.status().pending_commits > 0 || client.controller().pending_push() {
        tokio::time::sleep(settle).await;
    }
    // The debounced push may already be in flight or done.
    let outcome = loop {
        match client.controller().push_now().await? {
            PushOutcome::Skipped => tokio::time::sleep(settle).await,
            outcome => break outcome,
        }
    };
    match saved_at(outcome, before, client.status().last_applied) {
        Some(timestamp) => info!("Saved {} = {:?} at {}", field, value, timestamp),
        None => info!("{} is in sync with the server", field),
    }

    client.update_sync_mode(false, false).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_is_parsed_by_clap() {
        let cli = Cli::try_parse_from(["hangar-cli", "status", "--role", "master"]).unwrap();
        match cli.command {
            Commands::Status { role } => assert_eq!(SyncRole::from(role), SyncRole::Master),
            _ => panic!("expected status"),
        }

        let cli = Cli::try_parse_from(["hangar-cli", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { role: RoleArg::Sync }));

        assert!(Cli::try_parse_from(["hangar-cli", "status", "--role", "leader"]).is_err());
    }

    #[test]
    fn test_save_by_debounced_push_is_reported() {
        let before = Timestamp(100);
        assert_eq!(
            saved_at(PushOutcome::Saved(Timestamp(150)), before, Timestamp(150)),
            Some(Timestamp(150))
        );
        assert_eq!(
            saved_at(PushOutcome::Unchanged, before, Timestamp(140)),
            Some(Timestamp(140))
        );
        assert_eq!(saved_at(PushOutcome::Unchanged, before, before), None);
    }
}
