//! cellwatchd - the cellwatch daemon.
//!
//! Runs one topology watcher per configured scope against a shared
//! endpoint registry, and offers a few operator commands for editing the
//! local topology store.
//!
//! # Usage
//!
//! ```text
//! cellwatchd init --config cellwatch.toml --topo /var/lib/cellwatch/topo.redb --cell aa
//! cellwatchd add-tablet --topo topo.redb --cell aa --uid 1 --host db-1 --port vt=15100
//! cellwatchd run --config cellwatch.toml --log-format json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cellwatch_core::{CellwatchConfig, NodeAlias, NodeRecord, Uid};
use cellwatch_discovery::TopologyWatcher;
use cellwatch_health::{EndpointRegistry, HealthCheck};
use cellwatch_topo::{FileTopo, TopoServer, TopoStore};

const DEFAULT_LOG_FILTER: &str = "info,cellwatch=debug";

/// How long an edit command waits for a running daemon to release the store.
const EDIT_LOCK_ATTEMPTS: u32 = 40;
const EDIT_LOCK_RETRY_DELAY: Duration = Duration::from_millis(25);

#[derive(Parser)]
#[command(name = "cellwatchd", about = "cellwatch topology watcher daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the configured watchers until interrupted.
    Run {
        /// Path to cellwatch.toml.
        #[arg(long, default_value = "cellwatch.toml")]
        config: PathBuf,
    },

    /// Write a starter cellwatch.toml watching a single cell.
    Init {
        #[arg(long, default_value = "cellwatch.toml")]
        config: PathBuf,

        /// Topology store the config should point at.
        #[arg(long)]
        topo: PathBuf,

        #[arg(long)]
        cell: String,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Register or update a node record.
    AddTablet {
        #[arg(long)]
        topo: PathBuf,

        #[arg(long)]
        cell: String,

        #[arg(long)]
        uid: Uid,

        #[arg(long)]
        host: String,

        /// Named port, as `name=port`. Repeatable.
        #[arg(long = "port", value_parser = parse_port)]
        ports: Vec<(String, u16)>,

        /// Also add the node to this keyspace's replication graph.
        #[arg(long, requires = "shard")]
        keyspace: Option<String>,

        #[arg(long, requires = "keyspace", allow_hyphen_values = true)]
        shard: Option<String>,
    },

    /// Delete a node record.
    RemoveTablet {
        #[arg(long)]
        topo: PathBuf,

        #[arg(long)]
        cell: String,

        #[arg(long)]
        uid: Uid,

        /// Also remove the node from this keyspace's replication graph.
        #[arg(long, requires = "shard")]
        keyspace: Option<String>,

        #[arg(long, requires = "keyspace", allow_hyphen_values = true)]
        shard: Option<String>,
    },

    /// Print the node records of a cell.
    ListTablets {
        #[arg(long)]
        topo: PathBuf,

        #[arg(long)]
        cell: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config } => run(&config).await,
        Command::Init {
            config,
            topo,
            cell,
            force,
        } => init_config(&config, &topo, &cell, force),
        Command::AddTablet {
            topo,
            cell,
            uid,
            host,
            ports,
            keyspace,
            shard,
        } => {
            let record = ports
                .into_iter()
                .fold(NodeRecord::new(NodeAlias::new(cell, uid), host), |r, (name, port)| {
                    r.with_port(name, port)
                });
            add_tablet(&topo, record, keyspace.zip(shard))
        }
        Command::RemoveTablet {
            topo,
            cell,
            uid,
            keyspace,
            shard,
        } => remove_tablet(&topo, &NodeAlias::new(cell, uid), keyspace.zip(shard)),
        Command::ListTablets { topo, cell } => list_tablets(&topo, &cell),
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

async fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = CellwatchConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let settings = config.watcher_settings()?;
    if settings.is_empty() {
        bail!("{} configures no watchers", config_path.display());
    }

    info!(config = %config_path.display(), watchers = settings.len(), "cellwatch daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    if let Some(parent) = config.topology.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // The store is opened per call so edit commands can run alongside.
    let topo: Arc<dyn TopoServer> = Arc::new(FileTopo::create(&config.topology.path)?);
    info!(path = ?config.topology.path, "topology store ready");

    let registry = EndpointRegistry::new();
    let health: Arc<dyn HealthCheck> = Arc::new(registry.clone());

    let mut watchers = Vec::with_capacity(settings.len());
    for s in &settings {
        let watcher = TopologyWatcher::from_settings(Arc::clone(&topo), Arc::clone(&health), s)?;
        watcher.start().await?;
        watchers.push(watcher);
    }

    // ── Shutdown signal ────────────────────────────────────────

    tokio::signal::ctrl_c()
        .await
        .context("failed to install CTRL+C handler")?;
    info!("shutdown signal received");

    for watcher in &watchers {
        watcher.stop().await;
        let stats = watcher.stats();
        info!(
            scope = %watcher.scope(),
            cycles = stats.cycles,
            resolve_errors = stats.resolve_errors,
            fetch_errors = stats.fetch_errors,
            adds = stats.adds,
            removes = stats.removes,
            replaces = stats.replaces,
            "watcher summary"
        );
    }

    info!(endpoints = registry.len(), "cellwatch daemon stopped");
    Ok(())
}

fn init_config(path: &Path, topo: &Path, cell: &str, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let config = CellwatchConfig::scaffold(topo, cell);
    // Validate before writing so a bad cell name never lands on disk.
    config.watcher_settings()?;
    std::fs::write(path, config.to_toml_string()?)?;
    info!(path = %path.display(), %cell, "config written");
    Ok(())
}

fn open_for_edit(topo: &Path) -> anyhow::Result<TopoStore> {
    TopoStore::open_with_retry(topo, EDIT_LOCK_ATTEMPTS, EDIT_LOCK_RETRY_DELAY)
        .with_context(|| format!("opening {}", topo.display()))
}

fn add_tablet(
    topo: &Path,
    record: NodeRecord,
    shard: Option<(String, String)>,
) -> anyhow::Result<()> {
    let store = open_for_edit(topo)?;
    store.put_node_record(&record)?;
    info!(alias = %record.alias, host = %record.hostname, "node record stored");

    if let Some((keyspace, shard)) = shard {
        let added = store.add_shard_replication_node(&keyspace, &shard, &record.alias)?;
        if added {
            info!(alias = %record.alias, %keyspace, %shard, "added to replication graph");
        }
    }
    Ok(())
}

fn remove_tablet(
    topo: &Path,
    alias: &NodeAlias,
    shard: Option<(String, String)>,
) -> anyhow::Result<()> {
    let store = open_for_edit(topo)?;
    if store.delete_node_record(alias)? {
        info!(%alias, "node record deleted");
    } else {
        warn!(%alias, "no such node record");
    }

    if let Some((keyspace, shard)) = shard {
        if store.remove_shard_replication_node(&keyspace, &shard, alias)? {
            info!(%alias, %keyspace, %shard, "removed from replication graph");
        }
    }
    Ok(())
}

fn list_tablets(topo: &Path, cell: &str) -> anyhow::Result<()> {
    let store = open_for_edit(topo)?;
    for record in store.list_node_records(cell)? {
        let ports: Vec<String> = record
            .port_map
            .iter()
            .map(|(name, port)| format!("{name}={port}"))
            .collect();
        println!("{}\t{}\t{}", record.alias, record.hostname, ports.join(","));
    }
    Ok(())
}

fn parse_port(s: &str) -> Result<(String, u16), String> {
    let (name, port) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=port, got '{s}'"))?;
    if name.is_empty() {
        return Err(format!("port name missing in '{s}'"));
    }
    let port = port
        .parse::<u16>()
        .map_err(|e| format!("invalid port in '{s}': {e}"))?;
    Ok((name.to_string(), port))
}
