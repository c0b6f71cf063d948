use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;
use url::Url;

use live_object_indexer::db::{DbPool, MemoryStore, Store};
use live_object_indexer::live_object::objects;
use live_object_indexer::live_object::{
    Capabilities, ContractCaller, ContractGroupRegistry, ContractRegistration, Event,
    EventsMessage, LifecycleManager, LiveObjectEngine, MetadataResolver, RegistryBuilder, Retrying,
    TracingReporter, UpsertEngine,
};
use live_object_indexer::rpc::{
    HttpMetadataResolver, RetryConfig, RpcClient, RpcClientConfig, RpcContractCaller,
};
use live_object_indexer::types::config::chain::build_chain_registry;
use live_object_indexer::types::config::indexer::IndexerConfig;

/// Events per batch handed to the engine.
const BATCH_SIZE: usize = 256;

struct Args {
    config: PathBuf,
    /// NDJSON event file, or `-` for stdin.
    events: String,
    dry_run: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        config: PathBuf::from("config/config.json"),
        events: "-".to_string(),
        dry_run: false,
    };

    let mut iter = env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                args.config = iter.next().context("--config requires a path")?.into();
            }
            "--events" => {
                args.events = iter.next().context("--events requires a path or '-'")?;
            }
            "--dry-run" => args.dry_run = true,
            other => anyhow::bail!(
                "Unknown argument '{}'. Usage: live-object-indexer [--config path] [--events path|-] [--dry-run]",
                other
            ),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;
    let config = IndexerConfig::load(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    tracing::info!("Loaded config with {} chain(s)", config.chains.len());

    if !args.dry_run {
        load_required_env_vars(&config)?;
    }

    let mut builder = RegistryBuilder::new(build_chain_registry(&config.chains))
        .with_chain_overrides(config.chain_overrides());
    objects::register_all(&mut builder).context("Failed to register live objects")?;
    let registry = Arc::new(builder.build().context("Invalid handler registry")?);

    let store: Arc<dyn Store> = if args.dry_run {
        tracing::info!("Dry run: records are kept in memory");
        Arc::new(MemoryStore::new())
    } else {
        let url = env::var(&config.runtime.database_url_env_var)
            .with_context(|| format!("{} is not set", config.runtime.database_url_env_var))?;
        let pool = DbPool::new(&url, config.runtime.database_pool_size)
            .await
            .context("Failed to connect to database")?;
        pool.run_migrations(config.runtime.migrations_dir.as_deref())
            .await
            .context("Failed to run migrations")?;
        Arc::new(pool)
    };

    let (registration_tx, registration_rx) = mpsc::channel(config.runtime.event_channel_capacity);
    let groups = ContractGroupRegistry::new()
        .with_store(store.clone())
        .with_notifier(registration_tx);
    for (group, per_chain) in &config.contract_groups {
        for (chain_id, addresses) in per_chain {
            groups.seed(group, chain_id, addresses.clone().into_vec());
        }
    }
    for group in registry.extended_groups() {
        groups.declare(group);
    }
    groups
        .load()
        .await
        .context("Failed to load contract group members")?;
    tokio::spawn(log_registrations(registration_rx));

    let capabilities = build_capabilities(&config)?;

    let lifecycle = LifecycleManager::new(
        registry,
        UpsertEngine::new(store),
        Arc::new(groups),
        capabilities,
        Arc::new(TracingReporter),
    );
    let engine = LiveObjectEngine::new(Arc::new(lifecycle), config.runtime.engine_config());

    let (events_tx, events_rx) = mpsc::channel(config.runtime.event_channel_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reader = {
        let source = args.events.clone();
        tokio::spawn(async move {
            if let Err(e) = read_events(&source, events_tx).await {
                tracing::error!("Event reader failed: {:#}", e);
            }
        })
    };

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let stats = engine.run(events_rx, shutdown_rx).await;
    reader.abort();

    tracing::info!(
        "Processed {} events: {} inserted, {} updated, {} stale, {} discarded, {} gated, {} failed, {} dropped, {} without handler",
        stats.events_received,
        stats.inserted,
        stats.updated,
        stats.stale,
        stats.discarded,
        stats.gated,
        stats.failed,
        stats.dropped,
        stats.dispatch_misses
    );
    Ok(())
}

/// Ensures the database URL env var is set, loading .env if needed.
fn load_required_env_vars(config: &IndexerConfig) -> anyhow::Result<()> {
    let var = config.runtime.database_url_env_var.as_str();
    if env::var(var).is_ok() {
        return Ok(());
    }

    dotenvy::dotenv()
        .with_context(|| format!("Missing env var {} and failed to load .env file", var))?;

    anyhow::ensure!(
        env::var(var).is_ok(),
        "Missing required env var after loading .env: {}",
        var
    );
    Ok(())
}

/// Contract reads are available on every chain whose RPC env var is set;
/// metadata lookups when a gateway is configured.
fn build_capabilities(config: &IndexerConfig) -> anyhow::Result<Capabilities> {
    let retry = RetryConfig::from(&config.runtime.retry);
    let mut capabilities = Capabilities::default();

    if let Some(caller) = build_contract_caller(config)? {
        capabilities = capabilities.with_contract_caller(Arc::new(Retrying::new(caller, retry.clone())));
    }

    match config
        .runtime
        .metadata
        .client_config()
        .context("Invalid metadata gateway URL")?
    {
        Some(metadata_config) => {
            tracing::info!("Metadata lookups enabled via {}", metadata_config.gateway);
            let resolver = HttpMetadataResolver::new(metadata_config)?;
            let resolver: Arc<dyn MetadataResolver> = Arc::new(resolver);
            capabilities = capabilities.with_metadata_resolver(Arc::new(Retrying::new(resolver, retry)));
        }
        None => tracing::info!("No metadata gateway configured, metadata lookups disabled"),
    }

    Ok(capabilities)
}

fn build_contract_caller(config: &IndexerConfig) -> anyhow::Result<Option<Arc<dyn ContractCaller>>> {
    let mut clients = HashMap::new();
    for chain in &config.chains {
        let Some(var) = &chain.rpc_url_env_var else {
            continue;
        };
        let Ok(raw) = env::var(var) else {
            tracing::warn!("{} is not set, contract reads disabled on chain {}", var, chain.name);
            continue;
        };
        let url: Url = raw
            .parse()
            .with_context(|| format!("Invalid RPC URL in {}", var))?;

        let mut client_config = RpcClientConfig::new(url);
        if let Some(rate_limit) = config.runtime.rpc.rate_limit() {
            client_config = client_config.with_rate_limit(rate_limit);
        }
        clients.insert(chain.chain_id.clone(), RpcClient::new(client_config));
        tracing::info!("Contract reads enabled on chain {} ({})", chain.name, chain.chain_id);
    }

    if clients.is_empty() {
        return Ok(None);
    }
    Ok(Some(Arc::new(RpcContractCaller::new(clients))))
}

async fn read_events(source: &str, events_tx: mpsc::Sender<EventsMessage>) -> anyhow::Result<()> {
    if source == "-" {
        tracing::info!("Reading events from stdin");
        forward_events(BufReader::new(tokio::io::stdin()), events_tx).await
    } else {
        tracing::info!("Reading events from {}", source);
        let file = tokio::fs::File::open(source)
            .await
            .with_context(|| format!("Failed to open {}", source))?;
        forward_events(BufReader::new(file), events_tx).await
    }
}

/// Parse NDJSON events and send them in batches. Malformed lines are skipped.
async fn forward_events<R>(reader: R, events_tx: mpsc::Sender<EventsMessage>) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut batch: Vec<Event> = Vec::with_capacity(BATCH_SIZE);
    let mut line_number = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(line) {
            Ok(event) => batch.push(event),
            Err(e) => {
                tracing::warn!("Skipping malformed event on line {}: {}", line_number, e);
                continue;
            }
        }

        if batch.len() >= BATCH_SIZE {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(BATCH_SIZE));
            if events_tx.send(EventsMessage::new(full)).await.is_err() {
                return Ok(());
            }
        }
    }

    if !batch.is_empty() {
        let _ = events_tx.send(EventsMessage::new(batch)).await;
    }
    tracing::info!("Event input exhausted after {} lines", line_number);
    Ok(())
}

async fn log_registrations(mut registration_rx: mpsc::Receiver<ContractRegistration>) {
    while let Some(registration) = registration_rx.recv().await {
        tracing::info!(
            "Contract group {} on chain {} gained {} at block {}",
            registration.group,
            registration.chain_id,
            registration.address,
            registration.block_number
        );
    }
}
