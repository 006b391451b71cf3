use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, info_span};
use worm_tracker::cache::PositionCache;
use worm_tracker::config::Config;
use worm_tracker::metrics::PipelineMetrics;
use worm_tracker::onchain::fetcher::FetcherConfig;
use worm_tracker::onchain::{LogFetcher, RpcEventSource};
use worm_tracker::pipeline::{Coordinator, DryRunGenerator, FetchSupervisor};
use worm_tracker::server::{self, ServerState};
use worm_tracker::store::{SqliteStore, Store};

const CONFIG_PATH: &str = "worm-tracker.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = if Path::new(CONFIG_PATH).exists() {
        Config::load(Path::new(CONFIG_PATH))?
    } else {
        Config::from_env()?
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("worm-tracker v{} starting", env!("CARGO_PKG_VERSION"));

    // --- SQLite Store ---
    let sqlite = SqliteStore::open(&config.store.db_path)?;
    sqlite.initialize(config.store.clean_slate)?;
    let store: Arc<dyn Store> = Arc::new(sqlite);

    let metrics = Arc::new(PipelineMetrics::new());

    // --- Read Cache ---
    let cache = PositionCache::warm(
        store.clone(),
        &config.cache,
        metrics.clone(),
        info_span!("cache"),
    )
    .await;
    let cache_task = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.run().await })
    };

    // --- Pipeline ---
    let coordinator =
        Coordinator::seed(store.clone(), metrics.clone(), info_span!("coordinator")).await?;

    let (events_tx, events_rx) = mpsc::channel(config.chain.events_channel_capacity);
    let (checkpoints_tx, checkpoints_rx) = mpsc::channel(config.chain.checkpoints_channel_capacity);

    let producer = if config.dry_run.enabled {
        let generator = DryRunGenerator::new(
            config.dry_run.interval(),
            metrics.clone(),
            info_span!("dry_run"),
        );
        tokio::spawn(async move {
            // Nothing checkpoints in dry-run mode; keep the channel open.
            let _checkpoints_tx = checkpoints_tx;
            generator.run(events_tx).await
        })
    } else {
        let source = RpcEventSource::new(
            &config.chain.rpc_url,
            config.chain.contract()?,
            config.chain.request_timeout(),
        )?;
        info!(
            rpc = %config.chain.rpc_url,
            contract = %source.contract(),
            start_block = config.chain.start_block,
            batch_size = config.chain.batch_size,
            "chain source configured"
        );
        let fetcher = LogFetcher::new(
            Arc::new(source),
            FetcherConfig::from(&config.chain),
            metrics.clone(),
        );
        let supervisor = FetchSupervisor::new(
            fetcher,
            store.clone(),
            config.chain.restart_cooldown(),
            metrics.clone(),
            info_span!("fetcher"),
        );
        tokio::spawn(supervisor.run(events_tx, checkpoints_tx))
    };

    let coordinator_task = tokio::spawn(coordinator.run(events_rx, checkpoints_rx));

    // --- Read Server ---
    let state = ServerState::new(store.clone(), cache.clone(), metrics.clone(), &config.server);
    let bind_addr = config.server.bind_addr.clone();
    let server_task = tokio::spawn(async move { server::serve(state, &bind_addr).await });

    info!("pipeline running - press Ctrl+C to stop");

    let outcome = tokio::select! {
        res = coordinator_task => {
            error!(result = ?res, "coordinator stopped");
            Err(anyhow::anyhow!("coordinator stopped: {:?}", res))
        }
        res = producer => {
            error!(result = ?res, "event producer stopped");
            Err(anyhow::anyhow!("event producer stopped: {:?}", res))
        }
        res = server_task => {
            error!(result = ?res, "read server stopped");
            Err(anyhow::anyhow!("read server stopped: {:?}", res))
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    cache.close();
    let _ = cache_task.await;
    info!(metrics = ?metrics.snapshot(), "worm-tracker stopped");
    outcome
}
