//! Protection loop command
//!
//! - Reads JSON price ticks from stdin on a separate ingestion task
//! - Runs the evaluation cycle against a paper book on a fixed interval
//! - Reloads the config file when it changes
//! - Shuts down on Ctrl+C, giving pending state saves a bounded wait

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{error, info, warn};

use crypto_guard::alerts::{AlertDispatcher, AlertWorker};
use crypto_guard::config::{ConfigWatcher, GuardConfig};
use crypto_guard::feed::{PriceFeed, SharedPriceBoard};
use crypto_guard::limiter::TradeLimiter;
use crypto_guard::orchestrator::ProtectionOrchestrator;
use crypto_guard::paper::PaperBook;
use crypto_guard::price_window::PriceWindow;
use crypto_guard::state_store::{self, PersistenceWorker};

pub fn run(config_path: String, book_path: String, interval_override: Option<u64>) -> Result<()> {
    dotenv::dotenv().ok();

    let mut config = GuardConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    if let Some(secs) = interval_override {
        info!("Overriding cycle interval to {}s", secs);
        config.engine.interval_secs = secs.max(1);
    }

    // Sinks are built outside the runtime; the webhook client is blocking
    let (dispatcher, worker) = AlertDispatcher::new(&config.alerts);
    let worker = worker.with_configured_sinks(&config.alerts);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let result = runtime.block_on(run_async(config, config_path, book_path, dispatcher, worker));
    // The stdin reader sits on a blocking thread that never returns on its own
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run_async(
    config: GuardConfig,
    config_path: String,
    book_path: String,
    dispatcher: AlertDispatcher,
    worker: AlertWorker,
) -> Result<()> {
    info!("==============================================================");
    info!("  CRYPTO GUARD - PAPER PROTECTION LOOP");
    info!("  Reference asset: {}", config.reference_asset);
    info!("  Cycle interval: {}s", config.engine.interval_secs);
    info!("  Base position size: {:.2}", config.engine.base_position_size);
    match &config.limiter.state_file {
        Some(path) => info!("  Limiter state: {}", path.display()),
        None => info!("  Limiter state: in memory only"),
    }
    info!("==============================================================");

    let alert_task = tokio::spawn(worker.run());
    let alerts = Arc::new(dispatcher);

    // Persistence
    let store = state_store::store_for(config.limiter.state_file.as_deref());
    let (state_tx, persistence) = PersistenceWorker::new(Arc::clone(&store));
    let persistence_task = tokio::spawn(persistence.run());
    let limiter = TradeLimiter::new(config.limiter.clone()).with_persistence(state_tx);
    limiter.load_from(store.as_ref(), Utc::now());

    // Price ingestion
    let window = PriceWindow::shared();
    let board = SharedPriceBoard::default();
    let feed = PriceFeed::new(&config.reference_asset, Arc::clone(&window), Arc::clone(&board));
    let ingest_task = tokio::spawn(async move {
        feed.ingest_lines(BufReader::new(tokio::io::stdin())).await
    });

    let orchestrator =
        ProtectionOrchestrator::new(&config, window, Arc::clone(&alerts)).with_limiter(limiter);
    let mut book = PaperBook::load(&book_path, board)?;

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating shutdown...");
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => {
                error!("Error setting up signal handler: {}", e);
            }
        }
    });

    let mut watcher = ConfigWatcher::new(&config_path);
    let mut interval_secs = config.engine.interval_secs;
    let mut cycle_interval = interval(Duration::from_secs(interval_secs));
    let mut reload_interval =
        interval(Duration::from_secs(config.engine.config_reload_secs.max(1)));

    info!("Starting protection loop...");

    loop {
        tokio::select! {
            _ = cycle_interval.tick() => {
                orchestrator.run_cycle(&mut book);
            }
            _ = reload_interval.tick() => {
                if let Some(new_config) = watcher.poll() {
                    orchestrator.apply_config(&new_config);
                    if new_config.engine.interval_secs != interval_secs {
                        interval_secs = new_config.engine.interval_secs;
                        info!("Cycle interval changed to {}s", interval_secs);
                        cycle_interval = interval(Duration::from_secs(interval_secs));
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    // Graceful shutdown
    ingest_task.abort();

    if let Err(e) = book.save(&book_path) {
        error!("Failed to save paper book: {:#}", e);
    }

    let stats = orchestrator.stats();
    info!(
        "Final state: regime {}, {} banned, {} on cooldown, realized P&L {}",
        stats.regime.regime,
        stats.limiter.symbols_banned.len(),
        stats.limiter.symbols_on_cooldown.len(),
        book.realized_pnl().round_dp(2)
    );

    orchestrator.limiter().detach_persistence();
    let flush = Duration::from_secs(config.engine.shutdown_flush_secs);
    match tokio::time::timeout(flush, persistence_task).await {
        Ok(_) => info!("Limiter state flushed"),
        Err(_) => warn!("Limiter state flush timed out after {:?}", flush),
    }

    drop(orchestrator);
    drop(alerts);
    if tokio::time::timeout(flush, alert_task).await.is_err() {
        warn!("Alert worker did not finish within {:?}", flush);
    }

    info!("Protection loop ended.");
    Ok(())
}
