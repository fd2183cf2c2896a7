// =============================================================================
// Meridian Futures Sentinel — Main Entry Point
// =============================================================================
//
// Wires the store, exchange client, collector, anomaly engine, notifier, and
// the daily background jobs, then waits for a termination signal. Shutdown
// fans out through one cancellation token, awaits every loop, and drains the
// notifier with its usual pacing.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use meridian_sentinel::anomaly::AnomalyEngine;
use meridian_sentinel::archive::run_archive_loop;
use meridian_sentinel::binance::FuturesClient;
use meridian_sentinel::collector::{Collector, LastValues, StatsMap};
use meridian_sentinel::notifier::{Notifier, TelegramTransport};
use meridian_sentinel::stats_worker::run_stats_loop;
use meridian_sentinel::summary::run_summary_loop;
use meridian_sentinel::symbols::SymbolRegistry;
use meridian_sentinel::{Config, Database};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Futures Sentinel — Starting Up           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let cfg = Arc::new(Config::from_env());
    info!(
        interval = cfg.collect_interval,
        db = %cfg.db_path,
        "configuration loaded"
    );

    // ── 2. Store + cache hydration ───────────────────────────────────────
    let db = Database::open(&cfg.db_path)?;
    let last_values: LastValues = Arc::new(RwLock::new(db.load_last_values()?));
    let stats: StatsMap = Arc::new(RwLock::new(db.load_symbol_stats()?));

    // ── 3. Exchange client + symbol universe ─────────────────────────────
    let client = Arc::new(FuturesClient::new(&cfg.proxy_url)?);
    let registry = Arc::new(SymbolRegistry::new(cfg.clone()));
    match registry.refresh(&client, &db).await {
        Ok(map) => info!(symbols = map.len(), "initial symbol universe loaded"),
        Err(e) => warn!(error = %e, "initial symbol refresh failed, continuing with stored universe"),
    }

    // ── 4. Notifier ──────────────────────────────────────────────────────
    let transport = Arc::new(TelegramTransport::new(
        cfg.telegram_bot_token.clone(),
        cfg.admin_id,
    ));
    let notifier = Arc::new(Notifier::new(cfg.clone(), transport));
    notifier.start();

    // ── 5. Background loops ──────────────────────────────────────────────
    let engine = Arc::new(AnomalyEngine::new(cfg.clone()));
    let collector = Arc::new(Collector::new(
        cfg.clone(),
        db.clone(),
        client.clone(),
        registry.clone(),
        notifier.clone(),
        engine,
        last_values,
        stats.clone(),
    ));

    let root = CancellationToken::new();
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(collector.run(root.child_token())));
    tasks.push(tokio::spawn(run_stats_loop(
        cfg.clone(),
        db.clone(),
        stats,
        root.child_token(),
    )));
    tasks.push(tokio::spawn(run_summary_loop(
        cfg.clone(),
        db.clone(),
        notifier.clone(),
        root.child_token(),
    )));
    tasks.push(tokio::spawn(run_archive_loop(
        cfg.clone(),
        db.clone(),
        root.child_token(),
    )));

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    root.cancel();
    for task in tasks {
        let _ = task.await;
    }
    notifier.stop().await;

    info!("Meridian Futures Sentinel shut down complete.");
    Ok(())
}
