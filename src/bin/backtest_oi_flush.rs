// =============================================================================
// OI Flush Backtest — standalone entry point
// =============================================================================
//
// Replays the stored OI series, prints the report, saves it to a timestamped
// .txt, and uploads it to the configured chat when credentials are present.
// =============================================================================

use tracing_subscriber::EnvFilter;

use meridian_sentinel::backtest::{oi_flush, report};
use meridian_sentinel::{Config, Database};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cfg = Config::from_env();
    if !std::path::Path::new(&cfg.db_path).exists() {
        anyhow::bail!("database not found: {}", cfg.db_path);
    }

    let start = std::time::Instant::now();
    let db = Database::open(&cfg.db_path)?;
    let mut text = oi_flush::run(&db)?;
    text.push_str(&format!("\nElapsed: {:.1}s\n", start.elapsed().as_secs_f64()));

    print!("{text}");

    let path = report::save_report("backtest_oi_flush", &text)?;
    if let Err(e) = report::send_document(&cfg.telegram_bot_token, cfg.admin_id, &path).await {
        eprintln!("report upload failed: {e}");
    }
    Ok(())
}
