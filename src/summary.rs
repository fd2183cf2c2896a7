// =============================================================================
// Daily Summary — one medium-priority digest message per day
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::db::Database;
use crate::notifier::Notifier;
use crate::stats_worker::seconds_until_hour;
use crate::types::{now_ts, Severity};

/// Build the digest: top funding, top OI range, top L/S, 24h anomaly counts.
pub fn build_summary(db: &Database, now: i64) -> Result<String> {
    let since = now - 86_400;
    let mut lines = vec!["<b>Daily Summary</b>".to_string()];

    let top_funding = db.daily_top_funding(since, 10)?;
    if !top_funding.is_empty() {
        lines.push("\n<b>TOP Funding:</b>".to_string());
        for (symbol, rate) in top_funding {
            lines.push(format!("  {symbol}: {rate:.6}"));
        }
    }

    let top_oi = db.daily_top_oi_change(since, 10)?;
    if !top_oi.is_empty() {
        lines.push("\n<b>TOP OI change:</b>".to_string());
        for (symbol, pct) in top_oi {
            lines.push(format!("  {symbol}: {pct:.1}%"));
        }
    }

    let top_ls = db.daily_top_ls(since, 10)?;
    if !top_ls.is_empty() {
        lines.push("\n<b>TOP L/S ratio:</b>".to_string());
        for (symbol, ratio) in top_ls {
            lines.push(format!("  {symbol}: {ratio:.2}"));
        }
    }

    let counts = db.anomaly_counts_since(since)?;
    if !counts.is_empty() {
        lines.push("\n<b>Anomalies 24h:</b>".to_string());
        for sev in ["critical", "high", "medium", "low"] {
            if let Some(cnt) = counts.get(sev).filter(|c| **c > 0) {
                lines.push(format!("  {sev}: {cnt}"));
            }
        }
    }

    Ok(lines.join("\n"))
}

/// Daily loop; runs until cancelled.
pub async fn run_summary_loop(
    cfg: Arc<Config>,
    db: Database,
    notifier: Arc<Notifier>,
    cancel: CancellationToken,
) {
    loop {
        let wait = seconds_until_hour(Utc::now(), cfg.daily_summary_hour_utc);
        info!(next_run_in_sec = wait, "daily summary scheduled");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(std::time::Duration::from_secs(wait as u64)) => {}
        }

        match build_summary(&db, now_ts()) {
            Ok(text) => notifier.enqueue(text, Severity::Medium, None),
            Err(e) => error!(error = %e, "daily summary failed"),
        }
    }
    info!("daily summary stopped");
}
