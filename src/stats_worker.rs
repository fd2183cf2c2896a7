// =============================================================================
// Stats Worker — daily per-symbol baseline recomputation
// =============================================================================
//
// Once per day at STATS_WORKER_HOUR_UTC: for each active symbol, collect the
// last STATS_LOOKBACK_DAYS of funding rates, 1-hour OI changes, L/S and taker
// ratios, and the average OI in USD. Symbols with fewer than STATS_MIN_POINTS
// total samples across the four series are skipped. Rows replace their
// predecessors, then the in-memory stats map consumed by the anomaly engine
// is swapped atomically.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collector::StatsMap;
use crate::config::Config;
use crate::db::Database;
use crate::types::{now_ts, SymbolStats};

/// Arithmetic mean, `None` for an empty series.
pub fn mean(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    Some(data.iter().sum::<f64>() / data.len() as f64)
}

/// Sample standard deviation (n − 1), `None` below two points.
pub fn stdev(data: &[f64]) -> Option<f64> {
    if data.len() < 2 {
        return None;
    }
    let m = mean(data)?;
    let var = data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    Some(var.sqrt())
}

/// Seconds until the next occurrence of `hour`:00:00 UTC strictly after
/// `now`. Advancing by a whole day keeps month and year boundaries correct.
pub fn seconds_until_hour(now: DateTime<Utc>, hour: u32) -> i64 {
    let today_target = now
        .with_hour(hour)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    let target = if now >= today_target {
        today_target + ChronoDuration::days(1)
    } else {
        today_target
    };
    (target - now).num_seconds().max(0)
}

/// Daily loop; runs until cancelled.
pub async fn run_stats_loop(
    cfg: Arc<Config>,
    db: Database,
    stats: StatsMap,
    cancel: CancellationToken,
) {
    loop {
        let wait = seconds_until_hour(Utc::now(), cfg.stats_worker_hour_utc);
        info!(next_run_in_sec = wait, "stats worker scheduled");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(std::time::Duration::from_secs(wait as u64)) => {}
        }

        if let Err(e) = compute_stats(&cfg, &db, &stats) {
            error!(error = %e, "stats worker run failed");
        }
    }
    info!("stats worker stopped");
}

/// Recompute and persist the per-symbol baselines, then refresh the shared
/// map. Returns the number of symbols updated.
pub fn compute_stats(cfg: &Config, db: &Database, stats: &StatsMap) -> Result<usize> {
    info!("stats worker: recomputing symbol baselines");
    let all_symbols = db.active_symbols()?;
    let now = now_ts();
    let since = now - cfg.stats_lookback_days * 86_400;
    let mut rows: Vec<SymbolStats> = Vec::new();

    for sym in &all_symbols {
        let result: Result<Option<SymbolStats>> = (|| {
            let funding = db.funding_series(sym.id, since)?;
            let oi_changes = db.oi_changes_1h(sym.id, since)?;
            let ls = db.ls_series(sym.id, since)?;
            let taker = db.taker_series(sym.id, since)?;

            let total = funding.len() + oi_changes.len() + ls.len() + taker.len();
            if total < cfg.stats_min_points {
                return Ok(None);
            }

            Ok(Some(SymbolStats {
                symbol_id: sym.id,
                updated_at: now,
                mean_funding: mean(&funding),
                std_funding: stdev(&funding),
                mean_oi_change_1h: mean(&oi_changes),
                std_oi_change_1h: stdev(&oi_changes),
                mean_ls_ratio: mean(&ls),
                std_ls_ratio: stdev(&ls),
                mean_taker_ratio: mean(&taker),
                std_taker_ratio: stdev(&taker),
                avg_oi_usd: db.avg_oi_usd(sym.id, since)?.unwrap_or(0.0),
            }))
        })();

        match result {
            Ok(Some(row)) => rows.push(row),
            Ok(None) => {}
            Err(e) => {
                warn!(symbol = %sym.symbol, error = %e, "stats computation failed for symbol");
            }
        }
    }

    let updated = rows.len();
    db.save_symbol_stats(&rows)?;

    // Atomic replace of the map the anomaly engine reads.
    let fresh = db.load_symbol_stats()?;
    *stats.write() = fresh;

    info!(updated, "stats worker: baselines refreshed");
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FundingRow, OiRow, SymbolMeta};
    use chrono::TimeZone;
    use parking_lot::RwLock;
    use std::collections::HashMap;

    #[test]
    fn mean_and_stdev_match_reference() {
        let data = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((mean(&data).unwrap() - 5.0).abs() < 1e-12);
        // Sample stdev of the classic series is ~2.138.
        assert!((stdev(&data).unwrap() - 2.138089935299395).abs() < 1e-9);

        assert_eq!(mean(&[]), None);
        assert_eq!(stdev(&[1.0]), None);
    }

    #[test]
    fn next_run_crosses_month_boundary() {
        // Jan 31, 23:30 UTC -> next 04:00 is Feb 1.
        let now = Utc.with_ymd_and_hms(2025, 1, 31, 23, 30, 0).unwrap();
        let secs = seconds_until_hour(now, 4);
        assert_eq!(secs, 4 * 3600 + 30 * 60);

        // Already past today's target.
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 4, 0, 1).unwrap();
        let secs = seconds_until_hour(now, 4);
        assert_eq!(secs, 86_400 - 1);

        // Before today's target.
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 1, 0, 0).unwrap();
        assert_eq!(seconds_until_hour(now, 4), 3 * 3600);
    }

    #[test]
    fn compute_skips_thin_symbols_and_swaps_map() {
        let db = Database::open_in_memory().unwrap();
        let map = db
            .upsert_symbols(
                &[
                    SymbolMeta {
                        symbol: "BTCUSDT".into(),
                        base_asset: "BTC".into(),
                    },
                    SymbolMeta {
                        symbol: "THINUSDT".into(),
                        base_asset: "THIN".into(),
                    },
                ],
                0,
            )
            .unwrap();
        let (btc, thin) = (map["BTCUSDT"], map["THINUSDT"]);
        let now = now_ts();

        // 120 funding samples for BTC, 3 for the thin symbol.
        let rows: Vec<FundingRow> = (0..120)
            .map(|i| FundingRow {
                ts: now - i * 300,
                symbol_id: btc,
                rate: 0.0001 + (i % 7) as f64 * 1e-5,
                next_funding_time: 0,
            })
            .collect();
        db.insert_funding_rates(&rows).unwrap();
        let thin_rows: Vec<FundingRow> = (0..3)
            .map(|i| FundingRow {
                ts: now - i * 300,
                symbol_id: thin,
                rate: 0.0001,
                next_funding_time: 0,
            })
            .collect();
        db.insert_funding_rates(&thin_rows).unwrap();
        db.insert_open_interest(&[OiRow {
            ts: now,
            symbol_id: btc,
            oi_contracts: 10.0,
            oi_usd: 5e8,
            mark_price: 5e7,
        }])
        .unwrap();

        let cfg = Config::default();
        let stats: StatsMap = Arc::new(RwLock::new(HashMap::new()));
        let updated = compute_stats(&cfg, &db, &stats).unwrap();

        assert_eq!(updated, 1);
        let guard = stats.read();
        let row = guard.get(&btc).expect("btc baseline present");
        assert!(row.mean_funding.is_some());
        assert!(row.std_funding.is_some());
        assert!((row.avg_oi_usd - 5e8).abs() < 1e-3);
        assert!(!guard.contains_key(&thin));
    }
}
