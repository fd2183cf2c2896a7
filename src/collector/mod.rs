// =============================================================================
// Collector — watchdog-bounded cycle: refresh, aggregate, fan-out, detect
// =============================================================================
//
// One cycle, aligned to the collection period:
//
//   1. refresh the symbol universe when stale
//   2. one aggregated premiumIndex call (mark price + funding for all pairs)
//   3. funding dedup against the live cache, batched
//   4. per-symbol fan-out (OI for all, L/S + taker for hot) under a shared
//      semaphore, each dispatch staggered by REQUEST_DELAY
//   5. batch writes, one transaction per table
//   6. anomaly detection over the freshest values
//   7. notification gating + enqueue
//   8. collector-stats row
//
// The whole cycle runs under WATCHDOG_TIMEOUT; expiry abandons it (partial
// writes are fine, the primary keys make re-ingestion idempotent) and the
// in-flight symbol futures are dropped with it. Cycle n+1 starts only after
// cycle n completes or times out.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::future::join_all;
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::anomaly::{AnomalyEngine, FreshValues};
use crate::binance::{FuturesClient, RequestCounters};
use crate::config::Config;
use crate::db::Database;
use crate::notifier::{should_notify, Notifier};
use crate::symbols::SymbolRegistry;
use crate::types::{
    now_ts, AnomalyRow, CollectorStats, FundingRow, LsRow, MetricKind, OiRow, SymbolStats,
    TakerRow,
};

/// Live per-symbol last-known values, keyed by (symbol_id, metric). Written
/// only by the collector; hydrated from storage at startup.
pub type LastValues = Arc<RwLock<HashMap<(i64, MetricKind), f64>>>;

/// Per-symbol baselines, replaced wholesale by the stats worker.
pub type StatsMap = Arc<RwLock<HashMap<i64, SymbolStats>>>;

/// Rows harvested for one symbol in one cycle.
#[derive(Debug, Default)]
struct SymbolHarvest {
    oi: Option<OiRow>,
    ls: Option<LsRow>,
    taker: Option<TakerRow>,
}

pub struct Collector {
    cfg: Arc<Config>,
    db: Database,
    client: Arc<FuturesClient>,
    registry: Arc<SymbolRegistry>,
    notifier: Arc<Notifier>,
    engine: Arc<AnomalyEngine>,
    last_values: LastValues,
    stats: StatsMap,
}

impl Collector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<Config>,
        db: Database,
        client: Arc<FuturesClient>,
        registry: Arc<SymbolRegistry>,
        notifier: Arc<Notifier>,
        engine: Arc<AnomalyEngine>,
        last_values: LastValues,
        stats: StatsMap,
    ) -> Self {
        Self {
            cfg,
            db,
            client,
            registry,
            notifier,
            engine,
            last_values,
            stats,
        }
    }

    /// Main collection loop. Runs until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval = self.cfg.collect_interval,
            watchdog = self.cfg.watchdog_timeout,
            "collector started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let period = self.cfg.collect_interval as i64;
            let cycle_ts = now_ts() / period * period;
            let start = Instant::now();

            match tokio::time::timeout(
                Duration::from_secs(self.cfg.watchdog_timeout),
                self.run_cycle(cycle_ts, start),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, cycle_ts, "cycle failed"),
                Err(_) => warn!(
                    timeout = self.cfg.watchdog_timeout,
                    cycle_ts, "cycle watchdog expired, abandoning cycle"
                ),
            }

            let elapsed = start.elapsed();
            let sleep_for =
                Duration::from_secs(self.cfg.collect_interval).saturating_sub(elapsed);
            info!(
                elapsed_sec = elapsed.as_secs_f64(),
                sleep_sec = sleep_for.as_secs_f64(),
                "cycle done"
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        info!("collector stopped");
    }

    /// One full collection cycle.
    async fn run_cycle(&self, cycle_ts: i64, cycle_start: Instant) -> Result<()> {
        // 1. Universe refresh.
        if self.registry.needs_refresh() {
            self.registry.refresh(&self.client, &self.db).await?;
        }

        let sym_map = self.db.symbol_map()?;
        let hot_ids: HashSet<i64> = self
            .db
            .hot_symbols()?
            .into_iter()
            .map(|s| s.id)
            .collect();
        let all_symbols = self.db.active_symbols()?;

        let counters = Arc::new(RequestCounters::new());

        // 2. One aggregated call for mark prices + funding.
        let mut mark_prices: HashMap<String, f64> = HashMap::new();
        let mut funding_map: HashMap<String, (f64, i64)> = HashMap::new();
        match self.client.premium_index().await {
            Ok(entries) => {
                counters.record_ok();
                for e in entries {
                    mark_prices.insert(e.symbol.clone(), e.mark_price);
                    funding_map.insert(e.symbol, (e.last_funding_rate, e.next_funding_time));
                }
            }
            Err(e) => {
                counters.record_fail();
                warn!(error = %e, "premiumIndex call failed");
            }
        }

        // 3. Funding dedup against the live cache.
        let funding_rows = dedup_funding(cycle_ts, &funding_map, &sym_map, &self.last_values);

        // 4. Per-symbol fan-out under the shared concurrency cap. Dispatches
        //    are staggered by REQUEST_DELAY to smooth outbound load; the
        //    futures stay owned by this cycle so a watchdog expiry drops them.
        let sem = Arc::new(Semaphore::new(self.cfg.max_concurrent));
        let stagger = Duration::from_secs_f64(self.cfg.request_delay);
        let harvest_futs = all_symbols.iter().enumerate().map(|(i, sym)| {
            let sem = sem.clone();
            let client = self.client.clone();
            let counters = counters.clone();
            let last_values = self.last_values.clone();
            let mark_price = mark_prices.get(&sym.symbol).copied();
            let is_hot = hot_ids.contains(&sym.id);
            let symbol = sym.symbol.clone();
            let sid = sym.id;
            async move {
                tokio::time::sleep(stagger * i as u32).await;
                collect_symbol(
                    sem,
                    client,
                    counters,
                    cycle_ts,
                    sid,
                    symbol,
                    mark_price,
                    is_hot,
                    last_values,
                )
                .await
            }
        });
        let harvests: Vec<SymbolHarvest> = join_all(harvest_futs).await;

        let mut oi_rows = Vec::new();
        let mut ls_rows = Vec::new();
        let mut taker_rows = Vec::new();
        for h in harvests {
            if let Some(r) = h.oi {
                oi_rows.push(r);
            }
            if let Some(r) = h.ls {
                ls_rows.push(r);
            }
            if let Some(r) = h.taker {
                taker_rows.push(r);
            }
        }

        // 5. Batch writes commit before detection reads.
        self.db.insert_open_interest(&oi_rows)?;
        self.db.insert_funding_rates(&funding_rows)?;
        self.db.insert_long_short_ratios(&ls_rows)?;
        self.db.insert_taker_ratios(&taker_rows)?;

        // 6. Detection over the freshest values per symbol.
        let top_oi_ids = compute_top_oi_ids(&self.stats.read(), self.cfg.severity_top_n);
        let cycle_oi: HashMap<i64, f64> =
            oi_rows.iter().map(|r| (r.symbol_id, r.oi_usd)).collect();

        let mut anomaly_rows: Vec<AnomalyRow> = Vec::new();
        for sym in &all_symbols {
            let fresh = {
                let cache = self.last_values.read();
                let oi_usd = cycle_oi.get(&sym.id).copied().or_else(|| {
                    // OI deduped this cycle: price the cached contracts at the
                    // current mark.
                    let contracts = cache.get(&(sym.id, MetricKind::Oi))?;
                    let mark = mark_prices.get(&sym.symbol)?;
                    Some(contracts * mark)
                });
                FreshValues {
                    oi_usd,
                    funding: cache.get(&(sym.id, MetricKind::Funding)).copied(),
                    ls_ratio: cache.get(&(sym.id, MetricKind::Ls)).copied(),
                    taker_ratio: cache.get(&(sym.id, MetricKind::Taker)).copied(),
                }
            };

            let stats_map = self.stats.read();
            match self.engine.detect(
                &self.db,
                cycle_ts,
                sym.id,
                &sym.symbol,
                &fresh,
                stats_map.get(&sym.id),
                &top_oi_ids,
                now_ts(),
            ) {
                Ok(mut rows) => anomaly_rows.append(&mut rows),
                Err(e) => {
                    error!(symbol = %sym.symbol, error = %e, "anomaly detection failed");
                }
            }
        }

        // 7. Persist anomalies, then gate + enqueue notifications.
        if !anomaly_rows.is_empty() {
            self.db.insert_anomalies(&anomaly_rows)?;
            let name_by_id: HashMap<i64, &str> = all_symbols
                .iter()
                .map(|s| (s.id, s.symbol.as_str()))
                .collect();
            for anom in &anomaly_rows {
                if !should_notify(anom.kind, anom.severity, self.cfg.min_alert_severity) {
                    continue;
                }
                let symbol = name_by_id.get(&anom.symbol_id).copied().unwrap_or("?");
                let text = if anom.kind == crate::types::AnomalyKind::OiFlush {
                    anom.description.clone()
                } else {
                    format_alert(symbol, anom)
                };
                self.notifier.enqueue(text, anom.severity, Some(anom.kind));
            }
        }

        // 8. Collector accounting.
        let snap = counters.snapshot();
        self.db.insert_collector_stats(&CollectorStats {
            cycle_ts,
            duration_sec: cycle_start.elapsed().as_secs_f64(),
            requests_ok: snap.ok,
            requests_fail: snap.fail,
            pairs_collected: oi_rows.len() as u32,
            anomalies_found: anomaly_rows.len() as u32,
        })?;

        info!(
            cycle_ts,
            oi = oi_rows.len(),
            funding = funding_rows.len(),
            ls = ls_rows.len(),
            taker = taker_rows.len(),
            anomalies = anomaly_rows.len(),
            "cycle collected"
        );
        Ok(())
    }
}

/// Fetch one symbol's metrics under the shared semaphore. OI for every
/// symbol; L/S and taker only for hot ones. Each value is emitted only when
/// it differs from the cached last reading.
#[allow(clippy::too_many_arguments)]
async fn collect_symbol(
    sem: Arc<Semaphore>,
    client: Arc<FuturesClient>,
    counters: Arc<RequestCounters>,
    cycle_ts: i64,
    sid: i64,
    symbol: String,
    mark_price: Option<f64>,
    is_hot: bool,
    last_values: LastValues,
) -> SymbolHarvest {
    let mut harvest = SymbolHarvest::default();
    let _permit = match sem.acquire().await {
        Ok(p) => p,
        Err(_) => return harvest,
    };

    match client.open_interest(&symbol).await {
        Ok(Some(contracts)) => {
            counters.record_ok();
            let mark = mark_price.unwrap_or(0.0);
            harvest.oi = build_oi_row(cycle_ts, sid, contracts, mark, &last_values);
        }
        Ok(None) => {}
        Err(e) => {
            counters.record_fail();
            warn!(symbol = %symbol, error = %e, "open interest fetch failed");
        }
    }

    if is_hot {
        match client.long_short_ratio(&symbol, "5m").await {
            Ok(Some(sample)) => {
                counters.record_ok();
                harvest.ls = build_ls_row(
                    cycle_ts,
                    sid,
                    sample.ratio,
                    sample.long_pct,
                    sample.short_pct,
                    &last_values,
                );
            }
            Ok(None) => {}
            Err(e) => {
                counters.record_fail();
                warn!(symbol = %symbol, error = %e, "long/short ratio fetch failed");
            }
        }

        match client.taker_ratio(&symbol, "5m").await {
            Ok(Some(sample)) => {
                counters.record_ok();
                harvest.taker = build_taker_row(
                    cycle_ts,
                    sid,
                    sample.buy_sell_ratio,
                    sample.buy_vol,
                    sample.sell_vol,
                    &last_values,
                );
            }
            Ok(None) => {}
            Err(e) => {
                counters.record_fail();
                warn!(symbol = %symbol, error = %e, "taker ratio fetch failed");
            }
        }
    }

    harvest
}

// ── Dedup builders (cache is updated only when a row is emitted) ─────────────

fn build_oi_row(
    cycle_ts: i64,
    sid: i64,
    contracts: f64,
    mark_price: f64,
    last_values: &LastValues,
) -> Option<OiRow> {
    let key = (sid, MetricKind::Oi);
    if last_values.read().get(&key) == Some(&contracts) {
        return None;
    }
    last_values.write().insert(key, contracts);
    Some(OiRow {
        ts: cycle_ts,
        symbol_id: sid,
        oi_contracts: contracts,
        oi_usd: contracts * mark_price,
        mark_price,
    })
}

fn build_ls_row(
    cycle_ts: i64,
    sid: i64,
    ratio: f64,
    long_pct: f64,
    short_pct: f64,
    last_values: &LastValues,
) -> Option<LsRow> {
    let key = (sid, MetricKind::Ls);
    if last_values.read().get(&key) == Some(&ratio) {
        return None;
    }
    last_values.write().insert(key, ratio);
    Some(LsRow {
        ts: cycle_ts,
        symbol_id: sid,
        ratio,
        long_pct,
        short_pct,
    })
}

fn build_taker_row(
    cycle_ts: i64,
    sid: i64,
    buy_sell_ratio: f64,
    buy_vol: f64,
    sell_vol: f64,
    last_values: &LastValues,
) -> Option<TakerRow> {
    let key = (sid, MetricKind::Taker);
    if last_values.read().get(&key) == Some(&buy_sell_ratio) {
        return None;
    }
    last_values.write().insert(key, buy_sell_ratio);
    Some(TakerRow {
        ts: cycle_ts,
        symbol_id: sid,
        buy_sell_ratio,
        buy_vol,
        sell_vol,
    })
}

/// Skip symbols whose funding rate equals the cached last value; cache is
/// updated for the rest.
fn dedup_funding(
    cycle_ts: i64,
    funding_map: &HashMap<String, (f64, i64)>,
    sym_map: &HashMap<String, i64>,
    last_values: &LastValues,
) -> Vec<FundingRow> {
    let mut rows = Vec::new();
    for (symbol, (rate, next_funding_time)) in funding_map {
        let Some(&sid) = sym_map.get(symbol) else {
            continue;
        };
        let key = (sid, MetricKind::Funding);
        if last_values.read().get(&key) == Some(rate) {
            continue;
        }
        last_values.write().insert(key, *rate);
        rows.push(FundingRow {
            ts: cycle_ts,
            symbol_id: sid,
            rate: *rate,
            next_funding_time: *next_funding_time,
        });
    }
    rows
}

/// IDs of the top-N symbols by average OI, for severity ranking.
fn compute_top_oi_ids(stats: &HashMap<i64, SymbolStats>, n: usize) -> HashSet<i64> {
    let mut items: Vec<(i64, f64)> = stats.iter().map(|(id, s)| (*id, s.avg_oi_usd)).collect();
    items.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    items.into_iter().take(n).map(|(id, _)| id).collect()
}

/// Standard alert body for non-flush anomalies.
fn format_alert(symbol: &str, anom: &AnomalyRow) -> String {
    format!(
        "{} <b>{}: {}</b>\n{}",
        anom.severity.icon(),
        anom.kind.label(),
        symbol,
        anom.description
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AnomalyKind, Severity};

    fn empty_cache() -> LastValues {
        Arc::new(RwLock::new(HashMap::new()))
    }

    #[test]
    fn oi_row_dedupes_on_identical_contracts() {
        let cache = empty_cache();
        let first = build_oi_row(300, 1, 1000.0, 50.0, &cache);
        assert!(first.is_some());
        assert_eq!(first.as_ref().unwrap().oi_usd, 1000.0 * 50.0);

        // Same contracts next cycle: no row, even at a different mark price.
        let second = build_oi_row(600, 1, 1000.0, 51.0, &cache);
        assert!(second.is_none());

        // Changed contracts emit again.
        let third = build_oi_row(900, 1, 1001.0, 51.0, &cache);
        assert!(third.is_some());
    }

    #[test]
    fn funding_dedup_skips_unchanged_rates() {
        let cache = empty_cache();
        let mut sym_map = HashMap::new();
        sym_map.insert("BTCUSDT".to_string(), 1_i64);
        sym_map.insert("ETHUSDT".to_string(), 2_i64);

        let mut funding = HashMap::new();
        funding.insert("BTCUSDT".to_string(), (0.0001, 123_i64));
        funding.insert("ETHUSDT".to_string(), (0.0002, 123_i64));
        funding.insert("GHOSTUSDT".to_string(), (0.5, 0_i64)); // not in universe

        let rows = dedup_funding(300, &funding, &sym_map, &cache);
        assert_eq!(rows.len(), 2);

        // Second cycle: BTC unchanged, ETH moved.
        funding.insert("ETHUSDT".to_string(), (0.0003, 456_i64));
        let rows = dedup_funding(600, &funding, &sym_map, &cache);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol_id, 2);
        assert_eq!(rows[0].rate, 0.0003);
    }

    #[test]
    fn ls_and_taker_rows_dedupe() {
        let cache = empty_cache();
        assert!(build_ls_row(300, 1, 2.5, 0.71, 0.29, &cache).is_some());
        assert!(build_ls_row(600, 1, 2.5, 0.71, 0.29, &cache).is_none());
        assert!(build_ls_row(900, 1, 2.6, 0.72, 0.28, &cache).is_some());

        assert!(build_taker_row(300, 1, 0.9, 10.0, 11.1, &cache).is_some());
        assert!(build_taker_row(600, 1, 0.9, 12.0, 13.3, &cache).is_none());
    }

    #[test]
    fn top_oi_ids_takes_largest_n() {
        let mut stats = HashMap::new();
        for (id, avg) in [(1_i64, 5e9), (2, 1e9), (3, 9e9), (4, 2e9)] {
            stats.insert(
                id,
                SymbolStats {
                    symbol_id: id,
                    avg_oi_usd: avg,
                    ..Default::default()
                },
            );
        }
        let top = compute_top_oi_ids(&stats, 2);
        assert_eq!(top.len(), 2);
        assert!(top.contains(&3));
        assert!(top.contains(&1));
    }

    #[test]
    fn alert_formatting_carries_icon_and_label() {
        let anom = AnomalyRow {
            detected_at: 0,
            cycle_ts: 0,
            symbol_id: 1,
            kind: AnomalyKind::OiSurge,
            severity: Severity::High,
            value: 0.15,
            description: "OI surge +15.00% ($115 -> prev $100)".to_string(),
        };
        let text = format_alert("BTCUSDT", &anom);
        assert!(text.contains("OI SURGE: BTCUSDT"));
        assert!(text.starts_with(Severity::High.icon()));
        assert!(text.contains("+15.00%"));
    }
}
