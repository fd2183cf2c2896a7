// =============================================================================
// L/S + Taker Backtest — SHORT on crowded longs met by aggressive selling
// =============================================================================
//
// Per symbol, the L/S threshold is adaptive: mean + LS_ZSCORE·σ over all
// stored ratios, floored at LS_MIN_ABS, and only fitted when at least
// LS_MIN_DATAPOINTS samples exist. A signal fires where L/S exceeds that
// threshold while the taker ratio sits below TAKER_THRESHOLD at the same
// sample timestamp. The report compares against the OI-flush strategy on the
// same data and ends with the TP/SL grid search.
// =============================================================================

use std::collections::HashMap;
use std::fmt::Write;

use anyhow::Result;

use crate::db::Database;

use super::{
    build_price_path, fmt_exit, fmt_pnl, fmt_price, oi_flush, optimizer, simulate_trade,
    ts_to_str, Signal, MIN_HISTORY, POINT_INTERVAL, SIGNAL_COOLDOWN,
};

/// Sigmas above the mean for the adaptive threshold.
pub const LS_ZSCORE: f64 = 2.0;
/// Absolute floor under the adaptive threshold.
pub const LS_MIN_ABS: f64 = 1.5;
/// Minimum stored ratios to fit a threshold at all.
pub const LS_MIN_DATAPOINTS: usize = 24;
/// Fixed taker-side gate.
pub const TAKER_THRESHOLD: f64 = 1.0;

pub const TAKE_PROFIT: f64 = 3.0;
pub const STOP_LOSS: f64 = 2.0;
pub const MAX_HOLD_POINTS: usize = 0;

/// Fitted per-symbol L/S threshold.
#[derive(Debug, Clone, Copy)]
pub struct LsThreshold {
    pub mean: f64,
    pub stdev: f64,
    pub adaptive: f64,
    /// max(adaptive, LS_MIN_ABS) — the value actually applied.
    pub threshold: f64,
    pub count: usize,
}

/// Fit adaptive thresholds for every symbol with enough ratio history.
pub fn compute_ls_thresholds(by_symbol: &HashMap<i64, Vec<f64>>) -> HashMap<i64, LsThreshold> {
    let mut out = HashMap::new();
    for (&sid, ratios) in by_symbol {
        if ratios.len() < LS_MIN_DATAPOINTS {
            continue;
        }
        let mean = crate::stats_worker::mean(ratios).unwrap_or(0.0);
        let stdev = crate::stats_worker::stdev(ratios).unwrap_or(0.0);
        let adaptive = mean + LS_ZSCORE * stdev;
        out.insert(
            sid,
            LsThreshold {
                mean,
                stdev,
                adaptive,
                threshold: adaptive.max(LS_MIN_ABS),
                count: ratios.len(),
            },
        );
    }
    out
}

/// Aggregate row for the strategy-comparison table.
#[derive(Debug, Clone)]
struct StrategyLine {
    name: &'static str,
    trades: usize,
    wins: usize,
    win_rate: f64,
    total_pnl: f64,
    avg_pnl: f64,
}

fn strategy_line(name: &'static str, signals: &[&Signal]) -> Option<StrategyLine> {
    let pnls: Vec<f64> = signals
        .iter()
        .filter_map(|s| s.trade.as_ref().map(|t| t.pnl_pct))
        .collect();
    if pnls.is_empty() {
        return None;
    }
    let total: f64 = pnls.iter().sum();
    let wins = pnls.iter().filter(|p| **p > 0.0).count();
    Some(StrategyLine {
        name,
        trades: pnls.len(),
        wins,
        win_rate: wins as f64 / pnls.len() as f64 * 100.0,
        total_pnl: total,
        avg_pnl: total / pnls.len() as f64,
    })
}

/// Enumerate L/S + taker signals for every pair. Returns the signals sorted
/// by time and the count of pairs that produced at least one.
pub fn collect_signals(
    db: &Database,
    thresholds: &HashMap<i64, LsThreshold>,
) -> Result<(Vec<Signal>, usize)> {
    let symbols = db.active_symbols()?;
    let mut signals = Vec::new();
    let mut pairs_with_signals = 0usize;

    for sym in &symbols {
        let points = db.oi_series(sym.id)?;
        if points.len() < MIN_HISTORY {
            continue;
        }
        let Some(info) = thresholds.get(&sym.id) else {
            continue;
        };

        let ts_to_idx: HashMap<i64, usize> =
            points.iter().enumerate().map(|(i, p)| (p.ts, i)).collect();

        let hits = db.ls_taker_hits(sym.id, info.threshold, TAKER_THRESHOLD)?;
        let mut last_signal_ts = i64::MIN / 2;
        let mut had_signals = false;

        for (ts, ls_ratio, taker_ratio) in hits {
            if ts - last_signal_ts < SIGNAL_COOLDOWN as i64 * POINT_INTERVAL {
                continue;
            }

            // Align the entry onto the OI series: exact timestamp, or the
            // first later sample.
            let oi_idx = ts_to_idx
                .get(&ts)
                .copied()
                .or_else(|| points.iter().position(|p| p.ts >= ts));
            let Some(oi_idx) = oi_idx else { continue };

            let entry = points[oi_idx];
            if entry.mark_price <= 0.0 {
                continue;
            }

            let (path, pcts) = build_price_path(&points, oi_idx, entry.mark_price);
            let trade = simulate_trade(&pcts, &path, TAKE_PROFIT, STOP_LOSS, MAX_HOLD_POINTS);

            signals.push(Signal {
                symbol: sym.symbol.clone(),
                signal_time: ts,
                entry_price: entry.mark_price,
                oi_usd: entry.oi_usd,
                funding_rate: db.funding_at_or_before(sym.id, ts)?,
                ls_ratio: Some(ls_ratio),
                taker_ratio: Some(taker_ratio),
                oi_peak_pct: 0.0,
                oi_current_pct: 0.0,
                buildup_minutes: 0,
                ls_threshold: Some(info.threshold),
                pct_changes: pcts,
                path,
                trade,
            });
            last_signal_ts = ts;
            had_signals = true;
        }

        if had_signals {
            pairs_with_signals += 1;
        }
    }

    signals.sort_by_key(|s| s.signal_time);
    Ok((signals, pairs_with_signals))
}

/// Run the whole backtest, including the OI-flush comparison, and return the
/// report text.
pub fn run(db: &Database) -> Result<String> {
    let mut out = String::new();

    let Some((min_ts, max_ts)) = db.oi_time_range()? else {
        let _ = writeln!(out, "No open interest data in the store.");
        return Ok(out);
    };
    let hours = (max_ts - min_ts) as f64 / 3600.0;

    let thresholds = compute_ls_thresholds(&db.ls_ratios_by_symbol()?);
    let (signals, pairs_with_signals) = collect_signals(db, &thresholds)?;
    let (flush_signals, _) = oi_flush::collect_signals(db)?;

    let _ = writeln!(out, "\n═══ L/S + TAKER BACKTEST (SHORT) ═══");
    let _ = writeln!(
        out,
        "Period: {} — {} ({hours:.0}h)",
        ts_to_str(min_ts),
        ts_to_str(max_ts)
    );
    let _ = writeln!(
        out,
        "Pairs with L/S data: {} | Pairs with signals: {pairs_with_signals}",
        thresholds.len()
    );
    let _ = writeln!(
        out,
        "Parameters: L/S > mean+{LS_ZSCORE}σ (min {LS_MIN_ABS}), Taker < {TAKER_THRESHOLD}, \
         TP={TAKE_PROFIT}%, SL={STOP_LOSS}%, hold=∞"
    );

    // Threshold diagnostics, highest applied threshold first.
    let symbols_by_id: HashMap<i64, String> = db
        .active_symbols()?
        .into_iter()
        .map(|s| (s.id, s.symbol))
        .collect();
    let mut diag: Vec<(&String, &LsThreshold)> = thresholds
        .iter()
        .filter_map(|(sid, info)| symbols_by_id.get(sid).map(|name| (name, info)))
        .collect();
    diag.sort_by(|a, b| b.1.threshold.total_cmp(&a.1.threshold).then(a.0.cmp(b.0)));

    let _ = writeln!(out, "\nAdaptive L/S thresholds (top-10 by threshold):");
    for (name, info) in diag.into_iter().take(10) {
        let tag = if info.adaptive >= LS_MIN_ABS {
            "adaptive"
        } else {
            "min abs"
        };
        let _ = writeln!(
            out,
            "  {name:15} mean={:.2} σ={:.2} threshold={:.2} ({tag})",
            info.mean, info.stdev, info.threshold
        );
    }

    if signals.is_empty() {
        let _ = writeln!(out, "\nNo signals found.");
        return Ok(out);
    }

    // ── Signal list ──────────────────────────────────────────────────────
    let _ = writeln!(out, "\n───── SIGNALS ({}) ─────\n", signals.len());
    let mut closed: Vec<&Signal> = Vec::new();
    let mut open_trades = 0usize;

    for (i, sig) in signals.iter().enumerate() {
        let funding_s = sig
            .funding_rate
            .map(|f| format!("{:+.3}%", f * 100.0))
            .unwrap_or_else(|| "n/a".to_string());

        let _ = writeln!(
            out,
            "#{:<3} {} | {} | SHORT @ {}",
            i + 1,
            sig.symbol,
            ts_to_str(sig.signal_time),
            fmt_price(sig.entry_price)
        );
        let _ = writeln!(
            out,
            "     L/S: {:.2} (threshold {:.2}) | Taker: {:.2} | Funding: {funding_s}",
            sig.ls_ratio.unwrap_or(0.0),
            sig.ls_threshold.unwrap_or(0.0),
            sig.taker_ratio.unwrap_or(0.0)
        );

        if let Some(trade) = &sig.trade {
            let _ = writeln!(
                out,
                "     → {} | Exit: {}",
                fmt_exit(trade),
                fmt_price(trade.exit_price)
            );
            closed.push(sig);
        } else {
            let _ = writeln!(out, "     → ⏳ OPEN (out of data)");
            open_trades += 1;
        }
        let _ = writeln!(out);
    }

    // ── Totals ───────────────────────────────────────────────────────────
    let _ = writeln!(out, "───── TOTALS ─────\n");
    let _ = writeln!(out, "Signals: {}", signals.len());
    let _ = writeln!(
        out,
        "Closed trades: {} ({open_trades} still open)",
        closed.len()
    );

    if let Some(line) = strategy_line("L/S + Taker", &closed) {
        let _ = writeln!(out, "\nP&L:");
        let _ = writeln!(out, "  Total:    {}", fmt_pnl(line.total_pnl));
        let _ = writeln!(out, "  Average:  {} per trade", fmt_pnl(line.avg_pnl));
        let _ = writeln!(out, "  Win rate: {:.0}%", line.win_rate);
    }

    write_comparison(&mut out, &closed, &flush_signals, hours);

    optimizer::run_optimization(&signals, hours, &mut out);
    Ok(out)
}

/// Side-by-side comparison with the OI-flush strategy plus a one-paragraph
/// conclusion.
fn write_comparison(out: &mut String, closed: &[&Signal], flush_signals: &[Signal], hours: f64) {
    let _ = writeln!(out, "\n\n═══ STRATEGY COMPARISON ═══\n");
    let _ = writeln!(out, "(TP={TAKE_PROFIT}%, SL={STOP_LOSS}% for all strategies)\n");

    let mut lines: Vec<StrategyLine> = Vec::new();
    if let Some(line) = strategy_line("L/S + Taker (no OI)", closed) {
        lines.push(line);
    }

    let flush_refs: Vec<&Signal> = flush_signals.iter().collect();
    if let Some(line) = strategy_line("OI Flush (all)", &flush_refs) {
        lines.push(line);
    }

    let flush_filtered: Vec<&Signal> = flush_signals
        .iter()
        .filter(|s| {
            s.ls_ratio.is_some_and(|v| v > LS_MIN_ABS)
                && s.taker_ratio.is_some_and(|v| v < TAKER_THRESHOLD)
        })
        .collect();
    if let Some(line) = strategy_line("OI Flush + L/S + Taker", &flush_filtered) {
        lines.push(line);
    }

    if lines.is_empty() {
        let _ = writeln!(out, "No data to compare");
        return;
    }

    let _ = writeln!(
        out,
        "┌─────────────────────────┬────────┬──────┬──────────┬──────────┬────────────┐"
    );
    let _ = writeln!(
        out,
        "│ Strategy                │ Trades │ Wins │ Win rate │ Total P&L│ Avg P&L    │"
    );
    let _ = writeln!(
        out,
        "├─────────────────────────┼────────┼──────┼──────────┼──────────┼────────────┤"
    );
    for l in &lines {
        let _ = writeln!(
            out,
            "│ {:23} │ {:6} │ {:4} │ {:5.0}%   │ {:8} │ {:10} │",
            l.name,
            l.trades,
            l.wins,
            l.win_rate,
            fmt_pnl(l.total_pnl),
            fmt_pnl(l.avg_pnl)
        );
    }
    let _ = writeln!(
        out,
        "└─────────────────────────┴────────┴──────┴──────────┴──────────┴────────────┘"
    );

    // ── Conclusion ───────────────────────────────────────────────────────
    let _ = writeln!(out, "\n───── CONCLUSION ─────\n");

    let lt = lines.iter().find(|l| l.name.starts_with("L/S + Taker"));
    let oi_lt = lines.iter().find(|l| l.name.starts_with("OI Flush + L/S"));

    match (lt, oi_lt) {
        (Some(lt), Some(oi_lt)) => {
            if oi_lt.win_rate > lt.win_rate + 5.0 && oi_lt.avg_pnl > lt.avg_pnl {
                let _ = writeln!(out, "✅ The OI flush filter IMPROVES results:");
                let _ = writeln!(
                    out,
                    "   Win rate: {:.0}% → {:.0}% (+{:.0}pp)",
                    lt.win_rate,
                    oi_lt.win_rate,
                    oi_lt.win_rate - lt.win_rate
                );
                let _ = writeln!(
                    out,
                    "   Avg P&L:  {} → {}",
                    fmt_pnl(lt.avg_pnl),
                    fmt_pnl(oi_lt.avg_pnl)
                );
                let _ = writeln!(out, "   Trades:   {} → {}", lt.trades, oi_lt.trades);
                if oi_lt.trades < lt.trades * 3 / 10 {
                    let _ = writeln!(
                        out,
                        "   ⚠️ Trade count falls sharply — possible overfitting"
                    );
                }
            } else if lt.win_rate >= oi_lt.win_rate || lt.avg_pnl >= oi_lt.avg_pnl {
                let _ = writeln!(out, "❌ The OI flush filter does NOT improve results:");
                let _ = writeln!(
                    out,
                    "   L/S+Taker:          win rate {:.0}%, avg {}, {} trades",
                    lt.win_rate,
                    fmt_pnl(lt.avg_pnl),
                    lt.trades
                );
                let _ = writeln!(
                    out,
                    "   OI Flush+L/S+Taker: win rate {:.0}%, avg {}, {} trades",
                    oi_lt.win_rate,
                    fmt_pnl(oi_lt.avg_pnl),
                    oi_lt.trades
                );
                if lt.trades > oi_lt.trades * 2 {
                    let _ = writeln!(
                        out,
                        "   L/S+Taker produces more trades at comparable quality"
                    );
                }
            } else {
                let _ = writeln!(out, "≈ Results are comparable:");
                let _ = writeln!(
                    out,
                    "   L/S+Taker:          win rate {:.0}%, avg {}, {} trades",
                    lt.win_rate,
                    fmt_pnl(lt.avg_pnl),
                    lt.trades
                );
                let _ = writeln!(
                    out,
                    "   OI Flush+L/S+Taker: win rate {:.0}%, avg {}, {} trades",
                    oi_lt.win_rate,
                    fmt_pnl(oi_lt.avg_pnl),
                    oi_lt.trades
                );
            }
        }
        (Some(_), None) => {
            let _ = writeln!(out, "OI Flush + L/S + Taker: no overlapping trades");
            let _ = writeln!(out, "L/S + Taker stands on its own without the OI flush filter");
        }
        _ => {
            let _ = writeln!(out, "Not enough data for conclusions");
        }
    }

    if hours < 168.0 {
        let _ = writeln!(
            out,
            "\n⚠️ Data: {hours:.0}h — conclusions are preliminary, a week+ is needed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LsRow, OiRow, SymbolMeta, TakerRow};

    #[test]
    fn thresholds_need_enough_datapoints() {
        let mut by_symbol = HashMap::new();
        by_symbol.insert(1_i64, vec![1.0; 10]);
        by_symbol.insert(2_i64, vec![1.0; 30]);
        let fitted = compute_ls_thresholds(&by_symbol);
        assert!(!fitted.contains_key(&1));
        assert!(fitted.contains_key(&2));
    }

    #[test]
    fn threshold_floors_at_min_abs() {
        let mut by_symbol = HashMap::new();
        // Tight ratios around 1.0: adaptive threshold ~1.0, floored to 1.5.
        by_symbol.insert(1_i64, vec![1.0; 30]);
        // Wide ratios: adaptive wins.
        let wide: Vec<f64> = (0..30).map(|i| 1.0 + (i % 10) as f64 * 0.3).collect();
        by_symbol.insert(2_i64, wide);

        let fitted = compute_ls_thresholds(&by_symbol);
        assert_eq!(fitted[&1].threshold, LS_MIN_ABS);
        assert!(fitted[&2].adaptive > LS_MIN_ABS);
        assert_eq!(fitted[&2].threshold, fitted[&2].adaptive);
    }

    #[test]
    fn signals_respect_cooldown_and_join() {
        let db = Database::open_in_memory().unwrap();
        let map = db
            .upsert_symbols(
                &[SymbolMeta {
                    symbol: "BTCUSDT".into(),
                    base_asset: "BTC".into(),
                }],
                0,
            )
            .unwrap();
        let sid = map["BTCUSDT"];

        // 40 OI samples at a flat price.
        let oi_rows: Vec<OiRow> = (0..40)
            .map(|i| OiRow {
                ts: i * POINT_INTERVAL,
                symbol_id: sid,
                oi_contracts: 1.0,
                oi_usd: 1e9,
                mark_price: 100.0,
            })
            .collect();
        db.insert_open_interest(&oi_rows).unwrap();

        // L/S + taker hits at samples 10, 12 (inside cooldown), 20.
        for ts_idx in [10_i64, 12, 20] {
            db.insert_long_short_ratios(&[LsRow {
                ts: ts_idx * POINT_INTERVAL,
                symbol_id: sid,
                ratio: 5.0,
                long_pct: 0.8,
                short_pct: 0.2,
            }])
            .unwrap();
            db.insert_taker_ratios(&[TakerRow {
                ts: ts_idx * POINT_INTERVAL,
                symbol_id: sid,
                buy_sell_ratio: 0.5,
                buy_vol: 1.0,
                sell_vol: 2.0,
            }])
            .unwrap();
        }

        let mut thresholds = HashMap::new();
        thresholds.insert(
            sid,
            LsThreshold {
                mean: 1.0,
                stdev: 0.1,
                adaptive: 1.2,
                threshold: LS_MIN_ABS,
                count: 30,
            },
        );

        let (signals, pairs) = collect_signals(&db, &thresholds).unwrap();
        assert_eq!(pairs, 1);
        // Sample 12 is only 2 indices after 10: suppressed by the cooldown.
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].signal_time, 10 * POINT_INTERVAL);
        assert_eq!(signals[1].signal_time, 20 * POINT_INTERVAL);
        assert_eq!(signals[0].ls_threshold, Some(LS_MIN_ABS));
        // Flat price path: trades stay open.
        assert!(signals[0].trade.is_none());
    }

    #[test]
    fn report_runs_end_to_end() {
        let db = Database::open_in_memory().unwrap();
        let map = db
            .upsert_symbols(
                &[SymbolMeta {
                    symbol: "ETHUSDT".into(),
                    base_asset: "ETH".into(),
                }],
                0,
            )
            .unwrap();
        let sid = map["ETHUSDT"];

        // Price declines steadily so a SHORT entry closes at TP.
        let oi_rows: Vec<OiRow> = (0..40)
            .map(|i| OiRow {
                ts: i * POINT_INTERVAL,
                symbol_id: sid,
                oi_contracts: 1.0,
                oi_usd: 1e9,
                mark_price: 100.0 - i as f64 * 0.5,
            })
            .collect();
        db.insert_open_interest(&oi_rows).unwrap();

        let ls_rows: Vec<LsRow> = (0..30)
            .map(|i| LsRow {
                ts: i * POINT_INTERVAL,
                symbol_id: sid,
                ratio: if i == 10 { 6.0 } else { 1.0 },
                long_pct: 0.6,
                short_pct: 0.4,
            })
            .collect();
        db.insert_long_short_ratios(&ls_rows).unwrap();
        let taker_rows: Vec<TakerRow> = (0..30)
            .map(|i| TakerRow {
                ts: i * POINT_INTERVAL,
                symbol_id: sid,
                buy_sell_ratio: 0.8,
                buy_vol: 1.0,
                sell_vol: 1.25,
            })
            .collect();
        db.insert_taker_ratios(&taker_rows).unwrap();

        let report = run(&db).unwrap();
        assert!(report.contains("L/S + TAKER BACKTEST"));
        assert!(report.contains("Adaptive L/S thresholds"));
        assert!(report.contains("ETHUSDT"));
        assert!(report.contains("STRATEGY COMPARISON"));
        assert_eq!(report, run(&db).unwrap());
    }
}
