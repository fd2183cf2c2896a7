// =============================================================================
// OI Flush Backtest — SHORT on buildup-then-flush patterns
// =============================================================================
//
// Scans every pair's stored OI series with the same window evaluation the
// live detector uses, entering SHORT at the mark price of the sample where
// the flush is first visible. A per-pair cooldown of SIGNAL_COOLDOWN sample
// indices separates signals. The report ends with the TP/SL grid search.
// =============================================================================

use std::collections::HashMap;
use std::fmt::Write;

use anyhow::Result;

use crate::anomaly::flush::{evaluate_window, pct_changes, FlushParams};
use crate::db::Database;
use crate::types::OiPoint;

use super::{
    build_price_path, fmt_exit, fmt_pnl, fmt_price, optimizer, simulate_trade, ts_to_str, Signal,
    MIN_HISTORY, POINT_INTERVAL, SIGNAL_COOLDOWN,
};

pub const TAKE_PROFIT: f64 = 3.0;
pub const STOP_LOSS: f64 = 1.5;
/// 0 disables the hold limit: trades run to TP, SL, or end of data.
pub const MAX_HOLD_POINTS: usize = 0;
/// Window span in samples (two hours of cycles).
pub const WINDOW_SIZE: usize = 24;

pub fn flush_params() -> FlushParams {
    FlushParams {
        buildup_threshold: 3.0,
        min_points: 12,
        drop_pct: 2.0,
        current_max: 2.0,
    }
}

/// One qualifying window within a pair's series.
#[derive(Debug, Clone, Copy)]
pub struct FlushHit {
    /// Index of the window's last sample (the entry sample).
    pub idx: usize,
    pub peak_pct: f64,
    pub current_pct: f64,
    pub buildup_points: usize,
}

/// Enumerate flush windows over one OI series, enforcing the index cooldown.
pub fn find_signals(points: &[OiPoint], params: &FlushParams) -> Vec<FlushHit> {
    let mut hits = Vec::new();
    let mut last_signal_idx = -(SIGNAL_COOLDOWN as i64);

    for i in (WINDOW_SIZE - 1)..points.len() {
        if (i as i64) - last_signal_idx < SIGNAL_COOLDOWN as i64 {
            continue;
        }
        let window = &points[i + 1 - WINDOW_SIZE..=i];
        let oi: Vec<f64> = window.iter().map(|p| p.oi_usd).collect();
        let pcts = pct_changes(&oi);
        if pcts.is_empty() {
            continue;
        }
        if let Some(sig) = evaluate_window(&pcts, params) {
            hits.push(FlushHit {
                idx: i,
                peak_pct: sig.peak_pct,
                current_pct: sig.current_pct,
                buildup_points: sig.run_len,
            });
            last_signal_idx = i as i64;
        }
    }
    hits
}

/// Load every pair, enumerate signals, simulate trades. Returns the signals
/// (sorted by time) and the number of pairs that had enough history.
pub fn collect_signals(db: &Database) -> Result<(Vec<Signal>, usize)> {
    let params = flush_params();
    let symbols = db.active_symbols()?;
    let mut signals = Vec::new();
    let mut pairs_with_data = 0usize;

    for sym in &symbols {
        let points = db.oi_series(sym.id)?;
        if points.len() < MIN_HISTORY {
            continue;
        }
        pairs_with_data += 1;

        for hit in find_signals(&points, &params) {
            let entry = points[hit.idx];
            if entry.mark_price <= 0.0 {
                continue;
            }
            let (path, pcts) = build_price_path(&points, hit.idx, entry.mark_price);
            let trade = simulate_trade(&pcts, &path, TAKE_PROFIT, STOP_LOSS, MAX_HOLD_POINTS);

            signals.push(Signal {
                symbol: sym.symbol.clone(),
                signal_time: entry.ts,
                entry_price: entry.mark_price,
                oi_usd: entry.oi_usd,
                funding_rate: db.funding_at_or_before(sym.id, entry.ts)?,
                ls_ratio: db.ls_at_or_before(sym.id, entry.ts)?,
                taker_ratio: db.taker_at_or_before(sym.id, entry.ts)?,
                oi_peak_pct: hit.peak_pct,
                oi_current_pct: hit.current_pct,
                buildup_minutes: hit.buildup_points as i64 * (POINT_INTERVAL / 60),
                ls_threshold: None,
                pct_changes: pcts,
                path,
                trade,
            });
        }
    }

    signals.sort_by_key(|s| s.signal_time);
    Ok((signals, pairs_with_data))
}

/// Run the whole backtest and return the report text.
pub fn run(db: &Database) -> Result<String> {
    let mut out = String::new();

    let Some((min_ts, max_ts)) = db.oi_time_range()? else {
        let _ = writeln!(out, "No open interest data in the store.");
        return Ok(out);
    };
    let (signals, pairs_with_data) = collect_signals(db)?;
    let hours = (max_ts - min_ts) as f64 / 3600.0;
    let params = flush_params();

    let _ = writeln!(out, "\n═══ OI FLUSH BACKTEST ═══");
    let _ = writeln!(
        out,
        "Period: {} — {} ({hours:.0}h)",
        ts_to_str(min_ts),
        ts_to_str(max_ts)
    );
    let _ = writeln!(
        out,
        "Pairs with data: {pairs_with_data} | Min history: {MIN_HISTORY} points ({} min)",
        MIN_HISTORY as i64 * (POINT_INTERVAL / 60)
    );
    let _ = writeln!(
        out,
        "Parameters: buildup >={}% x {} min, drop >={}%, TP={TAKE_PROFIT}%, SL={STOP_LOSS}%, hold=∞",
        params.buildup_threshold,
        params.min_points as i64 * (POINT_INTERVAL / 60),
        params.drop_pct
    );

    if signals.is_empty() {
        let _ = writeln!(out, "\nNo signals found.");
        return Ok(out);
    }

    // ── Signal list ──────────────────────────────────────────────────────
    let _ = writeln!(out, "\n───── SIGNALS ─────\n");
    let mut closed: Vec<&Signal> = Vec::new();
    let mut open_trades = 0usize;

    for (i, sig) in signals.iter().enumerate() {
        let funding_s = sig
            .funding_rate
            .map(|f| format!("{:+.3}%", f * 100.0))
            .unwrap_or_else(|| "n/a".to_string());
        let ls_s = sig
            .ls_ratio
            .map(|v| format!("{v:.2}"))
            .unwrap_or_else(|| "n/a".to_string());
        let taker_s = sig
            .taker_ratio
            .map(|v| format!("{v:.2}"))
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
            "     OI: peak +{:.1}% ({} min) → now {:+.1}%",
            sig.oi_peak_pct, sig.buildup_minutes, sig.oi_current_pct
        );
        let _ = writeln!(out, "     Funding: {funding_s} | L/S: {ls_s} | Taker: {taker_s}");

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
    write_totals(&mut out, &signals, &closed, open_trades);

    // ── Per-filter win rates ─────────────────────────────────────────────
    let filter_defs: [(&str, fn(&&&Signal) -> bool); 6] = [
        ("Funding > 0.01%:", |s| {
            s.funding_rate.is_some_and(|f| f > 0.0001)
        }),
        ("Funding <= 0.01%:", |s| {
            s.funding_rate.is_some_and(|f| f <= 0.0001)
        }),
        ("L/S > 2.0:", |s| s.ls_ratio.is_some_and(|v| v > 2.0)),
        ("L/S <= 2.0:", |s| s.ls_ratio.is_some_and(|v| v <= 2.0)),
        ("Taker < 1.0:", |s| s.taker_ratio.is_some_and(|v| v < 1.0)),
        ("Taker >= 1.0:", |s| s.taker_ratio.is_some_and(|v| v >= 1.0)),
    ];
    let _ = writeln!(out, "\nBy filter (which signals pay off):");
    for (label, pred) in filter_defs {
        let subset: Vec<_> = closed.iter().filter(pred).collect();
        if !subset.is_empty() {
            let wins = subset
                .iter()
                .filter(|s| s.trade.as_ref().is_some_and(|t| t.pnl_pct > 0.0))
                .count();
            let _ = writeln!(
                out,
                "  {label:25} win rate {:5.0}% ({} trades)",
                wins as f64 / subset.len() as f64 * 100.0,
                subset.len()
            );
        }
    }

    write_top_pairs(&mut out, &closed);
    write_recommendation(&mut out, &closed, hours);

    optimizer::run_optimization(&signals, hours, &mut out);
    Ok(out)
}

fn write_totals(out: &mut String, signals: &[Signal], closed: &[&Signal], open_trades: usize) {
    let _ = writeln!(out, "───── TOTALS ─────\n");
    let _ = writeln!(out, "Signals: {}", signals.len());
    let _ = writeln!(
        out,
        "Closed trades: {} ({open_trades} still open)",
        closed.len()
    );
    if closed.is_empty() {
        return;
    }

    let _ = writeln!(out, "\nBy exit:");
    for kind in ["TP", "SL", "TIMEOUT"] {
        let cnt = closed
            .iter()
            .filter(|s| s.trade.as_ref().is_some_and(|t| t.exit.as_str() == kind))
            .count();
        let _ = writeln!(
            out,
            "  {kind:8} {cnt:3} ({:.0}%)",
            cnt as f64 / closed.len() as f64 * 100.0
        );
    }

    let pnls: Vec<f64> = closed
        .iter()
        .filter_map(|s| s.trade.as_ref().map(|t| t.pnl_pct))
        .collect();
    let total: f64 = pnls.iter().sum();
    let wins = pnls.iter().filter(|p| **p > 0.0).count();
    let best = closed
        .iter()
        .max_by(|a, b| {
            let pa = a.trade.as_ref().map(|t| t.pnl_pct).unwrap_or(f64::MIN);
            let pb = b.trade.as_ref().map(|t| t.pnl_pct).unwrap_or(f64::MIN);
            pa.total_cmp(&pb)
        })
        .unwrap();
    let worst = closed
        .iter()
        .min_by(|a, b| {
            let pa = a.trade.as_ref().map(|t| t.pnl_pct).unwrap_or(f64::MAX);
            let pb = b.trade.as_ref().map(|t| t.pnl_pct).unwrap_or(f64::MAX);
            pa.total_cmp(&pb)
        })
        .unwrap();

    let _ = writeln!(out, "\nP&L:");
    let _ = writeln!(out, "  Total:    {}", fmt_pnl(total));
    let _ = writeln!(out, "  Average:  {} per trade", fmt_pnl(total / pnls.len() as f64));
    let _ = writeln!(
        out,
        "  Best:     {} {}",
        best.symbol,
        fmt_pnl(best.trade.as_ref().map(|t| t.pnl_pct).unwrap_or(0.0))
    );
    let _ = writeln!(
        out,
        "  Worst:    {} {}",
        worst.symbol,
        fmt_pnl(worst.trade.as_ref().map(|t| t.pnl_pct).unwrap_or(0.0))
    );
    let _ = writeln!(
        out,
        "  Win rate: {:.0}%",
        wins as f64 / pnls.len() as f64 * 100.0
    );
}

fn write_top_pairs(out: &mut String, closed: &[&Signal]) {
    let mut pair_stats: HashMap<&str, (usize, usize)> = HashMap::new();
    for s in closed {
        let e = pair_stats.entry(s.symbol.as_str()).or_default();
        e.0 += 1;
        if s.trade.as_ref().is_some_and(|t| t.pnl_pct > 0.0) {
            e.1 += 1;
        }
    }
    let mut top: Vec<_> = pair_stats.into_iter().collect();
    top.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.0.cmp(b.0)));

    let _ = writeln!(out, "\nTop pairs by signal count:");
    for (sym, (count, wins)) in top.into_iter().take(10) {
        let _ = writeln!(
            out,
            "  {sym:15} {count:2} signals, win rate {:.0}%",
            wins as f64 / count as f64 * 100.0
        );
    }
}

fn write_recommendation(out: &mut String, closed: &[&Signal], hours: f64) {
    let combos: [(&str, fn(&&&Signal) -> bool); 5] = [
        ("OI flush (no filters)", |_| true),
        ("OI flush + Funding > 0.01%", |s| {
            s.funding_rate.is_some_and(|f| f > 0.0001)
        }),
        ("OI flush + L/S > 2.0", |s| s.ls_ratio.is_some_and(|v| v > 2.0)),
        ("OI flush + Taker < 1.0", |s| {
            s.taker_ratio.is_some_and(|v| v < 1.0)
        }),
        ("OI flush + L/S > 2.0 + Taker < 1.0", |s| {
            s.ls_ratio.is_some_and(|v| v > 2.0) && s.taker_ratio.is_some_and(|v| v < 1.0)
        }),
    ];

    let mut scored: Vec<(&str, usize, f64, f64)> = Vec::new();
    for (label, pred) in combos {
        let subset: Vec<_> = closed.iter().filter(pred).collect();
        if subset.len() >= 2 {
            let pnls: Vec<f64> = subset
                .iter()
                .filter_map(|s| s.trade.as_ref().map(|t| t.pnl_pct))
                .collect();
            let wins = pnls.iter().filter(|p| **p > 0.0).count();
            scored.push((
                label,
                subset.len(),
                wins as f64 / subset.len() as f64 * 100.0,
                pnls.iter().sum::<f64>() / pnls.len() as f64,
            ));
        }
    }

    if let Some(bc) = scored.iter().max_by(|a, b| {
        (a.2, a.3)
            .partial_cmp(&(b.2, b.3))
            .unwrap_or(std::cmp::Ordering::Equal)
    }) {
        let _ = writeln!(out, "\n───── RECOMMENDATION ─────\n");
        let _ = writeln!(out, "Best filter combination:");
        let _ = writeln!(out, "  {}", bc.0);
        let _ = writeln!(
            out,
            "  Trades: {} | Win rate: {:.0}% | Avg P&L: {}",
            bc.1,
            bc.2,
            fmt_pnl(bc.3)
        );
        if hours < 168.0 {
            let _ = writeln!(
                out,
                "  ⚠️ Thin data ({hours:.0}h) — a full week is needed for statistics"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OiRow, SymbolMeta};

    /// Base-then-S1 shape: 6 flat points, then the documented 24-point
    /// buildup/collapse profile.
    fn flush_series(base_ts: i64, base_oi: f64) -> Vec<OiPoint> {
        let profile = [
            0.5, 0.8, 1.2, 1.9, 2.5, 3.1, 3.4, 3.6, 3.8, 4.0, 4.3, 4.5, 4.7, 4.8, 4.9, 5.0, 5.1,
            5.2, 4.0, 3.0, 2.2, 1.4, 0.8, 0.3,
        ];
        let mut points: Vec<OiPoint> = (0..6)
            .map(|i| OiPoint {
                ts: base_ts + i * POINT_INTERVAL,
                oi_usd: base_oi,
                mark_price: 100.0,
            })
            .collect();
        points.extend(profile.iter().enumerate().map(|(i, p)| OiPoint {
            ts: base_ts + (6 + i as i64) * POINT_INTERVAL,
            oi_usd: base_oi * (1.0 + p / 100.0),
            mark_price: 100.0,
        }));
        points
    }

    #[test]
    fn one_pattern_yields_one_signal() {
        let points = flush_series(0, 1e9);
        let hits = find_signals(&points, &flush_params());
        assert_eq!(hits.len(), 1);
        assert!((hits[0].peak_pct - 5.2).abs() < 0.1);
        assert!(hits[0].buildup_points >= 12);
        // The signal lands in the collapse tail of the series.
        assert!(hits[0].idx >= 26);
    }

    #[test]
    fn cooldown_separates_repeated_patterns() {
        // Two full patterns back to back: the second must also fire since
        // they sit more than SIGNAL_COOLDOWN indices apart.
        let mut points = flush_series(0, 1e9);
        let offset = points.len() as i64;
        points.extend(flush_series(offset * POINT_INTERVAL, 1e9));
        let hits = find_signals(&points, &flush_params());
        assert_eq!(hits.len(), 2);
        assert!(hits[1].idx as i64 - hits[0].idx as i64 >= SIGNAL_COOLDOWN as i64);
    }

    #[test]
    fn flat_series_has_no_signals() {
        let points: Vec<OiPoint> = (0..60)
            .map(|i| OiPoint {
                ts: i * POINT_INTERVAL,
                oi_usd: 1e9,
                mark_price: 100.0,
            })
            .collect();
        assert!(find_signals(&points, &flush_params()).is_empty());
    }

    #[test]
    fn report_runs_end_to_end_on_seeded_store() {
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

        // Flush pattern followed by a falling price path so the SHORT closes.
        let mut points = flush_series(0, 1e9);
        let n = points.len() as i64;
        for i in 0..6 {
            points.push(OiPoint {
                ts: (n + i) * POINT_INTERVAL,
                oi_usd: 0.99e9,
                mark_price: 100.0 - (i + 1) as f64,
            });
        }
        let rows: Vec<OiRow> = points
            .iter()
            .map(|p| OiRow {
                ts: p.ts,
                symbol_id: sid,
                oi_contracts: p.oi_usd / p.mark_price,
                oi_usd: p.oi_usd,
                mark_price: p.mark_price,
            })
            .collect();
        db.insert_open_interest(&rows).unwrap();

        let report = run(&db).unwrap();
        assert!(report.contains("OI FLUSH BACKTEST"));
        assert!(report.contains("SIGNALS"));
        assert!(report.contains("BTCUSDT"));
        assert!(report.contains("TOTALS"));

        // Determinism: a second run produces the identical report.
        assert_eq!(report, run(&db).unwrap());
    }
}
