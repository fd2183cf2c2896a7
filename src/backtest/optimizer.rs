// =============================================================================
// TP/SL Optimizer — grid search over the take-profit × stop-loss plane
// =============================================================================
//
// For every filter set and every (TP, SL) combination the signals are
// re-simulated from their pre-computed pct paths. Inside the grid a trade
// whose data ran out closes at the last known price (−last_pct for a SHORT),
// so every signal with a non-empty path counts as closed. Combos need at
// least three trades to be ranked.
// =============================================================================

use std::fmt::Write;

use super::{fmt_pnl, Signal};

pub const TP_RANGE: [f64; 15] = [
    0.5, 0.75, 1.0, 1.25, 1.5, 2.0, 2.5, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0,
];
pub const SL_RANGE: [f64; 16] = [
    0.25, 0.5, 0.75, 1.0, 1.25, 1.5, 2.0, 2.5, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0,
];

/// Aggregate outcome of one (TP, SL) combination over a signal set.
#[derive(Debug, Clone, PartialEq)]
pub struct ComboStats {
    pub tp: f64,
    pub sl: f64,
    pub rr: f64,
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
    pub profit_factor: f64,
}

impl ComboStats {
    /// Ranking score for the balanced pick.
    fn balance_score(&self) -> f64 {
        self.total_pnl * self.win_rate / 100.0
    }
}

/// Signal filters the grid search is repeated for.
pub struct FilterDef {
    pub name: &'static str,
    pub apply: fn(&Signal) -> bool,
}

pub fn filters() -> [FilterDef; 4] {
    [
        FilterDef {
            name: "All signals",
            apply: |_| true,
        },
        FilterDef {
            name: "L/S > 2.0",
            apply: |s| s.ls_ratio.is_some_and(|v| v > 2.0),
        },
        FilterDef {
            name: "Taker < 1.0",
            apply: |s| s.taker_ratio.is_some_and(|v| v < 1.0),
        },
        FilterDef {
            name: "L/S > 2.0 + Taker < 1.0",
            apply: |s| {
                s.ls_ratio.is_some_and(|v| v > 2.0) && s.taker_ratio.is_some_and(|v| v < 1.0)
            },
        },
    ]
}

/// Simulate every signal at one (TP, SL). End-of-data closes at the last
/// price. `None` when no signal has a path.
pub fn simulate_combo(signals: &[&Signal], tp: f64, sl: f64) -> Option<ComboStats> {
    let mut results: Vec<f64> = Vec::new();
    for sig in signals {
        if sig.pct_changes.is_empty() {
            continue;
        }
        let mut pnl = None;
        for &pct in &sig.pct_changes {
            if pct <= -tp {
                pnl = Some(tp);
                break;
            }
            if pct >= sl {
                pnl = Some(-sl);
                break;
            }
        }
        // Close at the last known price (SHORT P&L).
        results.push(pnl.unwrap_or(-sig.pct_changes[sig.pct_changes.len() - 1]));
    }

    if results.is_empty() {
        return None;
    }

    let trades = results.len();
    let wins = results.iter().filter(|r| **r > 0.0).count();
    let total_pnl: f64 = results.iter().sum();
    let gross_profit: f64 = results.iter().filter(|r| **r > 0.0).sum();
    let gross_loss: f64 = results.iter().filter(|r| **r <= 0.0).sum::<f64>().abs();

    Some(ComboStats {
        tp,
        sl,
        rr: if sl > 0.0 { tp / sl } else { 999.0 },
        trades,
        wins,
        losses: trades - wins,
        win_rate: wins as f64 / trades as f64 * 100.0,
        total_pnl,
        avg_pnl: total_pnl / trades as f64,
        profit_factor: if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else {
            999.0
        },
    })
}

/// Full grid for one signal set, keeping combos with enough trades.
pub fn optimize_for_signals(signals: &[&Signal], min_trades: usize) -> Vec<ComboStats> {
    let mut combos = Vec::new();
    for tp in TP_RANGE {
        for sl in SL_RANGE {
            if let Some(stats) = simulate_combo(signals, tp, sl) {
                if stats.trades >= min_trades {
                    combos.push(stats);
                }
            }
        }
    }
    combos
}

/// The three overall winners across all filter sets.
#[derive(Debug, Default)]
pub struct BestConfigs {
    pub max_profit: Option<(String, ComboStats)>,
    pub max_win_rate: Option<(String, ComboStats)>,
    pub balanced: Option<(String, ComboStats)>,
}

pub fn pick_best_configs(all_results: &[(&str, Vec<ComboStats>)]) -> BestConfigs {
    let mut best = BestConfigs::default();

    for (filter_name, combos) in all_results {
        if combos.is_empty() {
            continue;
        }

        // A) Max total P&L.
        if let Some(by_pnl) = combos
            .iter()
            .max_by(|a, b| a.total_pnl.total_cmp(&b.total_pnl))
        {
            let better = best
                .max_profit
                .as_ref()
                .map_or(true, |(_, b)| by_pnl.total_pnl > b.total_pnl);
            if better {
                best.max_profit = Some((filter_name.to_string(), by_pnl.clone()));
            }
        }

        // B) Max win rate among profitable combos with at least 5 trades.
        let eligible: Vec<&ComboStats> = combos
            .iter()
            .filter(|c| c.trades >= 5 && c.total_pnl > 0.0)
            .collect();
        if let Some(by_wr) = eligible.iter().max_by(|a, b| {
            (a.win_rate, a.total_pnl)
                .partial_cmp(&(b.win_rate, b.total_pnl))
                .unwrap_or(std::cmp::Ordering::Equal)
        }) {
            let better = best
                .max_win_rate
                .as_ref()
                .map_or(true, |(_, b)| by_wr.win_rate > b.win_rate);
            if better {
                best.max_win_rate = Some((filter_name.to_string(), (*by_wr).clone()));
            }
        }

        // C) Balanced, with tiered relaxation: full criteria first, then drop
        //    the R:R floor, then lower the trade minimum.
        let tiers: [fn(&ComboStats) -> bool; 3] = [
            |c| c.win_rate > 50.0 && c.total_pnl > 0.0 && c.rr >= 1.5 && c.trades >= 5,
            |c| c.win_rate > 50.0 && c.total_pnl > 0.0 && c.trades >= 5,
            |c| c.win_rate > 50.0 && c.total_pnl > 0.0 && c.trades >= 3,
        ];
        for tier in tiers {
            let candidates: Vec<&ComboStats> = combos.iter().filter(|c| tier(c)).collect();
            if let Some(by_bal) = candidates
                .iter()
                .max_by(|a, b| a.balance_score().total_cmp(&b.balance_score()))
            {
                let better = best
                    .balanced
                    .as_ref()
                    .map_or(true, |(_, b)| by_bal.balance_score() > b.balance_score());
                if better {
                    best.balanced = Some((filter_name.to_string(), (*by_bal).clone()));
                }
                break; // strictest satisfiable tier for this filter
            }
        }
    }

    best
}

// ── Report rendering ─────────────────────────────────────────────────────────

fn write_table(out: &mut String, title: &str, combos: &[ComboStats], top_n: usize) {
    if combos.is_empty() {
        let _ = writeln!(out, "\n{title}: no data");
        return;
    }
    let _ = writeln!(out, "\n{title}:");
    let _ = writeln!(
        out,
        "┌────┬───────┬───────┬──────────┬──────────┬──────────┬────────────────┐"
    );
    let _ = writeln!(
        out,
        "│  # │  TP%  │  SL%  │ R:R      │ Win rate │ Total P&L│ Avg per trade  │"
    );
    let _ = writeln!(
        out,
        "├────┼───────┼───────┼──────────┼──────────┼──────────┼────────────────┤"
    );
    for (i, c) in combos.iter().take(top_n).enumerate() {
        let rr = format!("{:.1}:1", c.rr);
        let _ = writeln!(
            out,
            "│ {:2} │ {:5.2} │ {:5.2} │ {:8} │ {:5.0}%   │ {:8} │ {:14} │",
            i + 1,
            c.tp,
            c.sl,
            rr,
            c.win_rate,
            fmt_pnl(c.total_pnl),
            fmt_pnl(c.avg_pnl)
        );
    }
    let _ = writeln!(
        out,
        "└────┴───────┴───────┴──────────┴──────────┴──────────┴────────────────┘"
    );
}

/// Coarse total-P&L heatmap over the unfiltered set.
fn write_heatmap(out: &mut String, combos: &[ComboStats]) {
    let tp_show = [0.5, 1.0, 2.0, 3.0, 5.0, 7.0, 10.0];
    let sl_show = [0.25, 0.5, 1.0, 1.5, 2.0, 3.0, 5.0, 7.0, 10.0];

    let _ = writeln!(out, "\nP&L heatmap (all signals):");
    let mut header = String::from("         SL:");
    for sl in sl_show {
        let _ = write!(header, " {sl:5.2}");
    }
    let _ = writeln!(out, "{header}");

    for tp in tp_show {
        let mut row = format!("TP {tp:5.2}:");
        for sl in sl_show {
            let cell = combos
                .iter()
                .find(|c| c.tp == tp && c.sl == sl)
                .map(|c| format!(" {:+5.1}", c.total_pnl))
                .unwrap_or_else(|| "   n/a".to_string());
            row.push_str(&cell);
        }
        let _ = writeln!(out, "{row}");
    }
    let _ = writeln!(out, "(+) = profit, (-) = loss");
}

fn write_config(out: &mut String, marker: &str, label: &str, entry: &Option<(String, ComboStats)>) {
    let Some((filter, c)) = entry else { return };
    let _ = writeln!(out, "\n{marker} {label}:");
    let _ = writeln!(out, "   TP={}% SL={}% | {filter}", c.tp, c.sl);
    let _ = writeln!(
        out,
        "   {} trades | Win rate {:.0}% | P&L {} | Avg {}",
        c.trades,
        c.win_rate,
        fmt_pnl(c.total_pnl),
        fmt_pnl(c.avg_pnl)
    );
}

/// Run the full grid search and append the report to `out`.
pub fn run_optimization(signals: &[Signal], hours: f64, out: &mut String) {
    let _ = writeln!(out, "\n\n═══ TP/SL OPTIMIZATION ═══");

    let mut all_results: Vec<(&str, Vec<ComboStats>)> = Vec::new();

    for filter in filters() {
        let filtered: Vec<&Signal> = signals.iter().filter(|s| (filter.apply)(s)).collect();

        if filtered.len() < 3 {
            let _ = writeln!(
                out,
                "\n──── {} ({} trades) ──── skipped (< 3)",
                filter.name,
                filtered.len()
            );
            all_results.push((filter.name, Vec::new()));
            continue;
        }

        let is_all = filter.name == "All signals";
        let top_n = if is_all { 10 } else { 5 };
        let min_trades_wr = if is_all { 5 } else { 3 };

        let combos = optimize_for_signals(&filtered, 3);
        let _ = writeln!(out, "\n──── {} ({} trades) ────", filter.name, filtered.len());

        let mut by_pnl = combos.clone();
        by_pnl.sort_by(|a, b| b.total_pnl.total_cmp(&a.total_pnl));
        write_table(out, &format!("TOP-{top_n} by TOTAL P&L"), &by_pnl, top_n);

        let mut by_wr: Vec<ComboStats> = combos
            .iter()
            .filter(|c| c.trades >= min_trades_wr)
            .cloned()
            .collect();
        by_wr.sort_by(|a, b| {
            (b.win_rate, b.total_pnl)
                .partial_cmp(&(a.win_rate, a.total_pnl))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        write_table(
            out,
            &format!("TOP-{top_n} by WIN RATE (min {min_trades_wr} trades)"),
            &by_wr,
            top_n,
        );

        if is_all {
            write_heatmap(out, &combos);
        }

        all_results.push((filter.name, combos));
    }

    let best = pick_best_configs(&all_results);
    let _ = writeln!(out, "\n═══ BEST CONFIGURATIONS ═══");
    write_config(out, "\u{1f3c6}", "MAX PROFIT", &best.max_profit);
    write_config(
        out,
        "\u{1f3af}",
        "MAX WIN RATE (profitable)",
        &best.max_win_rate,
    );
    write_config(
        out,
        "\u{2696}\u{fe0f}",
        "BEST BALANCE (win rate > 50% AND P&L > 0 AND R:R >= 1.5)",
        &best.balanced,
    );

    if hours < 168.0 {
        let _ = writeln!(
            out,
            "\n\u{26a0}\u{fe0f} Data: {hours:.0} hours. Preliminary recommendation."
        );
        let _ = writeln!(
            out,
            "   7+ days needed for reliability (200+ unfiltered trades)."
        );
    } else {
        let _ = writeln!(out, "\n\u{26a0}\u{fe0f} Data: {hours:.0} hours.");
    }
}
