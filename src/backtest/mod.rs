// =============================================================================
// Backtest Core — price paths, deterministic SHORT simulation, formatting
// =============================================================================
//
// Both strategies (OI flush, L/S + taker) replay the stored OI series: a
// signal enters SHORT at the mark price of its OI sample, then walks forward
// through the subsequent samples. The simulation is a pure function of the
// price path and (TP, SL, MAX_HOLD); re-running yields identical output.
// =============================================================================

pub mod ls_taker;
pub mod oi_flush;
pub mod optimizer;
pub mod report;

use chrono::{TimeZone, Utc};

use crate::types::OiPoint;

/// Seconds between stored samples (one collection cycle).
pub const POINT_INTERVAL: i64 = 300;

/// Minimum OI samples for a pair to be analysed at all.
pub const MIN_HISTORY: usize = 24;

/// Sample indices between two signals of the same pair.
pub const SIGNAL_COOLDOWN: usize = 6;

/// How a simulated trade closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    TakeProfit,
    StopLoss,
    /// MAX_HOLD_POINTS reached: an open trade closed at market, booking the
    /// unrealised P&L at that index.
    Timeout,
}

impl ExitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TakeProfit => "TP",
            Self::StopLoss => "SL",
            Self::Timeout => "TIMEOUT",
        }
    }

    pub fn marker(&self) -> &'static str {
        match self {
            Self::TakeProfit => "\u{2705} TP",
            Self::StopLoss => "\u{274c} SL",
            Self::Timeout => "\u{23f1} TIMEOUT",
        }
    }
}

/// One closed simulated trade.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub exit: ExitKind,
    pub exit_price: f64,
    pub exit_time: i64,
    pub pnl_pct: f64,
    pub hold_points: usize,
}

/// One enumerated entry signal with its pre-computed forward path.
#[derive(Debug, Clone)]
pub struct Signal {
    pub symbol: String,
    pub signal_time: i64,
    pub entry_price: f64,
    pub oi_usd: f64,
    pub funding_rate: Option<f64>,
    pub ls_ratio: Option<f64>,
    pub taker_ratio: Option<f64>,
    /// Flush context (zeroed for the L/S + taker strategy).
    pub oi_peak_pct: f64,
    pub oi_current_pct: f64,
    pub buildup_minutes: i64,
    /// Adaptive threshold that fired (L/S + taker strategy only).
    pub ls_threshold: Option<f64>,
    /// Forward pct-changes of mark price vs entry, one per later sample.
    pub pct_changes: Vec<f64>,
    /// Forward (timestamp, price) pairs aligned with `pct_changes`.
    pub path: Vec<(i64, f64)>,
    pub trade: Option<Trade>,
}

/// Forward (timestamp, price) pairs and pct-changes after `signal_idx`.
pub fn build_price_path(
    points: &[OiPoint],
    signal_idx: usize,
    entry_price: f64,
) -> (Vec<(i64, f64)>, Vec<f64>) {
    let mut path = Vec::new();
    let mut pct_changes = Vec::new();
    for p in &points[signal_idx + 1..] {
        if p.mark_price > 0.0 {
            path.push((p.ts, p.mark_price));
            pct_changes.push((p.mark_price - entry_price) / entry_price * 100.0);
        }
    }
    (path, pct_changes)
}

/// Walk the path of a SHORT entry. At each index TP is checked before SL;
/// `max_hold == 0` disables the timeout. Returns `None` when the data runs
/// out first (the trade is still open).
pub fn simulate_trade(
    pct_changes: &[f64],
    path: &[(i64, f64)],
    tp: f64,
    sl: f64,
    max_hold: usize,
) -> Option<Trade> {
    for (k, &pct) in pct_changes.iter().enumerate() {
        let pts = k + 1;
        if pct <= -tp {
            return Some(Trade {
                exit: ExitKind::TakeProfit,
                exit_price: path[k].1,
                exit_time: path[k].0,
                pnl_pct: tp,
                hold_points: pts,
            });
        }
        if pct >= sl {
            return Some(Trade {
                exit: ExitKind::StopLoss,
                exit_price: path[k].1,
                exit_time: path[k].0,
                pnl_pct: -sl,
                hold_points: pts,
            });
        }
        if max_hold > 0 && pts >= max_hold {
            return Some(Trade {
                exit: ExitKind::Timeout,
                exit_price: path[k].1,
                exit_time: path[k].0,
                pnl_pct: -pct,
                hold_points: pts,
            });
        }
    }
    None
}

// ── Report formatting helpers ────────────────────────────────────────────────

pub fn ts_to_str(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

pub fn fmt_pnl(pnl: f64) -> String {
    if pnl >= 0.0 {
        format!("+{pnl:.2}%")
    } else {
        format!("{pnl:.2}%")
    }
}

pub fn fmt_price(p: f64) -> String {
    if p >= 1000.0 {
        format!("${p:.2}")
    } else if p >= 1.0 {
        format!("${p:.4}")
    } else {
        format!("${p:.6}")
    }
}

pub fn fmt_exit(trade: &Trade) -> String {
    let hold_min = trade.hold_points as i64 * (POINT_INTERVAL / 60);
    format!(
        "{} {} in {} min",
        trade.exit.marker(),
        fmt_pnl(trade.pnl_pct),
        hold_min
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(ts: i64, oi: f64, price: f64) -> OiPoint {
        OiPoint {
            ts,
            oi_usd: oi,
            mark_price: price,
        }
    }

    #[test]
    fn short_trade_hits_take_profit() {
        // Entry 100, prices fall through -2% at the third sample.
        let points = vec![
            pt(0, 1e9, 100.0),
            pt(300, 1e9, 100.5),
            pt(600, 1e9, 99.0),
            pt(900, 1e9, 98.0),
            pt(1200, 1e9, 97.0),
        ];
        let (path, pcts) = build_price_path(&points, 0, 100.0);
        assert_eq!(pcts.len(), 4);
        assert!((pcts[0] - 0.5).abs() < 1e-12);
        assert!((pcts[2] + 2.0).abs() < 1e-12);

        let trade = simulate_trade(&pcts, &path, 2.0, 1.5, 0).expect("closed");
        assert_eq!(trade.exit, ExitKind::TakeProfit);
        assert!((trade.pnl_pct - 2.0).abs() < 1e-12);
        assert_eq!(trade.hold_points, 3);
        assert_eq!(trade.exit_time, 900);
        assert!((trade.exit_price - 98.0).abs() < 1e-12);
    }

    #[test]
    fn short_trade_hits_stop_loss_on_rally() {
        let pcts = [0.5, 1.0, 2.1];
        let path = [(300, 100.5), (600, 101.0), (900, 102.1)];
        let trade = simulate_trade(&pcts, &path, 3.0, 2.0, 0).expect("closed");
        assert_eq!(trade.exit, ExitKind::StopLoss);
        assert!((trade.pnl_pct + 2.0).abs() < 1e-12);
        assert_eq!(trade.hold_points, 3);
    }

    #[test]
    fn boundary_pcts_trigger_their_exits() {
        // Exactly -TP closes as TP, exactly +SL closes as SL.
        let path = [(300, 98.0)];
        let tp = simulate_trade(&[-2.0], &path, 2.0, 1.5, 0).unwrap();
        assert_eq!(tp.exit, ExitKind::TakeProfit);

        let sl = simulate_trade(&[1.5], &path, 2.0, 1.5, 0).unwrap();
        assert_eq!(sl.exit, ExitKind::StopLoss);
    }

    #[test]
    fn timeout_books_unrealised_pnl() {
        // Price drifts up 0.8% by the timeout index: SHORT books -0.8%.
        let pcts = [0.5, 0.8, -5.0];
        let path = [(300, 100.5), (600, 100.8), (900, 95.0)];
        let trade = simulate_trade(&pcts, &path, 3.0, 2.0, 2).expect("closed");
        assert_eq!(trade.exit, ExitKind::Timeout);
        assert!((trade.pnl_pct + 0.8).abs() < 1e-12);
        assert_eq!(trade.hold_points, 2);
    }

    #[test]
    fn exhausted_data_leaves_trade_open() {
        let pcts = [0.5, -1.0];
        let path = [(300, 100.5), (600, 99.0)];
        assert!(simulate_trade(&pcts, &path, 3.0, 2.0, 0).is_none());
    }

    #[test]
    fn simulation_is_deterministic() {
        let pcts = [0.4, -0.7, 1.9, -3.2];
        let path = [(300, 1.0), (600, 1.0), (900, 1.0), (1200, 1.0)];
        let a = simulate_trade(&pcts, &path, 3.0, 2.0, 0);
        let b = simulate_trade(&pcts, &path, 3.0, 2.0, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn price_path_skips_nonpositive_prices() {
        let points = vec![pt(0, 1.0, 100.0), pt(300, 1.0, 0.0), pt(600, 1.0, 99.0)];
        let (path, pcts) = build_price_path(&points, 0, 100.0);
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].0, 600);
        assert!((pcts[0] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn formatting_helpers() {
        assert_eq!(fmt_pnl(2.0), "+2.00%");
        assert_eq!(fmt_pnl(-1.5), "-1.50%");
        assert_eq!(fmt_price(50_000.0), "$50000.00");
        assert_eq!(fmt_price(3.25), "$3.2500");
        assert_eq!(fmt_price(0.1234567), "$0.123457");
        assert_eq!(ts_to_str(0), "1970-01-01 00:00");
    }
}
