// =============================================================================
// Anomaly Engine — adaptive thresholds, combined detectors, OI-flush window
// =============================================================================
//
// Evaluates one symbol per call with the freshest values the cycle produced.
// Scalar detectors compare against per-symbol adaptive thresholds
// (|mean| + 3σ two-sided, mean + 3σ one-sided) falling back to static
// defaults when the stats row or its σ is missing. Combined detectors fire on
// the *evaluation* flags, so cooldown suppression of an individual kind never
// hides an overheat or capitulation.
//
// Every emission arms a per-(symbol, kind) cooldown; matches inside the
// cooldown are suppressed silently. The cooldown map is process-local.
// =============================================================================

pub mod flush;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::db::Database;
use crate::types::{AnomalyKind, AnomalyRow, Severity, SymbolStats};

use flush::{evaluate_window, interpretation, pct_changes, FlushParams};

/// Freshest values known for a symbol in this cycle (this cycle's rows when
/// present, otherwise the live cache).
#[derive(Debug, Clone, Copy, Default)]
pub struct FreshValues {
    pub oi_usd: Option<f64>,
    pub funding: Option<f64>,
    pub ls_ratio: Option<f64>,
    pub taker_ratio: Option<f64>,
}

/// Effective detector threshold: adaptive when the baseline carries a usable
/// σ, the static default otherwise.
pub fn effective_threshold(
    mean: Option<f64>,
    std: Option<f64>,
    fallback: f64,
    two_sided: bool,
) -> f64 {
    match (mean, std) {
        (Some(m), Some(s)) if s > 0.0 => {
            if two_sided {
                m.abs() + 3.0 * s
            } else {
                m + 3.0 * s
            }
        }
        _ => fallback,
    }
}

/// Stateful detector owning the cooldown map.
pub struct AnomalyEngine {
    cfg: Arc<Config>,
    cooldowns: Mutex<HashMap<(i64, AnomalyKind), i64>>,
}

impl AnomalyEngine {
    pub fn new(cfg: Arc<Config>) -> Self {
        Self {
            cfg,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// Forget all cooldown state (tests).
    pub fn reset_cooldowns(&self) {
        self.cooldowns.lock().clear();
    }

    fn cooldown_ready(&self, symbol_id: i64, kind: AnomalyKind, now: i64) -> bool {
        let last = self
            .cooldowns
            .lock()
            .get(&(symbol_id, kind))
            .copied()
            .unwrap_or(0);
        now - last >= self.cfg.cooldown_for(kind)
    }

    fn arm_cooldown(&self, symbol_id: i64, kind: AnomalyKind, now: i64) {
        self.cooldowns.lock().insert((symbol_id, kind), now);
    }

    /// Severity policy from the symbol's average OI. A missing stats row
    /// yields `Medium`.
    pub fn severity_for(
        &self,
        symbol_id: i64,
        stats: Option<&SymbolStats>,
        top_oi_ids: &HashSet<i64>,
    ) -> Severity {
        let Some(st) = stats else {
            return Severity::Medium;
        };
        if st.avg_oi_usd > self.cfg.severity_critical_oi {
            Severity::Critical
        } else if top_oi_ids.contains(&symbol_id) {
            Severity::High
        } else if st.avg_oi_usd > self.cfg.severity_medium_oi {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// Evaluate one symbol. Returns the anomalies to persist (cooldown
    /// suppression already applied).
    #[allow(clippy::too_many_arguments)]
    pub fn detect(
        &self,
        db: &Database,
        cycle_ts: i64,
        symbol_id: i64,
        symbol: &str,
        fresh: &FreshValues,
        stats: Option<&SymbolStats>,
        top_oi_ids: &HashSet<i64>,
        now: i64,
    ) -> Result<Vec<AnomalyRow>> {
        if db.count_oi(symbol_id)? < self.cfg.min_history_for_anomaly {
            return Ok(Vec::new());
        }

        let severity = self.severity_for(symbol_id, stats, top_oi_ids);
        let mut out = Vec::new();

        let mut has_funding_spike = false;
        let mut has_oi_surge = false;
        let mut has_ls_extreme = false;

        // 1. Funding spike (two-sided).
        if let Some(funding) = fresh.funding {
            let threshold = effective_threshold(
                stats.and_then(|s| s.mean_funding),
                stats.and_then(|s| s.std_funding),
                self.cfg.funding_spike_threshold,
                true,
            );
            if funding.abs() > threshold {
                has_funding_spike = true;
                if self.cooldown_ready(symbol_id, AnomalyKind::FundingSpike, now) {
                    out.push(AnomalyRow {
                        detected_at: now,
                        cycle_ts,
                        symbol_id,
                        kind: AnomalyKind::FundingSpike,
                        severity,
                        value: funding,
                        description: format!("Funding {funding:.6} (threshold {threshold:.6})"),
                    });
                    self.arm_cooldown(symbol_id, AnomalyKind::FundingSpike, now);
                }
            }
        }

        // 2. OI surge/drop over one hour (two-sided).
        if let Some(oi_usd) = fresh.oi_usd.filter(|v| *v > 0.0) {
            if let Some(prev_oi) = db
                .oi_at_or_before(symbol_id, cycle_ts - 3600)?
                .filter(|v| *v > 0.0)
            {
                let change = (oi_usd - prev_oi) / prev_oi;
                let threshold = effective_threshold(
                    stats.and_then(|s| s.mean_oi_change_1h),
                    stats.and_then(|s| s.std_oi_change_1h),
                    self.cfg.oi_surge_threshold,
                    true,
                );
                if change.abs() > threshold {
                    has_oi_surge = true;
                    let direction = if change > 0.0 { "surge" } else { "drop" };
                    if self.cooldown_ready(symbol_id, AnomalyKind::OiSurge, now) {
                        out.push(AnomalyRow {
                            detected_at: now,
                            cycle_ts,
                            symbol_id,
                            kind: AnomalyKind::OiSurge,
                            severity,
                            value: change,
                            description: format!(
                                "OI {direction} {:+.2}% (${oi_usd:.0} -> prev ${prev_oi:.0})",
                                change * 100.0
                            ),
                        });
                        self.arm_cooldown(symbol_id, AnomalyKind::OiSurge, now);
                    }
                }
            }
        }

        // 3. L/S extreme (one-sided).
        if let Some(ls) = fresh.ls_ratio {
            let threshold = effective_threshold(
                stats.and_then(|s| s.mean_ls_ratio),
                stats.and_then(|s| s.std_ls_ratio),
                self.cfg.ls_extreme_threshold,
                false,
            );
            if ls > threshold {
                has_ls_extreme = true;
                if self.cooldown_ready(symbol_id, AnomalyKind::LsExtreme, now) {
                    out.push(AnomalyRow {
                        detected_at: now,
                        cycle_ts,
                        symbol_id,
                        kind: AnomalyKind::LsExtreme,
                        severity,
                        value: ls,
                        description: format!("L/S ratio {ls:.2} (threshold {threshold:.2})"),
                    });
                    self.arm_cooldown(symbol_id, AnomalyKind::LsExtreme, now);
                }
            }
        }

        // 4. Taker extreme (one-sided).
        if let Some(taker) = fresh.taker_ratio {
            let threshold = effective_threshold(
                stats.and_then(|s| s.mean_taker_ratio),
                stats.and_then(|s| s.std_taker_ratio),
                self.cfg.taker_extreme_threshold,
                false,
            );
            if taker > threshold
                && self.cooldown_ready(symbol_id, AnomalyKind::TakerExtreme, now)
            {
                out.push(AnomalyRow {
                    detected_at: now,
                    cycle_ts,
                    symbol_id,
                    kind: AnomalyKind::TakerExtreme,
                    severity,
                    value: taker,
                    description: format!("Taker ratio {taker:.2} (threshold {threshold:.2})"),
                });
                self.arm_cooldown(symbol_id, AnomalyKind::TakerExtreme, now);
            }
        }

        // 5. Combined overheat: all three directional flags at once.
        if has_funding_spike
            && has_oi_surge
            && has_ls_extreme
            && self.cooldown_ready(symbol_id, AnomalyKind::CombinedOverheat, now)
        {
            out.push(AnomalyRow {
                detected_at: now,
                cycle_ts,
                symbol_id,
                kind: AnomalyKind::CombinedOverheat,
                severity,
                value: 0.0,
                description: format!(
                    "OVERHEAT: funding={:.6}, OI surge, L/S={:.2}",
                    fresh.funding.unwrap_or(0.0),
                    fresh.ls_ratio.unwrap_or(0.0)
                ),
            });
            self.arm_cooldown(symbol_id, AnomalyKind::CombinedOverheat, now);
        }

        // 6. Combined capitulation: OI moving + funding flipped sign against
        //    the last rate recorded before this cycle.
        if has_oi_surge && has_funding_spike {
            if let (Some(prev), Some(cur)) =
                (db.funding_before(symbol_id, cycle_ts)?, fresh.funding)
            {
                if prev * cur < 0.0
                    && self.cooldown_ready(symbol_id, AnomalyKind::CombinedCapitulation, now)
                {
                    out.push(AnomalyRow {
                        detected_at: now,
                        cycle_ts,
                        symbol_id,
                        kind: AnomalyKind::CombinedCapitulation,
                        severity,
                        value: 0.0,
                        description: format!(
                            "CAPITULATION: funding flipped {prev:.6} -> {cur:.6}, OI dropping"
                        ),
                    });
                    self.arm_cooldown(symbol_id, AnomalyKind::CombinedCapitulation, now);
                }
            }
        }

        // 7. OI flush over the recent window.
        if let Some(row) = self.detect_flush(db, cycle_ts, symbol_id, fresh, severity, now)? {
            out.push(row);
        }

        if !out.is_empty() {
            debug!(symbol, count = out.len(), "anomalies detected");
        }
        Ok(out)
    }

    /// Run the flush window detector over the last `oi_flush_lookback` OI
    /// samples.
    fn detect_flush(
        &self,
        db: &Database,
        cycle_ts: i64,
        symbol_id: i64,
        fresh: &FreshValues,
        severity: Severity,
        now: i64,
    ) -> Result<Option<AnomalyRow>> {
        let lookback = self.cfg.oi_flush_lookback;
        let window = db.recent_oi_window(symbol_id, lookback)?;
        if window.len() < lookback {
            return Ok(None);
        }

        let oi: Vec<f64> = window.iter().map(|(_, v)| *v).collect();
        let pcts = pct_changes(&oi);
        let params = FlushParams {
            buildup_threshold: self.cfg.oi_buildup_threshold,
            min_points: self.cfg.oi_buildup_min_points,
            drop_pct: self.cfg.oi_flush_drop_pct,
            current_max: self.cfg.oi_flush_current_max,
        };
        let Some(sig) = evaluate_window(&pcts, &params) else {
            return Ok(None);
        };
        if !self.cooldown_ready(symbol_id, AnomalyKind::OiFlush, now) {
            return Ok(None);
        }

        let minutes_per_point = self.cfg.collect_interval as f64 / 60.0;
        let peak_oi_usd = oi[sig.peak_idx];
        let current_oi_usd = *oi.last().unwrap_or(&0.0);
        let buildup_min = sig.run_len as f64 * minutes_per_point;
        let drop_min = (oi.len() - 1 - sig.run_end) as f64 * minutes_per_point;

        let funding_s = fresh
            .funding
            .map(|f| format!("{:+.3}%", f * 100.0))
            .unwrap_or_else(|| "n/a".to_string());
        let ls_s = fresh
            .ls_ratio
            .map(|v| format!("{v:.2}"))
            .unwrap_or_else(|| "n/a".to_string());
        let taker_s = fresh
            .taker_ratio
            .map(|v| format!("{v:.2}"))
            .unwrap_or_else(|| "n/a".to_string());
        let reading = interpretation(fresh.funding, fresh.ls_ratio, fresh.taker_ratio);

        let description = format!(
            "OI FLUSH: peak ${peak_oi_usd:.0} ({:+.1}%) after {buildup_min:.0} min buildup, \
             now ${current_oi_usd:.0} ({:+.1}%), drop {:.1}% in {drop_min:.0} min\n\
             Funding: {funding_s} | L/S: {ls_s} | Taker: {taker_s}\n\
             Likely {reading}",
            sig.peak_pct,
            sig.current_pct,
            sig.drop_pct(),
        );

        self.arm_cooldown(symbol_id, AnomalyKind::OiFlush, now);
        Ok(Some(AnomalyRow {
            detected_at: now,
            cycle_ts,
            symbol_id,
            kind: AnomalyKind::OiFlush,
            severity,
            value: sig.drop_pct(),
            description,
        }))
    }
}
