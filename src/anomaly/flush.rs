// =============================================================================
// OI-Flush Window Evaluation — sustained buildup followed by a sharp drop
// =============================================================================
//
// Operates on a window of percent-changes relative to the window's first OI
// sample: pct[i] = (oi[i] - oi[0]) / oi[0] * 100. A flush requires:
//
//   1. the longest contiguous run with pct >= buildup_threshold spans at
//      least min_points samples,
//   2. that run ends within the last min_points indices of the window (the
//      buildup reaches toward "now"),
//   3. the current (last) pct sits below current_max,
//   4. the run's peak pct minus the current pct is at least drop_pct.
//
// Shared by the live anomaly engine and the offline backtester so both see
// identical signals on identical data.

/// Tunables for one evaluation pass.
#[derive(Debug, Clone, Copy)]
pub struct FlushParams {
    /// Minimum pct-above-base to count as buildup.
    pub buildup_threshold: f64,
    /// Minimum contiguous buildup run length.
    pub min_points: usize,
    /// Minimum drop from the run peak to the current point.
    pub drop_pct: f64,
    /// The current pct must be strictly below this.
    pub current_max: f64,
}

/// A detected flush within one window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlushSignal {
    /// Highest pct within the buildup run.
    pub peak_pct: f64,
    /// Index of that peak within the window.
    pub peak_idx: usize,
    /// pct of the window's last sample.
    pub current_pct: f64,
    /// Length of the buildup run in samples.
    pub run_len: usize,
    /// Index of the run's last sample.
    pub run_end: usize,
}

impl FlushSignal {
    /// Peak-to-current drop in percentage points.
    pub fn drop_pct(&self) -> f64 {
        self.peak_pct - self.current_pct
    }
}

/// Percent-changes of `oi` relative to its first element. Empty when the base
/// is non-positive.
pub fn pct_changes(oi: &[f64]) -> Vec<f64> {
    let Some(&base) = oi.first() else {
        return Vec::new();
    };
    if base <= 0.0 {
        return Vec::new();
    }
    oi.iter().map(|&v| (v - base) / base * 100.0).collect()
}

/// Evaluate one window of pct-changes. Returns a signal only when all four
/// flush conditions hold.
pub fn evaluate_window(pcts: &[f64], p: &FlushParams) -> Option<FlushSignal> {
    let n = pcts.len();
    if n < p.min_points {
        return None;
    }

    let current_pct = *pcts.last()?;
    if current_pct >= p.current_max {
        return None;
    }

    // Longest contiguous run at or above the buildup threshold; ties keep the
    // earliest run.
    let mut best: Option<FlushSignal> = None;
    let mut run_len = 0usize;
    let mut run_peak = f64::MIN;
    let mut run_peak_idx = 0usize;

    for (i, &pct) in pcts.iter().enumerate() {
        if pct >= p.buildup_threshold {
            run_len += 1;
            if pct > run_peak {
                run_peak = pct;
                run_peak_idx = i;
            }
            let longer = best.map_or(true, |b| run_len > b.run_len);
            if longer {
                best = Some(FlushSignal {
                    peak_pct: run_peak,
                    peak_idx: run_peak_idx,
                    current_pct,
                    run_len,
                    run_end: i,
                });
            }
        } else {
            run_len = 0;
            run_peak = f64::MIN;
        }
    }

    let sig = best?;
    if sig.run_len < p.min_points {
        return None;
    }
    // The buildup must reach toward the window's end.
    if sig.run_end + p.min_points < n {
        return None;
    }
    if sig.drop_pct() < p.drop_pct {
        return None;
    }
    Some(sig)
}

/// One-line reading of the flush given its metric context.
pub fn interpretation(funding: Option<f64>, ls_ratio: Option<f64>, taker: Option<f64>) -> &'static str {
    if let (Some(f), Some(ls)) = (funding, ls_ratio) {
        if f > 0.0 && ls > 1.5 {
            return "long liquidation";
        }
        if f < 0.0 && ls < 1.0 {
            return "short liquidation";
        }
    }
    if let Some(t) = taker {
        if t < 1.0 {
            return "aggressive spot selling";
        }
    }
    "position flush"
}
