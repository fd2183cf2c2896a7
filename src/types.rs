// =============================================================================
// Shared types used across the Meridian sentinel
// =============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current UNIX timestamp in whole seconds.
pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Alert severity. Ordering is total: `Low < Medium < High < Critical`, so the
/// greatest severity is dequeued first from a max-heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Parse a severity label; unknown labels fall back to `Medium`.
    pub fn parse(s: &str) -> Self {
        match s {
            "critical" => Self::Critical,
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Medium,
        }
    }

    /// Marker prefix used in alert messages.
    pub fn icon(&self) -> &'static str {
        match self {
            Self::Critical => "\u{1f534}",
            Self::High => "\u{1f7e0}",
            Self::Medium => "\u{1f7e1}",
            Self::Low => "\u{26aa}",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kinds of anomaly the engine can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    FundingSpike,
    OiSurge,
    LsExtreme,
    TakerExtreme,
    CombinedOverheat,
    CombinedCapitulation,
    OiFlush,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FundingSpike => "funding_spike",
            Self::OiSurge => "oi_surge",
            Self::LsExtreme => "ls_extreme",
            Self::TakerExtreme => "taker_extreme",
            Self::CombinedOverheat => "combined_overheat",
            Self::CombinedCapitulation => "combined_capitulation",
            Self::OiFlush => "oi_flush",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "funding_spike" => Self::FundingSpike,
            "oi_surge" => Self::OiSurge,
            "ls_extreme" => Self::LsExtreme,
            "taker_extreme" => Self::TakerExtreme,
            "combined_overheat" => Self::CombinedOverheat,
            "combined_capitulation" => Self::CombinedCapitulation,
            "oi_flush" => Self::OiFlush,
            _ => return None,
        })
    }

    /// Header label for alert messages, e.g. "FUNDING SPIKE".
    pub fn label(&self) -> String {
        self.as_str().to_uppercase().replace('_', " ")
    }
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which live-cache slot a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Oi,
    Funding,
    Ls,
    Taker,
}

/// One symbol as reported by exchange info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolMeta {
    pub symbol: String,
    pub base_asset: String,
}

/// An active symbol row from the store.
#[derive(Debug, Clone)]
pub struct SymbolRef {
    pub id: i64,
    pub symbol: String,
}

/// One entry of the aggregated premium-index response.
#[derive(Debug, Clone)]
pub struct PremiumIndex {
    pub symbol: String,
    pub mark_price: f64,
    pub last_funding_rate: f64,
    pub next_funding_time: i64,
}

// ── Metric sample rows (batch-insert shapes) ─────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct OiRow {
    pub ts: i64,
    pub symbol_id: i64,
    pub oi_contracts: f64,
    pub oi_usd: f64,
    pub mark_price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FundingRow {
    pub ts: i64,
    pub symbol_id: i64,
    pub rate: f64,
    pub next_funding_time: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LsRow {
    pub ts: i64,
    pub symbol_id: i64,
    pub ratio: f64,
    pub long_pct: f64,
    pub short_pct: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TakerRow {
    pub ts: i64,
    pub symbol_id: i64,
    pub buy_sell_ratio: f64,
    pub buy_vol: f64,
    pub sell_vol: f64,
}

/// One OI sample as replayed by the backtester.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OiPoint {
    pub ts: i64,
    pub oi_usd: f64,
    pub mark_price: f64,
}

/// An anomaly produced by the engine, ready for batch insert.
#[derive(Debug, Clone)]
pub struct AnomalyRow {
    pub detected_at: i64,
    pub cycle_ts: i64,
    pub symbol_id: i64,
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub value: f64,
    pub description: String,
}

/// An anomaly read back from the store (joined with its symbol).
#[derive(Debug, Clone)]
pub struct AnomalyRecord {
    pub id: i64,
    pub detected_at: i64,
    pub cycle_ts: i64,
    pub symbol: String,
    pub kind: String,
    pub severity: Severity,
    pub value: f64,
    pub description: String,
}

/// Per-symbol baseline statistics recomputed daily by the stats worker.
#[derive(Debug, Clone, Default)]
pub struct SymbolStats {
    pub symbol_id: i64,
    pub updated_at: i64,
    pub mean_funding: Option<f64>,
    pub std_funding: Option<f64>,
    pub mean_oi_change_1h: Option<f64>,
    pub std_oi_change_1h: Option<f64>,
    pub mean_ls_ratio: Option<f64>,
    pub std_ls_ratio: Option<f64>,
    pub mean_taker_ratio: Option<f64>,
    pub std_taker_ratio: Option<f64>,
    pub avg_oi_usd: f64,
}

/// One row of per-cycle collector accounting.
#[derive(Debug, Clone)]
pub struct CollectorStats {
    pub cycle_ts: i64,
    pub duration_sec: f64,
    pub requests_ok: u32,
    pub requests_fail: u32,
    pub pairs_collected: u32,
    pub anomalies_found: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_order_is_total() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn severity_roundtrip() {
        for s in [
            Severity::Low,
            Severity::Medium,
            Severity::High,
            Severity::Critical,
        ] {
            assert_eq!(Severity::parse(s.as_str()), s);
        }
        // Unknown labels degrade to medium.
        assert_eq!(Severity::parse("shrug"), Severity::Medium);
    }

    #[test]
    fn anomaly_kind_roundtrip() {
        for k in [
            AnomalyKind::FundingSpike,
            AnomalyKind::OiSurge,
            AnomalyKind::LsExtreme,
            AnomalyKind::TakerExtreme,
            AnomalyKind::CombinedOverheat,
            AnomalyKind::CombinedCapitulation,
            AnomalyKind::OiFlush,
        ] {
            assert_eq!(AnomalyKind::parse(k.as_str()), Some(k));
        }
        assert_eq!(AnomalyKind::parse("nope"), None);
    }

    #[test]
    fn kind_label_is_spaced_uppercase() {
        assert_eq!(AnomalyKind::FundingSpike.label(), "FUNDING SPIKE");
        assert_eq!(AnomalyKind::OiFlush.label(), "OI FLUSH");
    }
}
