// =============================================================================
// Configuration — environment-driven settings with typed defaults
// =============================================================================
//
// Every tunable lives here and every field can be overridden from the
// environment (usually via `.env`, loaded by the caller before construction).
// Unparseable values fall back to the default with a warning rather than
// aborting startup.
// =============================================================================

use std::str::FromStr;

use tracing::warn;

use crate::types::Severity;

/// Binance USDT-M futures REST base.
pub const BINANCE_FAPI_BASE: &str = "https://fapi.binance.com";

/// Response codes that trigger a retry with back-off.
pub const RETRY_CODES: [u16; 5] = [429, 500, 502, 503, 504];

/// Back-off ceiling in seconds.
pub const RETRY_MAX_WAIT: u64 = 30;

/// Read an environment variable, parsing into `T`; fall back to `default` on
/// absence or parse failure.
fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparseable env override, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_string(key: &str) -> String {
    std::env::var(key).unwrap_or_default()
}

/// Runtime settings for the whole sentinel.
#[derive(Debug, Clone)]
pub struct Config {
    // --- Chat transport -----------------------------------------------------
    pub telegram_bot_token: String,
    pub admin_id: i64,

    // --- Outbound HTTP ------------------------------------------------------
    pub proxy_url: String,

    // --- Collection ---------------------------------------------------------
    /// Cycle period in seconds.
    pub collect_interval: u64,
    /// Pause between per-symbol task dispatches, in seconds.
    pub request_delay: f64,
    /// Shared cap on in-flight per-symbol exchange calls.
    pub max_concurrent: usize,
    /// Whole-cycle watchdog in seconds.
    pub watchdog_timeout: u64,

    // --- Hot filter ---------------------------------------------------------
    /// 24h quote volume above which a symbol is tagged hot.
    pub hot_volume_threshold: f64,
    /// Symbol universe refresh interval in seconds.
    pub symbols_refresh_interval: u64,

    // --- Anomaly detection --------------------------------------------------
    /// Minimum stored OI samples before a symbol is evaluated at all.
    pub min_history_for_anomaly: u32,
    pub funding_spike_threshold: f64,
    pub oi_surge_threshold: f64,
    pub ls_extreme_threshold: f64,
    pub taker_extreme_threshold: f64,

    // --- OI flush detection -------------------------------------------------
    /// Minimum pct-above-base for a window point to count as buildup.
    pub oi_buildup_threshold: f64,
    /// Minimum contiguous buildup run length.
    pub oi_buildup_min_points: usize,
    /// Minimum drop from the run peak to the current point, in pct.
    pub oi_flush_drop_pct: f64,
    /// Current pct must be below this for a flush to fire.
    pub oi_flush_current_max: f64,
    /// Window size in OI samples.
    pub oi_flush_lookback: usize,
    /// Flush-specific cooldown in seconds.
    pub oi_flush_cooldown: i64,

    // --- Notifications ------------------------------------------------------
    /// Default per-(symbol, kind) cooldown in seconds.
    pub alert_cooldown: i64,
    /// Severity floor for notifying non-flush anomalies.
    pub min_alert_severity: Severity,
    /// Pause between outgoing messages in seconds.
    pub notifier_delay: f64,
    pub notifier_max_queue: usize,
    /// Recent same-kind messages above this collapse into a mass alert.
    pub mass_alert_threshold: usize,
    /// Mass-alert sliding window in seconds.
    pub mass_alert_window: i64,

    // --- Severity policy (avg OI in USD) ------------------------------------
    pub severity_critical_oi: f64,
    pub severity_medium_oi: f64,
    pub severity_top_n: usize,

    // --- Stats worker -------------------------------------------------------
    pub stats_worker_hour_utc: u32,
    pub stats_min_points: usize,
    pub stats_lookback_days: i64,

    // --- Daily summary ------------------------------------------------------
    pub daily_summary_hour_utc: u32,

    // --- Archive ------------------------------------------------------------
    pub archive_after_days: i64,

    // --- Storage ------------------------------------------------------------
    pub db_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telegram_bot_token: String::new(),
            admin_id: 0,
            proxy_url: String::new(),
            collect_interval: 300,
            request_delay: 0.05,
            max_concurrent: 10,
            watchdog_timeout: 240,
            hot_volume_threshold: 1_000_000.0,
            symbols_refresh_interval: 4 * 3600,
            min_history_for_anomaly: 12,
            funding_spike_threshold: 0.001,
            oi_surge_threshold: 0.10,
            ls_extreme_threshold: 3.0,
            taker_extreme_threshold: 2.0,
            oi_buildup_threshold: 3.0,
            oi_buildup_min_points: 12,
            oi_flush_drop_pct: 2.0,
            oi_flush_current_max: 2.0,
            oi_flush_lookback: 24,
            oi_flush_cooldown: 1800,
            alert_cooldown: 3600,
            min_alert_severity: Severity::High,
            notifier_delay: 0.5,
            notifier_max_queue: 100,
            mass_alert_threshold: 5,
            mass_alert_window: 60,
            severity_critical_oi: 10_000_000_000.0,
            severity_medium_oi: 100_000_000.0,
            severity_top_n: 20,
            stats_worker_hour_utc: 4,
            stats_min_points: 100,
            stats_lookback_days: 7,
            daily_summary_hour_utc: 9,
            archive_after_days: 30,
            db_path: "market_data.db".to_string(),
        }
    }
}

impl Config {
    /// Build a config from the process environment on top of the defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            telegram_bot_token: env_string("TELEGRAM_BOT_TOKEN"),
            admin_id: env_or("ADMIN_ID", d.admin_id),
            proxy_url: env_string("PROXY_URL"),
            collect_interval: env_or("COLLECT_INTERVAL", d.collect_interval),
            request_delay: env_or("REQUEST_DELAY", d.request_delay),
            max_concurrent: env_or("MAX_CONCURRENT", d.max_concurrent),
            watchdog_timeout: env_or("WATCHDOG_TIMEOUT", d.watchdog_timeout),
            hot_volume_threshold: env_or("HOT_VOLUME_THRESHOLD", d.hot_volume_threshold),
            symbols_refresh_interval: env_or(
                "SYMBOLS_REFRESH_INTERVAL",
                d.symbols_refresh_interval,
            ),
            min_history_for_anomaly: env_or("MIN_HISTORY_FOR_ANOMALY", d.min_history_for_anomaly),
            funding_spike_threshold: env_or("FUNDING_SPIKE_THRESHOLD", d.funding_spike_threshold),
            oi_surge_threshold: env_or("OI_SURGE_THRESHOLD", d.oi_surge_threshold),
            ls_extreme_threshold: env_or("LS_EXTREME_THRESHOLD", d.ls_extreme_threshold),
            taker_extreme_threshold: env_or("TAKER_EXTREME_THRESHOLD", d.taker_extreme_threshold),
            oi_buildup_threshold: env_or("OI_BUILDUP_THRESHOLD", d.oi_buildup_threshold),
            oi_buildup_min_points: env_or("OI_BUILDUP_MIN_POINTS", d.oi_buildup_min_points),
            oi_flush_drop_pct: env_or("OI_FLUSH_DROP_PCT", d.oi_flush_drop_pct),
            oi_flush_current_max: env_or("OI_FLUSH_CURRENT_MAX", d.oi_flush_current_max),
            oi_flush_lookback: env_or("OI_FLUSH_LOOKBACK", d.oi_flush_lookback),
            oi_flush_cooldown: env_or("OI_FLUSH_COOLDOWN", d.oi_flush_cooldown),
            alert_cooldown: env_or("ALERT_COOLDOWN", d.alert_cooldown),
            min_alert_severity: std::env::var("MIN_ALERT_SEVERITY")
                .map(|s| Severity::parse(&s))
                .unwrap_or(d.min_alert_severity),
            notifier_delay: env_or("NOTIFIER_DELAY", d.notifier_delay),
            notifier_max_queue: env_or("NOTIFIER_MAX_QUEUE", d.notifier_max_queue),
            mass_alert_threshold: env_or("MASS_ALERT_THRESHOLD", d.mass_alert_threshold),
            mass_alert_window: env_or("MASS_ALERT_WINDOW", d.mass_alert_window),
            severity_critical_oi: env_or("SEVERITY_CRITICAL_OI", d.severity_critical_oi),
            severity_medium_oi: env_or("SEVERITY_MEDIUM_OI", d.severity_medium_oi),
            severity_top_n: env_or("SEVERITY_TOP_N", d.severity_top_n),
            stats_worker_hour_utc: env_or("STATS_WORKER_HOUR_UTC", d.stats_worker_hour_utc),
            stats_min_points: env_or("STATS_MIN_POINTS", d.stats_min_points),
            stats_lookback_days: env_or("STATS_LOOKBACK_DAYS", d.stats_lookback_days),
            daily_summary_hour_utc: env_or("DAILY_SUMMARY_HOUR_UTC", d.daily_summary_hour_utc),
            archive_after_days: env_or("ARCHIVE_AFTER_DAYS", d.archive_after_days),
            db_path: std::env::var("DB_PATH").unwrap_or(d.db_path),
        }
    }

    /// Kind-specific cooldown: OI flush carries its own, everything else uses
    /// the default alert cooldown.
    pub fn cooldown_for(&self, kind: crate::types::AnomalyKind) -> i64 {
        match kind {
            crate::types::AnomalyKind::OiFlush => self.oi_flush_cooldown,
            _ => self.alert_cooldown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AnomalyKind;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.collect_interval, 300);
        assert_eq!(cfg.max_concurrent, 10);
        assert_eq!(cfg.watchdog_timeout, 240);
        assert_eq!(cfg.symbols_refresh_interval, 14_400);
        assert_eq!(cfg.min_history_for_anomaly, 12);
        assert_eq!(cfg.oi_flush_lookback, 24);
        assert_eq!(cfg.min_alert_severity, Severity::High);
        assert_eq!(cfg.notifier_max_queue, 100);
        assert!((cfg.hot_volume_threshold - 1e6).abs() < f64::EPSILON);
        assert!((cfg.severity_critical_oi - 1e10).abs() < f64::EPSILON);
        assert_eq!(cfg.db_path, "market_data.db");
    }

    #[test]
    fn kind_specific_cooldowns() {
        let cfg = Config::default();
        assert_eq!(cfg.cooldown_for(AnomalyKind::OiFlush), 1800);
        assert_eq!(cfg.cooldown_for(AnomalyKind::FundingSpike), 3600);
        assert_eq!(cfg.cooldown_for(AnomalyKind::CombinedOverheat), 3600);
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("COLLECT_INTERVAL", "60");
        std::env::set_var("MIN_ALERT_SEVERITY", "critical");
        std::env::set_var("OI_BUILDUP_MIN_POINTS", "not-a-number");
        let cfg = Config::from_env();
        assert_eq!(cfg.collect_interval, 60);
        assert_eq!(cfg.min_alert_severity, Severity::Critical);
        // Bad values fall back to the default.
        assert_eq!(cfg.oi_buildup_min_points, 12);
        std::env::remove_var("COLLECT_INTERVAL");
        std::env::remove_var("MIN_ALERT_SEVERITY");
        std::env::remove_var("OI_BUILDUP_MIN_POINTS");
    }
}
