// =============================================================================
// Meridian Futures Sentinel — market-microstructure monitor library
// =============================================================================
//
// Polls per-symbol metrics from the Binance USDT-M futures API, persists them
// as SQLite timeseries, derives per-symbol baselines, and alerts on
// deviations and OI-flush patterns. The backtest binaries replay the stored
// series offline.
// =============================================================================

pub mod anomaly;
pub mod archive;
pub mod backtest;
pub mod binance;
pub mod collector;
pub mod config;
pub mod db;
pub mod notifier;
pub mod stats_worker;
pub mod summary;
pub mod symbols;
pub mod types;

pub use config::Config;
pub use db::Database;
