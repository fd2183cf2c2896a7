// =============================================================================
// Binance USDT-M Futures API — public market-data endpoints
// =============================================================================

pub mod client;
pub mod counters;

pub use client::{FuturesClient, LsSample, TakerSample};
pub use counters::{RequestCounters, RequestSnapshot};
