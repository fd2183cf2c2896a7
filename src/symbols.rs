// =============================================================================
// Symbol Registry — universe refresh and hot-volume tagging
// =============================================================================
//
// Refreshing pulls exchange info (active USDT perpetuals) and the 24h ticker,
// upserts the symbol rows, and tags a symbol hot when its quote volume
// exceeds HOT_VOLUME_THRESHOLD. Hot symbols get the richer L/S + taker data
// during collection. The collector asks needs_refresh() at the top of every
// cycle; a refresh that fails leaves the stamp untouched so the next cycle
// retries.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::binance::FuturesClient;
use crate::config::Config;
use crate::db::Database;
use crate::types::now_ts;

pub struct SymbolRegistry {
    cfg: Arc<Config>,
    last_refresh: Mutex<Option<Instant>>,
}

impl SymbolRegistry {
    pub fn new(cfg: Arc<Config>) -> Self {
        Self {
            cfg,
            last_refresh: Mutex::new(None),
        }
    }

    /// True when the universe has never been loaded or has gone stale.
    pub fn needs_refresh(&self) -> bool {
        match *self.last_refresh.lock() {
            None => true,
            Some(at) => at.elapsed().as_secs() >= self.cfg.symbols_refresh_interval,
        }
    }

    fn mark_refreshed(&self) {
        *self.last_refresh.lock() = Some(Instant::now());
    }

    /// Fetch exchange info + ticker, update symbols and hot flags. Returns
    /// the {symbol → id} map; on exchange-info failure the stored map is
    /// returned unchanged and the staleness stamp is left as-is.
    pub async fn refresh(
        &self,
        client: &FuturesClient,
        db: &Database,
    ) -> Result<HashMap<String, i64>> {
        let info = match client.exchange_info().await {
            Ok(info) => info,
            Err(e) => {
                error!(error = %e, "failed to fetch exchangeInfo");
                return db.symbol_map();
            }
        };

        let sym_map = db.upsert_symbols(&info, now_ts())?;
        info!(count = sym_map.len(), "symbols updated");

        match client.ticker_24h().await {
            Ok(ticker) => {
                let hot_map: HashMap<String, (bool, f64)> = sym_map
                    .keys()
                    .map(|sym| {
                        let vol = ticker.get(sym).copied().unwrap_or(0.0);
                        (sym.clone(), (vol > self.cfg.hot_volume_threshold, vol))
                    })
                    .collect();
                db.update_hot_status(&hot_map)?;
                let hot_count = hot_map.values().filter(|(is_hot, _)| *is_hot).count();
                info!(hot = hot_count, total = hot_map.len(), "hot filter applied");
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch 24h ticker, hot flags unchanged");
            }
        }

        self.mark_refreshed();
        Ok(sym_map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_registry_needs_refresh() {
        let reg = SymbolRegistry::new(Arc::new(Config::default()));
        assert!(reg.needs_refresh());
        reg.mark_refreshed();
        assert!(!reg.needs_refresh());
    }

    #[test]
    fn zero_interval_is_always_stale() {
        let cfg = Config {
            symbols_refresh_interval: 0,
            ..Config::default()
        };
        let reg = SymbolRegistry::new(Arc::new(cfg));
        reg.mark_refreshed();
        assert!(reg.needs_refresh());
    }
}
