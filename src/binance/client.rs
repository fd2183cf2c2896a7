// =============================================================================
// Binance Futures REST Client — public endpoints with bounded retry
// =============================================================================
//
// All six endpoints the sentinel consumes are public market data; no request
// signing is involved. Retry policy:
//
//   429 / 500 / 502 / 503 / 504  -> honour Retry-After if present, otherwise
//                                   exponential back-off 1s doubling to 30s,
//                                   up to 5 attempts.
//   403                          -> configuration error (set PROXY_URL);
//                                   logged, no retry.
//   404                          -> legitimate "no data", returned as absent.
//
// Each attempt runs under the client's 15-second timeout.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::config::{BINANCE_FAPI_BASE, RETRY_CODES, RETRY_MAX_WAIT};
use crate::types::{PremiumIndex, SymbolMeta};

const MAX_ATTEMPTS: u32 = 5;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Latest top long/short position ratio sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LsSample {
    pub ratio: f64,
    pub long_pct: f64,
    pub short_pct: f64,
}

/// Latest aggressive-taker buy/sell volume ratio sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TakerSample {
    pub buy_sell_ratio: f64,
    pub buy_vol: f64,
    pub sell_vol: f64,
}

/// Thin request layer over the Binance USDT-M futures API.
#[derive(Clone)]
pub struct FuturesClient {
    client: reqwest::Client,
    base_url: String,
}

impl FuturesClient {
    /// Build a client, optionally routed through `proxy_url`.
    pub fn new(proxy_url: &str) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if !proxy_url.is_empty() {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy_url)
                    .with_context(|| format!("invalid PROXY_URL: {proxy_url}"))?,
            );
            debug!("outbound requests routed through proxy");
        }
        let client = builder.build().expect("failed to build reqwest client");
        Ok(Self {
            client,
            base_url: BINANCE_FAPI_BASE.to_string(),
        })
    }

    /// Point the client at a different base URL (tests).
    #[allow(dead_code)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    // -------------------------------------------------------------------------
    // Core request with retry
    // -------------------------------------------------------------------------

    /// GET `path` with `query`, applying the retry policy. `Ok(None)` means
    /// the endpoint legitimately has no data (404).
    async fn request(&self, path: &str, query: &[(&str, String)]) -> Result<Option<Value>> {
        let url = format!("{}{}", self.base_url, path);
        let mut wait = 1.0_f64;

        for attempt in 1..=MAX_ATTEMPTS {
            let resp = match self.client.get(&url).query(query).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(url = %url, attempt, error = %e, "request error, backing off");
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                    wait = (wait * 2.0).min(RETRY_MAX_WAIT as f64);
                    continue;
                }
            };

            let status = resp.status();

            if status.is_success() {
                let body: Value = resp
                    .json()
                    .await
                    .with_context(|| format!("failed to parse response from {path}"))?;
                return Ok(Some(body));
            }

            if status.as_u16() == 403 {
                error!(url = %url, "403 Forbidden — check PROXY_URL / network configuration");
                anyhow::bail!("403 Forbidden for {path}");
            }

            if status.as_u16() == 404 {
                return Ok(None);
            }

            if RETRY_CODES.contains(&status.as_u16()) {
                let retry_after = resp
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(wait);
                warn!(
                    url = %url,
                    status = status.as_u16(),
                    retry_in = retry_after,
                    "retryable status, backing off"
                );
                tokio::time::sleep(Duration::from_secs_f64(retry_after)).await;
                wait = (wait * 2.0).min(RETRY_MAX_WAIT as f64);
                continue;
            }

            let body = resp.text().await.unwrap_or_default();
            error!(url = %url, status = status.as_u16(), "unexpected HTTP status");
            anyhow::bail!("HTTP {} for {path}: {}", status, body);
        }

        error!(url = %url, "max retries exhausted");
        anyhow::bail!("max retries exhausted for {path}")
    }

    // -------------------------------------------------------------------------
    // Endpoints
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/exchangeInfo — active USDT-quoted perpetuals.
    pub async fn exchange_info(&self) -> Result<Vec<SymbolMeta>> {
        let body = self
            .request("/fapi/v1/exchangeInfo", &[])
            .await?
            .context("exchangeInfo returned no data")?;
        Ok(parse_exchange_info(&body))
    }

    /// GET /fapi/v1/ticker/24hr — {symbol → 24h quote volume}.
    pub async fn ticker_24h(&self) -> Result<HashMap<String, f64>> {
        let body = self
            .request("/fapi/v1/ticker/24hr", &[])
            .await?
            .context("ticker/24hr returned no data")?;
        Ok(parse_ticker_24h(&body))
    }

    /// GET /fapi/v1/premiumIndex — mark price + funding for every symbol in
    /// one call.
    pub async fn premium_index(&self) -> Result<Vec<PremiumIndex>> {
        let body = self
            .request("/fapi/v1/premiumIndex", &[])
            .await?
            .context("premiumIndex returned no data")?;
        Ok(parse_premium_index(&body))
    }

    /// GET /fapi/v1/openInterest — current open interest in contracts.
    pub async fn open_interest(&self, symbol: &str) -> Result<Option<f64>> {
        let body = self
            .request("/fapi/v1/openInterest", &[("symbol", symbol.to_string())])
            .await?;
        Ok(body.as_ref().and_then(parse_open_interest))
    }

    /// GET /futures/data/topLongShortPositionRatio — latest sample.
    pub async fn long_short_ratio(&self, symbol: &str, period: &str) -> Result<Option<LsSample>> {
        let body = self
            .request(
                "/futures/data/topLongShortPositionRatio",
                &[
                    ("symbol", symbol.to_string()),
                    ("period", period.to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        Ok(body.as_ref().and_then(parse_ls_sample))
    }

    /// GET /futures/data/takerlongshortRatio — latest sample.
    pub async fn taker_ratio(&self, symbol: &str, period: &str) -> Result<Option<TakerSample>> {
        let body = self
            .request(
                "/futures/data/takerlongshortRatio",
                &[
                    ("symbol", symbol.to_string()),
                    ("period", period.to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        Ok(body.as_ref().and_then(parse_taker_sample))
    }
}

impl std::fmt::Debug for FuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuturesClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// -------------------------------------------------------------------------
// Payload parsing (pure, so each shape is testable without a server)
// -------------------------------------------------------------------------

/// Parse a JSON value that may be either a string or a number into `f64`.
fn json_f64(val: &Value) -> Option<f64> {
    if let Some(s) = val.as_str() {
        s.parse().ok()
    } else {
        val.as_f64()
    }
}

fn json_i64(val: &Value) -> Option<i64> {
    if let Some(s) = val.as_str() {
        s.parse().ok()
    } else {
        val.as_i64()
    }
}

fn parse_exchange_info(body: &Value) -> Vec<SymbolMeta> {
    let Some(symbols) = body["symbols"].as_array() else {
        return Vec::new();
    };
    symbols
        .iter()
        .filter(|s| {
            s["contractType"].as_str() == Some("PERPETUAL")
                && s["status"].as_str() == Some("TRADING")
                && s["quoteAsset"].as_str() == Some("USDT")
        })
        .filter_map(|s| {
            Some(SymbolMeta {
                symbol: s["symbol"].as_str()?.to_string(),
                base_asset: s["baseAsset"].as_str().unwrap_or_default().to_string(),
            })
        })
        .collect()
}

fn parse_ticker_24h(body: &Value) -> HashMap<String, f64> {
    let Some(items) = body.as_array() else {
        return HashMap::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let sym = item["symbol"].as_str()?.to_string();
            let vol = json_f64(&item["quoteVolume"])?;
            Some((sym, vol))
        })
        .collect()
}

fn parse_premium_index(body: &Value) -> Vec<PremiumIndex> {
    let Some(items) = body.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            Some(PremiumIndex {
                symbol: item["symbol"].as_str()?.to_string(),
                mark_price: json_f64(&item["markPrice"])?,
                last_funding_rate: json_f64(&item["lastFundingRate"])?,
                next_funding_time: json_i64(&item["nextFundingTime"]).unwrap_or(0),
            })
        })
        .collect()
}

fn parse_open_interest(body: &Value) -> Option<f64> {
    json_f64(&body["openInterest"])
}

fn parse_ls_sample(body: &Value) -> Option<LsSample> {
    let first = body.as_array()?.first()?;
    Some(LsSample {
        ratio: json_f64(&first["longShortRatio"])?,
        long_pct: json_f64(&first["longAccount"]).unwrap_or(0.0),
        short_pct: json_f64(&first["shortAccount"]).unwrap_or(0.0),
    })
}

fn parse_taker_sample(body: &Value) -> Option<TakerSample> {
    let first = body.as_array()?.first()?;
    Some(TakerSample {
        buy_sell_ratio: json_f64(&first["buySellRatio"])?,
        buy_vol: json_f64(&first["buyVol"]).unwrap_or(0.0),
        sell_vol: json_f64(&first["sellVol"]).unwrap_or(0.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exchange_info_filters_to_trading_usdt_perps() {
        let body = json!({
            "symbols": [
                {"symbol": "BTCUSDT", "baseAsset": "BTC", "contractType": "PERPETUAL",
                 "status": "TRADING", "quoteAsset": "USDT"},
                {"symbol": "BTCUSDT_240628", "baseAsset": "BTC", "contractType": "CURRENT_QUARTER",
                 "status": "TRADING", "quoteAsset": "USDT"},
                {"symbol": "OLDUSDT", "baseAsset": "OLD", "contractType": "PERPETUAL",
                 "status": "SETTLING", "quoteAsset": "USDT"},
                {"symbol": "BTCBUSD", "baseAsset": "BTC", "contractType": "PERPETUAL",
                 "status": "TRADING", "quoteAsset": "BUSD"}
            ]
        });
        let parsed = parse_exchange_info(&body);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].symbol, "BTCUSDT");
        assert_eq!(parsed[0].base_asset, "BTC");
    }

    #[test]
    fn ticker_parses_string_volumes() {
        let body = json!([
            {"symbol": "BTCUSDT", "quoteVolume": "12345678.9"},
            {"symbol": "ETHUSDT", "quoteVolume": "987.1"},
            {"symbol": "BAD", "quoteVolume": "not-a-number"}
        ]);
        let parsed = parse_ticker_24h(&body);
        assert_eq!(parsed.len(), 2);
        assert!((parsed["BTCUSDT"] - 12_345_678.9).abs() < 1e-6);
    }

    #[test]
    fn premium_index_parses_mark_and_funding() {
        let body = json!([
            {"symbol": "BTCUSDT", "markPrice": "50000.12", "lastFundingRate": "0.00010000",
             "nextFundingTime": 1700000000000_i64},
            {"symbol": "NOFUND", "markPrice": "1.0"}
        ]);
        let parsed = parse_premium_index(&body);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].symbol, "BTCUSDT");
        assert!((parsed[0].mark_price - 50_000.12).abs() < 1e-9);
        assert!((parsed[0].last_funding_rate - 0.0001).abs() < 1e-12);
    }

    #[test]
    fn open_interest_parses_contracts() {
        assert_eq!(
            parse_open_interest(&json!({"openInterest": "10095.5"})),
            Some(10_095.5)
        );
        assert_eq!(parse_open_interest(&json!({})), None);
    }

    #[test]
    fn ls_and_taker_samples_take_first_entry() {
        let ls = parse_ls_sample(&json!([
            {"longShortRatio": "2.5", "longAccount": "0.71", "shortAccount": "0.29"}
        ]))
        .unwrap();
        assert!((ls.ratio - 2.5).abs() < 1e-12);
        assert!((ls.long_pct - 0.71).abs() < 1e-12);

        let tk = parse_taker_sample(&json!([
            {"buySellRatio": "0.85", "buyVol": "1000", "sellVol": "1176.47"}
        ]))
        .unwrap();
        assert!((tk.buy_sell_ratio - 0.85).abs() < 1e-12);

        // Empty arrays mean "no data this cycle".
        assert!(parse_ls_sample(&json!([])).is_none());
        assert!(parse_taker_sample(&json!([])).is_none());
    }
}
