//! Binance public market-data client
//!
//! Only the klines endpoint is used. Requests are paged 1000 candles at a
//! time starting from `start` until the exchange returns a short page.

use super::source::CandleSource;
use super::types::{Candle, Interval};
use crate::error::{ForecastError, Result};
use log::{debug, info};
use serde::Deserialize;

/// Base URL of the Binance REST API
const BINANCE_API_URL: &str = "https://api.binance.com";

/// Maximum candles per klines request
const PAGE_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

fn klines_url(base_url: &str, symbol: &str, interval: Interval, start_ms: i64) -> String {
    format!(
        "{}/api/v3/klines?symbol={}&interval={}&startTime={}&limit={}",
        base_url,
        symbol.to_uppercase(),
        interval.to_api_string(),
        start_ms,
        PAGE_LIMIT
    )
}

fn parse_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Parse raw kline arrays `[open_time, open, high, low, close, volume, ...]`
fn parse_klines(raw: &[Vec<serde_json::Value>]) -> Result<Vec<Candle>> {
    raw.iter()
        .map(|row| {
            let field = |i: usize| row.get(i).and_then(parse_number);
            match (
                row.first().and_then(|v| v.as_i64()),
                field(1),
                field(2),
                field(3),
                field(4),
                field(5),
            ) {
                (Some(ts), Some(open), Some(high), Some(low), Some(close), Some(volume)) => {
                    Ok(Candle::new(ts, open, high, low, close, volume))
                }
                _ => Err(ForecastError::ExternalSource(format!(
                    "malformed kline row: {:?}",
                    row
                ))),
            }
        })
        .collect()
}

fn api_error(status: reqwest::StatusCode, body: &str) -> ForecastError {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(err) => ForecastError::ExternalSource(format!(
            "Binance API error {}: {} (HTTP {})",
            err.code, err.msg, status
        )),
        Err(_) => ForecastError::ExternalSource(format!("HTTP {}: {}", status, body)),
    }
}

/// Check the HTTP status and decode one klines page
fn decode_page(status: reqwest::StatusCode, body: &str) -> Result<Vec<Candle>> {
    if !status.is_success() {
        return Err(api_error(status, body));
    }
    let raw: Vec<Vec<serde_json::Value>> = serde_json::from_str(body)
        .map_err(|e| ForecastError::ExternalSource(format!("invalid klines payload: {}", e)))?;
    parse_klines(&raw)
}

/// Cursor over klines pages. A short page ends the walk.
#[derive(Debug)]
struct Pager {
    cursor: i64,
    step_ms: i64,
    done: bool,
    requests: usize,
    candles: Vec<Candle>,
}

impl Pager {
    fn new(interval: Interval, start_ms: i64) -> Self {
        Self {
            cursor: start_ms,
            step_ms: interval.duration_ms(),
            done: false,
            requests: 0,
            candles: Vec::new(),
        }
    }

    /// Start time of the next request, if any
    fn next_start(&mut self) -> Option<i64> {
        if self.done {
            return None;
        }
        self.requests += 1;
        Some(self.cursor)
    }

    fn absorb(&mut self, page: Vec<Candle>) {
        self.done = page.len() < PAGE_LIMIT;
        if let Some(last) = page.last() {
            self.cursor = last.timestamp + self.step_ms;
        }
        self.candles.extend(page);
    }

    fn finish(self, symbol: &str, interval: Interval) -> Result<Vec<Candle>> {
        if self.candles.is_empty() {
            return Err(ForecastError::ExternalSource(format!(
                "no candles returned for {} {}",
                symbol,
                interval.to_api_string()
            )));
        }
        info!(
            "Fetched {} candles for {} ({}) in {} requests",
            self.candles.len(),
            symbol,
            interval.to_api_string(),
            self.requests
        );
        Ok(self.candles)
    }
}

/// Blocking client used by the training pipeline
#[derive(Debug, Clone)]
pub struct BinanceClientSync {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl Default for BinanceClientSync {
    fn default() -> Self {
        Self::new()
    }
}

impl BinanceClientSync {
    pub fn new() -> Self {
        Self::with_base_url(BINANCE_API_URL)
    }

    /// Client against a different host, e.g. the testnet
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn fetch_page(&self, symbol: &str, interval: Interval, start_ms: i64) -> Result<Vec<Candle>> {
        let url = klines_url(&self.base_url, symbol, interval, start_ms);
        debug!("Requesting {}", url);

        let response = self.client.get(&url).send()?;
        let status = response.status();
        decode_page(status, &response.text()?)
    }
}

impl CandleSource for BinanceClientSync {
    fn fetch(&self, symbol: &str, interval: Interval, start_ms: i64) -> Result<Vec<Candle>> {
        let mut pager = Pager::new(interval, start_ms);
        while let Some(start) = pager.next_start() {
            let page = self.fetch_page(symbol, interval, start)?;
            pager.absorb(page);
        }
        pager.finish(symbol, interval)
    }
}

/// Async client for the download binary
#[derive(Debug, Clone)]
pub struct BinanceClient {
    client: reqwest::Client,
    base_url: String,
}

impl Default for BinanceClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BinanceClient {
    pub fn new() -> Self {
        Self::with_base_url(BINANCE_API_URL)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Fetch every candle from `start_ms` up to now
    pub async fn fetch_history(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
    ) -> Result<Vec<Candle>> {
        let mut pager = Pager::new(interval, start_ms);
        while let Some(start) = pager.next_start() {
            if pager.requests > 1 {
                // Stay well under the public rate limit
                tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            }
            let url = klines_url(&self.base_url, symbol, interval, start);
            debug!("Page {}: {}", pager.requests, url);

            let response = self.client.get(&url).send().await?;
            let status = response.status();
            let page = decode_page(status, &response.text().await?)?;
            pager.absorb(page);
        }
        pager.finish(symbol, interval)
    }
}
