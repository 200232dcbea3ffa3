use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use itertools::Itertools;
use reqwest::{Client, header};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, time::Duration};
use tokio::time::sleep;
use tokio_retry::Retry;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::ohlc::{self, Bar, PriceSeries};
use crate::store;

/// Inclusive time range for a history request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn last_days(now: DateTime<Utc>, days: i64) -> Self {
        Self {
            start: now - ChronoDuration::days(days),
            end: now,
        }
    }
}

/// Where price history comes from.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn get_series(&self, instrument: &str, range: DateRange) -> Result<PriceSeries, EngineError>;

    /// Most recent close within the last week.
    async fn get_latest(&self, instrument: &str) -> Result<f64, EngineError> {
        let series = self
            .get_series(instrument, DateRange::last_days(Utc::now(), 7))
            .await?;
        series
            .last_close()
            .ok_or_else(|| EngineError::price_unavailable(instrument, "no recent bars"))
    }
}

/// Reads `<dir>/<INSTRUMENT>.csv`.
#[derive(Debug, Clone)]
pub struct CsvPriceSource {
    dir: PathBuf,
}

impl CsvPriceSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, instrument: &str) -> Result<PathBuf, EngineError> {
        if !store::is_plain_name(instrument) {
            return Err(EngineError::price_unavailable(instrument, "invalid instrument name"));
        }
        Ok(self.dir.join(format!("{}.csv", instrument.to_uppercase())))
    }
}

#[async_trait]
impl PriceSource for CsvPriceSource {
    async fn get_series(&self, instrument: &str, range: DateRange) -> Result<PriceSeries, EngineError> {
        let path = self.path_for(instrument)?;
        if !path.exists() {
            return Err(EngineError::price_unavailable(
                instrument,
                format!("{} not found", path.display()),
            ));
        }
        let name = instrument.to_string();
        let series = tokio::task::spawn_blocking(move || ohlc::read_series(&name, &path))
            .await
            .map_err(|e| EngineError::price_unavailable(instrument, e))?
            .map_err(|e| match e.downcast::<EngineError>() {
                Ok(engine) => engine,
                Err(other) => EngineError::price_unavailable(instrument, format!("{:#}", other)),
            })?;
        Ok(series.window(range.start, range.end))
    }

    async fn get_latest(&self, instrument: &str) -> Result<f64, EngineError> {
        let all = DateRange {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        };
        self.get_series(instrument, all)
            .await?
            .last_close()
            .ok_or_else(|| EngineError::price_unavailable(instrument, "empty file"))
    }
}

/// OHLC row: [timestamp_ms, open, high, low, close]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OhlcRaw(
    #[serde(deserialize_with = "de_f64_or_i64")] f64,
    f64,
    f64,
    f64,
    f64,
);

// timestamp may arrive as f64 or i64
pub fn de_f64_or_i64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Num {
        F(f64),
        I(i64),
    }
    match Num::deserialize(deserializer)? {
        Num::F(v) => Ok(v),
        Num::I(v) => Ok(v as f64),
    }
}

pub const COINGECKO_PRO_BASE: &str = "https://pro-api.coingecko.com/api/v3";
const MAX_RANGE_DAYS: i64 = 180;

/// Daily OHLC from the CoinGecko range endpoint.
#[derive(Debug, Clone)]
pub struct CoinGeckoPriceSource {
    client: Client,
    base_url: String,
    vs: String,
    coin_ids: HashMap<String, String>,
    request_delay_ms: u64,
    cache_dir: Option<PathBuf>,
}

/// Make an HTTP client with Pro key header
pub fn mk_client(api_key: &str, timeout: Duration) -> Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert("x-cg-pro-api-key", header::HeaderValue::from_str(api_key)?);
    let client = Client::builder()
        .default_headers(headers)
        .user_agent("crypto-selftrain/0.1 (rust)")
        .timeout(timeout)
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .build()?;
    Ok(client)
}

/// GET and decode JSON, retrying with backoff on any failure.
pub async fn do_get_json<T: for<'de> serde::Deserialize<'de>>(
    client: &Client,
    url: reqwest::Url,
) -> Result<T> {
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(150)
        .max_delay(Duration::from_secs(10))
        .map(jitter)
        .take(6);

    Retry::spawn(strategy, || {
        let url = url.clone();
        async move {
            let resp = client.get(url.clone()).send().await?;
            let status = resp.status();
            if status.is_success() {
                let body = resp.json::<T>().await?;
                return Ok::<T, anyhow::Error>(body);
            }
            let txt = resp.text().await.unwrap_or_default();
            info!("{} -> {} (will retry)", url.path(), status);
            Err(anyhow::anyhow!("HTTP {}; body: {}", status, txt))
        }
    })
    .await
}

/// Map common tickers to CoinGecko ids; anything else is used lowercased.
fn default_coin_ids() -> HashMap<String, String> {
    [
        ("BTC", "bitcoin"),
        ("ETH", "ethereum"),
        ("SOL", "solana"),
        ("BNB", "binancecoin"),
        ("XRP", "ripple"),
        ("ADA", "cardano"),
        ("DOGE", "dogecoin"),
        ("AVAX", "avalanche-2"),
        ("LINK", "chainlink"),
        ("DOT", "polkadot"),
    ]
    .into_iter()
    .map(|(s, id)| (s.to_string(), id.to_string()))
    .collect()
}

impl CoinGeckoPriceSource {
    pub fn new(api_key: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: mk_client(api_key, timeout)?,
            base_url: COINGECKO_PRO_BASE.to_string(),
            vs: "usd".to_string(),
            coin_ids: default_coin_ids(),
            request_delay_ms: 250,
            cache_dir: None,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_vs(mut self, vs: impl Into<String>) -> Self {
        self.vs = vs.into();
        self
    }

    /// Write every fetched series to `<dir>/<INSTRUMENT>.csv`.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_coin_id(mut self, instrument: &str, coin_id: &str) -> Self {
        self.coin_ids
            .insert(instrument.to_uppercase(), coin_id.to_string());
        self
    }

    pub fn coin_id(&self, instrument: &str) -> String {
        self.coin_ids
            .get(&instrument.to_uppercase())
            .cloned()
            .unwrap_or_else(|| instrument.to_lowercase())
    }

    fn range_url(&self, coin_id: &str, from_ts: i64, to_ts: i64) -> Result<reqwest::Url> {
        let base = format!("{}/coins/{}/ohlc/range", self.base_url, coin_id);
        Ok(reqwest::Url::parse_with_params(
            &base,
            &[
                ("vs_currency", self.vs.clone()),
                ("from", from_ts.to_string()),
                ("to", to_ts.to_string()),
                ("interval", "daily".into()),
            ],
        )?)
    }

    /// Fetch `[from_ts, to_ts]` in chunks and keep the last candle per day.
    async fn fetch_bars(&self, coin_id: &str, from_ts: i64, to_ts: i64) -> Result<Vec<Bar>> {
        let one_day = 86_400i64;
        let mut cur_from = from_ts;
        let mut raws: Vec<OhlcRaw> = vec![];

        while cur_from < to_ts {
            let cur_to = (cur_from + MAX_RANGE_DAYS * one_day).min(to_ts);
            let url = self.range_url(coin_id, cur_from, cur_to)?;
            let chunk = do_get_json::<Vec<OhlcRaw>>(&self.client, url).await?;
            debug!(coin_id, rows = chunk.len(), "fetched ohlc chunk");
            raws.extend(chunk);
            sleep(Duration::from_millis(self.request_delay_ms)).await;
            cur_from = cur_to + 1;
        }

        raws.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut out = vec![];
        for (_date, group) in &raws.into_iter().chunk_by(|r| {
            Utc.timestamp_millis_opt(r.0 as i64)
                .single()
                .map(|t| t.date_naive())
        }) {
            if let Some(last) = group.last()
                && let Some(ts) = Utc.timestamp_millis_opt(last.0 as i64).single()
            {
                out.push(Bar {
                    timestamp: ohlc::date_to_utc(ts.date_naive()),
                    open: last.1,
                    high: last.2,
                    low: last.3,
                    close: last.4,
                    volume: 0.0,
                });
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl PriceSource for CoinGeckoPriceSource {
    async fn get_series(&self, instrument: &str, range: DateRange) -> Result<PriceSeries, EngineError> {
        if !store::is_plain_name(instrument) {
            return Err(EngineError::price_unavailable(instrument, "invalid instrument name"));
        }
        let coin_id = self.coin_id(instrument);
        let bars = self
            .fetch_bars(&coin_id, range.start.timestamp(), range.end.timestamp())
            .await
            .map_err(|e| EngineError::price_unavailable(instrument, format!("{:#}", e)))?;
        if bars.is_empty() {
            return Err(EngineError::price_unavailable(instrument, "no candles returned"));
        }
        let series = PriceSeries::new(instrument.to_uppercase(), bars)?;

        if let Some(dir) = &self.cache_dir {
            let path = dir.join(format!("{}.csv", instrument.to_uppercase()));
            if let Err(e) = ohlc::save_series(&series, &path).context("cache series") {
                warn!(instrument, error = %e, "could not cache series");
            } else {
                info!("wrote {}", path.display());
            }
        }
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn write_csv(dir: &std::path::Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[tokio::test]
    async fn csv_source_reads_and_windows() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(
            dir.path(),
            "BTC.csv",
            "date,open,high,low,close\n2024-01-01,1,1,1,100\n2024-01-02,1,1,1,101\n2024-01-03,1,1,1,102\n",
        );
        let src = CsvPriceSource::new(dir.path());
        let range = DateRange {
            start: ohlc::date_to_utc(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()),
            end: ohlc::date_to_utc(NaiveDate::from_ymd_opt(2024, 1, 3).unwrap()),
        };
        let s = src.get_series("btc", range).await.unwrap();
        assert_eq!(s.closes(), vec![101.0, 102.0]);
        assert_eq!(src.get_latest("BTC").await.unwrap(), 102.0);
    }

    #[tokio::test]
    async fn instrument_cannot_escape_data_dir() {
        let root = tempfile::tempdir().unwrap();
        write_csv(
            root.path(),
            "SECRET.csv",
            "date,open,high,low,close\n2024-01-01,1,1,1,100\n",
        );
        let data = root.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        let src = CsvPriceSource::new(&data);
        for name in ["../secret", "..", "", "a/b", "BTC.csv"] {
            let err = src.get_latest(name).await.unwrap_err();
            assert!(matches!(err, EngineError::PriceUnavailable { .. }), "{}", name);
        }
    }

    #[tokio::test]
    async fn missing_file_is_price_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let src = CsvPriceSource::new(dir.path());
        let err = src
            .get_series("DOGE", DateRange::last_days(Utc::now(), 30))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PriceUnavailable { .. }));
    }

    #[tokio::test]
    async fn bad_prices_are_malformed_series() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "ETH.csv", "date,close\n2024-01-01,10\n2024-01-02,-3\n");
        let err = CsvPriceSource::new(dir.path())
            .get_series("ETH", DateRange::last_days(Utc::now(), 30))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MalformedSeries(_)));
    }

    #[test]
    fn ohlc_raw_accepts_integer_timestamps() {
        let raw: Vec<OhlcRaw> = serde_json::from_str("[[1704067200000, 1.0, 2.0, 0.5, 1.5]]").unwrap();
        assert_eq!(raw[0].0, 1_704_067_200_000.0);
    }

    #[test]
    fn coin_ids_fall_back_to_lowercase() {
        let src = CoinGeckoPriceSource::new("k", Duration::from_secs(5)).unwrap();
        assert_eq!(src.coin_id("btc"), "bitcoin");
        assert_eq!(src.coin_id("PEPE"), "pepe");
        let src = src.with_coin_id("pepe", "pepe-token");
        assert_eq!(src.coin_id("PEPE"), "pepe-token");
    }
}
