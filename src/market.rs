//! Market snapshots: candles plus indicators for each tradable coin.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::exchange::{Exchange, Kline};
use crate::indicators::{atr, ema, fill_zero, last_n, latest, macd, mean, rsi};

const SERIES_LEN: usize = 10;
const OI_HISTORY_LEN: usize = 100;
/// Candles needed for a defined ATR(14)
const ATR14_MIN_CANDLES: usize = 15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenInterest {
    pub latest: f64,
    pub average: f64,
}

/// Everything the prompt shows about one coin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetSnapshot {
    pub current_price: f64,
    pub current_ema20: f64,
    pub current_macd: f64,
    pub current_rsi_7: f64,
    pub current_rsi_14: f64,
    pub open_interest: OpenInterest,
    pub funding_rate: f64,
    pub mid_prices_3m: Vec<f64>,
    pub ema20_3m: Vec<f64>,
    pub macd_3m: Vec<f64>,
    pub rsi7_3m: Vec<f64>,
    pub rsi14_3m: Vec<f64>,
    pub ema20_4h: f64,
    pub ema50_4h: f64,
    pub atr3_4h: f64,
    pub atr14_4h: f64,
    pub volume_current: f64,
    pub volume_avg: f64,
    pub macd_4h: Vec<f64>,
    pub rsi14_4h: Vec<f64>,
}

/// Column view of a candle series
struct Columns {
    highs: Vec<f64>,
    lows: Vec<f64>,
    closes: Vec<f64>,
    volumes: Vec<f64>,
}

impl Columns {
    fn from_klines(klines: &[Kline]) -> Self {
        Self {
            highs: klines.iter().map(|k| k.h).collect(),
            lows: klines.iter().map(|k| k.l).collect(),
            closes: klines.iter().map(|k| k.c).collect(),
            volumes: klines.iter().map(|k| k.v).collect(),
        }
    }
}

fn tail(series: &[Option<f64>]) -> Vec<f64> {
    last_n(&fill_zero(series), SERIES_LEN)
}

/// Build a snapshot from 3m and 4h candles (both oldest first, non-empty)
pub fn build_snapshot(
    klines_3m: &[Kline],
    klines_4h: &[Kline],
    funding_rate: f64,
    open_interest: OpenInterest,
) -> AssetSnapshot {
    let short = Columns::from_klines(klines_3m);
    let long = Columns::from_klines(klines_4h);

    let ema20_3m = ema(&short.closes, 20);
    let macd_3m = macd(&short.closes, 12, 26);
    let rsi7_3m = rsi(&short.closes, 7);
    let rsi14_3m = rsi(&short.closes, 14);

    let macd_4h = macd(&long.closes, 12, 26);
    let rsi14_4h = rsi(&long.closes, 14);

    AssetSnapshot {
        current_price: short.closes.last().copied().unwrap_or(0.0),
        current_ema20: latest(&ema20_3m).unwrap_or(0.0),
        current_macd: latest(&macd_3m).unwrap_or(0.0),
        current_rsi_7: latest(&rsi7_3m).unwrap_or(0.0),
        current_rsi_14: latest(&rsi14_3m).unwrap_or(0.0),
        open_interest,
        funding_rate,
        mid_prices_3m: last_n(&short.closes, SERIES_LEN),
        ema20_3m: tail(&ema20_3m),
        macd_3m: tail(&macd_3m),
        rsi7_3m: tail(&rsi7_3m),
        rsi14_3m: tail(&rsi14_3m),
        ema20_4h: latest(&ema(&long.closes, 20)).unwrap_or(0.0),
        ema50_4h: latest(&ema(&long.closes, 50)).unwrap_or(0.0),
        atr3_4h: latest(&atr(&long.highs, &long.lows, &long.closes, 3)).unwrap_or(0.0),
        atr14_4h: latest(&atr(&long.highs, &long.lows, &long.closes, 14)).unwrap_or(0.0),
        volume_current: long.volumes.last().copied().unwrap_or(0.0),
        volume_avg: mean(&long.volumes).unwrap_or(0.0),
        macd_4h: tail(&macd_4h),
        rsi14_4h: tail(&rsi14_4h),
    }
}

pub struct MarketFetcher {
    exchange: Arc<dyn Exchange>,
    assets: Vec<String>,
    candle_limit: usize,
    pause: Duration,
    oi_history: Mutex<HashMap<String, Vec<f64>>>,
}

impl MarketFetcher {
    pub fn new(exchange: Arc<dyn Exchange>, assets: Vec<String>, candle_limit: usize) -> Self {
        Self {
            exchange,
            assets,
            candle_limit,
            pause: Duration::from_millis(500),
            oi_history: Mutex::new(HashMap::new()),
        }
    }

    /// Delay between coins in [`MarketFetcher::get_all_assets`]
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    /// Snapshot for one coin; `None` when either timeframe returns no candles
    pub async fn get_asset_data(&self, coin: &str) -> Result<Option<AssetSnapshot>> {
        let klines_3m = self.exchange.get_klines(coin, "3m", self.candle_limit).await?;
        if klines_3m.is_empty() {
            warn!(coin, interval = "3m", "no candles returned");
            return Ok(None);
        }
        let klines_4h = self.exchange.get_klines(coin, "4h", self.candle_limit).await?;
        if klines_4h.is_empty() {
            warn!(coin, interval = "4h", "no candles returned");
            return Ok(None);
        }

        let funding_rate = match self.exchange.get_funding_rate(coin).await {
            Ok(rate) => rate.unwrap_or(0.0),
            Err(e) => {
                warn!(coin, error = %e, "funding rate unavailable");
                0.0
            }
        };
        let oi = match self.exchange.get_open_interest(coin).await {
            Ok(oi) => oi,
            Err(e) => {
                warn!(coin, error = %e, "open interest unavailable");
                None
            }
        };
        let open_interest = self.record_open_interest(coin, oi);

        debug!(coin, candles_3m = klines_3m.len(), candles_4h = klines_4h.len(), "building snapshot");
        Ok(Some(build_snapshot(&klines_3m, &klines_4h, funding_rate, open_interest)))
    }

    /// Remember a reading and return it with the average of all readings seen
    fn record_open_interest(&self, coin: &str, reading: Option<f64>) -> OpenInterest {
        let mut history = match self.oi_history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let readings = history.entry(coin.to_string()).or_default();
        if let Some(value) = reading {
            readings.push(value);
            if readings.len() > OI_HISTORY_LEN {
                readings.remove(0);
            }
        }
        OpenInterest {
            latest: reading.unwrap_or(0.0),
            average: mean(readings).unwrap_or(0.0),
        }
    }

    /// Snapshots for every configured coin; failures become `None`
    pub async fn get_all_assets(&self) -> BTreeMap<String, Option<AssetSnapshot>> {
        let mut result = BTreeMap::new();
        for (i, coin) in self.assets.iter().enumerate() {
            if i > 0 && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
            info!(coin = %coin, "fetching market data");
            let snapshot = match self.get_asset_data(coin).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(coin = %coin, error = %e, "market data fetch failed");
                    None
                }
            };
            result.insert(coin.clone(), snapshot);
        }
        result
    }

    /// ATR(14) on 4h candles, used to size positions from a risk budget
    pub async fn atr14_4h(&self, coin: &str) -> Result<Option<f64>> {
        let limit = self.candle_limit.max(ATR14_MIN_CANDLES);
        let klines = self.exchange.get_klines(coin, "4h", limit).await?;
        if klines.len() < ATR14_MIN_CANDLES {
            warn!(coin, candles = klines.len(), "not enough candles for ATR14");
            return Ok(None);
        }
        let cols = Columns::from_klines(&klines);
        Ok(latest(&atr(&cols.highs, &cols.lows, &cols.closes, 14)))
    }
}
