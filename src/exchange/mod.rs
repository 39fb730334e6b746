//! Broker-agnostic exchange interface.
//!
//! Agents only talk to [`Exchange`]; the concrete broker (Hyperliquid, BingX)
//! and the paper-trading wrapper are chosen from configuration.

pub mod bingx;
pub mod hyperliquid;
pub mod paper;
pub mod rate_limit;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::{Broker, ExchangeConfig, TradingMode};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Buy)
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    #[default]
    Limit,
    Market,
    /// Reduce-only market exit once the price trades through `limit_px` against the position
    StopMarket,
    /// Reduce-only market exit once the price reaches `limit_px` in the position's favour
    TakeProfitMarket,
}

impl OrderType {
    pub fn is_trigger(&self) -> bool {
        matches!(self, OrderType::StopMarket | OrderType::TakeProfitMarket)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account_value: f64,
    pub available_balance: Option<f64>,
}

/// An open position, normalised across brokers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub leverage: f64,
    pub unrealized_pnl: f64,
    pub liquidation_price: f64,
}

/// One OHLCV candle; `t` is the open time in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub t: u64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub limit_px: f64,
    pub order_type: OrderType,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: Option<String>,
    pub raw: serde_json::Value,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_account_info(&self) -> Result<AccountInfo>;

    async fn get_positions(&self) -> Result<Vec<Position>>;

    /// Current mid prices keyed by coin
    async fn get_all_mids(&self) -> Result<HashMap<String, f64>>;

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<OrderAck>;

    /// Candles sorted by open time, oldest first
    async fn get_klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Kline>>;

    async fn get_funding_rate(&self, symbol: &str) -> Result<Option<f64>>;

    async fn get_open_interest(&self, symbol: &str) -> Result<Option<f64>>;
}

/// Build the configured exchange, wrapped for paper trading when requested
pub fn build_exchange(config: &ExchangeConfig, assets: &[String]) -> Result<Arc<dyn Exchange>> {
    let live: Arc<dyn Exchange> = match config.broker {
        Broker::Hyperliquid => Arc::new(hyperliquid::HyperliquidClient::from_config(config)?),
        Broker::BingX => Arc::new(bingx::BingXClient::from_config(config, assets.to_vec())?),
    };
    match config.trading_mode {
        TradingMode::Live => {
            info!(broker = live.name(), url = config.effective_api_url(), "live trading enabled");
            Ok(live)
        }
        TradingMode::Paper => {
            info!(broker = live.name(), "paper trading enabled");
            Ok(Arc::new(paper::PaperExchange::new(
                live,
                config.paper_balance_usd,
                config.paper_log_path.clone(),
            )))
        }
    }
}

/// Interval string such as `3m` or `4h` in milliseconds
pub fn interval_ms(interval: &str) -> Option<u64> {
    let unit = interval.chars().last()?;
    let n: u64 = interval[..interval.len() - unit.len_utf8()].parse().ok()?;
    let unit_ms = match unit {
        'm' => 60_000,
        'h' => 3_600_000,
        'd' => 86_400_000,
        'w' => 604_800_000,
        'M' => 2_592_000_000,
        _ => return None,
    };
    Some(n * unit_ms)
}

pub(crate) fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Accept numbers encoded either as JSON numbers or strings
pub(crate) fn value_as_f64(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_helpers() {
        assert!(Side::Buy.is_buy());
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.as_str(), "SELL");
        assert_eq!(serde_json::to_string(&Side::Sell).unwrap(), "\"SELL\"");
    }

    #[test]
    fn test_order_type_wire_names() {
        assert_eq!(serde_json::to_string(&OrderType::Market).unwrap(), "\"market\"");
        assert_eq!(serde_json::to_string(&OrderType::StopMarket).unwrap(), "\"stop_market\"");
        assert!(OrderType::TakeProfitMarket.is_trigger());
        assert!(!OrderType::Limit.is_trigger());
    }

    #[test]
    fn test_interval_ms() {
        assert_eq!(interval_ms("3m"), Some(180_000));
        assert_eq!(interval_ms("4h"), Some(14_400_000));
        assert_eq!(interval_ms("1d"), Some(86_400_000));
        assert_eq!(interval_ms("x"), None);
        assert_eq!(interval_ms(""), None);
        assert_eq!(interval_ms("10q"), None);
    }

    #[test]
    fn test_value_as_f64() {
        assert_eq!(value_as_f64(&serde_json::json!("1.5")), Some(1.5));
        assert_eq!(value_as_f64(&serde_json::json!(2)), Some(2.0));
        assert_eq!(value_as_f64(&serde_json::json!(null)), None);
    }

    #[test]
    fn test_position_serializes_camel_case() {
        let p = Position {
            symbol: "BTC".to_string(),
            side: PositionSide::Long,
            quantity: 0.5,
            entry_price: 50000.0,
            leverage: 10.0,
            unrealized_pnl: 12.5,
            liquidation_price: 45000.0,
        };
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"entryPrice\":50000.0"));
        assert!(json.contains("\"side\":\"LONG\""));
    }
}
