use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::hyperliquid::float_to_wire;
use super::rate_limit::{backoff, RateLimiter};
use super::{
    current_timestamp_ms, value_as_f64, AccountInfo, Exchange, Kline, OrderAck, OrderRequest,
    OrderType, Position, PositionSide,
};
use crate::config::{ExchangeConfig, TradingMode};
use crate::error::{resolve_env, Result, TraderError};
use crate::signing;

const QUOTE_SUFFIX: &str = "-USDT";

/// BingX response envelope
#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Clone)]
struct Credentials {
    api_key: String,
    secret_key: String,
}

/// BingX USDT-margined perpetual swap client
pub struct BingXClient {
    base_url: String,
    client: Client,
    credentials: Option<Credentials>,
    assets: Vec<String>,
    rate_limiter: RateLimiter,
    contracts: Mutex<HashMap<String, ContractSpec>>,
}

impl BingXClient {
    pub fn new(base_url: &str, api_key: Option<String>, secret_key: Option<String>, assets: Vec<String>) -> Result<Self> {
        let credentials = match (api_key, secret_key) {
            (Some(api_key), Some(secret_key)) => Some(Credentials { api_key, secret_key }),
            _ => None,
        };
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::builder().timeout(Duration::from_secs(30)).build()?,
            credentials,
            assets,
            rate_limiter: RateLimiter::new(10, Duration::from_secs(1)),
            contracts: Mutex::new(HashMap::new()),
        })
    }

    /// Keys are read from the environment. Live trading fails without them;
    /// paper trading falls back to public market data only.
    pub fn from_config(config: &ExchangeConfig, assets: Vec<String>) -> Result<Self> {
        let read = |name: &Option<String>| -> Result<Option<String>> {
            match name {
                Some(env) => match resolve_env(env) {
                    Ok(v) => Ok(Some(v)),
                    Err(e) if config.trading_mode == TradingMode::Live => Err(e),
                    Err(_) => Ok(None),
                },
                None if config.trading_mode == TradingMode::Live => Err(TraderError::Config(
                    "bingx live trading needs api_key_env and secret_key_env".to_string(),
                )),
                None => Ok(None),
            }
        };
        let api_key = read(&config.api_key_env)?;
        let secret_key = read(&config.secret_key_env)?;
        Self::new(config.effective_api_url(), api_key, secret_key, assets)
    }

    /// Build the query string: params plus timestamp, signed when `signed` is set
    fn build_query(&self, params: &[(&str, String)], signed: bool) -> Result<String> {
        let mut all: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        all.push(("timestamp".to_string(), current_timestamp_ms().to_string()));
        if signed {
            let creds = self.require_credentials()?;
            signing::signed_query(&all, &creds.secret_key)
        } else {
            Ok(signing::sorted_query(&all))
        }
    }

    /// Contract precision, fetched once per process. Falls back to defaults
    /// when the contracts endpoint is unreachable.
    async fn contract_spec(&self, coin: &str) -> ContractSpec {
        if let Some(spec) = self.contracts.lock().await.get(coin) {
            return *spec;
        }
        match self
            .request(Method::GET, "/openApi/swap/v2/quote/contracts", &[], false)
            .await
        {
            Ok(data) => {
                let mut contracts = self.contracts.lock().await;
                if let Some(rows) = data.as_array() {
                    contracts.extend(rows.iter().filter_map(parse_contract));
                }
                contracts.get(coin).copied().unwrap_or_else(|| {
                    warn!(coin, "bingx contract not listed, using default precision");
                    ContractSpec::default()
                })
            }
            Err(e) => {
                warn!(coin, error = %e, "bingx contracts unavailable, using default precision");
                ContractSpec::default()
            }
        }
    }

    fn require_credentials(&self) -> Result<&Credentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| TraderError::Config("bingx api credentials not loaded".to_string()))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<serde_json::Value> {
        let mut last_err = TraderError::Exchange("max retries".to_string());
        for attempt in 0..3u32 {
            // timestamp and signature are regenerated per attempt
            let url = format!("{}{}?{}", self.base_url, path, self.build_query(params, signed)?);
            let mut builder = self.client.request(method.clone(), &url);
            if let Some(creds) = &self.credentials {
                builder = builder.header("X-BX-APIKEY", &creds.api_key);
            }
            self.rate_limiter.acquire().await;
            match builder.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await?;
                    if status.as_u16() == 429 {
                        warn!(path, attempt, "bingx rate limited, backing off");
                        tokio::time::sleep(backoff(attempt)).await;
                        last_err = TraderError::Api { status: 429, body: text };
                        continue;
                    }
                    if !status.is_success() {
                        return Err(TraderError::Api { status: status.as_u16(), body: text });
                    }
                    return unwrap_envelope(&text);
                }
                Err(e) => {
                    warn!(path, attempt, error = %e, "bingx request failed");
                    tokio::time::sleep(backoff(attempt)).await;
                    last_err = e.into();
                }
            }
        }
        Err(last_err)
    }
}

/// Decimal places BingX accepts for a contract
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContractSpec {
    pub quantity_precision: u32,
    pub price_precision: u32,
}

impl Default for ContractSpec {
    fn default() -> Self {
        Self { quantity_precision: 4, price_precision: 4 }
    }
}

fn parse_contract(raw: &serde_json::Value) -> Option<(String, ContractSpec)> {
    let symbol = raw.get("symbol")?.as_str()?;
    Some((
        from_bingx_symbol(symbol),
        ContractSpec {
            quantity_precision: field_f64(raw, "quantityPrecision")? as u32,
            price_precision: field_f64(raw, "pricePrecision")? as u32,
        },
    ))
}

/// Fixed decimals with trailing zeros stripped
pub fn format_decimals(value: f64, decimals: u32) -> String {
    let factor = 10f64.powi(decimals as i32);
    float_to_wire((value * factor).round() / factor)
}

/// Query parameters for a new order. Exits go out as market triggers at `limit_px`.
fn order_params(req: &OrderRequest, spec: ContractSpec) -> Result<Vec<(&'static str, String)>> {
    let quantity = format_decimals(req.quantity, spec.quantity_precision);
    if quantity.parse::<f64>().unwrap_or(0.0) <= 0.0 {
        return Err(TraderError::Exchange(format!(
            "order size {} rounds to zero for {}",
            req.quantity, req.symbol
        )));
    }
    let price = format_decimals(req.limit_px, spec.price_precision);
    let order_type = match req.order_type {
        OrderType::Limit => "LIMIT",
        OrderType::Market => "MARKET",
        OrderType::StopMarket => "STOP_MARKET",
        OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
    };
    let mut params = vec![
        ("symbol", to_bingx_symbol(&req.symbol)),
        ("side", req.side.as_str().to_string()),
        ("positionSide", "BOTH".to_string()),
        ("type", order_type.to_string()),
        ("quantity", quantity),
    ];
    match req.order_type {
        OrderType::Limit => {
            params.push(("price", price));
            params.push(("timeInForce", "GTC".to_string()));
        }
        OrderType::Market => {}
        OrderType::StopMarket | OrderType::TakeProfitMarket => {
            params.push(("stopPrice", price));
            params.push(("workingType", "MARK_PRICE".to_string()));
        }
    }
    if req.reduce_only {
        params.push(("reduceOnly", "true".to_string()));
    }
    Ok(params)
}

fn unwrap_envelope(text: &str) -> Result<serde_json::Value> {
    let env: Envelope = serde_json::from_str(text)?;
    if env.code != 0 {
        return Err(TraderError::Exchange(format!("bingx code {}: {}", env.code, env.msg)));
    }
    Ok(env.data)
}

pub fn to_bingx_symbol(coin: &str) -> String {
    if coin.ends_with(QUOTE_SUFFIX) {
        coin.to_string()
    } else {
        format!("{}{}", coin, QUOTE_SUFFIX)
    }
}

pub fn from_bingx_symbol(symbol: &str) -> String {
    symbol.strip_suffix(QUOTE_SUFFIX).unwrap_or(symbol).to_string()
}

fn field_f64(obj: &serde_json::Value, key: &str) -> Option<f64> {
    obj.get(key).and_then(value_as_f64)
}

/// Order ids are 64-bit integers; keep them exact
fn id_string(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn parse_position(raw: &serde_json::Value) -> Option<Position> {
    let amount = field_f64(raw, "positionAmt")?;
    if amount == 0.0 {
        return None;
    }
    let side = match raw.get("positionSide").and_then(|s| s.as_str()) {
        Some("LONG") => PositionSide::Long,
        Some("SHORT") => PositionSide::Short,
        _ if amount > 0.0 => PositionSide::Long,
        _ => PositionSide::Short,
    };
    Some(Position {
        symbol: from_bingx_symbol(raw.get("symbol")?.as_str()?),
        side,
        quantity: amount.abs(),
        entry_price: field_f64(raw, "avgPrice")
            .or_else(|| field_f64(raw, "entryPrice"))
            .unwrap_or(0.0),
        leverage: field_f64(raw, "leverage").unwrap_or(1.0),
        unrealized_pnl: field_f64(raw, "unrealizedProfit").unwrap_or(0.0),
        liquidation_price: field_f64(raw, "liquidationPrice").unwrap_or(0.0),
    })
}

/// Kline rows come either as objects (`open`, `close`, ..., `time`) or as arrays `[t, o, h, l, c, v]`
fn parse_kline(raw: &serde_json::Value) -> Option<Kline> {
    if let Some(row) = raw.as_array() {
        return Some(Kline {
            t: value_as_f64(row.first()?)? as u64,
            o: value_as_f64(row.get(1)?)?,
            h: value_as_f64(row.get(2)?)?,
            l: value_as_f64(row.get(3)?)?,
            c: value_as_f64(row.get(4)?)?,
            v: value_as_f64(row.get(5)?)?,
        });
    }
    Some(Kline {
        t: field_f64(raw, "time")? as u64,
        o: field_f64(raw, "open")?,
        h: field_f64(raw, "high")?,
        l: field_f64(raw, "low")?,
        c: field_f64(raw, "close")?,
        v: field_f64(raw, "volume")?,
    })
}

#[async_trait]
impl Exchange for BingXClient {
    fn name(&self) -> &'static str {
        "bingx"
    }

    async fn get_account_info(&self) -> Result<AccountInfo> {
        let data = self
            .request(Method::GET, "/openApi/swap/v2/user/balance", &[], true)
            .await?;
        let balance = data.get("balance").unwrap_or(&data);
        let account_value = field_f64(balance, "equity")
            .or_else(|| field_f64(balance, "balance"))
            .ok_or_else(|| TraderError::Parse("bingx balance missing equity".to_string()))?;
        Ok(AccountInfo {
            account_value,
            available_balance: field_f64(balance, "availableMargin"),
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        let data = self
            .request(Method::GET, "/openApi/swap/v2/user/positions", &[], true)
            .await?;
        Ok(data
            .as_array()
            .map(|rows| rows.iter().filter_map(parse_position).collect())
            .unwrap_or_default())
    }

    async fn get_all_mids(&self) -> Result<HashMap<String, f64>> {
        let mut mids = HashMap::new();
        for coin in &self.assets {
            let params = [("symbol", to_bingx_symbol(coin))];
            match self
                .request(Method::GET, "/openApi/swap/v2/quote/price", &params, false)
                .await
            {
                Ok(data) => {
                    if let Some(price) = field_f64(&data, "price") {
                        mids.insert(coin.clone(), price);
                    }
                }
                Err(e) => warn!(coin = %coin, error = %e, "bingx price lookup failed"),
            }
        }
        Ok(mids)
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck> {
        let spec = self.contract_spec(&req.symbol).await;
        let params = order_params(req, spec)?;
        info!(
            coin = %req.symbol,
            side = req.side.as_str(),
            quantity = req.quantity,
            price = req.limit_px,
            reduce_only = req.reduce_only,
            "placing bingx order"
        );
        let data = self
            .request(Method::POST, "/openApi/swap/v2/trade/order", &params, true)
            .await?;
        let order_id = data
            .get("order")
            .and_then(|o| o.get("orderId"))
            .or_else(|| data.get("orderId"))
            .and_then(id_string);
        debug!(?order_id, "bingx order accepted");
        Ok(OrderAck { order_id, raw: data })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<OrderAck> {
        let params = [
            ("symbol", to_bingx_symbol(symbol)),
            ("orderId", order_id.to_string()),
        ];
        let data = self
            .request(Method::DELETE, "/openApi/swap/v2/trade/order", &params, true)
            .await?;
        Ok(OrderAck { order_id: Some(order_id.to_string()), raw: data })
    }

    async fn get_klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Kline>> {
        let params = [
            ("symbol", to_bingx_symbol(symbol)),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];
        let data = self
            .request(Method::GET, "/openApi/swap/v3/quote/klines", &params, false)
            .await?;
        let mut klines: Vec<Kline> = data
            .as_array()
            .map(|rows| rows.iter().filter_map(parse_kline).collect())
            .unwrap_or_default();
        klines.sort_by_key(|k| k.t);
        Ok(klines)
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<Option<f64>> {
        let params = [("symbol", to_bingx_symbol(symbol))];
        let data = self
            .request(Method::GET, "/openApi/swap/v2/quote/premiumIndex", &params, false)
            .await?;
        Ok(field_f64(&data, "lastFundingRate"))
    }

    async fn get_open_interest(&self, symbol: &str) -> Result<Option<f64>> {
        let params = [("symbol", to_bingx_symbol(symbol))];
        let data = self
            .request(Method::GET, "/openApi/swap/v2/quote/openInterest", &params, false)
            .await?;
        Ok(field_f64(&data, "openInterest"))
    }
}
