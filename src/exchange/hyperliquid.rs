use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::rate_limit::{backoff, RateLimiter};
use super::{
    current_timestamp_ms, interval_ms, value_as_f64, AccountInfo, Exchange, Kline, OrderAck,
    OrderRequest, OrderType, Position, PositionSide,
};
use crate::config::{ExchangeConfig, NetworkMode, TradingMode};
use crate::error::{resolve_env, Result, TraderError};
use crate::signing::{self, EthSignature};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearinghouseState {
    #[serde(default)]
    asset_positions: Vec<AssetPosition>,
    margin_summary: MarginSummary,
    #[serde(default)]
    withdrawable: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AssetPosition {
    position: RawPosition,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPosition {
    coin: String,
    szi: String,
    entry_px: Option<String>,
    unrealized_pnl: String,
    #[serde(default)]
    liquidation_px: Option<String>,
    #[serde(default)]
    leverage: Option<RawLeverage>,
}

#[derive(Debug, Deserialize)]
struct RawLeverage {
    value: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarginSummary {
    account_value: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MetaResponse {
    universe: Vec<AssetMeta>,
}

#[derive(Debug, Clone, Deserialize)]
struct AssetMeta {
    name: String,
    #[serde(rename = "szDecimals")]
    sz_decimals: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetCtx {
    #[serde(default)]
    funding: Option<String>,
    #[serde(default)]
    open_interest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCandle {
    t: u64,
    o: String,
    h: String,
    l: String,
    c: String,
    v: String,
}

#[derive(Debug, Clone, Copy)]
struct AssetInfo {
    index: u32,
    sz_decimals: u32,
}

/// Hyperliquid perpetuals client: unsigned `/info` queries, signed `/exchange` actions
pub struct HyperliquidClient {
    api_url: String,
    network: NetworkMode,
    client: Client,
    wallet_address: Option<String>,
    private_key: Option<String>,
    rate_limiter: RateLimiter,
    assets: Arc<Mutex<HashMap<String, AssetInfo>>>,
}

impl HyperliquidClient {
    pub fn new(
        api_url: &str,
        network: NetworkMode,
        wallet_address: Option<String>,
        private_key: Option<String>,
    ) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            network,
            client,
            wallet_address,
            private_key,
            rate_limiter: RateLimiter::new(100, Duration::from_secs(10)),
            assets: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Resolve credentials from config. Live trading requires a private key;
    /// paper trading only needs public market data.
    pub fn from_config(config: &ExchangeConfig) -> Result<Self> {
        let private_key = match (&config.private_key_env, &config.private_key_path) {
            (Some(env), _) if std::env::var(env).is_ok() => Some(resolve_env(env)?),
            (_, Some(path)) => Some(signing::load_private_key(path)?),
            (Some(env), None) if config.trading_mode == TradingMode::Live => {
                return Err(TraderError::MissingEnv(env.clone()))
            }
            _ => None,
        };
        if config.trading_mode == TradingMode::Live && private_key.is_none() {
            return Err(TraderError::Config(
                "hyperliquid live trading needs private_key_env or private_key_path".to_string(),
            ));
        }
        let private_key = private_key.map(|k| {
            if k.starts_with("0x") {
                k
            } else {
                format!("0x{}", k)
            }
        });

        let wallet_address = match (&config.wallet_address, &private_key) {
            (Some(addr), _) => Some(addr.clone()),
            (None, Some(key)) => Some(signing::derive_address(key)?),
            (None, None) => None,
        };

        Self::new(config.effective_api_url(), config.network_mode, wallet_address, private_key)
    }

    fn require_wallet(&self) -> Result<&str> {
        self.wallet_address
            .as_deref()
            .ok_or_else(|| TraderError::Config("hyperliquid wallet address not configured".to_string()))
    }

    fn require_private_key(&self) -> Result<&str> {
        self.private_key
            .as_deref()
            .ok_or_else(|| TraderError::Signing("private key not loaded".to_string()))
    }

    async fn post_info<T: DeserializeOwned>(&self, body: serde_json::Value) -> Result<T> {
        let url = format!("{}/info", self.api_url);
        self.rate_limiter.acquire().await;
        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(TraderError::Api { status: status.as_u16(), body: text });
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn clearinghouse_state(&self) -> Result<ClearinghouseState> {
        let user = self.require_wallet()?;
        self.post_info(serde_json::json!({"type": "clearinghouseState", "user": user}))
            .await
    }

    async fn resolve_asset(&self, coin: &str) -> Result<AssetInfo> {
        if let Some(info) = self.assets.lock().await.get(coin) {
            return Ok(*info);
        }
        let meta: MetaResponse = self.post_info(serde_json::json!({"type": "meta"})).await?;
        let mut assets = self.assets.lock().await;
        for (i, a) in meta.universe.iter().enumerate() {
            assets.insert(a.name.clone(), AssetInfo { index: i as u32, sz_decimals: a.sz_decimals });
        }
        assets
            .get(coin)
            .copied()
            .ok_or_else(|| TraderError::Exchange(format!("unknown asset: {}", coin)))
    }

    async fn asset_ctx(&self, symbol: &str) -> Result<Option<AssetCtx>> {
        let (meta, ctxs): (MetaResponse, Vec<AssetCtx>) = self
            .post_info(serde_json::json!({"type": "metaAndAssetCtxs"}))
            .await?;
        let idx = meta.universe.iter().position(|a| a.name == symbol);
        Ok(idx.and_then(|i| ctxs.into_iter().nth(i)))
    }

    async fn send_exchange_request(
        &self,
        action: &serde_json::Value,
        nonce: u64,
        sig: &EthSignature,
    ) -> Result<serde_json::Value> {
        let url = format!("{}/exchange", self.api_url);
        let body = serde_json::json!({
            "action": action,
            "nonce": nonce,
            "signature": {"r": sig.r, "s": sig.s, "v": sig.v},
            "vaultAddress": null,
        });
        let mut last_err = TraderError::Exchange("max retries".to_string());
        for attempt in 0..3u32 {
            self.rate_limiter.acquire().await;
            match self.client.post(&url).json(&body).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await?;
                    if status.is_success() {
                        return Ok(serde_json::from_str(&text)?);
                    }
                    if status.as_u16() == 429 {
                        warn!(attempt, "hyperliquid rate limited, backing off");
                        tokio::time::sleep(backoff(attempt)).await;
                        last_err = TraderError::Api { status: 429, body: text };
                        continue;
                    }
                    return Err(TraderError::Api { status: status.as_u16(), body: text });
                }
                Err(e) => {
                    warn!(attempt, error = %e, "hyperliquid request failed");
                    tokio::time::sleep(backoff(attempt)).await;
                    last_err = e.into();
                }
            }
        }
        Err(last_err)
    }

    async fn submit_action(&self, action: serde_json::Value) -> Result<serde_json::Value> {
        let key = self.require_private_key()?;
        let nonce = current_timestamp_ms();
        let sig = signing::sign_l1_action(key, &action, None, nonce, None, self.network).await?;
        self.send_exchange_request(&action, nonce, &sig).await
    }
}

#[async_trait]
impl Exchange for HyperliquidClient {
    fn name(&self) -> &'static str {
        "hyperliquid"
    }

    async fn get_account_info(&self) -> Result<AccountInfo> {
        let state = self.clearinghouse_state().await?;
        Ok(AccountInfo {
            account_value: parse_f64(&state.margin_summary.account_value)?,
            available_balance: state.withdrawable.as_deref().and_then(|w| w.parse().ok()),
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        let state = self.clearinghouse_state().await?;
        let mut positions = Vec::new();
        for ap in state.asset_positions {
            let p = ap.position;
            let szi = parse_f64(&p.szi)?;
            if szi == 0.0 {
                continue;
            }
            positions.push(Position {
                symbol: p.coin,
                side: if szi > 0.0 { PositionSide::Long } else { PositionSide::Short },
                quantity: szi.abs(),
                entry_price: p.entry_px.as_deref().map(parse_f64).transpose()?.unwrap_or(0.0),
                leverage: p.leverage.map(|l| l.value).unwrap_or(1.0),
                unrealized_pnl: parse_f64(&p.unrealized_pnl)?,
                liquidation_price: p.liquidation_px.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0.0),
            });
        }
        Ok(positions)
    }

    async fn get_all_mids(&self) -> Result<HashMap<String, f64>> {
        let mids: HashMap<String, String> = self.post_info(serde_json::json!({"type": "allMids"})).await?;
        Ok(mids
            .into_iter()
            .filter_map(|(coin, px)| px.parse().ok().map(|v| (coin, v)))
            .collect())
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck> {
        let asset = self.resolve_asset(&req.symbol).await?;
        let size = format_size(req.quantity, asset.sz_decimals);
        if size.parse::<f64>().unwrap_or(0.0) <= 0.0 {
            return Err(TraderError::Exchange(format!(
                "order size {} rounds to zero for {}",
                req.quantity, req.symbol
            )));
        }
        let cloid = format!("0x{}", uuid::Uuid::new_v4().simple());
        let wire = order_wire(req, asset, size, cloid);
        let action = serde_json::json!({"type": "order", "orders": [wire], "grouping": "na"});
        info!(
            coin = %req.symbol,
            side = req.side.as_str(),
            size = %wire["s"],
            price = %wire["p"],
            reduce_only = req.reduce_only,
            "placing hyperliquid order"
        );
        let resp = self.submit_action(action).await?;
        let order_id = order_id_from_response(&resp)?;
        debug!(?order_id, "hyperliquid order accepted");
        Ok(OrderAck { order_id, raw: resp })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<OrderAck> {
        let oid: u64 = order_id
            .parse()
            .map_err(|_| TraderError::Exchange(format!("invalid hyperliquid order id: {}", order_id)))?;
        let asset = self.resolve_asset(symbol).await?;
        let action = serde_json::json!({"type": "cancel", "cancels": [{"a": asset.index, "o": oid}]});
        let resp = self.submit_action(action).await?;
        check_statuses(&resp)?;
        Ok(OrderAck { order_id: Some(order_id.to_string()), raw: resp })
    }

    async fn get_klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Kline>> {
        let step = interval_ms(interval)
            .ok_or_else(|| TraderError::Exchange(format!("unsupported interval: {}", interval)))?;
        let end = current_timestamp_ms();
        let start = end.saturating_sub(step * limit as u64);
        let raw: Vec<RawCandle> = self
            .post_info(serde_json::json!({
                "type": "candleSnapshot",
                "req": {"coin": symbol, "interval": interval, "startTime": start, "endTime": end}
            }))
            .await?;
        let mut klines = raw
            .into_iter()
            .map(|c| {
                Ok(Kline {
                    t: c.t,
                    o: parse_f64(&c.o)?,
                    h: parse_f64(&c.h)?,
                    l: parse_f64(&c.l)?,
                    c: parse_f64(&c.c)?,
                    v: parse_f64(&c.v)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        klines.sort_by_key(|k| k.t);
        if klines.len() > limit {
            klines.drain(..klines.len() - limit);
        }
        Ok(klines)
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<Option<f64>> {
        Ok(self
            .asset_ctx(symbol)
            .await?
            .and_then(|ctx| ctx.funding)
            .and_then(|f| f.parse().ok()))
    }

    async fn get_open_interest(&self, symbol: &str) -> Result<Option<f64>> {
        Ok(self
            .asset_ctx(symbol)
            .await?
            .and_then(|ctx| ctx.open_interest)
            .and_then(|oi| oi.parse().ok()))
    }
}

/// Order in wire form. Field order matters: the action is hashed as msgpack.
fn order_wire(req: &OrderRequest, asset: AssetInfo, size: String, cloid: String) -> serde_json::Value {
    let px = format_price(req.limit_px, asset.sz_decimals);
    let order_type = match req.order_type {
        OrderType::Limit => serde_json::json!({"limit": {"tif": "Gtc"}}),
        OrderType::Market => serde_json::json!({"limit": {"tif": "Ioc"}}),
        OrderType::StopMarket => serde_json::json!({"trigger": {"isMarket": true, "triggerPx": px, "tpsl": "sl"}}),
        OrderType::TakeProfitMarket => {
            serde_json::json!({"trigger": {"isMarket": true, "triggerPx": px, "tpsl": "tp"}})
        }
    };
    serde_json::json!({
        "a": asset.index,
        "b": req.side.is_buy(),
        "p": px,
        "s": size,
        "r": req.reduce_only,
        "t": order_type,
        "c": cloid,
    })
}

fn parse_f64(s: &str) -> Result<f64> {
    s.trim()
        .parse()
        .map_err(|_| TraderError::Parse(format!("not a number: {}", s)))
}

/// Fail on `{"status":"err"}` or any per-order `{"error": ...}` status
fn check_statuses(resp: &serde_json::Value) -> Result<Vec<serde_json::Value>> {
    if resp["status"] == "err" {
        return Err(TraderError::Exchange(resp["response"].to_string()));
    }
    let statuses = resp["response"]["data"]["statuses"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    for s in &statuses {
        if let Some(err) = s.get("error") {
            return Err(TraderError::Exchange(err.as_str().unwrap_or_default().to_string()));
        }
    }
    Ok(statuses)
}

fn order_id_from_response(resp: &serde_json::Value) -> Result<Option<String>> {
    let statuses = check_statuses(resp)?;
    Ok(statuses.first().and_then(|s| {
        s.get("resting")
            .or_else(|| s.get("filled"))
            .and_then(|o| value_as_f64(&o["oid"]).map(|oid| (oid as u64).to_string()))
    }))
}

/// Wire format for numbers: fixed precision with trailing zeros stripped
pub fn float_to_wire(x: f64) -> String {
    let s = format!("{:.8}", x);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" || s.is_empty() {
        "0".to_string()
    } else {
        s.to_string()
    }
}

/// Round to 5 significant figures and at most `6 - sz_decimals` decimals
pub fn format_price(price: f64, sz_decimals: u32) -> String {
    if price <= 0.0 || !price.is_finite() {
        return "0".to_string();
    }
    let magnitude = price.log10().floor() as i32;
    let sig_decimals = (4 - magnitude).max(0) as u32;
    let max_decimals = 6u32.saturating_sub(sz_decimals);
    let decimals = sig_decimals.min(max_decimals);
    let factor = 10f64.powi(decimals as i32);
    float_to_wire((price * factor).round() / factor)
}

pub fn format_size(size: f64, decimals: u32) -> String {
    let factor = 10f64.powi(decimals as i32);
    float_to_wire((size * factor).round() / factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HyperliquidClient {
        HyperliquidClient::new(
            "https://api.hyperliquid-testnet.xyz/",
            NetworkMode::Testnet,
            Some("0x1234".to_string()),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_new_trims_url() {
        assert_eq!(client().api_url, "https://api.hyperliquid-testnet.xyz");
    }

    #[test]
    fn test_float_to_wire() {
        assert_eq!(float_to_wire(50000.0), "50000");
        assert_eq!(float_to_wire(0.0100), "0.01");
        assert_eq!(float_to_wire(0.0), "0");
    }

    #[test]
    fn test_format_price() {
        assert_eq!(format_price(50123.456, 5), "50123");
        assert_eq!(format_price(3000.55, 4), "3000.6");
        assert_eq!(format_price(0.1234567, 0), "0.12346");
        assert_eq!(format_price(1.23456789, 2), "1.2346");
        assert_eq!(format_price(-1.0, 2), "0");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0.012345, 3), "0.012");
        assert_eq!(format_size(22.66, 0), "23");
        assert_eq!(format_size(0.0004, 3), "0");
    }

    fn wire_for(order_type: OrderType, px: f64) -> serde_json::Value {
        let req = OrderRequest {
            symbol: "ETH".to_string(),
            side: crate::exchange::Side::Sell,
            quantity: 0.5,
            limit_px: px,
            order_type,
            reduce_only: order_type.is_trigger(),
        };
        order_wire(&req, AssetInfo { index: 4, sz_decimals: 4 }, "0.5".to_string(), "0xabc".to_string())
    }

    #[test]
    fn test_order_wire_limit() {
        let wire = wire_for(OrderType::Limit, 3000.55);
        assert_eq!(
            serde_json::to_string(&wire).unwrap(),
            r#"{"a":4,"b":false,"p":"3000.6","s":"0.5","r":false,"t":{"limit":{"tif":"Gtc"}},"c":"0xabc"}"#
        );
        assert_eq!(wire_for(OrderType::Market, 3000.0)["t"]["limit"]["tif"], "Ioc");
    }

    #[test]
    fn test_order_wire_triggers() {
        let sl = wire_for(OrderType::StopMarket, 2950.0);
        assert_eq!(
            serde_json::to_string(&sl).unwrap(),
            r#"{"a":4,"b":false,"p":"2950","s":"0.5","r":true,"t":{"trigger":{"isMarket":true,"triggerPx":"2950","tpsl":"sl"}},"c":"0xabc"}"#
        );
        let tp = wire_for(OrderType::TakeProfitMarket, 3100.0);
        assert_eq!(tp["t"]["trigger"]["tpsl"], "tp");
        assert_eq!(tp["t"]["trigger"]["triggerPx"], "3100");
        assert!(tp["t"].get("limit").is_none());
    }

    #[test]
    fn test_order_id_resting() {
        let resp = serde_json::json!({"status": "ok", "response": {"type": "order", "data": {"statuses": [{"resting": {"oid": 77738308}}]}}});
        assert_eq!(order_id_from_response(&resp).unwrap(), Some("77738308".to_string()));
    }

    #[test]
    fn test_order_id_filled() {
        let resp = serde_json::json!({"status": "ok", "response": {"type": "order", "data": {"statuses": [{"filled": {"totalSz": "0.02", "avgPx": "1891.4", "oid": 77747314}}]}}});
        assert_eq!(order_id_from_response(&resp).unwrap(), Some("77747314".to_string()));
    }

    #[test]
    fn test_order_error_status() {
        let resp = serde_json::json!({"status": "ok", "response": {"type": "order", "data": {"statuses": [{"error": "Order must have minimum value of $10."}]}}});
        let err = order_id_from_response(&resp).unwrap_err();
        assert!(err.to_string().contains("minimum value"));
    }

    #[test]
    fn test_err_envelope() {
        let resp = serde_json::json!({"status": "err", "response": "User or API Wallet does not exist."});
        assert!(check_statuses(&resp).is_err());
    }

    #[test]
    fn test_clearinghouse_deser() {
        let json = r#"{
            "assetPositions": [
                {"type": "oneWay", "position": {"coin": "ETH", "szi": "-1.5", "entryPx": "3000.0", "positionValue": "4500", "unrealizedPnl": "-12.5", "returnOnEquity": "0.01", "liquidationPx": "3500.0", "leverage": {"type": "cross", "value": 20}}},
                {"type": "oneWay", "position": {"coin": "BTC", "szi": "0.0", "entryPx": null, "positionValue": "0", "unrealizedPnl": "0", "returnOnEquity": "0", "liquidationPx": null}}
            ],
            "marginSummary": {"accountValue": "1234.5", "totalMarginUsed": "100", "totalNtlPos": "4500", "totalRawUsd": "0"},
            "withdrawable": "1000.25"
        }"#;
        let state: ClearinghouseState = serde_json::from_str(json).unwrap();
        assert_eq!(state.asset_positions.len(), 2);
        assert_eq!(state.withdrawable.as_deref(), Some("1000.25"));
        assert_eq!(state.asset_positions[0].position.leverage.as_ref().unwrap().value, 20.0);
    }

    #[test]
    fn test_meta_and_ctxs_deser() {
        let json = r#"[{"universe": [{"name": "BTC", "szDecimals": 5}, {"name": "ETH", "szDecimals": 4}]},
                       [{"funding": "0.0000125", "openInterest": "1000.5", "markPx": "50000"}, {"funding": "-0.00002", "openInterest": "20000"}]]"#;
        let (meta, ctxs): (MetaResponse, Vec<AssetCtx>) = serde_json::from_str(json).unwrap();
        assert_eq!(meta.universe[1].name, "ETH");
        assert_eq!(ctxs[1].funding.as_deref(), Some("-0.00002"));
    }

    #[test]
    fn test_candle_deser() {
        let json = r#"[{"t": 1700000000000, "T": 1700000179999, "s": "BTC", "i": "3m", "o": "1", "c": "2", "h": "3", "l": "0.5", "v": "10", "n": 4}]"#;
        let candles: Vec<RawCandle> = serde_json::from_str(json).unwrap();
        assert_eq!(candles[0].c, "2");
    }

    #[test]
    fn test_from_config_paper_without_key() {
        let config = ExchangeConfig {
            broker: crate::config::Broker::Hyperliquid,
            network_mode: NetworkMode::Testnet,
            trading_mode: TradingMode::Paper,
            api_url: None,
            wallet_address: None,
            private_key_env: Some("LLM_TRADER_TEST_HL_UNSET".to_string()),
            private_key_path: None,
            api_key_env: None,
            secret_key_env: None,
            paper_log_path: "paper.jsonl".to_string(),
            paper_balance_usd: 100.0,
        };
        let client = HyperliquidClient::from_config(&config).unwrap();
        assert!(client.private_key.is_none());
        assert!(client.require_wallet().is_err());

        let live = ExchangeConfig { trading_mode: TradingMode::Live, ..config };
        assert!(matches!(
            HyperliquidClient::from_config(&live),
            Err(TraderError::MissingEnv(_))
        ));
    }

    #[test]
    fn test_from_config_derives_wallet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hl.key");
        std::fs::write(&path, "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80\n").unwrap();
        let config = ExchangeConfig {
            broker: crate::config::Broker::Hyperliquid,
            network_mode: NetworkMode::Mainnet,
            trading_mode: TradingMode::Live,
            api_url: None,
            wallet_address: None,
            private_key_env: None,
            private_key_path: Some(path.to_str().unwrap().to_string()),
            api_key_env: None,
            secret_key_env: None,
            paper_log_path: "paper.jsonl".to_string(),
            paper_balance_usd: 100.0,
        };
        let client = HyperliquidClient::from_config(&config).unwrap();
        assert!(client.private_key.as_deref().unwrap().starts_with("0x"));
        assert_eq!(
            client.wallet_address.unwrap().to_lowercase(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }
}
