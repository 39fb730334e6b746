//! Paper trading: simulated fills against live market data.
//!
//! Market data calls go to the wrapped broker; orders never leave the
//! process. Entry orders fill immediately (limit orders at their price, market
//! orders at the mid); reduce-only exits rest as take-profit/stop triggers
//! until the mid crosses them and never fill for more than the position.
//! Every fill is appended to a JSONL log.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{
    current_timestamp_ms, AccountInfo, Exchange, Kline, OrderAck, OrderRequest, OrderType,
    Position, PositionSide, Side,
};
use crate::error::{Result, TraderError};

/// Taker fee applied to every simulated fill
const FEE_RATE: f64 = 0.00035;
const EPSILON: f64 = 1e-10;

/// A simulated position; `size` is signed, negative for shorts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperPosition {
    pub coin: String,
    pub size: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
}

/// A resting reduce-only order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperOrder {
    pub oid: u64,
    pub coin: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    /// Fires when the mid rises to `price` (otherwise when it falls to it)
    pub trigger_above: bool,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperFill {
    pub timestamp: u64,
    pub oid: u64,
    pub coin: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub pnl: f64,
    pub fee: f64,
}

/// In-memory order book and ledger
#[derive(Debug)]
pub struct PaperBook {
    positions: HashMap<String, PaperPosition>,
    orders: Vec<PaperOrder>,
    fills: Vec<PaperFill>,
    next_oid: u64,
    balance: f64,
    initial_balance: f64,
    total_fees: f64,
    log_path: String,
}

impl PaperBook {
    pub fn new(initial_balance: f64, log_path: String) -> Self {
        Self {
            positions: HashMap::new(),
            orders: Vec::new(),
            fills: Vec::new(),
            next_oid: 1,
            balance: initial_balance,
            initial_balance,
            total_fees: 0.0,
            log_path,
        }
    }

    fn take_oid(&mut self) -> u64 {
        let oid = self.next_oid;
        self.next_oid += 1;
        oid
    }

    /// Fill an entry order at `price`
    pub fn fill_now(&mut self, coin: &str, side: Side, size: f64, price: f64) -> u64 {
        let oid = self.take_oid();
        self.fill(oid, coin, side, size, price);
        oid
    }

    /// Immediately close up to `size` of the open position
    pub fn reduce_now(&mut self, coin: &str, side: Side, size: f64, price: f64) -> Result<u64> {
        let open = self
            .positions
            .get(coin)
            .filter(|p| (p.size > 0.0) == (side == Side::Sell))
            .map(|p| p.size.abs())
            .ok_or_else(|| TraderError::Exchange(format!("reduce-only {} has nothing to reduce in {}", side.as_str(), coin)))?;
        Ok(self.fill_now(coin, side, size.min(open), price))
    }

    /// Rest a reduce-only order against the open position; the trigger
    /// direction follows from where `price` sits relative to entry
    pub fn rest_reduce_only(&mut self, coin: &str, side: Side, size: f64, price: f64) -> Result<u64> {
        self.rest_exit(coin, side, size, price, OrderType::Limit)
    }

    /// Rest a reduce-only exit. Stops fire when the price moves against the
    /// position, take-profits when it moves in its favour.
    pub fn rest_exit(&mut self, coin: &str, side: Side, size: f64, price: f64, kind: OrderType) -> Result<u64> {
        let pos = self
            .positions
            .get(coin)
            .ok_or_else(|| TraderError::Exchange(format!("no paper position in {} to reduce", coin)))?;
        let closes_long = pos.size > 0.0;
        if closes_long != (side == Side::Sell) {
            return Err(TraderError::Exchange(format!(
                "reduce-only {} would increase the {} position",
                side.as_str(),
                coin
            )));
        }
        let trigger_above = match kind {
            OrderType::TakeProfitMarket => closes_long,
            OrderType::StopMarket => !closes_long,
            // TP above entry for longs and below for shorts; stops the other way round
            OrderType::Limit | OrderType::Market => price > pos.entry_price,
        };
        let oid = self.take_oid();
        info!(oid, coin, side = side.as_str(), price, size, trigger_above, "[PAPER] reduce-only order resting");
        self.orders.push(PaperOrder {
            oid,
            coin: coin.to_string(),
            side,
            price,
            size,
            trigger_above,
            timestamp: current_timestamp_ms(),
        });
        Ok(oid)
    }

    pub fn cancel(&mut self, oid: u64) -> bool {
        let before = self.orders.len();
        self.orders.retain(|o| o.oid != oid);
        let removed = self.orders.len() < before;
        if removed {
            info!(oid, "[PAPER] order canceled");
        }
        removed
    }

    /// Fire resting orders whose trigger was crossed, then mark positions to market
    pub fn on_prices(&mut self, mids: &HashMap<String, f64>) {
        let triggered: Vec<(u64, f64)> = self
            .orders
            .iter()
            .filter_map(|o| {
                let mid = *mids.get(&o.coin)?;
                let hit = if o.trigger_above { mid >= o.price } else { mid <= o.price };
                hit.then_some((o.oid, o.price))
            })
            .collect();

        for (oid, price) in triggered {
            // an earlier trigger may already have closed the position and cleared siblings
            let Some(idx) = self.orders.iter().position(|o| o.oid == oid) else {
                continue;
            };
            let order = self.orders.remove(idx);
            // never more than the position, and never in the direction of it
            let closable = self
                .positions
                .get(&order.coin)
                .filter(|p| (p.size > 0.0) == (order.side == Side::Sell))
                .map(|p| p.size.abs());
            match closable {
                Some(open) => self.fill(order.oid, &order.coin, order.side, order.size.min(open), price),
                None => warn!(oid, coin = %order.coin, "[PAPER] reduce-only order has nothing to reduce, dropped"),
            }
        }

        for pos in self.positions.values_mut() {
            if let Some(&mid) = mids.get(&pos.coin) {
                pos.unrealized_pnl = (mid - pos.entry_price) * pos.size;
            }
        }
    }

    fn position_sign(&self, coin: &str) -> f64 {
        self.positions.get(coin).map_or(0.0, |p| p.size.signum())
    }

    fn fill(&mut self, oid: u64, coin: &str, side: Side, size: f64, price: f64) {
        let signed = if side.is_buy() { size } else { -size };
        let sign_before = self.position_sign(coin);
        let pnl = self.update_position(coin, signed, price);
        let fee = price * size.abs() * FEE_RATE;
        self.balance -= fee;
        self.total_fees += fee;

        // exits resting against a closed or flipped position no longer apply
        if sign_before != 0.0 && self.position_sign(coin) != sign_before {
            let dropped = self.orders.iter().filter(|o| o.coin == coin).count();
            self.orders.retain(|o| o.coin != coin);
            if dropped > 0 {
                info!(coin, dropped, "[PAPER] position closed or flipped, resting orders canceled");
            }
        }

        let fill = PaperFill {
            timestamp: current_timestamp_ms(),
            oid,
            coin: coin.to_string(),
            side,
            price,
            size,
            pnl,
            fee,
        };
        info!(oid, coin, side = side.as_str(), price, size, pnl, fee, "[PAPER] order filled");
        self.log_fill(&fill);
        self.fills.push(fill);
    }

    /// Apply a signed fill; returns realized PnL from any closing portion
    fn update_position(&mut self, coin: &str, signed_size: f64, price: f64) -> f64 {
        let Some(pos) = self.positions.get_mut(coin) else {
            if signed_size.abs() > EPSILON {
                self.positions.insert(
                    coin.to_string(),
                    PaperPosition {
                        coin: coin.to_string(),
                        size: signed_size,
                        entry_price: price,
                        unrealized_pnl: 0.0,
                    },
                );
            }
            return 0.0;
        };

        let old = pos.size;
        let mut realized = 0.0;
        if old * signed_size < 0.0 {
            let closing = signed_size.abs().min(old.abs());
            realized = (price - pos.entry_price) * closing * old.signum();
            self.balance += realized;
        }

        let new_size = old + signed_size;
        if new_size.abs() < EPSILON {
            self.positions.remove(coin);
        } else if old * signed_size > 0.0 {
            pos.entry_price = (pos.entry_price * old.abs() + price * signed_size.abs()) / new_size.abs();
            pos.size = new_size;
        } else {
            if old * new_size < 0.0 {
                pos.entry_price = price;
            }
            pos.size = new_size;
        }
        realized
    }

    fn log_fill(&self, fill: &PaperFill) {
        if let Some(parent) = Path::new(&self.log_path).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut file| {
                let json = serde_json::to_string(fill).map_err(std::io::Error::other)?;
                writeln!(file, "{}", json)
            });
        if let Err(e) = result {
            warn!(path = %self.log_path, error = %e, "failed to write paper fill");
        }
    }

    pub fn positions(&self) -> Vec<&PaperPosition> {
        self.positions.values().collect()
    }

    pub fn open_orders(&self) -> &[PaperOrder] {
        &self.orders
    }

    pub fn fills(&self) -> &[PaperFill] {
        &self.fills
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn unrealized(&self) -> f64 {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }

    /// Balance change plus open PnL
    pub fn total_pnl(&self) -> f64 {
        self.balance - self.initial_balance + self.unrealized()
    }

    pub fn total_fees(&self) -> f64 {
        self.total_fees
    }
}

/// [`Exchange`] that simulates orders on top of a real broker's market data
pub struct PaperExchange {
    inner: Arc<dyn Exchange>,
    book: Mutex<PaperBook>,
}

impl PaperExchange {
    pub fn new(inner: Arc<dyn Exchange>, initial_balance: f64, log_path: String) -> Self {
        Self {
            inner,
            book: Mutex::new(PaperBook::new(initial_balance, log_path)),
        }
    }

    /// Pull mids from the broker and let resting orders react to them
    async fn refresh(&self) -> Result<HashMap<String, f64>> {
        let mids = self.inner.get_all_mids().await?;
        self.book.lock().await.on_prices(&mids);
        Ok(mids)
    }

    pub async fn total_pnl(&self) -> f64 {
        self.book.lock().await.total_pnl()
    }

    pub async fn fill_count(&self) -> usize {
        self.book.lock().await.fills().len()
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn get_account_info(&self) -> Result<AccountInfo> {
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "[PAPER] mark-to-market skipped");
        }
        let book = self.book.lock().await;
        let account_value = book.balance() + book.unrealized();
        Ok(AccountInfo {
            account_value,
            available_balance: Some(book.balance()),
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        self.refresh().await?;
        let book = self.book.lock().await;
        Ok(book
            .positions()
            .into_iter()
            .map(|p| Position {
                symbol: p.coin.clone(),
                side: if p.size > 0.0 { PositionSide::Long } else { PositionSide::Short },
                quantity: p.size.abs(),
                entry_price: p.entry_price,
                leverage: 1.0,
                unrealized_pnl: p.unrealized_pnl,
                liquidation_price: 0.0,
            })
            .collect())
    }

    async fn get_all_mids(&self) -> Result<HashMap<String, f64>> {
        self.refresh().await
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck> {
        if req.quantity <= 0.0 {
            return Err(TraderError::Exchange(format!("invalid paper order size {}", req.quantity)));
        }
        // market orders fill at the mid; everything else at its own price
        let price = if req.order_type == OrderType::Market || req.limit_px <= 0.0 {
            self.inner
                .get_all_mids()
                .await?
                .get(&req.symbol)
                .copied()
                .filter(|p| *p > 0.0)
                .ok_or_else(|| TraderError::Exchange(format!("no mid price for {}", req.symbol)))?
        } else {
            req.limit_px
        };

        let mut book = self.book.lock().await;
        let (oid, status) = if req.reduce_only && req.order_type != OrderType::Market {
            (book.rest_exit(&req.symbol, req.side, req.quantity, price, req.order_type)?, "resting")
        } else if req.reduce_only {
            (book.reduce_now(&req.symbol, req.side, req.quantity, price)?, "filled")
        } else {
            (book.fill_now(&req.symbol, req.side, req.quantity, price), "filled")
        };
        Ok(OrderAck {
            order_id: Some(oid.to_string()),
            raw: serde_json::json!({"paper": true, "status": status, "oid": oid, "price": price}),
        })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<OrderAck> {
        let oid: u64 = order_id
            .parse()
            .map_err(|_| TraderError::Exchange(format!("invalid paper order id {}", order_id)))?;
        if !self.book.lock().await.cancel(oid) {
            return Err(TraderError::Exchange(format!(
                "paper order {} for {} is not open",
                order_id, symbol
            )));
        }
        Ok(OrderAck {
            order_id: Some(order_id.to_string()),
            raw: serde_json::json!({"paper": true, "status": "canceled"}),
        })
    }

    async fn get_klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Kline>> {
        self.inner.get_klines(symbol, interval, limit).await
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<Option<f64>> {
        self.inner.get_funding_rate(symbol).await
    }

    async fn get_open_interest(&self, symbol: &str) -> Result<Option<f64>> {
        self.inner.get_open_interest(symbol).await
    }
}
