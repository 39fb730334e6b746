//! Bracket orders: an entry plus reduce-only take-profit and stop-loss legs.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::exchange::{Exchange, OrderRequest, OrderType, Side};

/// Exchange ids of the three legs of a bracket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketIds {
    pub symbol: String,
    pub main: Option<String>,
    pub tp: Option<String>,
    pub sl: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BracketRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub limit_px: f64,
    pub take_profit_px: Option<f64>,
    pub stop_loss_px: Option<f64>,
    pub order_type: OrderType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedBracket {
    pub key: String,
    pub ids: BracketIds,
}

pub struct OrderManager {
    exchange: Arc<dyn Exchange>,
    active: Mutex<BTreeMap<String, BracketIds>>,
}

impl OrderManager {
    pub fn new(exchange: Arc<dyn Exchange>) -> Self {
        Self {
            exchange,
            active: Mutex::new(BTreeMap::new()),
        }
    }

    /// Place the entry, then TP and SL on the opposite side.
    /// Returns `None` when the entry itself fails; a failed leg is logged and left empty.
    pub async fn place_bracket_order(&self, req: &BracketRequest) -> Option<PlacedBracket> {
        info!(coin = %req.symbol, side = req.side.as_str(), quantity = req.quantity, price = req.limit_px, "placing bracket order");

        let entry = OrderRequest {
            symbol: req.symbol.clone(),
            side: req.side,
            quantity: req.quantity,
            limit_px: req.limit_px,
            order_type: req.order_type,
            reduce_only: false,
        };
        let main = match self.exchange.place_order(&entry).await {
            Ok(ack) => ack.order_id,
            Err(e) => {
                error!(coin = %req.symbol, error = %e, "entry order failed, skipping TP/SL");
                return None;
            }
        };

        let tp = self
            .place_exit(req, req.take_profit_px, OrderType::TakeProfitMarket, "tp")
            .await;
        let sl = self.place_exit(req, req.stop_loss_px, OrderType::StopMarket, "sl").await;
        let ids = BracketIds {
            symbol: req.symbol.clone(),
            main,
            tp,
            sl,
        };

        let mut active = self.active.lock().await;
        let base = format!("{}_{}", req.symbol, Utc::now().timestamp());
        let mut key = base.clone();
        let mut n = 1;
        while active.contains_key(&key) {
            key = format!("{}_{}", base, n);
            n += 1;
        }
        active.insert(key.clone(), ids.clone());
        info!(key = %key, ?ids, "bracket order recorded");
        Some(PlacedBracket { key, ids })
    }

    /// Exits are reduce-only trigger orders; `price` is the trigger
    async fn place_exit(
        &self,
        req: &BracketRequest,
        price: Option<f64>,
        order_type: OrderType,
        leg: &str,
    ) -> Option<String> {
        let price = price?;
        let exit = OrderRequest {
            symbol: req.symbol.clone(),
            side: req.side.opposite(),
            quantity: req.quantity,
            limit_px: price,
            order_type,
            reduce_only: true,
        };
        match self.exchange.place_order(&exit).await {
            Ok(ack) => {
                info!(coin = %req.symbol, leg, price, oid = ?ack.order_id, "exit order placed");
                ack.order_id
            }
            Err(e) => {
                error!(coin = %req.symbol, leg, price, error = %e, "exit order failed");
                None
            }
        }
    }

    /// Cancel every leg of a bracket and stop tracking it
    pub async fn cancel_bracket_order(&self, key: &str) {
        let Some(ids) = self.active.lock().await.remove(key) else {
            warn!(key, "bracket not found");
            return;
        };
        for (leg, id) in [("main", &ids.main), ("tp", &ids.tp), ("sl", &ids.sl)] {
            let Some(id) = id else { continue };
            match self.exchange.cancel_order(id, &ids.symbol).await {
                Ok(_) => info!(key, leg, oid = %id, "order cancelled"),
                Err(e) => warn!(key, leg, oid = %id, error = %e, "cancel failed"),
            }
        }
        info!(key, "bracket removed from tracking");
    }

    /// Cancel and forget every bracket whose symbol has no open position.
    /// Returns the keys that were dropped.
    pub async fn reconcile(&self, open_symbols: &HashSet<String>) -> Vec<String> {
        let closed: Vec<String> = self
            .active
            .lock()
            .await
            .iter()
            .filter(|(_, ids)| !open_symbols.contains(&ids.symbol.to_ascii_uppercase()))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &closed {
            self.cancel_bracket_order(key).await;
        }
        closed
    }

    /// Snapshot of the tracked brackets
    pub async fn get_active_brackets(&self) -> BTreeMap<String, BracketIds> {
        self.active.lock().await.clone()
    }
}
