//! Account state as presented to the model: value, return, Sharpe, positions.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::Result;
use crate::exchange::{Exchange, Position};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub total_return_pct: f64,
    pub available_cash: f64,
    pub total_account_value: f64,
    pub sharpe_ratio: f64,
    pub positions: Vec<Position>,
}

impl AccountSnapshot {
    /// Returned when the exchange cannot be reached
    pub fn fallback(initial_capital: f64) -> Self {
        Self {
            total_return_pct: 0.0,
            available_cash: initial_capital,
            total_account_value: initial_capital,
            sharpe_ratio: 0.0,
            positions: Vec::new(),
        }
    }
}

pub struct AccountState {
    exchange: Arc<dyn Exchange>,
    initial_capital: f64,
    equity_history: Mutex<Vec<f64>>,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Annualised Sharpe ratio of per-period returns (sample stdev, √365)
pub fn sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std = variance.sqrt();
    if std == 0.0 {
        return 0.0;
    }
    mean / std * 365f64.sqrt()
}

/// Period-over-period returns of an equity curve
pub fn equity_returns(equity: &[f64]) -> Vec<f64> {
    equity
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect()
}

impl AccountState {
    pub fn new(exchange: Arc<dyn Exchange>, initial_capital: f64) -> Self {
        Self {
            exchange,
            initial_capital,
            equity_history: Mutex::new(Vec::new()),
        }
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    /// Current snapshot; never fails, falls back on exchange errors
    pub async fn get(&self) -> AccountSnapshot {
        match self.try_get().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "account state unavailable, using fallback");
                AccountSnapshot::fallback(self.initial_capital)
            }
        }
    }

    /// Current snapshot, or the exchange error; successful reads extend the equity history
    pub async fn try_get(&self) -> Result<AccountSnapshot> {
        let info = self.exchange.get_account_info().await?;
        let positions = self.exchange.get_positions().await?;

        let value = info.account_value;
        let sharpe = {
            let mut history = self.equity_history.lock().await;
            history.push(value);
            sharpe_ratio(&equity_returns(&history))
        };
        let total_return_pct = if self.initial_capital > 0.0 {
            (value / self.initial_capital - 1.0) * 100.0
        } else {
            0.0
        };

        Ok(AccountSnapshot {
            total_return_pct: round_to(total_return_pct, 2),
            available_cash: round_to(info.available_balance.unwrap_or(value), 2),
            total_account_value: round_to(value, 2),
            sharpe_ratio: round_to(sharpe, 3),
            positions,
        })
    }
}
