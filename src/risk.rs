//! Pre-trade risk checks.
//!
//! Validates what the model asked for (coin, leverage, size) and enforces
//! account limits: notional per position, open position count and a daily
//! loss limit measured from the first equity reading of each UTC day.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{info, warn};

use crate::config::RiskConfig;

/// Risk check result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskDecision {
    Allowed,
    Rejected(String),
}

impl RiskDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RiskDecision::Allowed)
    }
}

/// Event logged by the risk manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEvent {
    pub timestamp: i64,
    pub event_type: String,
    pub details: String,
}

/// Size a position so that hitting the stop loses `risk_usd`
pub fn quantity_for_risk(entry_price: f64, stop_loss: f64, risk_usd: f64) -> Option<f64> {
    let distance = (entry_price - stop_loss).abs();
    if distance == 0.0 || !distance.is_finite() || risk_usd <= 0.0 {
        return None;
    }
    Some(risk_usd / distance)
}

/// Events kept in memory; older ones are only in the log
const MAX_EVENTS: usize = 500;

pub struct RiskManager {
    config: RiskConfig,
    allowed_coins: Vec<String>,
    day: NaiveDate,
    day_start_equity: Option<f64>,
    last_equity: Option<f64>,
    open_position_count: usize,
    events: VecDeque<RiskEvent>,
}

impl RiskManager {
    pub fn new(config: RiskConfig, allowed_coins: Vec<String>) -> Self {
        Self {
            config,
            allowed_coins,
            day: Utc::now().date_naive(),
            day_start_equity: None,
            last_equity: None,
            open_position_count: 0,
            events: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Check the order the model asked for before sizing it against the account
    pub fn validate_order(&mut self, symbol: &str, quantity: f64, leverage: u32) -> RiskDecision {
        if !self.allowed_coins.iter().any(|c| c.eq_ignore_ascii_case(symbol)) {
            return self.reject(format!("{} is not a tradable coin", symbol));
        }
        if leverage < 1 || leverage > self.config.max_leverage {
            return self.reject(format!(
                "leverage {}x outside 1..={}x",
                leverage, self.config.max_leverage
            ));
        }
        if !quantity.is_finite() || quantity <= 0.0 {
            return self.reject(format!("invalid quantity {}", quantity));
        }
        RiskDecision::Allowed
    }

    /// Check a new order against the account limits
    pub fn check_order(&mut self, position_size_usd: f64, is_new_position: bool) -> RiskDecision {
        self.maybe_reset_daily(Utc::now().date_naive());

        if position_size_usd > self.config.max_position_size_usd {
            return self.reject(format!(
                "position size ${:.2} exceeds max ${:.2}",
                position_size_usd, self.config.max_position_size_usd
            ));
        }

        if is_new_position && self.open_position_count >= self.config.max_open_positions {
            return self.reject(format!(
                "max open positions ({}) reached",
                self.config.max_open_positions
            ));
        }

        let daily_pnl = self.daily_pnl();
        if daily_pnl < -self.config.max_daily_loss_usd {
            return self.reject(format!(
                "daily loss ${:.2} exceeds limit ${:.2}",
                daily_pnl.abs(),
                self.config.max_daily_loss_usd
            ));
        }

        RiskDecision::Allowed
    }

    /// Record the latest account value
    pub fn update_equity(&mut self, value: f64) {
        self.update_equity_on(value, Utc::now().date_naive());
    }

    pub(crate) fn update_equity_on(&mut self, value: f64, date: NaiveDate) {
        self.maybe_reset_daily(date);
        if self.day_start_equity.is_none() {
            self.day_start_equity = Some(value);
        }
        self.last_equity = Some(value);

        if self.daily_pnl() < -self.config.max_daily_loss_usd {
            let msg = format!(
                "daily loss limit breached: ${:.2} (limit: ${:.2})",
                self.daily_pnl().abs(),
                self.config.max_daily_loss_usd
            );
            warn!("{}", msg);
            self.log_event("daily_loss_limit_breached", &msg);
        }
    }

    pub fn set_open_positions(&mut self, count: usize) {
        self.open_position_count = count;
    }

    /// Equity change since the first reading of the day
    pub fn daily_pnl(&self) -> f64 {
        match (self.day_start_equity, self.last_equity) {
            (Some(start), Some(last)) => last - start,
            _ => 0.0,
        }
    }

    /// Most recent events, oldest first
    pub fn events(&self) -> &VecDeque<RiskEvent> {
        &self.events
    }

    pub fn status(&self) -> RiskStatus {
        RiskStatus {
            daily_pnl: self.daily_pnl(),
            open_positions: self.open_position_count,
            daily_loss_limit: self.config.max_daily_loss_usd,
            max_position_size: self.config.max_position_size_usd,
            max_open_positions: self.config.max_open_positions,
            max_leverage: self.config.max_leverage,
        }
    }

    fn maybe_reset_daily(&mut self, today: NaiveDate) {
        if today != self.day {
            info!(
                old_date = %self.day,
                new_date = %today,
                final_daily_pnl = self.daily_pnl(),
                "daily risk counters reset"
            );
            self.day = today;
            self.day_start_equity = None;
            self.last_equity = None;
        }
    }

    fn reject(&mut self, reason: String) -> RiskDecision {
        warn!(reason = %reason, "order rejected by risk manager");
        self.log_event("order_rejected", &reason);
        RiskDecision::Rejected(reason)
    }

    fn log_event(&mut self, event_type: &str, details: &str) {
        if self.events.len() == MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(RiskEvent {
            timestamp: Utc::now().timestamp(),
            event_type: event_type.to_string(),
            details: details.to_string(),
        });
    }
}

/// Risk status summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskStatus {
    pub daily_pnl: f64,
    pub open_positions: usize,
    pub daily_loss_limit: f64,
    pub max_position_size: f64,
    pub max_open_positions: usize,
    pub max_leverage: u32,
}
