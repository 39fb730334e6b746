//! One trading agent: market data, prompt, model call, decision, orders, journal.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::account::{AccountSnapshot, AccountState};
use crate::config::AgentConfig;
use crate::decision::{parse_llm_output, Signal, TradingDecision};
use crate::error::{Result, TraderError};
use crate::exchange::{Exchange, OrderType, Side};
use crate::journal::{Journal, JournalEntry};
use crate::llm::LanguageModel;
use crate::market::{AssetSnapshot, MarketFetcher};
use crate::metrics::Metrics;
use crate::order_manager::{BracketRequest, OrderManager, PlacedBracket};
use crate::prompt::{PromptBuilder, PromptContext};
use crate::risk::{quantity_for_risk, RiskDecision, RiskManager};

/// What happened to a decision
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Skipped(String),
    Placed(PlacedBracket),
    Failed(String),
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionOutcome::Skipped(reason) => write!(f, "skipped: {}", reason),
            ExecutionOutcome::Placed(placed) => write!(f, "placed: {}", placed.key),
            ExecutionOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

pub struct LlmAgent {
    config: AgentConfig,
    exchange: Arc<dyn Exchange>,
    llm: Arc<dyn LanguageModel>,
    market: MarketFetcher,
    account: AccountState,
    orders: OrderManager,
    risk: RiskManager,
    prompt: PromptBuilder,
    journal: Journal,
    metrics: Metrics,
    invocation_count: u64,
}

impl LlmAgent {
    pub fn new(config: AgentConfig, exchange: Arc<dyn Exchange>, llm: Arc<dyn LanguageModel>) -> Result<Self> {
        let mut prompt = PromptBuilder::new(&config.name, config.assets.clone());
        if let Some(path) = config.prompt_template.as_deref() {
            prompt = prompt.with_template_file(path)?;
        }
        let journal = Journal::open(Path::new(&config.journal_dir), &config.name)?;

        info!(
            agent = %config.name,
            model = llm.model(),
            exchange = exchange.name(),
            assets = ?config.assets,
            interval_sec = config.interval_sec,
            journal = %journal.path().display(),
            "agent initialized"
        );

        Ok(Self {
            market: MarketFetcher::new(exchange.clone(), config.assets.clone(), config.candle_limit),
            account: AccountState::new(exchange.clone(), config.capital_usd),
            orders: OrderManager::new(exchange.clone()),
            risk: RiskManager::new(config.risk.clone(), config.assets.clone()),
            prompt,
            journal,
            metrics: Metrics::new(),
            invocation_count: 0,
            config,
            exchange,
            llm,
        })
    }

    /// Delay between coins while fetching market data
    pub fn with_market_pause(self, pause: Duration) -> Self {
        Self {
            market: self.market.with_pause(pause),
            ..self
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn invocation_count(&self) -> u64 {
        self.invocation_count
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn orders(&self) -> &OrderManager {
        &self.orders
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub fn build_prompt(
        &self,
        market: &BTreeMap<String, Option<AssetSnapshot>>,
        account: &AccountSnapshot,
    ) -> Result<String> {
        self.prompt.render(&PromptContext {
            invocation_count: self.invocation_count,
            now: Utc::now(),
            market,
            account,
        })
    }

    /// Size, check and submit a decision as a bracket order
    pub async fn execute_decision(&mut self, decision: &TradingDecision) -> ExecutionOutcome {
        let symbol = decision.symbol.as_str();
        let side = match decision.action {
            Signal::Hold => return ExecutionOutcome::Skipped("hold".to_string()),
            Signal::Buy => Side::Buy,
            Signal::Sell => Side::Sell,
        };

        let mids = match self.exchange.get_all_mids().await {
            Ok(mids) => mids,
            Err(e) => return ExecutionOutcome::Failed(format!("price lookup failed: {}", e)),
        };
        let Some(mid) = mids.get(symbol).copied().filter(|p| *p > 0.0) else {
            warn!(agent = %self.config.name, coin = symbol, "no mid price, skipping");
            return ExecutionOutcome::Skipped(format!("no price for {}", symbol));
        };

        if let Some(stop) = decision.stop_loss {
            let wrong_side = match side {
                Side::Buy => stop >= mid,
                Side::Sell => stop <= mid,
            };
            if wrong_side {
                return ExecutionOutcome::Skipped(format!(
                    "stop loss {} on wrong side of {} for {}",
                    stop,
                    mid,
                    side.as_str()
                ));
            }
        }

        let risk_usd = decision.risk_usd.unwrap_or(self.config.risk.default_risk_usd);
        let quantity = match decision.stop_loss {
            Some(stop) => {
                match self.market.atr14_4h(symbol).await {
                    Ok(Some(atr)) => info!(agent = %self.config.name, coin = symbol, atr, "volatility"),
                    Ok(None) => {
                        return ExecutionOutcome::Skipped(format!(
                            "ATR unavailable for {}: not enough 4h candles",
                            symbol
                        ))
                    }
                    Err(e) => {
                        warn!(agent = %self.config.name, coin = symbol, error = %e, "ATR unavailable");
                        return ExecutionOutcome::Skipped(format!("ATR unavailable for {}: {}", symbol, e));
                    }
                }
                quantity_for_risk(mid, stop, risk_usd).unwrap_or(0.0)
            }
            None => decision.quantity,
        };
        if quantity.is_nan() || quantity <= 0.0 {
            return ExecutionOutcome::Skipped(format!("non-positive quantity {}", quantity));
        }

        let leverage = decision.leverage.unwrap_or(self.config.risk.default_leverage);
        if let RiskDecision::Rejected(reason) = self.risk.validate_order(symbol, quantity, leverage) {
            return ExecutionOutcome::Skipped(reason);
        }

        let is_new = match self.exchange.get_positions().await {
            Ok(positions) => {
                self.risk.set_open_positions(positions.len());
                !positions.iter().any(|p| p.symbol.eq_ignore_ascii_case(symbol))
            }
            Err(e) => {
                warn!(agent = %self.config.name, error = %e, "positions unavailable, treating order as new");
                true
            }
        };
        if let RiskDecision::Rejected(reason) = self.risk.check_order(quantity * mid, is_new) {
            return ExecutionOutcome::Skipped(reason);
        }

        let offset = self.config.risk.limit_offset_pct / 100.0;
        let limit_px = match side {
            Side::Buy => mid * (1.0 + offset),
            Side::Sell => mid * (1.0 - offset),
        };

        info!(
            agent = %self.config.name,
            coin = symbol,
            side = side.as_str(),
            quantity,
            limit_px,
            leverage,
            risk_usd,
            "executing decision"
        );
        let request = BracketRequest {
            symbol: symbol.to_string(),
            side,
            quantity,
            limit_px,
            take_profit_px: decision.profit_target,
            stop_loss_px: decision.stop_loss,
            order_type: OrderType::Limit,
        };
        match self.orders.place_bracket_order(&request).await {
            Some(placed) => {
                self.metrics.record_order(true);
                ExecutionOutcome::Placed(placed)
            }
            None => {
                self.metrics.record_order(false);
                ExecutionOutcome::Failed("entry order rejected".to_string())
            }
        }
    }

    /// One full cycle. Never fails: errors end up in the returned journal entry.
    pub async fn run_cycle(&mut self) -> JournalEntry {
        let mut entry = JournalEntry::new(&self.config.name, self.invocation_count);
        info!(agent = %self.config.name, invocation = self.invocation_count, "cycle started");

        let result = self.cycle(&mut entry).await;
        self.invocation_count += 1;
        match result {
            Ok(()) => self.metrics.record_cycle(true),
            Err(e) => {
                error!(agent = %self.config.name, error = %e, "cycle failed");
                entry.error = Some(e.to_string());
                self.metrics.record_cycle(false);
            }
        }

        if let Err(e) = self.journal.append(&entry) {
            warn!(agent = %self.config.name, error = %e, "failed to write journal entry");
        }
        self.metrics.log(&self.config.name);
        entry
    }

    /// Stop tracking brackets whose position has closed and cancel their leftover legs
    async fn reconcile_brackets(&self) {
        if self.orders.get_active_brackets().await.is_empty() {
            return;
        }
        match self.exchange.get_positions().await {
            Ok(positions) => {
                let open: HashSet<String> = positions.into_iter().map(|p| p.symbol.to_ascii_uppercase()).collect();
                let closed = self.orders.reconcile(&open).await;
                if !closed.is_empty() {
                    info!(agent = %self.config.name, brackets = ?closed, "closed brackets cleaned up");
                }
            }
            Err(e) => warn!(agent = %self.config.name, error = %e, "positions unavailable, brackets not reconciled"),
        }
    }

    async fn cycle(&mut self, entry: &mut JournalEntry) -> Result<()> {
        self.reconcile_brackets().await;

        let market = self.market.get_all_assets().await;
        entry.market = market.clone();

        let account = match self.account.try_get().await {
            Ok(snapshot) => {
                self.risk.update_equity(snapshot.total_account_value);
                self.risk.set_open_positions(snapshot.positions.len());
                snapshot
            }
            Err(e) => {
                warn!(agent = %self.config.name, error = %e, "account state unavailable, using fallback");
                AccountSnapshot::fallback(self.account.initial_capital())
            }
        };
        entry.account = Some(account.clone());

        let prompt = self.build_prompt(&market, &account)?;
        entry.prompt_chars = prompt.chars().count();

        let response = self.llm.complete(&prompt, None).await?;
        self.metrics.record_tokens(response.input_tokens, response.output_tokens);
        info!(
            agent = %self.config.name,
            model = %response.model,
            tokens_in = response.input_tokens,
            tokens_out = response.output_tokens,
            "model responded"
        );
        entry.llm_response = Some(response.content.clone());

        let decision = parse_llm_output(&response.content).map_err(|e| TraderError::Parse(e.to_string()))?;
        self.metrics.record_decision(decision.action);
        info!(
            agent = %self.config.name,
            coin = %decision.symbol,
            action = %decision.action,
            confidence = decision.confidence,
            "decision parsed"
        );
        entry.decision = Some(decision.clone());

        let outcome = self.execute_decision(&decision).await;
        info!(agent = %self.config.name, outcome = %outcome, "decision executed");
        entry.outcome = Some(outcome.to_string());
        Ok(())
    }

    /// Run cycles every `interval_sec` until `shutdown` fires.
    /// A cycle in progress is finished before the loop exits.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_sec));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(agent = %self.config.name, "agent loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            agent = %self.config.name,
            cycles = self.metrics.cycles_total,
            "agent stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::decision::ChainOfThought;
    use crate::error::TraderError;
    use crate::exchange::{Kline, MockExchange, OrderAck, Position, PositionSide};
    use crate::llm::LLMResponse;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct CannedModel(String);

    #[async_trait]
    impl LanguageModel for CannedModel {
        fn model(&self) -> &str {
            "canned"
        }

        async fn complete(&self, _prompt: &str, _system_prompt: Option<&str>) -> Result<LLMResponse> {
            Ok(LLMResponse {
                content: self.0.clone(),
                model: "canned".to_string(),
                input_tokens: 10,
                output_tokens: 5,
            })
        }
    }

    fn agent_config(dir: &Path) -> AgentConfig {
        let mut config = Config::example().agents.remove(0);
        config.name = "unit".to_string();
        config.journal_dir = dir.to_string_lossy().to_string();
        config.risk.max_position_size_usd = 1000.0;
        config.risk.limit_offset_pct = 0.1;
        config
    }

    fn decision(action: Signal, stop: Option<f64>) -> TradingDecision {
        TradingDecision {
            symbol: "ETH".to_string(),
            action,
            confidence: 0.7,
            justification: "test".to_string(),
            quantity: 0.1,
            leverage: Some(5),
            stop_loss: stop,
            profit_target: Some(2100.0),
            invalidation_condition: None,
            risk_usd: Some(10.0),
            chain_of_thought: ChainOfThought::default(),
        }
    }

    fn with_mid(ex: &mut MockExchange, price: f64) {
        ex.expect_name().return_const("mock");
        ex.expect_get_all_mids()
            .returning(move || Ok(HashMap::from([("ETH".to_string(), price)])));
    }

    fn flat_candles(n: usize, price: f64) -> Vec<Kline> {
        (0..n)
            .map(|i| Kline { t: i as u64 * 14_400_000, o: price, h: price + 10.0, l: price - 10.0, c: price, v: 1.0 })
            .collect()
    }

    fn agent(dir: &Path, ex: MockExchange) -> LlmAgent {
        LlmAgent::new(agent_config(dir), Arc::new(ex), Arc::new(CannedModel(String::new())))
            .unwrap()
            .with_market_pause(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_hold_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut ex = MockExchange::new();
        ex.expect_name().return_const("mock");
        ex.expect_get_all_mids().never();
        let mut agent = agent(dir.path(), ex);
        let outcome = agent.execute_decision(&decision(Signal::Hold, None)).await;
        assert_eq!(outcome, ExecutionOutcome::Skipped("hold".to_string()));
    }

    #[tokio::test]
    async fn test_missing_price_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut ex = MockExchange::new();
        ex.expect_name().return_const("mock");
        ex.expect_get_all_mids().returning(|| Ok(HashMap::new()));
        let mut agent = agent(dir.path(), ex);
        let outcome = agent.execute_decision(&decision(Signal::Buy, Some(1900.0))).await;
        assert!(outcome.to_string().contains("no price for ETH"));
    }

    #[tokio::test]
    async fn test_buy_is_sized_from_stop_distance() {
        let dir = tempfile::tempdir().unwrap();
        let mut ex = MockExchange::new();
        with_mid(&mut ex, 2000.0);
        ex.expect_get_klines().returning(|_, _, limit| Ok(flat_candles(limit, 2000.0)));
        ex.expect_get_positions().returning(|| Ok(Vec::new()));
        ex.expect_place_order()
            .withf(|r| !r.reduce_only && r.side == Side::Buy && (r.quantity - 0.2).abs() < 1e-9 && (r.limit_px - 2002.0).abs() < 1e-9)
            .times(1)
            .returning(|_| Ok(OrderAck { order_id: Some("1".to_string()), raw: serde_json::Value::Null }));
        ex.expect_place_order()
            .withf(|r| r.reduce_only && r.side == Side::Sell && r.order_type.is_trigger())
            .times(2)
            .returning(|r| Ok(OrderAck { order_id: Some(format!("{}", r.limit_px)), raw: serde_json::Value::Null }));

        let mut agent = agent(dir.path(), ex);
        // risk 10 USD over a 50 USD stop distance
        let outcome = agent.execute_decision(&decision(Signal::Buy, Some(1950.0))).await;
        let ExecutionOutcome::Placed(placed) = outcome else { panic!("expected placement") };
        assert_eq!(placed.ids.main.as_deref(), Some("1"));
        assert_eq!(placed.ids.tp.as_deref(), Some("2100"));
        assert_eq!(placed.ids.sl.as_deref(), Some("1950"));
        assert_eq!(agent.metrics().orders_placed, 1);
        assert_eq!(agent.orders().get_active_brackets().await.len(), 1);
    }

    #[tokio::test]
    async fn test_short_4h_history_skips_stop_sized_trade() {
        let dir = tempfile::tempdir().unwrap();
        let mut ex = MockExchange::new();
        with_mid(&mut ex, 2000.0);
        ex.expect_get_klines()
            .withf(|coin, interval, _| coin == "ETH" && interval == "4h")
            .returning(|_, _, _| Ok(flat_candles(10, 2000.0)));
        ex.expect_place_order().never();
        let mut agent = agent(dir.path(), ex);
        let outcome = agent.execute_decision(&decision(Signal::Buy, Some(1950.0))).await;
        assert_eq!(
            outcome,
            ExecutionOutcome::Skipped("ATR unavailable for ETH: not enough 4h candles".to_string())
        );
    }

    #[tokio::test]
    async fn test_kline_error_skips_stop_sized_trade() {
        let dir = tempfile::tempdir().unwrap();
        let mut ex = MockExchange::new();
        with_mid(&mut ex, 2000.0);
        ex.expect_get_klines()
            .returning(|_, _, _| Err(TraderError::Exchange("candles down".to_string())));
        ex.expect_place_order().never();
        let mut agent = agent(dir.path(), ex);
        let outcome = agent.execute_decision(&decision(Signal::Sell, Some(2050.0))).await;
        assert!(outcome.to_string().contains("ATR unavailable for ETH"));
    }

    #[tokio::test]
    async fn test_cycle_drops_brackets_of_closed_positions() {
        let dir = tempfile::tempdir().unwrap();
        let mut ex = MockExchange::new();
        with_mid(&mut ex, 2000.0);
        ex.expect_get_klines().returning(|_, _, limit| Ok(flat_candles(limit, 2000.0)));
        ex.expect_get_funding_rate().returning(|_| Ok(None));
        ex.expect_get_open_interest().returning(|_| Ok(None));
        ex.expect_get_account_info()
            .returning(|| Err(TraderError::Exchange("offline".to_string())));
        // the entry never shows up as a position: TP or SL already closed it
        ex.expect_get_positions().returning(|| Ok(Vec::new()));
        ex.expect_place_order()
            .returning(|r| Ok(OrderAck { order_id: Some(if r.reduce_only { format!("{}", r.limit_px) } else { "1".to_string() }), raw: serde_json::Value::Null }));
        ex.expect_cancel_order()
            .withf(|id, coin| coin == "ETH" && ["1", "2100", "1950"].contains(&id))
            .times(3)
            .returning(|id, _| Ok(OrderAck { order_id: Some(id.to_string()), raw: serde_json::Value::Null }));

        let mut agent = LlmAgent::new(agent_config(dir.path()), Arc::new(ex), Arc::new(CannedModel("no blocks".to_string())))
            .unwrap()
            .with_market_pause(Duration::ZERO);
        let placed = agent.execute_decision(&decision(Signal::Buy, Some(1950.0))).await;
        assert!(matches!(placed, ExecutionOutcome::Placed(_)));
        assert_eq!(agent.orders().get_active_brackets().await.len(), 1);

        agent.run_cycle().await;
        assert!(agent.orders().get_active_brackets().await.is_empty());
    }

    #[tokio::test]
    async fn test_sell_uses_parsed_quantity_without_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mut ex = MockExchange::new();
        with_mid(&mut ex, 2000.0);
        ex.expect_get_positions().returning(|| Ok(Vec::new()));
        ex.expect_place_order()
            .withf(|r| !r.reduce_only && r.side == Side::Sell && r.quantity == 0.1 && (r.limit_px - 1998.0).abs() < 1e-9)
            .times(1)
            .returning(|_| Ok(OrderAck { order_id: Some("9".to_string()), raw: serde_json::Value::Null }));
        ex.expect_place_order()
            .withf(|r| r.reduce_only && r.side == Side::Buy)
            .times(1)
            .returning(|_| Ok(OrderAck { order_id: None, raw: serde_json::Value::Null }));

        let mut agent = agent(dir.path(), ex);
        let mut d = decision(Signal::Sell, None);
        d.profit_target = Some(1900.0);
        assert!(matches!(agent.execute_decision(&d).await, ExecutionOutcome::Placed(_)));
    }

    #[tokio::test]
    async fn test_stop_on_wrong_side_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut ex = MockExchange::new();
        with_mid(&mut ex, 2000.0);
        ex.expect_place_order().never();
        let mut agent = agent(dir.path(), ex);
        let outcome = agent.execute_decision(&decision(Signal::Buy, Some(2050.0))).await;
        assert!(outcome.to_string().contains("wrong side"));
    }

    #[tokio::test]
    async fn test_leverage_and_notional_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let mut ex = MockExchange::new();
        with_mid(&mut ex, 2000.0);
        ex.expect_get_positions().returning(|| {
            Ok(vec![Position {
                symbol: "BTC".to_string(),
                side: PositionSide::Long,
                quantity: 0.01,
                entry_price: 60000.0,
                leverage: 10.0,
                unrealized_pnl: 0.0,
                liquidation_price: 0.0,
            }])
        });
        ex.expect_place_order().never();
        let mut agent = agent(dir.path(), ex);

        let mut d = decision(Signal::Sell, None);
        d.leverage = Some(50);
        assert!(agent.execute_decision(&d).await.to_string().contains("leverage"));

        // 1 ETH at 2000 is above the 1000 USD notional cap
        let mut d = decision(Signal::Sell, None);
        d.quantity = 1.0;
        assert!(agent.execute_decision(&d).await.to_string().contains("position size"));
        assert_eq!(agent.risk().status().open_positions, 1);
    }

    #[tokio::test]
    async fn test_entry_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut ex = MockExchange::new();
        with_mid(&mut ex, 2000.0);
        ex.expect_get_positions().returning(|| Ok(Vec::new()));
        ex.expect_place_order()
            .times(1)
            .returning(|_| Err(TraderError::Exchange("insufficient margin".to_string())));
        let mut agent = agent(dir.path(), ex);
        let outcome = agent.execute_decision(&decision(Signal::Sell, None)).await;
        assert_eq!(outcome, ExecutionOutcome::Failed("entry order rejected".to_string()));
        assert_eq!(agent.metrics().orders_failed, 1);
    }

    #[tokio::test]
    async fn test_llm_failure_is_journaled() {
        struct Broken;

        #[async_trait]
        impl LanguageModel for Broken {
            fn model(&self) -> &str {
                "broken"
            }

            async fn complete(&self, _prompt: &str, _system_prompt: Option<&str>) -> Result<LLMResponse> {
                Err(TraderError::Llm("empty completion".to_string()))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut ex = MockExchange::new();
        ex.expect_name().return_const("mock");
        ex.expect_get_klines().returning(|_, _, _| Ok(Vec::new()));
        ex.expect_get_funding_rate().returning(|_| Ok(None));
        ex.expect_get_open_interest().returning(|_| Ok(None));
        ex.expect_get_account_info()
            .returning(|| Err(TraderError::Exchange("offline".to_string())));

        let mut agent = LlmAgent::new(agent_config(dir.path()), Arc::new(ex), Arc::new(Broken))
            .unwrap()
            .with_market_pause(Duration::ZERO);
        let entry = agent.run_cycle().await;

        assert_eq!(entry.invocation, 0);
        assert!(entry.error.as_deref().unwrap().contains("empty completion"));
        assert_eq!(entry.account, Some(AccountSnapshot::fallback(100.0)));
        assert!(entry.prompt_chars > 0);
        assert_eq!(agent.invocation_count(), 1);
        assert_eq!(agent.metrics().cycles_failed, 1);
        assert_eq!(agent.journal().read_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_template_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = agent_config(dir.path());
        config.prompt_template = Some(dir.path().join("missing.txt").to_string_lossy().to_string());
        let mut ex = MockExchange::new();
        ex.expect_name().return_const("mock");
        let result = LlmAgent::new(config, Arc::new(ex), Arc::new(CannedModel(String::new())));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut ex = MockExchange::new();
        ex.expect_name().return_const("mock");
        let agent = agent(dir.path(), ex);
        let (tx, rx) = watch::channel(true);
        // already signalled: the loop exits without running a cycle
        agent.run(rx).await;
        drop(tx);
    }
}
