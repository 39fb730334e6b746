use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use crate::error::{Result, TraderError};

/// Top-level configuration: one entry per trading agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique agent name, also used for the journal file name
    pub name: String,

    /// Seconds between trading cycles
    #[serde(default = "default_interval")]
    pub interval_sec: u64,

    /// Starting capital used for return calculations
    #[serde(default = "default_capital")]
    pub capital_usd: f64,

    /// Coins the agent may trade
    #[serde(default = "default_assets")]
    pub assets: Vec<String>,

    #[serde(default = "default_journal_dir")]
    pub journal_dir: String,

    /// Optional path to a custom prompt template
    #[serde(default)]
    pub prompt_template: Option<String>,

    /// Candles fetched per timeframe
    #[serde(default = "default_candle_limit")]
    pub candle_limit: usize,

    pub llm: LlmConfig,
    pub exchange: ExchangeConfig,

    #[serde(default)]
    pub risk: RiskConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Anthropic,
    OpenRouter,
    Alibaba,
    OpenAi,
}

impl LlmProvider {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "https://api.anthropic.com",
            LlmProvider::OpenRouter => "https://openrouter.ai/api/v1",
            LlmProvider::Alibaba => "https://dashscope-intl.aliyuncs.com/compatible-mode/v1",
            LlmProvider::OpenAi => "https://api.openai.com/v1",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: String,
    pub api_key_env: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

impl LlmConfig {
    pub fn effective_base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_base_url())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Broker {
    Hyperliquid,
    BingX,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Mainnet,
    Testnet,
}

impl NetworkMode {
    /// Phantom agent source for Hyperliquid L1 signing
    pub fn source_id(&self) -> &'static str {
        match self {
            NetworkMode::Mainnet => "a",
            NetworkMode::Testnet => "b",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Live,
    #[default]
    Paper,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub broker: Broker,
    #[serde(default)]
    pub network_mode: NetworkMode,
    #[serde(default)]
    pub trading_mode: TradingMode,
    /// Overrides the network default endpoint
    #[serde(default)]
    pub api_url: Option<String>,

    // Hyperliquid
    #[serde(default)]
    pub wallet_address: Option<String>,
    #[serde(default)]
    pub private_key_env: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,

    // BingX
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub secret_key_env: Option<String>,

    #[serde(default = "default_paper_log_path")]
    pub paper_log_path: String,
    #[serde(default = "default_capital")]
    pub paper_balance_usd: f64,
}

impl ExchangeConfig {
    pub fn effective_api_url(&self) -> &str {
        if let Some(url) = self.api_url.as_deref() {
            return url;
        }
        match (self.broker, self.network_mode) {
            (Broker::Hyperliquid, NetworkMode::Mainnet) => "https://api.hyperliquid.xyz",
            (Broker::Hyperliquid, NetworkMode::Testnet) => "https://api.hyperliquid-testnet.xyz",
            (Broker::BingX, NetworkMode::Mainnet) => "https://open-api.bingx.com",
            (Broker::BingX, NetworkMode::Testnet) => "https://open-api-vst.bingx.com",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_risk_usd")]
    pub default_risk_usd: f64,
    #[serde(default = "default_leverage")]
    pub default_leverage: u32,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: u32,
    #[serde(default = "default_max_position_size")]
    pub max_position_size_usd: f64,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss_usd: f64,
    /// Entry limit price offset from mid, in percent
    #[serde(default = "default_limit_offset_pct")]
    pub limit_offset_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            default_risk_usd: default_risk_usd(),
            default_leverage: default_leverage(),
            max_leverage: default_max_leverage(),
            max_position_size_usd: default_max_position_size(),
            max_open_positions: default_max_open_positions(),
            max_daily_loss_usd: default_max_daily_loss(),
            limit_offset_pct: default_limit_offset_pct(),
        }
    }
}

fn default_interval() -> u64 {
    600
}

fn default_capital() -> f64 {
    100.0
}

pub fn default_assets() -> Vec<String> {
    ["BTC", "ETH", "SOL", "XRP", "DOGE", "BNB"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_journal_dir() -> String {
    "logs".to_string()
}

fn default_candle_limit() -> usize {
    100
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_temperature() -> f64 {
    0.1
}

fn default_paper_log_path() -> String {
    "logs/paper_trades.jsonl".to_string()
}

fn default_risk_usd() -> f64 {
    10.0
}

fn default_leverage() -> u32 {
    10
}

fn default_max_leverage() -> u32 {
    20
}

fn default_max_position_size() -> f64 {
    1000.0
}

fn default_max_open_positions() -> usize {
    3
}

fn default_max_daily_loss() -> f64 {
    50.0
}

fn default_limit_offset_pct() -> f64 {
    0.1
}

impl Config {
    /// Load configuration from a TOML file, or JSON when the extension is `.json`
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| TraderError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let config = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_toml_str(&content)?
        };
        info!(path = %path.display(), agents = config.agents.len(), "configuration loaded");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| TraderError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(content).map_err(|e| TraderError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agents.is_empty() {
            return Err(TraderError::Config("no agents configured".to_string()));
        }
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.name.as_str()) {
                return Err(TraderError::Config(format!("duplicate agent name: {}", agent.name)));
            }
            if agent.interval_sec == 0 {
                return Err(TraderError::Config(format!("{}: interval_sec must be > 0", agent.name)));
            }
            if agent.capital_usd <= 0.0 {
                return Err(TraderError::Config(format!("{}: capital_usd must be > 0", agent.name)));
            }
            if agent.assets.is_empty() {
                return Err(TraderError::Config(format!("{}: assets must not be empty", agent.name)));
            }
            if agent.risk.max_leverage < 1 {
                return Err(TraderError::Config(format!("{}: max_leverage must be >= 1", agent.name)));
            }
        }
        Ok(())
    }

    /// Example configuration written by `--init`
    pub fn example() -> Self {
        Self {
            agents: vec![
                AgentConfig {
                    name: "deepseek".to_string(),
                    interval_sec: default_interval(),
                    capital_usd: default_capital(),
                    assets: default_assets(),
                    journal_dir: default_journal_dir(),
                    prompt_template: None,
                    candle_limit: default_candle_limit(),
                    llm: LlmConfig {
                        provider: LlmProvider::OpenRouter,
                        model: "deepseek/deepseek-chat".to_string(),
                        api_key_env: "OPENROUTER_API_KEY".to_string(),
                        base_url: None,
                        max_tokens: default_max_tokens(),
                        temperature: default_temperature(),
                    },
                    exchange: ExchangeConfig {
                        broker: Broker::Hyperliquid,
                        network_mode: NetworkMode::Testnet,
                        trading_mode: TradingMode::Paper,
                        api_url: None,
                        wallet_address: Some("0x0000000000000000000000000000000000000000".to_string()),
                        private_key_env: Some("HYPERLIQUID_SECRET".to_string()),
                        private_key_path: None,
                        api_key_env: None,
                        secret_key_env: None,
                        paper_log_path: "logs/deepseek_paper.jsonl".to_string(),
                        paper_balance_usd: default_capital(),
                    },
                    risk: RiskConfig::default(),
                },
                AgentConfig {
                    name: "qwen".to_string(),
                    interval_sec: default_interval(),
                    capital_usd: default_capital(),
                    assets: default_assets(),
                    journal_dir: default_journal_dir(),
                    prompt_template: None,
                    candle_limit: default_candle_limit(),
                    llm: LlmConfig {
                        provider: LlmProvider::Alibaba,
                        model: "qwen-max".to_string(),
                        api_key_env: "QWEN_API_KEY".to_string(),
                        base_url: None,
                        max_tokens: default_max_tokens(),
                        temperature: default_temperature(),
                    },
                    exchange: ExchangeConfig {
                        broker: Broker::BingX,
                        network_mode: NetworkMode::Mainnet,
                        trading_mode: TradingMode::Paper,
                        api_url: None,
                        wallet_address: None,
                        private_key_env: None,
                        private_key_path: None,
                        api_key_env: Some("BINGX_API_KEY".to_string()),
                        secret_key_env: Some("BINGX_SECRET_KEY".to_string()),
                        paper_log_path: "logs/qwen_paper.jsonl".to_string(),
                        paper_balance_usd: default_capital(),
                    },
                    risk: RiskConfig::default(),
                },
            ],
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| TraderError::Config(e.to_string()))
    }
}
