//! Prompt rendering.
//!
//! The template is plain text with `{name}` placeholders. Unknown braces are
//! left alone, so the template can carry the JSON response example verbatim.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::Path;

use crate::account::AccountSnapshot;
use crate::error::{Result, TraderError};
use crate::market::AssetSnapshot;

pub const DEFAULT_TEMPLATE: &str = include_str!("../prompts/system_prompt.txt");

/// Per-cycle values substituted into the template
pub struct PromptContext<'a> {
    pub invocation_count: u64,
    pub now: DateTime<Utc>,
    pub market: &'a BTreeMap<String, Option<AssetSnapshot>>,
    pub account: &'a AccountSnapshot,
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    template: String,
    agent_name: String,
    allowed_coins: Vec<String>,
    started_at: DateTime<Utc>,
}

impl PromptBuilder {
    pub fn new(agent_name: &str, allowed_coins: Vec<String>) -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
            agent_name: agent_name.to_string(),
            allowed_coins,
            started_at: Utc::now(),
        }
    }

    pub fn with_template(mut self, template: String) -> Self {
        self.template = template;
        self
    }

    pub fn with_template_file<P: AsRef<Path>>(self, path: P) -> Result<Self> {
        let path = path.as_ref();
        let template = std::fs::read_to_string(path).map_err(|e| {
            TraderError::Config(format!("failed to read prompt template {}: {}", path.display(), e))
        })?;
        Ok(self.with_template(template))
    }

    pub fn with_start(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn render(&self, ctx: &PromptContext<'_>) -> Result<String> {
        let minutes = (ctx.now - self.started_at).num_minutes().max(0);
        let positions_json = serde_json::to_string(&ctx.account.positions)?;
        let values: [(&str, String); 8] = [
            ("minutes_elapsed", minutes.to_string()),
            ("timestamp", ctx.now.format("%Y-%m-%d %H:%M:%S").to_string()),
            ("invocation_count", ctx.invocation_count.to_string()),
            ("agent_name", self.agent_name.clone()),
            ("allowed_coins", allowed_coins_phrase(&self.allowed_coins)),
            ("market_data", format_market_block(ctx.market)),
            ("account_data", format_account_block(ctx.account)),
            ("positions_json", positions_json),
        ];
        Ok(fill_template(&self.template, &values))
    }
}

/// Replace `{key}` occurrences in a single pass; substituted text is never rescanned
pub fn fill_template(template: &str, values: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(template.len() * 2);
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let replaced = after.find('}').and_then(|close| {
            let key = &after[..close];
            values
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (v, close))
        });
        match replaced {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// "BTC, ETH, and SOL"
pub fn allowed_coins_phrase(coins: &[String]) -> String {
    match coins {
        [] => String::new(),
        [one] => one.clone(),
        [a, b] => format!("{} and {}", a, b),
        [init @ .., last] => format!("{}, and {}", init.join(", "), last),
    }
}

fn series(values: &[f64]) -> String {
    let parts: Vec<String> = values.iter().map(|v| format_num(*v)).collect();
    format!("[{}]", parts.join(", "))
}

/// Up to 6 significant decimals, trailing zeros trimmed
fn format_num(value: f64) -> String {
    let s = format!("{:.6}", value);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" {
        "0".to_string()
    } else {
        s.to_string()
    }
}

pub fn format_market_block(market: &BTreeMap<String, Option<AssetSnapshot>>) -> String {
    let mut out = String::new();
    for (coin, snapshot) in market {
        let _ = writeln!(out, "ALL {} DATA", coin);
        let Some(s) = snapshot else {
            let _ = writeln!(out, "data unavailable\n");
            continue;
        };
        let _ = writeln!(
            out,
            "current_price = {}, current_ema20 = {}, current_macd = {}, current_rsi (7 period) = {}, current_rsi (14 period) = {}",
            format_num(s.current_price),
            format_num(s.current_ema20),
            format_num(s.current_macd),
            format_num(s.current_rsi_7),
            format_num(s.current_rsi_14),
        );
        let _ = writeln!(
            out,
            "Open Interest: Latest: {} Average: {}",
            format_num(s.open_interest.latest),
            format_num(s.open_interest.average)
        );
        let _ = writeln!(out, "Funding Rate: {:e}", s.funding_rate);
        let _ = writeln!(out, "Intraday series (3-minute intervals, oldest → latest):");
        let _ = writeln!(out, "Mid prices: {}", series(&s.mid_prices_3m));
        let _ = writeln!(out, "EMA indicators (20-period): {}", series(&s.ema20_3m));
        let _ = writeln!(out, "MACD indicators: {}", series(&s.macd_3m));
        let _ = writeln!(out, "RSI indicators (7-Period): {}", series(&s.rsi7_3m));
        let _ = writeln!(out, "RSI indicators (14-Period): {}", series(&s.rsi14_3m));
        let _ = writeln!(out, "Longer-term context (4-hour timeframe):");
        let _ = writeln!(
            out,
            "20-Period EMA: {} vs. 50-Period EMA: {}",
            format_num(s.ema20_4h),
            format_num(s.ema50_4h)
        );
        let _ = writeln!(
            out,
            "3-Period ATR: {} vs. 14-Period ATR: {}",
            format_num(s.atr3_4h),
            format_num(s.atr14_4h)
        );
        let _ = writeln!(
            out,
            "Current Volume: {} vs. Average Volume: {}",
            format_num(s.volume_current),
            format_num(s.volume_avg)
        );
        let _ = writeln!(out, "MACD indicators: {}", series(&s.macd_4h));
        let _ = writeln!(out, "RSI indicators (14-Period): {}", series(&s.rsi14_4h));
        out.push('\n');
    }
    out
}

pub fn format_account_block(account: &AccountSnapshot) -> String {
    format!(
        "Current Total Return (percent): {}%\nAvailable Cash: {}\nCurrent Account Value: {}\nSharpe Ratio: {}\n",
        format_num(account.total_return_pct),
        format_num(account.available_cash),
        format_num(account.total_account_value),
        format_num(account.sharpe_ratio),
    )
}
