//! Parsing of the model's two-block answer.
//!
//! ```text
//! ▶
//! CHAIN_OF_THOUGHT
//! { "ETH": { "signal": "HOLD", "confidence": 0.88, "leverage": 25, ... } }
//! ▶
//! TRADING_DECISIONS
//! ETH
//! HOLD
//! 88%
//! justification...
//! QUANTITY: 22.66
//! ```
//!
//! The JSON block is validated entry by entry; the decision block picks the
//! coin to act on and borrows its risk parameters from the JSON entry.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

const COT_MARKER: &str = "CHAIN_OF_THOUGHT";
const DECISIONS_MARKER: &str = "TRADING_DECISIONS";
const QUANTITY_PREFIX: &str = "QUANTITY:";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("missing {0} block")]
    MissingBlock(&'static str),
    #[error("invalid CHAIN_OF_THOUGHT json: {0}")]
    InvalidJson(String),
    #[error("{coin}.{field}: {reason}")]
    InvalidField {
        coin: String,
        field: &'static str,
        reason: String,
    },
    #[error("incomplete TRADING_DECISIONS block: {0}")]
    Incomplete(&'static str),
    #[error("unknown signal {0:?}")]
    UnknownSignal(String),
    #[error("bad confidence {0:?}")]
    BadConfidence(String),
    #[error("bad quantity {0:?}")]
    BadQuantity(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE", try_from = "String")]
pub enum Signal {
    Hold,
    Buy,
    Sell,
}

impl FromStr for Signal {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HOLD" => Ok(Signal::Hold),
            "BUY" => Ok(Signal::Buy),
            "SELL" => Ok(Signal::Sell),
            _ => Err(ParseError::UnknownSignal(s.trim().to_string())),
        }
    }
}

impl TryFrom<String> for Signal {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Signal::Hold => "HOLD",
            Signal::Buy => "BUY",
            Signal::Sell => "SELL",
        })
    }
}

/// Models sometimes quote numbers
#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient {
    Num(f64),
    Text(String),
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    match Lenient::deserialize(d)? {
        Lenient::Num(n) => Ok(n),
        Lenient::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn lenient_opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    match Option::<Lenient>::deserialize(d)? {
        None => Ok(None),
        Some(Lenient::Num(n)) => Ok(Some(n)),
        Some(Lenient::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(Lenient::Text(s)) => s.trim().parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// The template's `0.0` placeholder means "not set"
fn lenient_opt_price<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Ok(lenient_opt_f64(d)?.filter(|v| *v != 0.0))
}

/// One coin's entry in CHAIN_OF_THOUGHT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CotEntry {
    pub signal: Signal,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub quantity: Option<f64>,
    #[serde(default, deserialize_with = "lenient_opt_price")]
    pub stop_loss: Option<f64>,
    #[serde(default, deserialize_with = "lenient_opt_price")]
    pub profit_target: Option<f64>,
    #[serde(default)]
    pub invalidation_condition: Option<String>,
    pub justification: String,
    #[serde(deserialize_with = "lenient_f64")]
    pub confidence: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub leverage: f64,
    #[serde(default, deserialize_with = "lenient_opt_price")]
    pub risk_usd: Option<f64>,
    #[serde(default)]
    pub coin: Option<String>,
}

impl CotEntry {
    pub fn validate(&self, coin: &str) -> Result<(), ParseError> {
        let invalid = |field: &'static str, reason: String| ParseError::InvalidField {
            coin: coin.to_string(),
            field,
            reason,
        };
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(invalid("confidence", format!("{} not in [0, 1]", self.confidence)));
        }
        if !(1.0..=100.0).contains(&self.leverage) || self.leverage.fract() != 0.0 {
            return Err(invalid("leverage", format!("{} not an integer in [1, 100]", self.leverage)));
        }
        if let Some(q) = self.quantity {
            if !q.is_finite() || q < 0.0 {
                return Err(invalid("quantity", format!("{} is negative", q)));
            }
        }
        for (field, value) in [
            ("stop_loss", self.stop_loss),
            ("profit_target", self.profit_target),
            ("risk_usd", self.risk_usd),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(invalid(field, format!("{} must not be negative", v)));
                }
            }
        }
        Ok(())
    }

    pub fn leverage_u32(&self) -> u32 {
        self.leverage as u32
    }
}

/// Coin → entry, as emitted in the CHAIN_OF_THOUGHT block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainOfThought(pub BTreeMap<String, CotEntry>);

impl ChainOfThought {
    pub fn validate(&self) -> Result<(), ParseError> {
        self.0.iter().try_for_each(|(coin, entry)| entry.validate(coin))
    }

    /// Case-insensitive lookup by coin
    pub fn get(&self, coin: &str) -> Option<&CotEntry> {
        self.0.get(coin).or_else(|| {
            self.0
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(coin))
                .map(|(_, v)| v)
        })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The action chosen in TRADING_DECISIONS, merged with its CoT risk parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingDecision {
    pub symbol: String,
    pub action: Signal,
    pub confidence: f64,
    pub justification: String,
    pub quantity: f64,
    pub leverage: Option<u32>,
    pub stop_loss: Option<f64>,
    pub profit_target: Option<f64>,
    pub invalidation_condition: Option<String>,
    pub risk_usd: Option<f64>,
    pub chain_of_thought: ChainOfThought,
}

/// Balanced `{...}` object starting at the first brace of `text`
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

pub fn parse_chain_of_thought(raw: &str) -> Result<ChainOfThought, ParseError> {
    let pos = raw.rfind(COT_MARKER).ok_or(ParseError::MissingBlock(COT_MARKER))?;
    let after = &raw[pos + COT_MARKER.len()..];
    // stop at the decisions block so a missing object isn't taken from there
    let section = after.find(DECISIONS_MARKER).map_or(after, |end| &after[..end]);
    let json = extract_json_object(section)
        .ok_or_else(|| ParseError::InvalidJson("no balanced object after marker".to_string()))?;
    let cot: ChainOfThought =
        serde_json::from_str(json).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    cot.validate()?;
    Ok(cot)
}

fn is_separator(line: &str) -> bool {
    line.chars().all(|c| c == '▶' || c.is_whitespace())
}

fn parse_percent(line: &str) -> Result<f64, ParseError> {
    let bad = || ParseError::BadConfidence(line.to_string());
    let number = line.strip_suffix('%').ok_or_else(bad)?.trim();
    let pct: f64 = number.parse().map_err(|_| bad())?;
    if !(0.0..=100.0).contains(&pct) {
        return Err(bad());
    }
    Ok(pct / 100.0)
}

/// Parse the full model output into a decision
pub fn parse_llm_output(raw: &str) -> Result<TradingDecision, ParseError> {
    let chain_of_thought = parse_chain_of_thought(raw)?;
    debug!(coins = chain_of_thought.len(), "chain of thought validated");

    let pos = raw
        .rfind(DECISIONS_MARKER)
        .ok_or(ParseError::MissingBlock(DECISIONS_MARKER))?;
    let mut lines = raw[pos + DECISIONS_MARKER.len()..]
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !is_separator(l));

    let symbol = lines
        .next()
        .ok_or(ParseError::Incomplete("symbol"))?
        .to_ascii_uppercase();
    let action: Signal = lines.next().ok_or(ParseError::Incomplete("action"))?.parse()?;
    let confidence = parse_percent(lines.next().ok_or(ParseError::Incomplete("confidence"))?)?;

    let mut justification = Vec::new();
    let mut quantity = None;
    for line in lines {
        let upper = line.to_ascii_uppercase();
        if let Some(rest) = upper.strip_prefix(QUANTITY_PREFIX) {
            let value = rest.trim();
            quantity = Some(
                value
                    .parse::<f64>()
                    .map_err(|_| ParseError::BadQuantity(value.to_string()))?,
            );
            break;
        }
        justification.push(line);
    }
    let quantity = quantity.ok_or(ParseError::Incomplete("QUANTITY"))?;

    let entry = chain_of_thought.get(&symbol);
    if entry.is_none() {
        warn!(coin = %symbol, "decision coin missing from chain of thought");
    }

    Ok(TradingDecision {
        leverage: entry.map(CotEntry::leverage_u32),
        stop_loss: entry.and_then(|e| e.stop_loss),
        profit_target: entry.and_then(|e| e.profit_target),
        invalidation_condition: entry.and_then(|e| e.invalidation_condition.clone()),
        risk_usd: entry.and_then(|e| e.risk_usd),
        symbol,
        action,
        confidence,
        justification: justification.join(" "),
        quantity,
        chain_of_thought,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
It has been 7259 minutes since you started trading. The current time is 2025-10-27 14:10:19.368166 and you've been invoked 4514 times.

▶
CHAIN_OF_THOUGHT
{ "ETH": { "signal": "HOLD", "justification": "Price is testing support but long-term bullish.", "confidence": 0.88, "leverage": 25, "stop_loss": 4120.0, "profit_target": 4280.0, "invalidation_condition": "4h close below 4018.868", "risk_usd": 1560.0 } }

▶
TRADING_DECISIONS
ETH
HOLD
88%
Price is testing the intraday support near 4140 but remains above the critical 4h 20 EMA (4032.49). The long-term trend is still bullish (4h EMAs stacked positively, RSI > 68), and recent intraday weakness appears corrective. Funding is neutral, OI is stable. The invalidation condition (4h close below 4018.868) has not triggered, so the position remains valid.

QUANTITY: 22.66
    "#;

    #[test]
    fn test_parse_sample_output() {
        let d = parse_llm_output(SAMPLE).unwrap();
        assert_eq!(d.symbol, "ETH");
        assert_eq!(d.action, Signal::Hold);
        assert_eq!(d.confidence, 0.88);
        assert_eq!(d.quantity, 22.66);
        assert_eq!(d.leverage, Some(25));
        assert_eq!(d.stop_loss, Some(4120.0));
        assert_eq!(d.profit_target, Some(4280.0));
        assert_eq!(d.risk_usd, Some(1560.0));
        assert_eq!(d.invalidation_condition.as_deref(), Some("4h close below 4018.868"));
        assert!(d.justification.starts_with("Price is testing the intraday support"));
        assert_eq!(d.chain_of_thought.get("ETH").unwrap().leverage_u32(), 25);
        assert!(d.chain_of_thought.get("ETH").unwrap().quantity.is_none());
    }

    #[test]
    fn test_signal_case_insensitive() {
        assert_eq!("buy".parse::<Signal>().unwrap(), Signal::Buy);
        assert_eq!(" Sell ".parse::<Signal>().unwrap(), Signal::Sell);
        assert!("LONG".parse::<Signal>().is_err());
        let s: Signal = serde_json::from_str("\"hold\"").unwrap();
        assert_eq!(s, Signal::Hold);
        assert_eq!(serde_json::to_string(&Signal::Buy).unwrap(), "\"BUY\"");
    }

    #[test]
    fn test_extract_json_object_nested_and_strings() {
        let text = r#"noise { "a": { "b": "} not the end {" }, "c": "esc \" }" } trailing }"#;
        let obj = extract_json_object(text).unwrap();
        assert!(obj.ends_with("\"esc \\\" }\" }"));
        let v: serde_json::Value = serde_json::from_str(obj).unwrap();
        assert_eq!(v["a"]["b"], "} not the end {");
        assert!(extract_json_object("{ unbalanced").is_none());
        assert!(extract_json_object("none").is_none());
    }

    #[test]
    fn test_buy_decision_with_quoted_numbers() {
        let raw = r#"CHAIN_OF_THOUGHT
{"btc": {"signal": "buy", "justification": "breakout", "confidence": "0.7", "leverage": "10", "stop_loss": "95000", "profit_target": 105000, "risk_usd": 20, "quantity": 0.01, "coin": "BTC"}}
TRADING_DECISIONS
btc
Buy
70 %
Breakout above range.
Volume confirms.
quantity: 0.01"#;
        let d = parse_llm_output(raw).unwrap();
        assert_eq!(d.symbol, "BTC");
        assert_eq!(d.action, Signal::Buy);
        assert_eq!(d.confidence, 0.7);
        assert_eq!(d.leverage, Some(10));
        assert_eq!(d.stop_loss, Some(95000.0));
        assert_eq!(d.justification, "Breakout above range. Volume confirms.");
    }

    #[test]
    fn test_decision_coin_missing_from_cot() {
        let raw = "CHAIN_OF_THOUGHT\n{\"ETH\": {\"signal\": \"HOLD\", \"justification\": \"x\", \"confidence\": 0.5, \"leverage\": 5}}\nTRADING_DECISIONS\nSOL\nSELL\n40%\nweak\nQUANTITY: 3";
        let d = parse_llm_output(raw).unwrap();
        assert_eq!(d.symbol, "SOL");
        assert_eq!(d.leverage, None);
        assert_eq!(d.stop_loss, None);
        assert_eq!(d.quantity, 3.0);
    }

    #[test]
    fn test_missing_blocks() {
        assert_eq!(
            parse_llm_output("just vibes").unwrap_err(),
            ParseError::MissingBlock("CHAIN_OF_THOUGHT")
        );
        let no_decisions = "CHAIN_OF_THOUGHT\n{\"ETH\": {\"signal\": \"HOLD\", \"justification\": \"x\", \"confidence\": 0.5, \"leverage\": 5}}";
        assert_eq!(
            parse_llm_output(no_decisions).unwrap_err(),
            ParseError::MissingBlock("TRADING_DECISIONS")
        );
    }

    #[test]
    fn test_invalid_json_and_ranges() {
        let bad_json = "CHAIN_OF_THOUGHT\n{\"ETH\": {\"signal\": }\nTRADING_DECISIONS\nETH";
        assert!(matches!(parse_llm_output(bad_json), Err(ParseError::InvalidJson(_))));

        let high_conf = "CHAIN_OF_THOUGHT\n{\"ETH\": {\"signal\": \"HOLD\", \"justification\": \"x\", \"confidence\": 1.5, \"leverage\": 5}}";
        assert!(matches!(
            parse_llm_output(high_conf),
            Err(ParseError::InvalidField { field: "confidence", .. })
        ));

        let high_lev = "CHAIN_OF_THOUGHT\n{\"ETH\": {\"signal\": \"HOLD\", \"justification\": \"x\", \"confidence\": 0.5, \"leverage\": 150}}";
        assert!(matches!(
            parse_llm_output(high_lev),
            Err(ParseError::InvalidField { field: "leverage", .. })
        ));

        let bad_signal = "CHAIN_OF_THOUGHT\n{\"ETH\": {\"signal\": \"MOON\", \"justification\": \"x\", \"confidence\": 0.5, \"leverage\": 5}}";
        assert!(matches!(parse_llm_output(bad_signal), Err(ParseError::InvalidJson(_))));
    }

    #[test]
    fn test_bad_decision_lines() {
        let cot = "CHAIN_OF_THOUGHT\n{\"ETH\": {\"signal\": \"HOLD\", \"justification\": \"x\", \"confidence\": 0.5, \"leverage\": 5}}\nTRADING_DECISIONS\n";
        let bad_pct = format!("{}ETH\nHOLD\nhigh\nQUANTITY: 1", cot);
        assert!(matches!(parse_llm_output(&bad_pct), Err(ParseError::BadConfidence(_))));
        let over = format!("{}ETH\nHOLD\n120%\nQUANTITY: 1", cot);
        assert!(matches!(parse_llm_output(&over), Err(ParseError::BadConfidence(_))));
        let bad_qty = format!("{}ETH\nHOLD\n50%\nwhy\nQUANTITY: lots", cot);
        assert_eq!(parse_llm_output(&bad_qty).unwrap_err(), ParseError::BadQuantity("LOTS".to_string()));
        let no_qty = format!("{}ETH\nHOLD\n50%\nwhy", cot);
        assert_eq!(parse_llm_output(&no_qty).unwrap_err(), ParseError::Incomplete("QUANTITY"));
        let unknown = format!("{}ETH\nLONG\n50%\nQUANTITY: 1", cot);
        assert!(matches!(parse_llm_output(&unknown), Err(ParseError::UnknownSignal(_))));
    }

    #[test]
    fn test_zero_placeholders_read_as_unset() {
        let raw = "CHAIN_OF_THOUGHT\n{\"ETH\": {\"signal\": \"HOLD\", \"justification\": \"flat\", \"confidence\": 0.6, \"leverage\": 5, \"stop_loss\": 0.0, \"profit_target\": 0.0, \"risk_usd\": \"0\", \"invalidation_condition\": \"\"}}\nTRADING_DECISIONS\nETH\nHOLD\n60%\nnothing to do\nQUANTITY: 0";
        let d = parse_llm_output(raw).unwrap();
        assert_eq!(d.action, Signal::Hold);
        assert_eq!(d.stop_loss, None);
        assert_eq!(d.profit_target, None);
        assert_eq!(d.risk_usd, None);

        let negative = "CHAIN_OF_THOUGHT\n{\"ETH\": {\"signal\": \"BUY\", \"justification\": \"x\", \"confidence\": 0.6, \"leverage\": 5, \"stop_loss\": -10.0}}";
        assert!(matches!(
            parse_llm_output(negative),
            Err(ParseError::InvalidField { field: "stop_loss", .. })
        ));
    }

    #[test]
    fn test_echoed_template_is_skipped() {
        let raw = format!(
            "Respond in this EXACT format:\nCHAIN_OF_THOUGHT\n{{ \"COIN\": {{ \"signal\": \"BUY | SELL | HOLD\" }} }}\nTRADING_DECISIONS\nCOIN\n{}",
            SAMPLE
        );
        assert_eq!(parse_llm_output(&raw).unwrap().symbol, "ETH");
    }
}
