use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tracing::info;

use crate::decision::Signal;

/// Per-agent counters, logged after every cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub uptime_sec: u64,
    pub cycles_total: u64,
    pub cycles_ok: u64,
    pub cycles_failed: u64,
    pub llm_input_tokens: u64,
    pub llm_output_tokens: u64,
    pub decisions: HashMap<Signal, u64>,
    pub orders_placed: u64,
    pub orders_failed: u64,
    #[serde(skip, default = "Instant::now")]
    started: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            uptime_sec: 0,
            cycles_total: 0,
            cycles_ok: 0,
            cycles_failed: 0,
            llm_input_tokens: 0,
            llm_output_tokens: 0,
            decisions: HashMap::new(),
            orders_placed: 0,
            orders_failed: 0,
            started: Instant::now(),
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle(&mut self, ok: bool) {
        self.cycles_total += 1;
        if ok {
            self.cycles_ok += 1;
        } else {
            self.cycles_failed += 1;
        }
        self.uptime_sec = self.started.elapsed().as_secs();
    }

    pub fn record_tokens(&mut self, input: u32, output: u32) {
        self.llm_input_tokens += input as u64;
        self.llm_output_tokens += output as u64;
    }

    pub fn record_decision(&mut self, signal: Signal) {
        *self.decisions.entry(signal).or_insert(0) += 1;
    }

    pub fn record_order(&mut self, placed: bool) {
        if placed {
            self.orders_placed += 1;
        } else {
            self.orders_failed += 1;
        }
    }

    /// Share of successful cycles as percentage
    pub fn success_rate(&self) -> f64 {
        if self.cycles_total == 0 {
            return 100.0;
        }
        (self.cycles_ok as f64 / self.cycles_total as f64) * 100.0
    }

    pub fn log(&self, agent: &str) {
        info!(
            agent,
            cycles = self.cycles_total,
            failed = self.cycles_failed,
            success_rate = self.success_rate(),
            tokens_in = self.llm_input_tokens,
            tokens_out = self.llm_output_tokens,
            orders_placed = self.orders_placed,
            orders_failed = self.orders_failed,
            uptime_sec = self.uptime_sec,
            "agent metrics"
        );
    }
}
