pub mod account;
pub mod agent;
pub mod config;
pub mod decision;
pub mod error;
pub mod exchange;
pub mod indicators;
pub mod journal;
pub mod llm;
pub mod market;
pub mod metrics;
pub mod order_manager;
pub mod prompt;
pub mod risk;
pub mod signing;
