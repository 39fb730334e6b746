use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use llm_trader::agent::LlmAgent;
use llm_trader::config::{AgentConfig, Config};
use llm_trader::exchange::build_exchange;
use llm_trader::llm::{LLMClient, LanguageModel};

/// LLM-driven perpetual futures trading agents
#[derive(Parser, Debug)]
#[command(name = "llm-trader", version, about)]
struct Args {
    /// Configuration file (TOML, or JSON by extension)
    #[arg(short, long, default_value = "config/local.toml")]
    config: PathBuf,

    /// Run only the named agent (repeatable)
    #[arg(short, long = "agent")]
    agents: Vec<String>,

    /// Run one cycle per agent and exit
    #[arg(long)]
    once: bool,

    /// Write an example configuration to --config and exit
    #[arg(long)]
    init: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LLM_TRADER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();
}

fn write_example_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() {
        return Err(format!("{} already exists, refusing to overwrite", path.display()).into());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, Config::example().to_toml_string()?)?;
    info!(path = %path.display(), "example configuration written");
    Ok(())
}

fn select_agents(config: Config, names: &[String]) -> Result<Vec<AgentConfig>, Box<dyn std::error::Error>> {
    if names.is_empty() {
        return Ok(config.agents);
    }
    for name in names {
        if !config.agents.iter().any(|a| &a.name == name) {
            return Err(format!("unknown agent: {}", name).into());
        }
    }
    Ok(config.agents.into_iter().filter(|a| names.contains(&a.name)).collect())
}

/// Build an agent, or `None` when its credentials are missing
fn build_agent(config: AgentConfig) -> Option<LlmAgent> {
    let name = config.name.clone();
    let llm: Arc<dyn LanguageModel> = match LLMClient::from_config(&config.llm) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            warn!(agent = %name, error = %e, "LLM client unavailable, skipping agent");
            return None;
        }
    };
    let exchange = match build_exchange(&config.exchange, &config.assets) {
        Ok(exchange) => exchange,
        Err(e) => {
            warn!(agent = %name, error = %e, "exchange unavailable, skipping agent");
            return None;
        }
    };
    match LlmAgent::new(config, exchange, llm) {
        Ok(agent) => Some(agent),
        Err(e) => {
            warn!(agent = %name, error = %e, "agent setup failed, skipping agent");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    if args.init {
        return write_example_config(&args.config);
    }

    let config = Config::from_file(&args.config)?;
    let agents: Vec<LlmAgent> = select_agents(config, &args.agents)?
        .into_iter()
        .filter_map(build_agent)
        .collect();
    if agents.is_empty() {
        return Err("no runnable agents".into());
    }

    info!(agents = agents.len(), once = args.once, "llm-trader starting");

    let mut tasks = JoinSet::new();
    if args.once {
        for mut agent in agents {
            tasks.spawn(async move {
                let entry = agent.run_cycle().await;
                info!(agent = agent.name(), outcome = ?entry.outcome, error = ?entry.error, "single cycle finished");
            });
        }
    } else {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        for agent in agents {
            tasks.spawn(agent.run(shutdown_rx.clone()));
        }

        tokio::signal::ctrl_c().await?;
        warn!("shutdown requested, waiting for agents to finish their cycle");
        shutdown_tx.send(true)?;
    }

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "agent task panicked");
        }
    }
    info!("llm-trader stopped");
    Ok(())
}
