//! Run one fraud evaluation from JSON fixtures
//!
//! ```text
//! fraud-eval --rules rules.json --request request.json \
//!     [--patterns patterns.json] [--ip-intel intel.json] [--config engine.toml]
//! ```

use anyhow::Context;
use clap::Parser;
use fraud_engine::{
    EngineConfig, FraudEngine, FraudPattern, FraudRule, InMemoryStore, IpInfo, RequestContext,
    StaticIpIntelligence,
};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Run one fraud evaluation from JSON fixtures and print the outcome
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Fraud rules (JSON array)
    #[arg(long)]
    rules: PathBuf,

    /// Payment attempt to evaluate (JSON object)
    #[arg(long)]
    request: PathBuf,

    /// Blacklist / greylist patterns (JSON array)
    #[arg(long)]
    patterns: Option<PathBuf>,

    /// IP intelligence table keyed by address (JSON object)
    #[arg(long)]
    ip_intel: Option<PathBuf>,

    /// Engine configuration (TOML); environment overrides otherwise
    #[arg(long)]
    config: Option<PathBuf>,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

fn init_tracing(config: &EngineConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::from_env()?,
    };
    init_tracing(&config);

    let rules: Vec<FraudRule> = read_json(&args.rules)?;
    let patterns: Vec<FraudPattern> = match &args.patterns {
        Some(path) => read_json(path)?,
        None => Vec::new(),
    };
    let intel: HashMap<String, IpInfo> = match &args.ip_intel {
        Some(path) => read_json(path)?,
        None => HashMap::new(),
    };
    let request: RequestContext = read_json(&args.request)?;

    tracing::info!(rules = rules.len(), patterns = patterns.len(), "Starting fraud evaluation");

    let store = Arc::new(InMemoryStore::with_data(rules, patterns));
    let engine = FraudEngine::new(
        config,
        store.clone(),
        store,
        Arc::new(StaticIpIntelligence::new(intel)),
    )?;

    let outcome = engine.evaluate(request).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
