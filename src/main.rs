use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;

use parley_core::agents::{AgentCatalog, AgentConfig};
use parley_llm::OpenRouterClient;
use parley_server::{AppState, ServerConfig, StaticTokenAuth};
use parley_store::Database;

/// Parley chat session server.
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Database file (defaults to ~/.parley/parley.db)
    #[arg(long)]
    db: Option<PathBuf>,

    /// JSON file with the agent catalog, replacing the builtin one
    #[arg(long)]
    agents: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Starting parley server");

    // Database
    let db_path = args
        .db
        .unwrap_or_else(|| dirs_home().join(".parley").join("parley.db"));
    let db = Database::open(&db_path)
        .with_context(|| format!("open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "Database opened");

    // Agent catalog
    let catalog = match &args.agents {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read agent catalog {}", path.display()))?;
            let agents: Vec<AgentConfig> = serde_json::from_str(&raw)
                .with_context(|| format!("parse agent catalog {}", path.display()))?;
            AgentCatalog::new(agents)
                .with_context(|| format!("agent catalog {}", path.display()))?
        }
        None => AgentCatalog::builtin(),
    };
    tracing::info!(agents = catalog.agents().len(), "Agent catalog loaded");

    // Completion client; without a key every reply degrades to mock mode
    let api_key = std::env::var("OPENROUTER_API_KEY")
        .ok()
        .filter(|k| !k.trim().is_empty())
        .map(SecretString::from);
    if api_key.is_none() {
        tracing::info!("OPENROUTER_API_KEY not set; replies will use mock mode");
    }
    let completion = Arc::new(OpenRouterClient::new(api_key));

    // Bearer tokens
    let auth = match std::env::var("PARLEY_TOKENS") {
        Ok(spec) if !spec.trim().is_empty() => {
            let auth = StaticTokenAuth::from_spec(&spec);
            if auth.is_empty() {
                anyhow::bail!("PARLEY_TOKENS is set but has no usable token:user entries");
            }
            auth
        }
        _ => {
            tracing::warn!(
                "PARLEY_TOKENS not set; accepting the development token \"local-dev\""
            );
            StaticTokenAuth::single("local-dev", "local")
        }
    };

    let state = AppState::new(db, catalog, Arc::new(auth), completion);

    // Start server
    let config = ServerConfig {
        bind: args.bind,
        port: args.port,
        ..Default::default()
    };
    let handle = parley_server::start(config, state)
        .await
        .context("start server")?;

    tracing::info!(addr = %handle.addr, "Parley server ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await.context("listen for ctrl+c")?;

    tracing::info!("Shutting down");
    Ok(())
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
