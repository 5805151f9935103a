use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use crucible_agents::{AgentRegistry, LlmAgentConfig};
use crucible_engine::{EngineConfig, EngineContext};
use crucible_observability::{canonical_logs_dir_from_root, init_process_logging, ProcessKind};
use crucible_server::{serve, AppState};

#[derive(Parser, Debug)]
#[command(name = "crucible-engine")]
#[command(about = "Headless Crucible reasoning backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP API.
    Serve {
        #[arg(long, alias = "host")]
        hostname: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, env = "CRUCIBLE_DATA_DIR")]
        data_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            data_dir,
        } => {
            let mut config = EngineConfig::from_env();
            if let Some(hostname) = hostname {
                config.api_host = hostname;
            }
            if let Some(port) = port {
                config.api_port = port;
            }
            if let Some(data_dir) = data_dir {
                config.database_url = data_dir;
            }

            if std::env::var("RUST_LOG").is_err() {
                std::env::set_var("RUST_LOG", &config.log_level);
            }
            let logs_dir = canonical_logs_dir_from_root(&config.store_path());
            let (_guard, log_info) = init_process_logging(ProcessKind::Api, &logs_dir, 14)?;
            info!(logs_dir = %log_info.logs_dir, "logging initialized");

            let registry = AgentRegistry::from_llm_config(&llm_config_from_env());
            let ctx = EngineContext::init_with_registry(config.clone(), registry).await?;
            let addr: SocketAddr = format!("{}:{}", config.api_host, config.api_port)
                .parse()
                .context("invalid api host or port")?;

            let state = AppState { ctx: Arc::new(ctx) };
            serve(addr, state).await?;
        }
    }

    Ok(())
}

fn llm_config_from_env() -> LlmAgentConfig {
    let defaults = LlmAgentConfig::default();
    LlmAgentConfig {
        base_url: std::env::var("CRUCIBLE_LLM_BASE_URL").unwrap_or(defaults.base_url),
        api_key: std::env::var("CRUCIBLE_LLM_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty()),
        model: std::env::var("CRUCIBLE_LLM_MODEL").unwrap_or(defaults.model),
        provider_id: std::env::var("CRUCIBLE_LLM_PROVIDER").unwrap_or(defaults.provider_id),
    }
}
