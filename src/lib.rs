// Declare the modules
pub mod api;
pub mod commands;
pub mod config;
pub mod error;
pub mod models;
pub mod request;
pub mod server;
pub mod session;
pub mod state;
pub mod storage;
pub mod sync;

use anyhow::Context;
use api::ProviderRegistry;
use clap::{Parser, Subcommand};
use config::{AppConfig, Credentials};
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use storage::StorageManager;

#[derive(Parser, Debug)]
#[command(name = "arcchat", version, about = "Chat backend for OpenAI and Gemini models")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the chat API (default)
    Serve {
        /// Address to listen on (overrides ARCCHAT_BIND)
        #[arg(long)]
        bind: Option<SocketAddr>,
        /// Directory holding the chat store (overrides ARCCHAT_DATA_DIR)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Report which provider credentials are configured
    CheckEnv,
}

pub async fn run() -> anyhow::Result<ExitCode> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve {
        bind: None,
        data_dir: None,
    }) {
        Command::Serve { bind, data_dir } => {
            let config = AppConfig::load(bind, data_dir)?;
            serve(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::CheckEnv => {
            config::load_dotenv();
            Ok(check_env(&Credentials::from_env()))
        }
    }
}

/// Prints the configured providers; fails when there are none.
pub fn check_env(credentials: &Credentials) -> ExitCode {
    let configured = credentials.configured_providers();
    if configured.is_empty() {
        println!("No API keys configured!");
        println!("Add at least one of the following to .env.local or the environment:");
        println!("  - OPENAI_API_KEY for GPT models");
        println!("  - GOOGLE_GENERATIVE_AI_API_KEY for Gemini models");
        return ExitCode::FAILURE;
    }
    println!("Configured providers:");
    for provider in configured {
        println!("  - {} ({})", provider.display_name(), provider.credential_var());
    }
    ExitCode::SUCCESS
}

pub async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let storage_manager = StorageManager::new(&config.db_path()).await?;

    if config.credentials.configured_providers().is_empty() {
        log::warn!("No provider credentials configured; chat requests will fail until one is set");
    }
    let providers = ProviderRegistry::new(config.credentials.clone(), &config.endpoints);
    let app_state = AppState::new(storage_manager, providers);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    log::info!("Listening on http://{}", config.bind);

    axum::serve(listener, server::router(app_state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("Shutting down");
        })
        .await
        .context("Server error")?;
    Ok(())
}
