//! chatrelay: chat sessions over HTTP with streamed replies from external LLM providers.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod error;
mod routes;
mod state;

use chatrelay_chat::ProviderRegistry;
use chatrelay_core::RelayConfig;
use chatrelay_store::SqliteStore;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; the environment may be set directly.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "--help" | "-h" | "help" => {
                println!("chatrelay: streaming chat relay for OpenAI and Gemini");
                println!();
                println!("Usage: chatrelay");
                println!();
                println!("Configuration is read from the environment (or a .env file):");
                println!("  APP_HOST, APP_PORT, CORS_ORIGINS, CHATRELAY_DATA_DIR");
                println!("  OPENAI_API_KEY, GEMINI_API_KEY, OPENAI_BASE_URL, GEMINI_BASE_URL");
                println!("  DEFAULT_PROVIDER, DEFAULT_MODEL, MAX_OUTPUT_TOKENS, PROVIDER_TIMEOUT_SECS");
                return Ok(());
            }
            other => {
                eprintln!("Unknown command: {}. Use 'chatrelay help' for usage.", other);
                std::process::exit(1);
            }
        }
    }

    let config = RelayConfig::from_env().context("Failed to load configuration")?;
    let data_dir = config
        .ensure_data_dir()
        .context("Failed to create data directory")?
        .to_path_buf();
    info!("Data directory: {}", data_dir.display());

    let store = SqliteStore::open(&data_dir)
        .map_err(|e| anyhow::anyhow!("Failed to open store: {}", e))?;
    let registry = ProviderRegistry::from_config(&config)
        .map_err(|e| anyhow::anyhow!("Failed to build provider registry: {}", e))?;
    info!("Providers: {:?}", registry.names());

    let addr = config.bind_addr();
    let state = Arc::new(AppState::new(config, Arc::new(store), Arc::new(registry)));
    let app = routes::build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("chatrelay listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
