//! Engine Entry Point
//!
//! Loads configuration from the environment, wires the core runtime against
//! the default collaborators, and serves the HTTP surface until interrupted.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use metaevolve::runtime::CoreRuntime;
use metaevolve::server;
use metaevolve::EngineConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {}", err);
            std::process::exit(2);
        }
    };

    info!(
        db = %config.db_path,
        strategy = config.bandit.strategy.as_str(),
        n_default = config.budget.n_default,
        "starting prompt-optimization engine"
    );

    let runtime = CoreRuntime::new(config).await?;
    server::serve(runtime).await
}
