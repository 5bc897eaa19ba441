use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use docqa::{run_server, AppConfig, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        "answer model {}, embedding model {}, collection {}",
        config.models.answer_model,
        config.models.embedding_model,
        config.vector.collection
    );

    let state = AppState::from_config(config)
        .await
        .context("failed to initialise services")?;

    let recovered = state
        .ingestor
        .recover_interrupted()
        .await
        .context("failed to recover interrupted uploads")?;
    if recovered > 0 {
        tracing::warn!("{} interrupted uploads marked failed", recovered);
    }

    run_server(state).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
