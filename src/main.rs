// src/main.rs

use anyhow::{Context, Result};
use dotenv::dotenv;
use log::info;
use palaver::api::ApiClient;
use palaver::app_state::AppState;
use palaver::config::{config_dir, config_path, Config};
use palaver::logging::init_logging;
use palaver::ui::Repl;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let config_path = config_path()?;
    let config = Config::load_or_create(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let _logger = init_logging(config.effective_log_level(), &config_dir()?.join("logs"))?;
    info!("Starting palaver against {}", config.effective_api_url());

    let backend = Arc::new(ApiClient::new(config.effective_api_url()));
    let mut app = AppState::new(backend, config, config_path);
    app.load_models().await;
    app.refresh_conversations().await;

    let mut repl = Repl::new(app)?;
    repl.run().await?;

    info!("Session ended");
    Ok(())
}
