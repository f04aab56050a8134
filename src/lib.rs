pub mod bot;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fetcher;
pub mod generator;
pub mod ollama;
pub mod publisher;
pub mod rate_limit;
pub mod shutdown;
pub mod state;
pub mod types;
pub mod x_api;

#[cfg(test)]
mod test_support;

use log::{debug, info};

use bot::Orchestrator;
use config::Config;
use error::{BotError, Result};
use fetcher::discover_account;
use ollama::{OllamaClient, ensure_model_available};
use rate_limit::{BackoffPolicy, RateLimiter};
use state::StateFile;
use x_api::XClient;

/// Run the mention bot until a shutdown signal or a fatal error.
///
/// # Errors
///
/// Returns an error if configuration is invalid, the backend or model is
/// unavailable, the credentials are rejected, or the state file is corrupt.
pub async fn run() -> Result<()> {
    info!("Initializing bot");
    let config = Config::from_env()?;

    debug!("Checking inference backend at {}", config.ollama_url);
    let backend = OllamaClient::from_config(&config);
    ensure_model_available(&backend).await?;

    let shutdown = shutdown::install_signal_handler();

    debug!("Resolving the bot account");
    let social = XClient::from_config(&config);
    let mut limiter = RateLimiter::new(
        "platform",
        BackoffPolicy {
            floor: config.backoff_floor,
            ceiling: config.backoff_ceiling,
        },
    );
    let discovered =
        discover_account(&social, &mut limiter, config.max_attempts, &shutdown).await;
    let account = match discovered {
        Err(BotError::Shutdown) => {
            info!("Shutdown requested before the bot started");
            return Ok(());
        }
        result => result?,
    };
    info!("Authenticated as @{} ({})", account.handle, account.id);

    let mut orchestrator = Orchestrator::new(&config, social, account, backend, shutdown);

    if let Some(path) = &config.state_file {
        let file = StateFile::new(path);
        if let Some(saved) = file.load().await? {
            orchestrator.restore(saved);
        }
        orchestrator = orchestrator.with_state_file(file);
    }

    orchestrator.run().await
}
