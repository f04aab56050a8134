#[tokio::main]
async fn main() -> mentionbot::error::Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("mentionbot=info,reqwest=warn"),
    )
    .init();
    log::info!("Starting mentionbot");

    match mentionbot::run().await {
        Ok(()) => {
            log::info!("Bot shut down successfully");
            Ok(())
        }
        Err(e) => {
            log::error!("Bot encountered an error: {e}");
            Err(e)
        }
    }
}
