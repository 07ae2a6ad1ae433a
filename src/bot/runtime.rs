//! Gateway client runner.

use std::sync::Arc;

use serenity::Client;
use tracing::{error, info};

use super::handler::Handler;
use super::platform::DiscordPlatform;
use crate::config::Config;
use crate::gatekeeper::GatekeeperService;

/// Connect to the gateway and process events until shutdown.
///
/// Ctrl-C shuts every shard down and cancels pending background work.
pub async fn run(
    config: &Config,
    service: Arc<GatekeeperService>,
    platform: Arc<DiscordPlatform>,
) -> anyhow::Result<()> {
    let handler = Handler::new(Arc::clone(&service), Arc::clone(&platform));
    let mut client = Client::builder(&config.discord_token, Handler::intents())
        .event_handler(handler)
        .await?;

    platform.attach_cache(Arc::clone(&client.cache));

    let shard_manager = Arc::clone(&client.shard_manager);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down...");
                service.shutdown();
                shard_manager.shutdown_all().await;
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    info!("Starting Discord client...");
    client.start().await?;

    Ok(())
}
