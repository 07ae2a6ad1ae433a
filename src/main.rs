//! Gatekeeper - Member admission control for Discord guilds
//!
//! Screens every new member against per-guild checks, bounces or bans offenders and
//! locks the guild down when joins arrive faster than configured.
//!
//! ## Architecture
//!
//! - `config` - Environment configuration
//! - `database` - MongoDB-backed guild configuration store
//! - `cache` - TTL caching with Moka
//! - `gatekeeper` - Checks, rate limiting and the per-guild admission engine
//! - `platform` - Chat platform interface consumed by the engine
//! - `bot` - Serenity gateway client and platform implementation
//! - `utils` - Formatting helpers

mod bot;
mod cache;
mod config;
mod database;
mod gatekeeper;
mod platform;
mod utils;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use bot::DiscordPlatform;
use config::Config;
use database::{Database, GuildConfigRepository};
use gatekeeper::GatekeeperService;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // If RUST_LOG is not set, default to "info" for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gatekeeper=info,serenity=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting Gatekeeper...");

    let config = Config::from_env()?;
    info!("Configuration loaded successfully");

    info!("Connecting to MongoDB...");
    let db = Database::connect(&config.mongodb_uri, &config.mongodb_database).await?;
    let store = Arc::new(GuildConfigRepository::new(&db, config.config_refresh));
    info!("Database connected");

    let platform = Arc::new(DiscordPlatform::new(&config.discord_token));
    let service = Arc::new(GatekeeperService::new(
        platform.clone(),
        store,
        config.keeper_settings(),
    ));
    service.spawn_change_listener();

    bot::run(&config, service, platform).await?;

    Ok(())
}
