//! Configuration module.
//!
//! Loads process configuration from environment variables (a `.env` file is honoured).
//! Per-guild Gatekeeper settings live in MongoDB, not here.

use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::gatekeeper::KeeperSettings;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    // Discord
    pub discord_token: String,

    // MongoDB
    pub mongodb_uri: String,
    pub mongodb_database: String,

    /// Emoji moderators react with to reverse a ban
    pub unban_emoji: String,

    /// Extra capacity of the recent-joins tracker
    pub recent_joins_slack: usize,

    /// How long a cached guild config is trusted
    pub config_refresh: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    /// Fails if a required variable is missing or a numeric one doesn't parse.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let recent_joins_slack = match var("RECENT_JOINS_SLACK") {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("RECENT_JOINS_SLACK is not a number: {}", raw))?,
            None => 5,
        };
        if recent_joins_slack == 0 {
            bail!("RECENT_JOINS_SLACK must be at least 1");
        }

        let config_refresh = match var("CONFIG_REFRESH_SECS") {
            Some(raw) => Duration::from_secs(
                raw.parse::<u64>()
                    .with_context(|| format!("CONFIG_REFRESH_SECS is not a number: {}", raw))?,
            ),
            None => Duration::from_secs(60),
        };

        Ok(Self {
            discord_token: var("DISCORD_TOKEN").context("DISCORD_TOKEN must be set")?,
            mongodb_uri: var("MONGODB_URI").context("MONGODB_URI must be set")?,
            mongodb_database: var("MONGODB_DATABASE").unwrap_or_else(|| "gatekeeper".to_string()),
            unban_emoji: var("UNBAN_EMOJI").unwrap_or_else(|| "\u{1f513}".to_string()),
            recent_joins_slack,
            config_refresh,
        })
    }

    pub fn keeper_settings(&self) -> KeeperSettings {
        KeeperSettings {
            unban_emoji: self.unban_emoji.clone(),
            recent_joins_slack: self.recent_joins_slack,
        }
    }
}
