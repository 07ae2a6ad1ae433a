//! Database models.

pub mod gatekeeper;
pub mod guild_config;

pub use gatekeeper::{AllowedUser, AutoLockdownConfig, CheckMap, CheckOptions, GatekeeperConfig};
pub use guild_config::GuildConfig;
