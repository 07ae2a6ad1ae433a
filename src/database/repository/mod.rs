//! Repository module - data access layer.

mod guild_config_repository;

pub use guild_config_repository::GuildConfigRepository;
