//! Configuration store seam.
//!
//! The admission engine reads and writes a guild's gatekeeper configuration through
//! [`ConfigStore`]. Every successful save is published to subscribers as a
//! [`ConfigChange`], which is how running keepers pick up edits.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

use super::models::GatekeeperConfig;

/// A guild's configuration after a save.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigChange {
    pub guild_id: u64,
    pub config: GatekeeperConfig,
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Current configuration, `None` if the guild never saved one.
    async fn load(&self, guild_id: u64) -> Result<Option<GatekeeperConfig>>;

    /// Persist the configuration and publish a [`ConfigChange`].
    async fn save(&self, guild_id: u64, config: &GatekeeperConfig) -> Result<()>;

    /// Stream of saved configurations.
    fn subscribe(&self) -> broadcast::Receiver<ConfigChange>;
}

#[cfg(test)]
pub use memory::MemoryConfigStore;
