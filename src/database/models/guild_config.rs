//! Per-guild configuration document.

use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use super::gatekeeper::GatekeeperConfig;

/// Configuration document stored for each guild in `guild_config`.
///
/// Only the `gatekeeper` key is read here. Saves `$set` that key alone, so other keys
/// written by other tools survive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuildConfig {
    /// MongoDB document ID
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    /// Discord guild ID
    pub guild_id: u64,

    #[serde(default)]
    pub gatekeeper: GatekeeperConfig,
}

impl GuildConfig {
    pub fn new(guild_id: u64, gatekeeper: GatekeeperConfig) -> Self {
        Self {
            id: None,
            guild_id,
            gatekeeper,
        }
    }
}
