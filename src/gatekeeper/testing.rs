//! Shared fixtures for keeper and service tests.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;

use super::keeper::{Keeper, KeeperSettings};
use crate::database::{ConfigStore, GatekeeperConfig, MemoryConfigStore};
use crate::platform::mock::MockPlatform;
use crate::platform::{Member, Platform, ReactionEvent, Reactor};

pub const GUILD: u64 = 1;
pub const OTHER_GUILD: u64 = 2;
pub const BROADCAST: u64 = 500;
pub const FOREIGN_CHANNEL: u64 = 600;

/// A year-old human account with a custom avatar; passes every check by default.
pub fn member(id: u64) -> Member {
    Member {
        id,
        guild_id: GUILD,
        tag: format!("user{}", id),
        username: format!("user{}", id),
        created_at: Utc::now() - Duration::days(365),
        avatar: Some("a1b2c3".into()),
        avatar_url: format!("https://cdn.example/avatars/{}/a1b2c3.png", id),
        bot: false,
    }
}

/// Enabled config reporting to [`BROADCAST`], merged with `value`.
pub fn config(value: Value) -> GatekeeperConfig {
    let mut config: GatekeeperConfig = serde_json::from_value(value).unwrap();
    config.enabled = true;
    if config.broadcast_channel.is_none() {
        config.broadcast_channel = Some(BROADCAST);
    }
    config
}

pub fn platform() -> Arc<MockPlatform> {
    Arc::new(
        MockPlatform::new()
            .with_channel(BROADCAST, GUILD)
            .with_channel(FOREIGN_CHANNEL, OTHER_GUILD),
    )
}

pub struct Harness {
    pub keeper: Arc<Keeper>,
    pub platform: Arc<MockPlatform>,
    pub store: Arc<MemoryConfigStore>,
}

/// A keeper for [`GUILD`] whose stored config is `config`.
pub fn harness(config: GatekeeperConfig) -> Harness {
    let platform = platform();
    let store = Arc::new(MemoryConfigStore::new());
    store.put(GUILD, config.clone());

    let keeper = Arc::new(Keeper::new(
        GUILD,
        config,
        platform.clone() as Arc<dyn Platform>,
        store.clone() as Arc<dyn ConfigStore>,
        KeeperSettings::default(),
    ));

    Harness {
        keeper,
        platform,
        store,
    }
}

pub fn moderator(id: u64, bot: bool, can_ban_members: bool) -> Reactor {
    Reactor {
        id,
        tag: format!("mod{}", id),
        bot,
        can_ban_members,
    }
}

pub fn reaction(message_id: u64, emoji: &str, reactor: Reactor) -> ReactionEvent {
    ReactionEvent {
        guild_id: Some(GUILD),
        channel_id: BROADCAST,
        message_id,
        emoji: emoji.to_string(),
        reactor: Some(reactor),
    }
}

/// Yield to spawned tasks until `condition` holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}
