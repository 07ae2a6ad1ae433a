//! Guild registry and entry points.
//!
//! The service owns one [`Keeper`] per guild and routes gateway events and configuration
//! changes to it. Operator actions (lockdown, enable/disable, allow lists) are written
//! through the config store and come back in through [`GatekeeperService::on_config_changed`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::keeper::{Decision, Keeper, KeeperSettings};
use super::ratelimiter::RateKey;
use crate::database::{AllowedUser, ConfigStore, GatekeeperConfig};
use crate::platform::{Member, Platform};

#[allow(dead_code)]
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("`{0}` is already being allowed")]
    AlreadyAllowed(AllowedUser),

    #[error("`{0}` isn't being allowed")]
    NotAllowed(AllowedUser),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Snapshot for the status view.
#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatekeeperStatus {
    pub enabled: bool,
    pub block_all: bool,
    pub keeper_present: bool,
    /// Members the next lockdown would bounce
    pub tracked_joins: usize,
    /// Joins counted against the auto-lockdown threshold right now
    pub joins_in_window: usize,
    pub join_window_resets_in: Duration,
}

pub struct GatekeeperService {
    platform: Arc<dyn Platform>,
    store: Arc<dyn ConfigStore>,
    settings: KeeperSettings,
    keepers: DashMap<u64, Arc<Keeper>>,
}

impl GatekeeperService {
    pub fn new(
        platform: Arc<dyn Platform>,
        store: Arc<dyn ConfigStore>,
        settings: KeeperSettings,
    ) -> Self {
        Self {
            platform,
            store,
            settings,
            keepers: DashMap::new(),
        }
    }

    pub fn keeper(&self, guild_id: u64) -> Option<Arc<Keeper>> {
        self.keepers.get(&guild_id).map(|keeper| Arc::clone(keeper.value()))
    }

    pub fn guild_count(&self) -> usize {
        self.keepers.len()
    }

    /// Hand a guild's new configuration to its keeper, creating the keeper if needed.
    ///
    /// A configuration older than the one the keeper holds is dropped.
    pub fn on_config_changed(&self, guild_id: u64, config: GatekeeperConfig) {
        match self.keepers.entry(guild_id) {
            Entry::Occupied(entry) => {
                if entry.get().offer_config(config) {
                    debug!("Updated keeper config for guild {}", guild_id);
                }
            }
            Entry::Vacant(entry) => {
                debug!("Creating a new keeper for guild {}", guild_id);
                entry.insert(Arc::new(Keeper::new(
                    guild_id,
                    config,
                    Arc::clone(&self.platform),
                    Arc::clone(&self.store),
                    self.settings.clone(),
                )));
            }
        }
    }

    /// Re-read a guild's configuration and apply it if it changed.
    ///
    /// Guilds without a stored configuration get a keeper with the default (disabled) one.
    pub async fn refresh_config(&self, guild_id: u64) -> anyhow::Result<()> {
        let config = self.store.load(guild_id).await?.unwrap_or_default();

        let unchanged = self
            .keeper(guild_id)
            .is_some_and(|keeper| keeper.config() == config);
        if !unchanged {
            self.on_config_changed(guild_id, config);
        }
        Ok(())
    }

    /// Screen a member that just joined.
    ///
    /// Returns `None` when Gatekeeper is off for the guild or the guild is unknown.
    pub async fn on_member_join(&self, member: &Member) -> Option<Decision> {
        let Some(keeper) = self.keeper(member.guild_id) else {
            debug!("Member {} joined keeperless guild {}", member.id, member.guild_id);
            return None;
        };

        let config = keeper.config();
        if !config.enabled {
            return None;
        }

        if config.is_allowed(member) {
            debug!("Guild {}: {} is specifically allowed", member.guild_id, member.id);
            keeper.announce_join(member, true, Utc::now()).await;
            return Some(Decision::Allowed);
        }

        Some(keeper.check(member).await)
    }

    /// Forget a guild the bot left. Pending reversal prompts are cancelled.
    pub fn remove_guild(&self, guild_id: u64) {
        if let Some((_, keeper)) = self.keepers.remove(&guild_id) {
            keeper.shutdown();
            info!("Removed keeper for guild {}", guild_id);
        }
    }

    /// Cancel background work of every guild.
    pub fn shutdown(&self) {
        for keeper in self.keepers.iter() {
            keeper.shutdown();
        }
    }

    /// Apply every configuration the store publishes.
    pub fn spawn_change_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut changes = self.store.subscribe();
        let service = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => service.on_config_changed(change.guild_id, change.config),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Config listener lagged, skipped {} changes", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Config listener stopped");
        })
    }
}

/// Operator operations. Every edit goes through the store and is applied locally.
#[allow(dead_code)]
impl GatekeeperService {
    /// Load, modify and save a guild's configuration.
    async fn edit_config<T>(
        &self,
        guild_id: u64,
        edit: impl FnOnce(&mut GatekeeperConfig) -> ServiceResult<T>,
    ) -> ServiceResult<T> {
        let mut config = self.store.load(guild_id).await?.unwrap_or_default();
        let output = edit(&mut config)?;
        let seen = self.keeper(guild_id).map_or(0, |keeper| keeper.config().revision);
        config.advance_revision(seen);

        self.store.save(guild_id, &config).await?;
        self.on_config_changed(guild_id, config);
        Ok(output)
    }

    /// Switch `block_all` on or off.
    pub async fn lockdown(&self, guild_id: u64, enabled: bool) -> ServiceResult<()> {
        self.edit_config(guild_id, |config| {
            config.set_block_all(enabled);
            Ok(())
        })
        .await?;
        info!(
            "Guild {}: block_all {}",
            guild_id,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    pub async fn set_enabled(&self, guild_id: u64, enabled: bool) -> ServiceResult<()> {
        self.edit_config(guild_id, |config| {
            config.enabled = enabled;
            Ok(())
        })
        .await
    }

    /// Flip `enabled`, returning the new value.
    pub async fn toggle(&self, guild_id: u64) -> ServiceResult<bool> {
        self.edit_config(guild_id, |config| {
            config.enabled = !config.enabled;
            Ok(config.enabled)
        })
        .await
    }

    /// Let a user bypass every check.
    pub async fn allow_user(&self, guild_id: u64, user: AllowedUser) -> ServiceResult<()> {
        self.edit_config(guild_id, |config| {
            if config.allowed_users.contains(&user) {
                return Err(ServiceError::AlreadyAllowed(user));
            }
            config.allowed_users.push(user);
            Ok(())
        })
        .await
    }

    pub async fn disallow_user(&self, guild_id: u64, user: AllowedUser) -> ServiceResult<()> {
        self.edit_config(guild_id, |config| {
            let Some(index) = config.allowed_users.iter().position(|u| *u == user) else {
                return Err(ServiceError::NotAllowed(user));
            };
            config.allowed_users.remove(index);
            Ok(())
        })
        .await
    }

    pub async fn status(&self, guild_id: u64) -> ServiceResult<GatekeeperStatus> {
        let keeper = self.keeper(guild_id);
        let config = match &keeper {
            Some(keeper) => keeper.config(),
            None => self.store.load(guild_id).await?.unwrap_or_default(),
        };

        let join_ratelimiter = keeper.as_ref().and_then(|k| k.join_ratelimiter());
        Ok(GatekeeperStatus {
            enabled: config.enabled,
            block_all: config.block_all_enabled(),
            keeper_present: keeper.is_some(),
            tracked_joins: keeper.as_ref().map_or(0, |k| k.recent_joins().len()),
            joins_in_window: join_ratelimiter
                .as_ref()
                .map_or(0, |l| l.hits_in_window(RateKey::AnyJoin)),
            join_window_resets_in: join_ratelimiter
                .as_ref()
                .map_or(Duration::ZERO, |l| l.time_remaining(RateKey::AnyJoin)),
        })
    }
}
