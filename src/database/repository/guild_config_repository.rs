//! Guild configuration repository.
//!
//! Reads go through a short-TTL cache so a join never waits on MongoDB twice in a row;
//! writes upsert the `gatekeeper` key and notify subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use mongodb::bson::{self, doc};
use mongodb::options::UpdateOptions;
use mongodb::Collection;
use tokio::sync::broadcast;
use tracing::debug;

use crate::cache::{CacheConfig, TypedCache};
use crate::database::models::{GatekeeperConfig, GuildConfig};
use crate::database::store::{ConfigChange, ConfigStore};
use crate::database::Database;

/// Repository for per-guild configuration documents.
pub struct GuildConfigRepository {
    collection: Collection<GuildConfig>,
    cache: TypedCache<u64, GuildConfig>,
    changes: broadcast::Sender<ConfigChange>,
    /// Bumped by every save, before its cache invalidation.
    writes: AtomicU64,
}

impl GuildConfigRepository {
    pub fn new(db: &Database, refresh: Duration) -> Self {
        let (changes, _) = broadcast::channel(256);

        Self {
            collection: db.collection("guild_config"),
            cache: TypedCache::new("guild_config", CacheConfig::guild_config(refresh)),
            changes,
            writes: AtomicU64::new(0),
        }
    }

    /// Get a guild's document, returning None if it was never written.
    pub async fn get(&self, guild_id: u64) -> Result<Option<GuildConfig>> {
        if let Some(config) = self.cache.get(&guild_id) {
            return Ok(Some(config));
        }

        let writes = self.writes.load(Ordering::Acquire);
        let filter = doc! { "guild_id": guild_id as i64 };
        let result = self.collection.find_one(filter).await?;
        debug!("DB get guild config for {}: {:?}", guild_id, result.is_some());

        if let Some(config) = &result {
            self.cache.insert(guild_id, config.clone());
            // A save landed while we were reading; this copy may predate it.
            if self.writes.load(Ordering::Acquire) != writes {
                self.cache.invalidate(&guild_id);
            }
        }

        Ok(result)
    }
}

#[async_trait]
impl ConfigStore for GuildConfigRepository {
    async fn load(&self, guild_id: u64) -> Result<Option<GatekeeperConfig>> {
        Ok(self.get(guild_id).await?.map(|config| config.gatekeeper))
    }

    async fn save(&self, guild_id: u64, config: &GatekeeperConfig) -> Result<()> {
        let filter = doc! { "guild_id": guild_id as i64 };
        let update = doc! { "$set": { "gatekeeper": bson::to_bson(config)? } };
        let options = UpdateOptions::builder().upsert(true).build();

        self.collection
            .update_one(filter, update)
            .with_options(options)
            .await?;

        self.writes.fetch_add(1, Ordering::AcqRel);
        // The cached document may carry an `_id` we don't know yet; let the next read fetch it.
        self.cache.invalidate(&guild_id);
        debug!("Saved gatekeeper config for guild {}", guild_id);

        // No receivers just means nothing is listening yet.
        let _ = self.changes.send(ConfigChange {
            guild_id,
            config: config.clone(),
        });

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.changes.subscribe()
    }
}
