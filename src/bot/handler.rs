//! Gateway event handler.
//!
//! Translates serenity events into calls on [`GatekeeperService`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serenity::all::{
    Context, EventHandler, GatewayIntents, Guild, Member as GuildMember, Reaction, Ready,
    UnavailableGuild,
};
use serenity::async_trait;
use tracing::{debug, info, warn};

use super::platform::DiscordPlatform;
use crate::gatekeeper::GatekeeperService;
use crate::platform::{Member, ReactionEvent, Reactor};

pub struct Handler {
    service: Arc<GatekeeperService>,
    platform: Arc<DiscordPlatform>,
}

impl Handler {
    pub fn new(service: Arc<GatekeeperService>, platform: Arc<DiscordPlatform>) -> Self {
        Self { service, platform }
    }

    /// Gateway intents the handler relies on.
    pub fn intents() -> GatewayIntents {
        GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MEMBERS
            | GatewayIntents::GUILD_MESSAGE_REACTIONS
    }

    async fn refresh(&self, guild_id: u64) {
        if let Err(e) = self.service.refresh_config(guild_id).await {
            warn!("Failed to load configuration for guild {}: {:#}", guild_id, e);
        }
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!(
            "Connected as {} ({} guilds)",
            ready.user.name,
            ready.guilds.len()
        );
    }

    async fn guild_create(&self, _ctx: Context, guild: Guild, _is_new: Option<bool>) {
        debug!("Guild available: {} ({})", guild.name, guild.id);
        self.refresh(guild.id.get()).await;
    }

    async fn guild_delete(&self, _ctx: Context, incomplete: UnavailableGuild, _full: Option<Guild>) {
        // Outages also arrive as deletes; only forget guilds we actually left.
        if incomplete.unavailable {
            return;
        }
        self.service.remove_guild(incomplete.id.get());
    }

    async fn guild_member_addition(&self, _ctx: Context, new_member: GuildMember) {
        let member = to_member(&new_member);
        self.refresh(member.guild_id).await;

        if let Some(decision) = self.service.on_member_join(&member).await {
            debug!("Join of {} in guild {}: {:?}", member, member.guild_id, decision);
        }
    }

    async fn reaction_add(&self, ctx: Context, add_reaction: Reaction) {
        let event = to_reaction_event(&ctx, &add_reaction);
        self.platform.publish_reaction(event);
    }
}

fn to_member(member: &GuildMember) -> Member {
    let user = &member.user;
    let created_at =
        DateTime::<Utc>::from_timestamp(user.id.created_at().unix_timestamp(), 0).unwrap_or_default();

    Member {
        id: user.id.get(),
        guild_id: member.guild_id.get(),
        tag: user.tag(),
        username: user.name.clone(),
        created_at,
        avatar: user.avatar.map(|hash| hash.to_string()),
        avatar_url: user.face(),
        bot: user.bot,
    }
}

fn to_reaction_event(ctx: &Context, reaction: &Reaction) -> ReactionEvent {
    let reactor = reaction.member.as_ref().map(|member| {
        let can_ban_members = reaction
            .guild_id
            .and_then(|guild_id| ctx.cache.guild(guild_id))
            .is_some_and(|guild| guild.member_permissions(member).ban_members());

        Reactor {
            id: member.user.id.get(),
            tag: member.user.tag(),
            bot: member.user.bot,
            can_ban_members,
        }
    });

    ReactionEvent {
        guild_id: reaction.guild_id.map(|id| id.get()),
        channel_id: reaction.channel_id.get(),
        message_id: reaction.message_id.get(),
        emoji: reaction.emoji.to_string(),
        reactor,
    }
}
