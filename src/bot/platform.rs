//! [`Platform`] backed by serenity's HTTP client and gateway cache.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serenity::all::{
    Cache, ChannelId, ChannelType, Colour, CreateEmbed, CreateMessage, GuildId, Http,
    MessageId, ReactionType, Timestamp, UserId,
};
use tokio::sync::broadcast;
use tracing::debug;

use crate::platform::{
    Embed, EmbedColour, Member, MessageHandle, Payload, Platform, PlatformError,
    PlatformResult, ReactionEvent, ReactionPredicate,
};

const REACTION_BUFFER: usize = 256;

pub struct DiscordPlatform {
    http: Arc<Http>,
    cache: OnceLock<Arc<Cache>>,
    reactions: broadcast::Sender<ReactionEvent>,
}

impl DiscordPlatform {
    pub fn new(token: &str) -> Self {
        let (reactions, _) = broadcast::channel(REACTION_BUFFER);
        Self {
            http: Arc::new(Http::new(token)),
            cache: OnceLock::new(),
            reactions,
        }
    }

    /// Hand over the gateway cache once the client has been built.
    pub fn attach_cache(&self, cache: Arc<Cache>) {
        if self.cache.set(cache).is_err() {
            debug!("Gateway cache already attached");
        }
    }

    /// Fan a gateway reaction out to every pending waiter.
    pub fn publish_reaction(&self, event: ReactionEvent) {
        // No receivers just means nobody is waiting on a prompt.
        let _ = self.reactions.send(event);
    }
}

#[async_trait]
impl Platform for DiscordPlatform {
    async fn kick(&self, member: &Member, reason: &str) -> PlatformResult<()> {
        self.http
            .kick_member(
                GuildId::new(member.guild_id),
                UserId::new(member.id),
                Some(reason),
            )
            .await
            .map_err(platform_error)
    }

    async fn ban(
        &self,
        member: &Member,
        delete_message_days: u8,
        reason: &str,
    ) -> PlatformResult<()> {
        self.http
            .ban_user(
                GuildId::new(member.guild_id),
                UserId::new(member.id),
                delete_message_days,
                Some(reason),
            )
            .await
            .map_err(platform_error)
    }

    async fn unban(&self, guild_id: u64, user_id: u64, reason: &str) -> PlatformResult<()> {
        self.http
            .remove_ban(GuildId::new(guild_id), UserId::new(user_id), Some(reason))
            .await
            .map_err(platform_error)
    }

    async fn dm(&self, user_id: u64, text: &str) -> PlatformResult<()> {
        UserId::new(user_id)
            .direct_message(&self.http, CreateMessage::new().content(text))
            .await
            .map(|_| ())
            .map_err(platform_error)
    }

    async fn send(&self, channel_id: u64, payload: Payload) -> PlatformResult<MessageHandle> {
        let message = match payload {
            Payload::Text(text) => CreateMessage::new().content(text),
            Payload::Embed(embed) => CreateMessage::new().embed(build_embed(embed)),
        };

        let sent = ChannelId::new(channel_id)
            .send_message(&self.http, message)
            .await
            .map_err(platform_error)?;

        Ok(MessageHandle {
            channel_id: sent.channel_id.get(),
            message_id: sent.id.get(),
        })
    }

    async fn add_reaction(&self, message: MessageHandle, emoji: &str) -> PlatformResult<()> {
        let reaction = ReactionType::try_from(emoji)
            .map_err(|_| PlatformError::Http(format!("Invalid emoji `{emoji}`")))?;

        ChannelId::new(message.channel_id)
            .create_reaction(&self.http, MessageId::new(message.message_id), reaction)
            .await
            .map_err(platform_error)
    }

    async fn wait_for_reaction(
        &self,
        predicate: ReactionPredicate,
    ) -> PlatformResult<ReactionEvent> {
        let mut rx = self.reactions.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Reaction waiter skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(PlatformError::Closed),
            }
        }
    }

    fn channel_guild(&self, channel_id: u64) -> Option<u64> {
        if channel_id == 0 {
            return None;
        }
        let cache = self.cache.get()?;
        let channel = cache.channel(ChannelId::new(channel_id))?;
        matches!(channel.kind, ChannelType::Text | ChannelType::News)
            .then(|| channel.guild_id.get())
    }
}

fn colour(colour: EmbedColour) -> Colour {
    match colour {
        EmbedColour::Red => Colour::new(0xE7_4C_3C),
        EmbedColour::Purple => Colour::new(0x9B_59_B6),
        EmbedColour::Green => Colour::new(0x2E_CC_71),
    }
}

fn build_embed(embed: Embed) -> CreateEmbed {
    let mut builder = CreateEmbed::new()
        .title(embed.title)
        .colour(colour(embed.colour));

    if let Some(description) = embed.description {
        builder = builder.description(description);
    }
    if let Some(thumbnail) = embed.thumbnail {
        builder = builder.thumbnail(thumbnail);
    }
    for (name, value) in embed.fields {
        builder = builder.field(name, value, false);
    }
    if let Ok(timestamp) = Timestamp::from_unix_timestamp(embed.timestamp.timestamp()) {
        builder = builder.timestamp(timestamp);
    }

    builder
}

fn platform_error(error: serenity::Error) -> PlatformError {
    if let serenity::Error::Http(http_error) = &error {
        match http_error.status_code().map(|status| status.as_u16()) {
            Some(403) => return PlatformError::Forbidden(http_error.to_string()),
            Some(404) => return PlatformError::NotFound(http_error.to_string()),
            _ => {}
        }
    }
    PlatformError::Http(error.to_string())
}
