//! Platform collaborator interface.
//!
//! The admission engine never touches the chat platform SDK directly. Everything it
//! needs (kicking, banning, messaging, reactions) goes through [`Platform`], so the
//! Discord runtime in `bot` and the recording platform used in tests are interchangeable.

#[cfg(test)]
pub mod mock;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// A guild member as seen at the moment it joined.
///
/// Immutable for the duration of processing a single join event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: u64,
    pub guild_id: u64,
    /// Display tag, e.g. `name#1234` or just `name` for migrated usernames.
    pub tag: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    /// Avatar hash, `None` when the platform default avatar is in use.
    pub avatar: Option<String>,
    /// URL of whatever avatar is displayed (custom or default).
    pub avatar_url: String,
    pub bot: bool,
}

impl Member {
    /// Whether the member still has the platform default avatar.
    pub fn has_default_avatar(&self) -> bool {
        self.avatar.is_none()
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (`{}`)", self.tag, self.id)
    }
}

/// Colour family of a broadcast embed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedColour {
    /// Bounces.
    Red,
    /// Bans.
    Purple,
    /// Successful joins.
    Green,
}

/// Platform-neutral rich message.
#[derive(Debug, Clone, PartialEq)]
pub struct Embed {
    pub colour: EmbedColour,
    pub title: String,
    pub description: Option<String>,
    pub thumbnail: Option<String>,
    pub fields: Vec<(String, String)>,
    pub timestamp: DateTime<Utc>,
}

/// What gets posted to a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Embed(Embed),
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Embed> for Payload {
    fn from(embed: Embed) -> Self {
        Self::Embed(embed)
    }
}

/// Handle to a message the bot has sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHandle {
    pub channel_id: u64,
    pub message_id: u64,
}

/// The user behind a reaction, with the bits the reversal prompt cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reactor {
    pub id: u64,
    pub tag: String,
    pub bot: bool,
    /// Whether the user is a member of the reaction's guild holding `ban_members`.
    pub can_ban_members: bool,
}

impl fmt::Display for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (`{}`)", self.tag, self.id)
    }
}

/// A reaction added to some message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionEvent {
    pub guild_id: Option<u64>,
    pub channel_id: u64,
    pub message_id: u64,
    pub emoji: String,
    /// `None` when the reacting user could not be resolved to a guild member.
    pub reactor: Option<Reactor>,
}

/// Predicate handed to [`Platform::wait_for_reaction`].
pub type ReactionPredicate = Box<dyn Fn(&ReactionEvent) -> bool + Send + Sync>;

/// Errors surfaced by platform calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("403 Forbidden: {0}")]
    Forbidden(String),

    #[error("404 Not Found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Http(String),

    #[error("event stream closed")]
    Closed,
}

pub type PlatformResult<T> = Result<T, PlatformError>;

/// Operations the admission engine consumes from the chat platform.
///
/// Implementations must be safe to call concurrently from many guild tasks.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Kick a member, recording `reason` in the audit log.
    async fn kick(&self, member: &Member, reason: &str) -> PlatformResult<()>;

    /// Ban a member, recording `reason` in the audit log.
    async fn ban(&self, member: &Member, delete_message_days: u8, reason: &str)
        -> PlatformResult<()>;

    /// Lift a ban.
    async fn unban(&self, guild_id: u64, user_id: u64, reason: &str) -> PlatformResult<()>;

    /// Send a direct message.
    async fn dm(&self, user_id: u64, text: &str) -> PlatformResult<()>;

    /// Post to a channel.
    async fn send(&self, channel_id: u64, payload: Payload) -> PlatformResult<MessageHandle>;

    /// React to a message.
    async fn add_reaction(&self, message: MessageHandle, emoji: &str) -> PlatformResult<()>;

    /// Wait for the first reaction matching `predicate`.
    async fn wait_for_reaction(&self, predicate: ReactionPredicate)
        -> PlatformResult<ReactionEvent>;

    /// Resolve a channel to the guild that owns it.
    ///
    /// Returns `None` when the channel is unknown or is not a text channel.
    fn channel_guild(&self, channel_id: u64) -> Option<u64>;
}
