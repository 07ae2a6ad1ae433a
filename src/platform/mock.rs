//! Recording platform for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{
    Embed, Member, MessageHandle, Payload, Platform, PlatformError, PlatformResult,
    ReactionEvent, ReactionPredicate,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Kick { user_id: u64, reason: String },
    Ban { user_id: u64, delete_message_days: u8, reason: String },
    Unban { guild_id: u64, user_id: u64, reason: String },
    Dm { user_id: u64, text: String },
    Send { channel_id: u64, payload: Payload },
    React { message_id: u64, emoji: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Kick,
    Ban,
    Unban,
    Dm,
    Send,
}

pub struct MockPlatform {
    calls: Mutex<Vec<Call>>,
    channels: Mutex<HashMap<u64, u64>>,
    failures: Mutex<HashMap<Op, PlatformError>>,
    banned: Mutex<HashSet<(u64, u64)>>,
    next_message_id: AtomicU64,
    reactions: broadcast::Sender<ReactionEvent>,
}

impl MockPlatform {
    pub fn new() -> Self {
        let (reactions, _) = broadcast::channel(16);
        Self {
            calls: Mutex::new(Vec::new()),
            channels: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            banned: Mutex::new(HashSet::new()),
            next_message_id: AtomicU64::new(1),
            reactions,
        }
    }

    /// Register a text channel belonging to `guild_id`.
    pub fn with_channel(self, channel_id: u64, guild_id: u64) -> Self {
        self.channels.lock().insert(channel_id, guild_id);
        self
    }

    /// Make every future call of `op` fail with `error`.
    pub fn fail(&self, op: Op, error: PlatformError) {
        self.failures.lock().insert(op, error);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn kicks(&self) -> Vec<(u64, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Kick { user_id, reason } => Some((user_id, reason)),
                _ => None,
            })
            .collect()
    }

    pub fn bans(&self) -> Vec<(u64, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Ban { user_id, reason, .. } => Some((user_id, reason)),
                _ => None,
            })
            .collect()
    }

    pub fn unbans(&self) -> Vec<(u64, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Unban { user_id, reason, .. } => Some((user_id, reason)),
                _ => None,
            })
            .collect()
    }

    pub fn sent(&self) -> Vec<Payload> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Send { payload, .. } => Some(payload),
                _ => None,
            })
            .collect()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|payload| match payload {
                Payload::Text(text) => Some(text),
                Payload::Embed(_) => None,
            })
            .collect()
    }

    pub fn embeds(&self) -> Vec<Embed> {
        self.sent()
            .into_iter()
            .filter_map(|payload| match payload {
                Payload::Embed(embed) => Some(embed),
                Payload::Text(_) => None,
            })
            .collect()
    }

    pub fn reactions_added(&self) -> Vec<(u64, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::React { message_id, emoji } => Some((message_id, emoji)),
                _ => None,
            })
            .collect()
    }

    /// Number of tasks currently waiting for a reaction.
    pub fn reaction_waiters(&self) -> usize {
        self.reactions.receiver_count()
    }

    /// Deliver a reaction once somebody is listening.
    pub async fn react(&self, event: ReactionEvent) {
        while self.reactions.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }
        let _ = self.reactions.send(event);
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn check_failure(&self, op: Op) -> PlatformResult<()> {
        match self.failures.lock().get(&op) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Platform for MockPlatform {
    async fn kick(&self, member: &Member, reason: &str) -> PlatformResult<()> {
        self.record(Call::Kick { user_id: member.id, reason: reason.to_string() });
        self.check_failure(Op::Kick)
    }

    async fn ban(
        &self,
        member: &Member,
        delete_message_days: u8,
        reason: &str,
    ) -> PlatformResult<()> {
        self.record(Call::Ban {
            user_id: member.id,
            delete_message_days,
            reason: reason.to_string(),
        });
        self.check_failure(Op::Ban)?;
        self.banned.lock().insert((member.guild_id, member.id));
        Ok(())
    }

    async fn unban(&self, guild_id: u64, user_id: u64, reason: &str) -> PlatformResult<()> {
        self.record(Call::Unban { guild_id, user_id, reason: reason.to_string() });
        self.check_failure(Op::Unban)?;
        if self.banned.lock().remove(&(guild_id, user_id)) {
            Ok(())
        } else {
            Err(PlatformError::NotFound("Unknown Ban".into()))
        }
    }

    async fn dm(&self, user_id: u64, text: &str) -> PlatformResult<()> {
        self.record(Call::Dm { user_id, text: text.to_string() });
        self.check_failure(Op::Dm)
    }

    async fn send(&self, channel_id: u64, payload: Payload) -> PlatformResult<MessageHandle> {
        self.record(Call::Send { channel_id, payload });
        self.check_failure(Op::Send)?;
        Ok(MessageHandle {
            channel_id,
            message_id: self.next_message_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn add_reaction(&self, message: MessageHandle, emoji: &str) -> PlatformResult<()> {
        self.record(Call::React { message_id: message.message_id, emoji: emoji.to_string() });
        Ok(())
    }

    async fn wait_for_reaction(
        &self,
        predicate: ReactionPredicate,
    ) -> PlatformResult<ReactionEvent> {
        let mut rx = self.reactions.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Ok(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(PlatformError::Closed),
            }
        }
    }

    fn channel_guild(&self, channel_id: u64) -> Option<u64> {
        self.channels.lock().get(&channel_id).copied()
    }
}
