//! Per-guild admission state and actions.
//!
//! Each guild gets one long-lived [`Keeper`]. It holds the guild's gatekeeper configuration,
//! the two join ratelimiters and the recent-joins tracker, and performs the bounce, ban,
//! lockdown and reporting side effects through the [`Platform`].
//!
//! Joins for one guild are processed strictly in arrival order: [`Keeper::check`] queues on
//! a FIFO lane, so a join never observes a half-finished predecessor. Plain state lives
//! behind a short synchronous lock that is never held across a platform call.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::checks::{run_pipeline, Outcome};
use super::ratelimiter::{RateKey, RateLimiter};
use super::report;
use super::threshold::Threshold;
use crate::database::{ConfigStore, GatekeeperConfig};
use crate::platform::{
    Member, MessageHandle, Payload, Platform, PlatformError, ReactionEvent, ReactionPredicate,
    Reactor,
};

/// Bounce reason used when a check reports a misconfiguration.
pub const INCORRECTLY_CONFIGURED: &str =
    "Gatekeeper is incorrectly configured, so this user was prevented from joining to be safe.";

const JOINING_TOO_QUICKLY: &str = "Joining too quickly";
const USERS_JOINING_TOO_QUICKLY: &str = "Users are joining too quickly";

/// Process-wide knobs shared by every keeper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeeperSettings {
    /// Emoji a moderator reacts with to reverse a ban
    pub unban_emoji: String,
    /// Extra capacity of the recent-joins tracker on top of the join rate
    pub recent_joins_slack: usize,
}

impl Default for KeeperSettings {
    fn default() -> Self {
        Self {
            unban_emoji: "\u{1f513}".to_string(),
            recent_joins_slack: 5,
        }
    }
}

/// What happened to a joining member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Bounced,
    Banned,
    /// The member tripped the global join threshold.
    LockedDown,
    /// A check reported a misconfiguration and the member was bounced.
    Misconfigured,
}

struct KeeperState {
    config: GatekeeperConfig,
    unique_join_ratelimiter: Option<Arc<RateLimiter>>,
    join_ratelimiter: Option<Arc<RateLimiter>>,
    recent_joins: VecDeque<Member>,
}

pub struct Keeper {
    guild_id: u64,
    platform: Arc<dyn Platform>,
    store: Arc<dyn ConfigStore>,
    settings: KeeperSettings,
    state: Mutex<KeeperState>,
    lane: tokio::sync::Mutex<()>,
    /// Reversal prompts and automatic unbans. Aborted when the keeper goes away.
    tasks: Mutex<JoinSet<()>>,
}

impl Keeper {
    pub fn new(
        guild_id: u64,
        config: GatekeeperConfig,
        platform: Arc<dyn Platform>,
        store: Arc<dyn ConfigStore>,
        settings: KeeperSettings,
    ) -> Self {
        let keeper = Self {
            guild_id,
            platform,
            store,
            settings,
            state: Mutex::new(KeeperState {
                config: GatekeeperConfig::default(),
                unique_join_ratelimiter: None,
                join_ratelimiter: None,
                recent_joins: VecDeque::new(),
            }),
            lane: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(JoinSet::new()),
        };
        keeper.update_config(config);
        keeper
    }

    pub fn guild_id(&self) -> u64 {
        self.guild_id
    }

    /// Snapshot of the held configuration.
    pub fn config(&self) -> GatekeeperConfig {
        self.state.lock().config.clone()
    }

    pub fn unique_join_ratelimiter(&self) -> Option<Arc<RateLimiter>> {
        self.state.lock().unique_join_ratelimiter.clone()
    }

    pub fn join_ratelimiter(&self) -> Option<Arc<RateLimiter>> {
        self.state.lock().join_ratelimiter.clone()
    }

    pub fn recent_joins(&self) -> Vec<Member> {
        self.state.lock().recent_joins.iter().cloned().collect()
    }

    /// Replace the held configuration.
    ///
    /// A ratelimiter whose threshold did not change is kept as is, hits included. Saving
    /// the same configuration again during a flood must not reset the accounting.
    pub fn update_config(&self, config: GatekeeperConfig) {
        let mut state = self.state.lock();
        self.apply_config(&mut state, config);
    }

    /// [`Keeper::update_config`] unless the held configuration has a higher revision.
    ///
    /// Returns whether `config` was applied.
    pub fn offer_config(&self, config: GatekeeperConfig) -> bool {
        let mut state = self.state.lock();
        if config.revision < state.config.revision {
            debug!(
                "Guild {}: ignoring config revision {}, holding {}",
                self.guild_id, config.revision, state.config.revision
            );
            return false;
        }
        self.apply_config(&mut state, config);
        true
    }

    fn apply_config(&self, state: &mut KeeperState, config: GatekeeperConfig) {
        let unique = self.rebuild_limiter(
            "unique_join_ratelimiter",
            state.unique_join_ratelimiter.as_ref(),
            config.ban_threshold.as_deref(),
        );
        state.unique_join_ratelimiter = unique;

        let old = state.join_ratelimiter.take();
        let new = self.rebuild_limiter(
            "join_ratelimiter",
            old.as_ref(),
            config.auto_lockdown.threshold.as_deref(),
        );

        match (&old, &new) {
            (Some(old), Some(new)) if new.rate() < old.rate() => {
                let outside = ((old.rate() - new.rate()) as usize).min(state.recent_joins.len());
                debug!(
                    "Guild {}: dropping {} tracked joins outside the new join rate",
                    self.guild_id, outside
                );
                state.recent_joins.drain(..outside);
            }
            (_, None) => state.recent_joins.clear(),
            _ => {}
        }

        state.join_ratelimiter = new;
        state.config = config;
    }

    fn rebuild_limiter(
        &self,
        name: &str,
        current: Option<&Arc<RateLimiter>>,
        raw: Option<&str>,
    ) -> Option<Arc<RateLimiter>> {
        let threshold = match raw.map(Threshold::parse) {
            Some(Ok(threshold)) => threshold,
            Some(Err(e)) => {
                debug!("Guild {}: invalid {} ({}), disabling", self.guild_id, name, e);
                return None;
            }
            None => return None,
        };

        match current {
            Some(limiter) if limiter.threshold() == threshold => {
                debug!("Guild {}: {} not stale, keeping it", self.guild_id, name);
                Some(Arc::clone(limiter))
            }
            _ => {
                debug!("Guild {}: replacing stale {} ({})", self.guild_id, name, threshold);
                Some(Arc::new(RateLimiter::new(threshold)))
            }
        }
    }

    /// Screen a joining member and act on the result.
    pub async fn check(self: &Arc<Self>, member: &Member) -> Decision {
        self.check_at(member, Utc::now()).await
    }

    /// [`Keeper::check`] with a fixed notion of "now" for age-based checks and embeds.
    pub async fn check_at(self: &Arc<Self>, member: &Member, now: DateTime<Utc>) -> Decision {
        let _lane = self.lane.lock().await;
        debug!(
            "Guild {}: gatekeeping {} (created_at={})",
            self.guild_id, member.id, member.created_at
        );

        let (config, unique_join_ratelimiter, join_ratelimiter) = {
            let state = self.state.lock();
            (
                state.config.clone(),
                state.unique_join_ratelimiter.clone(),
                state.join_ratelimiter.clone(),
            )
        };

        if let Some(limiter) = &unique_join_ratelimiter {
            let hit = limiter.hit(RateKey::Member(member.id));
            if hit.limited {
                debug!(
                    "Guild {}: {} is joining too quickly (retry after {:?}), banning",
                    self.guild_id, member.id, hit.retry_after
                );
                self.ban_joining_too_quickly(member, &config, now).await;
                return Decision::Banned;
            }
        }

        match run_pipeline(&config.bannable_checks, member, now) {
            Some((check, Outcome::Bounce(reason) | Outcome::Ban(reason))) => {
                debug!(
                    "Guild {}: banning {}, failed bannable check {}",
                    self.guild_id,
                    member.id,
                    check.name()
                );
                self.ban(member, &reason, now).await;
                return Decision::Banned;
            }
            Some((_, Outcome::Report(text))) => {
                self.bounce_misconfigured(member, text, now).await;
                return Decision::Misconfigured;
            }
            Some((_, Outcome::Pass)) | None => {}
        }

        match run_pipeline(&config.checks, member, now) {
            Some((check, Outcome::Bounce(reason))) => {
                debug!(
                    "Guild {}: {} failed {}: {}",
                    self.guild_id,
                    member.id,
                    check.name(),
                    reason
                );
                self.bounce(member, &reason, now).await;
                return Decision::Bounced;
            }
            Some((check, Outcome::Ban(reason))) => {
                debug!("Guild {}: banning {} ({})", self.guild_id, member.id, check.name());
                self.ban(member, &reason, now).await;
                return Decision::Banned;
            }
            Some((_, Outcome::Report(text))) => {
                self.bounce_misconfigured(member, text, now).await;
                return Decision::Misconfigured;
            }
            Some((_, Outcome::Pass)) | None => {}
        }

        if let Some(limiter) = &join_ratelimiter {
            if limiter.hit(RateKey::AnyJoin).limited {
                info!("Guild {}: users are joining too quickly", self.guild_id);
                self.auto_lockdown(member, limiter.rate() as usize, now).await;
                return Decision::LockedDown;
            }

            let capacity = limiter.rate() as usize + self.settings.recent_joins_slack;
            let mut state = self.state.lock();
            while state.recent_joins.len() >= capacity {
                state.recent_joins.pop_front();
            }
            state.recent_joins.push_back(member.clone());
        }

        debug!("Guild {}: {} passed all checks", self.guild_id, member.id);
        self.announce_join(member, false, now).await;
        Decision::Allowed
    }

    /// Post the green "has joined" embed unless the guild is in quiet mode.
    pub async fn announce_join(
        &self,
        member: &Member,
        specifically_allowed: bool,
        now: DateTime<Utc>,
    ) {
        let quiet = self.state.lock().config.quiet;
        if quiet {
            return;
        }
        self.report(report::joined(member, specifically_allowed, now))
            .await;
    }

    async fn bounce_misconfigured(&self, member: &Member, text: String, now: DateTime<Utc>) {
        debug!("Guild {}: error in config: {}", self.guild_id, text);
        self.report(text).await;
        self.bounce(member, INCORRECTLY_CONFIGURED, now).await;
    }

    async fn auto_lockdown(&self, trigger: &Member, rate: usize, now: DateTime<Utc>) {
        self.bounce(trigger, USERS_JOINING_TOO_QUICKLY, now).await;

        // A member that joined more than once to trip the limiter shows up in the
        // cohort too; it has already been bounced.
        let accompanying: Vec<Member> = {
            let mut state = self.state.lock();
            let joins = std::mem::take(&mut state.recent_joins);
            let skip = joins.len().saturating_sub(rate);
            joins
                .into_iter()
                .skip(skip)
                .filter(|member| member.id != trigger.id)
                .collect()
        };

        debug!(
            "Guild {}: auto lockdown triggered by {}, {} accompanying",
            self.guild_id,
            trigger.id,
            accompanying.len()
        );

        for member in &accompanying {
            self.bounce(member, USERS_JOINING_TOO_QUICKLY, now).await;
        }

        self.lockdown().await;
    }

    /// Enable `block_all` in the stored configuration and warn the moderators.
    ///
    /// Nothing is written or announced if the stored configuration already blocks
    /// everyone.
    ///
    /// The lock carries a fresh revision, so it stays in force locally even if the save
    /// fails and older stored copies are read back later.
    async fn lockdown(&self) {
        let held = self.config();
        let mut config = match self.store.load(self.guild_id).await {
            Ok(Some(config)) => config,
            Ok(None) => held.clone(),
            Err(e) => {
                error!("Guild {}: failed to load config for lockdown: {}", self.guild_id, e);
                held.clone()
            }
        };

        if config.block_all_enabled() {
            debug!("Guild {}: already blocking all, skipping lockdown", self.guild_id);
            return;
        }
        config.set_block_all(true);
        config.advance_revision(held.revision);

        let saved = self.store.save(self.guild_id, &config).await;
        // Don't wait for the store's change notification.
        self.update_config(config);

        match saved {
            Ok(()) => {
                info!("Guild {}: automatic lockdown, block_all enabled", self.guild_id);
                self.report(
                    "Users are joining too quickly. `block_all` has automatically been enabled.",
                )
                .await;
            }
            Err(e) => {
                error!("Guild {}: failed to save lockdown config: {:#}", self.guild_id, e);
                self.report(format!(
                    "Users are joining too quickly. `block_all` has been enabled, but saving \
                     the configuration failed: `{:#}`",
                    e
                ))
                .await;
            }
        }
    }

    /// Kick a member, DMing the bounce message first if one is configured.
    pub async fn bounce(&self, member: &Member, reason: &str, now: DateTime<Utc>) {
        let (bounce_message, echo_dm_failures) = {
            let state = self.state.lock();
            (
                state.config.bounce_message.clone(),
                state.config.echo_dm_failures,
            )
        };

        if let Some(text) = bounce_message {
            if let Err(e) = self.platform.dm(member.id, &text).await {
                debug!("Guild {}: failed to DM {}: {}", self.guild_id, member.id, e);
                if echo_dm_failures {
                    self.report(format!("Failed to send bounce message to {}.", member))
                        .await;
                }
            }
        }

        match self
            .platform
            .kick(member, &format!("Gatekeeper: {}", reason))
            .await
        {
            Ok(()) => {
                self.report(report::bounced(member, reason, now)).await;
            }
            Err(e) => {
                debug!("Guild {}: failed to kick {}: {}", self.guild_id, member.id, e);
                self.report(format!("Failed to kick {}: `{}`", member, e))
                    .await;
            }
        }
    }

    /// Ban a member and offer moderators a reaction to reverse it.
    ///
    /// Returns whether the ban went through.
    pub async fn ban(self: &Arc<Self>, member: &Member, reason: &str, now: DateTime<Utc>) -> bool {
        if let Err(e) = self
            .platform
            .ban(member, 0, &format!("Gatekeeper: {}", reason))
            .await
        {
            debug!("Guild {}: failed to ban {}: {}", self.guild_id, member.id, e);
            self.report(format!("Failed to ban {}: `{}`", member, e))
                .await;
            return false;
        }

        if let Some(message) = self.report(report::banned(member, reason, now)).await {
            self.spawn_reversal_prompt(message, member.clone());
        }
        true
    }

    async fn ban_joining_too_quickly(
        self: &Arc<Self>,
        member: &Member,
        config: &GatekeeperConfig,
        now: DateTime<Utc>,
    ) {
        let banned = self.ban(member, JOINING_TOO_QUICKLY, now).await;
        if banned && config.ban_threshold_auto_unban {
            self.spawn_auto_unban(member.clone(), config.ban_threshold_auto_unban_after);
        }
    }

    fn spawn_auto_unban(self: &Arc<Self>, member: Member, after_secs: u64) {
        let keeper = Arc::downgrade(self);
        self.spawn(async move {
            tokio::time::sleep(Duration::from_secs(after_secs)).await;
            if let Some(keeper) = keeper.upgrade() {
                keeper.auto_unban(&member, after_secs).await;
            }
        });
    }

    async fn auto_unban(&self, member: &Member, after_secs: u64) {
        let reason = format!(
            "Gatekeeper: Automatically unbanned after {} second(s) (was joining too quickly)",
            after_secs
        );

        match self.platform.unban(self.guild_id, member.id, &reason).await {
            Ok(()) => {
                info!("Guild {}: automatically unbanned {}", self.guild_id, member.id);
                self.report(format!(
                    "Automatically unbanned {} after {} second(s) for joining too quickly.",
                    member, after_secs
                ))
                .await;
            }
            Err(PlatformError::NotFound(_)) => {
                debug!("Guild {}: {} was already unbanned", self.guild_id, member.id);
            }
            Err(e) => {
                warn!("Guild {}: failed to unban {}: {}", self.guild_id, member.id, e);
                self.report(format!(
                    "Failed to automatically unban {} after {} second(s) for joining too quickly: `{}`",
                    member, after_secs, e
                ))
                .await;
            }
        }
    }

    fn spawn_reversal_prompt(self: &Arc<Self>, message: MessageHandle, banned: Member) {
        let keeper: Weak<Self> = Arc::downgrade(self);
        let platform = Arc::clone(&self.platform);
        let emoji = self.settings.unban_emoji.clone();
        let guild_id = self.guild_id;

        self.spawn(async move {
            if let Err(e) = platform.add_reaction(message, &emoji).await {
                warn!("Guild {}: failed to add unban reaction: {}", guild_id, e);
            }

            let predicate = reversal_predicate(guild_id, message.message_id, emoji);
            let event = match platform.wait_for_reaction(predicate).await {
                Ok(event) => event,
                Err(e) => {
                    debug!("Guild {}: stopped waiting for unban reaction: {}", guild_id, e);
                    return;
                }
            };

            let (Some(keeper), Some(moderator)) = (keeper.upgrade(), event.reactor) else {
                return;
            };
            keeper.reverse_ban(&banned, &moderator).await;
        });
    }

    async fn reverse_ban(&self, banned: &Member, moderator: &Reactor) {
        let reason = format!("Gatekeeper: Ban was reversed by {}", moderator.tag);

        match self.platform.unban(self.guild_id, banned.id, &reason).await {
            Ok(()) => {
                info!(
                    "Guild {}: ban of {} reversed by {}",
                    self.guild_id, banned.id, moderator.id
                );
                self.report(format!(
                    "The ban of {} was reversed by {}.",
                    banned, moderator
                ))
                .await;
            }
            Err(e) => {
                self.report(format!("Cannot reverse the ban of {}: `{}`", banned, e))
                    .await;
            }
        }
    }

    /// Post to the broadcast channel.
    ///
    /// Skipped when the channel is unset, unknown, or owned by another guild. Send
    /// failures are logged and swallowed.
    pub async fn report(&self, payload: impl Into<Payload>) -> Option<MessageHandle> {
        let channel = self.state.lock().config.broadcast_channel;
        let Some(channel_id) = channel else {
            warn!("Guild {}: no broadcast channel, cannot report", self.guild_id);
            return None;
        };

        match self.platform.channel_guild(channel_id) {
            Some(guild_id) if guild_id == self.guild_id => {}
            Some(_) => {
                warn!(
                    "Guild {}: broadcast channel {} is somewhere else, ignoring",
                    self.guild_id, channel_id
                );
                return None;
            }
            None => {
                warn!(
                    "Guild {}: broadcast channel {} is not a known text channel",
                    self.guild_id, channel_id
                );
                return None;
            }
        }

        match self.platform.send(channel_id, payload.into()).await {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(
                    "Guild {}: unable to send message to {}: {}",
                    self.guild_id, channel_id, e
                );
                None
            }
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Background tasks still pending.
    pub fn pending_tasks(&self) -> usize {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Cancel pending reversal prompts and automatic unbans.
    pub fn shutdown(&self) {
        self.tasks.lock().abort_all();
    }
}

/// Matches the unban emoji on `message_id`, added by a human moderator of `guild_id`
/// who can ban members.
fn reversal_predicate(guild_id: u64, message_id: u64, emoji: String) -> ReactionPredicate {
    Box::new(move |event: &ReactionEvent| {
        event.message_id == message_id
            && event.guild_id == Some(guild_id)
            && event.emoji == emoji
            && event
                .reactor
                .as_ref()
                .is_some_and(|reactor| !reactor.bot && reactor.can_ban_members)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatekeeper::testing::*;
    use crate::platform::mock::{Call, Op};
    use crate::platform::EmbedColour;
    use serde_json::json;

    #[tokio::test]
    async fn test_minimum_creation_time_bounce() {
        let h = harness(config(json!({
            "checks": { "MinimumCreationTime": { "enabled": true, "value": 86400 } }
        })));
        let now = Utc::now();
        let mut newcomer = member(10);
        newcomer.created_at = now - chrono::Duration::seconds(3600);

        let decision = h.keeper.check_at(&newcomer, now).await;

        assert_eq!(decision, Decision::Bounced);
        assert_eq!(
            h.platform.kicks(),
            vec![(10, "Gatekeeper: Failed minimum creation time check (3600 < 86400)".to_string())]
        );
        let embeds = h.platform.embeds();
        assert_eq!(embeds.len(), 1);
        assert_eq!(embeds[0].colour, EmbedColour::Red);
    }

    #[tokio::test]
    async fn test_misconfigured_regex_reports_then_bounces() {
        let h = harness(config(json!({
            "checks": { "UsernameRegex": { "enabled": true, "pattern": "[" } }
        })));

        let decision = h.keeper.check(&member(10)).await;

        assert_eq!(decision, Decision::Misconfigured);
        let texts = h.platform.texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].starts_with('\u{274c}'));
        assert!(texts[0].contains("was invalid"));

        let kicks = h.platform.kicks();
        assert_eq!(kicks.len(), 1);
        assert!(kicks[0].1.contains("incorrectly configured"));
        assert!(h.platform.bans().is_empty());

        // The report goes out before the kick.
        let calls = h.platform.calls();
        let report = calls.iter().position(|c| matches!(c, Call::Send { .. }));
        let kick = calls.iter().position(|c| matches!(c, Call::Kick { .. }));
        assert!(report < kick);
    }

    #[tokio::test]
    async fn test_report_in_bannable_checks_never_bans() {
        let h = harness(config(json!({
            "bannable_checks": { "MinimumCreationTime": { "enabled": true, "value": "soon" } }
        })));

        assert_eq!(h.keeper.check(&member(10)).await, Decision::Misconfigured);
        assert!(h.platform.bans().is_empty());
        assert_eq!(h.platform.kicks().len(), 1);
        assert_eq!(h.platform.texts().len(), 1);
    }

    #[tokio::test]
    async fn test_bannable_bounce_becomes_ban() {
        let h = harness(config(json!({
            "bannable_checks": { "BlockBots": true }
        })));
        let mut bot = member(10);
        bot.bot = true;

        assert_eq!(h.keeper.check(&bot).await, Decision::Banned);
        assert!(h.platform.kicks().is_empty());
        assert_eq!(h.platform.bans(), vec![(10, "Gatekeeper: Is a bot".to_string())]);

        let embeds = h.platform.embeds();
        assert_eq!(embeds[0].colour, EmbedColour::Purple);
        assert_eq!(embeds[0].fields[0].1, "Is a bot");
    }

    #[tokio::test]
    async fn test_bannable_checks_run_before_regular_checks() {
        let h = harness(config(json!({
            "checks": { "BlockAll": true },
            "bannable_checks": { "BlockBots": true }
        })));
        let mut bot = member(10);
        bot.bot = true;

        assert_eq!(h.keeper.check(&bot).await, Decision::Banned);
        assert!(h.platform.kicks().is_empty());
    }

    #[tokio::test]
    async fn test_passing_member_is_announced() {
        let h = harness(config(json!({ "checks": { "BlockBots": true } })));

        assert_eq!(h.keeper.check(&member(10)).await, Decision::Allowed);
        let embeds = h.platform.embeds();
        assert_eq!(embeds.len(), 1);
        assert_eq!(embeds[0].colour, EmbedColour::Green);
        assert!(h.platform.kicks().is_empty());
    }

    #[tokio::test]
    async fn test_quiet_mode_skips_join_embed() {
        let h = harness(config(json!({ "quiet": true })));

        assert_eq!(h.keeper.check(&member(10)).await, Decision::Allowed);
        assert!(h.platform.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_member_joining_too_quickly_is_banned() {
        let h = harness(config(json!({ "ban_threshold": "2/60" })));
        let spammer = member(10);

        assert_eq!(h.keeper.check(&spammer).await, Decision::Allowed);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(h.keeper.check(&spammer).await, Decision::Allowed);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(h.keeper.check(&spammer).await, Decision::Banned);

        assert_eq!(
            h.platform.bans(),
            vec![(10, "Gatekeeper: Joining too quickly".to_string())]
        );
        let colours: Vec<_> = h.platform.embeds().iter().map(|e| e.colour).collect();
        assert_eq!(
            colours,
            vec![EmbedColour::Green, EmbedColour::Green, EmbedColour::Purple]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_spam_ban_is_lifted_automatically() {
        let h = harness(config(json!({
            "ban_threshold": "1/60",
            "ban_threshold_auto_unban_after": 30
        })));
        let spammer = member(10);

        h.keeper.check(&spammer).await;
        assert_eq!(h.keeper.check(&spammer).await, Decision::Banned);
        assert!(h.platform.unbans().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        wait_until(|| !h.platform.unbans().is_empty()).await;

        assert_eq!(
            h.platform.unbans(),
            vec![(
                10,
                "Gatekeeper: Automatically unbanned after 30 second(s) (was joining too quickly)"
                    .to_string()
            )]
        );
        wait_until(|| {
            h.platform
                .texts()
                .iter()
                .any(|t| t.starts_with("Automatically unbanned"))
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_unban_skips_lifted_ban() {
        let h = harness(config(json!({
            "ban_threshold": "1/60",
            "ban_threshold_auto_unban_after": 30
        })));
        let spammer = member(10);

        h.keeper.check(&spammer).await;
        h.keeper.check(&spammer).await;
        h.platform.unban(GUILD, 10, "manual").await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        wait_until(|| h.platform.unbans().len() == 2).await;
        wait_until(|| h.keeper.pending_tasks() == 1).await;

        // Only the reversal prompt is left, and nothing was reported about the unban.
        assert!(h.platform.texts().iter().all(|t| !t.contains("unban")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_unban_disabled() {
        let h = harness(config(json!({
            "ban_threshold": "1/60",
            "ban_threshold_auto_unban": false
        })));
        let spammer = member(10);

        h.keeper.check(&spammer).await;
        h.keeper.check(&spammer).await;
        tokio::time::advance(Duration::from_secs(600)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(h.platform.unbans().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_burst_triggers_lockdown() {
        let h = harness(config(json!({
            "auto_lockdown": { "threshold": "5/10" }
        })));
        let limiter = h.keeper.join_ratelimiter().unwrap();

        for id in 1..=5 {
            assert_eq!(h.keeper.check(&member(id)).await, Decision::Allowed);
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        assert_eq!(h.keeper.recent_joins().len(), 5);

        assert_eq!(h.keeper.check(&member(6)).await, Decision::LockedDown);

        let kicked: Vec<u64> = h.platform.kicks().into_iter().map(|(id, _)| id).collect();
        assert_eq!(kicked, vec![6, 1, 2, 3, 4, 5]);
        assert!(h
            .platform
            .kicks()
            .iter()
            .all(|(_, reason)| reason == "Gatekeeper: Users are joining too quickly"));

        assert!(h.keeper.recent_joins().is_empty());
        assert!(h.keeper.config().block_all_enabled());
        assert!(h.store.get(GUILD).unwrap().block_all_enabled());

        let lockdown_notices = h
            .platform
            .texts()
            .into_iter()
            .filter(|t| t == "Users are joining too quickly. `block_all` has automatically been enabled.")
            .count();
        assert_eq!(lockdown_notices, 1);

        // Applying the lockdown config kept the join accounting.
        assert!(Arc::ptr_eq(&limiter, &h.keeper.join_ratelimiter().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lockdown_cohort_is_limited_to_rate() {
        let h = harness(config(json!({
            "auto_lockdown": { "threshold": "2/60" }
        })));

        // Three allowed joins spread past the window, then a burst.
        h.keeper.check(&member(1)).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        h.keeper.check(&member(2)).await;
        h.keeper.check(&member(3)).await;
        assert_eq!(h.keeper.check(&member(4)).await, Decision::LockedDown);

        let kicked: Vec<u64> = h.platform.kicks().into_iter().map(|(id, _)| id).collect();
        assert_eq!(kicked, vec![4, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_in_cohort_is_bounced_once() {
        let h = harness(config(json!({
            "auto_lockdown": { "threshold": "2/60" }
        })));

        h.keeper.check(&member(1)).await;
        h.keeper.check(&member(2)).await;
        assert_eq!(h.keeper.check(&member(2)).await, Decision::LockedDown);

        let kicked: Vec<u64> = h.platform.kicks().into_iter().map(|(id, _)| id).collect();
        assert_eq!(kicked, vec![2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lockdown_skipped_when_already_blocking_all() {
        let cfg = config(json!({ "auto_lockdown": { "threshold": "1/60" } }));
        let h = harness(cfg.clone());
        // The stored config already blocks everyone; the keeper hasn't seen it yet.
        let mut stored = cfg;
        stored.set_block_all(true);
        h.store.put(GUILD, stored.clone());

        h.keeper.check(&member(1)).await;
        assert_eq!(h.keeper.check(&member(2)).await, Decision::LockedDown);

        let kicked: Vec<u64> = h.platform.kicks().into_iter().map(|(id, _)| id).collect();
        assert_eq!(kicked, vec![2, 1]);
        assert!(h.keeper.recent_joins().is_empty());
        assert!(h
            .platform
            .texts()
            .iter()
            .all(|t| !t.contains("`block_all` has automatically been enabled")));
        assert_eq!(h.store.get(GUILD), Some(stored));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_config_keeps_limiters() {
        let cfg = config(json!({
            "ban_threshold": "3/60",
            "auto_lockdown": { "threshold": "5/10" }
        }));
        let h = harness(cfg.clone());

        h.keeper.check(&member(1)).await;
        h.keeper.check(&member(1)).await;

        let unique = h.keeper.unique_join_ratelimiter().unwrap();
        let join = h.keeper.join_ratelimiter().unwrap();

        h.keeper.update_config(cfg.clone());
        h.keeper.update_config(cfg);

        assert!(Arc::ptr_eq(&unique, &h.keeper.unique_join_ratelimiter().unwrap()));
        assert!(Arc::ptr_eq(&join, &h.keeper.join_ratelimiter().unwrap()));
        assert_eq!(unique.hits_in_window(RateKey::Member(1)), 2);
        assert_eq!(join.hits_in_window(RateKey::AnyJoin), 2);
        assert_eq!(h.keeper.recent_joins().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_threshold_replaces_limiter() {
        let h = harness(config(json!({ "auto_lockdown": { "threshold": "5/10" } })));
        for id in 1..=5 {
            h.keeper.check(&member(id)).await;
        }
        let before = h.keeper.join_ratelimiter().unwrap();

        h.keeper
            .update_config(config(json!({ "auto_lockdown": { "threshold": "3/10" } })));

        let after = h.keeper.join_ratelimiter().unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.rate(), 3);
        assert_eq!(after.hits_in_window(RateKey::AnyJoin), 0);

        let tracked: Vec<u64> = h.keeper.recent_joins().iter().map(|m| m.id).collect();
        assert_eq!(tracked, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_invalid_threshold_disables_limiter() {
        let h = harness(config(json!({
            "ban_threshold": "lots",
            "auto_lockdown": { "threshold": "5/" }
        })));

        assert!(h.keeper.unique_join_ratelimiter().is_none());
        assert!(h.keeper.join_ratelimiter().is_none());
        assert_eq!(h.keeper.check(&member(1)).await, Decision::Allowed);
        assert_eq!(h.keeper.check(&member(1)).await, Decision::Allowed);
    }

    #[tokio::test]
    async fn test_unrepresentable_period_disables_limiter() {
        let h = harness(config(json!({
            "ban_threshold": "1/0.0000000001",
            "auto_lockdown": { "threshold": "5/100000000000000000000" }
        })));

        assert!(h.keeper.unique_join_ratelimiter().is_none());
        assert!(h.keeper.join_ratelimiter().is_none());
        assert_eq!(h.keeper.check(&member(1)).await, Decision::Allowed);
    }

    #[tokio::test]
    async fn test_older_revision_is_not_applied() {
        let mut newer = config(json!({}));
        newer.set_block_all(true);
        newer.revision = 3;
        let h = harness(newer);

        let mut older = config(json!({}));
        older.revision = 2;
        assert!(!h.keeper.offer_config(older));
        assert!(h.keeper.config().block_all_enabled());

        let mut edited = config(json!({ "quiet": true }));
        edited.revision = 3;
        assert!(h.keeper.offer_config(edited));
        assert!(h.keeper.config().quiet);
    }

    #[tokio::test]
    async fn test_lockdown_survives_failed_save() {
        let h = harness(config(json!({ "auto_lockdown": { "threshold": "1/60" } })));
        h.store.fail_saves(true);

        h.keeper.check(&member(1)).await;
        assert_eq!(h.keeper.check(&member(2)).await, Decision::LockedDown);

        let held = h.keeper.config();
        assert!(held.block_all_enabled());
        assert_eq!(held.revision, 1);
        assert!(!h.store.get(GUILD).unwrap().block_all_enabled());

        // Reading the unlocked stored copy back must not lift the lock.
        assert!(!h.keeper.offer_config(h.store.get(GUILD).unwrap()));
        assert!(h.keeper.config().block_all_enabled());
        assert_eq!(h.keeper.check(&member(3)).await, Decision::Bounced);

        let texts = h.platform.texts();
        assert!(texts.iter().any(|t| t.starts_with(
            "Users are joining too quickly. `block_all` has been enabled, but saving"
        ) && t.contains("store unavailable")));
        assert!(texts
            .iter()
            .all(|t| !t.contains("`block_all` has automatically been enabled")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_joins_are_bounded() {
        let h = harness(config(json!({ "auto_lockdown": { "threshold": "3/1" } })));
        let slack = KeeperSettings::default().recent_joins_slack;

        for id in 0..20 {
            assert_eq!(h.keeper.check(&member(id)).await, Decision::Allowed);
            tokio::time::advance(Duration::from_secs(2)).await;
        }

        let tracked: Vec<u64> = h.keeper.recent_joins().iter().map(|m| m.id).collect();
        assert_eq!(tracked.len(), 3 + slack);
        assert_eq!(tracked.last(), Some(&19));
    }

    #[tokio::test]
    async fn test_foreign_broadcast_channel_is_never_used() {
        let mut cfg = config(json!({ "checks": { "BlockAll": true } }));
        cfg.broadcast_channel = Some(FOREIGN_CHANNEL);
        let h = harness(cfg);

        assert_eq!(h.keeper.check(&member(1)).await, Decision::Bounced);
        assert_eq!(h.platform.kicks().len(), 1);
        assert!(h.platform.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_broadcast_channel_is_skipped() {
        let mut cfg = config(json!({ "bannable_checks": { "BlockAll": true } }));
        cfg.broadcast_channel = Some(404);
        let h = harness(cfg);

        assert_eq!(h.keeper.check(&member(1)).await, Decision::Banned);
        assert_eq!(h.platform.bans().len(), 1);
        assert!(h.platform.sent().is_empty());
        // No report message, so no reversal prompt either.
        assert_eq!(h.keeper.pending_tasks(), 0);
    }

    #[tokio::test]
    async fn test_bounce_message_and_dm_failure_echo() {
        let mut cfg = config(json!({ "checks": { "BlockAll": true } }));
        cfg.bounce_message = Some("Try again later.".into());
        cfg.echo_dm_failures = true;
        let h = harness(cfg);
        h.platform.fail(Op::Dm, PlatformError::Forbidden("Cannot send messages to this user".into()));

        h.keeper.check(&member(1)).await;

        assert!(h
            .platform
            .calls()
            .contains(&Call::Dm { user_id: 1, text: "Try again later.".into() }));
        assert_eq!(h.platform.kicks().len(), 1);
        assert_eq!(
            h.platform.texts(),
            vec![format!("Failed to send bounce message to {}.", member(1))]
        );
    }

    #[tokio::test]
    async fn test_kick_failure_is_reported() {
        let h = harness(config(json!({ "checks": { "BlockAll": true } })));
        h.platform.fail(Op::Kick, PlatformError::Forbidden("Missing Permissions".into()));

        assert_eq!(h.keeper.check(&member(1)).await, Decision::Bounced);
        assert_eq!(
            h.platform.texts(),
            vec![format!(
                "Failed to kick {}: `403 Forbidden: Missing Permissions`",
                member(1)
            )]
        );
        assert!(h.platform.embeds().is_empty());
    }

    #[tokio::test]
    async fn test_ban_failure_is_reported_without_prompt() {
        let h = harness(config(json!({ "bannable_checks": { "BlockAll": true } })));
        h.platform.fail(Op::Ban, PlatformError::Forbidden("Missing Permissions".into()));

        h.keeper.check(&member(1)).await;

        assert!(h.platform.texts()[0].starts_with("Failed to ban "));
        assert!(h.platform.embeds().is_empty());
        assert_eq!(h.keeper.pending_tasks(), 0);
    }

    #[tokio::test]
    async fn test_ban_reversal_by_moderator() {
        let h = harness(config(json!({ "bannable_checks": { "BlockAll": true } })));
        let banned = member(10);

        assert_eq!(h.keeper.check(&banned).await, Decision::Banned);
        wait_until(|| !h.platform.reactions_added().is_empty()).await;
        let (message_id, emoji) = h.platform.reactions_added()[0].clone();
        assert_eq!(emoji, "\u{1f513}");

        // Neither a bot nor a member without ban permission may reverse it.
        h.platform
            .react(reaction(message_id, &emoji, moderator(20, true, true)))
            .await;
        h.platform
            .react(reaction(message_id, &emoji, moderator(21, false, false)))
            .await;
        h.platform
            .react(reaction(message_id, "\u{1f44d}", moderator(22, false, true)))
            .await;
        h.platform
            .react(reaction(message_id, &emoji, moderator(23, false, true)))
            .await;

        wait_until(|| h.keeper.pending_tasks() == 0).await;
        assert_eq!(
            h.platform.unbans(),
            vec![(10, "Gatekeeper: Ban was reversed by mod23".to_string())]
        );
        assert_eq!(
            h.platform.texts(),
            vec![format!(
                "The ban of {} was reversed by {}.",
                banned,
                moderator(23, false, true)
            )]
        );
        assert_eq!(h.platform.reaction_waiters(), 0);
    }

    #[tokio::test]
    async fn test_ban_reversal_failure_is_reported() {
        let h = harness(config(json!({ "bannable_checks": { "BlockAll": true } })));
        h.keeper.check(&member(10)).await;
        h.platform.fail(Op::Unban, PlatformError::Forbidden("Missing Permissions".into()));

        wait_until(|| !h.platform.reactions_added().is_empty()).await;
        let (message_id, emoji) = h.platform.reactions_added()[0].clone();
        h.platform
            .react(reaction(message_id, &emoji, moderator(23, false, true)))
            .await;

        wait_until(|| h.keeper.pending_tasks() == 0).await;
        assert_eq!(
            h.platform.texts(),
            vec![format!(
                "Cannot reverse the ban of {}: `403 Forbidden: Missing Permissions`",
                member(10)
            )]
        );
    }

    #[tokio::test]
    async fn test_shutdown_cancels_reversal_prompt() {
        let h = harness(config(json!({ "bannable_checks": { "BlockAll": true } })));
        h.keeper.check(&member(10)).await;
        wait_until(|| h.platform.reaction_waiters() == 1).await;

        h.keeper.shutdown();
        wait_until(|| h.platform.reaction_waiters() == 0).await;
        assert_eq!(h.keeper.pending_tasks(), 0);
    }
}
