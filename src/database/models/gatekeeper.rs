//! Gatekeeper configuration model.
//!
//! This is the `gatekeeper` key of a guild's configuration document. Everything has a
//! default so partially written documents still load.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::platform::Member;

/// Key auto-lockdown writes into `checks`.
pub const BLOCK_ALL_KEY: &str = "block_all";

/// Check name -> options.
pub type CheckMap = BTreeMap<String, CheckOptions>;

/// Gatekeeper configuration for one guild.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatekeeperConfig {
    /// Whether joins are screened at all
    #[serde(default)]
    pub enabled: bool,

    /// Channel that receives decision reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_channel: Option<u64>,

    /// Direct message sent to members right before they are bounced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounce_message: Option<String>,

    /// Report failed bounce DMs to the broadcast channel
    #[serde(default)]
    pub echo_dm_failures: bool,

    /// Don't announce members that pass every check
    #[serde(default)]
    pub quiet: bool,

    /// Per-member join threshold, e.g. `"2/60"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ban_threshold: Option<String>,

    /// Lift "joining too quickly" bans automatically
    #[serde(default = "default_auto_unban")]
    pub ban_threshold_auto_unban: bool,

    /// Seconds before a "joining too quickly" ban is lifted
    #[serde(default = "default_auto_unban_after")]
    pub ban_threshold_auto_unban_after: u64,

    /// Global join threshold
    #[serde(default)]
    pub auto_lockdown: AutoLockdownConfig,

    /// Checks whose failure bounces
    #[serde(default)]
    pub checks: CheckMap,

    /// Checks whose failure bans
    #[serde(default)]
    pub bannable_checks: CheckMap,

    /// Users that skip every check
    #[serde(default)]
    pub allowed_users: Vec<AllowedUser>,

    /// Bumped by every write Gatekeeper makes. A lower revision never replaces a higher one.
    #[serde(default)]
    pub revision: u64,
}

fn default_auto_unban() -> bool {
    true
}

fn default_auto_unban_after() -> u64 {
    300 // 5 minutes
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broadcast_channel: None,
            bounce_message: None,
            echo_dm_failures: false,
            quiet: false,
            ban_threshold: None,
            ban_threshold_auto_unban: true,
            ban_threshold_auto_unban_after: 300,
            auto_lockdown: AutoLockdownConfig::default(),
            checks: CheckMap::new(),
            bannable_checks: CheckMap::new(),
            allowed_users: Vec::new(),
            revision: 0,
        }
    }
}

impl GatekeeperConfig {
    /// Whether `block_all` is switched on. `BlockAll` wins over `block_all`.
    pub fn block_all_enabled(&self) -> bool {
        self.checks
            .get("BlockAll")
            .or_else(|| self.checks.get(BLOCK_ALL_KEY))
            .is_some_and(|options| options.enabled)
    }

    /// Switch `block_all` on or off.
    pub fn set_block_all(&mut self, enabled: bool) {
        if let Some(options) = self.checks.get_mut("BlockAll") {
            options.enabled = enabled;
        }
        self.checks
            .insert(BLOCK_ALL_KEY.to_string(), CheckOptions::enabled(enabled));
    }

    /// Move past both the stored revision and `seen`, the newest one applied locally.
    pub fn advance_revision(&mut self, seen: u64) {
        self.revision = self.revision.max(seen) + 1;
    }

    /// Whether a member bypasses screening.
    pub fn is_allowed(&self, member: &Member) -> bool {
        self.allowed_users.iter().any(|allowed| allowed.matches(member))
    }
}

/// Auto-lockdown settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AutoLockdownConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<String>,
}

/// Options for a single check.
///
/// Legacy configs store a bare boolean; it is normalised into `{enabled: <bool>}` when
/// the document is read.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(from = "RawCheckOptions")]
pub struct CheckOptions {
    pub enabled: bool,

    /// Check-specific options
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl CheckOptions {
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled,
            options: Map::new(),
        }
    }

    /// Add a check-specific option (builder pattern).
    #[must_use]
    #[allow(dead_code)]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    /// First present option among `keys`.
    pub fn get(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter().find_map(|key| self.options.get(*key))
    }
}

/// Shapes a check entry may take on disk.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawCheckOptions {
    Legacy(bool),
    Mapping(Map<String, Value>),
    Other(Value),
}

impl From<RawCheckOptions> for CheckOptions {
    fn from(raw: RawCheckOptions) -> Self {
        match raw {
            RawCheckOptions::Legacy(enabled) => Self::enabled(enabled),
            RawCheckOptions::Mapping(mut options) => {
                let enabled = options
                    .remove("enabled")
                    .and_then(|value| value.as_bool())
                    .unwrap_or(false);
                Self { enabled, options }
            }
            RawCheckOptions::Other(_) => Self::enabled(false),
        }
    }
}

/// An allow-list entry: a user id or a display tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum AllowedUser {
    Id(u64),
    Tag(String),
}

impl AllowedUser {
    /// Parse operator input: all digits is an id, anything else a tag.
    #[allow(dead_code)]
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        match input.parse::<u64>() {
            Ok(id) => Self::Id(id),
            Err(_) => Self::Tag(input.to_string()),
        }
    }

    pub fn matches(&self, member: &Member) -> bool {
        match self {
            Self::Id(id) => *id == member.id,
            Self::Tag(tag) => *tag == member.tag,
        }
    }
}

impl std::fmt::Display for AllowedUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{}", id),
            Self::Tag(tag) => write!(f, "{}", tag),
        }
    }
}
