//! The check catalog.
//!
//! Checks are pure classifiers over a joining member. The catalog is closed: every check
//! is a variant of [`Check`], and [`Check::ALL`] is the order pipelines run them in.

use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use serde_json::Value;

use crate::database::{CheckMap, CheckOptions};
use crate::platform::Member;

/// Result of running a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    /// Kick the member.
    Bounce(String),
    /// Ban the member.
    Ban(String),
    /// The check is misconfigured; the text goes to the broadcast channel.
    Report(String),
}

impl Outcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Check {
    BlockDefaultAvatar,
    BlockBots,
    MinimumCreationTime,
    BlockAll,
    UsernameRegex,
}

impl Check {
    /// Canonical evaluation order.
    pub const ALL: [Check; 5] = [
        Check::BlockDefaultAvatar,
        Check::BlockBots,
        Check::MinimumCreationTime,
        Check::BlockAll,
        Check::UsernameRegex,
    ];

    /// Name used in configuration and reports.
    pub fn name(self) -> &'static str {
        match self {
            Self::BlockDefaultAvatar => "BlockDefaultAvatar",
            Self::BlockBots => "BlockBots",
            Self::MinimumCreationTime => "MinimumCreationTime",
            Self::BlockAll => "BlockAll",
            Self::UsernameRegex => "UsernameRegex",
        }
    }

    /// snake_case spelling older configs (and auto-lockdown) use.
    pub fn alias(self) -> &'static str {
        match self {
            Self::BlockDefaultAvatar => "block_default_avatar",
            Self::BlockBots => "block_bots",
            Self::MinimumCreationTime => "minimum_creation_time",
            Self::BlockAll => "block_all",
            Self::UsernameRegex => "username_regex",
        }
    }

    /// Look up a check by either of its names.
    #[allow(dead_code)]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|check| check.name() == name || check.alias() == name)
    }

    /// This check's entry in `checks`; the canonical name wins over the alias.
    pub fn options_in(self, checks: &CheckMap) -> Option<&CheckOptions> {
        checks.get(self.name()).or_else(|| checks.get(self.alias()))
    }

    pub fn run(self, member: &Member, options: &CheckOptions) -> Outcome {
        self.run_at(member, options, Utc::now())
    }

    /// Run against a fixed notion of "now".
    pub fn run_at(self, member: &Member, options: &CheckOptions, now: DateTime<Utc>) -> Outcome {
        match self {
            Self::BlockDefaultAvatar => {
                if member.has_default_avatar() {
                    Outcome::Bounce("Has no avatar".into())
                } else {
                    Outcome::Pass
                }
            }
            Self::BlockBots => {
                if member.bot {
                    Outcome::Bounce("Is a bot".into())
                } else {
                    Outcome::Pass
                }
            }
            Self::MinimumCreationTime => minimum_creation_time(self, member, options, now),
            Self::BlockAll => Outcome::Bounce("Blocking all users".into()),
            Self::UsernameRegex => username_regex(self, member, options),
        }
    }

    /// Run, turning a panic inside the check into a report.
    pub fn evaluate(self, member: &Member, options: &CheckOptions, now: DateTime<Utc>) -> Outcome {
        match panic::catch_unwind(AssertUnwindSafe(|| self.run_at(member, options, now))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown error".to_string());
                Outcome::Report(format!(
                    "\u{274c} `{}` failed unexpectedly: `{}`",
                    self.name(),
                    message
                ))
            }
        }
    }
}

fn missing_option(check: Check, option: &str) -> Outcome {
    Outcome::Report(format!(
        "\u{274c} `{}` is missing the `{}` option.",
        check.name(),
        option
    ))
}

fn minimum_creation_time(
    check: Check,
    member: &Member,
    options: &CheckOptions,
    now: DateTime<Utc>,
) -> Outcome {
    let Some(raw) = options.get(&["value", "minimum_age"]) else {
        return missing_option(check, "value");
    };

    let Some(minimum) = as_seconds(raw) else {
        return Outcome::Report(format!(
            "\u{274c} `{}` value `{}` was invalid: expected a whole number of seconds.",
            check.name(),
            raw
        ));
    };

    let age = (now - member.created_at).num_seconds();
    if age < minimum {
        Outcome::Bounce(format!(
            "Failed minimum creation time check ({} < {})",
            age, minimum
        ))
    } else {
        Outcome::Pass
    }
}

/// Non-negative integer seconds, given as a number or a numeric string.
fn as_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|&seconds| seconds >= 0)
}

fn username_regex(check: Check, member: &Member, options: &CheckOptions) -> Outcome {
    let Some(raw) = options.get(&["pattern", "regex"]) else {
        return missing_option(check, "pattern");
    };

    let Some(pattern) = raw.as_str() else {
        return Outcome::Report(format!(
            "\u{274c} `{}` pattern `{}` was invalid: expected text.",
            check.name(),
            raw
        ));
    };

    let case_sensitive = options
        .get(&["case_sensitive"])
        .and_then(Value::as_bool)
        .unwrap_or(true);

    match RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .build()
    {
        Ok(regex) if regex.is_match(&member.username) => {
            Outcome::Bounce("Username matched regex".into())
        }
        Ok(_) => Outcome::Pass,
        Err(e) => Outcome::Report(format!(
            "\u{274c} `{}` pattern `{}` was invalid: `{}`",
            check.name(),
            pattern,
            e.to_string().lines().last().unwrap_or_default()
        )),
    }
}

/// Run every enabled check in `checks`, stopping at the first one that doesn't pass.
pub fn run_pipeline(
    checks: &CheckMap,
    member: &Member,
    now: DateTime<Utc>,
) -> Option<(Check, Outcome)> {
    Check::ALL.into_iter().find_map(|check| {
        let options = check.options_in(checks)?;
        if !options.enabled {
            return None;
        }
        let outcome = check.evaluate(member, options, now);
        (!outcome.is_pass()).then_some((check, outcome))
    })
}
