//! Broadcast embeds for admission decisions.

use chrono::{DateTime, Utc};

use crate::platform::{Embed, EmbedColour, Member};
use crate::utils::{format_timestamp, human_delta};

/// Embed describing a bounce (red) or ban (purple).
pub fn decision_embed(
    member: &Member,
    colour: EmbedColour,
    verb: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Embed {
    Embed {
        colour,
        title: format!("{} {}", verb, member),
        description: None,
        thumbnail: Some(member.avatar_url.clone()),
        fields: vec![
            ("Reason".to_string(), reason.to_string()),
            account_creation(member, now),
        ],
        timestamp: now,
    }
}

pub fn bounced(member: &Member, reason: &str, now: DateTime<Utc>) -> Embed {
    decision_embed(member, EmbedColour::Red, "Bounced", reason, now)
}

pub fn banned(member: &Member, reason: &str, now: DateTime<Utc>) -> Embed {
    decision_embed(member, EmbedColour::Purple, "Banned", reason, now)
}

/// Green embed for a member that got in.
pub fn joined(member: &Member, specifically_allowed: bool, now: DateTime<Utc>) -> Embed {
    let description = if specifically_allowed {
        "This user has been specifically allowed into this server."
    } else {
        "This user has passed all Gatekeeper checks."
    };

    Embed {
        colour: EmbedColour::Green,
        title: format!("{} has joined", member),
        description: Some(description.to_string()),
        thumbnail: Some(member.avatar_url.clone()),
        fields: vec![account_creation(member, now)],
        timestamp: now,
    }
}

fn account_creation(member: &Member, now: DateTime<Utc>) -> (String, String) {
    (
        "Account Creation".to_string(),
        format!(
            "{} ago\n{}",
            human_delta(member.created_at, now),
            format_timestamp(member.created_at)
        ),
    )
}
