//! Discord runtime: gateway client, event handler and the serenity-backed platform.

mod handler;
mod platform;
mod runtime;

pub use platform::DiscordPlatform;
pub use runtime::run;
