//! Member admission control.
//!
//! Screens members as they join a guild: per-member and global join ratelimits, a fixed
//! catalog of checks, and the bounce/ban/lockdown actions that follow.

pub mod checks;
pub mod keeper;
pub mod ratelimiter;
pub mod report;
pub mod service;
pub mod threshold;

#[cfg(test)]
mod testing;

pub use checks::{Check, Outcome};
pub use keeper::{Decision, Keeper, KeeperSettings};
pub use service::{GatekeeperService, GatekeeperStatus, ServiceError};
pub use threshold::Threshold;
