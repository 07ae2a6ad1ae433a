//! Database module exports.

mod models;
mod mongo;
mod repository;
mod store;

pub use models::*;
pub use mongo::Database;
pub use repository::GuildConfigRepository;
pub use store::{ConfigChange, ConfigStore};

#[cfg(test)]
pub use store::MemoryConfigStore;
