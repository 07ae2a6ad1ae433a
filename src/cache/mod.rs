//! Moka-backed caches.
//!
//! Guild configuration is read on every join. Caching it bounds how often MongoDB is hit,
//! and the TTL bounds how long an out-of-band edit can go unnoticed.

mod typed;

pub use typed::{CacheConfig, TypedCache};
