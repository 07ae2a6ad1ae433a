//! Sliding-window ratelimiter keyed by member or by "any join".

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

use super::threshold::Threshold;

/// What a hit is accounted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateKey {
    /// A single member, by id.
    Member(u64),
    /// The shared bucket every join lands in.
    AnyJoin,
}

/// Outcome of [`RateLimiter::hit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub limited: bool,
    /// Time until the oldest retained hit leaves the window.
    pub retry_after: Duration,
}

/// At most `rate` hits per `per` seconds, per key.
///
/// The current hit is always recorded, limited or not. Hits older than the window are
/// pruned lazily whenever their key is touched. The state map sits behind a lock so
/// diagnostic reads can happen from other tasks, but hits themselves only ever come
/// from the owning guild's event task.
#[derive(Debug)]
pub struct RateLimiter {
    threshold: Threshold,
    window: Duration,
    hits: RwLock<HashMap<RateKey, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(threshold: Threshold) -> Self {
        Self {
            threshold,
            window: threshold.window(),
            hits: RwLock::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> Threshold {
        self.threshold
    }

    pub fn rate(&self) -> u32 {
        self.threshold.rate
    }

    /// Record a hit for `key` now.
    pub fn hit(&self, key: RateKey) -> Hit {
        self.hit_at(key, Instant::now())
    }

    /// Record a hit for `key` at `now`. Times must be monotone per key.
    pub fn hit_at(&self, key: RateKey, now: Instant) -> Hit {
        let rate = self.threshold.rate as usize;
        let mut hits = self.hits.write();
        let timestamps = hits.entry(key).or_default();

        prune(timestamps, now, self.window);
        let limited = timestamps.len() >= rate;

        timestamps.push_back(now);
        // Older hits can no longer decide whether a future hit is limited.
        while timestamps.len() > rate + 1 {
            timestamps.pop_front();
        }

        Hit {
            limited,
            retry_after: remaining(timestamps, now, self.window),
        }
    }

    /// Time until the oldest retained hit for `key` leaves the window.
    pub fn time_remaining(&self, key: RateKey) -> Duration {
        self.time_remaining_at(key, Instant::now())
    }

    pub fn time_remaining_at(&self, key: RateKey, now: Instant) -> Duration {
        self.hits
            .read()
            .get(&key)
            .map(|timestamps| remaining(timestamps, now, self.window))
            .unwrap_or(Duration::ZERO)
    }

    /// Number of hits for `key` still inside the window.
    #[allow(dead_code)]
    pub fn hits_in_window(&self, key: RateKey) -> usize {
        let now = Instant::now();
        self.hits
            .read()
            .get(&key)
            .map(|timestamps| {
                timestamps
                    .iter()
                    .filter(|&&t| now.duration_since(t) < self.window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Number of timestamps currently retained for `key`, pruned or not.
    #[cfg(test)]
    fn retained(&self, key: RateKey) -> usize {
        self.hits.read().get(&key).map(VecDeque::len).unwrap_or(0)
    }
}

/// Equality is over the parameters only, never the recorded hits.
impl PartialEq for RateLimiter {
    fn eq(&self, other: &Self) -> bool {
        self.threshold == other.threshold
    }
}

fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = timestamps.front() {
        if now.duration_since(oldest) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

fn remaining(timestamps: &VecDeque<Instant>, now: Instant, window: Duration) -> Duration {
    timestamps
        .front()
        .map(|&oldest| window.saturating_sub(now.duration_since(oldest)))
        .unwrap_or(Duration::ZERO)
}
