//! Repeat-offender tracking.
//!
//! The limiter reports every overflow to an [`EscalationTracker`] and asks it
//! to block a key once the key has overflowed often enough.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

/// Tracks offenses and blocked status per key.
pub trait EscalationTracker: Send + Sync {
    /// Record one more offense for `key`.
    fn increase(&self, key: &str);

    /// Offenses recorded for `key` (0 if untracked).
    fn current_offenses(&self, key: &str) -> u64;

    /// Mark `key` as blocked. No-op if it already is.
    ///
    /// Returns `true` if this call blocked the key.
    fn add_if_not_blocked(&self, key: &str) -> bool;

    /// Whether `key` is currently blocked.
    fn is_blocked(&self, key: &str) -> bool;

    /// Lift blocks that have run their course.
    fn purge_expired(&self) {}

    /// Drop state kept for `key` once its counter has been evicted.
    fn forget(&self, _key: &str) {}
}

/// In-memory spammer and blocker stores.
///
/// Offense counts are kept until the limiter evicts the key's idle counter,
/// and are never dropped while the key is blocked. Blocks last for the
/// configured duration and are lifted lazily on lookup or by
/// [`EscalationTracker::purge_expired`].
#[derive(Debug, Default)]
pub struct InMemoryEscalation {
    offenses: DashMap<String, u64>,
    blocked: DashMap<String, Instant>,
    block_duration: Option<Duration>,
}

impl InMemoryEscalation {
    /// Create a tracker that blocks keys for `block_duration`.
    ///
    /// With `None`, offenses are counted but keys are never blocked.
    pub fn new(block_duration: Option<Duration>) -> Self {
        Self {
            offenses: DashMap::new(),
            blocked: DashMap::new(),
            block_duration,
        }
    }

    /// When the block on `key` is lifted, if it is blocked.
    pub fn blocked_until(&self, key: &str) -> Option<Instant> {
        let now = Instant::now();
        self.blocked
            .get(key)
            .map(|until| *until)
            .filter(|until| *until > now)
    }

    /// Number of keys with at least one offense.
    pub fn offender_count(&self) -> usize {
        self.offenses.len()
    }

    /// Number of keys currently blocked, including expired blocks not yet purged.
    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }
}

impl EscalationTracker for InMemoryEscalation {
    fn increase(&self, key: &str) {
        *self.offenses.entry(key.to_string()).or_insert(0) += 1;
    }

    fn current_offenses(&self, key: &str) -> u64 {
        self.offenses.get(key).map(|n| *n).unwrap_or(0)
    }

    fn add_if_not_blocked(&self, key: &str) -> bool {
        let Some(duration) = self.block_duration else {
            return false;
        };
        let now = Instant::now();

        let mut newly_blocked = false;
        self.blocked
            .entry(key.to_string())
            .and_modify(|until| {
                // An expired block that has not been purged yet is renewed.
                if *until <= now {
                    *until = now + duration;
                    newly_blocked = true;
                }
            })
            .or_insert_with(|| {
                newly_blocked = true;
                now + duration
            });
        newly_blocked
    }

    fn is_blocked(&self, key: &str) -> bool {
        self.blocked_until(key).is_some()
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        let before = self.blocked.len();
        self.blocked.retain(|_key, until| *until > now);
        let lifted = before.saturating_sub(self.blocked.len());
        if lifted > 0 {
            debug!(lifted = lifted, "Lifted expired blocks");
        }
    }

    fn forget(&self, key: &str) {
        if !self.is_blocked(key) {
            self.offenses.remove(key);
        }
    }
}
