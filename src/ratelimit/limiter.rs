//! Core rate limiter implementation.

use std::sync::{Arc, Weak};

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::counter::{CounterRecord, CounterStore, LeakStats};
use super::escalation::{EscalationTracker, InMemoryEscalation};
use super::policy::Policy;
use super::scheduler::Scheduler;
use crate::error::Result;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Decision {
    /// The request is within the key's allowance and has been counted.
    Admitted,
    /// The key is over its allowance. `hits` is the count observed at rejection.
    Rejected { hits: u64 },
    /// The key is blocked. Only returned when blocks are enforced.
    Blocked,
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted)
    }

    pub fn is_rejected(&self) -> bool {
        !self.is_admitted()
    }
}

/// State shared between the limiter and its decay job.
struct Shared {
    policy: Policy,
    counters: CounterStore,
    tracker: Option<Arc<dyn EscalationTracker>>,
    evict_idle: bool,
}

impl Shared {
    /// One leaky-bucket tick over every counter.
    fn decay(&self) -> LeakStats {
        let tracker = self.tracker.as_deref();
        let stats = self
            .counters
            .leak(self.policy.max_requests(), self.evict_idle, |key| {
                if let Some(tracker) = tracker {
                    tracker.forget(key);
                }
            });
        if let Some(tracker) = tracker {
            tracker.purge_expired();
        }
        debug!(
            drained = stats.drained,
            emptied = stats.emptied,
            evicted = stats.evicted,
            "Decay sweep completed"
        );
        stats
    }
}

/// A leaky-bucket rate limiter for arbitrary string keys.
///
/// The limiter is thread-safe and can be shared across threads, typically
/// behind an [`Arc`].
pub struct Limiter {
    shared: Arc<Shared>,
    enforce_blocks: bool,
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("policy", &self.shared.policy)
            .field("tracked_keys", &self.shared.counters.len())
            .field("escalation", &self.shared.tracker.is_some())
            .field("enforce_blocks", &self.enforce_blocks)
            .finish()
    }
}

impl Limiter {
    /// Parse `policy` and build a limiter with default settings.
    ///
    /// The decay job is registered with `scheduler`; failure to parse the
    /// policy or register the job is returned as an error.
    pub fn new(policy: &str, scheduler: &dyn Scheduler) -> Result<Self> {
        Self::builder(Policy::parse(policy)?).build(scheduler)
    }

    /// Start building a limiter for an already parsed policy.
    pub fn builder(policy: Policy) -> LimiterBuilder {
        LimiterBuilder {
            policy,
            tracker: None,
            enforce_blocks: false,
            evict_idle: false,
        }
    }

    /// Check whether a request for `key` may proceed, counting it if so.
    pub fn hit(&self, key: &str) -> Decision {
        let shared = &*self.shared;
        let max_requests = shared.policy.max_requests();

        // Blocks are checked under the store lock so a block set by a
        // concurrent overflow is never missed.
        let (decision, newly_blocked) =
            shared.counters.with_record(key, |record: &mut CounterRecord| {
                if self.enforce_blocks && self.is_blocked(key) {
                    return (Decision::Blocked, false);
                }
                let hits = record.hits();
                if hits < max_requests {
                    record.increment();
                    return (Decision::Admitted, false);
                }

                let newly_blocked = shared
                    .tracker
                    .as_deref()
                    .is_some_and(|tracker| self.escalate(tracker, key));
                (Decision::Rejected { hits }, newly_blocked)
            });

        match decision {
            Decision::Admitted => trace!(key = %key, "Request admitted"),
            Decision::Rejected { hits } => {
                warn!(key = %key, hits = hits, "Key has reached max requests");
            }
            Decision::Blocked => trace!(key = %key, "Key is blocked"),
        }
        if newly_blocked {
            warn!(
                key = %key,
                block = ?shared.policy.block_duration(),
                "Key blocked after repeated overflows"
            );
        }
        decision
    }

    /// Record an overflow and block the key once it has offended often enough.
    ///
    /// Returns `true` if this overflow blocked the key.
    fn escalate(&self, tracker: &dyn EscalationTracker, key: &str) -> bool {
        tracker.increase(key);

        let policy = &self.shared.policy;
        if !policy.blocks() {
            return false;
        }
        let Some(max_to_spam) = policy.max_to_spam() else {
            return false;
        };
        tracker.current_offenses(key) >= max_to_spam && tracker.add_if_not_blocked(key)
    }

    /// Run one decay sweep now, outside the regular schedule.
    pub fn decay(&self) -> LeakStats {
        self.shared.decay()
    }

    /// Whether `key` is currently blocked by the escalation tracker.
    pub fn is_blocked(&self, key: &str) -> bool {
        self.shared
            .tracker
            .as_ref()
            .is_some_and(|tracker| tracker.is_blocked(key))
    }

    /// Current hit count for `key`, if it has been seen.
    pub fn hits(&self, key: &str) -> Option<u64> {
        self.shared.counters.hits(key)
    }

    /// Offenses recorded for `key`, or `None` without escalation.
    pub fn offenses(&self, key: &str) -> Option<u64> {
        self.shared
            .tracker
            .as_ref()
            .map(|tracker| tracker.current_offenses(key))
    }

    pub fn policy(&self) -> &Policy {
        &self.shared.policy
    }

    /// Number of keys with a counter.
    pub fn tracked_keys(&self) -> usize {
        self.shared.counters.len()
    }

    /// Drop the counter for `key`, giving it a fresh allowance.
    ///
    /// Offenses and blocks are left to the escalation tracker.
    pub fn reset(&self, key: &str) -> bool {
        let removed = self.shared.counters.remove(key).is_some();
        if removed {
            debug!(key = %key, "Counter reset");
        }
        removed
    }
}

/// Builder for a [`Limiter`].
pub struct LimiterBuilder {
    policy: Policy,
    tracker: Option<Arc<dyn EscalationTracker>>,
    enforce_blocks: bool,
    evict_idle: bool,
}

impl LimiterBuilder {
    /// Use a custom escalation tracker instead of the in-memory one.
    ///
    /// Ignored when the policy has no `spam` modifier.
    pub fn with_tracker(mut self, tracker: Arc<dyn EscalationTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Reject blocked keys outright instead of only recording the block.
    pub fn enforce_blocks(mut self, enforce: bool) -> Self {
        self.enforce_blocks = enforce;
        self
    }

    /// Drop counters that stay empty for a whole interval.
    pub fn evict_idle(mut self, evict: bool) -> Self {
        self.evict_idle = evict;
        self
    }

    /// Build the limiter and register its decay job with `scheduler`.
    pub fn build(self, scheduler: &dyn Scheduler) -> Result<Limiter> {
        let policy = self.policy;

        let tracker = if policy.escalates() {
            let tracker = self.tracker.unwrap_or_else(|| {
                Arc::new(InMemoryEscalation::new(policy.block_duration())) as Arc<dyn EscalationTracker>
            });
            Some(tracker)
        } else {
            if self.tracker.is_some() {
                debug!(policy = %policy, "Policy does not escalate, ignoring tracker");
            }
            None
        };

        if policy.block_duration().is_some() && !policy.escalates() {
            warn!(
                policy = %policy,
                "Block duration set without a spam threshold, keys will never be blocked"
            );
        }

        let interval = policy.interval();
        let shared = Arc::new(Shared {
            policy,
            counters: CounterStore::new(),
            tracker,
            evict_idle: self.evict_idle,
        });

        // The job must not keep the counters alive once the limiter is gone.
        let weak: Weak<Shared> = Arc::downgrade(&shared);
        scheduler.schedule_recurring(
            interval,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.decay();
                }
            }),
        )?;

        info!(
            policy = %shared.policy,
            interval = ?interval,
            enforce_blocks = self.enforce_blocks,
            evict_idle = shared.evict_idle,
            "Rate limiter initialized"
        );

        Ok(Limiter {
            shared,
            enforce_blocks: self.enforce_blocks,
        })
    }
}
