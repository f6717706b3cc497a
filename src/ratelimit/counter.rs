//! Per-key hit counters and the leaky-bucket drain step.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Hit count for a single key.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterRecord {
    hits: u64,
}

impl CounterRecord {
    /// Current number of counted hits.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Count one admitted request.
    pub fn increment(&mut self) {
        self.hits = self.hits.saturating_add(1);
    }

    /// Drain `allowance` hits, never going below zero.
    ///
    /// Returns what happened to the record so sweeps can report it.
    pub fn leak(&mut self, allowance: u64) -> Leak {
        if self.hits > allowance {
            self.hits -= allowance;
            Leak::Drained
        } else if self.hits > 0 {
            self.hits = 0;
            Leak::Emptied
        } else {
            Leak::Idle
        }
    }
}

/// Outcome of draining a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leak {
    /// Still over the allowance; `hits` was reduced by it.
    Drained,
    /// Brought down to zero this tick.
    Emptied,
    /// Was already empty.
    Idle,
}

/// Totals for one sweep over the store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LeakStats {
    pub drained: usize,
    pub emptied: usize,
    pub evicted: usize,
}

/// Hit counters indexed by key.
///
/// Every read and write goes through a single lock, so callers observing and
/// updating a record inside [`CounterStore::with_record`] never race with each
/// other or with a sweep.
#[derive(Debug, Default)]
pub struct CounterStore {
    records: Mutex<HashMap<String, CounterRecord>>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the record for `key`, creating an empty one if needed.
    ///
    /// The store lock is held for the duration of `f`.
    pub fn with_record<R>(&self, key: &str, f: impl FnOnce(&mut CounterRecord) -> R) -> R {
        let mut records = self.records.lock();
        // Avoid allocating the key on the hot path when the record already exists.
        if let Some(record) = records.get_mut(key) {
            return f(record);
        }
        f(records.entry(key.to_string()).or_default())
    }

    /// Drain every record by `allowance`.
    ///
    /// With `evict_idle`, records that were already empty are removed and
    /// `on_evict` is called with their key while the store lock is held.
    pub fn leak(
        &self,
        allowance: u64,
        evict_idle: bool,
        mut on_evict: impl FnMut(&str),
    ) -> LeakStats {
        let mut stats = LeakStats::default();
        let mut records = self.records.lock();

        records.retain(|key, record| match record.leak(allowance) {
            Leak::Drained => {
                stats.drained += 1;
                true
            }
            Leak::Emptied => {
                stats.emptied += 1;
                true
            }
            Leak::Idle if evict_idle => {
                stats.evicted += 1;
                on_evict(key);
                false
            }
            Leak::Idle => true,
        });

        stats
    }

    /// Get the hit count for a key, if it has been seen.
    pub fn hits(&self, key: &str) -> Option<u64> {
        self.records.lock().get(key).map(CounterRecord::hits)
    }

    /// Forget a key entirely.
    pub fn remove(&self, key: &str) -> Option<CounterRecord> {
        self.records.lock().remove(key)
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}
