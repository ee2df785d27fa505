//! Round-robin bearer-token pool with per-token failure accounting.
//!
//! Callers never touch entries directly: `select` hands out a [`TokenLease`]
//! (a cloned token value plus the entry's position and the pool generation),
//! and results are reported back through `record_success` / `record_failure`.
//! `replace` swaps the whole entry set atomically and bumps the generation,
//! so a lease taken before the swap can still be reported afterwards without
//! touching the new entries.

use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{PoolError, Result};

struct TokenEntry {
    value: String,
    failure_count: u32,
    disabled: bool,
}

impl TokenEntry {
    fn new(value: String) -> Self {
        Self {
            value,
            failure_count: 0,
            disabled: false,
        }
    }
}

struct PoolInner {
    entries: Vec<TokenEntry>,
    cursor: usize,
    generation: u64,
}

pub struct TokenPool {
    inner: Mutex<PoolInner>,
    max_failures: u32,
}

/// A selected token. Holds a copy of the value, so the lease stays usable
/// even if the pool is replaced while the upstream call is in flight.
#[derive(Debug, Clone)]
pub struct TokenLease {
    value: String,
    index: usize,
    generation: u64,
}

impl TokenLease {
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// Result of `record_failure` on a live lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub failure_count: u32,
    pub disabled_now: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub disabled: usize,
    pub entries: Vec<EntryStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryStats {
    pub index: usize,
    pub failure_count: u32,
    pub disabled: bool,
}

impl TokenPool {
    /// Build a pool from token values in declared order.
    pub fn new(values: Vec<String>, max_failures: u32) -> Self {
        let entries = values.into_iter().map(TokenEntry::new).collect();
        Self {
            inner: Mutex::new(PoolInner {
                entries,
                cursor: 0,
                generation: 0,
            }),
            max_failures,
        }
    }

    /// Round-robin over entries in declared order, skipping disabled ones.
    /// Returns `None` once a full pass finds nothing selectable.
    pub fn select(&self) -> Option<TokenLease> {
        let mut inner = self.inner.lock().unwrap();
        let len = inner.entries.len();
        if len == 0 {
            return None;
        }
        for _ in 0..len {
            let idx = inner.cursor % len;
            inner.cursor = (idx + 1) % len;
            if !inner.entries[idx].disabled {
                return Some(TokenLease {
                    value: inner.entries[idx].value.clone(),
                    index: idx,
                    generation: inner.generation,
                });
            }
        }
        None
    }

    /// Zero the failure counter for the leased entry. Stale leases
    /// (taken before a `replace`) are ignored.
    pub fn record_success(&self, lease: &TokenLease) {
        let mut inner = self.inner.lock().unwrap();
        if lease.generation != inner.generation || lease.index >= inner.entries.len() {
            return;
        }
        let entry = &mut inner.entries[lease.index];
        entry.failure_count = 0;
        entry.disabled = false;
    }

    /// Bump the failure counter for the leased entry, disabling it once it
    /// reaches `max_failures`. Returns `None` for stale leases.
    pub fn record_failure(&self, lease: &TokenLease) -> Option<FailureOutcome> {
        let mut inner = self.inner.lock().unwrap();
        if lease.generation != inner.generation || lease.index >= inner.entries.len() {
            debug!(index = lease.index, "failure on stale lease ignored");
            return None;
        }
        let max = self.max_failures;
        let entry = &mut inner.entries[lease.index];
        entry.failure_count += 1;
        let disabled_now = !entry.disabled && entry.failure_count >= max;
        if disabled_now {
            entry.disabled = true;
            warn!(
                index = lease.index,
                failures = entry.failure_count,
                "token disabled after repeated failures"
            );
        }
        Some(FailureOutcome {
            failure_count: entry.failure_count,
            disabled_now,
        })
    }

    /// Re-enable one entry and zero its counter.
    pub fn reset(&self, index: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let len = inner.entries.len();
        let entry = inner
            .entries
            .get_mut(index)
            .ok_or(PoolError::IndexOutOfRange { index, len })?;
        entry.failure_count = 0;
        entry.disabled = false;
        Ok(())
    }

    /// Re-enable every entry.
    pub fn reset_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for entry in &mut inner.entries {
            entry.failure_count = 0;
            entry.disabled = false;
        }
    }

    /// Atomically swap in a new entry set. The new vector is built before
    /// the lock is taken; under the lock this is a single assignment plus a
    /// generation bump, so no caller ever observes a partial swap.
    pub fn replace(&self, values: Vec<String>) {
        let entries: Vec<TokenEntry> = values.into_iter().map(TokenEntry::new).collect();
        let count = entries.len();
        let mut inner = self.inner.lock().unwrap();
        inner.entries = entries;
        inner.cursor = 0;
        inner.generation += 1;
        info!(tokens = count, generation = inner.generation, "token pool replaced");
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        let entries: Vec<EntryStats> = inner
            .entries
            .iter()
            .enumerate()
            .map(|(index, e)| EntryStats {
                index,
                failure_count: e.failure_count,
                disabled: e.disabled,
            })
            .collect();
        let disabled = entries.iter().filter(|e| e.disabled).count();
        PoolStats {
            total: entries.len(),
            active: entries.len() - disabled,
            disabled,
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.entries.iter().filter(|e| !e.disabled).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(values: &[&str], max_failures: u32) -> TokenPool {
        TokenPool::new(values.iter().map(|s| s.to_string()).collect(), max_failures)
    }

    #[test]
    fn empty_pool_selects_nothing() {
        let pool = pool_of(&[], 3);
        assert!(pool.select().is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn round_robin_visits_entries_in_order() {
        let pool = pool_of(&["a", "b", "c"], 3);
        let picks: Vec<String> = (0..6)
            .map(|_| pool.select().unwrap().value().to_string())
            .collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn round_robin_has_no_starvation() {
        // Over K selects on A active entries, each entry is returned
        // floor(K/A) or ceil(K/A) times.
        let pool = pool_of(&["a", "b", "c"], 3);
        let mut counts = std::collections::HashMap::new();
        for _ in 0..10 {
            let lease = pool.select().unwrap();
            *counts.entry(lease.value().to_string()).or_insert(0u32) += 1;
        }
        for count in counts.values() {
            assert!(*count == 3 || *count == 4);
        }
    }

    #[test]
    fn failures_disable_at_threshold() {
        let pool = pool_of(&["a"], 2);
        let lease = pool.select().unwrap();

        let outcome = pool.record_failure(&lease).unwrap();
        assert_eq!(outcome.failure_count, 1);
        assert!(!outcome.disabled_now);

        let outcome = pool.record_failure(&lease).unwrap();
        assert_eq!(outcome.failure_count, 2);
        assert!(outcome.disabled_now);

        assert!(pool.select().is_none());
        let stats = pool.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.active, 0);
        assert!(stats.entries[0].disabled);
    }

    #[test]
    fn disabled_invariant_tracks_failure_count() {
        let pool = pool_of(&["a", "b"], 3);
        for _ in 0..5 {
            let lease = pool.select().unwrap();
            pool.record_failure(&lease);
            for entry in pool.stats().entries {
                assert_eq!(entry.disabled, entry.failure_count >= 3);
            }
        }
    }

    #[test]
    fn success_clears_failures_and_reenables() {
        let pool = pool_of(&["a"], 2);
        let lease = pool.select().unwrap();
        pool.record_failure(&lease);
        pool.record_failure(&lease);
        assert!(pool.select().is_none());

        pool.record_success(&lease);
        let stats = pool.stats();
        assert_eq!(stats.entries[0].failure_count, 0);
        assert!(!stats.entries[0].disabled);
        assert!(pool.select().is_some());
    }

    #[test]
    fn select_skips_disabled_entries() {
        let pool = pool_of(&["a", "b", "c"], 1);
        let first = pool.select().unwrap();
        assert_eq!(first.value(), "a");
        pool.record_failure(&first);

        let picks: Vec<String> = (0..4)
            .map(|_| pool.select().unwrap().value().to_string())
            .collect();
        assert_eq!(picks, ["b", "c", "b", "c"]);
    }

    #[test]
    fn reset_reenables_single_entry() {
        let pool = pool_of(&["a", "b"], 1);
        let lease = pool.select().unwrap();
        pool.record_failure(&lease);
        assert_eq!(pool.active_count(), 1);

        pool.reset(0).unwrap();
        assert_eq!(pool.active_count(), 2);
        assert!(pool.reset(5).is_err());
    }

    #[test]
    fn reset_all_reenables_everything() {
        let pool = pool_of(&["a", "b"], 1);
        for _ in 0..2 {
            let lease = pool.select().unwrap();
            pool.record_failure(&lease);
        }
        assert!(pool.select().is_none());

        pool.reset_all();
        assert_eq!(pool.active_count(), 2);
    }

    #[test]
    fn replace_swaps_entry_set_and_resets_cursor() {
        let pool = pool_of(&["a", "b"], 3);
        pool.select().unwrap();

        pool.replace(vec!["x".to_string(), "y".to_string()]);
        let picks: Vec<String> = (0..2)
            .map(|_| pool.select().unwrap().value().to_string())
            .collect();
        assert_eq!(picks, ["x", "y"]);
        assert_eq!(pool.stats().total, 2);
    }

    #[test]
    fn stale_lease_is_ignored_after_replace() {
        let pool = pool_of(&["a"], 1);
        let lease = pool.select().unwrap();

        pool.replace(vec!["x".to_string()]);
        assert!(pool.record_failure(&lease).is_none());
        pool.record_success(&lease);

        // The new entry is untouched by reports against the old generation.
        let stats = pool.stats();
        assert_eq!(stats.entries[0].failure_count, 0);
        assert!(!stats.entries[0].disabled);
    }
}
