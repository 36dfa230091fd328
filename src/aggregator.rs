//! Per-unit-of-work aggregation of query fingerprints
//!
//! The aggregator is shared by every thread that executes queries for the
//! open unit of work. Each fingerprint's read-modify-write (bump the count,
//! set the first call site if unset) happens inside one critical section,
//! so concurrent observations are never lost or misattributed.

use crate::caller::CallSite;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One executed statement, reduced to what detection needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryObservation {
    pub fingerprint: String,
    pub call_site: Option<CallSite>,
}

impl QueryObservation {
    pub fn new(fingerprint: impl Into<String>, call_site: Option<CallSite>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            call_site,
        }
    }
}

/// Accumulated state for one fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintStats {
    pub count: usize,
    /// Call site of the first observation; never overwritten
    pub first_call_site: Option<CallSite>,
}

/// Thread-safe fingerprint counter for the open unit of work
#[derive(Debug, Default)]
pub struct Aggregator {
    entries: Mutex<HashMap<String, FingerprintStats>>,
    total: AtomicU64,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one observation
    pub fn observe(&self, observation: QueryObservation) {
        let QueryObservation {
            fingerprint,
            call_site,
        } = observation;

        let mut entries = self.lock();
        match entries.entry(fingerprint) {
            Entry::Occupied(mut slot) => slot.get_mut().count += 1,
            // The first observation's call site sticks, even when unknown
            Entry::Vacant(slot) => {
                slot.insert(FingerprintStats {
                    count: 1,
                    first_call_site: call_site,
                });
            }
        }
        drop(entries);

        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Times `fingerprint` was observed so far
    pub fn count(&self, fingerprint: &str) -> usize {
        self.lock().get(fingerprint).map_or(0, |stats| stats.count)
    }

    pub fn first_call_site(&self, fingerprint: &str) -> Option<CallSite> {
        self.lock()
            .get(fingerprint)
            .and_then(|stats| stats.first_call_site.clone())
    }

    /// Number of distinct fingerprints
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of observations across all fingerprints
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> HashMap<String, FingerprintStats> {
        self.lock().clone()
    }

    /// Move the state out, leaving the aggregator empty
    pub fn drain(&self) -> HashMap<String, FingerprintStats> {
        let entries = std::mem::take(&mut *self.lock());
        self.total.store(0, Ordering::Relaxed);
        entries
    }

    // A panic elsewhere while holding the lock must not stop counting
    fn lock(&self) -> MutexGuard<'_, HashMap<String, FingerprintStats>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Closed unit of work handed to the reporter
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AggregationContext {
    pub unit_id: String,
    pub entries: HashMap<String, FingerprintStats>,
}

impl AggregationContext {
    pub fn new(unit_id: impl Into<String>, entries: HashMap<String, FingerprintStats>) -> Self {
        Self {
            unit_id: unit_id.into(),
            entries,
        }
    }

    pub fn count(&self, fingerprint: &str) -> usize {
        self.entries.get(fingerprint).map_or(0, |stats| stats.count)
    }

    pub fn first_call_site(&self, fingerprint: &str) -> Option<&CallSite> {
        self.entries
            .get(fingerprint)
            .and_then(|stats| stats.first_call_site.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
