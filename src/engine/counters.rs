use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// A monotonic counter with a running total and a since-last-read value.
#[derive(Default, Debug)]
pub struct Counter {
    total: AtomicU64,
    recent: AtomicU64,
}

impl Counter {
    pub fn incr(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
        self.recent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Returns the count since the previous call and starts over.
    pub fn take_recent(&self) -> u64 {
        self.recent.swap(0, Ordering::Relaxed)
    }

    fn sample(&self) -> Sample {
        Sample {
            new: self.take_recent(),
            total: self.total(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Sample {
    /// Since the previous snapshot
    pub new: u64,
    /// Since the module was created
    pub total: u64,
}

/// Operational counters shared by a module's execution contexts. Roles only
/// touch the counters that concern them.
#[derive(Default, Debug)]
pub struct Counters {
    pub requests_issued: Counter,
    pub requests_received: Counter,
    pub requests_reissued: Counter,
    pub requests_expired: Counter,
    pub lists_generated: Counter,
    pub lists_received: Counter,
    pub lists_sent: Counter,
    pub late_arrivals: Counter,
    pub duplicate_results: Counter,
    pub force_flushed: Counter,
    pub dropped_deliveries: Counter,
    pub valid_pairs: Counter,
    pub mismatched_pairs: Counter,
    pub incomplete_aggregates: Counter,
}

impl Counters {
    /// Reads every counter and resets the since-last-read halves.
    pub fn snapshot_and_reset(&self) -> CounterSnapshot {
        CounterSnapshot {
            requests_issued: self.requests_issued.sample(),
            requests_received: self.requests_received.sample(),
            requests_reissued: self.requests_reissued.sample(),
            requests_expired: self.requests_expired.sample(),
            lists_generated: self.lists_generated.sample(),
            lists_received: self.lists_received.sample(),
            lists_sent: self.lists_sent.sample(),
            late_arrivals: self.late_arrivals.sample(),
            duplicate_results: self.duplicate_results.sample(),
            force_flushed: self.force_flushed.sample(),
            dropped_deliveries: self.dropped_deliveries.sample(),
            valid_pairs: self.valid_pairs.sample(),
            mismatched_pairs: self.mismatched_pairs.sample(),
            incomplete_aggregates: self.incomplete_aggregates.sample(),
        }
    }
}

/// What a metrics collector pulls from a module.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub requests_issued: Sample,
    pub requests_received: Sample,
    pub requests_reissued: Sample,
    pub requests_expired: Sample,
    pub lists_generated: Sample,
    pub lists_received: Sample,
    pub lists_sent: Sample,
    pub late_arrivals: Sample,
    pub duplicate_results: Sample,
    pub force_flushed: Sample,
    pub dropped_deliveries: Sample,
    pub valid_pairs: Sample,
    pub mismatched_pairs: Sample,
    pub incomplete_aggregates: Sample,
}
