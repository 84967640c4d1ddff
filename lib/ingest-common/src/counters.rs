//! The fixed set of monotonic counters and gauges described in `spec.md` §3
//! and §6. Mutated via atomic read-modify-write, never behind a lock, and
//! rendered as a flat `key value` text snapshot — the pipeline has no
//! pull-based metrics protocol (`spec.md` §1 Non-goals), only this endpoint.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Clamps a signed delta-update to `>= 0` and returns the new value, the same
/// pattern the teacher uses for its buffer usage gauges.
fn add_clamped(counter: &AtomicI64, delta: i64) -> i64 {
    let mut new_val = 0;
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
        new_val = (current + delta).max(0);
        Some(new_val)
    });
    new_val
}

#[derive(Debug, Default)]
pub struct Counters {
    /// Events accepted by the HTTP collaborator and pushed onto the event channel.
    pub accepted: AtomicU64,
    /// Requests rejected because the event channel was full (backpressure).
    pub queue_full: AtomicU64,
    /// Requests rejected because the body exceeded `MaxBodySize`.
    pub body_too_large: AtomicU64,
    /// Events whose batch was successfully PUT to the raw prefix.
    pub stored_events: AtomicU64,
    /// Failed object-store PUT attempts (each retry attempt, plus encode failures).
    pub put_error: AtomicU64,
    /// Events newly parked in the failure queue (fresh failures and encode-failure dead-letters).
    pub fq_enqueued: AtomicU64,
    /// Events successfully replayed out of the failure queue.
    pub fq_reuploaded: AtomicU64,
    /// Events permanently dropped because the failure queue was at capacity.
    pub fq_dropped_events: AtomicU64,
    /// Failure-queue files deleted for exceeding `MaxAge` without being replayed.
    pub fq_expired_files: AtomicU64,
    /// Gauge: number of data files currently parked in the failure queue.
    pub fq_file_count: AtomicI64,
    /// Gauge: total bytes currently parked in the failure queue.
    pub fq_byte_size: AtomicI64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fq_file_count_add(&self, delta: i64) -> i64 {
        add_clamped(&self.fq_file_count, delta)
    }

    pub fn fq_byte_size_add(&self, delta: i64) -> i64 {
        add_clamped(&self.fq_byte_size, delta)
    }

    /// Renders every counter as `name value\n`, sorted for stable output.
    pub fn snapshot(&self) -> String {
        let mut out = String::new();
        let lines: [(&str, i64); 11] = [
            ("accepted", self.accepted.load(Ordering::Relaxed) as i64),
            ("queue_full", self.queue_full.load(Ordering::Relaxed) as i64),
            ("body_too_large", self.body_too_large.load(Ordering::Relaxed) as i64),
            ("stored_events", self.stored_events.load(Ordering::Relaxed) as i64),
            ("put_error", self.put_error.load(Ordering::Relaxed) as i64),
            ("fq_enqueued", self.fq_enqueued.load(Ordering::Relaxed) as i64),
            ("fq_reuploaded", self.fq_reuploaded.load(Ordering::Relaxed) as i64),
            ("fq_dropped_events", self.fq_dropped_events.load(Ordering::Relaxed) as i64),
            ("fq_expired_files", self.fq_expired_files.load(Ordering::Relaxed) as i64),
            ("fq_file_count", self.fq_file_count.load(Ordering::Relaxed)),
            ("fq_byte_size", self.fq_byte_size.load(Ordering::Relaxed)),
        ];
        for (name, value) in lines {
            let _ = writeln!(out, "{name} {value}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_never_go_negative() {
        let counters = Counters::new();
        assert_eq!(counters.fq_file_count_add(-5), 0);
        assert_eq!(counters.fq_file_count_add(3), 3);
        assert_eq!(counters.fq_file_count_add(-10), 0);
    }

    #[test]
    fn snapshot_contains_all_counters() {
        let counters = Counters::new();
        counters.accepted.fetch_add(3, Ordering::Relaxed);
        let snap = counters.snapshot();
        assert!(snap.contains("accepted 3"));
        assert!(snap.contains("fq_byte_size 0"));
    }
}
