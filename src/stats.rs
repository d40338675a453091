//! Shared rolling-average helper used by every subsystem's stats block
//! (WorkerPool, Downloader, AudioConverter, ImageConverter, S3Service).
//!
//! The filter is a cheap, bounded-memory low-pass: `new = (old*9 +
//! sample)/10`, seeded on the first sample. It is not a running mean and
//! concurrent updates are racy by design (advisory only, never
//! authoritative).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A single rolling-average value stored as a bit-pattern `u64` so it
/// can live behind an atomic without an external lock. Reads/writes are
/// `Relaxed`: under concurrent updates the value is advisory, never
/// authoritative.
#[derive(Default)]
pub struct RollingAverage {
    bits: AtomicU64,
    seeded: AtomicBool,
}

impl RollingAverage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `sample` into the average, seeding it on the first call.
    pub fn update(&self, sample: f64) {
        if !self.seeded.swap(true, Ordering::Relaxed) {
            self.bits.store(sample.to_bits(), Ordering::Relaxed);
            return;
        }
        let old = f64::from_bits(self.bits.load(Ordering::Relaxed));
        let new = (old * 9.0 + sample) / 10.0;
        self.bits.store(new.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        if !self.seeded.load(Ordering::Relaxed) {
            return 0.0;
        }
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Monotonic counters common to every subsystem stats block: a total,
/// a failure count, and a rolling average duration in nanoseconds.
#[derive(Default)]
pub struct Counters {
    pub total: AtomicU64,
    pub failed: AtomicU64,
    pub total_bytes: AtomicU64,
    pub avg_duration_nanos: RollingAverage,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, elapsed: std::time::Duration, bytes: u64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.avg_duration_nanos.update(elapsed.as_nanos() as f64);
    }

    pub fn record_failure(&self, elapsed: std::time::Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.avg_duration_nanos.update(elapsed.as_nanos() as f64);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn avg_duration(&self) -> std::time::Duration {
        std::time::Duration::from_nanos(self.avg_duration_nanos.get().max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_on_first_sample() {
        let avg = RollingAverage::new();
        assert_eq!(avg.get(), 0.0);
        avg.update(100.0);
        assert_eq!(avg.get(), 100.0);
    }

    #[test]
    fn applies_low_pass_filter() {
        let avg = RollingAverage::new();
        avg.update(100.0);
        avg.update(200.0);
        // (100*9 + 200) / 10 = 110
        assert!((avg.get() - 110.0).abs() < 1e-9);
    }

    #[test]
    fn counters_are_monotonic() {
        let c = Counters::new();
        c.record_success(std::time::Duration::from_millis(5), 1024);
        c.record_failure(std::time::Duration::from_millis(5));
        assert_eq!(c.total(), 2);
        assert_eq!(c.failed(), 1);
        assert_eq!(c.total_bytes(), 1024);
    }
}
