//! Quota command statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the commands a quota manager has processed
#[derive(Debug, Default)]
pub struct QuotaStats {
    inserts: AtomicU64,
    touches: AtomicU64,
    pins: AtomicU64,
    pin_failures: AtomicU64,
    evictions: AtomicU64,
    evicted_bytes: AtomicU64,
}

impl QuotaStats {
    /// Create new stats tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an insert
    pub fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a touch of a tracked object
    pub fn record_touch(&self) {
        self.touches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a pin request
    pub fn record_pin(&self, granted: bool) {
        if granted {
            self.pins.fetch_add(1, Ordering::Relaxed);
        } else {
            self.pin_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an eviction of `size` bytes
    pub fn record_eviction(&self, size: u64) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(size, Ordering::Relaxed);
    }

    /// Get total inserts
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    /// Get total touches
    pub fn touches(&self) -> u64 {
        self.touches.load(Ordering::Relaxed)
    }

    /// Get granted pins
    pub fn pins(&self) -> u64 {
        self.pins.load(Ordering::Relaxed)
    }

    /// Get refused pins
    pub fn pin_failures(&self) -> u64 {
        self.pin_failures.load(Ordering::Relaxed)
    }

    /// Get total evictions
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Get total evicted bytes
    pub fn evicted_bytes(&self) -> u64 {
        self.evicted_bytes.load(Ordering::Relaxed)
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.inserts.store(0, Ordering::Relaxed);
        self.touches.store(0, Ordering::Relaxed);
        self.pins.store(0, Ordering::Relaxed);
        self.pin_failures.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.evicted_bytes.store(0, Ordering::Relaxed);
    }
}
