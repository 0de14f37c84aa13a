// src/core/stats.rs

//! Client-side runtime counters.
//!
//! All counters are monotonic atomic additions; a snapshot reads them in one
//! pass so callers see a coherent view without locking the hot paths.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters maintained across the lifetime of one client.
#[derive(Debug, Default)]
pub struct Statistics {
    total_values_compressed: AtomicU64,
    compression_skipped_count: AtomicU64,
    total_original_bytes: AtomicU64,
    total_bytes_compressed: AtomicU64,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    total_timeouts: AtomicU64,
    reconnect_count: AtomicU64,
}

impl Statistics {
    pub fn new() -> Self {
        Default::default()
    }

    /// Records one value replaced by its compressed envelope.
    pub fn record_compressed(&self, original_bytes: u64, stored_bytes: u64) {
        self.total_values_compressed.fetch_add(1, Ordering::Relaxed);
        self.total_original_bytes
            .fetch_add(original_bytes, Ordering::Relaxed);
        self.total_bytes_compressed
            .fetch_add(stored_bytes, Ordering::Relaxed);
    }

    /// Records one value left uncompressed (below threshold or incompressible).
    pub fn record_compression_skipped(&self) {
        self.compression_skipped_count
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.total_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads every counter once and returns the result as a plain struct.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            total_values_compressed: self.total_values_compressed.load(Ordering::Relaxed),
            compression_skipped_count: self.compression_skipped_count.load(Ordering::Relaxed),
            total_original_bytes: self.total_original_bytes.load(Ordering::Relaxed),
            total_bytes_compressed: self.total_bytes_compressed.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            total_timeouts: self.total_timeouts.load(Ordering::Relaxed),
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the client counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub total_values_compressed: u64,
    pub compression_skipped_count: u64,
    pub total_original_bytes: u64,
    pub total_bytes_compressed: u64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub total_timeouts: u64,
    pub reconnect_count: u64,
}
