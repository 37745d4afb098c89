//! Fault and replica statistics
//!
//! Read-only counters exported through the kernel's sysfs glue. Writing `1`
//! to the reset attribute maps to [`CoherenceStats::reset`].

use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Global engine statistics.
#[derive(Debug, Default)]
pub struct CoherenceStats {
    /// Total coherence faults handled
    pub fault_count: AtomicU64,
    /// Read faults
    pub fault_read_count: AtomicU64,
    /// Write faults
    pub fault_write_count: AtomicU64,
    /// Faults that found an existing replica
    pub replica_found_count: AtomicU64,
    /// Replicas created
    pub replica_created_count: AtomicU64,
    /// DRAM pages currently backing replicas
    pub allocated_pages: AtomicI64,
}

impl CoherenceStats {
    pub const fn new() -> Self {
        Self {
            fault_count: AtomicU64::new(0),
            fault_read_count: AtomicU64::new(0),
            fault_write_count: AtomicU64::new(0),
            replica_found_count: AtomicU64::new(0),
            replica_created_count: AtomicU64::new(0),
            allocated_pages: AtomicI64::new(0),
        }
    }

    pub fn record_fault(&self, is_write: bool) {
        self.fault_count.fetch_add(1, Ordering::Relaxed);
        if is_write {
            self.fault_write_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fault_read_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn track_page_alloc(&self, order: u32) {
        self.allocated_pages
            .fetch_add(1i64 << order, Ordering::Relaxed);
    }

    pub fn track_page_free(&self, order: u32) {
        self.allocated_pages
            .fetch_sub(1i64 << order, Ordering::Relaxed);
    }

    /// Zero every counter.
    pub fn reset(&self) {
        self.fault_count.store(0, Ordering::Relaxed);
        self.fault_read_count.store(0, Ordering::Relaxed);
        self.fault_write_count.store(0, Ordering::Relaxed);
        self.replica_found_count.store(0, Ordering::Relaxed);
        self.replica_created_count.store(0, Ordering::Relaxed);
        self.allocated_pages.store(0, Ordering::Relaxed);
    }

    /// Point-in-time snapshot for the sysfs show callbacks.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            fault_count: self.fault_count.load(Ordering::Relaxed),
            fault_read_count: self.fault_read_count.load(Ordering::Relaxed),
            fault_write_count: self.fault_write_count.load(Ordering::Relaxed),
            replica_found_count: self.replica_found_count.load(Ordering::Relaxed),
            replica_created_count: self.replica_created_count.load(Ordering::Relaxed),
            allocated_pages: self.allocated_pages.load(Ordering::Relaxed),
        }
    }
}

/// Copyable view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub fault_count: u64,
    pub fault_read_count: u64,
    pub fault_write_count: u64,
    pub replica_found_count: u64,
    pub replica_created_count: u64,
    pub allocated_pages: i64,
}
