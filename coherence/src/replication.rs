//! Replication daemon
//!
//! Consumes hardware access samples, maintains a per-page access counter and
//! a 32-bin hotness histogram (bin = MSB index of the counter), and on each
//! sweep evicts replicas that fell below the hotness threshold while cutting
//! new replicas for pages that rose above it. The threshold tracks the bin
//! cutoff that captures the configured percentile of all samples.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use crate::engine::CoherenceEngine;
use crate::error::{CoherenceError, Result};
use crate::frame::{msb_index, TagWord};
use crate::vm::AccessSample;

/// Number of histogram bins, one per possible MSB index.
pub const HISTOGRAM_BINS: usize = 32;

/// Default hotness threshold before any samples arrive.
pub const DEFAULT_HOTNESS_THRESHOLD: usize = 10;

/// Default share of samples considered hot.
pub const DEFAULT_HOT_PAGE_PERCENTILE: u32 = 20;

/// Shared state of the replication daemon.
pub struct ReplicationState {
    running: AtomicBool,
    hist: [AtomicU64; HISTOGRAM_BINS],
    hotness_threshold: AtomicUsize,
    monitoring_age: AtomicU16,
    hot_page_percentile: AtomicU32,
    sampling_interval: AtomicU32,
    /// Pages whose counter crossed the threshold since the last sweep
    candidates: Mutex<Vec<u64>>,
}

impl ReplicationState {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            hist: [const { AtomicU64::new(0) }; HISTOGRAM_BINS],
            hotness_threshold: AtomicUsize::new(DEFAULT_HOTNESS_THRESHOLD),
            monitoring_age: AtomicU16::new(0),
            hot_page_percentile: AtomicU32::new(DEFAULT_HOT_PAGE_PERCENTILE),
            sampling_interval: AtomicU32::new(0),
            candidates: Mutex::new(Vec::new()),
        }
    }

    pub fn hotness_threshold(&self) -> usize {
        self.hotness_threshold.load(Ordering::Acquire)
    }

    pub fn monitoring_age(&self) -> u16 {
        self.monitoring_age.load(Ordering::Acquire)
    }

    pub fn histogram(&self) -> [u64; HISTOGRAM_BINS] {
        let mut snapshot = [0; HISTOGRAM_BINS];
        for (bin, counter) in snapshot.iter_mut().zip(self.hist.iter()) {
            *bin = counter.load(Ordering::Relaxed);
        }
        snapshot
    }

    fn record_transition(&self, old_count: u32, new_count: u32) {
        let new_bin = msb_index(new_count);
        if old_count == 0 {
            // first sample for this page: nothing to move out of a bin
            self.hist[new_bin].fetch_add(1, Ordering::Relaxed);
            return;
        }
        let old_bin = msb_index(old_count);
        if old_bin != new_bin {
            let _ = self.hist[old_bin]
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                    Some(count.saturating_sub(1))
                });
            self.hist[new_bin].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Smallest bin index whose cumulative weight from the top reaches
    /// `percentile` percent of all samples.
    fn threshold_for_percentile(&self, percentile: u32) -> usize {
        let snapshot = self.histogram();
        let total: u64 = snapshot.iter().sum();
        if total == 0 {
            return self.hotness_threshold();
        }
        // at least one sample must fall above the cutoff, or a tiny sample
        // set would push the threshold to the top bin
        let target = (total * percentile as u64 / 100).max(1);
        let mut cumulative = 0;
        for bin in (0..HISTOGRAM_BINS).rev() {
            cumulative += snapshot[bin];
            if cumulative >= target {
                return bin;
            }
        }
        0
    }

    /// Shift the histogram down one bin, halving every recorded count.
    fn cool_down(&self) {
        for bin in 1..HISTOGRAM_BINS {
            let moved = self.hist[bin].swap(0, Ordering::Relaxed);
            self.hist[bin - 1].fetch_add(moved, Ordering::Relaxed);
        }
    }
}

impl Default for ReplicationState {
    fn default() -> Self {
        Self::new()
    }
}

impl CoherenceEngine {
    /// Start the replication daemon with the given hardware sampling period
    /// and hot-page percentage. The embedder runs the loop body
    /// ([`CoherenceEngine::replication_poll`] / [`CoherenceEngine::replication_sweep`])
    /// on its daemon thread.
    pub fn replication_start(&self, sampling_interval: u32, hot_page_percentage: u32) -> Result<()> {
        let replication = &self.replication;
        if replication.running.swap(true, Ordering::AcqRel) {
            log::error!("replication daemon already running");
            return Err(CoherenceError::Busy {
                resource: "replication daemon",
            });
        }
        replication
            .sampling_interval
            .store(sampling_interval, Ordering::Release);
        replication
            .hot_page_percentile
            .store(hot_page_percentage, Ordering::Release);
        log::info!(
            "replication daemon started (sampling_interval={}, hot_page_percentage={})",
            sampling_interval,
            hot_page_percentage
        );
        Ok(())
    }

    pub fn replication_stop(&self) {
        if self.replication.running.swap(false, Ordering::AcqRel) {
            log::info!("replication daemon stopped");
        } else {
            log::warn!("replication daemon not running");
        }
    }

    pub fn replication_running(&self) -> bool {
        self.replication.running.load(Ordering::Acquire)
    }

    /// Account one hardware sample against its page.
    pub fn handle_sample(&self, sample: AccessSample) -> Result<()> {
        let pfn = self
            .vm
            .resolve_sample(sample.pid, sample.va)
            .ok_or(CoherenceError::NotFound {
                resource: "sampled page",
            })?;

        // ignore frames the engine has never promoted
        let frame = self.frames.lookup(pfn).ok_or(CoherenceError::NotFound {
            resource: "coherence page",
        })?;
        if !frame.is_coherence() {
            return Err(CoherenceError::NotFound {
                resource: "coherence page",
            });
        }

        let age = self.replication.monitoring_age();
        let (old_count, new_count) = match frame.tag() {
            TagWord::ReplicaSlot(id) => {
                let (count, epoch) = self.replicas.access(id).unwrap_or((0, 0));
                let aged = age_count(count, epoch, age);
                let bumped = aged.saturating_add(1);
                self.replicas.set_access(id, bumped, age);
                (aged, bumped)
            }
            TagWord::Access { count, epoch } => {
                let aged = age_count(count, epoch, age);
                let bumped = aged.saturating_add(1);
                let updated = frame.update_tag(
                    TagWord::Access { count, epoch },
                    TagWord::Access {
                        count: bumped,
                        epoch: age,
                    },
                );
                if !updated {
                    // lost a race with replica creation; drop the sample
                    return Ok(());
                }
                (aged, bumped)
            }
            TagWord::Untracked => {
                let updated = frame.update_tag(
                    TagWord::Untracked,
                    TagWord::Access {
                        count: 1,
                        epoch: age,
                    },
                );
                if !updated {
                    return Ok(());
                }
                (0, 1)
            }
            TagWord::ReplicaSelf { .. } | TagWord::Reserved => {
                return Err(CoherenceError::InvalidState {
                    pfn: pfn.as_u64(),
                    flags: 0,
                })
            }
        };

        self.replication.record_transition(old_count, new_count);

        if msb_index(new_count) >= self.replication.hotness_threshold() {
            self.replication.candidates.lock().push(pfn.as_u64());
        }
        Ok(())
    }

    /// Daemon loop body: drain the sample rings. Returns the number of
    /// samples that landed on coherence-managed pages.
    pub fn replication_poll(&self) -> usize {
        let mut useful = 0;
        while let Some(sample) = self.sampler.poll() {
            match self.handle_sample(sample) {
                Ok(()) => useful += 1,
                Err(err) => log::debug!(
                    "dropping sample va={:#x} pid={}: {}",
                    sample.va,
                    sample.pid,
                    err
                ),
            }
        }
        useful
    }

    /// Periodic sweep: evict cold replicas, replicate hot candidates, age
    /// the counters, retune the threshold, and cool the histogram.
    pub fn replication_sweep(&self) {
        let replication = &self.replication;
        let threshold = replication.hotness_threshold();

        // evict every listed replica that fell below the threshold
        let cold = self.replicas.claim_cold(threshold);
        let evicted = cold.len();
        for replica in cold {
            if let Err(err) = self.flush_replica(replica) {
                log::error!("failed to evict replica: {}", err);
            }
        }

        // filter candidates: only pages still lacking a replica qualify
        let mut candidates = {
            let mut list = replication.candidates.lock();
            core::mem::take(&mut *list)
        };
        candidates.sort_unstable();
        candidates.dedup();

        let mut replicated = 0;
        for raw_pfn in candidates {
            let pfn = crate::frame::Pfn::new(raw_pfn);
            let Some(frame) = self.frames.lookup(pfn) else {
                continue;
            };
            if self.replica_of(&frame).is_some() {
                continue;
            }
            match self.create_replica(&frame, 0) {
                Ok(()) => replicated += 1,
                Err(err) => log::debug!("not replicating pfn={:x}: {}", pfn, err),
            }
        }

        replication.monitoring_age.fetch_add(1, Ordering::AcqRel);

        let percentile = replication.hot_page_percentile.load(Ordering::Acquire);
        let new_threshold = replication.threshold_for_percentile(percentile);
        replication
            .hotness_threshold
            .store(new_threshold, Ordering::Release);

        replication.cool_down();

        log::info!(
            "replication sweep: evicted={}, replicated={}, threshold={}",
            evicted,
            replicated,
            new_threshold
        );
    }
}

/// Decay an access count by the number of epochs since it was last touched.
fn age_count(count: u32, last_epoch: u16, current_epoch: u16) -> u32 {
    if current_epoch > last_epoch {
        let shift = (current_epoch - last_epoch).min(31);
        count >> shift
    } else {
        count
    }
}
