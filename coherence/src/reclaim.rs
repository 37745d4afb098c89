//! Replica reclaim: two-list aging and the shrinker
//!
//! Replicas age through the classic two-list scheme. Reclaim scans the cold
//! tail of the inactive list, gives each page one last accessed-bit check,
//! and flushes the ones nobody touched; when the inactive list runs short,
//! pages are first aged off the active tail. The same scan backs the system
//! shrinker callback and the targeted shrink the replica allocator triggers
//! under memory pressure.

use crate::engine::CoherenceEngine;
use crate::replica::{ClaimedReplica, LruList};

/// Pages scanned when the shrinker does not say how many it wants.
pub const DEFAULT_SCAN_PAGES: usize = 1024;

/// The inactive list should hold at least this multiple of a reclaim request
/// before direct reclaim is worthwhile.
pub const INACTIVE_THRESHOLD_MULT: usize = 2;

/// Aging batch multiplier relative to the reclaim request.
pub const AGING_MULT: usize = 4;

/// Fraction of the active list the shrinker advertises as reclaimable.
pub const ACTIVE_TO_INACTIVE_RATIO: usize = 4;

/// Upper bound used when a sweep wants "the whole list".
pub const MAX_LIST_COUNT: usize = 1 << 20;

impl CoherenceEngine {
    /// One accessed-bit test over every PTE mapping the replica's file slot,
    /// clearing the bit as a side effect.
    fn replica_referenced(&self, claimed: &ClaimedReplica) -> bool {
        let Some(info) = self.replicas.info(claimed.id()) else {
            return false;
        };
        match info.mapping {
            Some(mapping) => self.vm.test_and_clear_young(mapping.mapping, mapping.index),
            None => false,
        }
    }

    /// Reclaim up to `nr` pages from the tail of the inactive list.
    ///
    /// Referenced pages get promoted back to the active MRU; the rest are
    /// flushed. Returns the number of replicas actually freed.
    pub fn reclaim_from_inactive(&self, nr: usize) -> usize {
        let claimed = self.replicas.claim_tail(LruList::Inactive, nr);
        let collected = claimed.len();
        let mut freed = 0;

        for replica in claimed {
            if self.replica_referenced(&replica) {
                // referenced: last-chance promotion back to active
                self.replicas.reattach(replica, LruList::Active);
                continue;
            }
            match self.flush_replica(replica) {
                Ok(()) => freed += 1,
                Err(err) => log::error!("failed to flush replica: {}", err),
            }
        }

        log::debug!("reclaimed {}/{} inactive replicas", freed, collected);
        freed
    }

    /// Age up to `nr` pages from the tail of the active list. Referenced
    /// pages stay at the active MRU; cold ones move to the inactive MRU.
    /// Returns the number of pages moved.
    pub fn age_active_to_inactive(&self, nr: usize) -> usize {
        let claimed = self.replicas.claim_tail(LruList::Active, nr);
        let mut aged = 0;

        for replica in claimed {
            if self.replica_referenced(&replica) {
                self.replicas.reattach(replica, LruList::Active);
            } else {
                self.replicas.reattach(replica, LruList::Inactive);
                aged += 1;
            }
        }

        log::debug!("aged {} replicas from active to inactive", aged);
        aged
    }

    /// Number of pages the shrinker may hope to free: the whole inactive
    /// list plus a fraction of the active one.
    pub fn shrink_count(&self) -> usize {
        self.replicas.list_len(LruList::Inactive)
            + self.replicas.list_len(LruList::Active) / ACTIVE_TO_INACTIVE_RATIO
    }

    /// Shrinker scan callback: free up to `nr_to_scan` replica pages,
    /// aging the active list first when the inactive list runs short.
    pub fn shrink_scan(&self, nr_to_scan: usize) -> usize {
        let nr_to_scan = if nr_to_scan == 0 {
            DEFAULT_SCAN_PAGES
        } else {
            nr_to_scan
        };
        let mut freed = 0;
        let mut free_mult = 1;
        let mut age_mult = 1;

        while freed < nr_to_scan {
            let inactive_len = self.replicas.list_len(LruList::Inactive);
            let active_len = self.replicas.list_len(LruList::Active);

            if active_len + inactive_len < nr_to_scan * INACTIVE_THRESHOLD_MULT {
                // not enough replicas to be worth scanning
                break;
            }

            if inactive_len >= nr_to_scan * INACTIVE_THRESHOLD_MULT {
                let got = self.reclaim_from_inactive(nr_to_scan * free_mult);
                free_mult *= 2;
                if got == 0 {
                    break;
                }
                freed += got;
                continue;
            }

            // the inactive list is short: age the active tail first
            let mut aged = 0;
            while aged < nr_to_scan * INACTIVE_THRESHOLD_MULT {
                let got = self.age_active_to_inactive(nr_to_scan * AGING_MULT * age_mult);
                if got == 0 || self.replicas.list_len(LruList::Active) == 0 {
                    break;
                }
                aged += got;
                age_mult *= 2;
            }

            if self.replicas.list_len(LruList::Inactive) >= nr_to_scan * INACTIVE_THRESHOLD_MULT {
                let got = self.reclaim_from_inactive(nr_to_scan * free_mult);
                free_mult *= 2;
                freed += got;
                if got == 0 {
                    break;
                }
            } else if aged == 0 {
                // no progress is possible; return what was achieved
                break;
            }
        }

        log::debug!("shrink scan freed {} replica pages", freed);
        freed
    }

    /// Targeted shrink used by the replica allocator between retries.
    pub fn trigger_shrink(&self, nr_to_free: usize) {
        let freed = self.shrink_scan(nr_to_free);
        log::info!("manual shrink: requested={}, freed={}", nr_to_free, freed);
    }

    /// Age the entire active list into the inactive list, then flush every
    /// inactive replica. Backs the `flush_replicas` syscall.
    pub fn flush_all_replicas(&self) -> usize {
        let aged = self.age_active_to_inactive(MAX_LIST_COUNT);
        log::info!("flush_replicas: aged {} pages", aged);

        let inactive_len = self.replicas.list_len(LruList::Inactive);
        let freed = self.reclaim_from_inactive(inactive_len);
        log::info!("flush_replicas: reclaimed {} pages", freed);
        freed
    }
}
