//! Replica page store
//!
//! A replica is a DRAM copy of a hot CXL page. The store owns every replica
//! in an arena of slots; the original page's tagged word carries the slot
//! index, the slot carries the original's PFN back, and the slot's intrusive
//! links place it on exactly one of the two LRU lists. Detaching a slot from
//! its list (a [`ClaimedReplica`]) is the exclusive claim required to flush
//! or re-age it, so reclaim, the replication daemon, and the shrinker cannot
//! free the same replica twice.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::engine::CoherenceEngine;
use crate::error::{CoherenceError, Result};
use crate::frame::{msb_index, PageFlags, PageFrame, PageMapping, Pfn, TagWord};
use crate::sync::Backoff;

/// Allocation attempts before giving up on a replica page.
pub const MAX_ALLOCATE_RETRIES: u32 = 3;

/// Which LRU list a slot is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LruList {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    On(LruList),
    Detached,
}

#[derive(Debug, Clone, Copy)]
struct LruLink {
    membership: Membership,
    prev: Option<usize>,
    next: Option<usize>,
}

impl LruLink {
    const DETACHED: Self = Self {
        membership: Membership::Detached,
        prev: None,
        next: None,
    };
}

/// One replica page.
#[derive(Debug)]
struct ReplicaSlot {
    /// DRAM frame backing the copy
    pfn: Pfn,
    order: u32,
    /// The CXL page this replicates
    original: Pfn,
    /// Mapping identity mirrored from the original
    mapping: Option<PageMapping>,
    /// Access payload (replica-self tagged word)
    tag: u64,
    link: LruLink,
}

/// Copyable description of a replica, for use outside the arena lock.
#[derive(Debug, Clone, Copy)]
pub struct ReplicaInfo {
    pub pfn: Pfn,
    pub order: u32,
    pub original: Pfn,
    pub mapping: Option<PageMapping>,
    pub access_count: u32,
    pub access_epoch: u16,
}

/// Exclusive claim over a detached replica slot.
///
/// Holding the token means the slot is off both LRU lists; only the holder
/// may flush it or put it back.
#[derive(Debug)]
pub struct ClaimedReplica {
    id: usize,
}

impl ClaimedReplica {
    pub fn id(&self) -> usize {
        self.id
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ListHead {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Option<ReplicaSlot>>,
    free: Vec<usize>,
    active: ListHead,
    inactive: ListHead,
}

impl Arena {
    fn list(&mut self, list: LruList) -> &mut ListHead {
        match list {
            LruList::Active => &mut self.active,
            LruList::Inactive => &mut self.inactive,
        }
    }

    fn slot(&self, id: usize) -> Option<&ReplicaSlot> {
        self.slots.get(id).and_then(|slot| slot.as_ref())
    }

    fn slot_mut(&mut self, id: usize) -> Option<&mut ReplicaSlot> {
        self.slots.get_mut(id).and_then(|slot| slot.as_mut())
    }

    /// Insert at the MRU end.
    fn push_front(&mut self, list: LruList, id: usize) {
        let old_head = self.list(list).head;
        if let Some(slot) = self.slot_mut(id) {
            slot.link = LruLink {
                membership: Membership::On(list),
                prev: None,
                next: old_head,
            };
        }
        if let Some(head) = old_head {
            if let Some(slot) = self.slot_mut(head) {
                slot.link.prev = Some(id);
            }
        } else {
            self.list(list).tail = Some(id);
        }
        let head_ref = self.list(list);
        head_ref.head = Some(id);
        head_ref.len += 1;
    }

    /// Remove from whichever list the slot is on.
    fn unlink(&mut self, id: usize) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let link = slot.link;
        let Membership::On(list) = link.membership else {
            return false;
        };

        match link.prev {
            Some(prev) => {
                if let Some(slot) = self.slot_mut(prev) {
                    slot.link.next = link.next;
                }
            }
            None => self.list(list).head = link.next,
        }
        match link.next {
            Some(next) => {
                if let Some(slot) = self.slot_mut(next) {
                    slot.link.prev = link.prev;
                }
            }
            None => self.list(list).tail = link.prev,
        }
        self.list(list).len -= 1;
        if let Some(slot) = self.slot_mut(id) {
            slot.link = LruLink::DETACHED;
        }
        true
    }

    fn insert(&mut self, slot: ReplicaSlot) -> usize {
        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(slot);
                id
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.push_front(LruList::Active, id);
        id
    }

    fn remove(&mut self, id: usize) -> Option<ReplicaSlot> {
        let slot = self.slots.get_mut(id)?.take()?;
        debug_assert_eq!(slot.link.membership, Membership::Detached);
        self.free.push(id);
        Some(slot)
    }
}

/// Arena of replica pages plus the two-list LRU, under one lock.
pub struct ReplicaStore {
    arena: Mutex<Arena>,
}

impl ReplicaStore {
    pub fn new() -> Self {
        Self {
            arena: Mutex::new(Arena::default()),
        }
    }

    pub fn len(&self) -> usize {
        let arena = self.arena.lock();
        arena.active.len + arena.inactive.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list_len(&self, list: LruList) -> usize {
        let mut arena = self.arena.lock();
        arena.list(list).len
    }

    /// Describe a slot if it still holds a replica of `original`.
    pub fn info_for(&self, id: usize, original: Pfn) -> Option<ReplicaInfo> {
        let arena = self.arena.lock();
        let slot = arena.slot(id)?;
        if slot.original != original {
            return None;
        }
        Some(describe(slot))
    }

    pub(crate) fn info(&self, id: usize) -> Option<ReplicaInfo> {
        let arena = self.arena.lock();
        arena.slot(id).map(describe)
    }

    /// Access payload of a slot.
    pub fn access(&self, id: usize) -> Option<(u32, u16)> {
        let arena = self.arena.lock();
        let slot = arena.slot(id)?;
        match TagWord::decode(slot.tag) {
            TagWord::ReplicaSelf { count, epoch } => Some((count, epoch)),
            _ => Some((0, 0)),
        }
    }

    pub fn set_access(&self, id: usize, count: u32, epoch: u16) {
        let mut arena = self.arena.lock();
        if let Some(slot) = arena.slot_mut(id) {
            slot.tag = TagWord::ReplicaSelf { count, epoch }.encode();
        }
    }

    /// Detach one slot, claiming it exclusively.
    pub fn claim(&self, id: usize) -> Option<ClaimedReplica> {
        let mut arena = self.arena.lock();
        if arena.unlink(id) {
            Some(ClaimedReplica { id })
        } else {
            None
        }
    }

    /// Detach up to `nr` slots from the cold (tail) end of `list`.
    pub fn claim_tail(&self, list: LruList, nr: usize) -> Vec<ClaimedReplica> {
        let mut arena = self.arena.lock();
        let mut claimed = Vec::new();
        while claimed.len() < nr {
            let Some(id) = arena.list(list).tail else {
                break;
            };
            arena.unlink(id);
            claimed.push(ClaimedReplica { id });
        }
        claimed
    }

    /// Detach every slot whose access-count MSB index is below `threshold`.
    pub fn claim_cold(&self, threshold: usize) -> Vec<ClaimedReplica> {
        let mut arena = self.arena.lock();
        let mut cold = Vec::new();
        for id in 0..arena.slots.len() {
            let Some(slot) = arena.slot(id) else {
                continue;
            };
            if matches!(slot.link.membership, Membership::Detached) {
                continue;
            }
            let count = match TagWord::decode(slot.tag) {
                TagWord::ReplicaSelf { count, .. } => count,
                _ => 0,
            };
            if msb_index(count) < threshold {
                arena.unlink(id);
                cold.push(ClaimedReplica { id });
            }
        }
        cold
    }

    /// Put a claimed slot back at the MRU end of `list`.
    pub fn reattach(&self, claimed: ClaimedReplica, list: LruList) {
        let mut arena = self.arena.lock();
        arena.push_front(list, claimed.id);
    }

    fn insert(&self, slot: ReplicaSlot) -> usize {
        self.arena.lock().insert(slot)
    }

    fn remove(&self, claimed: ClaimedReplica) -> Option<ReplicaSlot> {
        self.arena.lock().remove(claimed.id)
    }
}

impl Default for ReplicaStore {
    fn default() -> Self {
        Self::new()
    }
}

fn describe(slot: &ReplicaSlot) -> ReplicaInfo {
    let (access_count, access_epoch) = match TagWord::decode(slot.tag) {
        TagWord::ReplicaSelf { count, epoch } => (count, epoch),
        _ => (0, 0),
    };
    ReplicaInfo {
        pfn: slot.pfn,
        order: slot.order,
        original: slot.original,
        mapping: slot.mapping,
        access_count,
        access_epoch,
    }
}

// ---------------------------------------------------------------------------
// Replica lifecycle on the engine
// ---------------------------------------------------------------------------

impl CoherenceEngine {
    /// Arena slot of `frame`'s replica, validated against the back-pointer.
    pub fn replica_of(&self, frame: &PageFrame) -> Option<usize> {
        let id = frame.replica_slot()?;
        self.replicas.info_for(id, frame.pfn()).map(|_| id)
    }

    /// DRAM frame to map instead of the original, if a replica exists.
    pub fn replica_pfn(&self, frame: &PageFrame) -> Option<Pfn> {
        let id = frame.replica_slot()?;
        self.replicas.info_for(id, frame.pfn()).map(|info| info.pfn)
    }

    /// Original CXL frame behind a replica slot.
    pub fn original_of(&self, id: usize) -> Option<Pfn> {
        let info = self.replicas.info(id);
        if info.is_none() {
            log::error!("replica slot {} has no original back-pointer", id);
        }
        info.map(|info| info.original)
    }

    fn alloc_replica_pages(&self, order: u32) -> Result<Pfn> {
        let mut backoff = Backoff::new();
        for retry in 0..=MAX_ALLOCATE_RETRIES {
            match self.memory.alloc_pages(order) {
                Ok(pfn) => {
                    if retry > 0 {
                        log::info!("replica allocation succeeded after {} retries", retry);
                    }
                    self.stats.track_page_alloc(order);
                    return Ok(pfn);
                }
                Err(_) if retry < MAX_ALLOCATE_RETRIES => {
                    // ask the shrinker for a small, explicit batch before
                    // the next attempt
                    let target = if order == 0 { 1 } else { 16 };
                    log::info!(
                        "replica allocation failed (retry {}/{}), shrinking {} pages",
                        retry + 1,
                        MAX_ALLOCATE_RETRIES,
                        target
                    );
                    self.trigger_shrink(target);
                    backoff.snooze();
                }
                Err(err) => return Err(err),
            }
        }
        Err(CoherenceError::OutOfMemory {
            resource: "replica page",
        })
    }

    /// Create a DRAM replica of `frame` and unmap the original so future
    /// faults redirect onto the copy.
    pub fn create_replica(&self, frame: &Arc<PageFrame>, order: u32) -> Result<()> {
        if self.replica_of(frame).is_some() {
            return Err(CoherenceError::AlreadyReplicated {
                pfn: frame.pfn().as_u64(),
            });
        }

        let dram = self.alloc_replica_pages(order)?;
        self.memory.copy_page(frame.pfn(), dram, order);

        // a stale-shared original is mid-upgrade; replicating it would
        // capture data a peer is about to overwrite
        let flags = frame.flags();
        if flags.contains(PageFlags::MODIFIED | PageFlags::SHARED) {
            log::info!(
                "pfn {:x} is stale shared, skipping replication",
                frame.pfn()
            );
            self.memory.free_pages(dram, order);
            self.stats.track_page_free(order);
            return Err(CoherenceError::InvalidState {
                pfn: frame.pfn().as_u64(),
                flags: flags.bits(),
            });
        }

        let (count, epoch) = match frame.tag() {
            TagWord::Access { count, epoch } => (count, epoch),
            _ => (0, 0),
        };
        let mapping = frame.mapping();
        let id = self.replicas.insert(ReplicaSlot {
            pfn: dram,
            order,
            original: frame.pfn(),
            mapping,
            tag: TagWord::ReplicaSelf { count, epoch }.encode(),
            link: LruLink::DETACHED,
        });

        // unmap the original everywhere so the next access faults back in
        // and picks up the redirect
        if let Some(mapping) = mapping {
            self.vm
                .unmap_pages(mapping.mapping, mapping.index, 1 << order);
        }

        frame.set_tag(TagWord::ReplicaSlot(id));
        self.stats
            .replica_created_count
            .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        log::info!(
            "created replica (order={}, pfn={:x}, original_pfn={:x})",
            order,
            dram,
            frame.pfn()
        );
        Ok(())
    }

    /// Copy a replica's contents back into its original CXL page and clean
    /// the dirty state tracking it.
    pub fn writeback_replica(&self, frame: &PageFrame, id: usize) -> Result<()> {
        let info = self
            .replicas
            .info_for(id, frame.pfn())
            .ok_or(CoherenceError::NotFound { resource: "replica" })?;

        self.memory.copy_page(info.pfn, info.original, info.order);
        // order matters: the payload must be visible in HDM before any
        // metadata change that lets a peer read it
        self.memory.flush_page_caches(info.original, info.order);
        if let Some(mapping) = info.mapping {
            self.vm
                .clean_pages(mapping.mapping, mapping.index, 1 << info.order);
        }
        Ok(())
    }

    /// Refresh a replica from its original (after a FETCH completed).
    pub fn fetch_replica(&self, frame: &PageFrame) -> Result<()> {
        let id = frame
            .replica_slot()
            .ok_or(CoherenceError::NotFound { resource: "replica" })?;
        let info = self
            .replicas
            .info_for(id, frame.pfn())
            .ok_or(CoherenceError::NotFound { resource: "replica" })?;
        self.memory.copy_page(info.original, info.pfn, info.order);
        Ok(())
    }

    /// Tear a claimed replica down: write it back, restore the original's
    /// access tracking, unmap the copy, and free its DRAM. Terminal.
    pub fn flush_replica(&self, claimed: ClaimedReplica) -> Result<()> {
        let Some(info) = self.replicas.info(claimed.id()) else {
            return Err(CoherenceError::NotFound { resource: "replica" });
        };

        self.memory.copy_page(info.pfn, info.original, info.order);
        self.memory.flush_page_caches(info.original, info.order);

        // hand the access payload back to the original before the slot dies
        if let Some(frame) = self.frames.lookup(info.original) {
            frame.set_tag(TagWord::Access {
                count: info.access_count,
                epoch: info.access_epoch,
            });
            frame.set_mapping(info.mapping);
        }

        let removed = self.replicas.remove(claimed);
        debug_assert!(removed.is_some());

        if let Some(mapping) = info.mapping {
            self.vm
                .unmap_pages(mapping.mapping, mapping.index, 1 << info.order);
        }
        self.memory.free_pages(info.pfn, info.order);
        self.stats.track_page_free(info.order);
        log::debug!(
            "flushed replica pfn={:x} back to original {:x}",
            info.pfn,
            info.original
        );
        Ok(())
    }
}
