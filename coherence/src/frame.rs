//! Per-page coherence metadata
//!
//! Every CXL page that faults through the engine gets a [`PageFrame`] record
//! in the engine-owned frame table. The frame carries the MESI-style state
//! bits, the mapping identity used for unmap/clean callbacks, and a 64-bit
//! tagged word that either points at the page's replica (by arena slot) or
//! holds the access-tracking payload consumed by the replication daemon.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Mutex;

/// Base page shift (4 KiB pages)
pub const PAGE_SHIFT: u32 = 12;
/// Base page size in bytes
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Order of the platform huge page (2 MiB)
pub const HUGE_PAGE_ORDER: u32 = 9;
/// Cache line size, also the wire record size
pub const CACHE_LINE_SIZE: usize = 64;

/// Physical page frame number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pfn(u64);

impl Pfn {
    pub const fn new(pfn: u64) -> Self {
        Self(pfn)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Byte offset of this frame into the shared HDM window.
    pub fn cxl_offset(&self, cxl_base: u64) -> u64 {
        (self.0 << PAGE_SHIFT).wrapping_sub(cxl_base)
    }

    /// Frame that backs `cxl_base + offset`.
    pub fn from_cxl_offset(cxl_base: u64, offset: u64) -> Self {
        Self((cxl_base.wrapping_add(offset)) >> PAGE_SHIFT)
    }
}

impl fmt::LowerHex for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Identity of the file (address space) a page belongs to. Opaque to the
/// engine; the VM layer resolves it back to the set of process mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MappingId(pub u64);

/// Where a page sits inside its file: mapping identity plus page index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMapping {
    pub mapping: MappingId,
    pub index: u64,
}

bitflags! {
    /// Coherence state bits stored on the page frame
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// This host may hold a clean, shareable copy
        const SHARED = 1 << 0;
        /// This host holds the only up-to-date copy
        const MODIFIED = 1 << 1;
        /// The page has been promoted into the coherence engine
        const COHERENCE = 1 << 2;
    }
}

// ---------------------------------------------------------------------------
// Tagged word
// ---------------------------------------------------------------------------

/// Low two bits of the tagged word select its interpretation.
const TAG_MASK: u64 = 0x3;
/// Upper bits hold a replica arena slot, stored as `(slot + 1) << 2` so the
/// all-zero word still reads as "untracked".
const TAG_SLOT: u64 = 0x0;
/// Upper 32 bits hold the access counter, bits 16..32 the last-aged epoch.
const TAG_ACCESS: u64 = 0x1;
/// This page is itself a replica.
const TAG_REPLICA_SELF: u64 = 0x2;

/// Decoded view of a page's tagged word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagWord {
    /// Nothing recorded yet
    Untracked,
    /// Original with a live replica in the given arena slot
    ReplicaSlot(usize),
    /// Access-tracking payload
    Access { count: u32, epoch: u16 },
    /// The page is a replica
    ReplicaSelf { count: u32, epoch: u16 },
    /// Reserved encoding; treated as corrupt
    Reserved,
}

impl TagWord {
    pub fn decode(word: u64) -> Self {
        if word == 0 {
            return Self::Untracked;
        }
        let count = (word >> 32) as u32;
        let epoch = ((word >> 16) & 0xffff) as u16;
        match word & TAG_MASK {
            TAG_SLOT => Self::ReplicaSlot(((word >> 2) - 1) as usize),
            TAG_ACCESS => Self::Access { count, epoch },
            TAG_REPLICA_SELF => Self::ReplicaSelf { count, epoch },
            _ => Self::Reserved,
        }
    }

    pub fn encode(&self) -> u64 {
        match *self {
            Self::Untracked => 0,
            Self::ReplicaSlot(slot) => ((slot as u64 + 1) << 2) | TAG_SLOT,
            Self::Access { count, epoch } => {
                ((count as u64) << 32) | ((epoch as u64) << 16) | TAG_ACCESS
            }
            Self::ReplicaSelf { count, epoch } => {
                ((count as u64) << 32) | ((epoch as u64) << 16) | TAG_REPLICA_SELF
            }
            Self::Reserved => TAG_MASK,
        }
    }
}

/// MSB index of an access count, clamped so a zero count lands in bin 0.
pub fn msb_index(count: u32) -> usize {
    if count == 0 {
        0
    } else {
        31 - count.leading_zeros() as usize
    }
}

// ---------------------------------------------------------------------------
// Page frame
// ---------------------------------------------------------------------------

/// Engine-side record for one coherence-managed CXL page.
pub struct PageFrame {
    pfn: Pfn,
    flags: AtomicU32,
    tag: AtomicU64,
    mapping: Mutex<Option<PageMapping>>,
}

impl PageFrame {
    fn new(pfn: Pfn) -> Self {
        Self {
            pfn,
            flags: AtomicU32::new(0),
            tag: AtomicU64::new(0),
            mapping: Mutex::new(None),
        }
    }

    pub fn pfn(&self) -> Pfn {
        self.pfn
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, set: PageFlags) {
        self.flags.fetch_or(set.bits(), Ordering::AcqRel);
    }

    pub fn clear_flags(&self, clear: PageFlags) {
        self.flags.fetch_and(!clear.bits(), Ordering::AcqRel);
    }

    pub fn is_shared(&self) -> bool {
        self.flags().contains(PageFlags::SHARED)
    }

    pub fn is_modified(&self) -> bool {
        self.flags().contains(PageFlags::MODIFIED)
    }

    pub fn is_coherence(&self) -> bool {
        self.flags().contains(PageFlags::COHERENCE)
    }

    pub fn tag(&self) -> TagWord {
        TagWord::decode(self.tag.load(Ordering::Acquire))
    }

    pub fn set_tag(&self, tag: TagWord) {
        self.tag.store(tag.encode(), Ordering::Release);
    }

    /// Compare-and-swap the raw tagged word. Used by the sampling path, which
    /// races with replica creation for the same word.
    pub fn update_tag(&self, old: TagWord, new: TagWord) -> bool {
        self.tag
            .compare_exchange(
                old.encode(),
                new.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Arena slot of this page's replica, if one is linked.
    pub fn replica_slot(&self) -> Option<usize> {
        match self.tag() {
            TagWord::ReplicaSlot(slot) => Some(slot),
            _ => None,
        }
    }

    pub fn mapping(&self) -> Option<PageMapping> {
        *self.mapping.lock()
    }

    /// Record the file mapping of this page, first faulter wins.
    pub fn record_mapping(&self, mapping: PageMapping) {
        let mut slot = self.mapping.lock();
        if slot.is_none() {
            *slot = Some(mapping);
        }
    }

    pub fn set_mapping(&self, mapping: Option<PageMapping>) {
        *self.mapping.lock() = mapping;
    }
}

impl fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFrame")
            .field("pfn", &self.pfn.as_u64())
            .field("flags", &self.flags())
            .field("tag", &self.tag())
            .field("mapping", &self.mapping())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Frame table
// ---------------------------------------------------------------------------

/// Engine-owned table of coherence-managed frames, keyed by PFN.
pub struct FrameTable {
    frames: Mutex<BTreeMap<u64, Arc<PageFrame>>>,
}

impl FrameTable {
    pub const fn new() -> Self {
        Self {
            frames: Mutex::new(BTreeMap::new()),
        }
    }

    /// Fetch the frame for `pfn`, creating the record on first use.
    pub fn frame(&self, pfn: Pfn) -> Arc<PageFrame> {
        let mut frames = self.frames.lock();
        frames
            .entry(pfn.as_u64())
            .or_insert_with(|| Arc::new(PageFrame::new(pfn)))
            .clone()
    }

    /// Fetch the frame for `pfn` only if it is already tracked.
    pub fn lookup(&self, pfn: Pfn) -> Option<Arc<PageFrame>> {
        self.frames.lock().get(&pfn.as_u64()).cloned()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}
