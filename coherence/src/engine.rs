//! Coherence engine core
//!
//! Combines the page's current state with the fault intent through a 32-row
//! decision table, issues fetch/invalidate transactions over the transport,
//! and redirects the faulter onto a replica frame when one exists. One
//! [`CoherenceEngine`] instance exists per host, constructed at subsystem
//! init with the platform traits the embedding kernel provides.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::async_work::AsyncCompletionQueue;
use crate::error::{CoherenceError, Result};
use crate::fault::{FaultHandle, FaultTable, HandleFlags, LocalBegin};
use crate::frame::{FrameTable, MappingId, PageFlags, PageFrame, Pfn, PAGE_SHIFT};
use crate::message::{MessageKind, Payload};
use crate::replication::ReplicationState;
use crate::replica::ReplicaStore;
use crate::stats::CoherenceStats;
use crate::sync::Backoff;
use crate::transport::TransportRegistry;
use crate::vm::{PageMemory, SampleSource, VmPages};
use crate::wait_station::{WaitStationPool, WaitOutcome, WAIT_STATION_THRESHOLD};

/// Broadcast attempts before a transport failure is surfaced to the fault.
const BROADCAST_MAX_RETRIES: u32 = 10;

/// Wait-station rental attempts before a fault reports exhaustion.
const WS_ACQUIRE_MAX_RETRIES: u32 = 64;

/// File-name suffixes of filesystem metadata that must never go through the
/// coherence engine.
const BYPASS_PATTERNS: [&str; 2] = [".log", ".superblock"];

bitflags! {
    /// Steps a fault executes, in fixed order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Actions: u32 {
        /// Recompute and store shared/modified on the original
        const UPDATE_METADATA = 0x01;
        /// Broadcast and wait for every ACK before proceeding
        const SYNC_TRANSACTION = 0x02;
        /// Broadcast and return; completion arrives via the async worker
        const ASYNC_TRANSACTION = 0x04;
        /// Block for an already-issued async transaction on this PFN
        const WAIT_ASYNC = 0x08;
        /// Redirect the faulter onto the replica frame
        const MAP_REPLICA = 0x10;
        /// Copy replica DRAM back into CXL and clean dirty tracking
        const WRITEBACK = 0x20;
        /// Unmap every mapping of the page on this host
        const INVALIDATE = 0x40;
        /// Send the ACK/NACK
        const RESPOND = 0x80;
    }
}

const UPDATE: u32 = Actions::UPDATE_METADATA.bits();
const SYNC: u32 = Actions::SYNC_TRANSACTION.bits();
const ASYNC: u32 = Actions::ASYNC_TRANSACTION.bits();
const WAIT: u32 = Actions::WAIT_ASYNC.bits();
const MAP: u32 = Actions::MAP_REPLICA.bits();
const WRITEBACK: u32 = Actions::WRITEBACK.bits();
const INVALIDATE: u32 = Actions::INVALIDATE.bits();
const RESPOND: u32 = Actions::RESPOND.bits();
const INVALID: u32 = 0;

/// Decision table indexed by the low five handle-flag bits:
/// S (shared), M (modified), W (write fault), R (replicated), plus the
/// remote bit selecting the second half. `M S` together is the stale-shared
/// transient; `R W M S` is forbidden.
const ACTION_TABLE: [u32; 32] = [
    /* local fault */
    /* - - - - */ ASYNC | UPDATE | MAP,
    /* - - - S */ MAP,
    /* - - M - */ MAP,
    /* - - M S */ MAP,
    /* - W - - */ SYNC | UPDATE | MAP,
    /* - W - S */ SYNC | UPDATE,
    /* - W M - */ MAP,
    /* - W M S */ WAIT | SYNC | UPDATE | MAP,
    /* R - - - */ SYNC | UPDATE | MAP,
    /* R - - S */ MAP,
    /* R - M - */ MAP,
    /* R - M S */ INVALID,
    /* R W - - */ SYNC | UPDATE | MAP,
    /* R W - S */ SYNC | UPDATE | MAP,
    /* R W M - */ MAP,
    /* R W M S */ INVALID,
    /* remote fault */
    /* - - - - */ RESPOND,
    /* - - - S */ RESPOND,
    /* - - M - */ RESPOND | WRITEBACK | UPDATE,
    /* - - M S */ RESPOND,
    /* - W - - */ RESPOND,
    /* - W - S */ RESPOND | INVALIDATE | UPDATE,
    /* - W M - */ RESPOND | WRITEBACK | INVALIDATE | UPDATE,
    /* - W M S */ RESPOND | INVALIDATE | UPDATE,
    /* R - - - */ RESPOND,
    /* R - - S */ RESPOND,
    /* R - M - */ RESPOND | WRITEBACK | UPDATE,
    /* R - M S */ RESPOND,
    /* R W - - */ RESPOND,
    /* R W - S */ RESPOND | INVALIDATE | UPDATE,
    /* R W M - */ RESPOND | INVALIDATE | WRITEBACK | UPDATE,
    /* R W M S */ INVALID,
];

/// Actions for a fault with the given flag word. Empty means the state is
/// forbidden.
pub fn action_for(flags: HandleFlags) -> Actions {
    Actions::from_bits_truncate(ACTION_TABLE[(flags.bits() & 0x1f) as usize])
}

/// Engine construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Physical base address of the shared HDM window
    pub cxl_hdm_base: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            // placeholder base; the HDM mapper overrides it at attach time
            cxl_hdm_base: 0x1e_8000_0000,
        }
    }
}

/// A fault forwarded by the DAX filesystem.
#[derive(Debug, Clone, Copy)]
pub struct PageFault<'a> {
    /// CXL frame the filesystem resolved the file offset to
    pub pfn: Pfn,
    /// Name of the faulting file, for the metadata bypass
    pub file_name: &'a str,
    /// Address-space identity of the file
    pub mapping: MappingId,
    /// Page index within the file
    pub index: u64,
    /// Write fault?
    pub is_write: bool,
    /// 0 for a base page fault, the huge order for a PMD fault
    pub order: u32,
}

/// What the filesystem should do with the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// Not a coherence-managed fault; install the original frame untouched
    Bypass,
    /// Install this frame (the original, or its replica)
    Mapped(Pfn),
    /// Drop the filesystem lease and re-execute the fault
    Retry,
}

/// Per-host coherence engine singleton.
pub struct CoherenceEngine {
    cxl_base: AtomicU64,
    enabled: AtomicBool,
    pub(crate) frames: FrameTable,
    pub(crate) faults: FaultTable,
    pub(crate) stations: WaitStationPool,
    pub(crate) replicas: ReplicaStore,
    pub(crate) async_queue: AsyncCompletionQueue,
    pub(crate) replication: ReplicationState,
    pub(crate) stats: CoherenceStats,
    pub(crate) transport: TransportRegistry,
    /// Async transactions in flight, keyed by PFN
    pub(crate) async_inflight: Mutex<BTreeMap<u64, i32>>,
    /// Completed ACK responses; the write-vs-write priority key
    pub(crate) acked_fault_count: AtomicI64,
    /// Transactions issued but not yet fully acknowledged
    pub(crate) in_flight: AtomicI64,
    pub(crate) vm: Box<dyn VmPages>,
    pub(crate) memory: Box<dyn PageMemory>,
    pub(crate) sampler: Box<dyn SampleSource>,
}

impl CoherenceEngine {
    pub fn new(
        config: EngineConfig,
        vm: Box<dyn VmPages>,
        memory: Box<dyn PageMemory>,
        sampler: Box<dyn SampleSource>,
    ) -> Self {
        Self {
            cxl_base: AtomicU64::new(config.cxl_hdm_base),
            enabled: AtomicBool::new(false),
            frames: FrameTable::new(),
            faults: FaultTable::new(),
            stations: WaitStationPool::new(),
            replicas: ReplicaStore::new(),
            async_queue: AsyncCompletionQueue::new(),
            replication: ReplicationState::new(),
            stats: CoherenceStats::new(),
            transport: TransportRegistry::new(),
            async_inflight: Mutex::new(BTreeMap::new()),
            acked_fault_count: AtomicI64::new(0),
            in_flight: AtomicI64::new(0),
            vm,
            memory,
            sampler,
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
        log::info!("page coherence enabled");
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        log::info!("page coherence disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_cxl_hdm_base(&self, base: u64) {
        self.cxl_base.store(base, Ordering::Release);
        log::info!("CXL HDM base address set to {:#x}", base);
    }

    pub fn cxl_hdm_base(&self) -> u64 {
        self.cxl_base.load(Ordering::Acquire)
    }

    pub fn cxl_base_pfn(&self) -> Pfn {
        Pfn::new(self.cxl_hdm_base() >> PAGE_SHIFT)
    }

    pub fn stats(&self) -> &CoherenceStats {
        &self.stats
    }

    pub fn transport(&self) -> &TransportRegistry {
        &self.transport
    }

    /// Snapshot of the page's coherence bits in handle-flag form.
    pub(crate) fn meta_flags(&self, frame: &PageFrame) -> HandleFlags {
        let mut flags = HandleFlags::empty();
        let page = frame.flags();
        if page.contains(PageFlags::SHARED) {
            flags |= HandleFlags::SHARED;
        }
        if page.contains(PageFlags::MODIFIED) {
            flags |= HandleFlags::MODIFIED;
        }
        if self.replica_of(frame).is_some() {
            flags |= HandleFlags::REPLICATED;
        }
        flags
    }

    /// Store the post-fault shared/modified bits on the original.
    pub(crate) fn update_metadata(&self, frame: &PageFrame, flags: HandleFlags) {
        if flags.contains(HandleFlags::REMOTE) {
            if flags.contains(HandleFlags::NEEDWRITE) {
                // peer takes exclusive ownership
                frame.clear_flags(PageFlags::MODIFIED | PageFlags::SHARED);
            } else {
                // downgrade M -> S alongside the peer's fetch
                frame.set_flags(PageFlags::SHARED);
                frame.clear_flags(PageFlags::MODIFIED);
            }
        } else if flags.contains(HandleFlags::NEEDWRITE) {
            frame.set_flags(PageFlags::MODIFIED);
            frame.clear_flags(PageFlags::SHARED);
        } else {
            frame.set_flags(PageFlags::SHARED);
            frame.clear_flags(PageFlags::MODIFIED);
        }
    }

    fn payload_for(&self, pfn: Pfn, order: u32) -> Payload {
        Payload {
            cxl_offset: pfn.cxl_offset(self.cxl_hdm_base()),
            page_order: order as i32,
            acked_fault_count: self.acked_fault_count.load(Ordering::Acquire),
        }
    }

    fn broadcast_with_retry(&self, kind: MessageKind, ws_id: i32, payload: &Payload) -> Result<()> {
        let mut backoff = Backoff::new();
        let mut last = CoherenceError::NotImplemented;
        for _ in 0..BROADCAST_MAX_RETRIES {
            match self.transport.broadcast(kind, ws_id, payload) {
                Ok(()) => return Ok(()),
                Err(err @ CoherenceError::NotImplemented) => return Err(err),
                Err(err) => {
                    log::info!("failed to broadcast {:?}: {}", kind, err);
                    last = err;
                    backoff.snooze();
                }
            }
        }
        Err(last)
    }

    /// Broadcast `kind` for `pfn` and block until every peer responded.
    /// A NACK unwinds as [`CoherenceError::Again`].
    pub(crate) fn broadcast_and_wait(&self, kind: MessageKind, pfn: Pfn, order: u32) -> Result<()> {
        let node_count = self.transport.node_count()?;
        if node_count <= 1 {
            return Ok(());
        }

        let payload = self.payload_for(pfn, order);
        let ws = self
            .stations
            .acquire_with_backoff(node_count as i32 - 1, WS_ACQUIRE_MAX_RETRIES)?;
        self.in_flight.fetch_add(1, Ordering::AcqRel);

        if let Err(err) = self.broadcast_with_retry(kind, ws.id(), &payload) {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            self.stations.release(ws);
            return Err(err);
        }

        let outcome = ws.wait();
        self.stations.release(ws);
        match outcome {
            WaitOutcome::Nacked => {
                log::info!("received NACK for {:?} on pfn={:x}", kind, pfn);
                Err(CoherenceError::Again)
            }
            WaitOutcome::Acked => Ok(()),
        }
    }

    /// Broadcast a FETCH for `pfn` and return immediately; the async worker
    /// finalizes the state change when the last ACK arrives.
    pub(crate) fn issue_async_transaction(&self, pfn: Pfn) -> Result<()> {
        let node_count = self.transport.node_count()?;
        if node_count <= 1 {
            return Ok(());
        }

        let payload = self.payload_for(pfn, 0);
        let ws = self
            .stations
            .acquire_with_backoff(node_count as i32 - 1, WS_ACQUIRE_MAX_RETRIES)?;

        // park the page before the first ACK can possibly arrive
        ws.set_async_page(pfn);
        let ws_id = ws.id();
        self.async_inflight.lock().insert(pfn.as_u64(), ws_id);
        self.in_flight.fetch_add(1, Ordering::AcqRel);

        if let Err(err) = self.broadcast_with_retry(MessageKind::Fetch, ws_id, &payload) {
            self.async_inflight.lock().remove(&pfn.as_u64());
            ws.take_async_page();
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            self.stations.release(ws);
            return Err(err);
        }
        Ok(())
    }

    /// Synchronous transaction for one fault: fetch to enter S, invalidate
    /// to enter M, then refresh the replica if the data just changed under
    /// it.
    pub(crate) fn issue_sync_transaction(
        &self,
        handle: &Arc<FaultHandle>,
        frame: &Arc<PageFrame>,
    ) -> Result<()> {
        let flags = handle.flags();

        if !flags.contains(HandleFlags::NEEDWRITE)
            && !flags.contains(HandleFlags::SHARED)
            && !flags.contains(HandleFlags::MODIFIED)
        {
            log::debug!("issuing GetS transaction for pfn={:x}", handle.pfn());
            self.broadcast_and_wait(MessageKind::Fetch, handle.pfn(), 0)?;
        }

        if flags.contains(HandleFlags::NEEDWRITE) && !flags.contains(HandleFlags::MODIFIED) {
            log::debug!("issuing GetM/upgrade transaction for pfn={:x}", handle.pfn());
            self.broadcast_and_wait(MessageKind::Invalidate, handle.pfn(), 0)?;
        }

        if flags.contains(HandleFlags::REPLICATED) && !flags.contains(HandleFlags::SHARED) {
            // a peer may have written the original since the replica was cut
            self.fetch_replica(frame)?;
        }
        Ok(())
    }

    /// Block until any in-flight async transaction for `pfn` has been
    /// finalized by the completion worker.
    pub(crate) fn wait_for_async_transaction(&self, pfn: Pfn) {
        let mut backoff = Backoff::new();
        while self.async_inflight.lock().contains_key(&pfn.as_u64()) {
            backoff.snooze();
        }
    }

    /// Whether new transactions must take the synchronous path to shed load.
    fn overloaded(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) > WAIT_STATION_THRESHOLD as i64
    }

    /// Fault interposer called by the DAX filesystem with the resolved CXL
    /// frame. Returns the frame to install, or asks for a re-execution.
    pub fn handle_fault(&self, fault: &PageFault<'_>) -> Result<FaultDisposition> {
        if !self.is_enabled() {
            return Ok(FaultDisposition::Bypass);
        }
        if fault.pfn < self.cxl_base_pfn() {
            return Ok(FaultDisposition::Bypass);
        }
        if BYPASS_PATTERNS
            .iter()
            .any(|pattern| fault.file_name.contains(pattern))
        {
            log::debug!(
                "metadata file access, skipping coherence for {}",
                fault.file_name
            );
            return Ok(FaultDisposition::Bypass);
        }

        self.stats.record_fault(fault.is_write);

        let frame = self.frames.frame(fault.pfn);
        frame.record_mapping(crate::frame::PageMapping {
            mapping: fault.mapping,
            index: fault.index,
        });

        let begin = self
            .faults
            .begin_local(fault.pfn, fault.is_write, || self.meta_flags(&frame))?;
        let handle = match begin {
            LocalBegin::Started(handle) => handle,
            LocalBegin::Retry => return Ok(FaultDisposition::Retry),
        };

        frame.set_flags(PageFlags::COHERENCE);

        let action = action_for(handle.flags());
        handle.set_action(action.bits());
        log::debug!(
            "fault pfn={:x} flags={:?} action={:?}",
            fault.pfn,
            handle.flags(),
            action
        );

        if action.is_empty() {
            log::error!(
                "invalid fault action for pfn={:x} (flags={:?})",
                fault.pfn,
                handle.flags()
            );
            let flags = handle.flags().bits();
            self.faults.finish_local(&handle);
            return Err(CoherenceError::InvalidState {
                pfn: fault.pfn.as_u64(),
                flags,
            });
        }

        if action.contains(Actions::WAIT_ASYNC) {
            log::debug!("waiting for async transaction on pfn={:x}", fault.pfn);
            self.wait_for_async_transaction(fault.pfn);
        }

        let promote = action.contains(Actions::ASYNC_TRANSACTION) && self.overloaded();
        if action.contains(Actions::SYNC_TRANSACTION) || promote {
            match self.issue_sync_transaction(&handle, &frame) {
                Ok(()) => {}
                Err(CoherenceError::Again) => {
                    self.faults.finish_local(&handle);
                    return Ok(FaultDisposition::Retry);
                }
                Err(err) => {
                    log::error!("coherence transaction failed: {}", err);
                    self.faults.finish_local(&handle);
                    return Err(err);
                }
            }
        } else if action.contains(Actions::ASYNC_TRANSACTION) {
            if let Err(err) = self.issue_async_transaction(fault.pfn) {
                log::error!("async coherence transaction failed: {}", err);
                self.faults.finish_local(&handle);
                return Err(err);
            }
        }

        if action.contains(Actions::UPDATE_METADATA) {
            self.update_metadata(&frame, handle.flags());
        }

        let mapped = if handle.flags().contains(HandleFlags::REPLICATED) {
            match self.replica_pfn(&frame) {
                Some(replica) => {
                    self.stats
                        .replica_found_count
                        .fetch_add(1, Ordering::Relaxed);
                    replica
                }
                None => fault.pfn,
            }
        } else {
            fault.pfn
        };

        if self.faults.finish_local(&handle) {
            log::debug!("local fault on pfn={:x} must be re-executed", fault.pfn);
            return Ok(FaultDisposition::Retry);
        }

        Ok(FaultDisposition::Mapped(mapped))
    }
}
