//! Fault-handle table
//!
//! At most one fault, local or remote, may be in flight for a given PFN.
//! The table hashes PFNs over a fixed set of buckets, each under its own
//! lock; concurrent faulters on the same PFN park on the in-flight handle's
//! completion and re-execute once it finishes. A remote fault arriving while
//! a local one holds the handle goes through priority arbitration: writers
//! beat readers, and ties between writers are broken by the acked-fault
//! count (fewer completed ACKs wins), then by node id.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::error::{CoherenceError, Result};
use crate::frame::Pfn;
use crate::sync::Completion;

/// Number of hash buckets in the fault table.
pub const FAULT_HASH_SIZE: usize = 31;

/// Upper bound on simultaneously allocated handles.
const FAULT_HANDLE_CAP: usize = 4096;

bitflags! {
    /// State bits of an in-flight fault. The low five bits index the
    /// decision table.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandleFlags: u32 {
        const SHARED = 0x01;
        const MODIFIED = 0x02;
        const NEEDWRITE = 0x04;
        const REPLICATED = 0x08;
        const REMOTE = 0x10;
        /// The parked local fault must re-execute after this one finishes
        const RETRY = 0x20;
    }
}

/// In-flight record for one faulting PFN.
pub struct FaultHandle {
    pfn: Pfn,
    flags: AtomicU32,
    action: AtomicU32,
    waiter: Mutex<Option<Arc<Completion>>>,
}

impl FaultHandle {
    fn new(pfn: Pfn, flags: HandleFlags) -> Self {
        Self {
            pfn,
            flags: AtomicU32::new(flags.bits()),
            action: AtomicU32::new(0),
            waiter: Mutex::new(None),
        }
    }

    pub fn pfn(&self) -> Pfn {
        self.pfn
    }

    pub fn flags(&self) -> HandleFlags {
        HandleFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, set: HandleFlags) {
        self.flags.fetch_or(set.bits(), Ordering::AcqRel);
    }

    pub fn is_write(&self) -> bool {
        self.flags().contains(HandleFlags::NEEDWRITE)
    }

    pub fn set_action(&self, action: u32) {
        self.action.store(action, Ordering::Release);
    }

    pub fn action(&self) -> u32 {
        self.action.load(Ordering::Acquire)
    }

    /// Park on this handle; concurrent waiters share one completion.
    fn park_waiter(&self) -> Arc<Completion> {
        let mut waiter = self.waiter.lock();
        match waiter.as_ref() {
            Some(completion) => Arc::clone(completion),
            None => {
                let completion = Arc::new(Completion::new());
                *waiter = Some(Arc::clone(&completion));
                completion
            }
        }
    }

    fn take_waiter(&self) -> Option<Arc<Completion>> {
        self.waiter.lock().take()
    }

    #[cfg(test)]
    fn has_waiter(&self) -> bool {
        self.waiter.lock().is_some()
    }
}

/// Result of entering the table for a local fault.
pub enum LocalBegin {
    /// This fault owns the handle and may proceed
    Started(Arc<FaultHandle>),
    /// A write fault just finished on this PFN; the caller must drop its
    /// filesystem lease and re-execute the fault
    Retry,
}

/// Grant returned to the remote handler.
pub struct RemoteGrant {
    /// Handle representing the PFN while the remote request executes
    pub handle: Arc<FaultHandle>,
    /// Flag view the remote actions are computed from
    pub flags: HandleFlags,
    /// The handle belongs to a concurrent local fault and must survive us
    preexisting_local: bool,
}

/// Result of entering the table for a remote fault.
pub enum RemoteBegin {
    Granted(RemoteGrant),
    /// Refuse the request; the peer will retry its fault
    Nack,
}

/// Hashed table of in-flight fault handles.
pub struct FaultTable {
    buckets: [Mutex<Vec<Arc<FaultHandle>>>; FAULT_HASH_SIZE],
    allocated: AtomicUsize,
}

/// True when the remote fault loses arbitration against the local one.
fn remote_loses(
    local_flags: HandleFlags,
    remote_is_write: bool,
    remote_acked: i64,
    local_acked: i64,
    remote_node: i32,
    local_node: i32,
) -> bool {
    let local_is_write = local_flags.contains(HandleFlags::NEEDWRITE);

    // writers starve readers to avoid livelock
    if !remote_is_write && local_is_write {
        return true;
    }

    if remote_is_write && local_is_write {
        // fewer completed ACKs means higher priority
        if remote_acked < local_acked {
            return false;
        }
        if remote_acked > local_acked {
            return true;
        }
        // equal counts: lower node id wins
        return local_node < remote_node;
    }

    false
}

impl FaultTable {
    pub fn new() -> Self {
        Self {
            buckets: core::array::from_fn(|_| Mutex::new(Vec::new())),
            allocated: AtomicUsize::new(0),
        }
    }

    fn bucket(&self, pfn: Pfn) -> &Mutex<Vec<Arc<FaultHandle>>> {
        &self.buckets[(pfn.as_u64() % FAULT_HASH_SIZE as u64) as usize]
    }

    fn alloc_handle(&self, pfn: Pfn, flags: HandleFlags) -> Result<Arc<FaultHandle>> {
        if self.allocated.fetch_add(1, Ordering::AcqRel) >= FAULT_HANDLE_CAP {
            self.allocated.fetch_sub(1, Ordering::AcqRel);
            return Err(CoherenceError::OutOfMemory {
                resource: "fault handle",
            });
        }
        Ok(Arc::new(FaultHandle::new(pfn, flags)))
    }

    fn remove(&self, handle: &Arc<FaultHandle>) {
        let mut bucket = self.bucket(handle.pfn()).lock();
        let before = bucket.len();
        bucket.retain(|entry| !Arc::ptr_eq(entry, handle));
        if bucket.len() < before {
            self.allocated.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Enter the table for a local fault. `meta` snapshots the page's
    /// current SHARED/MODIFIED/REPLICATED bits and is evaluated under the
    /// bucket lock.
    pub fn begin_local<F>(&self, pfn: Pfn, is_write: bool, meta: F) -> Result<LocalBegin>
    where
        F: Fn() -> HandleFlags,
    {
        loop {
            let existing = {
                let bucket = self.bucket(pfn).lock();
                bucket.iter().find(|fh| fh.pfn() == pfn).cloned()
            };

            let Some(holder) = existing else {
                let mut bucket = self.bucket(pfn).lock();
                // re-check under the lock; another faulter may have won
                if let Some(holder) = bucket.iter().find(|fh| fh.pfn() == pfn).cloned() {
                    drop(bucket);
                    self.wait_on(&holder);
                    if holder.is_write() {
                        return Ok(LocalBegin::Retry);
                    }
                    continue;
                }
                let mut flags = meta();
                flags.remove(HandleFlags::REMOTE | HandleFlags::RETRY | HandleFlags::NEEDWRITE);
                if is_write {
                    flags |= HandleFlags::NEEDWRITE;
                }
                let handle = self.alloc_handle(pfn, flags)?;
                bucket.push(Arc::clone(&handle));
                return Ok(LocalBegin::Started(handle));
            };

            log::debug!(
                "fault handle busy for pfn={:x} ({})",
                pfn,
                if holder.flags().contains(HandleFlags::REMOTE) {
                    "remote"
                } else {
                    "local"
                }
            );
            self.wait_on(&holder);
            // a finished write fault forces the waiter back out so the
            // filesystem lease can be reacquired
            if holder.is_write() {
                return Ok(LocalBegin::Retry);
            }
        }
    }

    /// Park on `holder` until it finishes. The completion slot is only
    /// installed while the handle is still in its bucket; a handle that
    /// finished in the meantime has no one left to signal it.
    fn wait_on(&self, holder: &Arc<FaultHandle>) {
        let completion = {
            let bucket = self.bucket(holder.pfn()).lock();
            if !bucket.iter().any(|fh| Arc::ptr_eq(fh, holder)) {
                return;
            }
            holder.park_waiter()
        };
        completion.wait();
        log::debug!("woke from fault handle for pfn={:x}", holder.pfn());
    }

    /// Leave the table after a local fault. Returns true when the fault must
    /// be re-executed (a higher-priority remote write ran concurrently).
    pub fn finish_local(&self, handle: &Arc<FaultHandle>) -> bool {
        let retry = handle.flags().contains(HandleFlags::RETRY);
        self.remove(handle);
        if let Some(completion) = handle.take_waiter() {
            completion.complete();
        }
        retry
    }

    /// Enter the table for a remote fault, arbitrating against any local
    /// fault in flight on the same PFN.
    #[allow(clippy::too_many_arguments)]
    pub fn begin_remote<F>(
        &self,
        pfn: Pfn,
        is_write: bool,
        remote_acked: i64,
        local_acked: i64,
        remote_node: i32,
        local_node: i32,
        meta: F,
    ) -> RemoteBegin
    where
        F: Fn() -> HandleFlags,
    {
        let mut bucket = self.bucket(pfn).lock();

        if let Some(holder) = bucket.iter().find(|fh| fh.pfn() == pfn).cloned() {
            if holder.flags().contains(HandleFlags::REMOTE) {
                // another remote fault is already being served
                return RemoteBegin::Nack;
            }
            if remote_loses(
                holder.flags(),
                is_write,
                remote_acked,
                local_acked,
                remote_node,
                local_node,
            ) {
                return RemoteBegin::Nack;
            }
            if is_write {
                // the local fault lost; make its waiter re-execute
                holder.set_flags(HandleFlags::RETRY);
            }
            let mut flags = meta() | HandleFlags::REMOTE;
            if is_write {
                flags |= HandleFlags::NEEDWRITE;
            }
            return RemoteBegin::Granted(RemoteGrant {
                handle: holder,
                flags,
                preexisting_local: true,
            });
        }

        let mut flags = meta() | HandleFlags::REMOTE;
        if is_write {
            flags |= HandleFlags::NEEDWRITE;
        }
        let Ok(handle) = self.alloc_handle(pfn, flags) else {
            return RemoteBegin::Nack;
        };
        bucket.push(Arc::clone(&handle));
        RemoteBegin::Granted(RemoteGrant {
            handle,
            flags,
            preexisting_local: false,
        })
    }

    /// Leave the table after a remote fault. Returns true when the handle
    /// was freed here; a handle borrowed from a concurrent local fault is
    /// left for the local path to destroy.
    pub fn finish_remote(&self, grant: &RemoteGrant) -> bool {
        if grant.preexisting_local {
            return false;
        }
        self.remove(&grant.handle);
        if let Some(completion) = grant.handle.take_waiter() {
            completion.complete();
        }
        true
    }

    /// Whether any fault is currently in flight for `pfn`.
    pub fn contains(&self, pfn: Pfn) -> bool {
        self.bucket(pfn).lock().iter().any(|fh| fh.pfn() == pfn)
    }

    pub fn in_flight(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }
}

impl Default for FaultTable {
    fn default() -> Self {
        Self::new()
    }
}
