//! Wait-station pool
//!
//! A wait station is the rendezvous object for one outbound transaction: the
//! issuer rents a station, broadcasts its id, and either blocks on it (sync
//! path) or parks the faulting page in the async slot and returns. Each
//! inbound ACK/NACK decrements the pending counter; the response that drives
//! it to zero completes the rental.
//!
//! Station ids travel over the wire, so a generation counter is folded into
//! the id to fence stale responses that arrive after the station has been
//! recycled.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use spin::Mutex;

use crate::error::{CoherenceError, Result};
use crate::frame::Pfn;
use crate::sync::Backoff;

/// Hard cap on concurrently rented stations.
pub const MAX_WAIT_STATIONS: usize = 65536;

/// Past this many in-flight transactions, new ones must go synchronous to
/// shed load (80% of the pool).
pub const WAIT_STATION_THRESHOLD: usize = MAX_WAIT_STATIONS * 4 / 5;

/// Outcome of waiting on a station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Every peer acknowledged
    Acked,
    /// At least one peer refused
    Nacked,
}

/// One rendezvous station.
#[derive(Debug)]
pub struct WaitStation {
    index: u32,
    generation: AtomicU32,
    pending: AtomicI32,
    nacked: AtomicBool,
    done: AtomicBool,
    async_pfn: Mutex<Option<Pfn>>,
}

impl WaitStation {
    fn new(index: u32) -> Self {
        Self {
            index,
            generation: AtomicU32::new(0),
            pending: AtomicI32::new(0),
            nacked: AtomicBool::new(false),
            done: AtomicBool::new(false),
            async_pfn: Mutex::new(None),
        }
    }

    /// Wire id of the current rental: generation in the upper half, slot
    /// index in the lower 16 bits. Always non-negative.
    pub fn id(&self) -> i32 {
        let generation = self.generation.load(Ordering::Acquire) & 0x7fff;
        ((generation << 16) | self.index) as i32
    }

    /// Pages expected to respond that have not yet.
    pub fn pending(&self) -> i32 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn record_nack(&self) {
        self.nacked.store(true, Ordering::Release);
    }

    pub fn nacked(&self) -> bool {
        self.nacked.load(Ordering::Acquire)
    }

    /// Park the faulting page for an asynchronous transaction.
    pub fn set_async_page(&self, pfn: Pfn) {
        *self.async_pfn.lock() = Some(pfn);
    }

    /// Take the parked page, if this rental was asynchronous.
    pub fn take_async_page(&self) -> Option<Pfn> {
        self.async_pfn.lock().take()
    }

    /// Block until the last response arrives.
    pub fn wait(&self) -> WaitOutcome {
        let mut backoff = Backoff::new();
        while !self.done.load(Ordering::Acquire) {
            backoff.snooze();
        }
        if self.nacked() {
            WaitOutcome::Nacked
        } else {
            WaitOutcome::Acked
        }
    }

    fn reset(&self, expected: i32) {
        self.pending.store(expected, Ordering::Release);
        self.nacked.store(false, Ordering::Release);
        self.done.store(false, Ordering::Release);
        *self.async_pfn.lock() = None;
    }
}

/// Bounded pool of wait stations with O(1) id lookup.
pub struct WaitStationPool {
    stations: Vec<WaitStation>,
    free: Mutex<Vec<u32>>,
}

impl WaitStationPool {
    pub fn new() -> Self {
        Self::with_capacity(MAX_WAIT_STATIONS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut stations = Vec::with_capacity(capacity);
        for index in 0..capacity as u32 {
            stations.push(WaitStation::new(index));
        }
        // hand out low indices first
        let free = (0..capacity as u32).rev().collect();
        Self {
            stations,
            free: Mutex::new(free),
        }
    }

    /// Rent a station expecting `expected` responses.
    pub fn acquire(&self, expected: i32) -> Result<&WaitStation> {
        let index = self.free.lock().pop().ok_or(CoherenceError::Exhausted {
            resource: "wait stations",
        })?;
        let ws = &self.stations[index as usize];
        ws.reset(expected);
        Ok(ws)
    }

    /// Rent a station, spinning with backoff while the pool is exhausted.
    pub fn acquire_with_backoff(&self, expected: i32, max_retries: u32) -> Result<&WaitStation> {
        let mut backoff = Backoff::new();
        for _ in 0..max_retries {
            match self.acquire(expected) {
                Ok(ws) => return Ok(ws),
                Err(CoherenceError::Exhausted { .. }) => backoff.snooze(),
                Err(err) => return Err(err),
            }
        }
        Err(CoherenceError::Exhausted {
            resource: "wait stations",
        })
    }

    /// Return a station to the pool. Bumps the generation so responses still
    /// carrying the old wire id are dropped at [`WaitStationPool::find`].
    pub fn release(&self, ws: &WaitStation) {
        ws.generation.fetch_add(1, Ordering::AcqRel);
        *ws.async_pfn.lock() = None;
        let mut free = self.free.lock();
        if free.iter().any(|&index| index == ws.index) {
            // double release indicates a logic error upstream
            log::error!("wait station {} released twice", ws.index);
            return;
        }
        free.push(ws.index);
    }

    /// Look up the station a wire id refers to. Returns `None` when the
    /// rental has already been recycled.
    pub fn find(&self, wire_id: i32) -> Option<&WaitStation> {
        if wire_id < 0 {
            return None;
        }
        let index = (wire_id as u32) & 0xffff;
        let generation = (wire_id as u32) >> 16;
        let ws = self.stations.get(index as usize)?;
        if ws.generation.load(Ordering::Acquire) & 0x7fff != generation {
            return None;
        }
        Some(ws)
    }

    /// Decrement the pending count for one response; record NACKs. Returns
    /// true when this was the last expected response. The caller completes
    /// the rental (or hands it to the async worker) exactly once.
    pub fn signal(&self, ws: &WaitStation, is_nack: bool) -> bool {
        if is_nack {
            ws.record_nack();
        }
        ws.pending.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Wake the waiter blocked in [`WaitStation::wait`].
    pub fn complete(&self, ws: &WaitStation) {
        ws.done.store(true, Ordering::Release);
    }

    /// Stations currently rented out.
    pub fn in_use(&self) -> usize {
        self.stations.len() - self.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.stations.len()
    }
}

impl Default for WaitStationPool {
    fn default() -> Self {
        Self::new()
    }
}
