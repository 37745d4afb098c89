//! Async transaction completion
//!
//! Asynchronous fetches return to the faulter before their ACKs arrive; when
//! the last ACK lands, the response handler queues a completion record here
//! and a single worker finishes the job: drop the stale CPU cache lines over
//! the page and clear its modified bit, moving it out of the stale-shared
//! transient. A NACKed fetch is re-issued rather than dropped.

use alloc::collections::VecDeque;

use spin::Mutex;

use crate::engine::CoherenceEngine;
use crate::error::{CoherenceError, Result};
use crate::frame::{PageFlags, Pfn};

/// Capacity of the completion ring.
pub const ASYNC_RING_SIZE: usize = 1024;

/// One finished (or refused) async transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncWork {
    /// The page the fetch was issued for
    pub original: Pfn,
    /// A peer refused; the fetch must be retried
    pub nacked: bool,
}

/// Bounded queue feeding the completion worker.
pub struct AsyncCompletionQueue {
    queue: Mutex<VecDeque<AsyncWork>>,
}

impl AsyncCompletionQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a record; fails with *busy* when the ring is full.
    pub fn push(&self, work: AsyncWork) -> Result<()> {
        let mut queue = self.queue.lock();
        if queue.len() >= ASYNC_RING_SIZE {
            return Err(CoherenceError::Busy {
                resource: "async completion ring",
            });
        }
        queue.push_back(work);
        Ok(())
    }

    pub fn pop(&self) -> Option<AsyncWork> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl Default for AsyncCompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CoherenceEngine {
    /// Hand a finished async transaction to the worker. When the ring is
    /// full the finalization runs inline on the calling (message handler)
    /// thread, back-pressuring the issuers instead of dropping work.
    pub(crate) fn queue_async_completion(&self, work: AsyncWork) {
        if let Err(err) = self.async_queue.push(work) {
            log::error!(
                "async completion ring full ({}), finalizing pfn={:x} inline",
                err,
                work.original
            );
            self.finalize_async(work);
        }
    }

    /// Complete one async transaction.
    fn finalize_async(&self, work: AsyncWork) {
        if work.nacked {
            log::info!(
                "async fetch for pfn={:x} was NACKed, re-issuing",
                work.original
            );
            // retire the old registration before the retry installs its own
            self.async_inflight.lock().remove(&work.original.as_u64());
            if let Err(err) = self.issue_async_transaction(work.original) {
                log::error!("failed to re-issue async fetch: {}", err);
            }
            return;
        }

        // drop stale lines so subsequent reads observe the peer's writeback
        self.memory.flush_page_caches(work.original, 0);
        if let Some(frame) = self.frames.lookup(work.original) {
            frame.clear_flags(PageFlags::MODIFIED);
        }
        self.async_inflight.lock().remove(&work.original.as_u64());
        log::debug!("finalized async transaction for pfn={:x}", work.original);
    }

    /// Worker loop body: drain the completion ring. Returns the number of
    /// records processed.
    pub fn async_worker_tick(&self) -> usize {
        let mut processed = 0;
        while let Some(work) = self.async_queue.pop() {
            self.finalize_async(work);
            processed += 1;
        }
        processed
    }
}
