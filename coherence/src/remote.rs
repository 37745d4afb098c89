//! Remote fault handling and response routing
//!
//! Inbound records enter through [`CoherenceEngine::dispatch_message`]. Peer
//! FETCH/INVALIDATE requests run the remote side of the protocol: arbitrate
//! against any local fault in flight, then execute the granted action bits
//! in fixed order (writeback, invalidate, metadata, respond). ACK/NACK
//! responses are routed to their wait station; the response that empties a
//! station either wakes its synchronous waiter or hands the record to the
//! async completion worker.

use core::sync::atomic::Ordering;

use crate::async_work::AsyncWork;
use crate::engine::{action_for, Actions, CoherenceEngine};
use crate::error::{CoherenceError, Result};
use crate::fault::RemoteBegin;
use crate::frame::{PageFrame, Pfn, HUGE_PAGE_ORDER};
use crate::message::{Message, MessageKind};

impl CoherenceEngine {
    /// Process-wide inbound dispatcher. Routes a record by kind and invokes
    /// the transport's release hook once handling is done.
    pub fn dispatch_message(&self, msg: &Message) -> Result<()> {
        let result = self.route_message(msg);
        self.transport.done(msg);
        if let Err(err) = result {
            log::error!("dropping inbound message: {}", err);
        }
        result
    }

    fn route_message(&self, msg: &Message) -> Result<()> {
        match msg.kind()? {
            kind @ (MessageKind::Fetch | MessageKind::Invalidate) => {
                self.handle_fetch_or_invalidate(msg, kind)
            }
            kind @ (MessageKind::FetchAck
            | MessageKind::FetchNack
            | MessageKind::InvalidateAck
            | MessageKind::InvalidateNack) => self.handle_ack_or_nack(msg, kind),
            MessageKind::Error => self.handle_peer_error(msg),
        }
    }

    /// Write the host's copy of a page back toward the HDM: through the
    /// replica when one exists, otherwise by pushing the CPU cache lines of
    /// the original, then clean the dirty tracking either way.
    pub(crate) fn writeback_page(&self, frame: &PageFrame) {
        if let Some(id) = self.replica_of(frame) {
            if let Err(err) = self.writeback_replica(frame, id) {
                log::error!("writeback of replica for pfn={:x} failed: {}", frame.pfn(), err);
            }
            return;
        }
        self.memory.flush_page_caches(frame.pfn(), 0);
        if let Some(mapping) = frame.mapping() {
            self.vm.clean_pages(mapping.mapping, mapping.index, 1);
        }
    }

    fn handle_fetch_or_invalidate(&self, msg: &Message, kind: MessageKind) -> Result<()> {
        let payload = msg.payload();
        if payload.page_order != 0 && payload.page_order != HUGE_PAGE_ORDER as i32 {
            return Err(CoherenceError::InvalidMessage {
                reason: "unsupported page order",
            });
        }

        let pfn = Pfn::from_cxl_offset(self.cxl_hdm_base(), payload.cxl_offset);
        let is_write = kind == MessageKind::Invalidate;
        log::debug!(
            "remote {:?} for offset={:#x} (pfn={:x}) from node {}",
            kind,
            payload.cxl_offset,
            pfn,
            msg.from_node()
        );

        let frame = self.frames.frame(pfn);
        let local_acked = self.acked_fault_count.load(Ordering::Acquire);
        let begin = self.faults.begin_remote(
            pfn,
            is_write,
            payload.acked_fault_count,
            local_acked,
            msg.from_node(),
            msg.to_node(),
            || self.meta_flags(&frame),
        );

        let grant = match begin {
            RemoteBegin::Nack => {
                log::debug!("NACKing remote fault for pfn={:x}", pfn);
                return self.transport.unicast(
                    MessageKind::nack_for(is_write),
                    msg.ws_id(),
                    msg.from_node(),
                    &payload,
                );
            }
            RemoteBegin::Granted(grant) => grant,
        };

        let action = action_for(grant.flags);
        if action.is_empty() {
            log::error!(
                "invalid remote fault action for pfn={:x} (flags={:?})",
                pfn,
                grant.flags
            );
            let result = self.transport.unicast(
                MessageKind::ack_for(is_write),
                msg.ws_id(),
                msg.from_node(),
                &payload,
            );
            self.faults.finish_remote(&grant);
            return result;
        }

        if action.contains(Actions::WRITEBACK) {
            self.writeback_page(&frame);
        }

        if action.contains(Actions::INVALIDATE) {
            if let Some(mapping) = frame.mapping() {
                // unmap before the ACK so the peer never observes a live
                // stale mapping on this host
                self.vm.unmap_pages(mapping.mapping, mapping.index, 1);
            }
        }

        if action.contains(Actions::UPDATE_METADATA) {
            self.update_metadata(&frame, grant.flags);
        }

        let result = self.transport.unicast(
            MessageKind::ack_for(is_write),
            msg.ws_id(),
            msg.from_node(),
            &payload,
        );

        self.faults.finish_remote(&grant);
        result
    }

    fn handle_ack_or_nack(&self, msg: &Message, kind: MessageKind) -> Result<()> {
        let Some(ws) = self.stations.find(msg.ws_id()) else {
            log::warn!("response for stale wait station id {}", msg.ws_id());
            return Ok(());
        };

        let is_nack = kind.is_nack();
        if is_nack {
            log::info!("received {:?} for wait station {}", kind, msg.ws_id());
        }

        if self.stations.signal(ws, is_nack) {
            // last expected response for this transaction
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            self.acked_fault_count.fetch_add(1, Ordering::AcqRel);

            match ws.take_async_page() {
                Some(original) => {
                    let work = AsyncWork {
                        original,
                        nacked: ws.nacked(),
                    };
                    self.stations.release(ws);
                    self.queue_async_completion(work);
                }
                None => self.stations.complete(ws),
            }
        } else {
            log::debug!(
                "response received for wait station {}, {} still pending",
                msg.ws_id(),
                ws.pending()
            );
        }
        Ok(())
    }

    fn handle_peer_error(&self, msg: &Message) -> Result<()> {
        log::error!(
            "received error message from node {} for offset {:#x}",
            msg.from_node(),
            msg.payload().cxl_offset
        );
        Ok(())
    }
}
