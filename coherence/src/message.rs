//! Wire records for the peer-to-peer coherence protocol
//!
//! Messages are fixed 64-byte, cache-line-aligned records so a shared-memory
//! ring can carry them without marshalling: a four-word header (kind, wait
//! station id, source node, destination node) followed by the payload (HDM
//! offset, page order, and the sender's acked-fault count used for write
//! priority arbitration). All integers are little-endian on the wire.

use core::fmt;

use static_assertions::{assert_eq_size, const_assert_eq};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{CoherenceError, Result};
use crate::frame::CACHE_LINE_SIZE;

/// Message kinds understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageKind {
    Fetch = 0,
    FetchAck = 1,
    FetchNack = 2,
    Invalidate = 3,
    InvalidateAck = 4,
    InvalidateNack = 5,
    Error = 6,
}

impl MessageKind {
    /// ACK kind answering a fetch or invalidate request.
    pub fn ack_for(is_write: bool) -> Self {
        if is_write {
            Self::InvalidateAck
        } else {
            Self::FetchAck
        }
    }

    /// NACK kind answering a fetch or invalidate request.
    pub fn nack_for(is_write: bool) -> Self {
        if is_write {
            Self::InvalidateNack
        } else {
            Self::FetchNack
        }
    }

    pub fn is_nack(&self) -> bool {
        matches!(self, Self::FetchNack | Self::InvalidateNack)
    }
}

impl TryFrom<i32> for MessageKind {
    type Error = CoherenceError;

    fn try_from(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Fetch),
            1 => Ok(Self::FetchAck),
            2 => Ok(Self::FetchNack),
            3 => Ok(Self::Invalidate),
            4 => Ok(Self::InvalidateAck),
            5 => Ok(Self::InvalidateNack),
            6 => Ok(Self::Error),
            _ => Err(CoherenceError::InvalidMessage {
                reason: "unknown message kind",
            }),
        }
    }
}

/// Request payload carried by every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Payload {
    /// Byte offset of the page into the shared HDM window
    pub cxl_offset: u64,
    /// 0 for base pages, `HUGE_PAGE_ORDER` for huge pages
    pub page_order: i32,
    /// Sender's acked-fault count when the message was sent
    pub acked_fault_count: i64,
}

/// Raw 64-byte wire record.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(64))]
pub struct Message {
    kind: i32,
    ws_id: i32,
    from_node: i32,
    to_node: i32,
    cxl_offset: u64,
    page_order: i32,
    _pad: i32,
    acked_fault_count: i64,
    _reserved: [u8; 24],
}

assert_eq_size!(Message, [u8; CACHE_LINE_SIZE]);
const_assert_eq!(core::mem::align_of::<Message>(), CACHE_LINE_SIZE);

impl Message {
    pub fn new(kind: MessageKind, ws_id: i32, from_node: i32, to_node: i32, payload: &Payload) -> Self {
        Self {
            kind: kind as i32,
            ws_id,
            from_node,
            to_node,
            cxl_offset: payload.cxl_offset,
            page_order: payload.page_order,
            _pad: 0,
            acked_fault_count: payload.acked_fault_count,
            _reserved: [0; 24],
        }
    }

    /// Decoded message kind; fails on a corrupt record.
    pub fn kind(&self) -> Result<MessageKind> {
        MessageKind::try_from(self.kind)
    }

    pub fn ws_id(&self) -> i32 {
        self.ws_id
    }

    pub fn from_node(&self) -> i32 {
        self.from_node
    }

    pub fn to_node(&self) -> i32 {
        self.to_node
    }

    pub fn payload(&self) -> Payload {
        Payload {
            cxl_offset: self.cxl_offset,
            page_order: self.page_order,
            acked_fault_count: self.acked_fault_count,
        }
    }

    /// View the record as raw bytes for a shared-memory ring slot.
    pub fn as_bytes(&self) -> &[u8] {
        IntoBytes::as_bytes(self)
    }

    /// Reconstruct a record from a ring slot. The slice must be exactly one
    /// cache line; alignment is restored by copy.
    pub fn read_from(bytes: &[u8]) -> Result<Self> {
        Message::read_from_bytes(bytes).map_err(|_| CoherenceError::InvalidMessage {
            reason: "short or misaligned wire record",
        })
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("ws_id", &self.ws_id)
            .field("from_node", &self.from_node)
            .field("to_node", &self.to_node)
            .field("cxl_offset", &self.cxl_offset)
            .field("page_order", &self.page_order)
            .field("acked_fault_count", &self.acked_fault_count)
            .finish()
    }
}
