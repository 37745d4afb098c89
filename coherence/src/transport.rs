//! Transport adapter
//!
//! The engine does not move bytes between hosts; a messaging module (the
//! shared-memory ring mapper) registers a [`Transport`] vtable at load time
//! and feeds inbound records to [`crate::engine::CoherenceEngine::dispatch_message`].
//! The registry is read-mostly: one lock taken for registration and teardown,
//! shared reads on every send.

use alloc::boxed::Box;

use spin::RwLock;

use crate::error::{CoherenceError, Result};
use crate::message::{Message, MessageKind, Payload};

/// Messaging primitives provided by the transport module.
pub trait Transport: Send + Sync {
    /// Name of the messaging implementation, for diagnostics.
    fn name(&self) -> &'static str;

    /// Number of hosts sharing the HDM window, including this one.
    fn node_count(&self) -> usize;

    /// Send one record to `dest_node`.
    fn unicast(&self, kind: MessageKind, ws_id: i32, dest_node: i32, payload: &Payload)
        -> Result<()>;

    /// Send one record to every other host.
    fn broadcast(&self, kind: MessageKind, ws_id: i32, payload: &Payload) -> Result<()>;

    /// Release hook invoked after an inbound record has been handled.
    fn done(&self, msg: &Message);
}

/// Holder for the registered transport vtable.
pub struct TransportRegistry {
    ops: RwLock<Option<Box<dyn Transport>>>,
}

impl TransportRegistry {
    pub const fn new() -> Self {
        Self {
            ops: RwLock::new(None),
        }
    }

    /// Install the messaging implementation. Fails with *busy* if one is
    /// already registered; the existing one is never overwritten.
    pub fn register(&self, transport: Box<dyn Transport>) -> Result<()> {
        let mut ops = self.ops.write();
        if let Some(existing) = ops.as_ref() {
            log::error!("transport ops already registered ({})", existing.name());
            return Err(CoherenceError::Busy {
                resource: "transport ops",
            });
        }
        log::info!("registered transport ops: {}", transport.name());
        *ops = Some(transport);
        Ok(())
    }

    pub fn unregister(&self) {
        let mut ops = self.ops.write();
        if let Some(existing) = ops.take() {
            log::info!("unregistered transport ops: {}", existing.name());
        }
    }

    pub fn is_registered(&self) -> bool {
        self.ops.read().is_some()
    }

    pub fn node_count(&self) -> Result<usize> {
        let ops = self.ops.read();
        match ops.as_ref() {
            Some(transport) => Ok(transport.node_count()),
            None => Err(CoherenceError::NotImplemented),
        }
    }

    pub fn unicast(
        &self,
        kind: MessageKind,
        ws_id: i32,
        dest_node: i32,
        payload: &Payload,
    ) -> Result<()> {
        let ops = self.ops.read();
        match ops.as_ref() {
            Some(transport) => transport.unicast(kind, ws_id, dest_node, payload),
            None => Err(CoherenceError::NotImplemented),
        }
    }

    pub fn broadcast(&self, kind: MessageKind, ws_id: i32, payload: &Payload) -> Result<()> {
        let ops = self.ops.read();
        match ops.as_ref() {
            Some(transport) => transport.broadcast(kind, ws_id, payload),
            None => Err(CoherenceError::NotImplemented),
        }
    }

    pub fn done(&self, msg: &Message) {
        let ops = self.ops.read();
        if let Some(transport) = ops.as_ref() {
            transport.done(msg);
        }
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}
