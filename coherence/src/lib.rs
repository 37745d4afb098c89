//! Software-managed page coherence for CXL shared device memory
//!
//! Multiple hosts map overlapping regions of a CXL host-managed device
//! memory (HDM) pool through a DAX filesystem. Hardware keeps each host's
//! caches coherent only locally, so this crate runs a directory-less,
//! peer-to-peer MESI-style protocol in software: it interposes on page
//! faults against CXL-backed files, broadcasts fetch/invalidate requests
//! over a shared-memory message ring, keeps DRAM replicas of hot read-shared
//! pages, and samples access patterns to decide what to replicate or evict.
//!
//! The crate is the protocol core. The DAX filesystem, the message-ring
//! transport, the page-table walkers, and the hardware sampler live in the
//! embedding kernel and are consumed through the traits in [`vm`] and
//! [`transport`].
//!
//! # Usage
//!
//! ```ignore
//! cxl_coherence::init(EngineConfig::default(), vm_ops, page_memory, sampler)?;
//! cxl_coherence::register_transport(ring_transport)?;
//! cxl_coherence::syscall::sys_enable_page_coherence();
//!
//! // DAX fault path:
//! match cxl_coherence::page_coherence_fault(&fault)? {
//!     FaultDisposition::Mapped(pfn) => install(pfn),
//!     FaultDisposition::Bypass => install(fault.pfn),
//!     FaultDisposition::Retry => return VM_FAULT_RETRY,
//! }
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod async_work;
pub mod engine;
pub mod error;
pub mod fault;
pub mod frame;
pub mod message;
pub mod reclaim;
mod remote;
pub mod replica;
pub mod replication;
pub mod stats;
pub mod sync;
pub mod syscall;
pub mod transport;
pub mod vm;
pub mod wait_station;

#[cfg(test)]
mod tests;

use alloc::boxed::Box;
use alloc::sync::Arc;

use spin::RwLock;

pub use engine::{CoherenceEngine, EngineConfig, FaultDisposition, PageFault};
pub use error::{CoherenceError, Result};
pub use frame::{MappingId, PageMapping, Pfn, HUGE_PAGE_ORDER, PAGE_SHIFT, PAGE_SIZE};
pub use message::{Message, MessageKind, Payload};
pub use stats::StatsSnapshot;
pub use transport::Transport;
pub use vm::{AccessSample, PageMemory, SampleSource, VmPages};

/// Process-wide engine singleton.
static ENGINE: RwLock<Option<Arc<CoherenceEngine>>> = RwLock::new(None);

/// Initialize the coherence subsystem with the platform hooks the embedding
/// kernel provides. Fails with *busy* if already initialized.
pub fn init(
    config: EngineConfig,
    vm: Box<dyn VmPages>,
    memory: Box<dyn PageMemory>,
    sampler: Box<dyn SampleSource>,
) -> Result<()> {
    let mut slot = ENGINE.write();
    if slot.is_some() {
        return Err(CoherenceError::Busy {
            resource: "coherence engine",
        });
    }
    *slot = Some(Arc::new(CoherenceEngine::new(config, vm, memory, sampler)));
    log::info!("page coherence subsystem initialized");
    Ok(())
}

/// Tear the subsystem down. The replication daemon must be stopped first.
pub fn shutdown() -> Result<()> {
    let mut slot = ENGINE.write();
    let engine = slot.take().ok_or(CoherenceError::NotInitialized)?;
    if engine.replication_running() {
        *slot = Some(engine);
        return Err(CoherenceError::Busy {
            resource: "replication daemon",
        });
    }
    engine.transport().unregister();
    log::info!("page coherence subsystem shut down");
    Ok(())
}

/// Handle to the engine singleton.
pub fn engine() -> Result<Arc<CoherenceEngine>> {
    ENGINE
        .read()
        .as_ref()
        .cloned()
        .ok_or(CoherenceError::NotInitialized)
}

/// Fault interposer called by the DAX filesystem. Before [`init`] the engine
/// stays out of the way and every fault passes through untouched.
pub fn page_coherence_fault(fault: &PageFault<'_>) -> Result<FaultDisposition> {
    match engine() {
        Ok(engine) => engine.handle_fault(fault),
        Err(_) => Ok(FaultDisposition::Bypass),
    }
}

/// Register the messaging implementation. Called by the transport module at
/// its own load time.
pub fn register_transport(transport: Box<dyn Transport>) -> Result<()> {
    engine()?.transport().register(transport)
}

/// Unregister the messaging implementation.
pub fn unregister_transport() -> Result<()> {
    engine()?.transport().unregister();
    Ok(())
}

/// Feed one inbound wire record to the dispatcher.
pub fn dispatch_message(msg: &Message) -> Result<()> {
    engine()?.dispatch_message(msg)
}

/// Set the physical base of the HDM window; called by the mapper module.
pub fn set_cxl_hdm_base(base: u64) {
    if let Ok(engine) = engine() {
        engine.set_cxl_hdm_base(base);
    }
}

/// Current HDM window base, or 0 before init.
pub fn get_cxl_hdm_base() -> u64 {
    engine().map(|engine| engine.cxl_hdm_base()).unwrap_or(0)
}
