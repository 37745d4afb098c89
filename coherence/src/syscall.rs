//! Syscall surface
//!
//! Thin errno-style wrappers over the engine singleton, matching the system
//! call handlers the kernel exposes to user space. Each returns 0 on success
//! or a negative errno.

use crate::error::CoherenceError;

fn with_engine(f: impl FnOnce(&crate::CoherenceEngine) -> i32) -> i32 {
    match crate::engine() {
        Ok(engine) => f(&engine),
        Err(err) => err.to_errno(),
    }
}

/// Turn the fault interposer on.
pub fn sys_enable_page_coherence() -> i32 {
    with_engine(|engine| {
        engine.enable();
        0
    })
}

/// Turn the fault interposer off; faults fall through untouched.
pub fn sys_disable_page_coherence() -> i32 {
    with_engine(|engine| {
        engine.disable();
        0
    })
}

/// Age the whole active list into the inactive list, then flush every
/// inactive replica back to the HDM.
pub fn sys_flush_replicas() -> i32 {
    with_engine(|engine| {
        engine.flush_all_replicas();
        0
    })
}

/// Start the replication daemon.
pub fn sys_replication_start(sampling_interval: i32, hot_page_percentage: i32) -> i32 {
    if sampling_interval < 0 || !(0..=100).contains(&hot_page_percentage) {
        return CoherenceError::InvalidMessage {
            reason: "bad replication parameters",
        }
        .to_errno();
    }
    with_engine(
        |engine| match engine.replication_start(sampling_interval as u32, hot_page_percentage as u32)
        {
            Ok(()) => 0,
            Err(err) => err.to_errno(),
        },
    )
}

/// Stop the replication daemon.
pub fn sys_replication_stop() -> i32 {
    with_engine(|engine| {
        engine.replication_stop();
        0
    })
}
