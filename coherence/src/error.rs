//! Error types for the page coherence engine
//!
//! Every fallible operation in the crate returns [`Result`]. The variants map
//! onto the errno-style codes the surrounding kernel expects via
//! [`CoherenceError::to_errno`].

use core::fmt;

/// Coherence operation result type
pub type Result<T> = core::result::Result<T, CoherenceError>;

/// Main error type for the coherence engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "coherence errors must be handled, not silently discarded"]
pub enum CoherenceError {
    /// Allocation failed under memory pressure
    OutOfMemory {
        resource: &'static str,
    },
    /// Operation must be retried after the caller drops its locks
    /// (NACK received, or a conflicting fault won arbitration)
    Again,
    /// The protocol forbids the observed page state
    InvalidState {
        pfn: u64,
        flags: u32,
    },
    /// Inbound message failed validation
    InvalidMessage {
        reason: &'static str,
    },
    /// Resource is already registered or already exists
    Busy {
        resource: &'static str,
    },
    /// A replica already exists for this page
    AlreadyReplicated {
        pfn: u64,
    },
    /// No replica (or no such object) was found
    NotFound {
        resource: &'static str,
    },
    /// No transport implementation has been registered
    NotImplemented,
    /// The engine has not been initialized (or was shut down)
    NotInitialized,
    /// The transport reported a hard failure
    Transport {
        code: i32,
    },
    /// A bounded resource pool is exhausted
    Exhausted {
        resource: &'static str,
    },
    /// Internal invariant violation; indicates a programming error
    Fatal {
        reason: &'static str,
    },
}

impl CoherenceError {
    /// Static string description of the error
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutOfMemory { .. } => "Out of memory",
            Self::Again => "Operation must be retried",
            Self::InvalidState { .. } => "Invalid page state",
            Self::InvalidMessage { .. } => "Invalid message",
            Self::Busy { .. } => "Resource busy",
            Self::AlreadyReplicated { .. } => "Replica already exists",
            Self::NotFound { .. } => "Not found",
            Self::NotImplemented => "No implementation registered",
            Self::NotInitialized => "Engine not initialized",
            Self::Transport { .. } => "Transport failure",
            Self::Exhausted { .. } => "Resource pool exhausted",
            Self::Fatal { .. } => "Fatal internal error",
        }
    }

    /// Convert to an errno-style code for the syscall boundary
    pub fn to_errno(self) -> i32 {
        match self {
            Self::OutOfMemory { .. } => -12,      // ENOMEM
            Self::Again => -11,                   // EAGAIN
            Self::InvalidState { .. } => -22,     // EINVAL
            Self::InvalidMessage { .. } => -22,   // EINVAL
            Self::Busy { .. } => -16,             // EBUSY
            Self::AlreadyReplicated { .. } => -17, // EEXIST
            Self::NotFound { .. } => -2,          // ENOENT
            Self::NotImplemented => -38,          // ENOSYS
            Self::NotInitialized => -19,          // ENODEV
            Self::Transport { code } => code,
            Self::Exhausted { .. } => -11,        // EAGAIN
            Self::Fatal { .. } => -14,            // EFAULT
        }
    }
}

impl fmt::Display for CoherenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { resource } => write!(f, "out of memory allocating {}", resource),
            Self::InvalidState { pfn, flags } => {
                write!(f, "invalid state {:#x} for pfn {:#x}", flags, pfn)
            }
            Self::InvalidMessage { reason } => write!(f, "invalid message: {}", reason),
            Self::Busy { resource } => write!(f, "{} is busy", resource),
            Self::AlreadyReplicated { pfn } => write!(f, "pfn {:#x} already replicated", pfn),
            Self::NotFound { resource } => write!(f, "{} not found", resource),
            Self::Transport { code } => write!(f, "transport failure ({})", code),
            Self::Exhausted { resource } => write!(f, "{} exhausted", resource),
            Self::Fatal { reason } => write!(f, "fatal: {}", reason),
            _ => f.write_str(self.as_str()),
        }
    }
}
