//! Bridge error types.
//!
//! Every variant is a protocol fault: a broken contract between the host
//! and the guest. Host capability failures are not errors; they travel as
//! data (see [`crate::capability::CapabilityOutcome`]).

use alloc::string::String;
use thiserror::Error;

use crate::closure::ClosureKind;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Bridge error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The guest used a handle id the table does not hold.
    #[error("unknown handle id {0}")]
    UnknownHandle(u32),

    /// The guest used a raw registry id that is not registered.
    #[error("unknown raw value id {0}")]
    UnknownRawValue(u32),

    /// A slot carried a kind tag outside the protocol.
    #[error("unrecognized value kind {0}")]
    InvalidKind(u8),

    /// A typed view slot carried an element kind outside 0..=7.
    #[error("unrecognized typed view element kind {0}")]
    InvalidElementKind(u32),

    /// A Fn or FnMut wrapper was called after it was dropped.
    #[error("already dropped {0} function called")]
    AlreadyDropped(ClosureKind),

    /// A FnOnce wrapper was called after it was called or dropped.
    #[error("already called or dropped FnOnce function called")]
    AlreadyCalledOrDropped,

    /// A non-reentrant wrapper was entered while a call was in flight.
    #[error("{0} function called multiple times concurrently")]
    CalledConcurrently(ClosureKind),

    /// Guest memory access outside the current buffer.
    #[error("memory access out of bounds: {address} + {len} > {size}")]
    MemoryOutOfBounds { address: u32, len: u32, size: u32 },

    /// An access was not aligned to its element size.
    #[error("misaligned access at {address} (alignment {align})")]
    Misaligned { address: u32, align: u32 },

    /// A payload address lies below the arena base.
    #[error("address {address} lies below arena base {base}")]
    OutsideArena { address: u32, base: u32 },

    /// The guest allocator could not satisfy a request.
    #[error("guest allocation of {0} bytes failed")]
    AllocationFailed(u32),

    /// Array/object nesting exceeded the configured limit.
    #[error("value nesting exceeds depth limit {0}")]
    DepthLimitExceeded(usize),

    /// No function lives at this index of the guest function table.
    #[error("no guest function at table index {0}")]
    UnknownFunction(u32),

    /// The guest trapped while executing.
    #[error("guest trap: {0}")]
    GuestTrap(String),

    /// The guest aborted earlier; the instance is dead.
    #[error("guest instance aborted and cannot be resumed")]
    InstanceDead,

    /// The startup entry point was already invoked.
    #[error("bridge already started")]
    AlreadyStarted,

    /// The guest imported a capability the host never registered.
    #[error("unknown capability '{0}'")]
    UnknownCapability(String),
}

impl BridgeError {
    /// Create a guest trap error.
    pub fn trap<S: Into<String>>(msg: S) -> Self {
        BridgeError::GuestTrap(msg.into())
    }

    /// Whether this fault comes from misuse of a closure wrapper.
    pub fn is_closure_fault(&self) -> bool {
        matches!(
            self,
            BridgeError::AlreadyDropped(_)
                | BridgeError::AlreadyCalledOrDropped
                | BridgeError::CalledConcurrently(_)
        )
    }
}
