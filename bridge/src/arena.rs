//! Arena allocation in guest memory.
//!
//! Variable-length payloads (UTF-8 bytes, array and object element tables,
//! call arguments) are staged in memory obtained from the guest allocator.
//! The host never frees these blocks; reclaiming them is the guest's job.
//!
//! Array and object slots store their element tables as offsets relative to
//! the arena base rather than absolute addresses.

use core::cell::Cell;

use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult};

/// Bump-style staging area backed by the guest allocator.
#[derive(Debug)]
pub struct Arena {
    base: u32,
    allocations: Cell<u64>,
    bytes: Cell<u64>,
}

impl Arena {
    /// Create an arena whose offsets are measured from `base`.
    pub fn new(base: u32) -> Self {
        Arena {
            base,
            allocations: Cell::new(0),
            bytes: Cell::new(0),
        }
    }

    /// Guest address offsets are relative to.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Allocate `size` bytes through the guest allocator.
    ///
    /// May grow guest memory; views fetched before this call can be stale.
    pub fn alloc(&self, bridge: &Bridge, size: u32) -> BridgeResult<u32> {
        let address = bridge.guest().malloc(bridge, size)?;
        if address == 0 && size > 0 {
            return Err(BridgeError::AllocationFailed(size));
        }
        self.allocations.set(self.allocations.get() + 1);
        self.bytes.set(self.bytes.get() + size as u64);
        log::trace!("[Bridge Arena] alloc {} bytes at {:#x}", size, address);
        Ok(address)
    }

    /// Arena-relative offset of a guest address.
    pub fn offset(&self, address: u32) -> BridgeResult<u32> {
        address
            .checked_sub(self.base)
            .ok_or(BridgeError::OutsideArena {
                address,
                base: self.base,
            })
    }

    /// Guest address of an arena-relative offset.
    pub fn resolve(&self, offset: u32) -> u32 {
        self.base.saturating_add(offset)
    }

    /// Number of allocations served.
    pub fn allocations(&self) -> u64 {
        self.allocations.get()
    }

    /// Total bytes requested.
    pub fn allocated_bytes(&self) -> u64 {
        self.bytes.get()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
