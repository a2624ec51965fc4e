//! The guest side of the boundary.
//!
//! [`Guest`] is everything the bridge needs from the program running in
//! linear memory: its current memory buffer, an allocator, indirect calls
//! through its function table and a startup entry point.
//!
//! [`VecGuest`] is a guest backed by a host vector with a bump allocator and
//! a table of Rust closures. It grows in 64 KiB pages, detaching the old
//! buffer the way a real WASM memory does.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::memory::{LinearBuffer, PAGE_SIZE};

/// Signature of an indirect call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    /// `(i32) -> ()`
    Vi,
    /// `(i32, i32) -> ()`
    Vii,
}

impl Signature {
    /// Number of `i32` parameters.
    pub fn arity(self) -> usize {
        match self {
            Signature::Vi => 1,
            Signature::Vii => 2,
        }
    }
}

/// Interface the bridge requires from the guest.
pub trait Guest {
    /// The current backing buffer of guest memory.
    fn memory(&self) -> LinearBuffer;

    /// Allocate `size` bytes. Growth must be reported via [`Bridge::on_grow`].
    fn malloc(&self, bridge: &Bridge, size: u32) -> BridgeResult<u32>;

    /// Free a block returned by [`Guest::malloc`].
    ///
    /// The bridge never frees arena allocations itself: staged payloads
    /// belong to the guest once a call returns. This is the entry point the
    /// guest's own code and its embedder use to give them back.
    fn free(&self, bridge: &Bridge, ptr: u32, size: u32) -> BridgeResult<()>;

    /// Call the function at `index` of the guest function table.
    fn call_indirect(
        &self,
        bridge: &Bridge,
        index: u32,
        signature: Signature,
        args: &[u32],
    ) -> BridgeResult<()>;

    /// Run the startup entry point.
    fn main(&self, bridge: &Bridge) -> BridgeResult<()>;
}

/// A guest table function.
pub type GuestFn = Rc<dyn Fn(&Bridge, &[u32]) -> BridgeResult<()>>;

/// First address the bump allocator hands out.
pub const HEAP_BASE: u32 = 16;

const ALIGN: u32 = 8;

/// Vec-backed guest for embedding and tests.
pub struct VecGuest {
    memory: RefCell<LinearBuffer>,
    next: Cell<u32>,
    max_pages: u32,
    table: RefCell<Vec<Option<GuestFn>>>,
    entry: RefCell<Option<Rc<dyn Fn(&Bridge) -> BridgeResult<()>>>>,
    freed: Cell<u64>,
}

impl VecGuest {
    /// Create a guest with `initial_pages` pages of memory.
    pub fn new(initial_pages: u32) -> Self {
        VecGuest {
            memory: RefCell::new(LinearBuffer::new(initial_pages as usize * PAGE_SIZE)),
            next: Cell::new(HEAP_BASE),
            max_pages: 65536,
            // Index 0 is the null function pointer.
            table: RefCell::new(alloc::vec![None]),
            entry: RefCell::new(None),
            freed: Cell::new(0),
        }
    }

    /// Limit memory growth to `max_pages` pages.
    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Add a function to the table, returning its index.
    pub fn register<F>(&self, f: F) -> u32
    where
        F: Fn(&Bridge, &[u32]) -> BridgeResult<()> + 'static,
    {
        let mut table = self.table.borrow_mut();
        table.push(Some(Rc::new(f)));
        (table.len() - 1) as u32
    }

    /// Remove the function at `index`; later calls fault.
    pub fn unregister(&self, index: u32) {
        if let Some(slot) = self.table.borrow_mut().get_mut(index as usize) {
            *slot = None;
        }
    }

    /// Set the startup entry point.
    pub fn set_main<F>(&self, f: F)
    where
        F: Fn(&Bridge) -> BridgeResult<()> + 'static,
    {
        *self.entry.borrow_mut() = Some(Rc::new(f));
    }

    /// Current memory size in pages.
    pub fn pages(&self) -> u32 {
        self.memory.borrow().len() / PAGE_SIZE as u32
    }

    /// Next address the allocator would consider.
    pub fn heap_top(&self) -> u32 {
        self.next.get()
    }

    /// Bytes returned through [`Guest::free`].
    pub fn freed_bytes(&self) -> u64 {
        self.freed.get()
    }

    /// Grow memory by `delta` pages and notify the bridge.
    pub fn grow(&self, bridge: &Bridge, delta: u32) -> BridgeResult<()> {
        let pages = self.pages() + delta;
        if pages > self.max_pages {
            return Err(BridgeError::AllocationFailed(delta.saturating_mul(PAGE_SIZE as u32)));
        }
        let grown = self.memory.borrow().grow_into(pages as usize * PAGE_SIZE);
        *self.memory.borrow_mut() = grown;
        log::debug!("[Bridge Guest] memory grown to {} pages", pages);
        bridge.on_grow();
        Ok(())
    }
}

impl Guest for VecGuest {
    fn memory(&self) -> LinearBuffer {
        self.memory.borrow().clone()
    }

    fn malloc(&self, bridge: &Bridge, size: u32) -> BridgeResult<u32> {
        let start = (self.next.get() + ALIGN - 1) & !(ALIGN - 1);
        let end = start
            .checked_add(size)
            .ok_or(BridgeError::AllocationFailed(size))?;

        let len = self.memory.borrow().len();
        if end > len {
            let missing = (end - len) as usize;
            let delta = missing.div_ceil(PAGE_SIZE) as u32;
            self.grow(bridge, delta)
                .map_err(|_| BridgeError::AllocationFailed(size))?;
        }

        self.next.set(end);
        Ok(start)
    }

    fn free(&self, _bridge: &Bridge, _ptr: u32, size: u32) -> BridgeResult<()> {
        self.freed.set(self.freed.get() + size as u64);
        Ok(())
    }

    fn call_indirect(
        &self,
        bridge: &Bridge,
        index: u32,
        signature: Signature,
        args: &[u32],
    ) -> BridgeResult<()> {
        if args.len() != signature.arity() {
            return Err(BridgeError::trap("indirect call signature mismatch"));
        }
        let f = self
            .table
            .borrow()
            .get(index as usize)
            .cloned()
            .flatten()
            .ok_or(BridgeError::UnknownFunction(index))?;
        f(bridge, args)
    }

    fn main(&self, bridge: &Bridge) -> BridgeResult<()> {
        let entry = self.entry.borrow().clone();
        match entry {
            Some(f) => f(bridge),
            None => Ok(()),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
