//! The per-instance bridge context.
//!
//! A [`Bridge`] owns every table for one guest instance: the handle table,
//! the raw registry, the arena, the published memory views, the transfer
//! slot, the capability imports and the diagnostic sink. Several bridges can
//! coexist; nothing is process-global.
//!
//! All state sits behind `Cell`/`RefCell`, and no borrow is held across a
//! call into the guest, because the guest may call straight back in.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use crate::arena::Arena;
use crate::capability::Capabilities;
use crate::codec;
use crate::diagnostics::{Abort, DiagnosticSink, Location, LogSink};
use crate::error::{BridgeError, BridgeResult};
use crate::guest::Guest;
use crate::handles::HandleTable;
use crate::memory::MemoryViews;
use crate::raw::RawRegistry;
use crate::slot::SLOT_SIZE;
use crate::string;
use crate::value::{Reference, Value};
use crate::BridgeConfig;

/// Bridge between the host runtime and one guest instance.
pub struct Bridge {
    guest: Rc<dyn Guest>,
    config: BridgeConfig,
    arena: Arena,
    views: RefCell<Option<MemoryViews>>,
    generation: Cell<u64>,
    handles: RefCell<HandleTable>,
    raw: RefCell<RawRegistry>,
    transfer: RefCell<Option<Value>>,
    capabilities: RefCell<Capabilities>,
    sink: Box<dyn DiagnosticSink>,
    started: Cell<bool>,
    dead: Cell<bool>,
}

impl Bridge {
    /// Create a bridge for `guest`.
    pub fn new(guest: Rc<dyn Guest>, config: BridgeConfig) -> Self {
        Bridge {
            guest,
            arena: Arena::new(config.arena_base),
            config,
            views: RefCell::new(None),
            generation: Cell::new(0),
            handles: RefCell::new(HandleTable::new()),
            raw: RefCell::new(RawRegistry::new()),
            transfer: RefCell::new(None),
            capabilities: RefCell::new(Capabilities::new()),
            sink: Box::new(LogSink),
            started: Cell::new(false),
            dead: Cell::new(false),
        }
    }

    /// Replace the diagnostic sink.
    pub fn with_sink<S: DiagnosticSink + 'static>(mut self, sink: S) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Replace the capability imports.
    pub fn with_capabilities(self, capabilities: Capabilities) -> Self {
        *self.capabilities.borrow_mut() = capabilities;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn guest(&self) -> &Rc<dyn Guest> {
        &self.guest
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Publish memory views and run the guest entry point. Runs once.
    pub fn start(&self) -> BridgeResult<()> {
        self.ensure_alive()?;
        if self.started.replace(true) {
            return Err(BridgeError::AlreadyStarted);
        }
        self.on_grow();
        log::debug!("[Bridge] starting guest ({} bytes of memory)", self.views().buffer().len());
        self.guest.main(self)
    }

    pub fn is_started(&self) -> bool {
        self.started.get()
    }

    /// Whether the guest aborted.
    pub fn is_dead(&self) -> bool {
        self.dead.get()
    }

    pub(crate) fn ensure_alive(&self) -> BridgeResult<()> {
        if self.dead.get() {
            return Err(BridgeError::InstanceDead);
        }
        Ok(())
    }

    // ── Memory ───────────────────────────────────────────────────────

    /// Republish all views over the guest's current buffer.
    pub fn on_grow(&self) {
        let buffer = self.guest.memory();
        let mut views = self.views.borrow_mut();
        let generation = match views.as_ref() {
            Some(_) => self.generation.get() + 1,
            None => 0,
        };
        self.generation.set(generation);
        log::debug!(
            "[Bridge] publishing memory views (generation {}, {} bytes)",
            generation,
            buffer.len()
        );
        *views = Some(MemoryViews::publish(buffer, generation));
    }

    /// The current memory views.
    ///
    /// Do not hold the result across anything that may allocate.
    pub fn views(&self) -> MemoryViews {
        let current = self.views.borrow().clone();
        match current {
            Some(views) => views,
            None => {
                self.on_grow();
                let published = self.views.borrow().clone();
                published.unwrap_or_else(|| MemoryViews::publish(self.guest.memory(), 0))
            }
        }
    }

    /// Allocate `size` bytes of guest memory.
    pub fn alloc(&self, size: u32) -> BridgeResult<u32> {
        self.arena.alloc(self, size)
    }

    // ── Values ───────────────────────────────────────────────────────

    /// Encode `value` into the slot at `address`.
    pub fn encode(&self, address: u32, value: &Value) -> BridgeResult<()> {
        codec::encode(self, address, value)
    }

    /// Decode the slot at `address`.
    pub fn decode(&self, address: u32) -> BridgeResult<Value> {
        codec::decode(self, address)
    }

    /// Allocate a slot and encode `value` into it.
    pub fn prepare_arg(&self, value: &Value) -> BridgeResult<u32> {
        let slot = self.alloc(SLOT_SIZE)?;
        self.encode(slot, value)?;
        Ok(slot)
    }

    /// Decode the slot at `address` and park it in the transfer slot.
    pub fn store_transfer(&self, address: u32) -> BridgeResult<()> {
        let value = self.decode(address)?;
        *self.transfer.borrow_mut() = Some(value);
        Ok(())
    }

    /// Take the parked value, leaving the transfer slot empty.
    pub fn take_transfer(&self) -> Option<Value> {
        self.transfer.borrow_mut().take()
    }

    /// Write `text` as a (ptr, len) pair at `address`.
    pub fn encode_string(&self, address: u32, text: &str) -> BridgeResult<()> {
        string::store(self, address, text)
    }

    /// Read `len` UTF-8 bytes at `ptr`.
    pub fn decode_string(&self, ptr: u32, len: u32) -> BridgeResult<String> {
        string::load(self, ptr, len)
    }

    // ── Handles ──────────────────────────────────────────────────────

    /// Lend `value` to the guest.
    pub fn acquire(&self, value: &Value) -> u32 {
        self.handles.borrow_mut().acquire(value)
    }

    /// Lend a copy of guest bytes `[ptr, end)` back to the guest as a host
    /// object.
    pub fn acquire_bytes(&self, ptr: u32, end: u32) -> BridgeResult<u32> {
        let len = end.checked_sub(ptr).ok_or(BridgeError::MemoryOutOfBounds {
            address: ptr,
            len: 0,
            size: end,
        })?;
        let bytes: Vec<u8> = self.views().buffer().read_vec(ptr, len)?;
        Ok(self.acquire(&Value::Reference(Reference::new(bytes))))
    }

    pub fn release(&self, id: u32) -> BridgeResult<()> {
        self.handles.borrow_mut().release(id)
    }

    pub fn increment(&self, id: u32) -> BridgeResult<()> {
        self.handles.borrow_mut().increment(id)
    }

    pub fn decrement(&self, id: u32) -> BridgeResult<()> {
        self.handles.borrow_mut().decrement(id)
    }

    /// Resolve a handle.
    pub fn get_handle(&self, id: u32) -> BridgeResult<Value> {
        self.handles.borrow().get(id)
    }

    pub fn handle_refcount(&self, id: u32) -> Option<u32> {
        self.handles.borrow().refcount(id)
    }

    /// Number of live handles.
    pub fn live_handles(&self) -> usize {
        self.handles.borrow().len()
    }

    // ── Raw values ───────────────────────────────────────────────────

    pub fn register_raw(&self, value: Value) -> u32 {
        self.raw.borrow_mut().register(value)
    }

    pub fn unregister_raw(&self, id: u32) -> Option<Value> {
        self.raw.borrow_mut().unregister(id)
    }

    pub fn get_raw(&self, id: u32) -> BridgeResult<Value> {
        self.raw.borrow().get(id)
    }

    // ── Capabilities ─────────────────────────────────────────────────

    /// Register a host function importable by the guest.
    pub fn add_capability<F>(&self, name: &str, f: F)
    where
        F: Fn(&Bridge, &[Value]) -> BridgeResult<Value> + 'static,
    {
        self.capabilities.borrow_mut().add_function(name, f);
    }

    /// Register a host function whose failure is reported as data.
    pub fn add_fallible_capability<F>(&self, name: &str, f: F)
    where
        F: Fn(&Bridge, &[Value]) -> Result<Value, Value> + 'static,
    {
        self.capabilities.borrow_mut().add_fallible(name, f);
    }

    /// Run the capability `name` on the decoded `args` slots and encode its
    /// result into `return_slot` (0 discards the result).
    pub fn invoke_capability(&self, name: &str, return_slot: u32, args: &[u32]) -> BridgeResult<()> {
        self.ensure_alive()?;
        let f = self
            .capabilities
            .borrow()
            .get(name)
            .ok_or_else(|| BridgeError::UnknownCapability(String::from(name)))?;

        let args = args
            .iter()
            .map(|&slot| self.decode(slot))
            .collect::<BridgeResult<Vec<Value>>>()?;
        log::trace!("[Bridge] capability {} with {} args", name, args.len());

        let result = f(self, &args)?;
        if return_slot != 0 {
            self.encode(return_slot, &result)?;
        }
        Ok(())
    }

    // ── Aborts ───────────────────────────────────────────────────────

    /// Report a guest abort and mark the instance dead.
    ///
    /// Returns the trap the caller should unwind the guest with.
    pub fn abort(&self, abort: Abort) -> BridgeError {
        self.sink.report(&abort);
        self.dead.set(true);
        self.transfer.borrow_mut().take();
        BridgeError::trap(alloc::format!("{}", abort))
    }

    /// Abort with location and message strings read from guest memory.
    ///
    /// A null or unreadable string is reported as absent.
    pub fn abort_from_guest(
        &self,
        file_ptr: u32,
        file_len: u32,
        line: u32,
        msg_ptr: u32,
        msg_len: u32,
    ) -> BridgeError {
        let read = |ptr: u32, len: u32| {
            if ptr == 0 {
                None
            } else {
                self.decode_string(ptr, len).ok()
            }
        };
        let location = read(file_ptr, file_len).map(|file| Location { file, line });
        let message = read(msg_ptr, msg_len);
        self.abort(Abort { location, message })
    }
}

// ── Tests ────────────────────────────────────────────────────────────
