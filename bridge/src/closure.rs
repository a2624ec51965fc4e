//! Guest closures as host callables.
//!
//! A guest closure crosses as (calling adapter, function pointer,
//! deallocator). The host wraps it in one of three callable types whose
//! contracts differ:
//!
//! | kind   | concurrent calls | calls        |
//! |--------|------------------|--------------|
//! | Fn     | allowed          | any number   |
//! | FnMut  | fault            | any number   |
//! | FnOnce | fault            | at most one  |
//!
//! Dropping a wrapper while one of its calls is in flight only queues the
//! drop; the call that brings the in-flight count back to zero performs it.

use alloc::rc::Rc;
use core::cell::Cell;
use core::fmt;

use crate::bridge::Bridge;
use crate::codec;
use crate::error::{BridgeError, BridgeResult};
use crate::guest::Signature;
use crate::slot::SLOT_SIZE;
use crate::value::Value;

/// Calling contract of a guest closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClosureKind {
    Fn,
    FnMut,
    FnOnce,
}

impl fmt::Display for ClosureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClosureKind::Fn => "Fn",
            ClosureKind::FnMut => "FnMut",
            ClosureKind::FnOnce => "FnOnce",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a wrapper. `Dropped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureState {
    Live,
    Dropped,
}

/// A host-callable wrapper around a guest closure.
pub trait Callable {
    /// Calling contract.
    fn kind(&self) -> ClosureKind;

    /// Invoke the guest closure with `args`.
    fn call(&self, bridge: &Bridge, args: &[Value]) -> BridgeResult<Value>;

    /// Release the guest closure. Idempotent.
    fn drop_closure(&self, bridge: &Bridge) -> BridgeResult<()>;

    /// Shared wrapper state.
    fn core(&self) -> &ClosureCore;
}

/// State shared by the three wrapper types.
pub struct ClosureCore {
    kind: ClosureKind,
    adapter: u32,
    pointer: Cell<u32>,
    deallocator: u32,
    in_flight: Cell<u32>,
    drop_queued: Cell<bool>,
    state: Cell<ClosureState>,
}

impl ClosureCore {
    fn new(kind: ClosureKind, adapter: u32, pointer: u32, deallocator: u32) -> Self {
        ClosureCore {
            kind,
            adapter,
            pointer: Cell::new(pointer),
            deallocator,
            in_flight: Cell::new(0),
            drop_queued: Cell::new(false),
            state: Cell::new(ClosureState::Live),
        }
    }

    /// Guest function pointer (0 once released or consumed).
    pub fn pointer(&self) -> u32 {
        self.pointer.get()
    }

    /// Number of calls currently executing.
    pub fn in_flight(&self) -> u32 {
        self.in_flight.get()
    }

    /// Whether a drop is waiting for in-flight calls to finish.
    pub fn drop_queued(&self) -> bool {
        self.drop_queued.get()
    }

    pub fn state(&self) -> ClosureState {
        self.state.get()
    }

    fn check_live(&self) -> BridgeResult<()> {
        if self.pointer.get() == 0 || self.drop_queued.get() {
            return Err(match self.kind {
                ClosureKind::FnOnce => BridgeError::AlreadyCalledOrDropped,
                kind => BridgeError::AlreadyDropped(kind),
            });
        }
        Ok(())
    }

    fn check_exclusive(&self) -> BridgeResult<()> {
        if self.in_flight.get() != 0 {
            return Err(BridgeError::CalledConcurrently(self.kind));
        }
        Ok(())
    }

    /// Marshal `args`, run the calling adapter and collect its result.
    fn dispatch(&self, bridge: &Bridge, pointer: u32, args: &[Value]) -> BridgeResult<Value> {
        let slot = bridge.alloc(SLOT_SIZE)?;
        codec::encode_array(bridge, slot, args)?;

        self.in_flight.set(self.in_flight.get() + 1);
        let result = bridge
            .guest()
            .call_indirect(bridge, self.adapter, Signature::Vii, &[pointer, slot]);
        self.in_flight.set(self.in_flight.get() - 1);

        // Take the parked value even on failure so it cannot answer a later call.
        let parked = bridge.take_transfer();
        let result = result.map(|()| parked.unwrap_or(Value::Undefined));

        if self.drop_queued.get() && self.in_flight.get() == 0 {
            log::debug!("[Bridge Closures] running deferred {} drop", self.kind);
            let dropped = self.release(bridge);
            let value = result?;
            dropped?;
            return Ok(value);
        }
        result
    }

    fn release(&self, bridge: &Bridge) -> BridgeResult<()> {
        if self.in_flight.get() != 0 {
            self.drop_queued.set(true);
            return Ok(());
        }
        if self.state.get() == ClosureState::Dropped {
            return Ok(());
        }

        self.state.set(ClosureState::Dropped);
        let pointer = self.pointer.replace(0);
        if pointer != 0 {
            log::debug!("[Bridge Closures] dropping {} closure {:#x}", self.kind, pointer);
            bridge
                .guest()
                .call_indirect(bridge, self.deallocator, Signature::Vi, &[pointer])?;
        }
        Ok(())
    }
}

impl Drop for ClosureCore {
    fn drop(&mut self) {
        if self.state.get() == ClosureState::Live && self.pointer.get() != 0 {
            log::warn!(
                "[Bridge Closures] {} closure {:#x} collected without being dropped",
                self.kind,
                self.pointer.get()
            );
        }
    }
}

// ── Wrapper types ────────────────────────────────────────────────────

/// Reentrant guest closure.
pub struct FnClosure(ClosureCore);

impl Callable for FnClosure {
    fn kind(&self) -> ClosureKind {
        ClosureKind::Fn
    }

    fn call(&self, bridge: &Bridge, args: &[Value]) -> BridgeResult<Value> {
        bridge.ensure_alive()?;
        self.0.check_live()?;
        self.0.dispatch(bridge, self.0.pointer(), args)
    }

    fn drop_closure(&self, bridge: &Bridge) -> BridgeResult<()> {
        self.0.release(bridge)
    }

    fn core(&self) -> &ClosureCore {
        &self.0
    }
}

/// Non-reentrant guest closure.
pub struct FnMutClosure(ClosureCore);

impl Callable for FnMutClosure {
    fn kind(&self) -> ClosureKind {
        ClosureKind::FnMut
    }

    fn call(&self, bridge: &Bridge, args: &[Value]) -> BridgeResult<Value> {
        bridge.ensure_alive()?;
        self.0.check_live()?;
        self.0.check_exclusive()?;
        self.0.dispatch(bridge, self.0.pointer(), args)
    }

    fn drop_closure(&self, bridge: &Bridge) -> BridgeResult<()> {
        self.0.release(bridge)
    }

    fn core(&self) -> &ClosureCore {
        &self.0
    }
}

/// Single-use guest closure.
///
/// The guest adapter consumes the closure, so the wrapper forgets its
/// pointer before dispatch and drop becomes a no-op from then on.
pub struct FnOnceClosure(ClosureCore);

impl Callable for FnOnceClosure {
    fn kind(&self) -> ClosureKind {
        ClosureKind::FnOnce
    }

    fn call(&self, bridge: &Bridge, args: &[Value]) -> BridgeResult<Value> {
        bridge.ensure_alive()?;
        self.0.check_live()?;
        let pointer = self.0.pointer.replace(0);
        self.0.state.set(ClosureState::Dropped);
        self.0.check_exclusive()?;
        self.0.dispatch(bridge, pointer, args)
    }

    fn drop_closure(&self, bridge: &Bridge) -> BridgeResult<()> {
        self.0.release(bridge)
    }

    fn core(&self) -> &ClosureCore {
        &self.0
    }
}

// ── Function ─────────────────────────────────────────────────────────

/// A guest closure as seen by the host. Clones share one wrapper.
#[derive(Clone)]
pub struct Function(Rc<dyn Callable>);

impl Function {
    /// Wrap a guest closure decoded from a function slot.
    pub fn from_guest(kind: ClosureKind, adapter: u32, pointer: u32, deallocator: u32) -> Self {
        log::debug!(
            "[Bridge Closures] wrapping {} closure {:#x} (adapter {}, deallocator {})",
            kind,
            pointer,
            adapter,
            deallocator
        );
        let core = ClosureCore::new(kind, adapter, pointer, deallocator);
        let callable: Rc<dyn Callable> = match kind {
            ClosureKind::Fn => Rc::new(FnClosure(core)),
            ClosureKind::FnMut => Rc::new(FnMutClosure(core)),
            ClosureKind::FnOnce => Rc::new(FnOnceClosure(core)),
        };
        Function(callable)
    }

    pub fn kind(&self) -> ClosureKind {
        self.0.kind()
    }

    /// Call the guest closure.
    pub fn call(&self, bridge: &Bridge, args: &[Value]) -> BridgeResult<Value> {
        self.0.call(bridge, args)
    }

    /// Release the guest closure, deferring while a call is in flight.
    pub fn release(&self, bridge: &Bridge) -> BridgeResult<()> {
        self.0.drop_closure(bridge)
    }

    pub fn state(&self) -> ClosureState {
        self.0.core().state()
    }

    pub fn in_flight(&self) -> u32 {
        self.0.core().in_flight()
    }

    pub fn drop_queued(&self) -> bool {
        self.0.core().drop_queued()
    }

    /// Guest function pointer (0 once released or consumed).
    pub fn pointer(&self) -> u32 {
        self.0.core().pointer()
    }

    /// Identity address.
    pub fn address(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for Function {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for Function {}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("kind", &self.kind())
            .field("pointer", &self.pointer())
            .field("state", &self.state())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::VecGuest;
    use crate::BridgeConfig;
    use alloc::vec;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    struct Fixture {
        guest: Rc<VecGuest>,
        bridge: Rc<Bridge>,
        adapter: u32,
        deallocator: u32,
        deallocated: Rc<RefCell<Vec<u32>>>,
    }

    /// Guest with an adapter that echoes the first argument back and a
    /// deallocator that records what it freed.
    fn fixture() -> Fixture {
        let guest = Rc::new(VecGuest::new(1));
        let bridge = Rc::new(Bridge::new(guest.clone(), BridgeConfig::default()));
        let adapter = guest.register(|bridge: &Bridge, args: &[u32]| {
            let first = match bridge.decode(args[1])? {
                Value::Array(items) => items.into_iter().next().unwrap_or(Value::Undefined),
                other => other,
            };
            let slot = bridge.prepare_arg(&first)?;
            bridge.store_transfer(slot)
        });
        let deallocated = Rc::new(RefCell::new(Vec::new()));
        let log = deallocated.clone();
        let deallocator = guest.register(move |_: &Bridge, args: &[u32]| {
            log.borrow_mut().push(args[0]);
            Ok(())
        });
        Fixture {
            guest,
            bridge,
            adapter,
            deallocator,
            deallocated,
        }
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(alloc::format!("{}", ClosureKind::FnMut), "FnMut");
    }

    #[test]
    fn test_fn_call_returns_transfer_value() {
        let fx = fixture();
        let f = Function::from_guest(ClosureKind::Fn, fx.adapter, 0x100, fx.deallocator);
        let result = f.call(&fx.bridge, &[Value::from(7)]).unwrap();
        assert_eq!(result, Value::from(7));
        assert_eq!(f.in_flight(), 0);
        f.release(&fx.bridge).unwrap();
    }

    #[test]
    fn test_drop_calls_deallocator_once() {
        let fx = fixture();
        let f = Function::from_guest(ClosureKind::FnMut, fx.adapter, 0x200, fx.deallocator);
        f.release(&fx.bridge).unwrap();
        f.release(&fx.bridge).unwrap();
        assert_eq!(*fx.deallocated.borrow(), vec![0x200]);
        assert_eq!(f.state(), ClosureState::Dropped);
        assert_eq!(
            f.call(&fx.bridge, &[]),
            Err(BridgeError::AlreadyDropped(ClosureKind::FnMut))
        );
    }

    #[test]
    fn test_fn_once_second_call_faults() {
        let fx = fixture();
        let f = Function::from_guest(ClosureKind::FnOnce, fx.adapter, 0x300, fx.deallocator);
        assert_eq!(f.call(&fx.bridge, &[Value::from(1)]).unwrap(), Value::from(1));
        assert_eq!(f.call(&fx.bridge, &[]), Err(BridgeError::AlreadyCalledOrDropped));
        // Drop after the call is a no-op: the adapter consumed the closure.
        f.release(&fx.bridge).unwrap();
        assert!(fx.deallocated.borrow().is_empty());
    }

    #[test]
    fn test_fn_once_dropped_before_call() {
        let fx = fixture();
        let f = Function::from_guest(ClosureKind::FnOnce, fx.adapter, 0x310, fx.deallocator);
        f.release(&fx.bridge).unwrap();
        assert_eq!(*fx.deallocated.borrow(), vec![0x310]);
        assert_eq!(f.call(&fx.bridge, &[]), Err(BridgeError::AlreadyCalledOrDropped));
    }

    #[test]
    fn test_reentrant_fn_mut_faults() {
        let fx = fixture();
        let slot: Rc<RefCell<Option<Function>>> = Rc::new(RefCell::new(None));
        let inner = slot.clone();
        let nested = Rc::new(RefCell::new(None));
        let nested_out = nested.clone();
        let adapter = fx.guest.register(move |bridge: &Bridge, _: &[u32]| {
            let f = inner.borrow().clone();
            if let Some(f) = f {
                *nested_out.borrow_mut() = Some(f.call(bridge, &[]));
            }
            Ok(())
        });

        let f = Function::from_guest(ClosureKind::FnMut, adapter, 0x400, fx.deallocator);
        *slot.borrow_mut() = Some(f.clone());
        assert_eq!(f.call(&fx.bridge, &[]).unwrap(), Value::Undefined);
        assert_eq!(
            nested.borrow_mut().take(),
            Some(Err(BridgeError::CalledConcurrently(ClosureKind::FnMut)))
        );
        slot.borrow_mut().take();
        f.release(&fx.bridge).unwrap();
    }

    #[test]
    fn test_failed_call_restores_in_flight() {
        let fx = fixture();
        let f = Function::from_guest(ClosureKind::FnMut, 999, 0x500, fx.deallocator);
        assert_eq!(f.call(&fx.bridge, &[]), Err(BridgeError::UnknownFunction(999)));
        assert_eq!(f.in_flight(), 0);
        // Still callable after a failed call.
        assert_eq!(f.call(&fx.bridge, &[]), Err(BridgeError::UnknownFunction(999)));
        f.release(&fx.bridge).unwrap();
        assert_eq!(*fx.deallocated.borrow(), vec![0x500]);
    }

    #[test]
    fn test_failed_call_discards_parked_value() {
        let fx = fixture();
        let fail = Rc::new(Cell::new(true));
        let failing = fail.clone();
        // Parks a value and then traps while `fail` is set; otherwise
        // returns without storing anything.
        let adapter = fx.guest.register(move |bridge: &Bridge, _: &[u32]| {
            if failing.get() {
                let slot = bridge.prepare_arg(&Value::string("stale"))?;
                bridge.store_transfer(slot)?;
                return Err(BridgeError::trap("adapter trapped"));
            }
            Ok(())
        });

        let f = Function::from_guest(ClosureKind::Fn, adapter, 0x600, fx.deallocator);
        assert_eq!(
            f.call(&fx.bridge, &[]),
            Err(BridgeError::trap("adapter trapped"))
        );
        assert_eq!(fx.bridge.take_transfer(), None);

        fail.set(false);
        assert_eq!(f.call(&fx.bridge, &[]).unwrap(), Value::Undefined);
        f.release(&fx.bridge).unwrap();
    }

    #[test]
    fn test_identity() {
        let f = Function::from_guest(ClosureKind::Fn, 1, 0, 2);
        let g = Function::from_guest(ClosureKind::Fn, 1, 0, 2);
        assert_eq!(f, f.clone());
        assert_ne!(f, g);
    }
}
