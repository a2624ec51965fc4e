//! End-to-end scenarios through a vec-backed guest.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use kpio_bridge::codec;
use kpio_bridge::slot::{KIND_OFFSET, SLOT_SIZE};
use kpio_bridge::{
    Bridge, BridgeConfig, BridgeError, CapabilityOutcome, ClosureKind, ClosureState, Function,
    Kind, Object, Value, VecGuest,
};

// ── Helpers ──────────────────────────────────────────────────────────

struct Harness {
    guest: Rc<VecGuest>,
    bridge: Rc<Bridge>,
    deallocator: u32,
    deallocated: Rc<RefCell<Vec<u32>>>,
}

fn harness() -> Harness {
    let guest = Rc::new(VecGuest::new(1));
    let bridge = Rc::new(Bridge::new(guest.clone(), BridgeConfig::default()));
    let deallocated = Rc::new(RefCell::new(Vec::new()));
    let log = deallocated.clone();
    let deallocator = guest.register(move |_: &Bridge, args: &[u32]| {
        log.borrow_mut().push(args[0]);
        Ok(())
    });
    bridge.start().unwrap();
    Harness {
        guest,
        bridge,
        deallocator,
        deallocated,
    }
}

/// Write a function slot the way the guest would and decode it.
fn guest_closure(bridge: &Bridge, kind: Kind, adapter: u32, pointer: u32, deallocator: u32) -> Function {
    let slot = bridge.alloc(SLOT_SIZE).unwrap();
    let views = bridge.views();
    views.heapu32().store(slot, adapter).unwrap();
    views.heapu32().store(slot + 4, pointer).unwrap();
    views.heapu32().store(slot + 8, deallocator).unwrap();
    views.heapu8().set(slot + KIND_OFFSET, kind.tag()).unwrap();
    match bridge.decode(slot).unwrap() {
        Value::Function(f) => f,
        other => panic!("expected function, got {:?}", other),
    }
}

/// Arguments the calling adapter received, decoded.
fn call_args(bridge: &Bridge, args: &[u32]) -> Vec<Value> {
    match bridge.decode(args[1]).unwrap() {
        Value::Array(items) => items,
        other => panic!("arguments must be an array, got {:?}", other),
    }
}

fn element(bridge: &Bridge, slot: u32, index: u32) -> u32 {
    let offset = bridge.views().heapu32().load(slot).unwrap();
    bridge.arena().resolve(offset) + index * SLOT_SIZE
}

// ── Codec scenarios ──────────────────────────────────────────────────

#[test]
fn scenario_a_object_round_trip() {
    let h = harness();
    let mut obj = Object::new();
    obj.insert("a", Value::from(1));
    obj.insert("b", Value::string("x"));

    let slot = h.bridge.prepare_arg(&Value::Object(obj.clone())).unwrap();
    assert_eq!(codec::kind_at(&h.bridge, slot).unwrap(), Kind::Object);
    assert_eq!(codec::kind_at(&h.bridge, element(&h.bridge, slot, 0)).unwrap(), Kind::Int32);
    assert_eq!(codec::kind_at(&h.bridge, element(&h.bridge, slot, 1)).unwrap(), Kind::String);

    let decoded = h.bridge.decode(slot).unwrap();
    let decoded = decoded.as_object().unwrap();
    assert_eq!(decoded.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    assert_eq!(decoded.get("a"), Some(&Value::from(1)));
    assert_eq!(decoded.get("b"), Some(&Value::string("x")));
}

#[test]
fn scenario_b_array_round_trip() {
    let h = harness();
    let value = Value::Array(vec![
        Value::from(1),
        Value::string("two"),
        Value::Boolean(true),
        Value::Null,
    ]);
    let slot = h.bridge.prepare_arg(&value).unwrap();

    let kinds: Vec<Kind> = (0..4)
        .map(|i| codec::kind_at(&h.bridge, element(&h.bridge, slot, i)).unwrap())
        .collect();
    assert_eq!(kinds, vec![Kind::Int32, Kind::String, Kind::True, Kind::Null]);
    assert_eq!(h.bridge.decode(slot).unwrap(), value);
}

#[test]
fn scenario_c_handle_refcount() {
    let h = harness();
    let x = Value::reference(vec![1u8, 2, 3]);

    let id = h.bridge.acquire(&x);
    assert_eq!(h.bridge.acquire(&x), id);
    h.bridge.decrement(id).unwrap();
    assert_eq!(h.bridge.get_handle(id).unwrap(), x);

    h.bridge.decrement(id).unwrap();
    assert_eq!(h.bridge.get_handle(id), Err(BridgeError::UnknownHandle(id)));
}

#[test]
fn handle_slots_resolve_while_live() {
    let h = harness();
    let x = Value::reference("element");
    let slot = h.bridge.prepare_arg(&x).unwrap();
    let id = h.bridge.views().heapu32().load(slot).unwrap();

    h.bridge.increment(id).unwrap();
    assert_eq!(h.bridge.handle_refcount(id), Some(2));
    h.bridge.release(id).unwrap();
    assert_eq!(h.bridge.decode(slot).unwrap(), x);
    h.bridge.release(id).unwrap();
    assert_eq!(h.bridge.decode(slot), Err(BridgeError::UnknownHandle(id)));
}

#[test]
fn raw_values_are_guest_managed() {
    let h = harness();
    let sym = Value::Symbol(kpio_bridge::Symbol::new(Some("key")));
    let slot = h.bridge.prepare_arg(&sym).unwrap();
    assert_eq!(codec::kind_at(&h.bridge, slot).unwrap(), Kind::RawRef);

    let id = h.bridge.views().heapu32().load(slot).unwrap();
    assert_eq!(h.bridge.decode(slot).unwrap(), sym);
    h.bridge.unregister_raw(id);
    assert_eq!(h.bridge.decode(slot), Err(BridgeError::UnknownRawValue(id)));
}

#[test]
fn corrupt_container_slots_fault_the_call() {
    let h = harness();
    let size = h.bridge.views().buffer().len();

    let slot = h.bridge.alloc(SLOT_SIZE).unwrap();
    let views = h.bridge.views();
    views.heapu32().store(slot, 0).unwrap();
    views.heapu32().store(slot + 4, u32::MAX).unwrap();
    views.heapu8().set(slot + KIND_OFFSET, Kind::Array.tag()).unwrap();
    assert!(matches!(
        h.bridge.decode(slot),
        Err(BridgeError::MemoryOutOfBounds { .. })
    ));

    views.heapu8().set(slot + KIND_OFFSET, Kind::Object.tag()).unwrap();
    assert!(matches!(
        h.bridge.decode(slot),
        Err(BridgeError::MemoryOutOfBounds { .. })
    ));

    assert_eq!(
        h.bridge.decode(u32::MAX - 3),
        Err(BridgeError::MemoryOutOfBounds {
            address: u32::MAX - 3,
            len: SLOT_SIZE,
            size
        })
    );

    // The bridge keeps working after the faulted calls.
    let ok = h.bridge.prepare_arg(&Value::Array(vec![Value::from(1)])).unwrap();
    assert_eq!(h.bridge.decode(ok).unwrap(), Value::Array(vec![Value::from(1)]));
}

// ── Closures ─────────────────────────────────────────────────────────

#[test]
fn fn_tolerates_nested_calls() {
    let h = harness();
    let this: Rc<RefCell<Option<Function>>> = Rc::new(RefCell::new(None));
    let max_in_flight = Rc::new(Cell::new(0));

    let inner = this.clone();
    let observed = max_in_flight.clone();
    let adapter = h.guest.register(move |bridge: &Bridge, args: &[u32]| {
        let depth = match call_args(bridge, args).first() {
            Some(Value::Number(n)) => *n,
            _ => 0.0,
        };
        let f = inner.borrow().clone();
        if let Some(f) = f {
            observed.set(observed.get().max(f.in_flight()));
            if depth < 2.0 {
                f.call(bridge, &[Value::Number(depth + 1.0)])?;
            }
        }
        let out = bridge.prepare_arg(&Value::Number(depth))?;
        bridge.store_transfer(out)
    });

    let f = guest_closure(&h.bridge, Kind::Fn, adapter, 0x1000, h.deallocator);
    *this.borrow_mut() = Some(f.clone());

    assert_eq!(f.call(&h.bridge, &[Value::from(0)]).unwrap(), Value::from(0));
    assert_eq!(max_in_flight.get(), 3);
    assert_eq!(f.in_flight(), 0);

    this.borrow_mut().take();
    f.release(&h.bridge).unwrap();
    assert_eq!(*h.deallocated.borrow(), vec![0x1000]);
}

#[test]
fn fn_mut_reentry_faults() {
    let h = harness();
    let this: Rc<RefCell<Option<Function>>> = Rc::new(RefCell::new(None));
    let inner = this.clone();
    let adapter = h.guest.register(move |bridge: &Bridge, _: &[u32]| {
        let f = inner.borrow().clone();
        match f {
            Some(f) => f.call(bridge, &[]).map(|_| ()),
            None => Ok(()),
        }
    });

    let f = guest_closure(&h.bridge, Kind::FnMut, adapter, 0x2000, h.deallocator);
    *this.borrow_mut() = Some(f.clone());

    let err = f.call(&h.bridge, &[]).unwrap_err();
    assert_eq!(err, BridgeError::CalledConcurrently(ClosureKind::FnMut));
    assert!(err.is_closure_fault());
    assert_eq!(f.in_flight(), 0);
    assert_eq!(f.state(), ClosureState::Live);

    this.borrow_mut().take();
    f.release(&h.bridge).unwrap();
}

#[test]
fn fn_once_second_call_faults() {
    let h = harness();
    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    let adapter = h.guest.register(move |_: &Bridge, _: &[u32]| {
        counter.set(counter.get() + 1);
        Ok(())
    });

    let f = guest_closure(&h.bridge, Kind::FnOnce, adapter, 0x3000, h.deallocator);
    assert_eq!(f.call(&h.bridge, &[]).unwrap(), Value::Undefined);
    assert_eq!(f.call(&h.bridge, &[]), Err(BridgeError::AlreadyCalledOrDropped));
    assert_eq!(calls.get(), 1);

    f.release(&h.bridge).unwrap();
    assert!(h.deallocated.borrow().is_empty());
}

#[test]
fn drop_during_call_is_deferred() {
    let h = harness();
    let this: Rc<RefCell<Option<Function>>> = Rc::new(RefCell::new(None));
    let freed_during_call = Rc::new(Cell::new(usize::MAX));

    let inner = this.clone();
    let freed = h.deallocated.clone();
    let seen = freed_during_call.clone();
    let adapter = h.guest.register(move |bridge: &Bridge, _: &[u32]| {
        let f = inner.borrow().clone();
        if let Some(f) = f {
            f.release(bridge)?;
            assert!(f.drop_queued());
            seen.set(freed.borrow().len());
        }
        let out = bridge.prepare_arg(&Value::string("done"))?;
        bridge.store_transfer(out)
    });

    let f = guest_closure(&h.bridge, Kind::Fn, adapter, 0x4000, h.deallocator);
    *this.borrow_mut() = Some(f.clone());

    assert_eq!(f.call(&h.bridge, &[]).unwrap(), Value::string("done"));
    assert_eq!(freed_during_call.get(), 0);
    assert_eq!(*h.deallocated.borrow(), vec![0x4000]);
    assert_eq!(f.state(), ClosureState::Dropped);

    assert_eq!(
        f.call(&h.bridge, &[]),
        Err(BridgeError::AlreadyDropped(ClosureKind::Fn))
    );
    f.release(&h.bridge).unwrap();
    assert_eq!(h.deallocated.borrow().len(), 1);
    this.borrow_mut().take();
}

#[test]
fn closure_arguments_are_marshalled() {
    let h = harness();
    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = received.clone();
    let adapter = h.guest.register(move |bridge: &Bridge, args: &[u32]| {
        *sink.borrow_mut() = call_args(bridge, args);
        Ok(())
    });

    let f = guest_closure(&h.bridge, Kind::FnMut, adapter, 0x5000, h.deallocator);
    f.call(&h.bridge, &[Value::from(3), Value::string("s"), Value::Number(0.5)])
        .unwrap();
    assert_eq!(
        *received.borrow(),
        vec![Value::from(3), Value::string("s"), Value::Number(0.5)]
    );
    f.release(&h.bridge).unwrap();
}

// ── Memory growth ────────────────────────────────────────────────────

#[test]
fn growth_republishes_views() {
    let h = harness();
    let before = h.bridge.views();
    let pages = h.guest.pages();

    let text = "\u{1F600}".repeat(40_000);
    let slot = h.bridge.prepare_arg(&Value::string(text.clone())).unwrap();

    assert!(h.guest.pages() > pages);
    assert!(before.buffer().is_detached());
    assert!(before.heapu8().get(0).is_err());
    assert!(h.bridge.views().generation() > before.generation());
    assert_eq!(h.bridge.decode(slot).unwrap(), Value::string(text));
}

#[test]
fn growth_inside_nested_encode() {
    let h = harness();
    let chunk = "x".repeat(30_000);
    let value = Value::Array(vec![
        Value::string(chunk.clone()),
        Value::Number(1.25),
        Value::string(chunk.clone()),
        Value::string(chunk),
    ]);
    let slot = h.bridge.prepare_arg(&value).unwrap();
    assert_eq!(h.bridge.decode(slot).unwrap(), value);
}

// ── Capabilities ─────────────────────────────────────────────────────

#[test]
fn fallible_capability_reports_outcome() {
    let h = harness();
    h.bridge.add_fallible_capability("parse_int", |_, args| match args.first() {
        Some(Value::String(s)) => s
            .parse::<i32>()
            .map(Value::from)
            .map_err(|_| Value::string("not a number")),
        _ => Err(Value::string("missing argument")),
    });

    let call = |input: &str| {
        let arg = h.bridge.prepare_arg(&Value::string(input)).unwrap();
        let ret = h.bridge.alloc(SLOT_SIZE).unwrap();
        h.bridge.invoke_capability("parse_int", ret, &[arg]).unwrap();
        CapabilityOutcome::from_value(&h.bridge.decode(ret).unwrap()).unwrap()
    };

    assert_eq!(call("12"), CapabilityOutcome::Success(Value::from(12)));
    assert_eq!(
        call("twelve"),
        CapabilityOutcome::Failure(Value::string("not a number"))
    );
}

#[test]
fn capability_protocol_faults_propagate() {
    let h = harness();
    h.bridge.add_capability("echo", |_, args| Ok(args.first().cloned().unwrap_or(Value::Undefined)));

    let bad = h.bridge.alloc(SLOT_SIZE).unwrap();
    h.bridge.views().heapu8().set(bad + KIND_OFFSET, 200).unwrap();
    assert_eq!(
        h.bridge.invoke_capability("echo", 0, &[bad]),
        Err(BridgeError::InvalidKind(200))
    );
}

#[test]
fn capability_called_from_guest_main() {
    let guest = Rc::new(VecGuest::new(1));
    let bridge = Bridge::new(guest.clone(), BridgeConfig::default());
    let total = Rc::new(Cell::new(0.0));
    let out = total.clone();
    bridge.add_capability("sum", move |_, args| {
        let sum: f64 = args.iter().filter_map(Value::as_number).sum();
        out.set(sum);
        Ok(Value::Number(sum))
    });
    guest.set_main(|bridge: &Bridge| {
        let a = bridge.prepare_arg(&Value::from(2))?;
        let b = bridge.prepare_arg(&Value::Number(0.5))?;
        bridge.invoke_capability("sum", 0, &[a, b])
    });

    bridge.start().unwrap();
    assert_eq!(total.get(), 2.5);
}

// ── Aborts ───────────────────────────────────────────────────────────

#[test]
fn guest_abort_kills_instance() {
    let guest = Rc::new(VecGuest::new(1));
    let reports = Rc::new(RefCell::new(Vec::new()));
    let sink = reports.clone();
    let bridge = Bridge::new(guest.clone(), BridgeConfig::default())
        .with_sink(move |abort: &kpio_bridge::Abort| sink.borrow_mut().push(abort.clone()));

    let adapter = guest.register(|_: &Bridge, _: &[u32]| Ok(()));
    guest.set_main(|bridge: &Bridge| {
        let msg = bridge.alloc(16)?;
        bridge.views().buffer().write(msg, b"out of fuel")?;
        Err(bridge.abort_from_guest(0, 0, 0, msg, 11))
    });

    let err = bridge.start().unwrap_err();
    assert_eq!(err, BridgeError::trap("abort: out of fuel"));
    assert!(bridge.is_dead());

    let reports = reports.borrow();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].location, None);
    assert_eq!(reports[0].message.as_deref(), Some("out of fuel"));

    let f = guest_closure(&bridge, Kind::Fn, adapter, 0x6000, 0);
    assert_eq!(f.call(&bridge, &[]), Err(BridgeError::InstanceDead));
}
