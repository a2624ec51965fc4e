//! Tagged value codec.
//!
//! Every boundary crossing goes through [`encode`] or [`decode`]. Composite
//! payloads are staged through the arena, so any encode step may grow guest
//! memory: views are re-fetched from the bridge after every allocation and
//! never cached across one.

use alloc::vec::Vec;

use crate::bridge::Bridge;
use crate::closure::Function;
use crate::error::{BridgeError, BridgeResult};
use crate::memory::ElementKind;
use crate::slot::{self, Kind, KEY_ENTRY_SIZE, SLOT_SIZE};
use crate::string;
use crate::value::{Object, Value};

/// Whether `n` survives a round trip through a 32-bit integer.
pub fn is_int32(n: f64) -> bool {
    (n as i32) as f64 == n
}

fn write_kind(bridge: &Bridge, address: u32, kind: Kind) -> BridgeResult<()> {
    let views = bridge.views();
    let tag = slot::tag_address(address).ok_or_else(|| views.out_of_bounds(address, SLOT_SIZE))?;
    views.heapu8().set(tag, kind.tag())
}

fn read_word(bridge: &Bridge, address: u32, index: u32) -> BridgeResult<u32> {
    let views = bridge.views();
    let word = slot::word(address, index)
        .ok_or_else(|| views.out_of_bounds(address, SLOT_SIZE))?;
    views.heapu32().load(word)
}

fn write_word(bridge: &Bridge, address: u32, index: u32, value: u32) -> BridgeResult<()> {
    let views = bridge.views();
    let word = slot::word(address, index)
        .ok_or_else(|| views.out_of_bounds(address, SLOT_SIZE))?;
    views.heapu32().store(word, value)
}

/// Address of entry `index` of a table at `base`.
fn entry(bridge: &Bridge, base: u32, index: u32, stride: u32) -> BridgeResult<u32> {
    slot::entry(base, index, stride).ok_or_else(|| bridge.views().out_of_bounds(base, stride))
}

/// Byte size of a host-side table of `len` entries.
fn table_size(len: usize, stride: u32) -> BridgeResult<u32> {
    u32::try_from(len)
        .ok()
        .and_then(|len| len.checked_mul(stride))
        .ok_or(BridgeError::AllocationFailed(u32::MAX))
}

fn check_depth(bridge: &Bridge, depth: usize) -> BridgeResult<()> {
    let limit = bridge.config().max_depth;
    if depth >= limit {
        return Err(BridgeError::DepthLimitExceeded(limit));
    }
    Ok(())
}

// ── Decode ───────────────────────────────────────────────────────────

/// Read the kind tag of the slot at `address`.
pub fn kind_at(bridge: &Bridge, address: u32) -> BridgeResult<Kind> {
    let views = bridge.views();
    let tag = slot::tag_address(address).ok_or_else(|| views.out_of_bounds(address, SLOT_SIZE))?;
    Kind::try_from(views.heapu8().get(tag)?)
}

/// Decode the slot at `address` into a host value.
pub fn decode(bridge: &Bridge, address: u32) -> BridgeResult<Value> {
    decode_at(bridge, address, 0)
}

fn decode_at(bridge: &Bridge, address: u32, depth: usize) -> BridgeResult<Value> {
    let kind = kind_at(bridge, address)?;
    log::trace!("[Bridge Codec] decode {} at {:#x}", kind, address);

    let value = match kind {
        Kind::Undefined => Value::Undefined,
        Kind::Null => Value::Null,
        Kind::False => Value::Boolean(false),
        Kind::True => Value::Boolean(true),
        Kind::Int32 => Value::Number(bridge.views().heap32().load(address)? as f64),
        Kind::Float64 => Value::Number(bridge.views().heapf64().load(address)?),
        Kind::String => {
            let ptr = read_word(bridge, address, 0)?;
            let len = read_word(bridge, address, 1)?;
            Value::String(string::load(bridge, ptr, len)?)
        }
        Kind::Array => {
            check_depth(bridge, depth)?;
            let base = bridge.arena().resolve(read_word(bridge, address, 0)?);
            let len = read_word(bridge, address, 1)?;
            // The length is guest-written: bound it by memory before decoding.
            bridge.views().check_table(base, len, SLOT_SIZE)?;
            let mut items = Vec::new();
            for i in 0..len {
                items.push(decode_at(bridge, entry(bridge, base, i, SLOT_SIZE)?, depth + 1)?);
            }
            Value::Array(items)
        }
        Kind::Object => {
            check_depth(bridge, depth)?;
            let values = bridge.arena().resolve(read_word(bridge, address, 0)?);
            let len = read_word(bridge, address, 1)?;
            let keys = bridge.arena().resolve(read_word(bridge, address, 2)?);
            let views = bridge.views();
            views.check_table(values, len, SLOT_SIZE)?;
            views.check_table(keys, len, KEY_ENTRY_SIZE)?;
            let mut obj = Object::new();
            for i in 0..len {
                let key_entry = entry(bridge, keys, i, KEY_ENTRY_SIZE)?;
                let key_ptr = read_word(bridge, key_entry, 0)?;
                let key_len = read_word(bridge, key_entry, 1)?;
                let key = string::load(bridge, key_ptr, key_len)?;
                let value = decode_at(bridge, entry(bridge, values, i, SLOT_SIZE)?, depth + 1)?;
                obj.insert(key, value);
            }
            Value::Object(obj)
        }
        Kind::HostRef => bridge.get_handle(read_word(bridge, address, 0)?)?,
        Kind::Fn | Kind::FnMut | Kind::FnOnce => {
            let adapter = read_word(bridge, address, 0)?;
            let pointer = read_word(bridge, address, 1)?;
            let deallocator = read_word(bridge, address, 2)?;
            // Only the three function kinds reach this arm.
            let closure_kind = kind.closure_kind().ok_or(BridgeError::InvalidKind(kind.tag()))?;
            Value::Function(Function::from_guest(closure_kind, adapter, pointer, deallocator))
        }
        Kind::TypedView => {
            let ptr = read_word(bridge, address, 0)?;
            let len = read_word(bridge, address, 1)?;
            let element = ElementKind::try_from(read_word(bridge, address, 2)?)?;
            let end = ptr
                .checked_add(len)
                .ok_or_else(|| bridge.views().out_of_bounds(ptr, len))?;
            Value::TypedArray(bridge.views().subarray(element, ptr, end)?)
        }
        Kind::RawRef => bridge.get_raw(read_word(bridge, address, 0)?)?,
    };
    Ok(value)
}

// ── Encode ───────────────────────────────────────────────────────────

/// Encode `value` into the slot at `address`.
pub fn encode(bridge: &Bridge, address: u32, value: &Value) -> BridgeResult<()> {
    encode_at(bridge, address, value, 0)
}

/// Encode `items` as an Array slot at `address`.
pub fn encode_array(bridge: &Bridge, address: u32, items: &[Value]) -> BridgeResult<()> {
    encode_array_at(bridge, address, items, 0)
}

fn encode_at(bridge: &Bridge, address: u32, value: &Value, depth: usize) -> BridgeResult<()> {
    log::trace!("[Bridge Codec] encode {} at {:#x}", value.type_of(), address);

    match value {
        Value::Undefined => write_kind(bridge, address, Kind::Undefined),
        Value::Null => write_kind(bridge, address, Kind::Null),
        Value::Boolean(b) => write_kind(bridge, address, Kind::boolean(*b)),
        Value::Number(n) => {
            if is_int32(*n) {
                bridge.views().heap32().store(address, *n as i32)?;
                write_kind(bridge, address, Kind::Int32)
            } else {
                bridge.views().heapf64().store(address, *n)?;
                write_kind(bridge, address, Kind::Float64)
            }
        }
        Value::String(s) => {
            string::store(bridge, address, s)?;
            write_kind(bridge, address, Kind::String)
        }
        Value::Array(items) => encode_array_at(bridge, address, items, depth),
        Value::Object(obj) => encode_object_at(bridge, address, obj, depth),
        Value::Symbol(_) => {
            let id = bridge.register_raw(value.clone());
            write_word(bridge, address, 0, id)?;
            write_kind(bridge, address, Kind::RawRef)
        }
        Value::Reference(_) | Value::Function(_) | Value::TypedArray(_) => {
            let id = bridge.acquire(value);
            write_word(bridge, address, 0, id)?;
            write_kind(bridge, address, Kind::HostRef)
        }
    }
}

fn encode_array_at(
    bridge: &Bridge,
    address: u32,
    items: &[Value],
    depth: usize,
) -> BridgeResult<()> {
    check_depth(bridge, depth)?;
    let pointer = bridge.alloc(table_size(items.len(), SLOT_SIZE)?)?;
    let len = items.len() as u32;
    let offset = bridge.arena().offset(pointer)?;

    write_kind(bridge, address, Kind::Array)?;
    write_word(bridge, address, 0, offset)?;
    write_word(bridge, address, 1, len)?;
    for (i, item) in (0..len).zip(items) {
        encode_at(bridge, entry(bridge, pointer, i, SLOT_SIZE)?, item, depth + 1)?;
    }
    Ok(())
}

fn encode_object_at(bridge: &Bridge, address: u32, obj: &Object, depth: usize) -> BridgeResult<()> {
    check_depth(bridge, depth)?;
    let keys = bridge.alloc(table_size(obj.len(), KEY_ENTRY_SIZE)?)?;
    let values = bridge.alloc(table_size(obj.len(), SLOT_SIZE)?)?;
    let len = obj.len() as u32;
    let arena = bridge.arena();

    write_kind(bridge, address, Kind::Object)?;
    write_word(bridge, address, 0, arena.offset(values)?)?;
    write_word(bridge, address, 1, len)?;
    write_word(bridge, address, 2, arena.offset(keys)?)?;
    for (i, (key, value)) in (0..len).zip(obj.iter()) {
        string::store(bridge, entry(bridge, keys, i, KEY_ENTRY_SIZE)?, key)?;
        encode_at(bridge, entry(bridge, values, i, SLOT_SIZE)?, value, depth + 1)?;
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────
