//! Value slot layout.
//!
//! Every value crossing the boundary occupies one 16-byte slot in guest
//! memory. The kind tag lives at byte 12; bytes 0..12 hold the payload.
//!
//! ```text
//! offset  0        4        8        12   13      16
//!         +--------+--------+--------+----+-------+
//!         | word 0 | word 1 | word 2 |kind|  pad  |
//!         +--------+--------+--------+----+-------+
//! ```
//!
//! | kind                      | payload                                   |
//! |---------------------------|-------------------------------------------|
//! | Undefined/Null/False/True | none                                      |
//! | Int32                     | i32 at word 0                             |
//! | Float64                   | f64 at offset 0 (8-byte aligned slot)     |
//! | String                    | ptr, len (UTF-8 bytes)                    |
//! | Array                     | arena offset, len (16-byte slots)         |
//! | Object                    | value arena offset, len, key arena offset |
//! | HostRef                   | handle id                                 |
//! | Fn/FnMut/FnOnce           | adapter, function pointer, deallocator    |
//! | TypedView                 | ptr, len, element kind                    |
//! | RawRef                    | raw registry id                           |

use core::fmt;

use crate::closure::ClosureKind;
use crate::error::BridgeError;

/// Size of one value slot in bytes.
pub const SLOT_SIZE: u32 = 16;

/// Byte offset of the kind tag within a slot.
pub const KIND_OFFSET: u32 = 12;

/// Size of one object key entry (ptr, len) in bytes.
pub const KEY_ENTRY_SIZE: u32 = 8;

/// Kind tag of a value slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Undefined = 0,
    Null = 1,
    Int32 = 2,
    Float64 = 3,
    String = 4,
    False = 5,
    True = 6,
    Array = 7,
    Object = 8,
    HostRef = 9,
    Fn = 10,
    // 11 is unused.
    FnMut = 12,
    FnOnce = 13,
    TypedView = 14,
    RawRef = 15,
}

impl Kind {
    /// The tag byte written into the slot.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Closure contract for the function kinds.
    pub fn closure_kind(self) -> Option<ClosureKind> {
        match self {
            Kind::Fn => Some(ClosureKind::Fn),
            Kind::FnMut => Some(ClosureKind::FnMut),
            Kind::FnOnce => Some(ClosureKind::FnOnce),
            _ => None,
        }
    }

    /// Tag for a boolean.
    pub fn boolean(b: bool) -> Self {
        if b {
            Kind::True
        } else {
            Kind::False
        }
    }
}

impl TryFrom<u8> for Kind {
    type Error = BridgeError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        let kind = match tag {
            0 => Kind::Undefined,
            1 => Kind::Null,
            2 => Kind::Int32,
            3 => Kind::Float64,
            4 => Kind::String,
            5 => Kind::False,
            6 => Kind::True,
            7 => Kind::Array,
            8 => Kind::Object,
            9 => Kind::HostRef,
            10 => Kind::Fn,
            12 => Kind::FnMut,
            13 => Kind::FnOnce,
            14 => Kind::TypedView,
            15 => Kind::RawRef,
            other => return Err(BridgeError::InvalidKind(other)),
        };
        Ok(kind)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Byte address of payload word `index` (0..3) of the slot at `address`.
///
/// `None` when the address does not fit in 32 bits.
pub fn word(address: u32, index: u32) -> Option<u32> {
    entry(address, index, 4)
}

/// Byte address of the kind tag of the slot at `address`.
pub fn tag_address(address: u32) -> Option<u32> {
    address.checked_add(KIND_OFFSET)
}

/// Address of entry `index` in a table of `stride`-byte entries at `base`.
pub fn entry(base: u32, index: u32, stride: u32) -> Option<u32> {
    base.checked_add(index.checked_mul(stride)?)
}

// ── Tests ────────────────────────────────────────────────────────────
