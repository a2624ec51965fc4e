//! KPIO Value Bridge
//!
//! This crate marshals values between the KPIO host runtime and a guest
//! program running in a separate WASM linear memory. Values cross the
//! boundary as fixed 16-byte tagged slots; composite payloads are staged in
//! guest memory through the guest allocator; host objects are lent to the
//! guest as reference-counted integer handles; guest closures come back to
//! the host as callable wrappers with drop semantics.
//!
//! # Architecture
//!
//! - `string`: UTF-8/UTF-16 transcoding (native fast path + manual path)
//! - `arena`: bump allocation in guest memory for variable-length payloads
//! - `memory`: typed views over guest memory, republished on growth
//! - `handles`: refcounted id ↔ host object table
//! - `raw`: id ↔ value registry for values that cannot be identity keys
//! - `slot`: the 16-byte value slot layout and kind tags
//! - `codec`: tagged-union encode/decode, the dispatcher of every crossing
//! - `closure`: guest function pointers wrapped as host callables
//! - `capability`: named host functions importable by the guest
//! - `diagnostics`: guest abort reporting
//! - `guest`: the interface the bridge requires from the guest
//! - `bridge`: the per-instance context object tying it all together
//!
//! # Usage
//!
//! ```ignore
//! use alloc::rc::Rc;
//! use kpio_bridge::{Bridge, BridgeConfig, VecGuest, Value};
//!
//! let guest = Rc::new(VecGuest::new(1));
//! let bridge = Bridge::new(guest, BridgeConfig::default());
//! bridge.start()?;
//! let slot = bridge.prepare_arg(&Value::string("hello"))?;
//! assert_eq!(bridge.decode(slot)?, Value::string("hello"));
//! ```

#![no_std]

extern crate alloc;

pub mod arena;
pub mod bridge;
pub mod capability;
pub mod closure;
pub mod codec;
pub mod diagnostics;
pub mod error;
pub mod guest;
pub mod handles;
pub mod memory;
pub mod raw;
pub mod slot;
pub mod string;
pub mod value;

use bitflags::bitflags;

pub use bridge::Bridge;
pub use capability::{Capabilities, CapabilityOutcome, HostFunction};
pub use closure::{ClosureKind, ClosureState, Function};
pub use diagnostics::{Abort, DiagnosticSink, Location, LogSink};
pub use error::{BridgeError, BridgeResult};
pub use guest::{Guest, GuestFn, Signature, VecGuest};
pub use memory::{ElementKind, LinearBuffer, TypedArray};
pub use slot::Kind;
pub use value::{Object, Reference, Symbol, Value};

bitflags! {
    /// Facilities the host environment provides natively.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostFeatures: u32 {
        /// A native UTF-8 encoder is available.
        const NATIVE_UTF8_ENCODER = 0b0001;
        /// A native UTF-8 decoder is available.
        const NATIVE_UTF8_DECODER = 0b0010;
    }
}

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Host facilities used by the string codec.
    pub features: HostFeatures,

    /// Maximum array/object nesting accepted by the codec.
    pub max_depth: usize,

    /// Guest address that arena-relative offsets are measured from.
    pub arena_base: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            features: HostFeatures::all(),
            max_depth: 128,
            arena_base: 0,
        }
    }
}

impl BridgeConfig {
    /// Configuration that forces the portable manual transcoders.
    pub fn portable() -> Self {
        BridgeConfig {
            features: HostFeatures::empty(),
            ..Self::default()
        }
    }
}
