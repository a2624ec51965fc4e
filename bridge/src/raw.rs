//! Raw value registry.
//!
//! Values that cannot be looked up by identity (symbols) are registered
//! here instead of the handle table. There is no refcounting: the guest
//! registers and unregisters explicitly, and a leaked entry is its problem.

use hashbrown::HashMap;

use crate::error::{BridgeError, BridgeResult};
use crate::value::Value;

/// Id ↔ value registry.
#[derive(Default)]
pub struct RawRegistry {
    values: HashMap<u32, Value>,
    last_id: u32,
}

impl RawRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `value` under a fresh id.
    pub fn register(&mut self, value: Value) -> u32 {
        self.last_id += 1;
        self.values.insert(self.last_id, value);
        self.last_id
    }

    /// Drop the entry for `id`. Unknown ids are ignored.
    pub fn unregister(&mut self, id: u32) -> Option<Value> {
        self.values.remove(&id)
    }

    pub fn get(&self, id: u32) -> BridgeResult<Value> {
        self.values
            .get(&id)
            .cloned()
            .ok_or(BridgeError::UnknownRawValue(id))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Symbol;

    #[test]
    fn test_ids_are_monotonic() {
        let mut raw = RawRegistry::new();
        let a = raw.register(Value::from(1));
        let b = raw.register(Value::from(1));
        assert_eq!((a, b), (1, 2));
        raw.unregister(a);
        assert_eq!(raw.register(Value::Null), 3);
    }

    #[test]
    fn test_get_and_unregister() {
        let mut raw = RawRegistry::new();
        let sym = Symbol::new(None);
        let id = raw.register(Value::Symbol(sym.clone()));
        assert_eq!(raw.get(id).unwrap(), Value::Symbol(sym));
        assert!(raw.unregister(id).is_some());
        assert_eq!(raw.get(id), Err(BridgeError::UnknownRawValue(id)));
        assert!(raw.unregister(id).is_none());
        assert!(raw.is_empty());
    }
}
