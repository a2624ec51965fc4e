//! Reference-counted handle table.
//!
//! Host objects lent to the guest are represented by integer handles. Each
//! live handle carries a refcount equal to the number of guest-side owners;
//! the entry is erased exactly when that count reaches zero, which releases
//! the table's hold on the host object.
//!
//! Repeated acquisition of the same object returns the same handle. Objects
//! with a stable identity are found through a hash index keyed by address.
//! Values without one (plain data, symbols, typed views) are found through a
//! linear fallback index compared by value.
//!
//! Handle 0 is reserved for null/undefined. Ids are never reused.

use alloc::vec::Vec;
use hashbrown::HashMap;

use crate::error::{BridgeError, BridgeResult};
use crate::value::Value;

/// Handle reserved for "no reference".
pub const NULL_HANDLE: u32 = 0;

struct HandleEntry {
    value: Value,
    refcount: u32,
}

/// Id ↔ host object table.
pub struct HandleTable {
    entries: HashMap<u32, HandleEntry>,
    by_identity: HashMap<usize, u32>,
    fallback: Vec<(Value, u32)>,
    next_id: u32,
}

impl HandleTable {
    /// Create an empty table.
    pub fn new() -> Self {
        HandleTable {
            entries: HashMap::new(),
            by_identity: HashMap::new(),
            fallback: Vec::new(),
            next_id: 1,
        }
    }

    fn lookup(&self, value: &Value) -> Option<u32> {
        match value.identity() {
            Some(key) => self.by_identity.get(&key).copied(),
            None => self
                .fallback
                .iter()
                .find(|(v, _)| v == value)
                .map(|(_, id)| *id),
        }
    }

    /// Acquire a handle for `value`, bumping its refcount if already held.
    pub fn acquire(&mut self, value: &Value) -> u32 {
        if value.is_nullish() {
            return NULL_HANDLE;
        }

        if let Some(id) = self.lookup(value) {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.refcount += 1;
                log::debug!("[Bridge Handles] acquire {} (refcount {})", id, entry.refcount);
                return id;
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        match value.identity() {
            Some(key) => {
                self.by_identity.insert(key, id);
            }
            None => self.fallback.push((value.clone(), id)),
        }
        self.entries.insert(
            id,
            HandleEntry {
                value: value.clone(),
                refcount: 1,
            },
        );
        log::debug!("[Bridge Handles] new handle {} for {}", id, value.type_of());
        id
    }

    /// Resolve a handle. Handle 0 resolves to null.
    pub fn get(&self, id: u32) -> BridgeResult<Value> {
        if id == NULL_HANDLE {
            return Ok(Value::Null);
        }
        self.entries
            .get(&id)
            .map(|entry| entry.value.clone())
            .ok_or(BridgeError::UnknownHandle(id))
    }

    /// Add one guest-side owner.
    pub fn increment(&mut self, id: u32) -> BridgeResult<()> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(BridgeError::UnknownHandle(id))?;
        entry.refcount += 1;
        Ok(())
    }

    /// Remove one guest-side owner, erasing the entry at zero.
    pub fn decrement(&mut self, id: u32) -> BridgeResult<()> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(BridgeError::UnknownHandle(id))?;
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return Ok(());
        }

        if let Some(entry) = self.entries.remove(&id) {
            match entry.value.identity() {
                Some(key) => {
                    self.by_identity.remove(&key);
                }
                None => self.fallback.retain(|(_, fid)| *fid != id),
            }
        }
        log::debug!("[Bridge Handles] released handle {}", id);
        Ok(())
    }

    /// Release one acquisition of `id`.
    pub fn release(&mut self, id: u32) -> BridgeResult<()> {
        self.decrement(id)
    }

    /// Current refcount, if the handle is live.
    pub fn refcount(&self, id: u32) -> Option<u32> {
        self.entries.get(&id).map(|entry| entry.refcount)
    }

    /// Whether the handle is live.
    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no handles are live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
