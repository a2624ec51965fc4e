//! Host capabilities importable by the guest.
//!
//! A capability is a named host function taking decoded arguments and
//! returning a value. Capabilities that can fail in the host environment
//! are registered with [`Capabilities::add_fallible`]: their failure is
//! handed to the guest as data (a [`CapabilityOutcome`]) instead of
//! aborting the boundary call.

use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use hashbrown::HashMap;

use crate::bridge::Bridge;
use crate::error::BridgeResult;
use crate::value::{Object, Value};

/// A host function callable from the guest.
pub type HostFunction = Rc<dyn Fn(&Bridge, &[Value]) -> BridgeResult<Value>>;

/// Registry of named host functions.
#[derive(Default)]
pub struct Capabilities {
    functions: HashMap<String, HostFunction>,
}

impl Capabilities {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host function. A later registration under the same name
    /// replaces the earlier one.
    pub fn add_function<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Bridge, &[Value]) -> BridgeResult<Value> + 'static,
    {
        self.functions.insert(String::from(name), Rc::new(f));
    }

    /// Register a host function whose failure is reported as data.
    pub fn add_fallible<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Bridge, &[Value]) -> Result<Value, Value> + 'static,
    {
        self.add_function(name, move |bridge, args| {
            Ok(CapabilityOutcome::from(f(bridge, args)).into_value())
        });
    }

    /// Look up a host function.
    pub fn get(&self, name: &str) -> Option<HostFunction> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Result of a fallible capability, as seen by the guest.
///
/// Crosses the boundary as an object: `{value, success: true}` on success
/// and `{error, success: false}` on failure.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityOutcome {
    Success(Value),
    Failure(Value),
}

impl CapabilityOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CapabilityOutcome::Success(_))
    }

    /// The object form handed to the guest.
    pub fn into_value(self) -> Value {
        let mut obj = Object::with_capacity(2);
        match self {
            CapabilityOutcome::Success(value) => {
                obj.insert("value", value);
                obj.insert("success", Value::Boolean(true));
            }
            CapabilityOutcome::Failure(error) => {
                obj.insert("error", error);
                obj.insert("success", Value::Boolean(false));
            }
        }
        Value::Object(obj)
    }

    /// Recover an outcome from its object form.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        match obj.get("success")?.as_bool()? {
            true => Some(CapabilityOutcome::Success(obj.get("value")?.clone())),
            false => Some(CapabilityOutcome::Failure(obj.get("error")?.clone())),
        }
    }
}

impl From<Result<Value, Value>> for CapabilityOutcome {
    fn from(result: Result<Value, Value>) -> Self {
        match result {
            Ok(value) => CapabilityOutcome::Success(value),
            Err(error) => CapabilityOutcome::Failure(error),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
