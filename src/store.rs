//! Destination state tree: typed slots addressed by dotted paths.
//!
//! Slots are declared once and then written many times. Declaring an
//! existing slot is a no-op and never changes its declared type.

use crate::models::oilfox::ValueType;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSpec {
    pub value_type: ValueType,
    pub name: String,
    pub role: String,
    pub readable: bool,
    pub writable: bool,
}

impl SlotSpec {
    /// Slots mirrored from the API are read-only for consumers.
    pub fn read_only(name: impl Into<String>, value_type: ValueType) -> Self {
        SlotSpec {
            value_type,
            name: name.into(),
            role: value_type.role().to_string(),
            readable: true,
            writable: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotState {
    pub spec: SlotSpec,
    pub value: Option<Value>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub enum StoreError {
    /// Write to a path that was never declared.
    Undeclared(String),
    /// Binding would map an index or a device id twice.
    Conflict(String),
    Backend(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Undeclared(p) => write!(f, "slot {} is not declared", p),
            StoreError::Conflict(s) => write!(f, "binding conflict: {}", s),
            StoreError::Backend(s) => write!(f, "store backend error: {}", s),
        }
    }
}

impl std::error::Error for StoreError {}

pub trait StateStore {
    /// Create the slot if absent. Returns `true` when it was created.
    fn declare(&mut self, path: &str, spec: &SlotSpec) -> Result<bool, StoreError>;

    fn write(&mut self, path: &str, value: &Value) -> Result<(), StoreError>;

    fn read(&mut self, path: &str) -> Result<Option<SlotState>, StoreError>;

    /// All declared paths, sorted.
    fn paths(&mut self) -> Result<Vec<String>, StoreError>;

    /// Persistent index -> device id table of one collection.
    fn bindings(&mut self, collection: &str) -> Result<BTreeMap<usize, String>, StoreError>;

    fn bind(&mut self, collection: &str, index: usize, device_id: &str) -> Result<(), StoreError>;
}

/// Process-local store, used for dry runs (`STATE_BACKEND=memory`) and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: BTreeMap<String, SlotState>,
    bindings: BTreeMap<String, BTreeMap<usize, String>>,
}

impl MemoryStore {
    pub fn slots(&self) -> impl Iterator<Item = (&String, &SlotState)> {
        self.slots.iter()
    }

    pub fn value(&self, path: &str) -> Option<&Value> {
        self.slots.get(path).and_then(|s| s.value.as_ref())
    }
}

impl StateStore for MemoryStore {
    fn declare(&mut self, path: &str, spec: &SlotSpec) -> Result<bool, StoreError> {
        if self.slots.contains_key(path) {
            return Ok(false);
        }
        self.slots.insert(
            path.to_string(),
            SlotState {
                spec: spec.clone(),
                value: None,
                updated_at: None,
            },
        );
        Ok(true)
    }

    fn write(&mut self, path: &str, value: &Value) -> Result<(), StoreError> {
        let slot = self
            .slots
            .get_mut(path)
            .ok_or_else(|| StoreError::Undeclared(path.to_string()))?;
        slot.value = Some(value.clone());
        slot.updated_at = Some(Utc::now());
        Ok(())
    }

    fn read(&mut self, path: &str) -> Result<Option<SlotState>, StoreError> {
        Ok(self.slots.get(path).cloned())
    }

    fn paths(&mut self) -> Result<Vec<String>, StoreError> {
        Ok(self.slots.keys().cloned().collect())
    }

    fn bindings(&mut self, collection: &str) -> Result<BTreeMap<usize, String>, StoreError> {
        Ok(self.bindings.get(collection).cloned().unwrap_or_default())
    }

    fn bind(&mut self, collection: &str, index: usize, device_id: &str) -> Result<(), StoreError> {
        let table = self.bindings.entry(collection.to_string()).or_default();
        if let Some(existing) = table.get(&index) {
            return Err(StoreError::Conflict(format!(
                "{}.{} already bound to device {}",
                collection, index, existing
            )));
        }
        if let Some((other, _)) = table.iter().find(|(_, id)| id.as_str() == device_id) {
            return Err(StoreError::Conflict(format!(
                "device {} already bound to {}.{}",
                device_id, collection, other
            )));
        }
        table.insert(index, device_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn declare_is_create_if_absent() {
        let mut store = MemoryStore::default();
        assert!(store.declare("info.a", &SlotSpec::read_only("a", ValueType::Number)).unwrap());
        assert!(!store.declare("info.a", &SlotSpec::read_only("a", ValueType::String)).unwrap());

        let slot = store.read("info.a").unwrap().unwrap();
        assert_eq!(slot.spec.value_type, ValueType::Number);
        assert!(slot.spec.readable && !slot.spec.writable);
        assert_eq!(slot.value, None);
    }

    #[test]
    fn write_requires_declaration() {
        let mut store = MemoryStore::default();
        assert!(matches!(
            store.write("info.a", &json!(1)),
            Err(StoreError::Undeclared(p)) if p == "info.a"
        ));

        store.declare("info.a", &SlotSpec::read_only("a", ValueType::Number)).unwrap();
        store.write("info.a", &json!(1)).unwrap();
        let slot = store.read("info.a").unwrap().unwrap();
        assert_eq!(slot.value, Some(json!(1)));
        assert!(slot.updated_at.is_some());
    }

    #[test]
    fn bindings_are_one_to_one() {
        let mut store = MemoryStore::default();
        store.bind("devices", 0, "A").unwrap();
        assert!(matches!(store.bind("devices", 0, "B"), Err(StoreError::Conflict(_))));
        assert!(matches!(store.bind("devices", 1, "A"), Err(StoreError::Conflict(_))));
        store.bind("items", 0, "A").unwrap();

        let table = store.bindings("devices").unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&0).map(String::as_str), Some("A"));
    }
}
