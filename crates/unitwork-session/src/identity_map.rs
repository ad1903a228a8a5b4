//! Identity Map pattern for tracking unique instances per primary key.
//!
//! The identity map ensures that each stored row corresponds to exactly one
//! [`Instance`] within a session. This provides:
//!
//! - **Uniqueness**: the same key always yields the same handle
//! - **Cache**: a `get` by key does not touch the store when the row is tracked
//! - **Consistency**: changes through one handle are visible through every other
//!
//! # Example
//!
//! ```
//! use unitwork_core::Value;
//! use unitwork_session::{IdentityKey, IdentityMap};
//!
//! let map = IdentityMap::new();
//! let key = IdentityKey::new("user", vec![Value::BigInt(1)]);
//! assert!(map.get(&key).is_none());
//! assert_eq!(key.to_string(), "user(1)");
//! ```

use crate::instance::Instance;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use unitwork_core::{Error, Result, Value};

/// (table name, primary-key values) identifying one stored row.
///
/// Integer variants compare numerically, so `Int(1)` and `BigInt(1)` name
/// the same row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct IdentityKey {
    table: String,
    values: Vec<Value>,
}

impl IdentityKey {
    pub fn new(table: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            table: table.into(),
            values,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// A key with a NULL component cannot name a stored row.
    pub fn is_complete(&self) -> bool {
        !self.values.is_empty() && self.values.iter().all(|v| !v.is_null())
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<String> = self.values.iter().map(ToString::to_string).collect();
        write!(f, "{}({})", self.table, values.join(", "))
    }
}

/// One canonical instance per identity key.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<IdentityKey, Instance>,
}

impl IdentityMap {
    /// Create a new empty identity map.
    pub fn new() -> Self {
        Self::default()
    }

    /// The instance registered under `key`, if any.
    pub fn get(&self, key: &IdentityKey) -> Option<Instance> {
        self.entries.get(key).cloned()
    }

    /// Register an instance under its identity key.
    ///
    /// Registering the same instance twice is a no-op. A different instance
    /// under the same key is an [`Error::IdentityConflict`].
    pub fn register(&mut self, instance: &Instance) -> Result<()> {
        let key = instance.identity_key().ok_or_else(|| {
            Error::Custom(format!(
                "instance of '{}' has no identity key to register",
                instance.table_name()
            ))
        })?;
        if let Some(existing) = self.entries.get(&key) {
            if Instance::ptr_eq(existing, instance) {
                return Ok(());
            }
            return Err(Error::IdentityConflict {
                key: key.to_string(),
            });
        }
        tracing::trace!(key = %key, "Registered instance");
        self.entries.insert(key, instance.clone());
        Ok(())
    }

    /// Remove the entry for this instance.
    ///
    /// Only removes when the registered handle is this very instance.
    pub fn forget(&mut self, instance: &Instance) -> bool {
        let Some(key) = instance.identity_key() else {
            return false;
        };
        match self.entries.get(&key) {
            Some(existing) if Instance::ptr_eq(existing, instance) => {
                self.entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Is this very instance registered?
    pub fn contains(&self, instance: &Instance) -> bool {
        instance
            .identity_key()
            .and_then(|key| self.entries.get(&key).map(|e| Instance::ptr_eq(e, instance)))
            .unwrap_or(false)
    }

    pub fn contains_key(&self, key: &IdentityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Every registered instance, in no particular order.
    pub fn instances(&self) -> Vec<Instance> {
        self.entries.values().cloned().collect()
    }

    /// Remove every entry, returning the instances that were registered.
    pub fn drain(&mut self) -> Vec<Instance> {
        self.entries.drain().map(|(_, inst)| inst).collect()
    }

    /// Get the number of tracked instances.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the identity map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::SessionId;
    use std::sync::Arc;
    use unitwork_core::{Column, SqlType, Table};

    fn table() -> Arc<Table> {
        Arc::new(
            Table::builder("user")
                .column(Column::new("id", SqlType::Integer).primary_key())
                .column(Column::new("name", SqlType::Text))
                .build()
                .unwrap(),
        )
    }

    fn persistent(id: i64, name: &str) -> Instance {
        Instance::new_persistent(
            &table(),
            SessionId::next(),
            vec![Value::BigInt(id), name.into()],
            IdentityKey::new("user", vec![Value::BigInt(id)]),
        )
    }

    #[test]
    fn test_identity_map_register_and_get() {
        let mut map = IdentityMap::new();
        let ed = persistent(1, "ed");
        map.register(&ed).unwrap();

        let found = map.get(&IdentityKey::new("user", vec![Value::Int(1)])).unwrap();
        assert!(Instance::ptr_eq(&found, &ed));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_identity_map_register_twice_is_noop() {
        let mut map = IdentityMap::new();
        let ed = persistent(1, "ed");
        map.register(&ed).unwrap();
        map.register(&ed.clone()).unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_identity_map_conflict() {
        let mut map = IdentityMap::new();
        map.register(&persistent(1, "ed")).unwrap();
        let err = map.register(&persistent(1, "imposter")).unwrap_err();
        assert!(matches!(err, Error::IdentityConflict { ref key } if key == "user(1)"));
    }

    #[test]
    fn test_identity_map_forget_only_own_entry() {
        let mut map = IdentityMap::new();
        let ed = persistent(1, "ed");
        map.register(&ed).unwrap();

        assert!(!map.forget(&persistent(1, "other")));
        assert!(map.contains(&ed));
        assert!(map.forget(&ed));
        assert!(map.is_empty());
        assert!(!map.forget(&ed));
    }

    #[test]
    fn test_identity_map_rejects_keyless() {
        let mut map = IdentityMap::new();
        assert!(map.register(&Instance::new(&table())).is_err());
    }

    #[test]
    fn test_composite_key_display() {
        let key = IdentityKey::new("link", vec![Value::BigInt(1), Value::from("a")]);
        assert_eq!(key.to_string(), "link(1, 'a')");
        assert!(key.is_complete());
        assert!(!IdentityKey::new("link", vec![Value::Null]).is_complete());
    }
}
