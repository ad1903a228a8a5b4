//! Tracked entity instances.
//!
//! An [`Instance`] is a cheap, clonable handle to one row-shaped record bound
//! to a [`Table`]. Clones share state and [`Instance::ptr_eq`] is the identity
//! test. Handles are `!Send`: a session and everything it tracks live on one
//! thread.
//!
//! Instances know nothing about connections. Reading an expired instance,
//! loading an unloaded relationship and persisting changes all go through the
//! owning [`Session`](crate::Session).

use crate::identity_map::IdentityKey;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use unitwork_core::{
    Error, Model, Relationship, RelationshipKind, Result, Row, SchemaErrorKind, Table, Value,
};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique instance number, stable for the life of the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    fn next() -> Self {
        Self(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Process-unique session number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A many-to-one reference held by an instance.
#[derive(Clone)]
pub(crate) enum Reference {
    /// Explicitly set to nothing.
    Cleared,
    /// Points at a parent without keeping it alive.
    To(Weak<RefCell<InstanceData>>),
    /// Owns a parent that has no identity key yet. Nothing else may hold a
    /// transient parent, so the child keeps it alive until it is flushed.
    Held(Instance),
}

impl Reference {
    fn to(target: &Instance, holder: &Instance) -> Self {
        if target.identity_key().is_none() && !Instance::ptr_eq(target, holder) {
            Reference::Held(target.clone())
        } else {
            Reference::To(target.downgrade())
        }
    }

    fn target(&self) -> Option<Instance> {
        match self {
            Reference::Cleared => None,
            Reference::To(weak) => weak.upgrade().map(Instance),
            Reference::Held(target) => Some(target.clone()),
        }
    }
}

/// A loaded one-to-many collection.
#[derive(Default)]
pub(crate) struct Collection {
    pub(crate) items: Vec<Instance>,
    /// Membership as of the last load or flush.
    pub(crate) baseline: Vec<Instance>,
}

impl Collection {
    fn contains(&self, child: &Instance) -> bool {
        self.items.iter().any(|c| Instance::ptr_eq(c, child))
    }

    /// Baseline members no longer in the collection.
    pub(crate) fn removed(&self) -> Vec<Instance> {
        self.baseline
            .iter()
            .filter(|b| !self.contains(b))
            .cloned()
            .collect()
    }
}

pub(crate) struct InstanceData {
    pub(crate) id: InstanceId,
    pub(crate) table: Arc<Table>,
    /// Current values, aligned with `table.columns()`.
    pub(crate) values: Vec<Value>,
    /// Values as of the last load or flush; `None` until persisted.
    pub(crate) baseline: Option<Vec<Value>>,
    /// Column indexes assigned since the baseline.
    pub(crate) modified: BTreeSet<usize>,
    pub(crate) expired: bool,
    pub(crate) owner: Option<SessionId>,
    pub(crate) key: Option<IdentityKey>,
    pub(crate) references: HashMap<String, Reference>,
    pub(crate) collections: HashMap<String, Collection>,
}

impl InstanceData {
    pub(crate) fn column_index(&self, column: &str) -> Result<usize> {
        column_position(&self.table, column).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::ColumnNotFound,
                format!(
                    "table '{}' has no column '{}'",
                    self.table.name(),
                    column
                ),
            )
        })
    }

    pub(crate) fn pk_values(&self) -> Vec<Value> {
        self.table
            .primary_key()
            .iter()
            .map(|pk| column_position(&self.table, pk).map_or(Value::Null, |i| self.values[i].clone()))
            .collect()
    }

    /// Modified columns whose value differs from the baseline.
    pub(crate) fn changed_columns(&self) -> Vec<usize> {
        match &self.baseline {
            None => self.modified.iter().copied().collect(),
            Some(base) => self
                .modified
                .iter()
                .copied()
                .filter(|&i| base[i] != self.values[i])
                .collect(),
        }
    }

    /// Assign a column, refusing primary-key changes once a key is assigned.
    fn assign(&mut self, index: usize, value: Value) -> Result<()> {
        if let Some(key) = &self.key {
            if self.table.columns()[index].is_primary_key() && self.values[index] != value {
                return Err(Error::Custom(format!(
                    "cannot change primary key column '{}' of persistent instance {}",
                    self.table.columns()[index].name(),
                    key
                )));
            }
        }
        self.values[index] = value;
        self.modified.insert(index);
        Ok(())
    }

    fn is_expired_column(&self, index: usize) -> bool {
        self.expired && !self.modified.contains(&index)
    }
}

pub(crate) fn column_position(table: &Table, column: &str) -> Option<usize> {
    table.columns().iter().position(|c| c.name() == column)
}

fn expired_error(data: &InstanceData) -> Error {
    Error::Custom(format!(
        "instance of '{}' is expired; load it through its session first",
        data.table.name()
    ))
}

fn not_loaded(table: &str, relationship: &str) -> Error {
    Error::Custom(format!(
        "collection '{}.{}' is not loaded; access it through the session first",
        table, relationship
    ))
}

/// Handle to a tracked (or trackable) record.
///
/// ```
/// use std::sync::Arc;
/// use unitwork_core::{Column, SqlType, Table, Value};
/// use unitwork_session::Instance;
///
/// let user = Arc::new(
///     Table::builder("user")
///         .column(Column::new("id", SqlType::Integer).primary_key())
///         .column(Column::new("name", SqlType::VarChar(50)))
///         .build()
///         .unwrap(),
/// );
/// let ed = Instance::with_values(&user, [("name", "ed")]).unwrap();
/// assert_eq!(ed.get("name"), Some(Value::from("ed")));
/// assert_eq!(ed.get("id"), Some(Value::Null));
/// assert!(ed.identity_key().is_none());
/// ```
#[derive(Clone)]
pub struct Instance(Rc<RefCell<InstanceData>>);

impl Instance {
    /// A transient instance with every column NULL.
    pub fn new(table: &Arc<Table>) -> Self {
        Self(Rc::new(RefCell::new(InstanceData {
            id: InstanceId::next(),
            table: Arc::clone(table),
            values: vec![Value::Null; table.columns().len()],
            baseline: None,
            modified: BTreeSet::new(),
            expired: false,
            owner: None,
            key: None,
            references: HashMap::new(),
            collections: HashMap::new(),
        })))
    }

    /// A transient instance with the given column values.
    pub fn with_values<I, K, V>(table: &Arc<Table>, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let instance = Self::new(table);
        for (column, value) in values {
            instance.set(column.as_ref(), value)?;
        }
        Ok(instance)
    }

    /// A transient instance populated from a typed model.
    pub fn from_model<M: Model>(table: &Arc<Table>, model: &M) -> Result<Self> {
        if table.name() != M::TABLE_NAME {
            return Err(Error::schema(
                SchemaErrorKind::Invalid,
                format!(
                    "model for '{}' cannot populate table '{}'",
                    M::TABLE_NAME,
                    table.name()
                ),
            ));
        }
        Self::with_values(table, model.to_row())
    }

    /// Convert the current values into a typed model.
    ///
    /// Fails on an expired instance; use [`Session::load`](crate::Session::load)
    /// first.
    pub fn to_model<M: Model>(&self) -> Result<M> {
        let row = {
            let data = self.0.borrow();
            if data.expired {
                return Err(expired_error(&data));
            }
            let names = data.table.column_names().map(str::to_string).collect();
            Row::new(names, data.values.clone())
        };
        M::from_row(&row)
    }

    pub(crate) fn new_persistent(
        table: &Arc<Table>,
        owner: SessionId,
        values: Vec<Value>,
        key: IdentityKey,
    ) -> Self {
        let instance = Self::new(table);
        {
            let mut data = instance.0.borrow_mut();
            data.baseline = Some(values.clone());
            data.values = values;
            data.owner = Some(owner);
            data.key = Some(key);
        }
        instance
    }

    pub fn id(&self) -> InstanceId {
        self.0.borrow().id
    }

    /// Are both handles the same instance?
    pub fn ptr_eq(a: &Instance, b: &Instance) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    pub fn table(&self) -> Arc<Table> {
        Arc::clone(&self.0.borrow().table)
    }

    pub fn table_name(&self) -> String {
        self.0.borrow().table.name().to_string()
    }

    /// The identity key, once the instance has been persisted or loaded.
    pub fn identity_key(&self) -> Option<IdentityKey> {
        self.0.borrow().key.clone()
    }

    pub fn is_expired(&self) -> bool {
        self.0.borrow().expired
    }

    /// Current value of a column.
    ///
    /// `None` for unknown columns and for columns of an expired instance that
    /// have not been assigned since expiry.
    pub fn get(&self, column: &str) -> Option<Value> {
        let data = self.0.borrow();
        let index = column_position(&data.table, column)?;
        if data.is_expired_column(index) {
            return None;
        }
        Some(data.values[index].clone())
    }

    /// Assign a column and record it as modified.
    ///
    /// Primary-key columns cannot change once the store has assigned the
    /// identity key.
    pub fn set(&self, column: &str, value: impl Into<Value>) -> Result<()> {
        let mut data = self.0.borrow_mut();
        let index = data.column_index(column)?;
        data.assign(index, value.into())
    }

    /// Assign only when the value differs, so an unchanged foreign key is not
    /// reported as modified.
    pub(crate) fn assign_if_changed(&self, column: &str, value: Value) -> Result<bool> {
        let mut data = self.0.borrow_mut();
        let index = data.column_index(column)?;
        if !data.is_expired_column(index) && data.values[index] == value {
            return Ok(false);
        }
        data.assign(index, value)?;
        Ok(true)
    }

    /// Names of columns assigned since the last load or flush.
    pub fn modified_columns(&self) -> Vec<String> {
        let data = self.0.borrow();
        data.modified
            .iter()
            .map(|&i| data.table.columns()[i].name().to_string())
            .collect()
    }

    /// Column values as a JSON object.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let data = self.0.borrow();
        if data.expired {
            return Err(expired_error(&data));
        }
        let mut map = serde_json::Map::new();
        for (column, value) in data.table.columns().iter().zip(&data.values) {
            map.insert(column.name().to_string(), value.to_json());
        }
        Ok(serde_json::Value::Object(map))
    }

    // ========================================================================
    // Relationships
    // ========================================================================

    fn relationship_of(&self, name: &str, kind: RelationshipKind) -> Result<Relationship> {
        let data = self.0.borrow();
        let rel = data.table.require_relationship(name)?;
        if rel.kind() != kind {
            let hint = match kind {
                RelationshipKind::ManyToOne => "is a collection",
                RelationshipKind::OneToMany => "is not a collection",
            };
            return Err(Error::schema(
                SchemaErrorKind::Invalid,
                format!("relationship '{}.{}' {}", data.table.name(), name, hint),
            ));
        }
        Ok(rel.clone())
    }

    fn check_target(rel: &Relationship, other: &Instance) -> Result<()> {
        let other_table = other.table_name();
        if other_table != rel.target() {
            return Err(Error::schema(
                SchemaErrorKind::Invalid,
                format!(
                    "relationship '{}' holds '{}' instances, not '{}'",
                    rel.name(),
                    rel.target(),
                    other_table
                ),
            ));
        }
        Ok(())
    }

    /// Point a many-to-one relationship at `target`, or clear it.
    ///
    /// The foreign-key column follows at once when the target already has an
    /// identity key, otherwise at flush. With `back_populates` the target's
    /// collection is kept in step when it is loaded.
    pub fn set_related(&self, relationship: &str, target: Option<&Instance>) -> Result<()> {
        let rel = self.relationship_of(relationship, RelationshipKind::ManyToOne)?;
        if let Some(t) = target {
            Self::check_target(&rel, t)?;
        }
        let previous = self.reference(rel.name());
        let fk_value = match target {
            Some(t) => t.single_key_value(),
            None => Some(Value::Null),
        };
        if let Some(value) = fk_value {
            self.assign_if_changed(rel.foreign_key(), value)?;
        }
        let reference = target.map_or(Reference::Cleared, |t| Reference::to(t, self));
        self.0
            .borrow_mut()
            .references
            .insert(rel.name().to_string(), reference);
        if let Some(back) = rel.back_populates_name() {
            if let Some(prev) = previous.filter(|p| target.is_none_or(|t| !Instance::ptr_eq(p, t))) {
                prev.collection_remove(back, self);
            }
            if let Some(t) = target {
                t.collection_push(back, self);
            }
        }
        Ok(())
    }

    /// Append `child` to a one-to-many collection.
    ///
    /// The collection must be loaded unless this instance was never
    /// persisted; [`Session::append`](crate::Session::append) loads it first.
    pub fn append(&self, relationship: &str, child: &Instance) -> Result<()> {
        let rel = self.relationship_of(relationship, RelationshipKind::OneToMany)?;
        Self::check_target(&rel, child)?;
        {
            let mut data = self.0.borrow_mut();
            let persisted = data.key.is_some();
            let table = data.table.name().to_string();
            let collection = match data.collections.entry(rel.name().to_string()) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) if !persisted => e.insert(Collection::default()),
                Entry::Vacant(_) => return Err(not_loaded(&table, rel.name())),
            };
            if !collection.contains(child) {
                collection.items.push(child.clone());
            }
        }
        if let Some(value) = self.single_key_value() {
            child.assign_if_changed(rel.foreign_key(), value)?;
        }
        if let Some(back) = rel.back_populates_name() {
            if let Some(prev) = child.reference(back).filter(|p| !Instance::ptr_eq(p, self)) {
                prev.collection_remove(rel.name(), child);
            }
            child
                .0
                .borrow_mut()
                .references
                .insert(back.to_string(), Reference::To(self.downgrade()));
        }
        Ok(())
    }

    /// Remove `child` from a one-to-many collection.
    ///
    /// Returns whether it was a member. The child's foreign key is settled at
    /// flush: deleted under `delete-orphan`, otherwise set to NULL.
    pub fn remove(&self, relationship: &str, child: &Instance) -> Result<bool> {
        let rel = self.relationship_of(relationship, RelationshipKind::OneToMany)?;
        {
            let data = self.0.borrow();
            if data.key.is_some() && !data.collections.contains_key(rel.name()) {
                return Err(not_loaded(data.table.name(), rel.name()));
            }
        }
        let removed = self.collection_remove(rel.name(), child);
        if removed {
            if let Some(back) = rel.back_populates_name() {
                if child.reference(back).is_some_and(|p| Instance::ptr_eq(&p, self)) {
                    child
                        .0
                        .borrow_mut()
                        .references
                        .insert(back.to_string(), Reference::Cleared);
                }
            }
        }
        Ok(removed)
    }

    /// Members of a loaded collection; `None` when not loaded.
    pub fn loaded_collection(&self, relationship: &str) -> Option<Vec<Instance>> {
        self.0
            .borrow()
            .collections
            .get(relationship)
            .map(|c| c.items.clone())
    }

    /// Live target of a many-to-one reference.
    pub(crate) fn reference(&self, relationship: &str) -> Option<Instance> {
        self.0
            .borrow()
            .references
            .get(relationship)
            .and_then(Reference::target)
    }

    /// `Some(None)` when explicitly cleared, `Some(Some(..))` when pointing
    /// at a live instance, `None` when unknown.
    pub(crate) fn reference_state(&self, relationship: &str) -> Option<Option<Instance>> {
        match self.0.borrow().references.get(relationship) {
            Some(Reference::Cleared) => Some(None),
            Some(reference) => reference.target().map(Some),
            None => None,
        }
    }

    pub(crate) fn cache_reference(&self, relationship: &str, target: Option<&Instance>) {
        self.0.borrow_mut().references.insert(
            relationship.to_string(),
            target.map_or(Reference::Cleared, |t| Reference::To(t.downgrade())),
        );
    }

    pub(crate) fn cache_collection(&self, relationship: &str, items: Vec<Instance>) {
        self.0.borrow_mut().collections.insert(
            relationship.to_string(),
            Collection {
                baseline: items.clone(),
                items,
            },
        );
    }

    pub(crate) fn has_collection(&self, relationship: &str) -> bool {
        self.0.borrow().collections.contains_key(relationship)
    }

    /// Add to a collection if loaded, creating it for never-persisted
    /// instances.
    fn collection_push(&self, relationship: &str, child: &Instance) {
        let mut data = self.0.borrow_mut();
        let persisted = data.key.is_some();
        let collection = match data.collections.entry(relationship.to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) if !persisted => e.insert(Collection::default()),
            Entry::Vacant(_) => return,
        };
        if !collection.contains(child) {
            collection.items.push(child.clone());
        }
    }

    fn collection_remove(&self, relationship: &str, child: &Instance) -> bool {
        let mut data = self.0.borrow_mut();
        match data.collections.get_mut(relationship) {
            Some(collection) => {
                let before = collection.items.len();
                collection.items.retain(|c| !Instance::ptr_eq(c, child));
                collection.items.len() != before
            }
            None => false,
        }
    }

    /// The single primary-key value once a key is assigned.
    pub(crate) fn single_key_value(&self) -> Option<Value> {
        let data = self.0.borrow();
        match &data.key {
            Some(key) if key.values().len() == 1 => Some(key.values()[0].clone()),
            _ => None,
        }
    }

    // ========================================================================
    // Session bookkeeping
    // ========================================================================

    pub(crate) fn data(&self) -> Ref<'_, InstanceData> {
        self.0.borrow()
    }

    pub(crate) fn data_mut(&self) -> RefMut<'_, InstanceData> {
        self.0.borrow_mut()
    }

    fn downgrade(&self) -> Weak<RefCell<InstanceData>> {
        Rc::downgrade(&self.0)
    }

    pub(crate) fn owner(&self) -> Option<SessionId> {
        self.0.borrow().owner
    }

    /// Overwrite from a freshly read row, keeping columns assigned since
    /// expiry.
    pub(crate) fn populate(&self, row: Vec<Value>) {
        let mut data = self.0.borrow_mut();
        let keep: Vec<usize> = if data.expired {
            data.modified.iter().copied().collect()
        } else {
            Vec::new()
        };
        let mut values = row.clone();
        for i in keep {
            values[i] = data.values[i].clone();
        }
        data.values = values;
        data.baseline = Some(row);
        if !data.expired {
            data.modified.clear();
        }
        data.expired = false;
    }

    /// Discard loaded state; the next read goes to the store.
    pub(crate) fn expire(&self) {
        let mut data = self.0.borrow_mut();
        data.expired = true;
        data.modified.clear();
        data.references.clear();
        data.collections.clear();
    }

    /// Restore modified columns to the baseline.
    pub(crate) fn revert(&self) {
        let mut data = self.0.borrow_mut();
        if let Some(base) = data.baseline.clone() {
            let modified: Vec<usize> = data.modified.iter().copied().collect();
            for i in modified {
                data.values[i] = base[i].clone();
            }
        }
        data.modified.clear();
    }

    /// The current values become the new baseline.
    ///
    /// Held parents that have been given a key are let go; the identity map
    /// keeps them alive from here on.
    pub(crate) fn mark_flushed(&self) {
        let mut data = self.0.borrow_mut();
        data.baseline = Some(data.values.clone());
        data.modified.clear();
        for collection in data.collections.values_mut() {
            collection.baseline = collection.items.clone();
        }
        for reference in data.references.values_mut() {
            if let Reference::Held(target) = reference {
                if target.identity_key().is_some() {
                    *reference = Reference::To(target.downgrade());
                }
            }
        }
    }

    /// Current collection membership becomes the new baseline.
    pub(crate) fn settle_collections(&self) {
        for collection in self.0.borrow_mut().collections.values_mut() {
            collection.baseline = collection.items.clone();
        }
    }

    /// Loaded collections as (relationship, removed members) pairs.
    pub(crate) fn collection_removals(&self) -> Vec<(String, Vec<Instance>)> {
        self.0
            .borrow()
            .collections
            .iter()
            .map(|(name, c)| (name.clone(), c.removed()))
            .filter(|(_, removed)| !removed.is_empty())
            .collect()
    }

    /// Loaded collections as (relationship, members) pairs.
    pub(crate) fn collection_members(&self) -> Vec<(String, Vec<Instance>)> {
        self.0
            .borrow()
            .collections
            .iter()
            .map(|(name, c)| (name.clone(), c.items.clone()))
            .collect()
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(data) => f
                .debug_struct("Instance")
                .field("id", &data.id.0)
                .field("table", &data.table.name())
                .field("key", &data.key)
                .field("expired", &data.expired)
                .finish(),
            Err(_) => f.debug_struct("Instance").finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unitwork_core::{Cascade, Column, SqlType};

    fn user_table() -> Arc<Table> {
        Arc::new(
            Table::builder("user")
                .column(Column::new("id", SqlType::Integer).primary_key())
                .column(Column::new("name", SqlType::VarChar(50)))
                .column(Column::new("fullname", SqlType::VarChar(50)))
                .relationship(
                    Relationship::one_to_many("addresses", "address", "user_id")
                        .cascade(Cascade::ALL)
                        .back_populates("user"),
                )
                .build()
                .unwrap(),
        )
    }

    fn address_table() -> Arc<Table> {
        Arc::new(
            Table::builder("address")
                .column(Column::new("id", SqlType::Integer).primary_key())
                .column(Column::new("email_address", SqlType::VarChar(100)).not_null())
                .column(Column::new("user_id", SqlType::Integer).foreign_key("user.id"))
                .relationship(
                    Relationship::many_to_one("user", "user", "user_id").back_populates("addresses"),
                )
                .build()
                .unwrap(),
        )
    }

    struct UserRow {
        id: Option<i64>,
        name: String,
    }

    impl Model for UserRow {
        const TABLE_NAME: &'static str = "user";

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![("id", self.id.into()), ("name", self.name.clone().into())]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
                name: row.get_named("name")?,
            })
        }
    }

    #[test]
    fn test_new_instance_is_null_and_unmodified() {
        let user = Instance::new(&user_table());
        assert_eq!(user.get("name"), Some(Value::Null));
        assert!(user.modified_columns().is_empty());
        assert!(user.get("nope").is_none());
    }

    #[test]
    fn test_set_records_modified() {
        let user = Instance::new(&user_table());
        user.set("name", "ed").unwrap();
        user.set("fullname", "Ed Jones").unwrap();
        assert_eq!(user.modified_columns(), vec!["name", "fullname"]);
    }

    #[test]
    fn test_set_unknown_column() {
        let user = Instance::new(&user_table());
        let err = user.set("nickname", "eddie").unwrap_err();
        assert!(matches!(
            err,
            Error::Schema(ref s) if s.kind == SchemaErrorKind::ColumnNotFound
        ));
    }

    #[test]
    fn test_clones_share_state() {
        let a = Instance::new(&user_table());
        let b = a.clone();
        b.set("name", "wendy").unwrap();
        assert_eq!(a.get("name"), Some(Value::from("wendy")));
        assert!(Instance::ptr_eq(&a, &b));
        assert!(!Instance::ptr_eq(&a, &Instance::new(&user_table())));
    }

    #[test]
    fn test_primary_key_frozen_once_keyed() {
        let table = user_table();
        let key = IdentityKey::new("user", vec![Value::BigInt(1)]);
        let user = Instance::new_persistent(
            &table,
            SessionId::next(),
            vec![Value::BigInt(1), "ed".into(), Value::Null],
            key,
        );
        assert!(user.set("id", 2i64).is_err());
        user.set("id", 1i64).unwrap();
        user.set("name", "eddie").unwrap();
    }

    #[test]
    fn test_changed_columns_ignores_set_back() {
        let table = user_table();
        let user = Instance::new_persistent(
            &table,
            SessionId::next(),
            vec![Value::BigInt(1), "ed".into(), Value::Null],
            IdentityKey::new("user", vec![Value::BigInt(1)]),
        );
        user.set("name", "eddie").unwrap();
        user.set("name", "ed").unwrap();
        assert!(user.data().changed_columns().is_empty());
        user.set("fullname", "Ed Jones").unwrap();
        assert_eq!(user.data().changed_columns(), vec![2]);
    }

    #[test]
    fn test_expired_columns_hidden_until_assigned() {
        let table = user_table();
        let user = Instance::new_persistent(
            &table,
            SessionId::next(),
            vec![Value::BigInt(1), "ed".into(), Value::Null],
            IdentityKey::new("user", vec![Value::BigInt(1)]),
        );
        user.expire();
        assert!(user.get("name").is_none());
        assert!(user.to_json().is_err());
        user.set("fullname", "Ed Jones").unwrap();
        assert_eq!(user.get("fullname"), Some(Value::from("Ed Jones")));

        user.populate(vec![Value::BigInt(1), "edward".into(), Value::Null]);
        assert_eq!(user.get("name"), Some(Value::from("edward")));
        assert_eq!(user.get("fullname"), Some(Value::from("Ed Jones")));
        assert_eq!(user.modified_columns(), vec!["fullname"]);
    }

    #[test]
    fn test_revert_restores_baseline() {
        let table = user_table();
        let user = Instance::new_persistent(
            &table,
            SessionId::next(),
            vec![Value::BigInt(1), "ed".into(), Value::Null],
            IdentityKey::new("user", vec![Value::BigInt(1)]),
        );
        user.set("name", "eddie").unwrap();
        user.revert();
        assert_eq!(user.get("name"), Some(Value::from("ed")));
        assert!(user.modified_columns().is_empty());
    }

    #[test]
    fn test_model_round_trip() {
        let table = user_table();
        let user = Instance::from_model(
            &table,
            &UserRow {
                id: None,
                name: "jack".into(),
            },
        )
        .unwrap();
        let back: UserRow = user.to_model().unwrap();
        assert_eq!(back.id, None);
        assert_eq!(back.name, "jack");
    }

    #[test]
    fn test_from_model_checks_table() {
        let err = Instance::from_model(
            &address_table(),
            &UserRow {
                id: None,
                name: "jack".into(),
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot populate"));
    }

    #[test]
    fn test_to_json() {
        let user = Instance::with_values(&user_table(), [("name", "ed")]).unwrap();
        assert_eq!(
            user.to_json().unwrap(),
            serde_json::json!({"id": null, "name": "ed", "fullname": null})
        );
    }

    #[test]
    fn test_append_back_populates() {
        let jack = Instance::with_values(&user_table(), [("name", "jack")]).unwrap();
        let addr = Instance::with_values(&address_table(), [("email_address", "jack@google.com")])
            .unwrap();
        jack.append("addresses", &addr).unwrap();

        let members = jack.loaded_collection("addresses").unwrap();
        assert_eq!(members.len(), 1);
        assert!(Instance::ptr_eq(&addr.reference("user").unwrap(), &jack));
    }

    #[test]
    fn test_set_related_back_populates() {
        let jack = Instance::with_values(&user_table(), [("name", "jack")]).unwrap();
        let wendy = Instance::with_values(&user_table(), [("name", "wendy")]).unwrap();
        let addr = Instance::with_values(&address_table(), [("email_address", "j@j.com")]).unwrap();

        addr.set_related("user", Some(&jack)).unwrap();
        assert_eq!(jack.loaded_collection("addresses").unwrap().len(), 1);

        addr.set_related("user", Some(&wendy)).unwrap();
        assert!(jack.loaded_collection("addresses").unwrap().is_empty());
        assert_eq!(wendy.loaded_collection("addresses").unwrap().len(), 1);

        addr.set_related("user", None).unwrap();
        assert!(wendy.loaded_collection("addresses").unwrap().is_empty());
        assert!(matches!(addr.reference_state("user"), Some(None)));
    }

    #[test]
    fn test_set_related_copies_known_key() {
        let table = user_table();
        let ed = Instance::new_persistent(
            &table,
            SessionId::next(),
            vec![Value::BigInt(7), "ed".into(), Value::Null],
            IdentityKey::new("user", vec![Value::BigInt(7)]),
        );
        let addr = Instance::new(&address_table());
        addr.set_related("user", Some(&ed)).unwrap();
        assert_eq!(addr.get("user_id"), Some(Value::BigInt(7)));
    }

    #[test]
    fn test_relationship_kind_and_target_checked() {
        let jack = Instance::new(&user_table());
        let addr = Instance::new(&address_table());
        assert!(jack.set_related("addresses", Some(&addr)).is_err());
        assert!(addr.append("user", &jack).is_err());
        assert!(jack.append("addresses", &Instance::new(&user_table())).is_err());
        assert!(jack.append("friends", &addr).is_err());
    }

    #[test]
    fn test_remove_clears_back_reference() {
        let jack = Instance::new(&user_table());
        let addr = Instance::new(&address_table());
        jack.append("addresses", &addr).unwrap();
        assert!(jack.remove("addresses", &addr).unwrap());
        assert!(!jack.remove("addresses", &addr).unwrap());
        assert!(matches!(addr.reference_state("user"), Some(None)));
    }

    #[test]
    fn test_unloaded_collection_of_persistent_instance() {
        let table = user_table();
        let ed = Instance::new_persistent(
            &table,
            SessionId::next(),
            vec![Value::BigInt(1), "ed".into(), Value::Null],
            IdentityKey::new("user", vec![Value::BigInt(1)]),
        );
        let addr = Instance::new(&address_table());
        let err = ed.append("addresses", &addr).unwrap_err();
        assert!(err.to_string().contains("not loaded"));
    }

    #[test]
    fn test_collection_removals_against_baseline() {
        let jack = Instance::new(&user_table());
        let a = Instance::new(&address_table());
        let b = Instance::new(&address_table());
        jack.cache_collection("addresses", vec![a.clone(), b.clone()]);
        jack.remove("addresses", &a).unwrap();
        let removals = jack.collection_removals();
        assert_eq!(removals.len(), 1);
        assert!(Instance::ptr_eq(&removals[0].1[0], &a));

        jack.mark_flushed();
        assert!(jack.collection_removals().is_empty());
    }
}
