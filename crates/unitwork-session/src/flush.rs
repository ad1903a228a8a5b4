//! Flush operation ordering for the session.
//!
//! This module decides the order in which pending changes reach the store:
//! - INSERT parent-first (a child's foreign key needs its parent's key)
//! - UPDATE in any order, after inserts
//! - DELETE child-first (to respect FK constraints)
//!
//! Ordering is per instance, not per table, so self-referential tables
//! (a `node` whose `parent_id` names another `node`) flush correctly. A cycle
//! among pending instances is reported before any statement is built.

use crate::identity_map::IdentityKey;
use crate::instance::{Instance, InstanceId, column_position};
use std::collections::{BTreeSet, HashMap};
use unitwork_core::{
    Error, FlushError, FlushErrorKind, Predicate, RelationshipKind, Result, Statement, Value,
};

/// Builds a dependency graph between instances and orders them.
#[derive(Debug, Default)]
pub struct FlushOrderer {
    nodes: Vec<Instance>,
    index: HashMap<InstanceId, usize>,
    /// (before, after) pairs: the parent must be written before the child.
    edges: Vec<(usize, usize)>,
}

impl FlushOrderer {
    /// Build the graph for `nodes`.
    ///
    /// An instance depends on another node when it references it through a
    /// live many-to-one reference, sits in one of its loaded collections, or
    /// carries (or carried, per its baseline) a foreign key naming its key.
    pub fn new(nodes: Vec<Instance>) -> Self {
        let index = nodes.iter().enumerate().map(|(i, n)| (n.id(), i)).collect();
        let mut orderer = Self {
            nodes,
            index,
            edges: Vec::new(),
        };
        orderer.discover_edges();
        orderer
    }

    fn discover_edges(&mut self) {
        let keyed: HashMap<IdentityKey, usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.identity_key().map(|k| (k, i)))
            .collect();

        let mut found = Vec::new();
        for (child_idx, node) in self.nodes.iter().enumerate() {
            let table = node.table();
            for rel in table.relationships() {
                match rel.kind() {
                    RelationshipKind::ManyToOne => {
                        if let Some(parent) = node.reference(rel.name()) {
                            if let Some(&p) = self.index.get(&parent.id()) {
                                found.push((p, child_idx));
                            }
                        }
                    }
                    RelationshipKind::OneToMany => {
                        for child in node.loaded_collection(rel.name()).unwrap_or_default() {
                            if let Some(&c) = self.index.get(&child.id()) {
                                found.push((child_idx, c));
                            }
                        }
                    }
                }
            }

            let data = node.data();
            for (i, column) in table.columns().iter().enumerate() {
                let Some(fk) = column.references() else {
                    continue;
                };
                let mut candidates = vec![data.values[i].clone()];
                if let Some(base) = &data.baseline {
                    candidates.push(base[i].clone());
                }
                for value in candidates.into_iter().filter(|v| !v.is_null()) {
                    let key = IdentityKey::new(fk.table.clone(), vec![value]);
                    if let Some(&p) = keyed.get(&key) {
                        if self.nodes[p].table().primary_key() == std::slice::from_ref(&fk.column) {
                            found.push((p, child_idx));
                        }
                    }
                }
            }
        }
        for edge in found {
            self.add_edge(edge);
        }
    }

    fn add_edge(&mut self, (before, after): (usize, usize)) {
        if before != after && !self.edges.contains(&(before, after)) {
            self.edges.push((before, after));
        }
    }

    /// Order for INSERT: parents before children.
    pub fn parents_first(&self) -> Result<Vec<Instance>> {
        self.sort(false)
    }

    /// Order for DELETE: children before parents.
    pub fn children_first(&self) -> Result<Vec<Instance>> {
        self.sort(true)
    }

    /// Kahn's algorithm, stable with respect to the input order.
    fn sort(&self, reverse: bool) -> Result<Vec<Instance>> {
        let n = self.nodes.len();
        let mut indegree = vec![0usize; n];
        let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); n];
        for &(before, after) in &self.edges {
            let (from, to) = if reverse { (after, before) } else { (before, after) };
            outgoing[from].push(to);
            indegree[to] += 1;
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(next) = ready.pop_first() {
            order.push(self.nodes[next].clone());
            for &to in &outgoing[next] {
                indegree[to] -= 1;
                if indegree[to] == 0 {
                    ready.insert(to);
                }
            }
        }

        if order.len() < n {
            let stuck: Vec<String> = (0..n)
                .filter(|&i| indegree[i] > 0)
                .map(|i| describe(&self.nodes[i]))
                .collect();
            tracing::warn!(count = stuck.len(), "Dependency cycle detected in flush");
            return Err(Error::Flush(FlushError {
                kind: FlushErrorKind::DependencyCycle,
                message: format!("dependency cycle between instances: {}", stuck.join(", ")),
                source: None,
            }));
        }
        Ok(order)
    }
}

fn describe(instance: &Instance) -> String {
    instance
        .identity_key()
        .map_or_else(|| format!("{}(pending)", instance.table_name()), |k| k.to_string())
}

/// Instances to write, already ordered.
#[derive(Debug, Default)]
pub struct FlushPlan {
    /// Pending instances, parents first.
    pub inserts: Vec<Instance>,
    /// Dirty instances, any order.
    pub updates: Vec<Instance>,
    /// Deleted instances, children first.
    pub deletes: Vec<Instance>,
}

impl FlushPlan {
    /// Order the instances of a change set.
    ///
    /// Fails with [`FlushErrorKind::DependencyCycle`] when the inserts or the
    /// deletes cannot be ordered.
    pub fn build(
        pending: Vec<Instance>,
        dirty: Vec<Instance>,
        deleted: Vec<Instance>,
    ) -> Result<Self> {
        Ok(Self {
            inserts: FlushOrderer::new(pending).parents_first()?,
            updates: dirty,
            deletes: FlushOrderer::new(deleted).children_first()?,
        })
    }

    /// Check if the plan has any operations.
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty() && self.updates.is_empty()
    }

    /// Total number of operations in the plan.
    pub fn len(&self) -> usize {
        self.deletes.len() + self.inserts.len() + self.updates.len()
    }
}

/// Result of a flush operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
}

impl FlushResult {
    /// Total number of operations.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

// ============================================================================
// Statement construction
// ============================================================================

/// INSERT for a pending instance. A NULL autoincrement column is left out so
/// the store generates it.
pub(crate) fn insert_statement(instance: &Instance) -> Statement {
    let data = instance.data();
    let mut columns = Vec::new();
    let mut values = Vec::new();
    for (column, value) in data.table.columns().iter().zip(&data.values) {
        if column.is_autoincrement() && value.is_null() {
            continue;
        }
        columns.push(column.name().to_string());
        values.push(value.clone());
    }
    Statement::Insert {
        table: data.table.name().to_string(),
        columns,
        values,
    }
}

fn key_predicates(instance: &Instance) -> Vec<Predicate> {
    let data = instance.data();
    let key_values: Vec<Value> = match &data.key {
        Some(key) => key.values().to_vec(),
        None => data.pk_values(),
    };
    data.table
        .primary_key()
        .iter()
        .zip(key_values)
        .map(|(col, value)| Predicate::eq(col.clone(), value))
        .collect()
}

/// UPDATE of the changed columns, or `None` when nothing really changed.
pub(crate) fn update_statement(instance: &Instance) -> Option<Statement> {
    let (table, assignments) = {
        let data = instance.data();
        let changed = data.changed_columns();
        if changed.is_empty() {
            return None;
        }
        let assignments: Vec<(String, Value)> = changed
            .into_iter()
            .map(|i| {
                (
                    data.table.columns()[i].name().to_string(),
                    data.values[i].clone(),
                )
            })
            .collect();
        (data.table.name().to_string(), assignments)
    };
    Some(Statement::Update {
        table,
        assignments,
        predicates: key_predicates(instance),
    })
}

/// DELETE by identity key.
pub(crate) fn delete_statement(instance: &Instance) -> Statement {
    Statement::Delete {
        table: instance.table_name(),
        predicates: key_predicates(instance),
    }
}

/// Identity key from the instance's current primary-key values.
pub(crate) fn key_from_values(instance: &Instance) -> Option<IdentityKey> {
    let data = instance.data();
    let key = IdentityKey::new(data.table.name(), data.pk_values());
    key.is_complete().then_some(key)
}

/// Write a generated key into a NULL autoincrement column. Returns whether
/// it was written.
pub(crate) fn write_generated_key(instance: &Instance, generated: Option<i64>) -> bool {
    let Some(id) = generated else {
        return false;
    };
    let mut data = instance.data_mut();
    let Some(column) = data.table.autoincrement_column().map(|c| c.name().to_string()) else {
        return false;
    };
    match column_position(&data.table, &column) {
        Some(i) if data.values[i].is_null() => {
            data.values[i] = Value::BigInt(id);
            true
        }
        _ => false,
    }
}

/// Undo [`write_generated_key`] after the insert was rolled back.
pub(crate) fn clear_generated_key(instance: &Instance) {
    let mut data = instance.data_mut();
    let Some(column) = data.table.autoincrement_column().map(|c| c.name().to_string()) else {
        return;
    };
    if let Some(i) = column_position(&data.table, &column) {
        data.values[i] = Value::Null;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::SessionId;
    use std::sync::Arc;
    use unitwork_core::{Column, Relationship, SqlType, Table};

    fn node_table() -> Arc<Table> {
        Arc::new(
            Table::builder("node")
                .column(Column::new("id", SqlType::Integer).primary_key())
                .column(Column::new("parent_id", SqlType::Integer).foreign_key("node.id"))
                .column(Column::new("data", SqlType::Text))
                .relationship(Relationship::many_to_one("parent", "node", "parent_id"))
                .relationship(Relationship::one_to_many("children", "node", "parent_id"))
                .build()
                .unwrap(),
        )
    }

    fn keyed(table: &Arc<Table>, id: i64, parent: Option<i64>) -> Instance {
        Instance::new_persistent(
            table,
            SessionId::next(),
            vec![Value::BigInt(id), parent.into(), Value::Null],
            IdentityKey::new("node", vec![Value::BigInt(id)]),
        )
    }

    #[test]
    fn test_parents_first_by_reference() {
        let table = node_table();
        let root = Instance::new(&table);
        let child = Instance::new(&table);
        let grandchild = Instance::new(&table);
        grandchild.set_related("parent", Some(&child)).unwrap();
        child.set_related("parent", Some(&root)).unwrap();

        let order = FlushOrderer::new(vec![grandchild.clone(), child.clone(), root.clone()])
            .parents_first()
            .unwrap();
        assert!(Instance::ptr_eq(&order[0], &root));
        assert!(Instance::ptr_eq(&order[1], &child));
        assert!(Instance::ptr_eq(&order[2], &grandchild));
    }

    #[test]
    fn test_parents_first_by_collection() {
        let table = node_table();
        let root = Instance::new(&table);
        let child = Instance::new(&table);
        root.append("children", &child).unwrap();
        let order = FlushOrderer::new(vec![child.clone(), root.clone()])
            .parents_first()
            .unwrap();
        assert!(Instance::ptr_eq(&order[0], &root));
    }

    #[test]
    fn test_independent_nodes_keep_input_order() {
        let table = node_table();
        let a = Instance::new(&table);
        let b = Instance::new(&table);
        let order = FlushOrderer::new(vec![b.clone(), a.clone()])
            .parents_first()
            .unwrap();
        assert!(Instance::ptr_eq(&order[0], &b));
        assert!(Instance::ptr_eq(&order[1], &a));
    }

    #[test]
    fn test_children_first_by_key_value() {
        let table = node_table();
        let parent = keyed(&table, 1, None);
        let c1 = keyed(&table, 2, Some(1));
        let c2 = keyed(&table, 3, Some(1));
        let leaf = keyed(&table, 4, Some(2));
        let order = FlushOrderer::new(vec![parent.clone(), c1.clone(), c2.clone(), leaf.clone()])
            .children_first()
            .unwrap();
        let pos = |x: &Instance| order.iter().position(|o| Instance::ptr_eq(o, x)).unwrap();
        assert!(pos(&leaf) < pos(&c1));
        assert!(pos(&c1) < pos(&parent));
        assert!(pos(&c2) < pos(&parent));
    }

    #[test]
    fn test_cycle_is_reported() {
        let table = node_table();
        let a = Instance::new(&table);
        let b = Instance::new(&table);
        a.set_related("parent", Some(&b)).unwrap();
        b.set_related("parent", Some(&a)).unwrap();

        let err = FlushOrderer::new(vec![a, b]).parents_first().unwrap_err();
        assert_eq!(err.flush_kind(), Some(FlushErrorKind::DependencyCycle));
        assert!(err.to_string().contains("node(pending)"));
    }

    #[test]
    fn test_self_reference_is_not_a_cycle() {
        let table = node_table();
        let a = Instance::new(&table);
        a.set_related("parent", Some(&a)).unwrap();
        assert_eq!(FlushOrderer::new(vec![a]).parents_first().unwrap().len(), 1);
    }

    #[test]
    fn test_insert_statement_skips_null_autoincrement() {
        let table = node_table();
        let a = Instance::with_values(&table, [("data", "root")]).unwrap();
        assert_eq!(
            insert_statement(&a).to_sql(),
            "INSERT INTO \"node\" (\"parent_id\", \"data\") VALUES ($1, $2)"
        );
    }

    #[test]
    fn test_update_statement_only_changed_columns() {
        let table = node_table();
        let a = keyed(&table, 1, None);
        assert!(update_statement(&a).is_none());
        a.set("data", "x").unwrap();
        let stmt = update_statement(&a).unwrap();
        assert_eq!(
            stmt.to_sql(),
            "UPDATE \"node\" SET \"data\" = $1 WHERE \"id\" = $2"
        );
        a.set("data", Value::Null).unwrap();
        assert!(update_statement(&a).is_none());
    }

    #[test]
    fn test_write_generated_key() {
        let table = node_table();
        let a = Instance::new(&table);
        assert!(write_generated_key(&a, Some(42)));
        assert!(!write_generated_key(&a, Some(43)));
        assert_eq!(a.get("id"), Some(Value::BigInt(42)));
        assert_eq!(
            key_from_values(&a),
            Some(IdentityKey::new("node", vec![Value::BigInt(42)]))
        );
        clear_generated_key(&a);
        assert_eq!(a.get("id"), Some(Value::Null));
    }

    #[test]
    fn test_flush_result_total() {
        let r = FlushResult {
            inserted: 2,
            updated: 1,
            deleted: 3,
        };
        assert_eq!(r.total(), 6);
    }
}
