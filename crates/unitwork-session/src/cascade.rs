//! Cascade resolution along relationship edges.
//!
//! Cascades walk the explicit relationship list of each instance's [`Table`]:
//!
//! - `save-update`: adding an instance adds everything it currently
//!   references, transitively. Only loaded collections and live references
//!   are followed; nothing is loaded from the store.
//! - `delete`: deleting an instance deletes its related instances, loading
//!   unloaded relationships on the way. `delete-orphan` on a collection
//!   implies the same for the children of a deleted parent.
//! - `delete-orphan`: a child removed from a collection is deleted once no
//!   parent holds it any more. Detection is lazy: at flush, each loaded
//!   collection is compared with its baseline.
//! - one-to-many edges without either delete flag get their children's
//!   foreign key cleared when the parent is deleted.
//!
//! [`Table`]: unitwork_core::Table

use crate::instance::{Instance, InstanceId};
use std::collections::HashSet;
use unitwork_core::{Relationship, RelationshipKind, Result};

/// A child dropped from a parent's collection and held by no other parent.
#[derive(Debug, Clone)]
pub struct Orphan {
    pub parent: Instance,
    pub relationship: Relationship,
    pub child: Instance,
}

impl Orphan {
    /// Should the orphan be deleted rather than have its key cleared?
    pub fn is_deleted(&self) -> bool {
        self.relationship.cascade_policy().delete_orphan
    }
}

/// Walks relationship edges according to their cascade policies.
#[derive(Debug, Clone, Copy, Default)]
pub struct CascadeResolver;

impl CascadeResolver {
    /// `roots` plus every instance reachable over `save-update` edges, roots
    /// first and each instance once.
    pub fn save_update(roots: &[Instance]) -> Vec<Instance> {
        Self::walk_loaded(roots, |rel| rel.cascade_policy().save_update)
    }

    /// `roots` plus every instance reachable over `expunge` edges.
    pub fn expunge(roots: &[Instance]) -> Vec<Instance> {
        Self::walk_loaded(roots, |rel| rel.cascade_policy().expunge)
    }

    /// Does deleting the declaring instance delete the related ones?
    pub fn deletes_along(rel: &Relationship) -> bool {
        let cascade = rel.cascade_policy();
        cascade.delete || (rel.is_collection() && cascade.delete_orphan)
    }

    /// `root` plus everything reachable over delete edges.
    ///
    /// `load` returns the instances related over one edge, loading them from
    /// the store when needed.
    pub fn delete<F>(root: &Instance, mut load: F) -> Result<Vec<Instance>>
    where
        F: FnMut(&Instance, &Relationship) -> Result<Vec<Instance>>,
    {
        let mut out = vec![root.clone()];
        let mut seen: HashSet<InstanceId> = HashSet::from([root.id()]);
        let mut next = 0;
        while next < out.len() {
            let current = out[next].clone();
            next += 1;
            let table = current.table();
            for rel in table.relationships().iter().filter(|r| Self::deletes_along(r)) {
                for related in load(&current, rel)? {
                    if seen.insert(related.id()) {
                        out.push(related);
                    }
                }
            }
        }
        tracing::debug!(
            table = %root.table_name(),
            count = out.len(),
            "Resolved delete cascade"
        );
        Ok(out)
    }

    /// One-to-many edges of a deleted instance whose children keep living
    /// with a cleared foreign key.
    pub fn nullify_edges(instance: &Instance) -> Vec<Relationship> {
        instance
            .table()
            .relationships()
            .iter()
            .filter(|r| r.is_collection() && !Self::deletes_along(r))
            .cloned()
            .collect()
    }

    /// Children removed from loaded collections of `parents` that no parent
    /// holds any more.
    ///
    /// A child is still held when it sits in another loaded collection of the
    /// same relationship, when one of its many-to-one references over the
    /// same foreign key points at another live parent, or when its foreign
    /// key already names a different row.
    pub fn orphans(parents: &[Instance]) -> Vec<Orphan> {
        let mut held: HashSet<(InstanceId, String, String)> = HashSet::new();
        for parent in parents {
            let table = parent.table_name();
            for (rel, members) in parent.collection_members() {
                for child in members {
                    held.insert((child.id(), table.clone(), rel.clone()));
                }
            }
        }

        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for parent in parents {
            let table = parent.table();
            for (rel_name, removed) in parent.collection_removals() {
                let Some(rel) = table.relationship(&rel_name) else {
                    continue;
                };
                for child in removed {
                    if held.contains(&(child.id(), table.name().to_string(), rel_name.clone()))
                        || Self::reparented(&child, parent, rel)
                    {
                        continue;
                    }
                    if seen.insert(child.id()) {
                        out.push(Orphan {
                            parent: parent.clone(),
                            relationship: rel.clone(),
                            child,
                        });
                    }
                }
            }
        }
        out
    }

    fn reparented(child: &Instance, parent: &Instance, rel: &Relationship) -> bool {
        let child_table = child.table();
        let by_reference = child_table
            .relationships()
            .iter()
            .filter(|r| {
                r.kind() == RelationshipKind::ManyToOne
                    && r.foreign_key() == rel.foreign_key()
                    && r.target() == parent.table().name()
            })
            .any(|r| {
                child
                    .reference(r.name())
                    .is_some_and(|other| !Instance::ptr_eq(&other, parent))
            });
        if by_reference {
            return true;
        }
        match (child.get(rel.foreign_key()), parent.single_key_value()) {
            (Some(current), Some(own)) => !current.is_null() && current != own,
            _ => false,
        }
    }

    fn walk_loaded(roots: &[Instance], follow: impl Fn(&Relationship) -> bool) -> Vec<Instance> {
        let mut out: Vec<Instance> = Vec::new();
        let mut seen = HashSet::new();
        for root in roots {
            if seen.insert(root.id()) {
                out.push(root.clone());
            }
        }
        let mut next = 0;
        while next < out.len() {
            let current = out[next].clone();
            next += 1;
            let table = current.table();
            for rel in table.relationships().iter().filter(|r| follow(r)) {
                let related = match rel.kind() {
                    RelationshipKind::OneToMany => {
                        current.loaded_collection(rel.name()).unwrap_or_default()
                    }
                    RelationshipKind::ManyToOne => {
                        current.reference(rel.name()).into_iter().collect()
                    }
                };
                for r in related {
                    if seen.insert(r.id()) {
                        out.push(r);
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity_map::IdentityKey;
    use crate::instance::SessionId;
    use std::sync::Arc;
    use unitwork_core::{Cascade, Column, SqlType, Table, Value};

    fn tables(cascade: Cascade) -> (Arc<Table>, Arc<Table>) {
        let user = Table::builder("user")
            .column(Column::new("id", SqlType::Integer).primary_key())
            .column(Column::new("name", SqlType::Text))
            .relationship(
                Relationship::one_to_many("addresses", "address", "user_id")
                    .cascade(cascade)
                    .back_populates("user"),
            )
            .build()
            .unwrap();
        let address = Table::builder("address")
            .column(Column::new("id", SqlType::Integer).primary_key())
            .column(Column::new("email_address", SqlType::Text))
            .column(Column::new("user_id", SqlType::Integer).foreign_key("user.id"))
            .relationship(
                Relationship::many_to_one("user", "user", "user_id").back_populates("addresses"),
            )
            .build()
            .unwrap();
        (Arc::new(user), Arc::new(address))
    }

    fn persistent(table: &Arc<Table>, values: Vec<Value>) -> Instance {
        let key = IdentityKey::new(table.name(), vec![values[0].clone()]);
        Instance::new_persistent(table, SessionId::next(), values, key)
    }

    #[test]
    fn test_save_update_follows_loaded_edges() {
        let (user, address) = tables(Cascade::default());
        let jack = Instance::new(&user);
        let a1 = Instance::new(&address);
        let a2 = Instance::new(&address);
        jack.append("addresses", &a1).unwrap();
        jack.append("addresses", &a2).unwrap();

        let from_parent = CascadeResolver::save_update(std::slice::from_ref(&jack));
        assert_eq!(from_parent.len(), 3);
        assert!(Instance::ptr_eq(&from_parent[0], &jack));

        let from_child = CascadeResolver::save_update(&[a1]);
        assert_eq!(from_child.len(), 3);
    }

    #[test]
    fn test_save_update_respects_policy() {
        let (user, address) = tables(Cascade::NONE);
        let jack = Instance::new(&user);
        jack.append("addresses", &Instance::new(&address)).unwrap();
        assert_eq!(CascadeResolver::save_update(&[jack]).len(), 1);
    }

    #[test]
    fn test_delete_uses_loader() {
        let (user, address) = tables(Cascade::ALL);
        let jack = persistent(&user, vec![Value::BigInt(1), "jack".into()]);
        let a1 = persistent(&address, vec![Value::BigInt(1), "a".into(), Value::BigInt(1)]);
        let a2 = persistent(&address, vec![Value::BigInt(2), "b".into(), Value::BigInt(1)]);
        let children = vec![a1.clone(), a2.clone()];

        let mut calls = 0;
        let out = CascadeResolver::delete(&jack, |inst, rel| {
            calls += 1;
            if rel.is_collection() && Instance::ptr_eq(inst, &jack) {
                Ok(children.clone())
            } else {
                Ok(Vec::new())
            }
        })
        .unwrap();
        assert_eq!(out.len(), 3);
        assert!(Instance::ptr_eq(&out[1], &a1));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_nullify_edges_without_delete() {
        let (user, _) = tables(Cascade::default());
        let jack = Instance::new(&user);
        assert_eq!(CascadeResolver::nullify_edges(&jack).len(), 1);

        let (user, _) = tables(Cascade::parse("save-update, delete-orphan").unwrap());
        assert!(CascadeResolver::nullify_edges(&Instance::new(&user)).is_empty());
    }

    #[test]
    fn test_orphan_detected_after_remove() {
        let (user, address) = tables(Cascade::parse("all, delete-orphan").unwrap());
        let jack = persistent(&user, vec![Value::BigInt(1), "jack".into()]);
        let a1 = persistent(&address, vec![Value::BigInt(1), "a".into(), Value::BigInt(1)]);
        jack.cache_collection("addresses", vec![a1.clone()]);
        jack.remove("addresses", &a1).unwrap();

        let orphans = CascadeResolver::orphans(&[jack, a1.clone()]);
        assert_eq!(orphans.len(), 1);
        assert!(Instance::ptr_eq(&orphans[0].child, &a1));
        assert!(orphans[0].is_deleted());
    }

    #[test]
    fn test_moved_child_is_not_orphan() {
        let (user, address) = tables(Cascade::parse("all, delete-orphan").unwrap());
        let jack = persistent(&user, vec![Value::BigInt(1), "jack".into()]);
        let wendy = persistent(&user, vec![Value::BigInt(2), "wendy".into()]);
        let a1 = persistent(&address, vec![Value::BigInt(1), "a".into(), Value::BigInt(1)]);
        jack.cache_collection("addresses", vec![a1.clone()]);
        wendy.cache_collection("addresses", Vec::new());

        jack.remove("addresses", &a1).unwrap();
        wendy.append("addresses", &a1).unwrap();
        assert!(CascadeResolver::orphans(&[jack, wendy]).is_empty());
    }

    #[test]
    fn test_child_pointed_elsewhere_is_not_orphan() {
        let (user, address) = tables(Cascade::parse("all, delete-orphan").unwrap());
        let jack = persistent(&user, vec![Value::BigInt(1), "jack".into()]);
        let a1 = persistent(&address, vec![Value::BigInt(1), "a".into(), Value::BigInt(1)]);
        jack.cache_collection("addresses", vec![a1.clone()]);
        jack.remove("addresses", &a1).unwrap();
        a1.set("user_id", 9i64).unwrap();
        assert!(CascadeResolver::orphans(&[jack]).is_empty());
    }
}
