//! Change tracking for the session.
//!
//! The tracker classifies instances owned by one session as pending (to be
//! inserted), dirty (persistent with assigned columns) or deleted. Clean
//! persistent instances live only in the identity map.
//!
//! Dirty detection is two-staged: [`Instance::set`] records the column in the
//! instance's modified set, the session folds such instances in with
//! [`ChangeTracker::mark_dirty`], and flush compares against the baseline so a
//! value set back to its original is not written.

use crate::instance::{Instance, InstanceId, SessionId};
use std::collections::HashSet;
use unitwork_core::{Error, Result};

/// Insertion-ordered set of instances.
#[derive(Debug, Default)]
struct OrderedSet {
    items: Vec<Instance>,
    ids: HashSet<InstanceId>,
}

impl OrderedSet {
    fn insert(&mut self, instance: &Instance) -> bool {
        if self.ids.insert(instance.id()) {
            self.items.push(instance.clone());
            true
        } else {
            false
        }
    }

    fn remove(&mut self, instance: &Instance) -> bool {
        if self.ids.remove(&instance.id()) {
            self.items.retain(|i| !Instance::ptr_eq(i, instance));
            true
        } else {
            false
        }
    }

    fn contains(&self, instance: &Instance) -> bool {
        self.ids.contains(&instance.id())
    }

    fn clear(&mut self) {
        self.items.clear();
        self.ids.clear();
    }
}

/// Snapshot of the tracker's classification.
#[derive(Debug, Default)]
pub struct ChangeSet {
    /// Instances to insert, in the order they were added.
    pub pending: Vec<Instance>,
    /// Persistent instances with assigned columns.
    pub dirty: Vec<Instance>,
    /// Persistent instances to delete, in the order they were marked.
    pub deleted: Vec<Instance>,
}

impl ChangeSet {
    /// No work at all?
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.dirty.is_empty() && self.deleted.is_empty()
    }
}

/// Pending/dirty/deleted classification for one session.
#[derive(Debug)]
pub struct ChangeTracker {
    session: SessionId,
    pending: OrderedSet,
    dirty: OrderedSet,
    deleted: OrderedSet,
}

impl ChangeTracker {
    /// Create a new empty change tracker for `session`.
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            pending: OrderedSet::default(),
            dirty: OrderedSet::default(),
            deleted: OrderedSet::default(),
        }
    }

    fn check_owner(&self, instance: &Instance) -> Result<()> {
        match instance.owner() {
            Some(owner) if owner == self.session => Ok(()),
            Some(owner) => Err(Error::ForeignSession {
                table: instance.table_name(),
                owner: owner.as_u64(),
                current: self.session.as_u64(),
            }),
            None => Err(Error::DetachedInstance {
                table: instance.table_name(),
                message: "instance is not bound to a session".to_string(),
            }),
        }
    }

    /// Schedule an insert.
    pub fn mark_pending(&mut self, instance: &Instance) -> Result<()> {
        self.check_owner(instance)?;
        self.deleted.remove(instance);
        self.dirty.remove(instance);
        if self.pending.insert(instance) {
            tracing::trace!(table = %instance.table_name(), "Marked pending");
        }
        Ok(())
    }

    /// Schedule an update. No-op if already pending, dirty or deleted.
    pub fn mark_dirty(&mut self, instance: &Instance) -> Result<()> {
        self.check_owner(instance)?;
        if self.pending.contains(instance) || self.deleted.contains(instance) {
            return Ok(());
        }
        if self.dirty.insert(instance) {
            tracing::trace!(table = %instance.table_name(), "Marked dirty");
        }
        Ok(())
    }

    /// Schedule a delete. Supersedes a scheduled update.
    pub fn mark_deleted(&mut self, instance: &Instance) -> Result<()> {
        self.check_owner(instance)?;
        self.dirty.remove(instance);
        if self.deleted.insert(instance) {
            tracing::trace!(table = %instance.table_name(), "Marked deleted");
        }
        Ok(())
    }

    /// Drop every classification of this instance.
    pub fn unmark(&mut self, instance: &Instance) {
        self.pending.remove(instance);
        self.dirty.remove(instance);
        self.deleted.remove(instance);
    }

    pub fn is_pending(&self, instance: &Instance) -> bool {
        self.pending.contains(instance)
    }

    pub fn is_dirty(&self, instance: &Instance) -> bool {
        self.dirty.contains(instance)
    }

    pub fn is_deleted(&self, instance: &Instance) -> bool {
        self.deleted.contains(instance)
    }

    /// Current classification.
    pub fn diff(&self) -> ChangeSet {
        ChangeSet {
            pending: self.pending.items.clone(),
            dirty: self.dirty.items.clone(),
            deleted: self.deleted.items.clone(),
        }
    }

    /// Clear all classifications.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.dirty.clear();
        self.deleted.clear();
    }
}
