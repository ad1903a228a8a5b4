//! Session and Unit of Work for unitwork.
//!
//! `unitwork-session` is the **unit-of-work layer**. It coordinates instance
//! identity, change tracking and transactional persistence against any
//! [`ConnectionSource`].
//!
//! # Role In The Architecture
//!
//! - **Identity map**: ensures a single in-memory instance per primary key.
//! - **Change tracking**: records inserts, updates and deletes before flush.
//! - **Cascades**: carries `add`/`delete` along relationship edges.
//! - **Transactional safety**: wraps flush/commit/rollback around a lazily
//!   acquired `Connection`.
//!
//! # Lifecycle
//!
//! A session starts without a transaction. The first read or write acquires
//! a connection and begins one. `flush` writes pending changes in dependency
//! order, `commit` finalizes them and expires every instance, `rollback`
//! discards them and restores in-memory state to the last committed rows.
//! A store rejection during flush leaves the session [`SessionState::Failed`]
//! until `rollback`.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use unitwork_core::{Column, ConnectionSource, MetaData, SqlType, Table};
//! use unitwork_memory::MemoryEngine;
//! use unitwork_session::{Instance, Session};
//!
//! let mut metadata = MetaData::new();
//! let user = metadata
//!     .add_table(
//!         Table::builder("user")
//!             .column(Column::new("id", SqlType::Integer).primary_key())
//!             .column(Column::new("name", SqlType::Text))
//!             .build()
//!             .unwrap(),
//!     )
//!     .unwrap();
//! let engine = MemoryEngine::new();
//! metadata.create_all(&mut engine.connect().unwrap()).unwrap();
//!
//! let mut session = Session::new(engine, Arc::new(metadata));
//! let ed = Instance::with_values(&user, [("name", "ed")]).unwrap();
//! session.add(&ed).unwrap();
//! session.flush().unwrap();
//!
//! let key = ed.get("id").unwrap();
//! assert!(!key.is_null());
//! let found = session.get("user", key).unwrap().unwrap();
//! assert!(Instance::ptr_eq(&found, &ed));
//! session.commit().unwrap();
//! ```

pub mod cascade;
pub mod change_tracker;
pub mod flush;
pub mod identity_map;
pub mod instance;
pub mod query;

pub use cascade::{CascadeResolver, Orphan};
pub use change_tracker::{ChangeSet, ChangeTracker};
pub use flush::{FlushOrderer, FlushPlan, FlushResult};
pub use identity_map::{IdentityKey, IdentityMap};
pub use instance::{Instance, InstanceId, SessionId};
pub use query::Query;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use unitwork_core::{
    Connection, ConnectionSource, Error, ExecResult, FlushError, FlushErrorKind, MetaData,
    Predicate, Relationship, RelationshipKind, Result, Row, SchemaErrorKind, Select, Statement,
    Table, TransactionErrorKind, Value,
};

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Callbacks receive no arguments and return `Result<(), Error>`.
/// Returning `Err` will abort the operation (e.g., prevent commit).
type SessionEventFn = Box<dyn FnMut() -> Result<()>>;

/// Holds registered session-level event callbacks.
///
/// These are fired at key points in the session lifecycle:
/// before/after flush, commit, and rollback.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    #[allow(clippy::result_large_err)]
    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush executes pending changes.
    BeforeFlush,
    /// Fired after flush completes successfully.
    AfterFlush,
    /// Fired before commit (after flush).
    BeforeCommit,
    /// Fired after commit completes successfully.
    AfterCommit,
    /// Fired after rollback completes.
    AfterRollback,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Whether to begin a transaction implicitly on first use.
    pub auto_begin: bool,
    /// Whether to flush before queries and lazy loads.
    pub auto_flush: bool,
    /// Whether to expire instances after commit (reload on next access).
    pub expire_on_commit: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            auto_flush: true,
            expire_on_commit: true,
        }
    }
}

impl SessionConfig {
    /// Create new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `auto_begin` option (builder pattern).
    pub fn auto_begin(mut self, value: bool) -> Self {
        self.auto_begin = value;
        self
    }

    /// Set the `auto_flush` option (builder pattern).
    pub fn auto_flush(mut self, value: bool) -> Self {
        self.auto_flush = value;
        self
    }

    /// Set the `expire_on_commit` option (builder pattern).
    pub fn expire_on_commit(mut self, value: bool) -> Self {
        self.expire_on_commit = value;
        self
    }

    /// Parse a JSON object; missing fields keep their defaults.
    ///
    /// ```
    /// use unitwork_session::SessionConfig;
    ///
    /// let config = SessionConfig::from_json(r#"{"auto_flush": false}"#).unwrap();
    /// assert!(!config.auto_flush);
    /// assert!(config.expire_on_commit);
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::config(format!("invalid session configuration: {e}")))
    }
}

// ============================================================================
// States
// ============================================================================

/// Transaction state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// No connection held; the next read or write begins a transaction.
    NoTransaction,
    /// A transaction is open.
    Active,
    /// Inside `commit`.
    Committing,
    /// Inside `rollback`.
    RollingBack,
    /// A flush was rejected by the store; only `rollback` and `close` work.
    Failed,
}

/// Where an instance stands relative to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstanceState {
    /// Never added, or evicted by a rollback.
    Transient,
    /// Added, not yet inserted.
    Pending,
    /// Has an identity key and is tracked by this session.
    Persistent,
    /// Marked for deletion or deleted in the current transaction.
    Deleted,
    /// Has an identity key but is tracked by no session (or another one).
    Detached,
}

/// Result of [`Session::related`].
#[derive(Debug, Clone)]
pub enum Related {
    /// A many-to-one reference.
    One(Option<Instance>),
    /// A one-to-many collection.
    Many(Vec<Instance>),
}

impl Related {
    /// The referenced instance, or the first collection member.
    pub fn one(self) -> Option<Instance> {
        match self {
            Related::One(target) => target,
            Related::Many(items) => items.into_iter().next(),
        }
    }

    /// Every related instance.
    pub fn instances(self) -> Vec<Instance> {
        match self {
            Related::One(target) => target.into_iter().collect(),
            Related::Many(items) => items,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Related::One(target) => usize::from(target.is_some()),
            Related::Many(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An instance written by a flush in the current transaction.
#[derive(Debug)]
struct Inserted {
    instance: Instance,
    /// The store generated its autoincrement key.
    generated: bool,
}

// ============================================================================
// Session
// ============================================================================

/// The Session is the central unit-of-work manager.
///
/// It tracks instances loaded from or added to the store and coordinates
/// flushing changes back. A session is not `Send`: it and the instances it
/// tracks belong to one thread.
pub struct Session<S: ConnectionSource> {
    id: SessionId,
    source: S,
    metadata: Arc<MetaData>,
    config: SessionConfig,
    /// Held while a transaction is open (or failed).
    connection: Option<S::Connection>,
    state: SessionState,
    identity_map: IdentityMap,
    tracker: ChangeTracker,
    /// Inserted by flushes of the current transaction.
    txn_new: Vec<Inserted>,
    /// Deleted by flushes of the current transaction.
    txn_deleted: Vec<Instance>,
    event_callbacks: SessionEventCallbacks,
}

impl<S: ConnectionSource> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("config", &self.config)
            .field("identity_map", &self.identity_map.len())
            .field("event_callbacks", &self.event_callbacks)
            .finish_non_exhaustive()
    }
}

impl<S: ConnectionSource> Session<S> {
    /// Create a new session over a connection source.
    pub fn new(source: S, metadata: Arc<MetaData>) -> Self {
        Self::with_config(source, metadata, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(source: S, metadata: Arc<MetaData>, config: SessionConfig) -> Self {
        let id = SessionId::next();
        tracing::debug!(session = %id, ?config, "Session created");
        Self {
            id,
            source,
            metadata,
            config,
            connection: None,
            state: SessionState::NoTransaction,
            identity_map: IdentityMap::new(),
            tracker: ChangeTracker::new(id),
            txn_new: Vec::new(),
            txn_deleted: Vec::new(),
            event_callbacks: SessionEventCallbacks::default(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<MetaData> {
        &self.metadata
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Is a transaction open?
    pub fn in_transaction(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    /// Register a callback to run before flush.
    ///
    /// The callback can abort the flush by returning `Err`.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + 'static) {
        self.event_callbacks.before_flush.push(Box::new(f));
    }

    /// Register a callback to run after a successful flush.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + 'static) {
        self.event_callbacks.after_flush.push(Box::new(f));
    }

    /// Register a callback to run before commit (after flush).
    ///
    /// The callback can abort the commit by returning `Err`.
    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<()> + 'static) {
        self.event_callbacks.before_commit.push(Box::new(f));
    }

    /// Register a callback to run after a successful commit.
    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + 'static) {
        self.event_callbacks.after_commit.push(Box::new(f));
    }

    /// Register a callback to run after rollback.
    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + 'static) {
        self.event_callbacks.after_rollback.push(Box::new(f));
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    fn ensure_usable(&self) -> Result<()> {
        if self.state == SessionState::Failed {
            return Err(Error::transaction(
                TransactionErrorKind::Inactive,
                "this session's transaction has been rolled back due to a previous \
                 exception during flush; call rollback() before using it again",
            ));
        }
        Ok(())
    }

    /// Begin a transaction explicitly.
    pub fn begin(&mut self) -> Result<()> {
        self.ensure_usable()?;
        if self.state == SessionState::Active {
            return Err(Error::transaction(
                TransactionErrorKind::AlreadyActive,
                "a transaction is already begun on this session",
            ));
        }
        self.start_transaction()
    }

    fn start_transaction(&mut self) -> Result<()> {
        let mut conn = match self.connection.take() {
            Some(conn) => conn,
            None => self.source.connect()?,
        };
        conn.begin()?;
        self.connection = Some(conn);
        self.state = SessionState::Active;
        tracing::debug!(session = %self.id, "Transaction begun");
        Ok(())
    }

    /// The transactional connection, beginning implicitly when allowed.
    fn connection(&mut self) -> Result<&mut S::Connection> {
        self.ensure_usable()?;
        if self.state != SessionState::Active {
            if !self.config.auto_begin {
                return Err(Error::transaction(
                    TransactionErrorKind::NotActive,
                    "no transaction is active; call begin() first",
                ));
            }
            self.start_transaction()?;
        }
        self.connection.as_mut().ok_or_else(|| {
            Error::transaction(TransactionErrorKind::NotActive, "session holds no connection")
        })
    }

    fn execute(&mut self, stmt: &Statement) -> Result<ExecResult> {
        tracing::trace!(sql = %stmt, "Executing");
        self.connection()?.execute(stmt)
    }

    fn query_rows(&mut self, stmt: &Statement) -> Result<Vec<Row>> {
        tracing::trace!(sql = %stmt, "Querying");
        self.connection()?.query(stmt)
    }

    // ========================================================================
    // Ownership
    // ========================================================================

    fn check_owned(&self, instance: &Instance, action: &str) -> Result<()> {
        match instance.owner() {
            Some(owner) if owner == self.id => Ok(()),
            Some(owner) => Err(Error::ForeignSession {
                table: instance.table_name(),
                owner: owner.as_u64(),
                current: self.id.as_u64(),
            }),
            None => Err(Error::DetachedInstance {
                table: instance.table_name(),
                message: format!("instance is not bound to a session; {action} cannot proceed"),
            }),
        }
    }

    fn is_flushed_deleted(&self, instance: &Instance) -> bool {
        self.txn_deleted.iter().any(|d| Instance::ptr_eq(d, instance))
    }

    /// Deleted, either scheduled or already flushed.
    fn is_removed(&self, instance: &Instance) -> bool {
        self.tracker.is_deleted(instance) || self.is_flushed_deleted(instance)
    }

    /// Does this session track the instance?
    pub fn contains(&self, instance: &Instance) -> bool {
        instance.owner() == Some(self.id)
            && (self.identity_map.contains(instance) || self.tracker.is_pending(instance))
    }

    /// Classify an instance relative to this session.
    pub fn state_of(&self, instance: &Instance) -> InstanceState {
        if instance.owner() != Some(self.id) {
            return if instance.identity_key().is_some() {
                InstanceState::Detached
            } else {
                InstanceState::Transient
            };
        }
        if self.tracker.is_pending(instance) {
            InstanceState::Pending
        } else if self.is_removed(instance) {
            InstanceState::Deleted
        } else {
            InstanceState::Persistent
        }
    }

    /// Does the instance carry changes the next flush would write?
    pub fn is_modified(&self, instance: &Instance) -> bool {
        if self.tracker.is_pending(instance) {
            return true;
        }
        !instance.data().changed_columns().is_empty()
    }

    /// Pending instances, in the order they were added.
    pub fn new_instances(&self) -> Vec<Instance> {
        self.tracker.diff().pending
    }

    /// Persistent instances with assigned columns.
    ///
    /// Optimistic: an instance whose column was set back to its original
    /// value is listed, but flush will not write it.
    pub fn dirty(&self) -> Vec<Instance> {
        let mut out: Vec<Instance> = self
            .identity_map
            .instances()
            .into_iter()
            .filter(|i| !i.data().modified.is_empty() && !self.tracker.is_deleted(i))
            .collect();
        out.sort_by_key(Instance::id);
        out
    }

    /// Instances marked for deletion and not yet flushed.
    pub fn deleted(&self) -> Vec<Instance> {
        self.tracker.diff().deleted
    }

    // ========================================================================
    // Adding and deleting
    // ========================================================================

    /// Add an instance to the session.
    ///
    /// A transient instance becomes pending and is INSERTed on the next
    /// flush. A detached instance is re-attached under its identity key. An
    /// instance marked for deletion is un-marked. Related instances follow
    /// along `save-update` edges.
    pub fn add(&mut self, instance: &Instance) -> Result<()> {
        self.ensure_usable()?;
        match instance.owner() {
            Some(owner) if owner == self.id => {
                if self.is_flushed_deleted(instance) {
                    return Err(Error::Custom(format!(
                        "instance of '{}' was deleted in this transaction; \
                         rollback() restores it",
                        instance.table_name()
                    )));
                }
                if self.tracker.is_deleted(instance) {
                    self.tracker.unmark(instance);
                    tracing::debug!(table = %instance.table_name(), "Restored deleted instance");
                }
            }
            _ => self.attach(instance)?,
        }
        self.cascade_save_update(std::slice::from_ref(instance))
    }

    /// Add several instances.
    pub fn add_all<'a>(&mut self, instances: impl IntoIterator<Item = &'a Instance>) -> Result<()> {
        for instance in instances {
            self.add(instance)?;
        }
        Ok(())
    }

    fn attach(&mut self, instance: &Instance) -> Result<()> {
        self.check_attachable(instance)?;
        instance.data_mut().owner = Some(self.id);
        if instance.identity_key().is_some() {
            if let Err(e) = self.identity_map.register(instance) {
                instance.data_mut().owner = None;
                return Err(e);
            }
            tracing::debug!(table = %instance.table_name(), "Re-attached detached instance");
        } else {
            self.tracker.mark_pending(instance)?;
        }
        Ok(())
    }

    fn check_attachable(&self, instance: &Instance) -> Result<()> {
        match instance.owner() {
            Some(owner) if owner != self.id => Err(Error::ForeignSession {
                table: instance.table_name(),
                owner: owner.as_u64(),
                current: self.id.as_u64(),
            }),
            _ => Ok(()),
        }
    }

    /// Attach everything reachable from `roots` over `save-update` edges.
    fn cascade_save_update(&mut self, roots: &[Instance]) -> Result<()> {
        for related in CascadeResolver::save_update(roots) {
            self.check_attachable(&related)?;
            if related.owner().is_none() {
                self.attach(&related)?;
            }
        }
        Ok(())
    }

    /// Mark an instance for deletion.
    ///
    /// A pending instance is simply removed from the session. Related
    /// instances on `delete` edges are deleted too; unloaded relationships
    /// are loaded for that purpose.
    pub fn delete(&mut self, instance: &Instance) -> Result<()> {
        self.ensure_usable()?;
        self.check_owned(instance, "delete")?;
        if self.tracker.is_pending(instance) {
            self.expunge_one(instance);
            tracing::debug!(table = %instance.table_name(), "Deleted pending instance");
            return Ok(());
        }
        if self.is_removed(instance) {
            return Ok(());
        }
        let doomed =
            CascadeResolver::delete(instance, |inst, rel| self.related_for_cascade(inst, rel))?;
        for inst in doomed {
            if inst.owner() != Some(self.id) || self.is_flushed_deleted(&inst) {
                continue;
            }
            if self.tracker.is_pending(&inst) {
                self.expunge_one(&inst);
            } else {
                self.tracker.mark_deleted(&inst)?;
            }
        }
        Ok(())
    }

    /// Instances related over one edge, loading without autoflush.
    fn related_for_cascade(
        &mut self,
        instance: &Instance,
        rel: &Relationship,
    ) -> Result<Vec<Instance>> {
        match rel.kind() {
            RelationshipKind::OneToMany => {
                if let Some(items) = instance.loaded_collection(rel.name()) {
                    return Ok(items);
                }
                if instance.identity_key().is_none() || instance.owner() != Some(self.id) {
                    return Ok(Vec::new());
                }
                self.load_collection(instance, rel)
            }
            RelationshipKind::ManyToOne => match instance.reference_state(rel.name()) {
                Some(target) => Ok(target.into_iter().collect()),
                None if instance.owner() == Some(self.id) => {
                    Ok(self.load_reference(instance, rel)?.into_iter().collect())
                }
                None => Ok(Vec::new()),
            },
        }
    }

    // ========================================================================
    // Flush
    // ========================================================================

    fn autoflush(&mut self) -> Result<()> {
        if self.config.auto_flush {
            self.flush()?;
        }
        Ok(())
    }

    /// Flush pending changes to the store.
    ///
    /// This executes INSERT, UPDATE and DELETE statements but does NOT
    /// commit. Inserts run parents first, updates next, deletes children
    /// first. Nothing is sent, and no transaction begun, when there is
    /// nothing to write.
    ///
    /// # Errors
    ///
    /// - [`FlushErrorKind::DependencyCycle`] when pending instances depend on
    ///   each other in a cycle; no statement was sent.
    /// - [`FlushErrorKind::StoreRejected`] when the store refused a
    ///   statement; the session is then [`SessionState::Failed`].
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub fn flush(&mut self) -> Result<FlushResult> {
        self.ensure_usable()?;
        self.prepare_flush()?;

        let changes = self.tracker.diff();
        let writes_needed = !changes.pending.is_empty()
            || !changes.deleted.is_empty()
            || changes
                .dirty
                .iter()
                .any(|i| !i.data().changed_columns().is_empty());
        if !writes_needed {
            for inst in &changes.dirty {
                inst.mark_flushed();
            }
            self.tracker.clear();
            self.settle_collections();
            tracing::debug!("Nothing to flush");
            return Ok(FlushResult::default());
        }

        self.event_callbacks.fire(SessionEvent::BeforeFlush)?;
        let plan = FlushPlan::build(changes.pending, changes.dirty, changes.deleted)?;
        tracing::debug!(
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            deletes = plan.deletes.len(),
            "Flush plan built"
        );

        self.connection()?;
        let start = Instant::now();
        let result = match self.execute_plan(&plan) {
            Ok(result) => result,
            Err(e) => {
                self.state = SessionState::Failed;
                tracing::warn!(error = %e, "Flush failed; session needs rollback");
                return Err(store_rejected(e));
            }
        };
        self.tracker.clear();
        self.settle_collections();

        tracing::info!(
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            elapsed_ms = start.elapsed().as_millis(),
            "Flush complete"
        );
        self.event_callbacks.fire(SessionEvent::AfterFlush)?;
        Ok(result)
    }

    /// Tracked instances: pending first, then the identity map by age.
    fn tracked(&self) -> Vec<Instance> {
        let mut out = self.tracker.diff().pending;
        let mut persistent = self.identity_map.instances();
        persistent.sort_by_key(Instance::id);
        out.extend(persistent);
        out
    }

    /// Flush-time cascades, orphan handling and dirty folding.
    fn prepare_flush(&mut self) -> Result<()> {
        let tracked = self.tracked();
        self.cascade_save_update(&tracked)?;

        for orphan in CascadeResolver::orphans(&self.tracked()) {
            let child = &orphan.child;
            if child.owner() != Some(self.id) || self.is_removed(child) {
                continue;
            }
            if orphan.is_deleted() {
                tracing::debug!(
                    table = %child.table_name(),
                    relationship = %orphan.relationship.name(),
                    "Deleting orphan"
                );
                self.delete(child)?;
            } else {
                child.assign_if_changed(orphan.relationship.foreign_key(), Value::Null)?;
            }
        }

        for parent in self.tracker.diff().deleted {
            for rel in CascadeResolver::nullify_edges(&parent) {
                for child in self.related_for_cascade(&parent, &rel)? {
                    if child.owner() != Some(self.id) || self.is_removed(&child) {
                        continue;
                    }
                    child.assign_if_changed(rel.foreign_key(), Value::Null)?;
                    if let Some(back) = rel.back_populates_name() {
                        if child.reference(back).is_some_and(|p| Instance::ptr_eq(&p, &parent)) {
                            child.cache_reference(back, None);
                        }
                    }
                }
            }
        }

        for inst in self.identity_map.instances() {
            if !inst.data().modified.is_empty() && !self.tracker.is_deleted(&inst) {
                self.tracker.mark_dirty(&inst)?;
            }
        }
        Ok(())
    }

    fn execute_plan(&mut self, plan: &FlushPlan) -> Result<FlushResult> {
        let mut result = FlushResult::default();
        let mut inserted: HashSet<InstanceId> = HashSet::new();
        let memberships = memberships_of(&plan.inserts);

        for inst in &plan.inserts {
            sync_foreign_keys(inst, &inserted, &memberships)?;
            let exec = self.execute(&flush::insert_statement(inst))?;
            let generated = flush::write_generated_key(inst, exec.last_insert_id);
            let key = flush::key_from_values(inst).ok_or_else(|| {
                Error::Custom(format!(
                    "inserted row of '{}' has no complete primary key",
                    inst.table_name()
                ))
            })?;
            inst.data_mut().key = Some(key);
            if let Err(e) = self.identity_map.register(inst) {
                inst.data_mut().key = None;
                return Err(e);
            }
            inst.mark_flushed();
            inserted.insert(inst.id());
            self.txn_new.push(Inserted {
                instance: inst.clone(),
                generated,
            });
            result.inserted += 1;
        }

        let mut updates = plan.updates.clone();
        if !inserted.is_empty() {
            let mut persistent = self.identity_map.instances();
            persistent.sort_by_key(Instance::id);
            for inst in persistent {
                if inserted.contains(&inst.id()) || self.tracker.is_deleted(&inst) {
                    continue;
                }
                if sync_foreign_keys(&inst, &inserted, &memberships)?
                    && !updates.iter().any(|u| Instance::ptr_eq(u, &inst))
                {
                    updates.push(inst);
                }
            }
        }

        for inst in &updates {
            let Some(stmt) = flush::update_statement(inst) else {
                inst.mark_flushed();
                continue;
            };
            let exec = self.execute(&stmt)?;
            if exec.rows_affected == 0 {
                let key = inst.identity_key().map(|k| k.to_string()).unwrap_or_default();
                return Err(Error::StaleRow { key });
            }
            inst.mark_flushed();
            result.updated += 1;
        }

        for inst in &plan.deletes {
            let exec = self.execute(&flush::delete_statement(inst))?;
            if exec.rows_affected == 0 {
                tracing::warn!(table = %inst.table_name(), "DELETE matched no row");
            }
            self.identity_map.forget(inst);
            self.txn_deleted.push(inst.clone());
            result.deleted += 1;
        }
        Ok(result)
    }

    fn settle_collections(&self) {
        for inst in self.identity_map.instances() {
            inst.settle_collections();
        }
    }

    // ========================================================================
    // Commit / Rollback
    // ========================================================================

    /// Commit the current transaction.
    ///
    /// Flushes first. Afterwards every instance is expired (unless
    /// `expire_on_commit` is off), instances deleted in the transaction are
    /// detached and the connection is released.
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_usable()?;
        self.flush()?;

        self.event_callbacks.fire(SessionEvent::BeforeCommit)?;

        self.state = SessionState::Committing;
        if let Some(mut conn) = self.connection.take() {
            if conn.in_transaction() {
                if let Err(e) = conn.commit() {
                    self.connection = Some(conn);
                    self.state = SessionState::Failed;
                    return Err(e);
                }
            }
        }

        for inst in self.txn_deleted.drain(..) {
            inst.data_mut().owner = None;
        }
        self.txn_new.clear();
        if self.config.expire_on_commit {
            for inst in self.identity_map.instances() {
                inst.expire();
            }
        }
        self.state = SessionState::NoTransaction;
        tracing::debug!(tracked = self.identity_map.len(), "Transaction committed");

        self.event_callbacks.fire(SessionEvent::AfterCommit)
    }

    /// Rollback the current transaction.
    ///
    /// Pending instances and instances inserted in the transaction become
    /// transient (store-generated keys are cleared). Instances deleted in
    /// the transaction are persistent again. Modified columns revert and
    /// every persistent instance is expired, so the next read sees the
    /// committed row. Allowed in every state.
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub fn rollback(&mut self) -> Result<()> {
        self.state = SessionState::RollingBack;
        let mut outcome = Ok(());
        if let Some(mut conn) = self.connection.take() {
            if conn.in_transaction() {
                outcome = conn.rollback();
            }
        }

        for inst in self.tracker.diff().pending {
            inst.data_mut().owner = None;
        }
        let mut evicted = HashSet::new();
        for Inserted { instance, generated } in std::mem::take(&mut self.txn_new) {
            evicted.insert(instance.id());
            self.identity_map.forget(&instance);
            if generated {
                flush::clear_generated_key(&instance);
            }
            let mut data = instance.data_mut();
            data.owner = None;
            data.key = None;
            data.baseline = None;
            data.expired = false;
        }
        for inst in std::mem::take(&mut self.txn_deleted) {
            // Inserted and deleted in this transaction: already transient.
            if evicted.contains(&inst.id()) {
                continue;
            }
            if let Err(e) = self.identity_map.register(&inst) {
                tracing::warn!(error = %e, "Could not restore deleted instance");
                inst.data_mut().owner = None;
            }
        }
        self.tracker.clear();
        for inst in self.identity_map.instances() {
            inst.revert();
            inst.expire();
        }

        self.state = SessionState::NoTransaction;
        tracing::debug!(tracked = self.identity_map.len(), "Transaction rolled back");

        let fired = self.event_callbacks.fire(SessionEvent::AfterRollback);
        outcome.and(fired)
    }

    /// Roll back, detach every instance and release the connection.
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub fn close(&mut self) -> Result<()> {
        let outcome = if self.state == SessionState::NoTransaction && self.tracker.diff().is_empty()
        {
            Ok(())
        } else {
            self.rollback()
        };
        self.expunge_all();
        self.connection = None;
        self.state = SessionState::NoTransaction;
        outcome
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Get an instance by single-column primary key.
    ///
    /// Checks the identity map first; only a miss goes to the store. Returns
    /// `None` when no row exists or the instance is marked for deletion.
    pub fn get(&mut self, table: &str, pk: impl Into<Value>) -> Result<Option<Instance>> {
        self.get_by_key(table, vec![pk.into()])
    }

    /// Get an instance by (possibly composite) primary key.
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub fn get_by_key(&mut self, table: &str, pk: Vec<Value>) -> Result<Option<Instance>> {
        self.ensure_usable()?;
        let table = Arc::clone(self.metadata.require_table(table)?);
        if pk.len() != table.primary_key().len() {
            return Err(Error::schema(
                SchemaErrorKind::Invalid,
                format!(
                    "table '{}' has {} primary key column(s), got {} value(s)",
                    table.name(),
                    table.primary_key().len(),
                    pk.len()
                ),
            ));
        }
        let key = IdentityKey::new(table.name(), pk);
        if self.identity_map.contains_key(&key) {
            return self.lookup(&key);
        }
        self.autoflush()?;
        if self.identity_map.contains_key(&key) {
            return self.lookup(&key);
        }
        tracing::debug!(key = %key, "Identity map miss");
        self.fetch_by_key(&table, &key)
    }

    /// Resolve a tracked key, reloading an expired instance.
    fn lookup(&mut self, key: &IdentityKey) -> Result<Option<Instance>> {
        let Some(found) = self.identity_map.get(key) else {
            return Ok(None);
        };
        if self.tracker.is_deleted(&found) {
            return Ok(None);
        }
        if found.is_expired() {
            match self.reload(&found) {
                Ok(()) => {}
                Err(Error::StaleRow { .. }) => {
                    self.expunge_one(&found);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Some(found))
    }

    fn fetch_by_key(&mut self, table: &Arc<Table>, key: &IdentityKey) -> Result<Option<Instance>> {
        let rows = self.query_rows(&Statement::Select(key_select(table, key)))?;
        match rows.first() {
            Some(row) => self.instance_from_row(table, row).map(Some),
            None => Ok(None),
        }
    }

    /// Route a fetched row through the identity map.
    ///
    /// An already tracked instance is returned unchanged, keeping unflushed
    /// modifications; an expired one is repopulated from the row.
    fn instance_from_row(&mut self, table: &Arc<Table>, row: &Row) -> Result<Instance> {
        let values = values_from_row(table, row);
        let key_values = table
            .primary_key()
            .iter()
            .map(|pk| row.get_by_name(pk).cloned().unwrap_or(Value::Null))
            .collect();
        let key = IdentityKey::new(table.name(), key_values);
        if let Some(existing) = self.identity_map.get(&key) {
            if existing.is_expired() {
                existing.populate(values);
            }
            return Ok(existing);
        }
        let instance = Instance::new_persistent(table, self.id, values, key);
        self.identity_map.register(&instance)?;
        Ok(instance)
    }

    /// Reload an expired instance from its row.
    fn reload(&mut self, instance: &Instance) -> Result<()> {
        let key = instance.identity_key().ok_or_else(|| {
            Error::Custom(format!(
                "instance of '{}' has no identity key to reload",
                instance.table_name()
            ))
        })?;
        let table = instance.table();
        let rows = self.query_rows(&Statement::Select(key_select(&table, &key)))?;
        match rows.first() {
            Some(row) => {
                instance.populate(values_from_row(&table, row));
                tracing::debug!(key = %key, "Reloaded expired instance");
                Ok(())
            }
            None => Err(Error::StaleRow {
                key: key.to_string(),
            }),
        }
    }

    /// Load an expired instance.
    ///
    /// No-op for instances that are not expired.
    pub fn load(&mut self, instance: &Instance) -> Result<()> {
        self.ensure_usable()?;
        if instance.is_expired() {
            self.check_owned(instance, "attribute refresh")?;
            self.reload(instance)?;
        }
        Ok(())
    }

    /// Read a column, reloading the instance first when it is expired.
    ///
    /// # Errors
    ///
    /// [`Error::StaleRow`] when the row of an expired instance is gone.
    pub fn read(&mut self, instance: &Instance, column: &str) -> Result<Value> {
        instance.data().column_index(column)?;
        if instance.get(column).is_none() {
            self.load(instance)?;
        }
        Ok(instance.get(column).unwrap_or(Value::Null))
    }

    /// Reload an instance now, discarding unflushed modifications.
    #[tracing::instrument(level = "debug", skip_all, fields(session = %self.id))]
    pub fn refresh(&mut self, instance: &Instance) -> Result<()> {
        self.ensure_usable()?;
        self.check_owned(instance, "refresh")?;
        if instance.identity_key().is_none() {
            return Err(Error::Custom(format!(
                "instance of '{}' is not persistent; nothing to refresh",
                instance.table_name()
            )));
        }
        instance.expire();
        self.tracker.unmark(instance);
        self.reload(instance)
    }

    /// Start a query over a table.
    pub fn query(&mut self, table: &str) -> Result<Query<'_, S>> {
        let table = Arc::clone(self.metadata.require_table(table)?);
        Ok(Query::new(self, table))
    }

    pub(crate) fn select_instances(
        &mut self,
        table: &Arc<Table>,
        select: Select,
    ) -> Result<Vec<Instance>> {
        self.ensure_usable()?;
        self.autoflush()?;
        let rows = self.query_rows(&Statement::Select(select))?;
        rows.iter()
            .map(|row| self.instance_from_row(table, row))
            .collect()
    }

    pub(crate) fn select_count(&mut self, select: Select) -> Result<u64> {
        self.ensure_usable()?;
        self.autoflush()?;
        let rows = self.query_rows(&Statement::Select(select.count()))?;
        let count = rows
            .first()
            .and_then(|row| row.get_by_name("count"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Ok(u64::try_from(count).unwrap_or(0))
    }

    // ========================================================================
    // Relationships
    // ========================================================================

    /// Access a relationship, loading it on first use.
    ///
    /// Collections and references stay loaded until the instance expires.
    pub fn related(&mut self, instance: &Instance, relationship: &str) -> Result<Related> {
        self.ensure_usable()?;
        let rel = instance.table().require_relationship(relationship)?.clone();
        match rel.kind() {
            RelationshipKind::OneToMany => {
                if let Some(items) = instance.loaded_collection(rel.name()) {
                    return Ok(Related::Many(items));
                }
                if instance.identity_key().is_none() {
                    instance.cache_collection(rel.name(), Vec::new());
                    return Ok(Related::Many(Vec::new()));
                }
                self.check_owned(instance, "lazy load")?;
                self.autoflush()?;
                if let Some(items) = instance.loaded_collection(rel.name()) {
                    return Ok(Related::Many(items));
                }
                Ok(Related::Many(self.load_collection(instance, &rel)?))
            }
            RelationshipKind::ManyToOne => {
                if let Some(target) = instance.reference_state(rel.name()) {
                    return Ok(Related::One(target));
                }
                if instance.owner().is_none() && instance.identity_key().is_none() {
                    return Ok(Related::One(None));
                }
                self.check_owned(instance, "lazy load")?;
                self.autoflush()?;
                Ok(Related::One(self.load_reference(instance, &rel)?))
            }
        }
    }

    /// Append to a collection, loading it first.
    ///
    /// With `save-update` on the edge the child joins this session.
    pub fn append(
        &mut self,
        parent: &Instance,
        relationship: &str,
        child: &Instance,
    ) -> Result<()> {
        self.ensure_collection(parent, relationship)?;
        parent.append(relationship, child)?;
        let cascades = parent
            .table()
            .relationship(relationship)
            .is_some_and(|r| r.cascade_policy().save_update);
        if cascades && parent.owner() == Some(self.id) && child.owner().is_none() {
            self.add(child)?;
        }
        Ok(())
    }

    /// Remove from a collection, loading it first.
    ///
    /// The child's fate is settled at flush: deleted under `delete-orphan`,
    /// otherwise its foreign key is cleared.
    pub fn remove(
        &mut self,
        parent: &Instance,
        relationship: &str,
        child: &Instance,
    ) -> Result<bool> {
        self.ensure_collection(parent, relationship)?;
        parent.remove(relationship, child)
    }

    fn ensure_collection(&mut self, parent: &Instance, relationship: &str) -> Result<()> {
        if parent.identity_key().is_some() && !parent.has_collection(relationship) {
            self.related(parent, relationship)?;
        }
        Ok(())
    }

    fn load_collection(&mut self, parent: &Instance, rel: &Relationship) -> Result<Vec<Instance>> {
        let Some(parent_key) = parent.single_key_value() else {
            parent.cache_collection(rel.name(), Vec::new());
            return Ok(Vec::new());
        };
        let target = Arc::clone(self.metadata.target_of(rel)?);
        let mut select = Select::from(target.name()).filter(Predicate::eq(
            rel.foreign_key(),
            parent_key.clone(),
        ));
        for pk in target.primary_key() {
            select = select.order_by(pk.clone(), false);
        }
        let rows = self.query_rows(&Statement::Select(select))?;

        let mut items = Vec::new();
        for row in &rows {
            let child = self.instance_from_row(&target, row)?;
            let moved = child
                .get(rel.foreign_key())
                .is_some_and(|fk| fk != parent_key);
            if !moved && !self.is_removed(&child) {
                items.push(child);
            }
        }
        for pending in self.tracker.diff().pending {
            if pending.table_name() == target.name()
                && points_at(&pending, parent, rel.foreign_key())
                && !items.iter().any(|i| Instance::ptr_eq(i, &pending))
            {
                items.push(pending);
            }
        }

        if let Some(back) = rel.back_populates_name() {
            for child in &items {
                if child.reference_state(back).is_none() {
                    child.cache_reference(back, Some(parent));
                }
            }
        }
        tracing::debug!(
            table = %parent.table_name(),
            relationship = %rel.name(),
            count = items.len(),
            "Loaded collection"
        );
        parent.cache_collection(rel.name(), items.clone());
        Ok(items)
    }

    fn load_reference(&mut self, child: &Instance, rel: &Relationship) -> Result<Option<Instance>> {
        let fk = self.read(child, rel.foreign_key())?;
        if fk.is_null() {
            child.cache_reference(rel.name(), None);
            return Ok(None);
        }
        let target = Arc::clone(self.metadata.target_of(rel)?);
        let key = IdentityKey::new(target.name(), vec![fk]);
        let found = match self.identity_map.get(&key) {
            Some(tracked) => Some(tracked),
            None => self.fetch_by_key(&target, &key)?,
        };
        let found = found.filter(|f| !self.is_removed(f));
        child.cache_reference(rel.name(), found.as_ref());
        Ok(found)
    }

    // ========================================================================
    // Expiry and detachment
    // ========================================================================

    /// Expire one instance, discarding its unflushed modifications.
    ///
    /// The next read reloads it from the store. No-op for pending instances.
    #[tracing::instrument(level = "debug", skip_all, fields(session = %self.id))]
    pub fn expire(&mut self, instance: &Instance) -> Result<()> {
        self.check_owned(instance, "expire")?;
        if self.tracker.is_pending(instance) {
            return Ok(());
        }
        instance.expire();
        if self.tracker.is_dirty(instance) {
            self.tracker.unmark(instance);
        }
        Ok(())
    }

    /// Expire all instances in the session.
    ///
    /// After calling this method, every persistent instance is marked as
    /// expired. The next access to any of them reloads from the store.
    ///
    /// # Notes
    ///
    /// - This does not affect pending or deleted instances.
    /// - Unflushed modifications are discarded.
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub fn expire_all(&mut self) {
        let mut count = 0;
        for inst in self.identity_map.instances() {
            if self.tracker.is_deleted(&inst) {
                continue;
            }
            inst.expire();
            self.tracker.unmark(&inst);
            count += 1;
        }
        tracing::debug!(count, "Expired all instances");
    }

    /// Detach an instance (and everything on `expunge` edges) from the
    /// session without touching the store.
    pub fn expunge(&mut self, instance: &Instance) -> Result<()> {
        self.check_owned(instance, "expunge")?;
        for inst in CascadeResolver::expunge(std::slice::from_ref(instance)) {
            if inst.owner() == Some(self.id) {
                self.expunge_one(&inst);
            }
        }
        Ok(())
    }

    fn expunge_one(&mut self, instance: &Instance) {
        self.identity_map.forget(instance);
        self.tracker.unmark(instance);
        self.txn_new.retain(|i| !Instance::ptr_eq(&i.instance, instance));
        self.txn_deleted.retain(|i| !Instance::ptr_eq(i, instance));
        instance.data_mut().owner = None;
        tracing::trace!(table = %instance.table_name(), "Expunged");
    }

    /// Detach every instance.
    pub fn expunge_all(&mut self) {
        let mut all = self.identity_map.drain();
        all.extend(self.tracker.diff().pending);
        all.append(&mut self.txn_deleted);
        for inst in all {
            inst.data_mut().owner = None;
        }
        self.tracker.clear();
        self.txn_new.clear();
    }
}

impl<S: ConnectionSource> Drop for Session<S> {
    fn drop(&mut self) {
        self.expunge_all();
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn store_rejected(err: Error) -> Error {
    match err {
        Error::Query(_) | Error::Connection(_) | Error::Type(_) | Error::Transaction(_) => {
            Error::Flush(FlushError {
                kind: FlushErrorKind::StoreRejected,
                message: err.to_string(),
                source: Some(Box::new(err)),
            })
        }
        other => other,
    }
}

fn values_from_row(table: &Table, row: &Row) -> Vec<Value> {
    table
        .columns()
        .iter()
        .map(|c| row.get_by_name(c.name()).cloned().unwrap_or(Value::Null))
        .collect()
}

fn key_select(table: &Table, key: &IdentityKey) -> Select {
    table
        .primary_key()
        .iter()
        .zip(key.values())
        .fold(Select::from(table.name()), |select, (col, value)| {
            select.filter(Predicate::eq(col.clone(), value.clone()))
        })
}

/// Does `child` reference `parent` over a many-to-one edge on `foreign_key`?
fn points_at(child: &Instance, parent: &Instance, foreign_key: &str) -> bool {
    child
        .table()
        .relationships()
        .iter()
        .filter(|r| r.kind() == RelationshipKind::ManyToOne && r.foreign_key() == foreign_key)
        .any(|r| child.reference(r.name()).is_some_and(|p| Instance::ptr_eq(&p, parent)))
}

/// Child id -> (parent, foreign key column) for collections of `parents`.
fn memberships_of(parents: &[Instance]) -> HashMap<InstanceId, Vec<(Instance, String)>> {
    let mut out: HashMap<InstanceId, Vec<(Instance, String)>> = HashMap::new();
    for parent in parents {
        let table = parent.table();
        for (name, members) in parent.collection_members() {
            let Some(rel) = table.relationship(&name) else {
                continue;
            };
            for child in members {
                out.entry(child.id())
                    .or_default()
                    .push((parent.clone(), rel.foreign_key().to_string()));
            }
        }
    }
    out
}

/// Copy keys of parents inserted by this flush into the child's foreign
/// keys. Returns whether a column changed.
fn sync_foreign_keys(
    instance: &Instance,
    inserted: &HashSet<InstanceId>,
    memberships: &HashMap<InstanceId, Vec<(Instance, String)>>,
) -> Result<bool> {
    let mut changed = false;
    if let Some(parents) = memberships.get(&instance.id()) {
        for (parent, fk) in parents {
            if !inserted.contains(&parent.id()) {
                continue;
            }
            if let Some(value) = parent.single_key_value() {
                changed |= instance.assign_if_changed(fk, value)?;
            }
        }
    }
    let table = instance.table();
    for rel in table
        .relationships()
        .iter()
        .filter(|r| r.kind() == RelationshipKind::ManyToOne)
    {
        let Some(parent) = instance.reference(rel.name()) else {
            continue;
        };
        if !inserted.contains(&parent.id()) {
            continue;
        }
        if let Some(value) = parent.single_key_value() {
            changed |= instance.assign_if_changed(rel.foreign_key(), value)?;
        }
    }
    Ok(changed)
}
