//! Session and persistence context for Tessera.
//!
//! `tessera-session` is the **unit-of-work layer**. It tracks an object graph
//! in memory and synchronizes it with a relational store in one ordered flush.
//!
//! # Components
//!
//! - **Persistence context**: one managed instance per (entity, id), with a
//!   lifecycle status and a snapshot of the last persisted state.
//! - **Cascades**: persist, merge, remove and refresh follow associations
//!   according to their cascade sets.
//! - **Flush**: dirty checking, orphan removal, collection row operations and
//!   dependency-ordered execution with optimistic version checks.
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: nothing reaches the store before a flush.
//! - **Single-threaded**: a session and its entity handles are used by one
//!   thread at a time; handles are `Rc`-based and therefore `!Send`.
//! - **Fail loudly**: programming errors are reported before any mutation
//!   executes; store failures during execution taint the context.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(store, Arc::new(registry));
//!
//! let contract = EntityRef::new("Contract").with("customer_name", "Acme");
//! let party = EntityRef::new("Party").with("name", "Buyer");
//! session.add_element(&contract, "parties", &party)?;
//!
//! // Cascades to the party; both rows are inserted at flush.
//! session.persist(&contract)?;
//! let result = session.flush()?;
//! assert_eq!(result.inserted, 2);
//!
//! session.commit()?;
//! ```

pub mod change_tracker;
pub mod collection;
pub mod context;
pub mod executor;
pub mod flush;
pub mod identity_map;
pub mod optimistic;
pub mod statistics;

mod cascade;
mod loader;

pub use change_tracker::{
    CollectionDiff, CollectionSnapshot, ColumnChange, EntitySnapshot, ReferenceSnapshot,
};
pub use collection::{CollectionRowOp, CollectionSemantics};
pub use context::{
    CollectionEntry, CollectionKey, CollectionStatus, EntityEntry, EntityStatus,
    PersistenceContext, StatusCounts,
};
pub use executor::{ExecutionSummary, MutationExecutor, Param, PlannedMutation};
pub use flush::FlushResult;
pub use identity_map::{EntityKey, IdentityMap};
pub use statistics::{EntityStatistics, Statistics};

use cascade::CascadeEngine;
use flush::FlushProcessor;
use loader::Loader;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tessera_core::{Dialect, EntityRef, MetadataRegistry, Result, Row, Store, Value};

// ============================================================================
// Events
// ============================================================================

/// A registered listener. Returning `Err` aborts the operation in progress.
type Listener = Box<dyn FnMut() -> Result<()>>;

/// Listeners in registration order, each bound to one event.
#[derive(Default)]
pub struct EventListeners {
    listeners: Vec<(SessionEvent, Listener)>,
}

impl std::fmt::Debug for EventListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let events: Vec<SessionEvent> = self.listeners.iter().map(|(e, _)| *e).collect();
        f.debug_struct("EventListeners").field("events", &events).finish()
    }
}

impl EventListeners {
    fn register(&mut self, event: SessionEvent, listener: Listener) {
        self.listeners.push((event, listener));
    }

    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        for (_, listener) in self.listeners.iter_mut().filter(|(e, _)| *e == event) {
            listener()?;
        }
        Ok(())
    }
}

/// Points in the unit of work where listeners run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Before any planning; a failing listener leaves the context untouched.
    BeforeFlush,
    AfterFlush,
    /// After the commit-time flush, before the store commits.
    BeforeCommit,
    AfterCommit,
    AfterRollback,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// When pending changes are flushed implicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlushMode {
    /// Before commit and before queries that ask for it.
    #[default]
    Auto,
    /// Before commit only.
    Commit,
    /// Only on an explicit [`Session::flush`].
    Manual,
}

/// Session behavior. The default flushes automatically, batches up to 25
/// statements, checks constraints immediately and renders Postgres SQL.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub flush_mode: FlushMode,
    /// Foreign keys are checked at commit, so cycles with known identifiers
    /// may execute in declaration order.
    pub deferred_constraints: bool,
    /// Largest batch of identical statements; 0 or 1 disables batching.
    pub batch_size: usize,
    /// Reject NULL bound to non-nullable columns before execution.
    pub check_nullability: bool,
    /// Rendering style of generated SQL.
    pub dialect: Dialect,
    /// End the unit of work after commit, detaching every instance.
    pub clear_on_commit: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flush_mode: FlushMode::Auto,
            deferred_constraints: false,
            batch_size: 25,
            check_nullability: false,
            dialect: Dialect::Postgres,
            clear_on_commit: true,
        }
    }
}

impl SessionConfig {
    pub fn with_flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    pub fn with_deferred_constraints(mut self, value: bool) -> Self {
        self.deferred_constraints = value;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_check_nullability(mut self, value: bool) -> Self {
        self.check_nullability = value;
        self
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_clear_on_commit(mut self, value: bool) -> Self {
        self.clear_on_commit = value;
        self
    }
}

// ============================================================================
// Views
// ============================================================================

/// Read-only view of one entity entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityEntryView {
    pub entity: String,
    pub id: Option<Value>,
    pub status: EntityStatus,
    pub version: Option<Value>,
    pub exists_in_store: bool,
    /// A persistent snapshot has been taken
    pub loaded: bool,
}

/// Read-only view of one collection entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionEntryView {
    pub role: String,
    pub status: CollectionStatus,
    /// Element identifiers at the last synchronization
    pub snapshot_ids: Vec<Value>,
    pub orphan_removal: bool,
    /// Membership differs from the snapshot
    pub dirty: bool,
}

/// Summary of the persistence context for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDebugInfo {
    /// Entries by status.
    pub counts: StatusCounts,
    /// Whether a failed flush left the context unusable.
    pub tainted: bool,
    pub flush_mode: String,
}

// ============================================================================
// Session
// ============================================================================

/// One unit of work over a store.
///
/// It tracks instances loaded from or persisted to the store and
/// coordinates flushing their changes back in dependency order.
pub struct Session<S: Store> {
    store: S,
    registry: Arc<MetadataRegistry>,
    context: PersistenceContext,
    config: SessionConfig,
    statistics: Statistics,
    listeners: EventListeners,
}

impl<S: Store> Session<S> {
    /// Create a new session over `store`.
    pub fn new(store: S, registry: Arc<MetadataRegistry>) -> Self {
        Self::with_config(store, registry, SessionConfig::default())
    }

    pub fn with_config(store: S, registry: Arc<MetadataRegistry>, config: SessionConfig) -> Self {
        Self {
            store,
            registry,
            context: PersistenceContext::new(),
            config,
            statistics: Statistics::new(),
            listeners: EventListeners::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn registry(&self) -> &MetadataRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn cascade(&mut self) -> CascadeEngine<'_, S> {
        CascadeEngine::new(
            &mut self.context,
            &self.registry,
            &mut self.store,
            &mut self.statistics,
        )
    }

    fn loader(&mut self) -> Loader<'_, S> {
        Loader::new(
            &mut self.context,
            &self.registry,
            &mut self.store,
            &mut self.statistics,
        )
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Run `f` whenever `event` occurs.
    pub fn on(&mut self, event: SessionEvent, f: impl FnMut() -> Result<()> + 'static) {
        self.listeners.register(event, Box::new(f));
    }

    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + 'static) {
        self.on(SessionEvent::BeforeFlush, f);
    }

    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + 'static) {
        self.on(SessionEvent::AfterFlush, f);
    }

    /// A failing listener prevents the store commit.
    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<()> + 'static) {
        self.on(SessionEvent::BeforeCommit, f);
    }

    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + 'static) {
        self.on(SessionEvent::AfterCommit, f);
    }

    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + 'static) {
        self.on(SessionEvent::AfterRollback, f);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Make a transient instance managed, cascading per `persist`.
    ///
    /// Sequence identifiers are drawn immediately; identity columns are
    /// assigned when the insert executes.
    #[tracing::instrument(level = "debug", skip(self, instance), fields(entity = %instance.entity()))]
    pub fn persist(&mut self, instance: &EntityRef) -> Result<()> {
        self.cascade().persist(instance)
    }

    /// Copy the state of `instance` onto its managed counterpart and return
    /// the managed instance. `instance` itself is never attached.
    #[tracing::instrument(level = "debug", skip(self, instance), fields(entity = %instance.entity()))]
    pub fn merge(&mut self, instance: &EntityRef) -> Result<EntityRef> {
        self.cascade().merge(instance)
    }

    /// Schedule `instance` for deletion, cascading per `remove`.
    #[tracing::instrument(level = "debug", skip(self, instance), fields(entity = %instance.entity()))]
    pub fn remove(&mut self, instance: &EntityRef) -> Result<()> {
        self.cascade().remove(instance)
    }

    /// Overwrite managed state from the store, cascading per `refresh`.
    #[tracing::instrument(level = "debug", skip(self, instance), fields(entity = %instance.entity()))]
    pub fn refresh(&mut self, instance: &EntityRef) -> Result<()> {
        self.cascade().refresh(instance)
    }

    /// Stop tracking `instance`. Pending changes to it are discarded.
    ///
    /// Returns whether it was managed.
    #[tracing::instrument(level = "debug", skip(self, instance), fields(entity = %instance.entity()))]
    pub fn evict(&mut self, instance: &EntityRef) -> bool {
        self.context.evict(instance.instance_id()).is_some()
    }

    /// Find an instance by identifier, loading it if it is not managed.
    ///
    /// An instance scheduled for removal is not returned.
    pub fn find(&mut self, entity: &str, id: impl Into<Value>) -> Result<Option<EntityRef>> {
        let id = id.into();
        self.loader().find(entity, &id)
    }

    /// Manage a row produced by an external query.
    pub fn hydrate(&mut self, entity: &str, row: &Row) -> Result<EntityRef> {
        let meta = self.registry.get(entity)?;
        self.loader().hydrate(&meta, row)
    }

    /// Add `element` to `owner`'s collection `role`, keeping a bidirectional
    /// back reference in step.
    pub fn add_element(&mut self, owner: &EntityRef, role: &str, element: &EntityRef) -> Result<bool> {
        let meta = self.registry.get(&owner.entity())?;
        let info = meta.collection_info(role)?;
        Ok(CollectionSemantics::new(info).add(owner, element))
    }

    /// Remove `element` from `owner`'s collection `role`.
    pub fn remove_element(&mut self, owner: &EntityRef, role: &str, element: &EntityRef) -> Result<bool> {
        let meta = self.registry.get(&owner.entity())?;
        let info = meta.collection_info(role)?;
        Ok(CollectionSemantics::new(info).remove(owner, element))
    }

    // ========================================================================
    // Flush & Transactions
    // ========================================================================

    /// Synchronize pending changes with the store.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn flush(&mut self) -> Result<FlushResult> {
        self.context.ensure_usable()?;
        self.listeners.fire(SessionEvent::BeforeFlush)?;
        let started = Instant::now();
        let result = FlushProcessor::new(
            &mut self.context,
            &self.registry,
            &mut self.store,
            &self.config,
            &mut self.statistics,
        )
        .run()?;
        if !result.is_empty() {
            tracing::info!(
                inserted = result.inserted,
                updated = result.updated,
                deleted = result.deleted,
                collection_rows = result.collection_rows,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Flush complete"
            );
        }
        self.listeners.fire(SessionEvent::AfterFlush)?;
        Ok(result)
    }

    /// Flush before a query when the flush mode is [`FlushMode::Auto`].
    pub fn flush_for_query(&mut self) -> Result<Option<FlushResult>> {
        match self.config.flush_mode {
            FlushMode::Auto => self.flush().map(Some),
            FlushMode::Commit | FlushMode::Manual => Ok(None),
        }
    }

    /// Flush (unless manual), commit the store transaction and end the unit
    /// of work.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn commit(&mut self) -> Result<()> {
        if self.config.flush_mode != FlushMode::Manual {
            self.flush()?;
        }
        self.context.ensure_usable()?;
        self.listeners.fire(SessionEvent::BeforeCommit)?;
        self.store.commit()?;
        if self.config.clear_on_commit {
            self.context.clear();
        }
        tracing::info!("Committed");
        self.listeners.fire(SessionEvent::AfterCommit)
    }

    /// Roll back the store transaction and discard all managed state.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn rollback(&mut self) -> Result<()> {
        let result = self.store.rollback();
        self.context.clear();
        result?;
        tracing::info!("Rolled back");
        self.listeners.fire(SessionEvent::AfterRollback)
    }

    /// Drop every managed instance, tombstone and the taint flag.
    pub fn clear(&mut self) {
        self.context.clear();
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn status(&self, instance: &EntityRef) -> EntityStatus {
        self.context.status_of(instance)
    }

    pub fn contains(&self, instance: &EntityRef) -> bool {
        self.context.contains(instance)
    }

    pub fn entry(&self, instance: &EntityRef) -> Option<EntityEntryView> {
        self.context
            .entry(instance.instance_id())
            .map(|entry| EntityEntryView {
                entity: entry.metadata.name.clone(),
                id: entry.id.clone(),
                status: entry.status,
                version: entry.version.clone(),
                exists_in_store: entry.exists_in_store,
                loaded: entry.snapshot.is_some(),
            })
    }

    pub fn collection_entry(&self, owner: &EntityRef, role: &str) -> Option<CollectionEntryView> {
        let collection = self.context.collection_entry(owner.instance_id(), role)?;
        let dirty = !change_tracker::diff_collection(collection.snapshot.as_ref(), &owner.collection(role))
            .is_empty();
        Some(CollectionEntryView {
            role: collection.info.qualified_role(),
            status: collection.status,
            snapshot_ids: collection
                .snapshot
                .as_ref()
                .map(CollectionSnapshot::ids)
                .unwrap_or_default(),
            orphan_removal: collection.orphan_removal,
            dirty,
        })
    }

    /// Columns the next flush would write for `instance`.
    pub fn dirty_columns(&self, instance: &EntityRef) -> Vec<String> {
        let Some(entry) = self.context.entry(instance.instance_id()) else {
            return Vec::new();
        };
        let Some(snapshot) = &entry.snapshot else {
            return Vec::new();
        };
        change_tracker::dirty_columns(instance, &entry.metadata, snapshot, &self.registry)
            .into_iter()
            .map(|c| c.column)
            .collect()
    }

    /// Whether the next flush would write anything for `instance`.
    pub fn is_dirty(&self, instance: &EntityRef) -> bool {
        let Some(entry) = self.context.entry(instance.instance_id()) else {
            return false;
        };
        match entry.status {
            EntityStatus::ManagedNew | EntityStatus::Removed => true,
            EntityStatus::ManagedPersistent => {
                !self.dirty_columns(instance).is_empty()
                    || entry
                        .metadata
                        .collections
                        .iter()
                        .any(|info| self.collection_entry(instance, &info.role).is_some_and(|c| c.dirty))
            }
            _ => false,
        }
    }

    /// The last persisted snapshot of `instance` as JSON, for diagnostics.
    pub fn snapshot_json(&self, instance: &EntityRef) -> Option<serde_json::Value> {
        self.context
            .entry(instance.instance_id())
            .and_then(|entry| entry.snapshot.as_ref())
            .map(EntitySnapshot::to_json)
    }

    pub fn is_tainted(&self) -> bool {
        self.context.is_tainted()
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn clear_statistics(&mut self) {
        self.statistics.clear();
    }

    pub fn debug_info(&self) -> SessionDebugInfo {
        SessionDebugInfo {
            counts: self.context.counts(),
            tainted: self.context.is_tainted(),
            flush_mode: format!("{:?}", self.config.flush_mode),
        }
    }
}

impl<S: Store> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("counts", &self.context.counts())
            .field("tainted", &self.context.is_tainted())
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
