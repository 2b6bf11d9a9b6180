//! The flush processor.
//!
//! A flush turns the difference between managed state and the snapshots
//! taken at load or the previous flush into ordered mutations. It runs in
//! two halves.
//!
//! Planning never touches the store apart from drawing sequence values for
//! instances reached by persist-on-flush:
//!
//! 1. persist cascades from every managed instance
//! 2. references to transient instances are rejected
//! 3. elements dropped from orphan-removal collections are scheduled for
//!    delete unless another managed owner now holds them
//! 4. inserts, updates, collection row operations and deletes are planned
//!
//! Execution then runs the plan in phases. Inserts go first, parents before
//! children, followed by link-row inserts. Updates come next: entity updates,
//! foreign-key fixups for broken insert cycles, collection foreign-key clears
//! and sets, and the foreign-key nulling that breaks delete cycles. The last
//! phase is link-row deletes followed by entity deletes, children before parents.
//!
//! Any failure while executing taints the context. Planning failures leave it
//! exactly as it was.

use crate::cascade::CascadeEngine;
use crate::change_tracker::{diff_collection, dirty_columns, ColumnChange};
use crate::collection::{CollectionRowOp, CollectionSemantics};
use crate::context::{EntityEntry, EntityStatus, PersistenceContext};
use crate::executor::{MutationExecutor, Param, PlannedMutation};
use crate::optimistic;
use crate::statistics::Statistics;
use crate::SessionConfig;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use tessera_core::error::MappingError;
use tessera_core::{
    Binding, CircularDependencyError, CollectionInfo, EntityMetadata, EntityRef, Error,
    ExecutionResult, InstanceId, MappingErrorKind, MetadataRegistry,
    MutationDescriptor, MutationKind, MutationTarget, Result, Store, TransientReferenceError, Value,
};

/// Counts of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushResult {
    pub inserted: usize,
    /// Entity row updates, including foreign-key fixups
    pub updated: usize,
    pub deleted: usize,
    /// Foreign-key writes and link rows produced by collection changes
    pub collection_rows: usize,
}

impl FlushResult {
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.collection_rows
    }
}

/// A foreign-key value written by an entity insert.
struct ForeignKey {
    column: String,
    target: Option<EntityRef>,
    nullable: bool,
}

/// `before` executes before `after`. Breaking the edge writes NULL into
/// `column` of `row` and leaves the real value to a separate update.
struct Dependency {
    before: usize,
    after: usize,
    row: usize,
    column: String,
    nullable: bool,
}

/// Collection-driven work found while diffing collections.
#[derive(Default)]
struct CollectionWork<'c> {
    /// (new element, fk column) to owner, written by the element's insert
    folded: HashMap<(InstanceId, String), EntityRef>,
    /// Persistent owners whose version moves with a collection change
    bumps: HashSet<InstanceId>,
    ops: Vec<(EntityRef, &'c CollectionInfo, CollectionRowOp)>,
}

#[derive(Default)]
struct FlushPlan {
    inserts: Vec<PlannedMutation>,
    link_inserts: Vec<PlannedMutation>,
    updates: Vec<PlannedMutation>,
    insert_fixups: Vec<PlannedMutation>,
    collection_updates: Vec<PlannedMutation>,
    delete_fixups: Vec<PlannedMutation>,
    link_deletes: Vec<PlannedMutation>,
    deletes: Vec<PlannedMutation>,
    /// Inserted instances with the version they were inserted at
    inserted: Vec<(InstanceId, Option<Value>)>,
    /// Updated instances with their new version, when it moved
    updated: Vec<(InstanceId, Option<Value>)>,
    /// Entity of each fixup update
    fixed: Vec<String>,
    deleted: Vec<(InstanceId, String)>,
    collection_rows: usize,
}

impl FlushPlan {
    fn is_empty(&self) -> bool {
        self.phases().iter().all(Vec::is_empty)
    }

    fn phases(&self) -> [Vec<PlannedMutation>; 3] {
        let concat = |parts: &[&Vec<PlannedMutation>]| -> Vec<PlannedMutation> {
            parts.iter().flat_map(|p| p.iter().cloned()).collect()
        };
        [
            concat(&[&self.inserts, &self.link_inserts]),
            concat(&[
                &self.updates,
                &self.insert_fixups,
                &self.collection_updates,
                &self.delete_fixups,
            ]),
            concat(&[&self.link_deletes, &self.deletes]),
        ]
    }
}

pub(crate) struct FlushProcessor<'s, S: Store> {
    ctx: &'s mut PersistenceContext,
    registry: &'s MetadataRegistry,
    store: &'s mut S,
    config: &'s SessionConfig,
    stats: &'s mut Statistics,
}

impl<'s, S: Store> FlushProcessor<'s, S> {
    pub(crate) fn new(
        ctx: &'s mut PersistenceContext,
        registry: &'s MetadataRegistry,
        store: &'s mut S,
        config: &'s SessionConfig,
        stats: &'s mut Statistics,
    ) -> Self {
        Self {
            ctx,
            registry,
            store,
            config,
            stats,
        }
    }

    pub(crate) fn run(mut self) -> Result<FlushResult> {
        self.ctx.ensure_usable()?;
        self.cascade_on_flush()?;
        self.check_references()?;
        self.remove_orphans()?;

        let plan = self.plan()?;
        self.stats.record_flush();
        if plan.is_empty() {
            // Inverse-only membership changes still need fresh snapshots.
            self.ctx.refresh_collection_snapshots();
            return Ok(FlushResult::default());
        }
        tracing::debug!(
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            fixups = plan.fixed.len(),
            deletes = plan.deletes.len(),
            collection_rows = plan.collection_rows,
            "Flush plan built"
        );

        if let Err(err) = self.execute(&plan) {
            self.ctx.taint();
            if err.is_concurrency_conflict() {
                self.stats.record_optimistic_failure();
            }
            tracing::warn!(error = %err, "Flush execution failed; context tainted");
            return Err(err);
        }
        Ok(self.complete(plan))
    }

    // ------------------------------------------------------------------
    // Pre-flush
    // ------------------------------------------------------------------

    fn cascade_on_flush(&mut self) -> Result<()> {
        let managed: Vec<EntityRef> = self
            .ctx
            .entries_in_order()
            .into_iter()
            .filter(|e| e.status.is_managed())
            .map(|e| e.instance.clone())
            .collect();
        let mut engine = CascadeEngine::new(self.ctx, self.registry, self.store, self.stats).on_flush();
        for instance in &managed {
            engine.persist(instance)?;
        }
        Ok(())
    }

    fn check_references(&self) -> Result<()> {
        for entry in self.ctx.entries_in_order() {
            if !entry.status.is_managed() {
                continue;
            }
            for assoc in &entry.metadata.associations {
                if let Some(target) = entry.instance.reference(&assoc.name) {
                    self.ensure_not_transient(entry, &assoc.name, &target)?;
                }
            }
            for info in &entry.metadata.collections {
                for element in entry.instance.collection(&info.role) {
                    self.ensure_not_transient(entry, &info.role, &element)?;
                }
            }
        }
        Ok(())
    }

    fn ensure_not_transient(&self, entry: &EntityEntry, association: &str, target: &EntityRef) -> Result<()> {
        if self.ctx.status_of(target) == EntityStatus::Transient {
            return Err(Error::TransientReference(TransientReferenceError {
                entity: entry.metadata.name.clone(),
                association: association.to_string(),
                target: target.entity(),
            }));
        }
        Ok(())
    }

    fn remove_orphans(&mut self) -> Result<()> {
        let mut orphans = Vec::new();
        for key in self.ctx.collection_keys() {
            let (Some(collection), Some(owner)) = (
                self.ctx.collection_entry(key.owner, &key.role),
                self.ctx.entry(key.owner),
            ) else {
                continue;
            };
            if !collection.orphan_removal {
                continue;
            }
            let current = match owner.status {
                EntityStatus::ManagedNew | EntityStatus::ManagedPersistent => {
                    owner.instance.collection(&key.role)
                }
                _ => Vec::new(),
            };
            for element in diff_collection(collection.snapshot.as_ref(), &current).removed {
                if let Some(new_owner) = self.new_owner(&element, &collection.info, key.owner) {
                    tracing::warn!(
                        role = %collection.info.qualified_role(),
                        element = %element.instance_id(),
                        new_owner = %new_owner.instance_id(),
                        "Orphan re-parented; not deleting"
                    );
                    continue;
                }
                if self.ctx.status_of(&element).is_managed() {
                    orphans.push(element);
                }
            }
        }
        if orphans.is_empty() {
            return Ok(());
        }
        let mut engine = CascadeEngine::new(self.ctx, self.registry, self.store, self.stats);
        for orphan in &orphans {
            tracing::debug!(
                entity = %orphan.entity(),
                instance = %orphan.instance_id(),
                "Removing orphan"
            );
            engine.remove(orphan)?;
        }
        Ok(())
    }

    /// Another managed owner whose same-role collection now holds `element`.
    fn new_owner(&self, element: &EntityRef, info: &CollectionInfo, previous: InstanceId) -> Option<EntityRef> {
        self.ctx
            .entries_in_order()
            .into_iter()
            .find(|e| {
                e.instance.instance_id() != previous
                    && e.status.is_managed()
                    && e.metadata.name == info.owner
                    && e.instance.contains(&info.role, element)
            })
            .map(|e| e.instance.clone())
    }

    // ------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------

    fn plan(&self) -> Result<FlushPlan> {
        let mut plan = FlushPlan::default();
        let entries = self.ctx.entries_in_order();
        let work = self.plan_collections();
        self.plan_inserts(&entries, &work.folded, &mut plan)?;
        self.plan_updates(&entries, &work.bumps, &mut plan)?;
        self.plan_collection_rows(&work.ops, &mut plan)?;
        self.plan_deletes(&entries, &mut plan)?;
        Ok(plan)
    }

    fn plan_collections(&self) -> CollectionWork<'_> {
        let mut work = CollectionWork::default();
        for key in self.ctx.collection_keys() {
            let (Some(collection), Some(owner)) = (
                self.ctx.collection_entry(key.owner, &key.role),
                self.ctx.entry(key.owner),
            ) else {
                continue;
            };
            let current = match owner.status {
                EntityStatus::ManagedNew | EntityStatus::ManagedPersistent => {
                    owner.instance.collection(&key.role)
                }
                EntityStatus::Removed => Vec::new(),
                _ => continue,
            };
            let diff = diff_collection(collection.snapshot.as_ref(), &current);
            if diff.is_empty() {
                continue;
            }
            let info = &collection.info;
            if owner.status == EntityStatus::ManagedPersistent
                && info.optimistic_lock
                && owner.metadata.is_versioned()
            {
                work.bumps.insert(key.owner);
            }
            for op in CollectionSemantics::new(info).row_operations(&diff) {
                if let CollectionRowOp::SetForeignKey(element) = &op {
                    if let Some(other) = self.new_owner(element, info, key.owner) {
                        tracing::warn!(
                            role = %info.qualified_role(),
                            element = %element.instance_id(),
                            owner = %key.owner,
                            other_owner = %other.instance_id(),
                            "Element claimed by two owners; last write wins"
                        );
                    }
                }
                let status = self.ctx.status_of(op.element());
                let row_exists = matches!(status, EntityStatus::ManagedPersistent | EntityStatus::Detached);
                let keep = match &op {
                    CollectionRowOp::SetForeignKey(element) if status == EntityStatus::ManagedNew => {
                        if let Some(fk) = info.element_fk_column() {
                            work.folded
                                .insert((element.instance_id(), fk.to_string()), owner.instance.clone());
                        }
                        false
                    }
                    CollectionRowOp::SetForeignKey(_) => row_exists,
                    CollectionRowOp::ClearForeignKey(element) => {
                        row_exists && self.new_owner(element, info, key.owner).is_none()
                    }
                    CollectionRowOp::InsertLink(_) => {
                        row_exists || status == EntityStatus::ManagedNew
                    }
                    CollectionRowOp::DeleteLink(_) => row_exists || status == EntityStatus::Removed,
                };
                if keep {
                    work.ops.push((owner.instance.clone(), info, op));
                }
            }
        }
        work
    }

    fn plan_inserts(
        &self,
        entries: &[&EntityEntry],
        folded: &HashMap<(InstanceId, String), EntityRef>,
        plan: &mut FlushPlan,
    ) -> Result<()> {
        let nodes: Vec<&EntityEntry> = entries
            .iter()
            .copied()
            .filter(|e| e.status == EntityStatus::ManagedNew)
            .collect();
        if nodes.is_empty() {
            return Ok(());
        }
        let index: HashMap<InstanceId, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, e)| (e.instance.instance_id(), i))
            .collect();

        let mut foreign_keys = Vec::with_capacity(nodes.len());
        let mut deps = Vec::new();
        let mut deferred: HashSet<(usize, String)> = HashSet::new();
        for (i, entry) in nodes.iter().enumerate() {
            let keys = self.insert_foreign_keys(entry, folded);
            for fk in &keys {
                let Some(&j) = fk.target.as_ref().and_then(|t| index.get(&t.instance_id())) else {
                    continue;
                };
                if i == j {
                    if entry.metadata.id_generation.known_before_insert() {
                        continue;
                    }
                    if fk.nullable {
                        deferred.insert((i, fk.column.clone()));
                        continue;
                    }
                    return Err(circular("insert", vec![entry.metadata.name.clone()]));
                }
                deps.push(Dependency {
                    before: j,
                    after: i,
                    row: i,
                    column: fk.column.clone(),
                    nullable: fk.nullable,
                });
            }
            foreign_keys.push(keys);
        }

        let ids_known: Vec<bool> = nodes
            .iter()
            .map(|e| e.metadata.id_generation.known_before_insert())
            .collect();
        let (order, broken) = topological_order(nodes.len(), &deps, |remaining| {
            self.config.deferred_constraints && remaining.iter().all(|&k| ids_known[k])
        })
        .map_err(|cycle| circular("insert", cycle.iter().map(|&k| nodes[k].metadata.name.clone()).collect()))?;
        for k in broken {
            deferred.insert((deps[k].row, deps[k].column.clone()));
        }

        for i in order {
            let entry = nodes[i];
            let deferred_columns: Vec<&str> = foreign_keys[i]
                .iter()
                .filter(|fk| deferred.contains(&(i, fk.column.clone())))
                .map(|fk| fk.column.as_str())
                .collect();
            let (mutation, seeded) = self.plan_insert(entry, &foreign_keys[i], &deferred_columns)?;
            plan.inserts.push(mutation);
            for fk in foreign_keys[i]
                .iter()
                .filter(|fk| deferred_columns.contains(&fk.column.as_str()))
            {
                tracing::debug!(
                    entity = %entry.metadata.name,
                    column = %fk.column,
                    "Breaking insert cycle with a foreign-key fixup"
                );
                plan.insert_fixups.push(self.build_update(
                    entry,
                    vec![(fk.column.clone(), Param::IdOf(fk.target.clone()))],
                    None,
                    seeded.clone(),
                ));
                plan.fixed.push(entry.metadata.name.clone());
            }
            plan.inserted.push((entry.instance.instance_id(), seeded));
        }
        Ok(())
    }

    /// Foreign keys an insert writes: owning associations in declaration
    /// order, then columns owned by one-to-many collections of other entities.
    fn insert_foreign_keys(
        &self,
        entry: &EntityEntry,
        folded: &HashMap<(InstanceId, String), EntityRef>,
    ) -> Vec<ForeignKey> {
        let meta = &entry.metadata;
        let mut keys: Vec<ForeignKey> = meta
            .associations
            .iter()
            .filter(|a| self.registry.owning_collection_for(&meta.name, &a.fk_column).is_none())
            .map(|a| ForeignKey {
                column: a.fk_column.clone(),
                target: entry.instance.reference(&a.name),
                nullable: a.nullable,
            })
            .collect();
        for info in owning_collections_of(self.registry, &meta.name) {
            let Some(column) = info.element_fk_column() else {
                continue;
            };
            if keys.iter().any(|k| k.column == column) {
                continue;
            }
            let nullable = info
                .back_reference
                .as_deref()
                .and_then(|back| meta.association_info(back).ok())
                .map_or(true, |a| a.nullable);
            keys.push(ForeignKey {
                column: column.to_string(),
                target: folded
                    .get(&(entry.instance.instance_id(), column.to_string()))
                    .cloned(),
                nullable,
            });
        }
        keys
    }

    /// Plan one entity insert. Returns the mutation and the version the row
    /// is inserted at.
    fn plan_insert(
        &self,
        entry: &EntityEntry,
        foreign_keys: &[ForeignKey],
        deferred: &[&str],
    ) -> Result<(PlannedMutation, Option<Value>)> {
        let meta = &entry.metadata;
        let instance = &entry.instance;
        let custom = meta.custom_sql_for(MutationKind::Insert);
        if custom.is_some() && !meta.id_generation.known_before_insert() {
            return Err(Error::Mapping(MappingError {
                kind: MappingErrorKind::Invalid,
                message: format!(
                    "{} combines a custom insert with a store-generated identifier",
                    meta.name
                ),
            }));
        }

        let mut descriptor = MutationDescriptor::insert(&meta.table, entity_target(meta));
        let mut params = Vec::new();
        let mut not_null = Vec::new();

        if meta.id_generation.known_before_insert() {
            if instance.id().is_none() {
                return Err(Error::Mapping(MappingError {
                    kind: MappingErrorKind::Identifier,
                    message: format!("{} reached flush without an identifier", meta.name),
                }));
            }
            descriptor = descriptor.set(&meta.id_column, Binding::Parameter);
            params.push(Param::id_of(instance));
            not_null.push(meta.id_column.clone());
        }
        for column in meta.columns.iter().filter(|c| c.insertable) {
            let value = instance.get(&column.name);
            // Generated SQL leaves NULLs in nullable or generated columns to
            // the store default; a custom statement binds every declared column.
            if custom.is_none() && value.is_null() && (column.nullable || column.generated) {
                continue;
            }
            descriptor = descriptor.set(&column.name, Binding::Parameter);
            params.push(Param::Value(value));
            if !column.nullable && !column.generated {
                not_null.push(column.name.clone());
            }
        }
        let seeded = meta.version.as_ref().map(|info| {
            instance
                .version()
                .unwrap_or_else(|| optimistic::seed_version(info))
        });
        if let (Some(info), Some(version)) = (&meta.version, &seeded) {
            descriptor = descriptor.set(&info.column, Binding::Parameter);
            params.push(Param::Value(version.clone()));
        }
        for fk in foreign_keys {
            let target = if deferred.contains(&fk.column.as_str()) {
                None
            } else {
                fk.target.clone()
            };
            if custom.is_none() && target.is_none() {
                continue;
            }
            descriptor = descriptor.set(&fk.column, Binding::Parameter);
            params.push(Param::IdOf(target));
            if !fk.nullable {
                not_null.push(fk.column.clone());
            }
        }

        match custom {
            Some(sql) => descriptor = descriptor.with_custom(sql.clone()),
            None => {
                let mut returning = Vec::new();
                if !meta.id_generation.known_before_insert() {
                    returning.push(meta.id_column.clone());
                }
                returning.extend(
                    meta.columns
                        .iter()
                        .filter(|c| c.generated)
                        .map(|c| c.name.clone()),
                );
                descriptor = descriptor.returning(returning);
            }
        }
        let mutation = PlannedMutation::new(descriptor, params)
            .subject(instance)
            .not_null(not_null);
        Ok((mutation, seeded))
    }

    fn plan_updates(&self, entries: &[&EntityEntry], bumps: &HashSet<InstanceId>, plan: &mut FlushPlan) -> Result<()> {
        for entry in entries
            .iter()
            .filter(|e| e.status == EntityStatus::ManagedPersistent)
        {
            let Some(snapshot) = &entry.snapshot else {
                continue;
            };
            let id = entry.instance.instance_id();
            let changes = dirty_columns(&entry.instance, &entry.metadata, snapshot, self.registry);
            let forced = bumps.contains(&id);
            if changes.is_empty() && !forced {
                continue;
            }
            let increment = forced || changes.iter().any(|c| c.optimistic_lock);
            let new_version = match &entry.metadata.version {
                Some(info) if increment => Some(optimistic::next_version(info, entry.version.as_ref())?),
                _ => None,
            };
            let set: Vec<(String, Param)> = changes
                .iter()
                .map(|c| (c.column.clone(), change_param(&entry.instance, c)))
                .collect();
            if set.is_empty() && new_version.is_none() {
                continue;
            }
            tracing::trace!(
                entity = %entry.metadata.name,
                instance = %id,
                columns = ?changes.iter().map(|c| c.column.as_str()).collect::<Vec<_>>(),
                version_only = changes.is_empty(),
                "Dirty instance"
            );
            let predicate = entry.version.clone().filter(|_| entry.metadata.is_versioned());
            plan.updates
                .push(self.build_update(entry, set, new_version.clone(), predicate));
            plan.updated.push((id, new_version));
        }
        Ok(())
    }

    /// Build an entity update.
    ///
    /// Generated SQL writes `set` plus the new version when there is one. A
    /// custom statement binds every updatable column, then the version, the
    /// key and the version predicate, with `set` overriding current values.
    fn build_update(
        &self,
        entry: &EntityEntry,
        set: Vec<(String, Param)>,
        new_version: Option<Value>,
        predicate: Option<Value>,
    ) -> PlannedMutation {
        let meta = &entry.metadata;
        let instance = &entry.instance;
        let custom = meta.custom_sql_for(MutationKind::Update);
        let columns = match custom {
            Some(_) => self.all_update_columns(entry, set),
            None => set,
        };

        let mut descriptor = MutationDescriptor::update(&meta.table, entity_target(meta));
        let mut params = Vec::with_capacity(columns.len() + 3);
        for (column, param) in columns {
            descriptor = descriptor.set(column, Binding::Parameter);
            params.push(param);
        }
        if let Some(info) = &meta.version {
            let written = match custom {
                Some(_) => Some(new_version.or_else(|| predicate.clone()).unwrap_or(Value::Null)),
                None => new_version,
            };
            if let Some(version) = written {
                descriptor = descriptor.set(&info.column, Binding::Parameter);
                params.push(Param::Value(version));
            }
        }
        descriptor = descriptor.key(&meta.id_column, Binding::Parameter);
        params.push(Param::id_of(instance));
        if let Some(version) = predicate {
            descriptor = optimistic::with_version_predicate(descriptor, meta);
            params.push(Param::Value(version));
        }
        if let Some(sql) = custom {
            descriptor = descriptor.with_custom(sql.clone());
        }
        PlannedMutation::new(descriptor, params).subject(instance)
    }

    fn all_update_columns(&self, entry: &EntityEntry, overrides: Vec<(String, Param)>) -> Vec<(String, Param)> {
        let meta = &entry.metadata;
        let mut columns: Vec<(String, Param)> = meta
            .columns
            .iter()
            .filter(|c| c.updatable)
            .map(|c| (c.name.clone(), Param::Value(entry.instance.get(&c.name))))
            .collect();
        columns.extend(
            meta.associations
                .iter()
                .filter(|a| self.registry.owning_collection_for(&meta.name, &a.fk_column).is_none())
                .map(|a| (a.fk_column.clone(), Param::IdOf(entry.instance.reference(&a.name)))),
        );
        for (column, param) in overrides {
            match columns.iter_mut().find(|(name, _)| *name == column) {
                Some(slot) => slot.1 = param,
                None => columns.push((column, param)),
            }
        }
        columns
    }

    fn plan_collection_rows(
        &self,
        ops: &[(EntityRef, &CollectionInfo, CollectionRowOp)],
        plan: &mut FlushPlan,
    ) -> Result<()> {
        for (owner, info, op) in ops {
            let element = self.registry.get(&info.element)?;
            let Some(mutation) = CollectionSemantics::new(info).plan(op, owner, &element) else {
                continue;
            };
            match op.kind() {
                MutationKind::Insert => plan.link_inserts.push(mutation),
                MutationKind::Update => plan.collection_updates.push(mutation),
                MutationKind::Delete => plan.link_deletes.push(mutation),
            }
            plan.collection_rows += 1;
        }
        Ok(())
    }

    fn plan_deletes(&self, entries: &[&EntityEntry], plan: &mut FlushPlan) -> Result<()> {
        let nodes: Vec<&EntityEntry> = entries
            .iter()
            .copied()
            .filter(|e| e.status == EntityStatus::Removed)
            .collect();
        if nodes.is_empty() {
            return Ok(());
        }
        let index: HashMap<InstanceId, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, e)| (e.instance.instance_id(), i))
            .collect();

        // A referencing row is deleted before the row it references. Edges
        // come from snapshots: that is what the store currently holds.
        let mut deps: Vec<Dependency> = Vec::new();
        for (i, entry) in nodes.iter().enumerate() {
            let meta = &entry.metadata;
            if let Some(snapshot) = &entry.snapshot {
                for (name, target) in snapshot.references() {
                    let Some(&j) = index.get(&target.instance) else {
                        continue;
                    };
                    let Ok(assoc) = meta.association_info(name) else {
                        continue;
                    };
                    if i != j {
                        deps.push(Dependency {
                            before: i,
                            after: j,
                            row: i,
                            column: assoc.fk_column.clone(),
                            nullable: assoc.nullable,
                        });
                    }
                }
            }
            for info in &meta.collections {
                let Some(column) = info.element_fk_column() else {
                    continue;
                };
                let Some(snapshot) = self
                    .ctx
                    .collection_entry(entry.instance.instance_id(), &info.role)
                    .and_then(|c| c.snapshot.as_ref())
                else {
                    continue;
                };
                for element in snapshot.elements() {
                    let Some(&k) = index.get(&element.instance.instance_id()) else {
                        continue;
                    };
                    let known = deps
                        .iter()
                        .any(|d| d.before == k && d.after == i && d.column == column);
                    if k == i || known {
                        continue;
                    }
                    let nullable = info
                        .back_reference
                        .as_deref()
                        .and_then(|back| nodes[k].metadata.association_info(back).ok())
                        .map_or(true, |a| a.nullable);
                    deps.push(Dependency {
                        before: k,
                        after: i,
                        row: k,
                        column: column.to_string(),
                        nullable,
                    });
                }
            }
        }

        let (order, broken) =
            topological_order(nodes.len(), &deps, |_| self.config.deferred_constraints).map_err(|cycle| {
                circular("delete", cycle.iter().map(|&k| nodes[k].metadata.name.clone()).collect())
            })?;
        for k in broken {
            let dep = &deps[k];
            let entry = nodes[dep.row];
            tracing::debug!(
                entity = %entry.metadata.name,
                column = %dep.column,
                "Breaking delete cycle by clearing a foreign key"
            );
            let predicate = entry.version.clone().filter(|_| entry.metadata.is_versioned());
            plan.delete_fixups.push(self.build_update(
                entry,
                vec![(dep.column.clone(), Param::Value(Value::Null))],
                None,
                predicate,
            ));
            plan.fixed.push(entry.metadata.name.clone());
        }
        for i in order {
            let entry = nodes[i];
            plan.deletes.push(plan_delete(entry));
            plan.deleted
                .push((entry.instance.instance_id(), entry.metadata.name.clone()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    fn execute(&mut self, plan: &FlushPlan) -> Result<()> {
        let ctx = &mut *self.ctx;
        let mut executor = MutationExecutor::new(&mut *self.store, self.config.dialect)
            .batch_size(self.config.batch_size)
            .check_nullability(self.config.check_nullability);
        let mut apply = |mutation: &PlannedMutation, result: &ExecutionResult| {
            apply_generated(ctx, mutation, result)
        };
        for phase in plan.phases() {
            let summary = executor.execute_all(&phase, &mut apply)?;
            tracing::trace!(
                statements = summary.statements,
                batches = summary.batches,
                affected_rows = summary.affected_rows,
                "Flush phase executed"
            );
        }
        Ok(())
    }

    /// Move executed state into the context once every mutation succeeded.
    fn complete(self, plan: FlushPlan) -> FlushResult {
        for (id, version) in &plan.inserted {
            if let Some(entry) = self.ctx.entry_mut(*id) {
                entry.status = EntityStatus::ManagedPersistent;
                entry.exists_in_store = true;
                if version.is_some() {
                    entry.instance.set_version(version.clone());
                }
                self.stats.record_insert(&entry.metadata.name);
            }
            self.ctx.refresh_snapshots(*id);
        }
        for (id, version) in &plan.updated {
            if let Some(entry) = self.ctx.entry_mut(*id) {
                if version.is_some() {
                    entry.instance.set_version(version.clone());
                }
                self.stats.record_update(&entry.metadata.name);
            }
            self.ctx.refresh_snapshots(*id);
        }
        for entity in &plan.fixed {
            self.stats.record_update(entity);
        }
        for (id, entity) in &plan.deleted {
            self.ctx.mark_deleted(*id);
            self.stats.record_delete(entity);
        }
        self.ctx.refresh_collection_snapshots();
        self.stats.record_collection_rows(plan.collection_rows);

        FlushResult {
            inserted: plan.inserted.len(),
            updated: plan.updated.len() + plan.fixed.len(),
            deleted: plan.deleted.len(),
            collection_rows: plan.collection_rows,
        }
    }
}

fn apply_generated(ctx: &mut PersistenceContext, mutation: &PlannedMutation, result: &ExecutionResult) -> Result<()> {
    if mutation.descriptor.kind() != MutationKind::Insert || result.generated.is_empty() {
        return Ok(());
    }
    let Some(subject) = &mutation.subject else {
        return Ok(());
    };
    let id_column = ctx
        .entry(subject.instance_id())
        .map(|e| e.metadata.id_column.clone());
    for (column, value) in &result.generated {
        if id_column.as_deref() == Some(column.as_str()) {
            tracing::trace!(instance = %subject.instance_id(), id = %value, "Generated identifier");
            ctx.register_id(subject.instance_id(), value.clone())?;
        } else {
            subject.set(column.clone(), value.clone());
        }
    }
    Ok(())
}

fn plan_delete(entry: &EntityEntry) -> PlannedMutation {
    let meta = &entry.metadata;
    let mut descriptor =
        MutationDescriptor::delete(&meta.table, entity_target(meta)).key(&meta.id_column, Binding::Parameter);
    let mut params = vec![match &entry.id {
        Some(id) => Param::Value(id.clone()),
        None => Param::id_of(&entry.instance),
    }];
    if let (true, Some(version)) = (meta.is_versioned(), &entry.version) {
        descriptor = optimistic::with_version_predicate(descriptor, meta);
        params.push(Param::Value(version.clone()));
    }
    if let Some(sql) = meta.custom_sql_for(MutationKind::Delete) {
        descriptor = descriptor.with_custom(sql.clone());
    }
    PlannedMutation::new(descriptor, params).subject(&entry.instance)
}

fn change_param(instance: &EntityRef, change: &ColumnChange) -> Param {
    match &change.association {
        Some(name) => Param::IdOf(instance.reference(name)),
        None => Param::Value(instance.get(&change.column)),
    }
}

fn entity_target(meta: &EntityMetadata) -> MutationTarget {
    MutationTarget::Entity(meta.name.clone())
}

fn circular(phase: &'static str, entities: Vec<String>) -> Error {
    Error::CircularDependency(CircularDependencyError { phase, entities })
}

/// Owning one-to-many collections, of any entity, whose elements are `element`.
fn owning_collections_of<'r>(
    registry: &'r MetadataRegistry,
    element: &'r str,
) -> impl Iterator<Item = &'r CollectionInfo> {
    registry
        .entities()
        .flat_map(|meta| meta.collections.iter())
        .filter(move |info| info.element == element && !info.inverse && info.element_fk_column().is_some())
}

/// Order `n` nodes so every dependency's `before` precedes its `after`.
///
/// Ready nodes are taken lowest index first, so the result is stable with
/// respect to the input order. When only cycles remain, a nullable
/// dependency that lies on a cycle is broken and ordering resumes. If none
/// exists, `allow_unordered` decides whether the remaining nodes may follow
/// in index order. Returns the order and the indices of broken
/// dependencies, or the nodes left on cycles.
fn topological_order(
    n: usize,
    deps: &[Dependency],
    allow_unordered: impl Fn(&[usize]) -> bool,
) -> std::result::Result<(Vec<usize>, Vec<usize>), Vec<usize>> {
    let mut indegree = vec![0usize; n];
    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (k, dep) in deps.iter().enumerate() {
        indegree[dep.after] += 1;
        outgoing[dep.before].push(k);
    }
    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut emitted = vec![false; n];
    let mut broken = vec![false; deps.len()];
    let mut order = Vec::with_capacity(n);
    let mut broken_list = Vec::new();

    while order.len() < n {
        if let Some(i) = ready.pop_first() {
            emitted[i] = true;
            order.push(i);
            for &k in &outgoing[i] {
                if broken[k] {
                    continue;
                }
                let after = deps[k].after;
                indegree[after] -= 1;
                if indegree[after] == 0 {
                    ready.insert(after);
                }
            }
            continue;
        }

        let live = |k: usize| !broken[k] && !emitted[deps[k].before] && !emitted[deps[k].after];
        let candidate = (0..deps.len()).find(|&k| {
            live(k) && deps[k].nullable && reaches(deps[k].after, deps[k].before, deps, &outgoing, &broken, &emitted)
        });
        if let Some(k) = candidate {
            broken[k] = true;
            broken_list.push(k);
            let after = deps[k].after;
            indegree[after] -= 1;
            if indegree[after] == 0 {
                ready.insert(after);
            }
            continue;
        }

        let remaining: Vec<usize> = (0..n).filter(|&i| !emitted[i]).collect();
        if allow_unordered(&remaining) {
            order.extend(remaining);
            break;
        }
        let on_cycle = remaining
            .into_iter()
            .filter(|&i| {
                outgoing[i]
                    .iter()
                    .any(|&k| live(k) && reaches(deps[k].after, i, deps, &outgoing, &broken, &emitted))
            })
            .collect();
        return Err(on_cycle);
    }
    Ok((order, broken_list))
}

/// Whether `to` is reachable from `from` over live dependencies.
fn reaches(
    from: usize,
    to: usize,
    deps: &[Dependency],
    outgoing: &[Vec<usize>],
    broken: &[bool],
    emitted: &[bool],
) -> bool {
    let mut stack = vec![from];
    let mut seen = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        for &k in &outgoing[node] {
            let next = deps[k].after;
            if !broken[k] && !emitted[next] {
                stack.push(next);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_tracker::CollectionSnapshot;
    use tessera_core::{
        AssociationInfo, CascadeSet, ColumnInfo, CustomSql, IdGeneration, LifecycleErrorKind, Row,
        VersionInfo,
    };

    fn dep(before: usize, after: usize, nullable: bool) -> Dependency {
        Dependency {
            before,
            after,
            row: after,
            column: format!("fk_{before}_{after}"),
            nullable,
        }
    }

    #[test]
    fn order_is_stable_without_dependencies() {
        let (order, broken) = topological_order(3, &[], |_| false).unwrap();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(broken.is_empty());
    }

    #[test]
    fn dependencies_move_parents_first() {
        let deps = vec![dep(2, 0, false), dep(1, 2, false)];
        let (order, _) = topological_order(3, &deps, |_| false).unwrap();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn nullable_edge_on_cycle_is_broken() {
        // 0 -> 1 non-nullable, 1 -> 0 nullable; a nullable edge off the
        // cycle must be left alone.
        let deps = vec![dep(0, 1, false), dep(1, 0, true), dep(2, 0, true)];
        let (order, broken) = topological_order(3, &deps, |_| false).unwrap();
        assert_eq!(broken, vec![1]);
        assert_eq!(order, vec![2, 0, 1]);
    }

    #[test]
    fn non_nullable_cycle_fails_unless_allowed() {
        let deps = vec![dep(0, 1, false), dep(1, 0, false)];
        let cycle = topological_order(3, &deps, |_| false).unwrap_err();
        assert_eq!(cycle, vec![0, 1]);

        let (order, broken) = topological_order(3, &deps, |_| true).unwrap();
        assert_eq!(order, vec![2, 0, 1]);
        assert!(broken.is_empty());
    }

    // --- processor -------------------------------------------------------

    #[derive(Default)]
    struct CountingStore {
        executed: Vec<(MutationKind, String, Vec<Value>)>,
        next_id: i64,
        rows: u64,
    }

    impl Store for CountingStore {
        fn execute(&mut self, mutation: &MutationDescriptor, params: &[Value]) -> Result<ExecutionResult> {
            self.executed
                .push((mutation.kind(), mutation.table().to_string(), params.to_vec()));
            let mut result = ExecutionResult::rows(self.rows);
            for column in mutation.returning_columns() {
                self.next_id += 1;
                result = result.with_generated(column.clone(), Value::BigInt(self.next_id));
            }
            Ok(result)
        }

        fn load_row(&mut self, _: &EntityMetadata, _: &Value) -> Result<Option<Row>> {
            Ok(None)
        }

        fn load_collection(&mut self, _: &CollectionInfo, _: &Value) -> Result<Vec<Value>> {
            Ok(Vec::new())
        }
    }

    fn registry() -> MetadataRegistry {
        MetadataRegistry::new()
            .with(
                EntityMetadata::new("Contract", "contract")
                    .id("id", IdGeneration::Identity)
                    .column(ColumnInfo::new("customer_name"))
                    .version(VersionInfo::counter("version"))
                    .collection(
                        CollectionInfo::one_to_many("parties", "Party", "contract_id")
                            .cascade(CascadeSet::ALL)
                            .orphan_removal(true),
                    ),
            )
            .with(
                EntityMetadata::new("Party", "party")
                    .id("id", IdGeneration::Identity)
                    .column(ColumnInfo::new("name")),
            )
            .with(
                EntityMetadata::new("Node", "node")
                    .id("id", IdGeneration::Identity)
                    .association(AssociationInfo::many_to_one("next", "Node", "next_id").nullable(true)),
            )
    }

    struct Harness {
        ctx: PersistenceContext,
        registry: MetadataRegistry,
        store: CountingStore,
        config: SessionConfig,
        stats: Statistics,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                ctx: PersistenceContext::new(),
                registry: registry(),
                store: CountingStore {
                    rows: 1,
                    ..CountingStore::default()
                },
                config: SessionConfig::default(),
                stats: Statistics::new(),
            }
        }

        fn persist(&mut self, instance: &EntityRef) {
            CascadeEngine::new(&mut self.ctx, &self.registry, &mut self.store, &mut self.stats)
                .persist(instance)
                .unwrap();
        }

        fn flush(&mut self) -> Result<FlushResult> {
            FlushProcessor::new(
                &mut self.ctx,
                &self.registry,
                &mut self.store,
                &self.config,
                &mut self.stats,
            )
            .run()
        }
    }

    #[test]
    fn owning_collection_foreign_key_folds_into_insert() {
        let mut h = Harness::new();
        let contract = EntityRef::new("Contract").with("customer_name", "Acme");
        let party = EntityRef::new("Party").with("name", "Buyer");
        contract.add_to("parties", &party);
        h.persist(&contract);

        let result = h.flush().unwrap();
        assert_eq!(result.inserted, 2);
        assert_eq!(result.updated, 0);
        assert_eq!(result.collection_rows, 0);

        let (kind, table, params) = &h.store.executed[1];
        assert_eq!((*kind, table.as_str()), (MutationKind::Insert, "party"));
        // name, then the folded contract_id bound to the generated id
        assert_eq!(params, &vec![Value::from("Buyer"), Value::BigInt(1)]);
        assert_eq!(contract.version(), Some(Value::BigInt(0)));
        assert_eq!(h.ctx.status_of(&party), EntityStatus::ManagedPersistent);

        // Nothing changed since.
        assert!(h.flush().unwrap().is_empty());
        contract.clear_associations();
    }

    #[test]
    fn orphan_is_deleted_and_versioned_owner_bumped() {
        let mut h = Harness::new();
        let contract = EntityRef::new("Contract");
        let party = EntityRef::new("Party");
        contract.add_to("parties", &party);
        h.persist(&contract);
        h.flush().unwrap();

        contract.remove_from("parties", &party);
        let result = h.flush().unwrap();
        assert_eq!(result.deleted, 1);
        assert_eq!(result.updated, 1);
        assert_eq!(result.collection_rows, 0);
        assert_eq!(contract.version(), Some(Value::BigInt(1)));
        assert_eq!(h.ctx.status_of(&party), EntityStatus::Deleted);
        contract.clear_associations();
    }

    #[test]
    fn self_reference_cycle_uses_fixup() {
        let mut h = Harness::new();
        let a = EntityRef::new("Node");
        let b = EntityRef::new("Node");
        a.set_reference("next", Some(&b));
        b.set_reference("next", Some(&a));
        h.persist(&a);
        h.persist(&b);

        let result = h.flush().unwrap();
        assert_eq!(result.inserted, 2);
        assert_eq!(result.updated, 1);
        let fixup = &h.store.executed[2];
        assert_eq!(fixup.0, MutationKind::Update);
        // next_id of the first node, keyed by its own id
        assert_eq!(fixup.2, vec![Value::BigInt(2), Value::BigInt(1)]);
        a.clear_associations();
        b.clear_associations();
    }

    #[test]
    fn transient_reference_is_rejected_before_execution() {
        let mut h = Harness::new();
        let a = EntityRef::new("Node");
        let stray = EntityRef::new("Node");
        a.set_reference("next", Some(&stray));
        h.persist(&a);

        let err = h.flush().unwrap_err();
        assert!(matches!(err, Error::TransientReference(ref t) if t.association == "next"));
        assert!(h.store.executed.is_empty());
        assert!(!h.ctx.is_tainted());
        a.clear_associations();
    }

    #[test]
    fn execution_failure_taints_context() {
        let mut h = Harness::new();
        let contract = EntityRef::new("Contract");
        h.persist(&contract);
        h.flush().unwrap();

        contract.set("customer_name", "Changed");
        h.store.rows = 0;
        let err = h.flush().unwrap_err();
        assert!(err.is_concurrency_conflict());
        assert!(h.ctx.is_tainted());
        assert_eq!(h.stats.optimistic_failures, 1);

        let err = h.flush().unwrap_err();
        assert!(matches!(err, Error::Lifecycle(ref l) if l.kind == LifecycleErrorKind::Tainted));
    }

    #[test]
    fn custom_insert_binds_every_column() {
        let mut h = Harness::new();
        h.registry.register(
            EntityMetadata::new("Plan", "plan")
                .id("id", IdGeneration::Assigned)
                .column(ColumnInfo::new("title"))
                .column(ColumnInfo::new("created_at").generated(true))
                .custom_sql(MutationKind::Insert, CustomSql::new("INSERT INTO plan VALUES (?, ?)")),
        );
        let plan = EntityRef::new("Plan").with_id(7_i64);
        h.persist(&plan);

        h.flush().unwrap();
        let (_, _, params) = &h.store.executed[0];
        // id, title, created_at: nulls and generated columns are still bound
        assert_eq!(params, &vec![Value::BigInt(7), Value::Null, Value::Null]);
    }

    #[test]
    fn collection_snapshots_follow_flush() {
        let mut h = Harness::new();
        let contract = EntityRef::new("Contract");
        h.persist(&contract);
        let entry = h.ctx.collection_entry(contract.instance_id(), "parties").unwrap();
        assert!(entry.snapshot.is_none());

        h.flush().unwrap();
        let entry = h.ctx.collection_entry(contract.instance_id(), "parties").unwrap();
        assert_eq!(entry.snapshot.as_ref().map(CollectionSnapshot::len), Some(0));
    }
}
