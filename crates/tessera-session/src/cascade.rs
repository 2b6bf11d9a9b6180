//! The cascade engine.
//!
//! Applies persist, merge, remove and refresh to a root instance and,
//! depth-first, to every instance reachable through associations whose
//! cascade set names the operation. A visited set keyed by [`InstanceId`]
//! makes each reachable instance receive the operation at most once and
//! guarantees termination on cyclic graphs.
//!
//! Cascading only changes managed state. Mutations are produced at flush.

use crate::context::{EntityStatus, PersistenceContext};
use crate::loader::Loader;
use crate::statistics::Statistics;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tessera_core::error::{MappingError, StaleStateError};
use tessera_core::{
    CascadeOp, EntityMetadata, EntityRef, Error, IdGeneration, InstanceId, LifecycleErrorKind,
    MappingErrorKind, MetadataRegistry, Result, Store,
};

pub(crate) struct CascadeEngine<'s, S: Store> {
    ctx: &'s mut PersistenceContext,
    registry: &'s MetadataRegistry,
    store: &'s mut S,
    stats: &'s mut Statistics,
    visited: HashSet<InstanceId>,
    /// Source instance to managed copy, for merge
    merged: HashMap<InstanceId, EntityRef>,
    /// Persist-on-flush: removed and detached targets are left alone
    flushing: bool,
}

impl<'s, S: Store> CascadeEngine<'s, S> {
    pub(crate) fn new(
        ctx: &'s mut PersistenceContext,
        registry: &'s MetadataRegistry,
        store: &'s mut S,
        stats: &'s mut Statistics,
    ) -> Self {
        Self {
            ctx,
            registry,
            store,
            stats,
            visited: HashSet::new(),
            merged: HashMap::new(),
            flushing: false,
        }
    }

    /// Switch to persist-on-flush, which never un-schedules a delete and
    /// never rejects a detached target.
    pub(crate) fn on_flush(mut self) -> Self {
        self.flushing = true;
        self
    }

    fn loader(&mut self) -> Loader<'_, S> {
        Loader::new(self.ctx, self.registry, self.store, self.stats)
    }

    /// Instances reached from `instance` by associations cascading `op`.
    fn cascade_targets(instance: &EntityRef, meta: &EntityMetadata, op: CascadeOp) -> Vec<EntityRef> {
        let mut targets: Vec<EntityRef> = meta
            .associations
            .iter()
            .filter(|a| a.cascade.contains(op))
            .filter_map(|a| instance.reference(&a.name))
            .collect();
        for info in meta.collections.iter().filter(|c| c.cascade.contains(op)) {
            targets.extend(instance.collection(&info.role));
        }
        targets
    }

    // ------------------------------------------------------------------
    // persist
    // ------------------------------------------------------------------

    pub(crate) fn persist(&mut self, instance: &EntityRef) -> Result<()> {
        if !self.visited.insert(instance.instance_id()) {
            return Ok(());
        }
        let meta = self.registry.get(&instance.entity())?;
        match self.ctx.status_of(instance) {
            EntityStatus::ManagedNew | EntityStatus::ManagedPersistent => {}
            EntityStatus::Removed | EntityStatus::Detached if self.flushing => return Ok(()),
            EntityStatus::Removed => self.ctx.unschedule_delete(instance.instance_id()),
            EntityStatus::Deleted => {
                return Err(Error::lifecycle(
                    LifecycleErrorKind::Deleted,
                    &meta.name,
                    "cannot persist an instance whose delete was flushed",
                ));
            }
            EntityStatus::Detached if meta.id_generation != IdGeneration::Assigned => {
                return Err(Error::lifecycle(
                    LifecycleErrorKind::DetachedPersist,
                    &meta.name,
                    format!(
                        "instance already carries generated id {}; use merge",
                        instance.id().map(|id| id.to_string()).unwrap_or_default()
                    ),
                ));
            }
            EntityStatus::Transient | EntityStatus::Detached => {
                self.assign_identifier(instance, &meta)?;
                self.ctx.mark_for_insert(instance, Arc::clone(&meta))?;
                tracing::debug!(
                    entity = %meta.name,
                    instance = %instance.instance_id(),
                    "Scheduled insert"
                );
            }
        }
        for target in Self::cascade_targets(instance, &meta, CascadeOp::Persist) {
            self.persist(&target)?;
        }
        Ok(())
    }

    fn assign_identifier(&mut self, instance: &EntityRef, meta: &EntityMetadata) -> Result<()> {
        match (&meta.id_generation, instance.id()) {
            (IdGeneration::Assigned, None) => Err(Error::Mapping(MappingError {
                kind: MappingErrorKind::Identifier,
                message: format!(
                    "{} uses assigned identifiers but none was set before persist",
                    meta.name
                ),
            })),
            (IdGeneration::Sequence(sequence), None) => {
                let id = self.store.next_sequence_value(sequence)?;
                tracing::trace!(entity = %meta.name, sequence = %sequence, id = %id, "Drew sequence value");
                instance.set_id(Some(id));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // remove
    // ------------------------------------------------------------------

    pub(crate) fn remove(&mut self, instance: &EntityRef) -> Result<()> {
        if !self.visited.insert(instance.instance_id()) {
            return Ok(());
        }
        let meta = self.registry.get(&instance.entity())?;
        let targets = Self::cascade_targets(instance, &meta, CascadeOp::Remove);
        match self.ctx.status_of(instance) {
            EntityStatus::ManagedNew | EntityStatus::ManagedPersistent => {
                let status = self.ctx.mark_for_delete(instance.instance_id());
                tracing::debug!(
                    entity = %meta.name,
                    instance = %instance.instance_id(),
                    status = ?status,
                    "Scheduled delete"
                );
            }
            EntityStatus::Removed | EntityStatus::Deleted | EntityStatus::Transient => {}
            EntityStatus::Detached => {
                return Err(Error::lifecycle(
                    LifecycleErrorKind::DetachedRemove,
                    &meta.name,
                    "cannot remove an instance this context does not manage",
                ));
            }
        }
        for target in targets {
            self.remove(&target)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // refresh
    // ------------------------------------------------------------------

    pub(crate) fn refresh(&mut self, instance: &EntityRef) -> Result<()> {
        if !self.visited.insert(instance.instance_id()) {
            return Ok(());
        }
        let meta = self.registry.get(&instance.entity())?;
        let targets = Self::cascade_targets(instance, &meta, CascadeOp::Refresh);
        self.loader().reload(instance)?;
        for target in targets {
            if self.ctx.status_of(&target) == EntityStatus::ManagedPersistent {
                self.refresh(&target)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // merge
    // ------------------------------------------------------------------

    /// Merge `instance` into the context, returning the managed instance
    /// that now carries its state.
    pub(crate) fn merge(&mut self, instance: &EntityRef) -> Result<EntityRef> {
        if let Some(copy) = self.merged.get(&instance.instance_id()) {
            return Ok(copy.clone());
        }
        let meta = self.registry.get(&instance.entity())?;
        let managed = match self.ctx.status_of(instance) {
            EntityStatus::ManagedNew | EntityStatus::ManagedPersistent => {
                self.merged
                    .insert(instance.instance_id(), instance.clone());
                instance.clone()
            }
            EntityStatus::Removed | EntityStatus::Deleted => {
                return Err(Error::lifecycle(
                    LifecycleErrorKind::Deleted,
                    &meta.name,
                    "cannot merge a removed instance",
                ));
            }
            EntityStatus::Transient => self.merge_as_new(instance, &meta)?,
            EntityStatus::Detached => {
                let Some(id) = instance.id() else {
                    return Err(Error::lifecycle(
                        LifecycleErrorKind::NotManaged,
                        &meta.name,
                        "detached instance lost its identifier",
                    ));
                };
                if self
                    .ctx
                    .lookup(&meta.name, &id)
                    .is_some_and(|entry| entry.status == EntityStatus::Removed)
                {
                    return Err(Error::lifecycle(
                        LifecycleErrorKind::Deleted,
                        &meta.name,
                        "the row of this detached instance is scheduled for delete",
                    ));
                }
                match self.loader().find(&meta.name, &id)? {
                    Some(current) => {
                        check_version(instance, &current, &meta, self.ctx)?;
                        self.merged
                            .insert(instance.instance_id(), current.clone());
                        copy_scalars(instance, &current, &meta);
                        current
                    }
                    None => self.merge_as_new(instance, &meta)?,
                }
            }
        };
        self.map_associations(instance, &managed, &meta)?;
        tracing::debug!(
            entity = %meta.name,
            source = %instance.instance_id(),
            managed = %managed.instance_id(),
            "Merged instance"
        );
        Ok(managed)
    }

    /// Persist a copy of an instance that has no managed counterpart.
    fn merge_as_new(&mut self, instance: &EntityRef, meta: &Arc<EntityMetadata>) -> Result<EntityRef> {
        let copy = EntityRef::new(&meta.name);
        if meta.id_generation == IdGeneration::Assigned {
            copy.set_id(instance.id());
        }
        self.merged.insert(instance.instance_id(), copy.clone());
        copy_scalars(instance, &copy, meta);
        self.assign_identifier(&copy, meta)?;
        self.ctx.mark_for_insert(&copy, Arc::clone(meta))?;
        Ok(copy)
    }

    /// Point the managed instance's associations at managed instances.
    fn map_associations(&mut self, source: &EntityRef, managed: &EntityRef, meta: &EntityMetadata) -> Result<()> {
        for assoc in &meta.associations {
            let target = match source.reference(&assoc.name) {
                Some(target) => Some(self.resolve(&target, assoc.cascade.merge)?),
                None => None,
            };
            managed.set_reference(assoc.name.clone(), target.as_ref());
        }
        for info in &meta.collections {
            let mut elements = Vec::new();
            for element in source.collection(&info.role) {
                elements.push(self.resolve(&element, info.cascade.merge)?);
            }
            managed.set_collection(info.role.clone(), elements);
        }
        Ok(())
    }

    /// The managed counterpart of an associated instance: merged when the
    /// association cascades merge, otherwise looked up by identifier.
    /// Unsaved targets are returned as-is and rejected at flush.
    fn resolve(&mut self, target: &EntityRef, cascade_merge: bool) -> Result<EntityRef> {
        if cascade_merge {
            return self.merge(target);
        }
        if self.ctx.contains(target) {
            return Ok(target.clone());
        }
        match target.id() {
            Some(id) => Ok(self
                .loader()
                .find(&target.entity(), &id)?
                .unwrap_or_else(|| target.clone())),
            None => Ok(target.clone()),
        }
    }
}

fn copy_scalars(source: &EntityRef, managed: &EntityRef, meta: &EntityMetadata) {
    for (name, value) in source.properties() {
        if meta.column_info(&name).is_some() {
            managed.set(name, value);
        }
    }
}

/// A detached versioned instance must carry the version currently stored.
fn check_version(
    detached: &EntityRef,
    managed: &EntityRef,
    meta: &EntityMetadata,
    ctx: &PersistenceContext,
) -> Result<()> {
    if !meta.is_versioned() {
        return Ok(());
    }
    let current = ctx
        .entry(managed.instance_id())
        .and_then(|e| e.version.clone());
    match (detached.version(), current) {
        (Some(theirs), Some(ours)) if !theirs.same_identity(&ours) => {
            tracing::warn!(
                entity = %meta.name,
                detached_version = %theirs,
                current_version = %ours,
                "Merge of stale detached instance"
            );
            Err(Error::StaleState(StaleStateError {
                entity: meta.name.clone(),
                id: managed.id(),
                table: meta.table.clone(),
                expected_rows: 1,
                actual_rows: 0,
            }))
        }
        _ => Ok(()),
    }
}
