//! Loading and hydration of persistent state.
//!
//! Rows become managed instances here. References are resolved by identifier
//! through the identity map first and the store second, and collections are
//! loaded eagerly. Each instance is registered before its associations are
//! resolved, so cyclic data terminates and every row maps to one instance.

use crate::context::PersistenceContext;
use crate::statistics::Statistics;
use std::sync::Arc;
use tessera_core::error::MappingError;
use tessera_core::{
    EntityMetadata, EntityRef, Error, LifecycleErrorKind, MappingErrorKind, MetadataRegistry, Result,
    Row, Store, Value,
};

pub(crate) struct Loader<'s, S: Store> {
    ctx: &'s mut PersistenceContext,
    registry: &'s MetadataRegistry,
    store: &'s mut S,
    stats: &'s mut Statistics,
}

impl<'s, S: Store> Loader<'s, S> {
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
        }
    }

    /// The managed instance for (entity, id), loading it if necessary.
    ///
    /// Instances scheduled for removal are not returned.
    pub(crate) fn find(&mut self, entity: &str, id: &Value) -> Result<Option<EntityRef>> {
        let meta = self.registry.get(entity)?;
        if let Some(entry) = self.ctx.lookup(entity, id) {
            return Ok(entry.status.is_managed().then(|| entry.instance.clone()));
        }
        match self.store.load_row(&meta, id)? {
            Some(row) => self.hydrate(&meta, &row).map(Some),
            None => Ok(None),
        }
    }

    /// Turn a row into a managed instance. A row whose identifier is already
    /// managed resolves to the existing instance unchanged.
    #[tracing::instrument(level = "trace", skip(self, meta, row), fields(entity = %meta.name))]
    pub(crate) fn hydrate(&mut self, meta: &Arc<EntityMetadata>, row: &Row) -> Result<EntityRef> {
        let id = row
            .get(&meta.id_column)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| {
                Error::Mapping(MappingError {
                    kind: MappingErrorKind::Identifier,
                    message: format!(
                        "row of {} has no value for identifier column '{}'",
                        meta.name, meta.id_column
                    ),
                })
            })?;
        if let Some(entry) = self.ctx.lookup(&meta.name, &id) {
            return Ok(entry.instance.clone());
        }

        let instance = EntityRef::new(&meta.name).with_id(id.clone());
        populate_scalars(&instance, meta, row);
        self.ctx.manage_loaded(&instance, Arc::clone(meta), id)?;
        self.stats.record_load(&meta.name);
        self.resolve_associations(&instance, meta, row)?;
        self.ctx.refresh_snapshots(instance.instance_id());
        tracing::trace!(instance = %instance.instance_id(), "Hydrated instance");
        Ok(instance)
    }

    /// Overwrite a managed instance's state from its current row.
    pub(crate) fn reload(&mut self, instance: &EntityRef) -> Result<()> {
        let Some(entry) = self.ctx.entry(instance.instance_id()) else {
            return Err(Error::lifecycle(
                LifecycleErrorKind::NotManaged,
                instance.entity(),
                "refresh requires a managed instance",
            ));
        };
        let meta = Arc::clone(&entry.metadata);
        let Some(id) = entry.id.clone().filter(|_| entry.exists_in_store) else {
            return Err(Error::lifecycle(
                LifecycleErrorKind::NotManaged,
                &meta.name,
                "instance has not been inserted yet",
            ));
        };
        let row = self
            .store
            .load_row(&meta, &id)?
            .ok_or_else(|| Error::NotFound {
                entity: meta.name.clone(),
                id: id.clone(),
            })?;
        populate_scalars(instance, &meta, &row);
        self.stats.record_load(&meta.name);
        self.resolve_associations(instance, &meta, &row)?;
        self.ctx.refresh_snapshots(instance.instance_id());
        Ok(())
    }

    fn resolve_associations(&mut self, instance: &EntityRef, meta: &EntityMetadata, row: &Row) -> Result<()> {
        for assoc in &meta.associations {
            let fk = row.get_or_null(&assoc.fk_column);
            let target = if fk.is_null() {
                None
            } else {
                let found = self.find(&assoc.target, &fk)?;
                if found.is_none() {
                    tracing::warn!(
                        entity = %meta.name,
                        association = %assoc.name,
                        target_id = %fk,
                        "Dangling foreign key"
                    );
                }
                found
            };
            instance.set_reference(assoc.name.clone(), target.as_ref());
        }
        let Some(owner_id) = instance.id() else {
            return Ok(());
        };
        for info in &meta.collections {
            let ids = self.store.load_collection(info, &owner_id)?;
            let mut elements = Vec::with_capacity(ids.len());
            for id in &ids {
                if let Some(element) = self.find(&info.element, id)? {
                    elements.push(element);
                }
            }
            instance.set_collection(info.role.clone(), elements);
        }
        Ok(())
    }
}

fn populate_scalars(instance: &EntityRef, meta: &EntityMetadata, row: &Row) {
    for column in &meta.columns {
        instance.set(column.name.clone(), row.get_or_null(&column.name));
    }
    if let Some(version) = &meta.version {
        instance.set_version(row.get(&version.column).cloned());
    }
}
