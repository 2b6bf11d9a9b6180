//! The persistence context: one unit of work's managed state.
//!
//! A [`PersistenceContext`] owns one [`EntityEntry`] per managed instance and
//! one [`CollectionEntry`] per managed collection, plus the [`IdentityMap`]
//! that guarantees at most one instance per (entity, identifier). It is
//! strictly scoped to one session and is dropped or cleared on rollback.
//!
//! Entries keep their instance handles alive, so an [`InstanceId`] is never
//! reused for a different instance while its entry, or its tombstone after a
//! flushed delete, is still held.

use crate::change_tracker::{CollectionSnapshot, EntitySnapshot};
use crate::identity_map::IdentityMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tessera_core::{
    CollectionInfo, EntityMetadata, EntityRef, Error, IdGeneration, InstanceId, LifecycleErrorKind,
    Result, Value,
};

/// Lifecycle status of an instance relative to one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EntityStatus {
    /// Not tracked and never persisted.
    Transient,
    /// Scheduled for insert at the next flush.
    ManagedNew,
    /// The row is known to exist in the store.
    ManagedPersistent,
    /// Scheduled for delete at the next flush.
    Removed,
    /// Delete flushed; the instance left the context.
    Deleted,
    /// Carries an identifier but is not tracked by this context.
    Detached,
}

impl EntityStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityStatus::Transient => "transient",
            EntityStatus::ManagedNew => "managed(new)",
            EntityStatus::ManagedPersistent => "managed(persistent)",
            EntityStatus::Removed => "removed",
            EntityStatus::Deleted => "deleted",
            EntityStatus::Detached => "detached",
        }
    }

    /// Whether the context tracks changes to the instance.
    pub const fn is_managed(self) -> bool {
        matches!(self, EntityStatus::ManagedNew | EntityStatus::ManagedPersistent)
    }
}

/// Managed state of one instance.
#[derive(Debug)]
pub struct EntityEntry {
    pub instance: EntityRef,
    pub metadata: Arc<EntityMetadata>,
    /// Identifier the entry is registered under, once known
    pub id: Option<Value>,
    pub status: EntityStatus,
    /// Last-known persistent state; `None` until the row exists
    pub snapshot: Option<EntitySnapshot>,
    /// Version last read from or written to the store
    pub version: Option<Value>,
    pub exists_in_store: bool,
    sequence: u64,
}

impl EntityEntry {
    pub fn entity(&self) -> &str {
        &self.metadata.name
    }

    /// Position in the order instances became managed.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Key of one collection entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionKey {
    pub owner: InstanceId,
    pub role: String,
}

impl CollectionKey {
    pub fn new(owner: InstanceId, role: impl Into<String>) -> Self {
        Self {
            owner,
            role: role.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CollectionStatus {
    /// Attached to a new owner; nothing persisted yet.
    New,
    /// Membership was loaded or flushed.
    Loaded,
    /// The owner is removed; the collection flushes as emptied.
    Dereferenced,
}

/// Managed state of one collection.
#[derive(Debug)]
pub struct CollectionEntry {
    /// Owner instance; resolved through the owner's entity entry
    pub owner: InstanceId,
    pub info: CollectionInfo,
    pub snapshot: Option<CollectionSnapshot>,
    pub status: CollectionStatus,
    /// Removed elements are candidates for orphan deletion
    pub orphan_removal: bool,
}

/// Per-status entry counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub new: usize,
    pub persistent: usize,
    pub removed: usize,
    pub deleted: usize,
    pub collections: usize,
}

/// The unit of work.
#[derive(Debug, Default)]
pub struct PersistenceContext {
    entries: HashMap<InstanceId, EntityEntry>,
    identity: IdentityMap,
    collections: HashMap<CollectionKey, CollectionEntry>,
    tombstones: HashMap<InstanceId, EntityRef>,
    next_sequence: u64,
    tainted: bool,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// Manage a transient instance as `managed(new)`.
    ///
    /// Registers the identifier if the instance already carries one and
    /// attaches an unsnapshotted entry for each collection role.
    #[tracing::instrument(level = "trace", skip(self, instance, metadata), fields(entity = %metadata.name))]
    pub fn mark_for_insert(&mut self, instance: &EntityRef, metadata: Arc<EntityMetadata>) -> Result<()> {
        let id = instance.id();
        if let Some(id) = &id {
            self.identity
                .insert(&metadata.name, id, instance.instance_id())?;
        }
        for info in &metadata.collections {
            self.attach_collection(instance.instance_id(), info, None);
        }
        let entry = EntityEntry {
            instance: instance.clone(),
            id,
            status: EntityStatus::ManagedNew,
            snapshot: None,
            version: instance.version(),
            exists_in_store: false,
            sequence: self.bump_sequence(),
            metadata,
        };
        self.tombstones.remove(&instance.instance_id());
        self.entries.insert(instance.instance_id(), entry);
        Ok(())
    }

    /// Manage an instance whose row exists, snapshotting its current state
    /// and the membership of its collections.
    #[tracing::instrument(level = "trace", skip(self, instance, metadata), fields(entity = %metadata.name))]
    pub fn manage_loaded(
        &mut self,
        instance: &EntityRef,
        metadata: Arc<EntityMetadata>,
        id: Value,
    ) -> Result<()> {
        self.identity
            .insert(&metadata.name, &id, instance.instance_id())?;
        for info in &metadata.collections {
            let snapshot = CollectionSnapshot::capture(&instance.collection(&info.role));
            self.attach_collection(instance.instance_id(), info, Some(snapshot));
        }
        let existing = self.entries.get(&instance.instance_id()).map(|e| e.sequence);
        let sequence = match existing {
            Some(sequence) => sequence,
            None => self.bump_sequence(),
        };
        let entry = EntityEntry {
            instance: instance.clone(),
            snapshot: Some(EntitySnapshot::capture(instance, &metadata)),
            id: Some(id),
            status: EntityStatus::ManagedPersistent,
            version: instance.version(),
            exists_in_store: true,
            sequence,
            metadata,
        };
        self.entries.insert(instance.instance_id(), entry);
        Ok(())
    }

    /// Register an identifier assigned after the instance became managed.
    pub fn register_id(&mut self, instance: InstanceId, id: Value) -> Result<()> {
        let Some(entry) = self.entries.get_mut(&instance) else {
            return Ok(());
        };
        self.identity.insert(&entry.metadata.name, &id, instance)?;
        entry.instance.set_id(Some(id.clone()));
        entry.id = Some(id);
        Ok(())
    }

    /// Take fresh snapshots of a persistent instance and its collections.
    pub fn refresh_snapshots(&mut self, instance: InstanceId) {
        let Some(entry) = self.entries.get_mut(&instance) else {
            return;
        };
        entry.snapshot = Some(EntitySnapshot::capture(&entry.instance, &entry.metadata));
        entry.version = entry.instance.version();
        let owner = entry.instance.clone();
        for (key, collection) in &mut self.collections {
            if key.owner == instance {
                collection.snapshot = Some(CollectionSnapshot::capture(&owner.collection(&key.role)));
                collection.status = CollectionStatus::Loaded;
            }
        }
    }

    pub fn lookup(&self, entity: &str, id: &Value) -> Option<&EntityEntry> {
        self.identity
            .get(entity, id)
            .and_then(|instance| self.entries.get(&instance))
    }

    pub fn entry(&self, instance: InstanceId) -> Option<&EntityEntry> {
        self.entries.get(&instance)
    }

    pub fn entry_mut(&mut self, instance: InstanceId) -> Option<&mut EntityEntry> {
        self.entries.get_mut(&instance)
    }

    /// Schedule a delete.
    ///
    /// A `managed(new)` instance never reached the store and is evicted
    /// instead; a generated identifier it was given is taken back so the
    /// instance is transient again. Returns the resulting status, or `None`
    /// if not managed.
    pub fn mark_for_delete(&mut self, instance: InstanceId) -> Option<EntityStatus> {
        let status = self.entries.get(&instance)?.status;
        match status {
            EntityStatus::ManagedNew => {
                if let Some(entry) = self.evict(instance) {
                    if entry.metadata.id_generation != IdGeneration::Assigned {
                        entry.instance.set_id(None);
                    }
                }
                Some(EntityStatus::Transient)
            }
            EntityStatus::ManagedPersistent | EntityStatus::Removed => {
                if let Some(entry) = self.entries.get_mut(&instance) {
                    entry.status = EntityStatus::Removed;
                }
                self.set_collection_status(instance, CollectionStatus::Dereferenced);
                Some(EntityStatus::Removed)
            }
            other => Some(other),
        }
    }

    /// Return a removed instance to `managed(persistent)`.
    pub fn unschedule_delete(&mut self, instance: InstanceId) {
        if let Some(entry) = self.entries.get_mut(&instance) {
            if entry.status == EntityStatus::Removed {
                entry.status = EntityStatus::ManagedPersistent;
                self.set_collection_status(instance, CollectionStatus::Loaded);
            }
        }
    }

    /// Drop the entry and its collections. The instance becomes detached.
    pub fn evict(&mut self, instance: InstanceId) -> Option<EntityEntry> {
        let entry = self.entries.remove(&instance)?;
        if let Some(id) = &entry.id {
            self.identity.remove(&entry.metadata.name, id);
        }
        self.collections.retain(|key, _| key.owner != instance);
        Some(entry)
    }

    /// Record a flushed delete: the entry leaves the context and a
    /// tombstone remains.
    pub fn mark_deleted(&mut self, instance: InstanceId) {
        if let Some(entry) = self.evict(instance) {
            self.tombstones.insert(instance, entry.instance);
        }
    }

    pub fn status_of(&self, instance: &EntityRef) -> EntityStatus {
        let id = instance.instance_id();
        if let Some(entry) = self.entries.get(&id) {
            entry.status
        } else if self.tombstones.contains_key(&id) {
            EntityStatus::Deleted
        } else if instance.id().is_some() {
            EntityStatus::Detached
        } else {
            EntityStatus::Transient
        }
    }

    pub fn contains(&self, instance: &EntityRef) -> bool {
        self.entries.contains_key(&instance.instance_id())
    }

    /// All entries in the order they became managed.
    pub fn entries_in_order(&self) -> Vec<&EntityEntry> {
        let mut entries: Vec<&EntityEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.sequence);
        entries
    }

    /// Managed instances in the order they became managed.
    pub fn instances_in_order(&self) -> Vec<EntityRef> {
        self.entries_in_order()
            .into_iter()
            .map(|e| e.instance.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------

    /// Attach a collection entry unless one already exists for the role.
    pub fn attach_collection(
        &mut self,
        owner: InstanceId,
        info: &CollectionInfo,
        snapshot: Option<CollectionSnapshot>,
    ) {
        let status = if snapshot.is_some() {
            CollectionStatus::Loaded
        } else {
            CollectionStatus::New
        };
        self.collections
            .entry(CollectionKey::new(owner, info.role.clone()))
            .or_insert_with(|| CollectionEntry {
                owner,
                info: info.clone(),
                snapshot,
                status,
                orphan_removal: info.orphan_removal,
            });
    }

    pub fn collection_entry(&self, owner: InstanceId, role: &str) -> Option<&CollectionEntry> {
        self.collections.get(&CollectionKey::new(owner, role))
    }

    /// Collection keys ordered by owner sequence, then role.
    pub fn collection_keys(&self) -> Vec<CollectionKey> {
        let mut keys: Vec<CollectionKey> = self.collections.keys().cloned().collect();
        keys.sort_by(|a, b| {
            let seq = |k: &CollectionKey| self.entries.get(&k.owner).map_or(u64::MAX, |e| e.sequence);
            seq(a).cmp(&seq(b)).then_with(|| a.role.cmp(&b.role))
        });
        keys
    }

    /// Replace the snapshot of every collection whose owner is still managed.
    pub fn refresh_collection_snapshots(&mut self) {
        for (key, collection) in &mut self.collections {
            let Some(owner) = self.entries.get(&key.owner) else {
                continue;
            };
            if owner.status.is_managed() {
                collection.snapshot = Some(CollectionSnapshot::capture(&owner.instance.collection(&key.role)));
                collection.status = CollectionStatus::Loaded;
            }
        }
    }

    fn set_collection_status(&mut self, owner: InstanceId, status: CollectionStatus) {
        for (key, entry) in &mut self.collections {
            if key.owner == owner {
                entry.status = status;
            }
        }
    }

    // ------------------------------------------------------------------
    // Whole context
    // ------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts {
            deleted: self.tombstones.len(),
            collections: self.collections.len(),
            ..StatusCounts::default()
        };
        for entry in self.entries.values() {
            match entry.status {
                EntityStatus::ManagedNew => counts.new += 1,
                EntityStatus::ManagedPersistent => counts.persistent += 1,
                EntityStatus::Removed => counts.removed += 1,
                _ => {}
            }
        }
        counts
    }

    /// Mark the context unusable after a failed flush execution.
    pub fn taint(&mut self) {
        self.tainted = true;
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    /// Fail with `Lifecycle(Tainted)` once a flush has failed mid-execution.
    pub fn ensure_usable(&self) -> Result<()> {
        if self.tainted {
            return Err(Error::lifecycle(
                LifecycleErrorKind::Tainted,
                "session",
                "a previous flush failed; roll back or clear the session",
            ));
        }
        Ok(())
    }

    /// Drop every entry, collection, tombstone and the taint flag.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.identity.clear();
        self.collections.clear();
        self.tombstones.clear();
        self.tainted = false;
    }

    fn bump_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::ColumnInfo;

    fn contract_meta() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::new("Contract", "contract")
                .column(ColumnInfo::new("customer_name"))
                .collection(CollectionInfo::one_to_many("parties", "Party", "contract_id")),
        )
    }

    #[test]
    fn lifecycle_statuses() {
        let mut ctx = PersistenceContext::new();
        let meta = contract_meta();
        let fresh = EntityRef::new("Contract");
        assert_eq!(ctx.status_of(&fresh), EntityStatus::Transient);

        ctx.mark_for_insert(&fresh, Arc::clone(&meta)).unwrap();
        assert_eq!(ctx.status_of(&fresh), EntityStatus::ManagedNew);
        assert!(ctx.collection_entry(fresh.instance_id(), "parties").is_some());

        let loaded = EntityRef::new("Contract").with_id(1_i64);
        ctx.manage_loaded(&loaded, Arc::clone(&meta), Value::BigInt(1))
            .unwrap();
        assert_eq!(ctx.status_of(&loaded), EntityStatus::ManagedPersistent);
        assert!(ctx.entry(loaded.instance_id()).unwrap().snapshot.is_some());

        assert_eq!(
            ctx.mark_for_delete(loaded.instance_id()),
            Some(EntityStatus::Removed)
        );
        assert_eq!(
            ctx.collection_entry(loaded.instance_id(), "parties")
                .unwrap()
                .status,
            CollectionStatus::Dereferenced
        );
        ctx.unschedule_delete(loaded.instance_id());
        assert_eq!(ctx.status_of(&loaded), EntityStatus::ManagedPersistent);

        ctx.mark_for_delete(loaded.instance_id());
        ctx.mark_deleted(loaded.instance_id());
        assert_eq!(ctx.status_of(&loaded), EntityStatus::Deleted);
        assert!(ctx.lookup("Contract", &Value::BigInt(1)).is_none());
    }

    #[test]
    fn removing_new_instance_evicts() {
        let mut ctx = PersistenceContext::new();
        let fresh = EntityRef::new("Contract");
        ctx.mark_for_insert(&fresh, contract_meta()).unwrap();
        assert_eq!(
            ctx.mark_for_delete(fresh.instance_id()),
            Some(EntityStatus::Transient)
        );
        assert!(!ctx.contains(&fresh));
        assert!(ctx.collection_entry(fresh.instance_id(), "parties").is_none());
    }

    #[test]
    fn identity_conflict_on_second_instance() {
        let mut ctx = PersistenceContext::new();
        let a = EntityRef::new("Contract").with_id(1_i64);
        let b = EntityRef::new("Contract").with_id(1_i64);
        ctx.manage_loaded(&a, contract_meta(), Value::BigInt(1)).unwrap();
        let err = ctx.mark_for_insert(&b, contract_meta()).unwrap_err();
        assert!(matches!(err, Error::IdentityConflict(_)));
        assert!(!ctx.contains(&b));
        assert!(
            ctx.lookup("Contract", &Value::BigInt(1))
                .is_some_and(|e| e.instance.ptr_eq(&a))
        );
    }

    #[test]
    fn evicted_instance_is_detached() {
        let mut ctx = PersistenceContext::new();
        let a = EntityRef::new("Contract").with_id(1_i64);
        ctx.manage_loaded(&a, contract_meta(), Value::BigInt(1)).unwrap();
        assert!(ctx.evict(a.instance_id()).is_some());
        assert_eq!(ctx.status_of(&a), EntityStatus::Detached);
        assert!(ctx.is_empty());
    }

    #[test]
    fn register_id_after_insert() {
        let mut ctx = PersistenceContext::new();
        let a = EntityRef::new("Contract");
        ctx.mark_for_insert(&a, contract_meta()).unwrap();
        ctx.register_id(a.instance_id(), Value::BigInt(10)).unwrap();
        assert_eq!(a.id(), Some(Value::BigInt(10)));
        assert!(ctx.lookup("Contract", &Value::Int(10)).is_some());
    }

    #[test]
    fn entries_keep_management_order() {
        let mut ctx = PersistenceContext::new();
        let instances: Vec<EntityRef> = (0..5).map(|_| EntityRef::new("Contract")).collect();
        for instance in &instances {
            ctx.mark_for_insert(instance, contract_meta()).unwrap();
        }
        assert_eq!(ctx.instances_in_order(), instances);
        assert_eq!(ctx.counts().new, 5);
    }

    #[test]
    fn clear_resets_taint() {
        let mut ctx = PersistenceContext::new();
        ctx.taint();
        assert!(ctx.is_tainted());
        ctx.clear();
        assert!(!ctx.is_tainted());
    }
}
