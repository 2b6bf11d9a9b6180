//! Snapshot-based change tracking.
//!
//! Every managed entity carries an [`EntitySnapshot`] of its last-known
//! persistent state and every managed collection a [`CollectionSnapshot`] of
//! its last-known membership. Dirty checking diffs the live instance against
//! the snapshot at flush; no per-field hooks are involved.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tessera_core::{EntityMetadata, EntityRef, InstanceId, MetadataRegistry, Value};

/// The target of a to-one association as last persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ReferenceSnapshot {
    #[serde(skip)]
    pub instance: InstanceId,
    pub entity: String,
    pub id: Option<Value>,
}

impl ReferenceSnapshot {
    pub fn of(target: &EntityRef) -> Self {
        Self {
            instance: target.instance_id(),
            entity: target.entity(),
            id: target.id(),
        }
    }

    /// Whether `target` is the row this snapshot points at.
    ///
    /// Identifiers win when both sides have one, so a re-loaded instance of
    /// the same row is not a change.
    pub fn same_target(&self, target: &EntityRef) -> bool {
        match (&self.id, target.id()) {
            (Some(a), Some(b)) => self.entity == target.entity() && a.same_identity(&b),
            _ => self.instance == target.instance_id(),
        }
    }
}

/// Last-known persistent state of one entity.
#[derive(Debug, Clone, Serialize)]
pub struct EntitySnapshot {
    properties: BTreeMap<String, Value>,
    references: BTreeMap<String, Option<ReferenceSnapshot>>,
    version: Option<Value>,
    #[serde(skip)]
    taken_at: Instant,
}

impl EntitySnapshot {
    /// Copy the mapped state of `instance`.
    #[tracing::instrument(level = "trace", skip(instance, meta), fields(entity = %meta.name))]
    pub fn capture(instance: &EntityRef, meta: &EntityMetadata) -> Self {
        let properties: BTreeMap<String, Value> = meta
            .columns
            .iter()
            .map(|c| (c.name.clone(), instance.get(&c.name)))
            .collect();
        let references = meta
            .associations
            .iter()
            .map(|a| {
                (
                    a.name.clone(),
                    instance.reference(&a.name).map(|t| ReferenceSnapshot::of(&t)),
                )
            })
            .collect();
        tracing::trace!(
            instance = %instance.instance_id(),
            properties = properties.len(),
            "Taking entity snapshot"
        );
        Self {
            properties,
            references,
            version: instance.version(),
            taken_at: Instant::now(),
        }
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn reference(&self, name: &str) -> Option<&ReferenceSnapshot> {
        self.references.get(name).and_then(Option::as_ref)
    }

    pub fn references(&self) -> impl Iterator<Item = (&str, &ReferenceSnapshot)> {
        self.references
            .iter()
            .filter_map(|(name, target)| target.as_ref().map(|t| (name.as_str(), t)))
    }

    pub fn version(&self) -> Option<&Value> {
        self.version.as_ref()
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// One column whose current value differs from the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnChange {
    pub column: String,
    /// The to-one association writing this column, for foreign keys
    pub association: Option<String>,
    /// Whether this change increments the entity version
    pub optimistic_lock: bool,
}

/// Columns of `instance` that differ from `snapshot`.
///
/// Non-updatable columns are ignored. Foreign keys owned by a collection are
/// written by that collection, so changes to the matching to-one reference
/// are ignored too.
#[tracing::instrument(level = "trace", skip_all, fields(entity = %meta.name))]
pub fn dirty_columns(
    instance: &EntityRef,
    meta: &EntityMetadata,
    snapshot: &EntitySnapshot,
    registry: &MetadataRegistry,
) -> Vec<ColumnChange> {
    let mut changes = Vec::new();
    for column in meta.columns.iter().filter(|c| c.updatable && !c.generated) {
        let current = instance.get(&column.name);
        let unchanged = snapshot
            .property(&column.name)
            .is_some_and(|old| old.same_identity(&current));
        if !unchanged {
            changes.push(ColumnChange {
                column: column.name.clone(),
                association: None,
                optimistic_lock: column.optimistic_lock,
            });
        }
    }
    for assoc in &meta.associations {
        if registry
            .owning_collection_for(&meta.name, &assoc.fk_column)
            .is_some()
        {
            continue;
        }
        let changed = match (snapshot.reference(&assoc.name), instance.reference(&assoc.name)) {
            (None, None) => false,
            (Some(old), Some(new)) => !old.same_target(&new),
            _ => true,
        };
        if changed {
            changes.push(ColumnChange {
                column: assoc.fk_column.clone(),
                association: Some(assoc.name.clone()),
                optimistic_lock: true,
            });
        }
    }
    tracing::trace!(changed = changes.len(), "Dirty check result");
    changes
}

/// One element of a collection as last persisted.
#[derive(Debug, Clone)]
pub struct ElementSnapshot {
    pub instance: EntityRef,
    pub id: Option<Value>,
}

impl ElementSnapshot {
    fn matches(&self, element: &EntityRef) -> bool {
        if self.instance.ptr_eq(element) {
            return true;
        }
        match (&self.id, element.id()) {
            (Some(a), Some(b)) => self.instance.is_entity(&element.entity()) && a.same_identity(&b),
            _ => false,
        }
    }
}

/// Last-known membership of one collection.
#[derive(Debug, Clone)]
pub struct CollectionSnapshot {
    elements: Vec<ElementSnapshot>,
    taken_at: Instant,
}

impl CollectionSnapshot {
    pub fn capture(elements: &[EntityRef]) -> Self {
        Self {
            elements: elements
                .iter()
                .map(|e| ElementSnapshot {
                    instance: e.clone(),
                    id: e.id(),
                })
                .collect(),
            taken_at: Instant::now(),
        }
    }

    pub fn empty() -> Self {
        Self::capture(&[])
    }

    pub fn elements(&self) -> &[ElementSnapshot] {
        &self.elements
    }

    pub fn ids(&self) -> Vec<Value> {
        self.elements.iter().filter_map(|e| e.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn contains(&self, element: &EntityRef) -> bool {
        self.elements.iter().any(|e| e.matches(element))
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

/// Membership change of one collection.
#[derive(Debug, Clone, Default)]
pub struct CollectionDiff {
    pub added: Vec<EntityRef>,
    pub removed: Vec<EntityRef>,
}

impl CollectionDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Symmetric difference between a collection snapshot and its current
/// elements. A missing snapshot means the collection is new.
pub fn diff_collection(snapshot: Option<&CollectionSnapshot>, current: &[EntityRef]) -> CollectionDiff {
    let Some(snapshot) = snapshot else {
        return CollectionDiff {
            added: current.to_vec(),
            removed: Vec::new(),
        };
    };
    let added = current
        .iter()
        .filter(|e| !snapshot.contains(e))
        .cloned()
        .collect();
    let removed = snapshot
        .elements
        .iter()
        .filter(|old| !current.iter().any(|e| old.matches(e)))
        .map(|old| old.instance.clone())
        .collect();
    CollectionDiff { added, removed }
}
