//! Identity Map pattern for tracking unique instances per (entity, identifier).
//!
//! The Identity Map ensures that each stored row corresponds to exactly one
//! in-memory instance within a persistence context:
//!
//! - **Uniqueness**: the same (entity, id) always resolves to the same instance
//! - **Cache**: avoids redundant loads of the same row
//! - **Termination**: cyclic data hydrates to a finite graph
//!
//! # Design
//!
//! Identifiers are dynamic [`Value`]s, so keys hash them with
//! [`Value::hash_identity`] and buckets compare with
//! [`Value::same_identity`]. An `Int(3)` read back from one query and a
//! `BigInt(3)` assigned by the application name the same row.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hasher};
use tessera_core::error::IdentityConflictError;
use tessera_core::{Error, InstanceId, Result, Value};

/// Hashed key of one identity-map bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    entity: String,
    id_hash: u64,
}

impl EntityKey {
    pub fn new(entity: &str, id: &Value) -> Self {
        let mut hasher = DefaultHasher::new();
        id.hash_identity(&mut hasher);
        Self {
            entity: entity.to_string(),
            id_hash: hasher.finish(),
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }
}

/// Map from (entity, identifier) to the managed instance.
#[derive(Debug, Default)]
pub struct IdentityMap {
    buckets: HashMap<EntityKey, Vec<(Value, InstanceId)>>,
    len: usize,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `instance` under (entity, id).
    ///
    /// Re-registering the same instance is a no-op. A different instance
    /// under the same key fails with [`Error::IdentityConflict`] and leaves
    /// the map unchanged.
    pub fn insert(&mut self, entity: &str, id: &Value, instance: InstanceId) -> Result<()> {
        let bucket = self.buckets.entry(EntityKey::new(entity, id)).or_default();
        match bucket.iter().find(|(existing, _)| existing.same_identity(id)) {
            Some((_, owner)) if *owner == instance => Ok(()),
            Some(_) => Err(Error::IdentityConflict(IdentityConflictError {
                entity: entity.to_string(),
                id: id.clone(),
            })),
            None => {
                bucket.push((id.clone(), instance));
                self.len += 1;
                Ok(())
            }
        }
    }

    pub fn get(&self, entity: &str, id: &Value) -> Option<InstanceId> {
        self.buckets
            .get(&EntityKey::new(entity, id))?
            .iter()
            .find(|(existing, _)| existing.same_identity(id))
            .map(|(_, instance)| *instance)
    }

    pub fn contains(&self, entity: &str, id: &Value) -> bool {
        self.get(entity, id).is_some()
    }

    /// Remove the mapping for (entity, id), returning the instance it held.
    pub fn remove(&mut self, entity: &str, id: &Value) -> Option<InstanceId> {
        let key = EntityKey::new(entity, id);
        let bucket = self.buckets.get_mut(&key)?;
        let position = bucket
            .iter()
            .position(|(existing, _)| existing.same_identity(id))?;
        let (_, instance) = bucket.swap_remove(position);
        if bucket.is_empty() {
            self.buckets.remove(&key);
        }
        self.len -= 1;
        Some(instance)
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
