//! In-memory entity instances.
//!
//! An [`EntityRef`] is a shared handle to one domain object. Instance
//! identity is the handle's allocation: two handles are the same instance
//! exactly when they point at the same [`EntityData`]. Persistence contexts key
//! everything that must be "the same object" by [`InstanceId`], never by field
//! values.
//!
//! Handles are single-threaded (`Rc<RefCell<_>>`), matching the one-task
//! confinement of a unit of work. Every accessor borrows only for the duration
//! of the call, so handles can be freely passed around while traversing.
//!
//! Bidirectional graphs form reference cycles. Call
//! [`EntityRef::clear_associations`] on a graph that is being discarded.

use crate::value::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Identity of one in-memory instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(usize);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{:x}", self.0)
    }
}

/// State of one domain object.
#[derive(Debug, Default)]
pub struct EntityData {
    entity: String,
    id: Option<Value>,
    version: Option<Value>,
    properties: BTreeMap<String, Value>,
    references: BTreeMap<String, Option<EntityRef>>,
    collections: BTreeMap<String, Vec<EntityRef>>,
}

/// Shared handle to a domain object.
#[derive(Clone)]
pub struct EntityRef(Rc<RefCell<EntityData>>);

impl EntityRef {
    /// Create a transient instance of `entity`.
    pub fn new(entity: impl Into<String>) -> Self {
        Self(Rc::new(RefCell::new(EntityData {
            entity: entity.into(),
            ..EntityData::default()
        })))
    }

    /// Set a property (builder pattern).
    pub fn with(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(property, value);
        self
    }

    /// Set the identifier (builder pattern).
    pub fn with_id(self, id: impl Into<Value>) -> Self {
        self.set_id(Some(id.into()));
        self
    }

    pub fn instance_id(&self) -> InstanceId {
        InstanceId(Rc::as_ptr(&self.0) as usize)
    }

    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn entity(&self) -> String {
        self.0.borrow().entity.clone()
    }

    pub fn is_entity(&self, entity: &str) -> bool {
        self.0.borrow().entity == entity
    }

    pub fn id(&self) -> Option<Value> {
        self.0.borrow().id.clone()
    }

    pub fn set_id(&self, id: Option<Value>) {
        self.0.borrow_mut().id = id.filter(|v| !v.is_null());
    }

    pub fn version(&self) -> Option<Value> {
        self.0.borrow().version.clone()
    }

    pub fn set_version(&self, version: Option<Value>) {
        self.0.borrow_mut().version = version.filter(|v| !v.is_null());
    }

    /// Read a property. Unset properties read as NULL.
    pub fn get(&self, property: &str) -> Value {
        self.0
            .borrow()
            .properties
            .get(property)
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn set(&self, property: impl Into<String>, value: impl Into<Value>) {
        self.0
            .borrow_mut()
            .properties
            .insert(property.into(), value.into());
    }

    pub fn properties(&self) -> BTreeMap<String, Value> {
        self.0.borrow().properties.clone()
    }

    /// Target of a to-one association, if set.
    pub fn reference(&self, name: &str) -> Option<EntityRef> {
        self.0.borrow().references.get(name).cloned().flatten()
    }

    pub fn set_reference(&self, name: impl Into<String>, target: Option<&EntityRef>) {
        self.0
            .borrow_mut()
            .references
            .insert(name.into(), target.cloned());
    }

    /// Current elements of a collection. Unset collections read as empty.
    pub fn collection(&self, role: &str) -> Vec<EntityRef> {
        self.0
            .borrow()
            .collections
            .get(role)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_collection(&self, role: impl Into<String>, elements: Vec<EntityRef>) {
        self.0
            .borrow_mut()
            .collections
            .insert(role.into(), elements);
    }

    /// Append `element` unless it is already present.
    ///
    /// This touches only this side of the association; the session's
    /// collection operations also maintain the element's back reference.
    pub fn add_to(&self, role: &str, element: &EntityRef) -> bool {
        let mut data = self.0.borrow_mut();
        let elements = data.collections.entry(role.to_string()).or_default();
        if elements.iter().any(|e| e.ptr_eq(element)) {
            return false;
        }
        elements.push(element.clone());
        true
    }

    /// Remove `element`, returning whether it was present.
    pub fn remove_from(&self, role: &str, element: &EntityRef) -> bool {
        let mut data = self.0.borrow_mut();
        let Some(elements) = data.collections.get_mut(role) else {
            return false;
        };
        let before = elements.len();
        elements.retain(|e| !e.ptr_eq(element));
        elements.len() != before
    }

    pub fn contains(&self, role: &str, element: &EntityRef) -> bool {
        self.0
            .borrow()
            .collections
            .get(role)
            .is_some_and(|elements| elements.iter().any(|e| e.ptr_eq(element)))
    }

    /// Drop all references and collections held by this instance.
    pub fn clear_associations(&self) {
        let mut data = self.0.borrow_mut();
        data.references.clear();
        data.collections.clear();
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.instance_id().hash(state);
    }
}

impl fmt::Debug for EntityRef {
    // Associations are omitted: graphs are usually cyclic.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.0.borrow();
        f.debug_struct("EntityRef")
            .field("entity", &data.entity)
            .field("id", &data.id)
            .field("version", &data.version)
            .field("instance", &self.instance_id())
            .finish()
    }
}
