//! Collection semantics.
//!
//! Decides, per collection role, which side of an association writes the
//! foreign key and how membership changes map to row operations:
//!
//! | role                     | element added           | element removed           |
//! |--------------------------|-------------------------|---------------------------|
//! | one-to-many, owning      | `SET fk = owner`        | `SET fk = NULL`           |
//! | many-to-many, owning     | insert link row         | delete link row           |
//! | inverse (either kind)    | nothing                 | nothing                   |
//!
//! Bidirectional roles also keep the element's back reference in step with
//! membership when elements are added or removed through the owner. That is a
//! state change on the element, never a mutation; dirty checking picks it up.

use crate::change_tracker::CollectionDiff;
use crate::executor::{Param, PlannedMutation};
use tessera_core::{
    Binding, CollectionInfo, CollectionKind, EntityMetadata, EntityRef, MutationDescriptor,
    MutationKind, MutationTarget, Value,
};

/// One row operation produced by a membership change.
#[derive(Debug, Clone)]
pub enum CollectionRowOp {
    /// Point the element's foreign key at the owner.
    SetForeignKey(EntityRef),
    /// Clear the element's foreign key.
    ClearForeignKey(EntityRef),
    /// Insert a link-table row.
    InsertLink(EntityRef),
    /// Delete a link-table row.
    DeleteLink(EntityRef),
}

impl CollectionRowOp {
    pub fn element(&self) -> &EntityRef {
        match self {
            CollectionRowOp::SetForeignKey(e)
            | CollectionRowOp::ClearForeignKey(e)
            | CollectionRowOp::InsertLink(e)
            | CollectionRowOp::DeleteLink(e) => e,
        }
    }

    /// Statement kind, which places the operation in the flush phases.
    pub fn kind(&self) -> MutationKind {
        match self {
            CollectionRowOp::SetForeignKey(_) | CollectionRowOp::ClearForeignKey(_) => {
                MutationKind::Update
            }
            CollectionRowOp::InsertLink(_) => MutationKind::Insert,
            CollectionRowOp::DeleteLink(_) => MutationKind::Delete,
        }
    }
}

/// Semantics of one collection role.
#[derive(Debug, Clone, Copy)]
pub struct CollectionSemantics<'a> {
    info: &'a CollectionInfo,
}

impl<'a> CollectionSemantics<'a> {
    pub fn new(info: &'a CollectionInfo) -> Self {
        Self { info }
    }

    pub fn info(&self) -> &'a CollectionInfo {
        self.info
    }

    pub fn is_bidirectional(&self) -> bool {
        self.info.back_reference.is_some()
    }

    pub fn orphan_removal(&self) -> bool {
        self.info.orphan_removal
    }

    /// Whether this role writes the element table's foreign-key column.
    pub fn owns_foreign_key(&self) -> bool {
        !self.info.inverse && matches!(self.info.kind, CollectionKind::OneToMany { .. })
    }

    /// Whether membership changes of this role write any rows.
    pub fn writes_rows(&self) -> bool {
        !self.info.inverse
    }

    /// Row operations for a membership change. Inverse roles produce none.
    pub fn row_operations(&self, diff: &CollectionDiff) -> Vec<CollectionRowOp> {
        if !self.writes_rows() {
            return Vec::new();
        }
        let (add, remove): (fn(EntityRef) -> CollectionRowOp, fn(EntityRef) -> CollectionRowOp) =
            match self.info.kind {
                CollectionKind::OneToMany { .. } => {
                    (CollectionRowOp::SetForeignKey, CollectionRowOp::ClearForeignKey)
                }
                CollectionKind::ManyToMany { .. } => {
                    (CollectionRowOp::InsertLink, CollectionRowOp::DeleteLink)
                }
            };
        diff.removed
            .iter()
            .cloned()
            .map(remove)
            .chain(diff.added.iter().cloned().map(add))
            .collect()
    }

    /// Build the mutation for `op`. `element` is the element entity's mapping.
    ///
    /// Returns `None` when `op` does not apply to this role's kind.
    pub fn plan(
        &self,
        op: &CollectionRowOp,
        owner: &EntityRef,
        element: &EntityMetadata,
    ) -> Option<PlannedMutation> {
        let target = MutationTarget::Collection(self.info.qualified_role());
        let planned = match (&self.info.kind, op) {
            (CollectionKind::OneToMany { fk_column }, CollectionRowOp::SetForeignKey(e)) => {
                PlannedMutation::new(
                    MutationDescriptor::update(&element.table, target)
                        .set(fk_column, Binding::Parameter)
                        .key(&element.id_column, Binding::Parameter),
                    vec![Param::id_of(owner), Param::id_of(e)],
                )
                .subject(e)
            }
            (CollectionKind::OneToMany { fk_column }, CollectionRowOp::ClearForeignKey(e)) => {
                // Guarded by the old owner; a row already re-pointed elsewhere
                // matches nothing.
                PlannedMutation::new(
                    MutationDescriptor::update(&element.table, target)
                        .set(fk_column, Binding::Literal(Value::Null))
                        .key(&element.id_column, Binding::Parameter)
                        .key(fk_column, Binding::Parameter)
                        .expect_rows(None),
                    vec![Param::id_of(e), Param::id_of(owner)],
                )
                .subject(e)
            }
            (
                CollectionKind::ManyToMany {
                    table,
                    owner_column,
                    element_column,
                },
                CollectionRowOp::InsertLink(e),
            ) => PlannedMutation::new(
                MutationDescriptor::insert(table, target)
                    .set(owner_column, Binding::Parameter)
                    .set(element_column, Binding::Parameter),
                vec![Param::id_of(owner), Param::id_of(e)],
            ),
            (
                CollectionKind::ManyToMany {
                    table,
                    owner_column,
                    element_column,
                },
                CollectionRowOp::DeleteLink(e),
            ) => PlannedMutation::new(
                MutationDescriptor::delete(table, target)
                    .key(owner_column, Binding::Parameter)
                    .key(element_column, Binding::Parameter),
                vec![Param::id_of(owner), Param::id_of(e)],
            ),
            _ => return None,
        };
        Some(planned)
    }

    /// Add `element` to the owner's collection, keeping the back reference
    /// in step. Returns whether membership changed.
    pub fn add(&self, owner: &EntityRef, element: &EntityRef) -> bool {
        let added = owner.add_to(&self.info.role, element);
        if let Some(back) = &self.info.back_reference {
            let current = element.reference(back);
            if let (Some(previous), CollectionKind::OneToMany { .. }) = (&current, &self.info.kind) {
                if !previous.ptr_eq(owner) {
                    // A one-to-many element has a single owner.
                    previous.remove_from(&self.info.role, element);
                }
            }
            if !current.is_some_and(|c| c.ptr_eq(owner)) {
                element.set_reference(back.clone(), Some(owner));
            }
        }
        added
    }

    /// Remove `element` from the owner's collection, clearing the back
    /// reference if it still points at this owner.
    pub fn remove(&self, owner: &EntityRef, element: &EntityRef) -> bool {
        let removed = owner.remove_from(&self.info.role, element);
        if let Some(back) = &self.info.back_reference {
            if element.reference(back).is_some_and(|c| c.ptr_eq(owner)) {
                element.set_reference(back.clone(), None);
            }
        }
        removed
    }
}
