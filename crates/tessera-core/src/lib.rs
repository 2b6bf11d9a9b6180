//! Core types and traits for Tessera.
//!
//! This crate provides the leaf abstractions shared by the persistence engine:
//!
//! - [`Value`] dynamic column values
//! - [`Error`] / [`Result`] with the engine's error taxonomy
//! - Entity and association metadata ([`EntityMetadata`], [`MetadataRegistry`])
//! - [`EntityRef`] in-memory entity handles with instance identity
//! - [`MutationDescriptor`] with generated or custom statements
//! - The [`Store`] trait through which mutations reach the database

pub mod dialect;
pub mod entity;
pub mod error;
pub mod metadata;
pub mod mutation;
pub mod row;
pub mod store;
pub mod value;

pub use dialect::Dialect;
pub use entity::{EntityData, EntityRef, InstanceId};
pub use error::{
    CircularDependencyError, ConstraintKind, ConstraintViolationError, Error,
    IdentityConflictError, LifecycleError, LifecycleErrorKind, MappingError, MappingErrorKind,
    Result, StaleStateError, StoreError, StoreErrorKind, TransientReferenceError,
};
pub use metadata::{
    AssociationInfo, CascadeOp, CascadeSet, CollectionInfo, CollectionKind, ColumnInfo, CustomSql,
    EntityMetadata, IdGeneration, MetadataRegistry, ResultCheck, VersionInfo, VersionKind,
};
pub use mutation::{
    Binding, ColumnBinding, MutationDescriptor, MutationKind, MutationTarget, StatementSource,
};
pub use row::{Row, RowColumns};
pub use store::{ExecutionResult, Store};
pub use value::Value;
