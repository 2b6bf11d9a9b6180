//! Tessera - transactional object-graph persistence for Rust.
//!
//! Tessera is the engine underneath an ORM: it keeps a graph of in-memory
//! entity instances consistent with a relational store inside one unit of
//! work. It provides:
//!
//! - A persistence context with identity map and lifecycle tracking
//! - Cascading persist, merge, remove and refresh over associations
//! - Dirty checking against snapshots, with orphan removal
//! - Dependency-ordered flush, including cycle breaking
//! - Optimistic concurrency through version predicates
//! - Per-table custom SQL that replaces generated statements
//!
//! Query building, schema generation and connection management are left to
//! the surrounding ORM; the store is reached through the [`Store`] trait.
//!
//! # Quick Start
//!
//! ```ignore
//! use tessera::prelude::*;
//!
//! let registry = MetadataRegistry::new()
//!     .with(
//!         EntityMetadata::new("Contract", "contract")
//!             .id("id", IdGeneration::Identity)
//!             .column(ColumnInfo::new("customer_name").nullable(false))
//!             .version(VersionInfo::counter("version"))
//!             .collection(
//!                 CollectionInfo::one_to_many("parties", "Party", "contract_id")
//!                     .cascade(CascadeSet::parse("all")?)
//!                     .orphan_removal(true),
//!             ),
//!     )
//!     .with(
//!         EntityMetadata::new("Party", "party")
//!             .id("id", IdGeneration::Identity)
//!             .column(ColumnInfo::new("name")),
//!     );
//! registry.validate()?;
//!
//! let mut session = Session::new(my_store, Arc::new(registry));
//! let contract = EntityRef::new("Contract").with("customer_name", "Acme");
//! session.add_element(&contract, "parties", &EntityRef::new("Party").with("name", "Buyer"))?;
//! session.persist(&contract)?;
//! session.commit()?;
//! ```

pub use tessera_core::{
    AssociationInfo, Binding, CascadeOp, CascadeSet, CircularDependencyError, CollectionInfo,
    CollectionKind, ColumnBinding, ColumnInfo, ConstraintKind, ConstraintViolationError, CustomSql,
    Dialect, EntityData, EntityMetadata, EntityRef, Error, ExecutionResult, IdGeneration,
    IdentityConflictError, InstanceId, LifecycleError, LifecycleErrorKind, MappingError,
    MappingErrorKind, MetadataRegistry, MutationDescriptor, MutationKind, MutationTarget, Result,
    ResultCheck, Row, RowColumns, StaleStateError, StatementSource, Store, StoreError,
    StoreErrorKind, TransientReferenceError, Value, VersionInfo, VersionKind,
};

pub use tessera_session::{
    CollectionEntryView, CollectionStatus, EntityEntryView, EntityStatus, FlushMode, FlushResult,
    Session, SessionConfig, SessionDebugInfo, SessionEvent, Statistics,
};

/// Lower-level building blocks of the session.
pub mod engine {
    pub use tessera_session::{
        change_tracker, collection, context, executor, flush, identity_map, optimistic, statistics,
    };
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        AssociationInfo,
        CascadeSet,
        CollectionInfo,
        ColumnInfo,
        CustomSql,
        Dialect,
        EntityMetadata,
        EntityRef,
        EntityStatus,
        Error,
        FlushMode,
        FlushResult,
        IdGeneration,
        MetadataRegistry,
        MutationKind,
        Result,
        Row,
        Session,
        SessionConfig,
        Store,
        Value,
        VersionInfo,
    };
    pub use std::sync::Arc;
}
