//! Error types for Tessera operations.

use crate::value::Value;
use std::fmt;

/// The primary error type for all Tessera operations.
#[derive(Debug)]
pub enum Error {
    /// Two distinct instances claim the same (entity, identifier)
    IdentityConflict(IdentityConflictError),
    /// The store rejected a mutation (foreign key, unique, not null, check)
    ConstraintViolation(ConstraintViolationError),
    /// Optimistic version check failed or a row vanished underneath us
    StaleState(StaleStateError),
    /// Insert or delete ordering cannot satisfy foreign keys
    CircularDependency(CircularDependencyError),
    /// A managed entity references an unsaved instance
    TransientReference(TransientReferenceError),
    /// Invalid lifecycle transition
    Lifecycle(LifecycleError),
    /// Metadata lookup or configuration errors
    Mapping(MappingError),
    /// Row not found in the store
    NotFound {
        /// Entity name
        entity: String,
        /// Identifier that was looked up
        id: Value,
    },
    /// Any other failure reported by the store
    Store(StoreError),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct IdentityConflictError {
    pub entity: String,
    pub id: Value,
}

#[derive(Debug)]
pub struct ConstraintViolationError {
    pub kind: ConstraintKind,
    pub table: String,
    pub constraint: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    /// Referenced row missing, or row still referenced on delete
    ForeignKey,
    /// Duplicate key
    Unique,
    /// NULL bound into a non-nullable column
    NotNull,
    /// Check constraint
    Check,
}

#[derive(Debug, Clone)]
pub struct StaleStateError {
    pub entity: String,
    pub id: Option<Value>,
    pub table: String,
    pub expected_rows: u64,
    pub actual_rows: u64,
}

#[derive(Debug, Clone)]
pub struct CircularDependencyError {
    /// Mutation phase the cycle was found in ("insert" or "delete")
    pub phase: &'static str,
    /// Entities involved in the cycle, in traversal order
    pub entities: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TransientReferenceError {
    pub entity: String,
    pub association: String,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct LifecycleError {
    pub kind: LifecycleErrorKind,
    pub entity: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleErrorKind {
    /// persist() on an instance that already has a generated identifier
    DetachedPersist,
    /// remove() on an instance this context does not manage
    DetachedRemove,
    /// Operation on an instance whose delete was already flushed
    Deleted,
    /// Operation requires a managed instance
    NotManaged,
    /// Context failed a previous flush and must be discarded
    Tainted,
}

#[derive(Debug, Clone)]
pub struct MappingError {
    pub kind: MappingErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    /// Entity name not registered
    UnknownEntity,
    /// Association or collection role not declared
    UnknownAssociation,
    /// Column not declared on the entity
    UnknownColumn,
    /// Identifier missing or of the wrong strategy
    Identifier,
    /// Registry cross references do not line up
    Invalid,
}

#[derive(Debug)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Statement execution failed
    Execution,
    /// A row count other than the expected one, outside version checks
    UnexpectedRowCount,
    /// The store does not provide the requested capability
    Unsupported,
}

impl Error {
    /// Programming or model errors, reported before any mutation executes.
    ///
    /// The context stays usable after one of these.
    pub fn is_model_error(&self) -> bool {
        matches!(
            self,
            Error::IdentityConflict(_)
                | Error::CircularDependency(_)
                | Error::TransientReference(_)
                | Error::Lifecycle(_)
                | Error::Mapping(_)
        )
    }

    /// Errors that, when raised during flush execution, leave the store
    /// partially mutated.
    pub fn taints_context(&self) -> bool {
        matches!(
            self,
            Error::ConstraintViolation(_) | Error::StaleState(_) | Error::Store(_)
        )
    }

    /// Is this an optimistic concurrency conflict?
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Error::StaleState(_))
    }

    /// Get SQLSTATE if available (e.g., "23503" for a foreign key violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::ConstraintViolation(c) => c.sqlstate.as_deref(),
            _ => None,
        }
    }

    pub fn unknown_entity(entity: &str) -> Self {
        Error::Mapping(MappingError {
            kind: MappingErrorKind::UnknownEntity,
            message: format!("no metadata registered for entity '{entity}'"),
        })
    }

    pub fn unknown_association(entity: &str, name: &str) -> Self {
        Error::Mapping(MappingError {
            kind: MappingErrorKind::UnknownAssociation,
            message: format!("entity '{entity}' declares no association '{name}'"),
        })
    }

    pub fn lifecycle(
        kind: LifecycleErrorKind,
        entity: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Lifecycle(LifecycleError {
            kind,
            entity: entity.into(),
            message: message.into(),
        })
    }
}

impl ConstraintViolationError {
    pub fn new(kind: ConstraintKind, table: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            table: table.into(),
            constraint: None,
            sqlstate: Some(kind.sqlstate().to_string()),
            message: message.into(),
            source: None,
        }
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.kind == ConstraintKind::ForeignKey
    }
}

impl ConstraintKind {
    /// Standard SQLSTATE code for this constraint class.
    pub const fn sqlstate(self) -> &'static str {
        match self {
            ConstraintKind::ForeignKey => "23503",
            ConstraintKind::Unique => "23505",
            ConstraintKind::NotNull => "23502",
            ConstraintKind::Check => "23514",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::IdentityConflict(e) => write!(f, "Identity conflict: {}", e),
            Error::ConstraintViolation(e) => write!(f, "Constraint violation: {}", e),
            Error::StaleState(e) => write!(f, "Stale state: {}", e),
            Error::CircularDependency(e) => write!(f, "Circular dependency: {}", e),
            Error::TransientReference(e) => write!(f, "Transient reference: {}", e),
            Error::Lifecycle(e) => write!(f, "Lifecycle error: {}", e),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e.message),
            Error::NotFound { entity, id } => write!(f, "No row for {}#{}", entity, id),
            Error::Store(e) => write!(f, "Store error: {}", e.message),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ConstraintViolation(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Store(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for IdentityConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "a different instance of {} with id {} is already managed",
            self.entity, self.id
        )
    }
}

impl fmt::Display for ConstraintViolationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} on {} (SQLSTATE {})", self.message, self.table, sqlstate)
        } else {
            write!(f, "{} on {}", self.message, self.table)
        }
    }
}

impl fmt::Display for StaleStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(
                f,
                "row of {}#{} in {} was updated or deleted by another transaction \
                 (expected {} row(s), got {})",
                self.entity, id, self.table, self.expected_rows, self.actual_rows
            ),
            None => write!(
                f,
                "row of {} in {} was updated or deleted by another transaction \
                 (expected {} row(s), got {})",
                self.entity, self.table, self.expected_rows, self.actual_rows
            ),
        }
    }
}

impl fmt::Display for CircularDependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unresolvable {} ordering: {}",
            self.phase,
            self.entities.join(" -> ")
        )
    }
}

impl fmt::Display for TransientReferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} references an unsaved transient instance of {}",
            self.entity, self.association, self.target
        )
    }
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.entity)
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<IdentityConflictError> for Error {
    fn from(err: IdentityConflictError) -> Self {
        Error::IdentityConflict(err)
    }
}

impl From<ConstraintViolationError> for Error {
    fn from(err: ConstraintViolationError) -> Self {
        Error::ConstraintViolation(err)
    }
}

impl From<StaleStateError> for Error {
    fn from(err: StaleStateError) -> Self {
        Error::StaleState(err)
    }
}

impl From<CircularDependencyError> for Error {
    fn from(err: CircularDependencyError) -> Self {
        Error::CircularDependency(err)
    }
}

impl From<TransientReferenceError> for Error {
    fn from(err: TransientReferenceError) -> Self {
        Error::TransientReference(err)
    }
}

impl From<LifecycleError> for Error {
    fn from(err: LifecycleError) -> Self {
        Error::Lifecycle(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::Store(err)
    }
}

/// Result type alias for Tessera operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_flags() {
        let conflict = Error::IdentityConflict(IdentityConflictError {
            entity: "Party".to_string(),
            id: Value::BigInt(1),
        });
        assert!(conflict.is_model_error());
        assert!(!conflict.taints_context());

        let cycle = Error::CircularDependency(CircularDependencyError {
            phase: "insert",
            entities: vec!["A".to_string(), "B".to_string(), "A".to_string()],
        });
        assert!(cycle.is_model_error());
        assert_eq!(
            cycle.to_string(),
            "Circular dependency: unresolvable insert ordering: A -> B -> A"
        );

        let stale = Error::StaleState(StaleStateError {
            entity: "Contract".to_string(),
            id: Some(Value::BigInt(3)),
            table: "contract".to_string(),
            expected_rows: 1,
            actual_rows: 0,
        });
        assert!(stale.taints_context());
        assert!(stale.is_concurrency_conflict());
        assert!(!stale.is_model_error());
    }

    #[test]
    fn constraint_sqlstate() {
        let err = Error::from(ConstraintViolationError::new(
            ConstraintKind::ForeignKey,
            "party",
            "row is still referenced",
        ));
        assert_eq!(err.sqlstate(), Some("23503"));
        assert!(err.taints_context());
        match err {
            Error::ConstraintViolation(c) => assert!(c.is_foreign_key_violation()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn lifecycle_helper_display() {
        let err = Error::lifecycle(
            LifecycleErrorKind::DetachedRemove,
            "Party",
            "cannot remove a detached instance",
        );
        assert_eq!(
            err.to_string(),
            "Lifecycle error: cannot remove a detached instance (Party)"
        );
    }
}
