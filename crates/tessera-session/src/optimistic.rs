//! Optimistic concurrency control.
//!
//! Versioned entities carry a `version = ?` predicate on every update and
//! delete, bound to the version last read. An affected-row count other than
//! the expected one means another transaction changed or deleted the row
//! first; that is reported as [`Error::StaleState`] and never retried here.

use std::time::{SystemTime, UNIX_EPOCH};
use tessera_core::error::{MappingError, StaleStateError, StoreError, StoreErrorKind};
use tessera_core::{
    EntityMetadata, Error, MappingErrorKind, MutationDescriptor, MutationKind, MutationTarget, Result, Value,
    VersionInfo, VersionKind,
};

/// Initial version of a newly inserted row.
pub fn seed_version(info: &VersionInfo) -> Value {
    match info.kind {
        VersionKind::Counter => Value::BigInt(0),
        VersionKind::Timestamp => Value::Timestamp(now_micros()),
    }
}

/// Version written by an update of a row currently at `current`.
///
/// Timestamps are forced strictly forward so two updates within the same
/// microsecond still produce distinct versions.
pub fn next_version(info: &VersionInfo, current: Option<&Value>) -> Result<Value> {
    let next = match info.kind {
        VersionKind::Counter => {
            let current = current.and_then(Value::as_i64).unwrap_or(0);
            let next = current.checked_add(1).ok_or_else(|| {
                Error::Mapping(MappingError {
                    kind: MappingErrorKind::Invalid,
                    message: format!("version column '{}' cannot move past {current}", info.column),
                })
            })?;
            Value::BigInt(next)
        }
        VersionKind::Timestamp => {
            let floor = current
                .and_then(Value::as_i64)
                .map_or(i64::MIN, |v| v.saturating_add(1));
            Value::Timestamp(now_micros().max(floor))
        }
    };
    Ok(next)
}

/// Attach the version predicate to an update or delete of a versioned entity.
pub fn with_version_predicate(
    descriptor: MutationDescriptor,
    meta: &EntityMetadata,
) -> MutationDescriptor {
    match &meta.version {
        Some(version) if descriptor.kind() != MutationKind::Insert => {
            descriptor.version_predicate(&version.column)
        }
        _ => descriptor,
    }
}

/// Validate the affected-row count of one executed mutation.
pub fn verify_row_count(descriptor: &MutationDescriptor, id: Option<&Value>, actual: u64) -> Result<()> {
    let Some(expected) = descriptor.expected_rows() else {
        return Ok(());
    };
    if expected == actual {
        return Ok(());
    }
    let entity = match descriptor.target() {
        MutationTarget::Entity(name) | MutationTarget::Collection(name) => name.clone(),
    };
    match descriptor.kind() {
        MutationKind::Update | MutationKind::Delete => {
            tracing::warn!(
                entity = %entity,
                table = descriptor.table(),
                expected = expected,
                actual = actual,
                versioned = descriptor.version_column().is_some(),
                "Optimistic check failed"
            );
            Err(Error::StaleState(StaleStateError {
                entity,
                id: id.cloned(),
                table: descriptor.table().to_string(),
                expected_rows: expected,
                actual_rows: actual,
            }))
        }
        MutationKind::Insert => Err(Error::Store(StoreError {
            kind: StoreErrorKind::UnexpectedRowCount,
            message: format!(
                "insert into {} for {} affected {} row(s), expected {}",
                descriptor.table(),
                entity,
                actual,
                expected
            ),
            source: None,
        })),
    }
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
}
