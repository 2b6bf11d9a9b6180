//! The store-execution collaborator.
//!
//! [`Store`] is the narrow, synchronous interface through which the
//! persistence engine touches the underlying database:
//!
//! - [`Store::execute`] runs one mutation with its bound parameter values
//! - [`Store::load_row`] / [`Store::load_collection`] read persistent state
//! - [`Store::next_sequence_value`] draws identifiers for sequence-generated entities
//! - [`Store::commit`] / [`Store::rollback`] end the ambient transaction
//!
//! Implementations are assumed to run inside the ambient transaction and are
//! never retried by the engine. Constraint failures must be reported as
//! [`Error::ConstraintViolation`](crate::Error::ConstraintViolation).

use crate::error::{Error, Result, StoreError, StoreErrorKind};
use crate::metadata::{CollectionInfo, EntityMetadata};
use crate::mutation::MutationDescriptor;
use crate::row::Row;
use crate::value::Value;

/// Outcome of executing one mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    /// Number of rows the statement affected
    pub affected_rows: u64,
    /// Values of the descriptor's returning columns, if any were requested
    pub generated: Vec<(String, Value)>,
}

impl ExecutionResult {
    pub fn rows(affected_rows: u64) -> Self {
        Self {
            affected_rows,
            generated: Vec::new(),
        }
    }

    pub fn with_generated(mut self, column: impl Into<String>, value: Value) -> Self {
        self.generated.push((column.into(), value));
        self
    }

    pub fn generated_value(&self, column: &str) -> Option<&Value> {
        self.generated
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }
}

/// Synchronous access to the underlying store.
pub trait Store {
    /// Execute one mutation. `params` follow
    /// [`MutationDescriptor::parameter_columns`].
    fn execute(&mut self, mutation: &MutationDescriptor, params: &[Value]) -> Result<ExecutionResult>;

    /// Execute the same statement once per parameter set.
    ///
    /// Only used for mutations without returning columns. Returns one
    /// affected-row count per parameter set.
    fn execute_batch(
        &mut self,
        mutation: &MutationDescriptor,
        batch: &[Vec<Value>],
    ) -> Result<Vec<u64>> {
        batch
            .iter()
            .map(|params| self.execute(mutation, params).map(|r| r.affected_rows))
            .collect()
    }

    /// Draw the next value of a named sequence.
    fn next_sequence_value(&mut self, sequence: &str) -> Result<Value> {
        Err(Error::Store(StoreError {
            kind: StoreErrorKind::Unsupported,
            message: format!("store does not provide sequence '{sequence}'"),
            source: None,
        }))
    }

    /// Read the row of `entity` with identifier `id`.
    fn load_row(&mut self, entity: &EntityMetadata, id: &Value) -> Result<Option<Row>>;

    /// Read the element identifiers of `collection` owned by `owner_id`.
    fn load_collection(&mut self, collection: &CollectionInfo, owner_id: &Value)
    -> Result<Vec<Value>>;

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: Store + ?Sized> Store for &mut S {
    fn execute(&mut self, mutation: &MutationDescriptor, params: &[Value]) -> Result<ExecutionResult> {
        (**self).execute(mutation, params)
    }

    fn execute_batch(
        &mut self,
        mutation: &MutationDescriptor,
        batch: &[Vec<Value>],
    ) -> Result<Vec<u64>> {
        (**self).execute_batch(mutation, batch)
    }

    fn next_sequence_value(&mut self, sequence: &str) -> Result<Value> {
        (**self).next_sequence_value(sequence)
    }

    fn load_row(&mut self, entity: &EntityMetadata, id: &Value) -> Result<Option<Row>> {
        (**self).load_row(entity, id)
    }

    fn load_collection(
        &mut self,
        collection: &CollectionInfo,
        owner_id: &Value,
    ) -> Result<Vec<Value>> {
        (**self).load_collection(collection, owner_id)
    }

    fn commit(&mut self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<()> {
        (**self).rollback()
    }
}
