//! Mutation execution.
//!
//! The executor turns planned mutations into store calls. Parameter values
//! are bound at execution time, not at planning time: a foreign key that
//! points at a row inserted earlier in the same flush reads the identifier
//! that insert generated.
//!
//! Consecutive mutations that render the same statement text and read
//! nothing back are sent as one [`Store::execute_batch`] call. Every
//! mutation's affected-row count is still validated on its own.

use crate::optimistic;
use tessera_core::error::{ConstraintViolationError, StoreError, StoreErrorKind};
use tessera_core::{
    ConstraintKind, Dialect, EntityRef, Error, ExecutionResult, MutationDescriptor, Result, Store,
    Value,
};

/// Source of one positional parameter.
#[derive(Debug, Clone)]
pub enum Param {
    /// A value fixed at planning time.
    Value(Value),
    /// The identifier of an instance, read when the mutation executes.
    /// An absent instance or identifier binds NULL.
    IdOf(Option<EntityRef>),
}

impl Param {
    pub fn id_of(instance: &EntityRef) -> Self {
        Param::IdOf(Some(instance.clone()))
    }

    fn bind(&self) -> Value {
        match self {
            Param::Value(value) => value.clone(),
            Param::IdOf(instance) => instance
                .as_ref()
                .and_then(EntityRef::id)
                .unwrap_or(Value::Null),
        }
    }
}

/// A mutation ready for execution.
#[derive(Debug, Clone)]
pub struct PlannedMutation {
    pub descriptor: MutationDescriptor,
    /// One source per [`MutationDescriptor::parameter_columns`] entry
    pub params: Vec<Param>,
    /// The instance whose row this mutation writes
    pub subject: Option<EntityRef>,
    /// Parameter columns that must not bind NULL
    pub not_null: Vec<String>,
}

impl PlannedMutation {
    pub fn new(descriptor: MutationDescriptor, params: Vec<Param>) -> Self {
        Self {
            descriptor,
            params,
            subject: None,
            not_null: Vec::new(),
        }
    }

    pub fn subject(mut self, instance: &EntityRef) -> Self {
        self.subject = Some(instance.clone());
        self
    }

    pub fn not_null(mut self, columns: Vec<String>) -> Self {
        self.not_null = columns;
        self
    }

    /// Bind every parameter in declaration order.
    pub fn bind(&self) -> Vec<Value> {
        self.params.iter().map(Param::bind).collect()
    }

    fn subject_id(&self) -> Option<Value> {
        self.subject.as_ref().and_then(EntityRef::id)
    }
}

/// Counters of one execution run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub statements: usize,
    pub batches: usize,
    pub affected_rows: u64,
}

/// Executes planned mutations against a store.
pub struct MutationExecutor<'s, S: Store> {
    store: &'s mut S,
    dialect: Dialect,
    batch_size: usize,
    check_nullability: bool,
}

impl<'s, S: Store> MutationExecutor<'s, S> {
    pub fn new(store: &'s mut S, dialect: Dialect) -> Self {
        Self {
            store,
            dialect,
            batch_size: 1,
            check_nullability: false,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn check_nullability(mut self, enabled: bool) -> Self {
        self.check_nullability = enabled;
        self
    }

    /// Execute `mutations` in order.
    ///
    /// `after` runs once per mutation, right after it executes and before
    /// the next mutation is bound, so it can apply generated identifiers.
    /// The first failure stops execution.
    pub fn execute_all(
        &mut self,
        mutations: &[PlannedMutation],
        mut after: impl FnMut(&PlannedMutation, &ExecutionResult) -> Result<()>,
    ) -> Result<ExecutionSummary> {
        let mut summary = ExecutionSummary::default();
        let mut index = 0;
        while index < mutations.len() {
            let end = self.batch_end(mutations, index);
            if end - index > 1 {
                self.execute_batch(&mutations[index..end], &mut summary, &mut after)?;
            } else {
                self.execute_one(&mutations[index], &mut summary, &mut after)?;
            }
            index = end;
        }
        Ok(summary)
    }

    fn batch_end(&self, mutations: &[PlannedMutation], start: usize) -> usize {
        let first = &mutations[start].descriptor;
        if self.batch_size <= 1 || !first.returning_columns().is_empty() {
            return start + 1;
        }
        let sql = first.sql(self.dialect);
        let mut end = start + 1;
        while end < mutations.len() && end - start < self.batch_size {
            let next = &mutations[end].descriptor;
            if !next.returning_columns().is_empty() || next.sql(self.dialect) != sql {
                break;
            }
            end += 1;
        }
        end
    }

    fn execute_one(
        &mut self,
        mutation: &PlannedMutation,
        summary: &mut ExecutionSummary,
        after: &mut impl FnMut(&PlannedMutation, &ExecutionResult) -> Result<()>,
    ) -> Result<()> {
        let params = self.bind_checked(mutation)?;
        let descriptor = &mutation.descriptor;
        tracing::trace!(
            table = descriptor.table(),
            kind = %descriptor.kind(),
            custom = descriptor.is_custom(),
            sql = %descriptor.sql(self.dialect),
            params = params.len(),
            "Executing mutation"
        );
        let result = self.store.execute(descriptor, &params)?;
        optimistic::verify_row_count(descriptor, mutation.subject_id().as_ref(), result.affected_rows)?;
        summary.statements += 1;
        summary.affected_rows += result.affected_rows;
        after(mutation, &result)
    }

    fn execute_batch(
        &mut self,
        batch: &[PlannedMutation],
        summary: &mut ExecutionSummary,
        after: &mut impl FnMut(&PlannedMutation, &ExecutionResult) -> Result<()>,
    ) -> Result<()> {
        let params = batch
            .iter()
            .map(|m| self.bind_checked(m))
            .collect::<Result<Vec<_>>>()?;
        let descriptor = &batch[0].descriptor;
        tracing::trace!(
            table = descriptor.table(),
            kind = %descriptor.kind(),
            custom = descriptor.is_custom(),
            sql = %descriptor.sql(self.dialect),
            size = batch.len(),
            "Executing mutation batch"
        );
        let counts = self.store.execute_batch(descriptor, &params)?;
        if counts.len() != batch.len() {
            return Err(Error::Store(StoreError {
                kind: StoreErrorKind::UnexpectedRowCount,
                message: format!(
                    "batch on {} reported {} row counts for {} statements",
                    descriptor.table(),
                    counts.len(),
                    batch.len()
                ),
                source: None,
            }));
        }
        summary.batches += 1;
        for (mutation, rows) in batch.iter().zip(counts) {
            optimistic::verify_row_count(&mutation.descriptor, mutation.subject_id().as_ref(), rows)?;
            summary.statements += 1;
            summary.affected_rows += rows;
            after(mutation, &ExecutionResult::rows(rows))?;
        }
        Ok(())
    }

    fn bind_checked(&self, mutation: &PlannedMutation) -> Result<Vec<Value>> {
        let params = mutation.bind();
        if self.check_nullability && !mutation.not_null.is_empty() {
            let columns = mutation.descriptor.parameter_columns();
            for (column, value) in columns.iter().zip(&params) {
                if value.is_null() && mutation.not_null.iter().any(|c| c == column) {
                    return Err(Error::ConstraintViolation(ConstraintViolationError::new(
                        ConstraintKind::NotNull,
                        mutation.descriptor.table(),
                        format!("NULL bound to non-nullable column '{column}'"),
                    )));
                }
            }
        }
        Ok(params)
    }
}
