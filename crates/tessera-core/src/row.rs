//! Loaded row representation.

use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column names shared across all rows read from one table.
#[derive(Debug, Clone, Default)]
pub struct RowColumns {
    names: Vec<String>,
    name_to_index: HashMap<String, usize>,
}

impl RowColumns {
    pub fn new(names: Vec<String>) -> Self {
        let name_to_index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            names,
            name_to_index,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single row handed to hydration by the store or the query layer.
///
/// Holds every mapped column of the table: identifier, version, scalar
/// properties and foreign keys.
#[derive(Debug, Clone)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<RowColumns>,
}

impl Row {
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        Self {
            values,
            columns: Arc::new(RowColumns::new(column_names)),
        }
    }

    /// Create a row with shared column metadata.
    pub fn with_columns(columns: Arc<RowColumns>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    /// Build a row from `(column, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let (names, values): (Vec<String>, Vec<Value>) = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .unzip();
        Self::new(names, values)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column name. Missing columns read as `None`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Get a value by column name, treating a missing column as NULL.
    pub fn get_or_null(&self, name: &str) -> Value {
        self.get(name).cloned().unwrap_or(Value::Null)
    }

    pub fn contains_column(&self, name: &str) -> bool {
        self.columns.index_of(name).is_some()
    }

    /// Iterate over (column_name, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}
