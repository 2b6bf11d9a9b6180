//! Row-level mutation descriptors.
//!
//! A [`MutationDescriptor`] is the immutable description of one insert,
//! update or delete against one table. It lists the columns that carry values
//! (as parameters or literals), the key predicate, the optional version
//! predicate and, for inserts, the columns whose generated values must be read
//! back. The statement itself is either generated from that description or
//! supplied by the mapping as a [`CustomSql`] override; the two cases are a
//! tagged [`StatementSource`] and the flush pipeline branches on it once.

use crate::dialect::Dialect;
use crate::metadata::{CustomSql, ResultCheck};
use crate::value::Value;
use serde::Serialize;
use std::borrow::Cow;
use std::fmt;

/// The kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

impl MutationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            MutationKind::Insert => "insert",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the statement text comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementSource {
    /// Built from the descriptor's bindings.
    Generated,
    /// Supplied by the mapping; generated SQL is never built.
    Custom(CustomSql),
}

/// How a column receives its value.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// A positional parameter, bound at execution time.
    Parameter,
    /// A literal rendered into the statement.
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnBinding {
    pub column: String,
    pub binding: Binding,
}

/// What the mutation writes on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationTarget {
    /// An entity row, by entity name.
    Entity(String),
    /// A collection row, by qualified role (`Owner.role`).
    Collection(String),
}

/// Immutable description of one row-level change.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationDescriptor {
    table: String,
    kind: MutationKind,
    target: MutationTarget,
    values: Vec<ColumnBinding>,
    keys: Vec<ColumnBinding>,
    version_column: Option<String>,
    returning: Vec<String>,
    source: StatementSource,
    expected_rows: Option<u64>,
}

impl MutationDescriptor {
    fn new(kind: MutationKind, table: impl Into<String>, target: MutationTarget) -> Self {
        Self {
            table: table.into(),
            kind,
            target,
            values: Vec::new(),
            keys: Vec::new(),
            version_column: None,
            returning: Vec::new(),
            source: StatementSource::Generated,
            expected_rows: Some(1),
        }
    }

    pub fn insert(table: impl Into<String>, target: MutationTarget) -> Self {
        Self::new(MutationKind::Insert, table, target)
    }

    pub fn update(table: impl Into<String>, target: MutationTarget) -> Self {
        Self::new(MutationKind::Update, table, target)
    }

    pub fn delete(table: impl Into<String>, target: MutationTarget) -> Self {
        Self::new(MutationKind::Delete, table, target)
    }

    /// Add a value column (insert column list or update SET list).
    pub fn set(mut self, column: impl Into<String>, binding: Binding) -> Self {
        self.values.push(ColumnBinding {
            column: column.into(),
            binding,
        });
        self
    }

    /// Add a key predicate column.
    pub fn key(mut self, column: impl Into<String>, binding: Binding) -> Self {
        self.keys.push(ColumnBinding {
            column: column.into(),
            binding,
        });
        self
    }

    /// Add the optimistic version predicate; its parameter follows the keys.
    pub fn version_predicate(mut self, column: impl Into<String>) -> Self {
        self.version_column = Some(column.into());
        self
    }

    /// Columns whose generated values must be read back after an insert.
    pub fn returning(mut self, columns: Vec<String>) -> Self {
        if self.kind == MutationKind::Insert && !self.is_custom() {
            self.returning = columns;
        }
        self
    }

    /// Override the expected affected-row count. `None` disables the check.
    pub fn expect_rows(mut self, rows: Option<u64>) -> Self {
        self.expected_rows = rows;
        self
    }

    /// Replace generated SQL with a custom statement.
    ///
    /// Returning columns are dropped: a custom insert never reports them.
    pub fn with_custom(mut self, sql: CustomSql) -> Self {
        if sql.check == ResultCheck::None {
            self.expected_rows = None;
        }
        self.returning.clear();
        self.source = StatementSource::Custom(sql);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn kind(&self) -> MutationKind {
        self.kind
    }

    pub fn target(&self) -> &MutationTarget {
        &self.target
    }

    pub fn values(&self) -> &[ColumnBinding] {
        &self.values
    }

    pub fn keys(&self) -> &[ColumnBinding] {
        &self.keys
    }

    pub fn version_column(&self) -> Option<&str> {
        self.version_column.as_deref()
    }

    /// Generated columns to read back; always empty for custom statements.
    pub fn returning_columns(&self) -> &[String] {
        match self.source {
            StatementSource::Generated => &self.returning,
            StatementSource::Custom(_) => &[],
        }
    }

    pub fn source(&self) -> &StatementSource {
        &self.source
    }

    pub fn is_custom(&self) -> bool {
        matches!(self.source, StatementSource::Custom(_))
    }

    pub fn custom_sql(&self) -> Option<&CustomSql> {
        match &self.source {
            StatementSource::Custom(sql) => Some(sql),
            StatementSource::Generated => None,
        }
    }

    pub fn expected_rows(&self) -> Option<u64> {
        self.expected_rows
    }

    /// Columns of the positional parameters, in binding order: value
    /// parameters, then key parameters, then the version predicate.
    pub fn parameter_columns(&self) -> Vec<&str> {
        self.values
            .iter()
            .chain(self.keys.iter())
            .filter(|b| b.binding == Binding::Parameter)
            .map(|b| b.column.as_str())
            .chain(self.version_column.as_deref())
            .collect()
    }

    pub fn parameter_count(&self) -> usize {
        self.parameter_columns().len()
    }

    /// The statement text for this mutation.
    pub fn sql(&self, dialect: Dialect) -> Cow<'_, str> {
        match &self.source {
            StatementSource::Custom(sql) => Cow::Borrowed(sql.text.as_str()),
            StatementSource::Generated => Cow::Owned(self.render(dialect)),
        }
    }

    fn render(&self, dialect: Dialect) -> String {
        let table = dialect.quote_identifier(&self.table);
        let mut index = 0;
        let mut next = |binding: &Binding| match binding {
            Binding::Parameter => {
                index += 1;
                dialect.placeholder(index)
            }
            Binding::Literal(value) => literal(value),
        };

        match self.kind {
            MutationKind::Insert => {
                let columns: Vec<String> = self
                    .values
                    .iter()
                    .map(|b| dialect.quote_identifier(&b.column))
                    .collect();
                let values: Vec<String> = self.values.iter().map(|b| next(&b.binding)).collect();
                let mut sql = if columns.is_empty() {
                    format!("INSERT INTO {table} DEFAULT VALUES")
                } else {
                    format!(
                        "INSERT INTO {table} ({}) VALUES ({})",
                        columns.join(", "),
                        values.join(", ")
                    )
                };
                if !self.returning.is_empty() && dialect.supports_returning() {
                    let returning: Vec<String> = self
                        .returning
                        .iter()
                        .map(|c| dialect.quote_identifier(c))
                        .collect();
                    sql.push_str(" RETURNING ");
                    sql.push_str(&returning.join(", "));
                }
                sql
            }
            MutationKind::Update => {
                let assignments: Vec<String> = self
                    .values
                    .iter()
                    .map(|b| format!("{} = {}", dialect.quote_identifier(&b.column), next(&b.binding)))
                    .collect();
                let predicate = self.render_predicate(dialect, &mut next);
                format!("UPDATE {table} SET {} WHERE {predicate}", assignments.join(", "))
            }
            MutationKind::Delete => {
                let predicate = self.render_predicate(dialect, &mut next);
                format!("DELETE FROM {table} WHERE {predicate}")
            }
        }
    }

    fn render_predicate(&self, dialect: Dialect, next: &mut impl FnMut(&Binding) -> String) -> String {
        let mut terms: Vec<String> = self
            .keys
            .iter()
            .map(|b| match &b.binding {
                Binding::Literal(Value::Null) => {
                    format!("{} IS NULL", dialect.quote_identifier(&b.column))
                }
                binding => format!("{} = {}", dialect.quote_identifier(&b.column), next(binding)),
            })
            .collect();
        if let Some(version) = &self.version_column {
            terms.push(format!(
                "{} = {}",
                dialect.quote_identifier(version),
                next(&Binding::Parameter)
            ));
        }
        terms.join(" AND ")
    }
}

fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity() -> MutationTarget {
        MutationTarget::Entity("Party".to_string())
    }

    #[test]
    fn generated_insert_with_returning() {
        let desc = MutationDescriptor::insert("party", entity())
            .set("name", Binding::Parameter)
            .set("contract_id", Binding::Parameter)
            .returning(vec!["id".to_string()]);
        assert_eq!(
            desc.sql(Dialect::Postgres),
            "INSERT INTO \"party\" (\"name\", \"contract_id\") VALUES ($1, $2) RETURNING \"id\""
        );
        assert_eq!(desc.returning_columns(), &["id".to_string()]);
        assert_eq!(desc.parameter_columns(), vec!["name", "contract_id"]);
    }

    #[test]
    fn versioned_update_orders_parameters() {
        let desc = MutationDescriptor::update("contract", entity())
            .set("customer_name", Binding::Parameter)
            .set("version", Binding::Parameter)
            .key("id", Binding::Parameter)
            .version_predicate("version");
        assert_eq!(
            desc.sql(Dialect::Sqlite),
            "UPDATE \"contract\" SET \"customer_name\" = ?1, \"version\" = ?2 WHERE \"id\" = ?3 AND \"version\" = ?4"
        );
        assert_eq!(
            desc.parameter_columns(),
            vec!["customer_name", "version", "id", "version"]
        );
        assert_eq!(desc.expected_rows(), Some(1));
    }

    #[test]
    fn literal_null_assignment() {
        let desc = MutationDescriptor::update(
            "party",
            MutationTarget::Collection("Contract.parties".to_string()),
        )
        .set("contract_id", Binding::Literal(Value::Null))
        .key("id", Binding::Parameter)
        .key("contract_id", Binding::Parameter);
        assert_eq!(
            desc.sql(Dialect::Postgres),
            "UPDATE \"party\" SET \"contract_id\" = NULL WHERE \"id\" = $1 AND \"contract_id\" = $2"
        );
        assert_eq!(desc.parameter_count(), 2);
    }

    #[test]
    fn delete_with_version() {
        let desc = MutationDescriptor::delete("contract", entity())
            .key("id", Binding::Parameter)
            .version_predicate("version");
        assert_eq!(
            desc.sql(Dialect::Postgres),
            "DELETE FROM \"contract\" WHERE \"id\" = $1 AND \"version\" = $2"
        );
    }

    #[test]
    fn custom_insert_drops_returning_and_keeps_bindings() {
        let desc = MutationDescriptor::insert("party", entity())
            .set("id", Binding::Parameter)
            .set("name", Binding::Parameter)
            .returning(vec!["created_at".to_string()])
            .with_custom(CustomSql::callable("{call ins_party(?, ?)}"));
        assert!(desc.is_custom());
        assert!(desc.returning_columns().is_empty());
        assert_eq!(desc.sql(Dialect::Postgres), "{call ins_party(?, ?)}");
        assert_eq!(desc.parameter_columns(), vec!["id", "name"]);
        assert!(desc.custom_sql().is_some_and(|s| s.callable));
    }

    #[test]
    fn unchecked_custom_statement_skips_row_count() {
        let desc = MutationDescriptor::delete("party", entity())
            .key("id", Binding::Parameter)
            .with_custom(CustomSql::new("DELETE FROM party WHERE id = ?").check(ResultCheck::None));
        assert_eq!(desc.expected_rows(), None);
    }

    #[test]
    fn mysql_insert_omits_returning_clause() {
        let desc = MutationDescriptor::insert("party", entity())
            .set("name", Binding::Parameter)
            .returning(vec!["id".to_string()]);
        assert_eq!(desc.sql(Dialect::Mysql), "INSERT INTO `party` (`name`) VALUES (?)");
    }
}
