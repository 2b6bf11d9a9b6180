//! SQL dialects used when rendering generated mutation statements.

/// Placeholder and quoting style of the target store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dialect {
    /// Numbered `$n` parameters.
    #[default]
    Postgres,
    /// Numbered `?n` parameters.
    Sqlite,
    /// Positional `?` parameters.
    Mysql,
}

impl Dialect {
    /// Parameter marker for the 1-based `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote a table or column name. Embedded quote characters are doubled.
    pub fn quote_identifier(self, name: &str) -> String {
        let quote = match self {
            Dialect::Postgres | Dialect::Sqlite => '"',
            Dialect::Mysql => '`',
        };
        let doubled: String = [quote, quote].iter().collect();
        format!("{quote}{}{quote}", name.replace(quote, &doubled))
    }

    /// Whether `INSERT ... RETURNING` is available.
    pub const fn supports_returning(self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Sqlite)
    }
}
