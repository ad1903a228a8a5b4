//! Column definitions.

use crate::error::{Error, Result, SchemaErrorKind};
use crate::types::SqlType;
use std::fmt;

/// A `table.column` foreign-key target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

impl ForeignKeyRef {
    /// Parse a `"table.column"` reference.
    pub fn parse(reference: &str) -> Result<Self> {
        match reference.split_once('.') {
            Some((table, column))
                if !table.is_empty() && !column.is_empty() && !column.contains('.') =>
            {
                Ok(Self {
                    table: table.to_string(),
                    column: column.to_string(),
                })
            }
            _ => Err(Error::schema(
                SchemaErrorKind::Invalid,
                format!(
                    "foreign key reference '{}' must have the form table.column",
                    reference
                ),
            )),
        }
    }
}

impl fmt::Display for ForeignKeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

/// A column of a [`Table`](crate::Table).
///
/// Built with chained setters, mirroring a column clause of `CREATE TABLE`:
///
/// ```
/// use unitwork_core::{Column, SqlType};
///
/// let id = Column::new("id", SqlType::Integer).primary_key();
/// let email = Column::new("email_address", SqlType::VarChar(100)).not_null();
/// let user_id = Column::new("user_id", SqlType::Integer).foreign_key("user.id");
/// assert!(id.is_primary_key());
/// assert!(!email.is_nullable());
/// assert_eq!(user_id.references().map(|fk| fk.table.as_str()), Some("user"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    name: String,
    sql_type: SqlType,
    primary_key: bool,
    nullable: bool,
    autoincrement: Option<bool>,
    foreign_key: Option<String>,
    parsed_fk: Option<ForeignKeyRef>,
}

impl Column {
    /// Create a nullable, non-key column.
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            primary_key: false,
            nullable: true,
            autoincrement: None,
            foreign_key: None,
            parsed_fk: None,
        }
    }

    /// Mark this column as (part of) the primary key. Implies NOT NULL.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Mark this column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Set nullability explicitly.
    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Force autoincrement on or off.
    ///
    /// When unset, a lone integer primary key autoincrements.
    pub fn autoincrement(mut self, value: bool) -> Self {
        self.autoincrement = Some(value);
        self
    }

    /// Reference another table's column, written `"table.column"`.
    ///
    /// The reference is checked when the owning table is built.
    pub fn foreign_key(mut self, reference: impl Into<String>) -> Self {
        let reference = reference.into();
        self.parsed_fk = ForeignKeyRef::parse(&reference).ok();
        self.foreign_key = Some(reference);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sql_type(&self) -> &SqlType {
        &self.sql_type
    }

    pub fn is_primary_key(&self) -> bool {
        self.primary_key
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// The parsed foreign-key target, if any.
    pub fn references(&self) -> Option<&ForeignKeyRef> {
        self.parsed_fk.as_ref()
    }

    /// Raw foreign-key text as declared.
    pub(crate) fn declared_foreign_key(&self) -> Option<&str> {
        self.foreign_key.as_deref()
    }

    pub(crate) fn explicit_autoincrement(&self) -> Option<bool> {
        self.autoincrement
    }

    pub(crate) fn set_autoincrement(&mut self, value: bool) {
        self.autoincrement = Some(value);
    }

    /// Whether the store generates values for this column.
    pub fn is_autoincrement(&self) -> bool {
        self.autoincrement.unwrap_or(false)
    }

    /// Render the column clause of `CREATE TABLE`.
    pub fn ddl(&self) -> String {
        let mut sql = format!(
            "{} {}",
            crate::identifiers::quote_ident(&self.name),
            self.sql_type.sql_name()
        );
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foreign_key_parse() {
        let fk = ForeignKeyRef::parse("user.id").unwrap();
        assert_eq!(fk.table, "user");
        assert_eq!(fk.column, "id");
        assert_eq!(fk.to_string(), "user.id");
    }

    #[test]
    fn test_foreign_key_parse_rejects_bad_forms() {
        assert!(ForeignKeyRef::parse("user").is_err());
        assert!(ForeignKeyRef::parse(".id").is_err());
        assert!(ForeignKeyRef::parse("a.b.c").is_err());
    }

    #[test]
    fn test_primary_key_implies_not_null() {
        let col = Column::new("id", SqlType::Integer).primary_key();
        assert!(col.is_primary_key());
        assert!(!col.is_nullable());
        assert_eq!(col.ddl(), "\"id\" INTEGER NOT NULL");
    }

    #[test]
    fn test_not_null_ddl() {
        let col = Column::new("email_address", SqlType::VarChar(100)).not_null();
        assert_eq!(col.ddl(), "\"email_address\" VARCHAR(100) NOT NULL");
    }
}
