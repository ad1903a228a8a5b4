//! Table descriptors and the `MetaData` collection.
//!
//! A [`Table`] describes one entity type: its columns, primary key and
//! relationship edges. Tables are collected in a [`MetaData`], which resolves
//! relationship targets, orders tables by foreign-key dependency and can
//! create the schema on a connection.

use crate::connection::Connection;
use crate::error::{Error, Result, SchemaErrorKind};
use crate::field::Column;
use crate::identifiers::{is_valid_identifier, quote_ident};
use crate::relationship::{Relationship, RelationshipKind};
use crate::statement::Statement;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// An immutable table descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    name: String,
    columns: Vec<Column>,
    primary_key: Vec<String>,
    relationships: Vec<Relationship>,
}

impl Table {
    /// Start building a table.
    ///
    /// ```
    /// use unitwork_core::{Column, SqlType, Table};
    ///
    /// let user = Table::builder("user")
    ///     .column(Column::new("id", SqlType::Integer).primary_key())
    ///     .column(Column::new("name", SqlType::Text))
    ///     .column(Column::new("fullname", SqlType::Text))
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(user.primary_key(), ["id"]);
    /// ```
    pub fn builder(name: impl Into<String>) -> TableBuilder {
        TableBuilder {
            name: name.into(),
            columns: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// All columns in declaration order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name() == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Column names in declaration order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(Column::name)
    }

    /// Primary-key column names, in declaration order.
    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    /// The autoincrementing primary-key column, if the table has one.
    pub fn autoincrement_column(&self) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.is_primary_key() && c.is_autoincrement())
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    /// Look up a relationship by name.
    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.name() == name)
    }

    /// Like [`Table::relationship`] but fails with a schema error.
    pub fn require_relationship(&self, name: &str) -> Result<&Relationship> {
        self.relationship(name).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::RelationshipNotFound,
                format!("table '{}' has no relationship '{}'", self.name, name),
            )
        })
    }

    /// Tables this table references through column foreign keys, excluding
    /// itself.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = Vec::new();
        for fk in self.columns.iter().filter_map(Column::references) {
            if fk.table != self.name && !deps.contains(&fk.table.as_str()) {
                deps.push(&fk.table);
            }
        }
        deps
    }

    /// Render the `CREATE TABLE` statement text.
    pub fn create_sql(&self) -> String {
        let mut clauses: Vec<String> = self.columns.iter().map(Column::ddl).collect();
        let pk = self
            .primary_key
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        clauses.push(format!("PRIMARY KEY ({})", pk));
        for col in &self.columns {
            if let Some(fk) = col.references() {
                clauses.push(format!(
                    "FOREIGN KEY ({}) REFERENCES {} ({})",
                    quote_ident(col.name()),
                    quote_ident(&fk.table),
                    quote_ident(&fk.column)
                ));
            }
        }
        format!("CREATE TABLE {} ({})", quote_ident(&self.name), clauses.join(", "))
    }
}

/// Validating builder for [`Table`].
#[derive(Debug)]
pub struct TableBuilder {
    name: String,
    columns: Vec<Column>,
    relationships: Vec<Relationship>,
}

impl TableBuilder {
    /// Add a column.
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Add a relationship edge.
    pub fn relationship(mut self, relationship: Relationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Validate and build the table.
    ///
    /// Checks identifiers, duplicate names, the primary key, foreign-key
    /// syntax, autoincrement eligibility and that many-to-one relationships
    /// name a local column. Cross-table checks happen in
    /// [`MetaData::validate`].
    pub fn build(self) -> Result<Table> {
        let invalid = |message: String| Error::schema(SchemaErrorKind::Invalid, message);

        if !is_valid_identifier(&self.name) {
            return Err(invalid(format!("invalid table name '{}'", self.name)));
        }
        if self.columns.is_empty() {
            return Err(invalid(format!("table '{}' has no columns", self.name)));
        }

        let mut seen: HashSet<String> = HashSet::new();
        for col in &self.columns {
            if !is_valid_identifier(col.name()) {
                return Err(invalid(format!(
                    "invalid column name '{}' on table '{}'",
                    col.name(),
                    self.name
                )));
            }
            if !seen.insert(col.name().to_string()) {
                return Err(invalid(format!(
                    "column '{}' declared twice on table '{}'",
                    col.name(),
                    self.name
                )));
            }
            if let Some(raw) = col.declared_foreign_key() {
                if col.references().is_none() {
                    return Err(invalid(format!(
                        "column '{}.{}': foreign key '{}' must have the form table.column",
                        self.name,
                        col.name(),
                        raw
                    )));
                }
            }
        }

        let primary_key: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.is_primary_key())
            .map(|c| c.name().to_string())
            .collect();
        if primary_key.is_empty() {
            return Err(invalid(format!(
                "table '{}' has no primary key column",
                self.name
            )));
        }

        let mut columns = self.columns;
        let single_pk = primary_key.len() == 1;
        for col in &mut columns {
            let eligible = single_pk && col.is_primary_key() && col.sql_type().is_integer();
            match col.explicit_autoincrement() {
                Some(true) if !eligible => {
                    return Err(invalid(format!(
                        "column '{}.{}' cannot autoincrement; only a lone integer primary key can",
                        self.name,
                        col.name()
                    )));
                }
                Some(_) => {}
                None => col.set_autoincrement(eligible),
            }
        }

        let mut rel_names = HashSet::new();
        for rel in &self.relationships {
            if !is_valid_identifier(rel.name()) {
                return Err(invalid(format!(
                    "invalid relationship name '{}' on table '{}'",
                    rel.name(),
                    self.name
                )));
            }
            if seen.contains(rel.name()) || !rel_names.insert(rel.name()) {
                return Err(invalid(format!(
                    "relationship '{}' on table '{}' clashes with another attribute",
                    rel.name(),
                    self.name
                )));
            }
            if rel.kind() == RelationshipKind::ManyToOne
                && !columns.iter().any(|c| c.name() == rel.foreign_key())
            {
                return Err(Error::schema(
                    SchemaErrorKind::ColumnNotFound,
                    format!(
                        "relationship '{}.{}' names foreign key column '{}' which does not exist",
                        self.name,
                        rel.name(),
                        rel.foreign_key()
                    ),
                ));
            }
        }

        Ok(Table {
            name: self.name,
            columns,
            primary_key,
            relationships: self.relationships,
        })
    }
}

/// A collection of tables.
#[derive(Debug, Clone, Default)]
pub struct MetaData {
    tables: Vec<Arc<Table>>,
    index: HashMap<String, usize>,
}

impl MetaData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a built table, failing if the name is taken.
    pub fn add_table(&mut self, table: Table) -> Result<Arc<Table>> {
        if self.index.contains_key(table.name()) {
            return Err(Error::schema(
                SchemaErrorKind::TableExists,
                format!("table '{}' is already defined in this MetaData", table.name()),
            ));
        }
        let table = Arc::new(table);
        self.index.insert(table.name().to_string(), self.tables.len());
        self.tables.push(Arc::clone(&table));
        tracing::debug!(table = table.name(), "Registered table");
        Ok(table)
    }

    /// Look up a table by name.
    pub fn table(&self, name: &str) -> Option<&Arc<Table>> {
        self.index.get(name).map(|&i| &self.tables[i])
    }

    /// Like [`MetaData::table`] but fails with a schema error.
    pub fn require_table(&self, name: &str) -> Result<&Arc<Table>> {
        self.table(name).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::TableNotFound,
                format!("table '{}' is not defined", name),
            )
        })
    }

    /// Tables in insertion order.
    pub fn tables(&self) -> &[Arc<Table>] {
        &self.tables
    }

    /// Resolve the target table of a relationship.
    pub fn target_of(&self, relationship: &Relationship) -> Result<&Arc<Table>> {
        self.require_table(relationship.target())
    }

    /// Check every cross-table reference.
    ///
    /// Column foreign keys must name an existing column, relationship
    /// targets must exist, one-to-many foreign keys must exist on the
    /// target, and `back_populates` partners must exist and point back.
    pub fn validate(&self) -> Result<()> {
        for table in &self.tables {
            for col in table.columns() {
                if let Some(fk) = col.references() {
                    let target = self.require_table(&fk.table)?;
                    if !target.has_column(&fk.column) {
                        return Err(Error::schema(
                            SchemaErrorKind::ColumnNotFound,
                            format!(
                                "column '{}.{}' references missing column '{}'",
                                table.name(),
                                col.name(),
                                fk
                            ),
                        ));
                    }
                }
            }

            for rel in table.relationships() {
                let target = self.target_of(rel)?;
                if target.primary_key().len() != 1 && rel.kind() == RelationshipKind::ManyToOne
                {
                    return Err(Error::schema(
                        SchemaErrorKind::Invalid,
                        format!(
                            "relationship '{}.{}' targets '{}' whose primary key is composite",
                            table.name(),
                            rel.name(),
                            target.name()
                        ),
                    ));
                }
                if rel.kind() == RelationshipKind::OneToMany {
                    if table.primary_key().len() != 1 {
                        return Err(Error::schema(
                            SchemaErrorKind::Invalid,
                            format!(
                                "relationship '{}.{}' needs a single-column primary key on '{}'",
                                table.name(),
                                rel.name(),
                                table.name()
                            ),
                        ));
                    }
                    if !target.has_column(rel.foreign_key()) {
                        return Err(Error::schema(
                            SchemaErrorKind::ColumnNotFound,
                            format!(
                                "relationship '{}.{}' names foreign key '{}.{}' which does not exist",
                                table.name(),
                                rel.name(),
                                target.name(),
                                rel.foreign_key()
                            ),
                        ));
                    }
                }
                if let Some(back) = rel.back_populates_name() {
                    let partner = target.require_relationship(back)?;
                    if partner.target() != table.name() || partner.foreign_key() != rel.foreign_key()
                    {
                        return Err(Error::schema(
                            SchemaErrorKind::Invalid,
                            format!(
                                "relationship '{}.{}' back-populates '{}.{}' which does not mirror it",
                                table.name(),
                                rel.name(),
                                target.name(),
                                back
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Tables ordered so that every table follows the tables it references.
    ///
    /// Self-references are allowed. A cycle between distinct tables is a
    /// `DependencyCycle` schema error naming the cycle path.
    pub fn sorted_tables(&self) -> Result<Vec<Arc<Table>>> {
        let mut sorted = Vec::with_capacity(self.tables.len());
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for table in &self.tables {
            if !visited.contains(table.name()) {
                self.visit(table, &mut visited, &mut rec_stack, &mut path, &mut sorted)?;
            }
        }
        Ok(sorted)
    }

    // DFS post-order; `path` holds the current recursion stack for error text.
    fn visit<'a>(
        &'a self,
        table: &'a Arc<Table>,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
        sorted: &mut Vec<Arc<Table>>,
    ) -> Result<()> {
        visited.insert(table.name());
        rec_stack.insert(table.name());
        path.push(table.name());

        for dep in table.dependencies() {
            // Unknown tables are reported by validate(), not here.
            let Some(dep_table) = self.table(dep) else {
                continue;
            };
            if rec_stack.contains(dep) {
                path.push(dep_table.name());
                return Err(Error::schema(
                    SchemaErrorKind::DependencyCycle,
                    format!("dependency cycle between tables: {}", path.join(" -> ")),
                ));
            }
            if !visited.contains(dep) {
                self.visit(dep_table, visited, rec_stack, path, sorted)?;
            }
        }

        rec_stack.remove(table.name());
        path.pop();
        sorted.push(Arc::clone(table));
        Ok(())
    }

    /// Create every table the connection does not have yet, parents first.
    ///
    /// Returns the number of tables created. Safe to call repeatedly.
    pub fn create_all<C: Connection + ?Sized>(&self, conn: &mut C) -> Result<usize> {
        self.validate()?;
        let mut created = 0;
        for table in self.sorted_tables()? {
            if conn.has_table(table.name())? {
                tracing::trace!(table = table.name(), "Table exists; skipping");
                continue;
            }
            conn.execute(&Statement::CreateTable(Arc::clone(&table)))?;
            created += 1;
        }
        tracing::info!(created, total = self.tables.len(), "create_all finished");
        Ok(created)
    }
}
