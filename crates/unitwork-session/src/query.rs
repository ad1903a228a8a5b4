//! Session-bound queries over one table.
//!
//! A [`Query`] borrows its session mutably, builds a [`Select`] and routes
//! every returned row through the identity map: a row whose key is already
//! tracked yields the tracked instance.
//!
//! Column names are checked when a terminal method runs, so a builder chain
//! never fails half-way.

use crate::Session;
use crate::instance::Instance;
use std::sync::Arc;
use unitwork_core::{
    ConnectionSource, Error, Predicate, Result, SchemaErrorKind, Select, Statement, Table, Value,
};

/// A query under construction.
pub struct Query<'s, S: ConnectionSource> {
    session: &'s mut Session<S>,
    table: Arc<Table>,
    select: Select,
}

impl<S: ConnectionSource> std::fmt::Debug for Query<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("table", &self.table.name())
            .field("select", &self.select)
            .finish_non_exhaustive()
    }
}

impl<'s, S: ConnectionSource> Query<'s, S> {
    pub(crate) fn new(session: &'s mut Session<S>, table: Arc<Table>) -> Self {
        let select = Select::from(table.name());
        Self {
            session,
            table,
            select,
        }
    }

    /// Keep rows whose `column` equals `value`.
    pub fn filter_by(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.select = self.select.filter(Predicate::eq(column, value));
        self
    }

    /// Keep rows whose `column` is one of `values`.
    pub fn filter_in<I, V>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.select = self.select.filter(Predicate::is_in(column, values));
        self
    }

    pub fn order_by(mut self, column: &str) -> Self {
        self.select = self.select.order_by(column, false);
        self
    }

    pub fn order_by_desc(mut self, column: &str) -> Self {
        self.select = self.select.order_by(column, true);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.select = self.select.limit(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.select = self.select.offset(offset);
        self
    }

    /// The SELECT this query would run.
    pub fn statement(&self) -> Statement {
        Statement::Select(self.select.clone())
    }

    fn check_columns(&self) -> Result<()> {
        let named = self
            .select
            .predicates
            .iter()
            .map(Predicate::column)
            .chain(self.select.order_by.iter().map(|o| o.column.as_str()));
        for column in named {
            if !self.table.has_column(column) {
                return Err(Error::schema(
                    SchemaErrorKind::ColumnNotFound,
                    format!("table '{}' has no column '{}'", self.table.name(), column),
                ));
            }
        }
        Ok(())
    }

    /// Every matching instance.
    pub fn all(self) -> Result<Vec<Instance>> {
        self.check_columns()?;
        self.session.select_instances(&self.table, self.select)
    }

    /// The first matching instance, fetched with `LIMIT 1`.
    pub fn first(self) -> Result<Option<Instance>> {
        self.check_columns()?;
        let select = self.select.limit(1);
        let found = self.session.select_instances(&self.table, select)?;
        Ok(found.into_iter().next())
    }

    /// Exactly one matching instance.
    ///
    /// # Errors
    ///
    /// [`Error::NoResult`] when nothing matches, [`Error::MultipleResults`]
    /// when more than one row does.
    pub fn one(self) -> Result<Instance> {
        let table = self.table.name().to_string();
        self.one_or_none()?.ok_or(Error::NoResult { table })
    }

    /// At most one matching instance.
    ///
    /// # Errors
    ///
    /// [`Error::MultipleResults`] when more than one row matches.
    pub fn one_or_none(self) -> Result<Option<Instance>> {
        let table = self.table.name().to_string();
        let mut found = self.all()?;
        match found.len() {
            0 => Ok(None),
            1 => Ok(found.pop()),
            count => Err(Error::MultipleResults { table, count }),
        }
    }

    /// Number of matching rows.
    pub fn count(self) -> Result<u64> {
        self.check_columns()?;
        self.session.select_count(self.select)
    }
}
