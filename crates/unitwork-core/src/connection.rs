//! Store connection traits.
//!
//! - [`Connection`] - executes [`Statement`]s and manages one transaction
//! - [`ConnectionSource`] - hands out connections (an engine or a pool)
//!
//! Connections are synchronous and blocking. A session owns at most one
//! connection at a time and drops it when its transaction ends.

use crate::error::Result;
use crate::row::Row;
use crate::statement::Statement;

/// Outcome of a write statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Rows inserted, updated or deleted.
    pub rows_affected: u64,
    /// Key generated for an autoincrement column by an INSERT.
    pub last_insert_id: Option<i64>,
}

impl ExecResult {
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            last_insert_id: None,
        }
    }
}

/// A connection to a store.
pub trait Connection {
    /// Execute a write or DDL statement.
    #[allow(clippy::result_large_err)]
    fn execute(&mut self, stmt: &Statement) -> Result<ExecResult>;

    /// Execute a SELECT and return every row.
    #[allow(clippy::result_large_err)]
    fn query(&mut self, stmt: &Statement) -> Result<Vec<Row>>;

    /// Execute a SELECT and return the first row, if any.
    #[allow(clippy::result_large_err)]
    fn query_one(&mut self, stmt: &Statement) -> Result<Option<Row>> {
        Ok(self.query(stmt)?.into_iter().next())
    }

    /// Start a transaction.
    #[allow(clippy::result_large_err)]
    fn begin(&mut self) -> Result<()>;

    /// Commit the open transaction.
    #[allow(clippy::result_large_err)]
    fn commit(&mut self) -> Result<()>;

    /// Roll back the open transaction.
    #[allow(clippy::result_large_err)]
    fn rollback(&mut self) -> Result<()>;

    /// Is a transaction open on this connection?
    fn in_transaction(&self) -> bool;

    /// Does the store already have this table?
    #[allow(clippy::result_large_err)]
    fn has_table(&mut self, name: &str) -> Result<bool>;
}

/// Something that can open connections: an engine or a pool.
pub trait ConnectionSource {
    type Connection: Connection;

    /// Open (or check out) a connection.
    #[allow(clippy::result_large_err)]
    fn connect(&self) -> Result<Self::Connection>;
}
