//! The in-memory engine: shared tables plus an optional statement echo log.

use crate::connection::MemoryConnection;
use crate::storage::Database;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use unitwork_core::{ConnectionSource, Result};

/// State shared by an engine and all of its connections.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    db: Mutex<Database>,
    echo: Option<Mutex<Vec<String>>>,
    next_connection: AtomicU64,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn echo(&self, connection: u64, sql: &str) {
        if let Some(log) = &self.echo {
            tracing::info!(target: "unitwork_memory::echo", connection, "{}", sql);
            log.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(sql.to_string());
        }
    }
}

/// An in-memory database that hands out [`MemoryConnection`]s.
///
/// Cloning is cheap; clones share the same tables.
///
/// ```
/// use unitwork_core::{Column, Connection, ConnectionSource, MetaData, SqlType, Table};
/// use unitwork_memory::MemoryEngine;
///
/// let engine = MemoryEngine::new();
/// let mut metadata = MetaData::new();
/// metadata
///     .add_table(
///         Table::builder("user")
///             .column(Column::new("id", SqlType::Integer).primary_key())
///             .build()
///             .unwrap(),
///     )
///     .unwrap();
///
/// let mut conn = engine.connect().unwrap();
/// metadata.create_all(&mut conn).unwrap();
/// assert!(conn.has_table("user").unwrap());
/// ```
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// An empty database without an echo log.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
        }
    }

    /// An empty database that records every statement it runs.
    pub fn with_echo() -> Self {
        Self {
            shared: Arc::new(Shared {
                echo: Some(Mutex::new(Vec::new())),
                ..Shared::default()
            }),
        }
    }

    /// Is the echo log enabled?
    pub fn echo_enabled(&self) -> bool {
        self.shared.echo.is_some()
    }

    /// Statements run so far (SQL text plus BEGIN/COMMIT/ROLLBACK), oldest
    /// first. Empty when echo is off.
    pub fn echo_log(&self) -> Vec<String> {
        self.shared.echo.as_ref().map_or_else(Vec::new, |log| {
            log.lock().unwrap_or_else(PoisonError::into_inner).clone()
        })
    }

    /// Forget the statements logged so far.
    pub fn clear_echo_log(&self) {
        if let Some(log) = &self.shared.echo {
            log.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }
    }

    /// Names of the tables created so far, sorted.
    pub fn table_names(&self) -> Vec<String> {
        self.shared.lock().table_names()
    }

    /// Number of rows currently stored in a table (including uncommitted
    /// writes of open transactions).
    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.shared.lock().row_count(table)
    }
}

impl ConnectionSource for MemoryEngine {
    type Connection = MemoryConnection;

    fn connect(&self) -> Result<MemoryConnection> {
        let id = self.shared.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(MemoryConnection::new(id, Arc::clone(&self.shared)))
    }
}
