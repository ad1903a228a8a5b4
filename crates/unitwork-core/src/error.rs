//! Error types for unitwork operations.

use std::fmt;

/// The primary error type for all unitwork operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (acquire, release, closed store)
    Connection(ConnectionError),
    /// Statement execution errors reported by the store
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Schema/metadata errors
    Schema(SchemaError),
    /// Configuration errors
    Config(ConfigError),
    /// A different instance with the same identity key is already tracked.
    IdentityConflict {
        /// Rendered identity key, e.g. `user(1)`.
        key: String,
    },
    /// The instance is not owned by a session (or not by this one).
    DetachedInstance {
        /// Table of the instance.
        table: String,
        /// Why the operation was refused.
        message: String,
    },
    /// The instance belongs to a different session.
    ForeignSession {
        /// Table of the instance.
        table: String,
        /// Session that owns the instance.
        owner: u64,
        /// Session the operation was attempted on.
        current: u64,
    },
    /// Flush could not complete.
    Flush(FlushError),
    /// An expired instance's row no longer exists in the store.
    StaleRow {
        /// Rendered identity key of the vanished row.
        key: String,
    },
    /// A single-row query found no rows.
    NoResult {
        /// Table that was queried.
        table: String,
    },
    /// A single-row query found more than one row.
    MultipleResults {
        /// Table that was queried.
        table: String,
        /// Number of rows found.
        count: usize,
    },
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// The connection was already released
    Closed,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (not null, unique, foreign key)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Statement shape not supported by the store
    Unsupported,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// `begin` while a transaction is open
    AlreadyActive,
    /// `commit`/`rollback` without a transaction
    NotActive,
    /// A previous flush failed; only rollback is allowed
    Inactive,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Table already exists
    TableExists,
    /// Table not found
    TableNotFound,
    /// Column not found
    ColumnNotFound,
    /// Relationship not found
    RelationshipNotFound,
    /// Invalid schema definition
    Invalid,
    /// Tables reference each other in a cycle
    DependencyCycle,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Why a flush failed.
#[derive(Debug)]
pub struct FlushError {
    pub kind: FlushErrorKind,
    pub message: String,
    pub source: Option<Box<Error>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushErrorKind {
    /// Pending rows depend on each other in a cycle; nothing was sent.
    DependencyCycle,
    /// The store rejected a statement; the transaction must be rolled back.
    StoreRejected,
}

impl Error {
    /// Build a schema error.
    pub fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError {
            kind,
            message: message.into(),
        })
    }

    /// Build a transaction error.
    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
        })
    }

    /// Build a constraint violation raised by a store.
    pub fn constraint(message: impl Into<String>, sql: Option<String>) -> Self {
        Error::Query(QueryError {
            kind: QueryErrorKind::Constraint,
            sql,
            message: message.into(),
            source: None,
        })
    }

    /// Build a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    /// Is this a constraint violation reported by the store?
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            Error::Query(q) => q.kind == QueryErrorKind::Constraint,
            Error::Flush(f) => f.source.as_deref().is_some_and(Error::is_constraint_violation),
            _ => false,
        }
    }

    /// The flush failure kind, if this is a flush error.
    pub fn flush_kind(&self) -> Option<FlushErrorKind> {
        match self {
            Error::Flush(f) => Some(f.kind),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::Flush(f) => f.source.as_deref().and_then(Error::sql),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sql) = &e.sql {
                    write!(f, "Query error: {} [SQL: {}]", e.message, sql)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::IdentityConflict { key } => write!(
                f,
                "Identity conflict: another instance with key {} is already present in this session",
                key
            ),
            Error::DetachedInstance { table, message } => {
                write!(f, "Instance of '{}' is detached: {}", table, message)
            }
            Error::ForeignSession {
                table,
                owner,
                current,
            } => write!(
                f,
                "Instance of '{}' is already attached to session {} (this is {})",
                table, owner, current
            ),
            Error::Flush(e) => match e.kind {
                FlushErrorKind::DependencyCycle => {
                    write!(f, "Flush error: dependency cycle: {}", e.message)
                }
                FlushErrorKind::StoreRejected => {
                    write!(f, "Flush error: store rejected statement: {}", e.message)
                }
            },
            Error::StaleRow { key } => write!(
                f,
                "Stale row: instance {} is no longer present in the store",
                key
            ),
            Error::NoResult { table } => write!(f, "No row was found for one() on '{}'", table),
            Error::MultipleResults { table, count } => write!(
                f,
                "Multiple rows were found for one() on '{}': expected one row, found {}",
                table, count
            ),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Flush(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for unitwork operations.
pub type Result<T> = std::result::Result<T, Error>;
