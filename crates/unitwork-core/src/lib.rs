//! Core types and traits for unitwork.
//!
//! This crate provides the pieces every other unitwork crate builds on:
//!
//! - [`Value`] and [`Row`] for data moving between instances and stores
//! - [`Table`], [`Column`], [`Relationship`] and [`MetaData`] for schema
//! - [`Statement`] for the structured writes and reads a session issues
//! - [`Connection`] and [`ConnectionSource`] for stores
//! - [`Error`] for everything that can go wrong

pub mod connection;
pub mod error;
pub mod field;
pub mod identifiers;
pub mod model;
pub mod relationship;
pub mod row;
pub mod statement;
pub mod table;
pub mod types;
pub mod value;

pub use connection::{Connection, ConnectionSource, ExecResult};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, FlushError, FlushErrorKind,
    QueryError, QueryErrorKind, Result, SchemaError, SchemaErrorKind, TransactionError,
    TransactionErrorKind, TypeError,
};
pub use field::{Column, ForeignKeyRef};
pub use identifiers::{is_valid_identifier, quote_ident};
pub use model::Model;
pub use relationship::{Cascade, Relationship, RelationshipKind};
pub use row::{ColumnInfo, FromValue, Row};
pub use statement::{OrderBy, Predicate, Select, Statement};
pub use table::{MetaData, Table, TableBuilder};
pub use types::SqlType;
pub use value::Value;
