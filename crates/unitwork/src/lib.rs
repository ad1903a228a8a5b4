//! unitwork - a unit-of-work session core.
//!
//! A [`Session`] tracks the instances an application loads and creates,
//! guarantees one in-memory instance per primary key, and writes pending
//! changes back in dependency order when flushed or committed:
//!
//! - Identity map: `get` twice, get the same handle
//! - Change tracking: only modified columns reach the UPDATE
//! - Cascades: `add` and `delete` follow relationships that opt in
//! - Transactions: `commit` expires everything, `rollback` restores it
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use unitwork::prelude::*;
//!
//! let mut metadata = MetaData::new();
//! let user = metadata
//!     .add_table(
//!         Table::builder("user")
//!             .column(Column::new("id", SqlType::Integer).primary_key())
//!             .column(Column::new("name", SqlType::Text))
//!             .relationship(
//!                 Relationship::one_to_many("addresses", "address", "user_id")
//!                     .cascade(Cascade::ALL),
//!             )
//!             .build()
//!             .unwrap(),
//!     )
//!     .unwrap();
//! let address = metadata
//!     .add_table(
//!         Table::builder("address")
//!             .column(Column::new("id", SqlType::Integer).primary_key())
//!             .column(Column::new("email", SqlType::Text))
//!             .column(Column::new("user_id", SqlType::Integer).foreign_key("user.id"))
//!             .build()
//!             .unwrap(),
//!     )
//!     .unwrap();
//!
//! let engine = create_engine("memory://").unwrap();
//! engine.create_all(&metadata).unwrap();
//! let mut session = engine.session(Arc::new(metadata));
//!
//! let ed = Instance::with_values(&user, [("name", "ed")]).unwrap();
//! let home = Instance::with_values(&address, [("email", "ed@home")]).unwrap();
//! ed.append("addresses", &home).unwrap();
//! session.add(&ed).unwrap();
//! session.commit().unwrap();
//!
//! assert_eq!(engine.row_count("address"), Some(1));
//!
//! // Committed instances are expired; reading reloads them.
//! assert!(home.get("user_id").is_none());
//! let owner = session.read(&home, "user_id").unwrap();
//! assert_eq!(owner, session.read(&ed, "id").unwrap());
//! ```

pub mod engine;
pub mod session;

pub use engine::{Engine, EngineConfig, create_engine};
pub use session::{Session, SessionBuilder};

pub use unitwork_core::{
    Cascade, Column, Connection, ConnectionSource, Error, ExecResult, FlushError,
    FlushErrorKind, MetaData, Model, Predicate, QueryError, QueryErrorKind, Relationship,
    RelationshipKind, Result, Row, SchemaError, SchemaErrorKind, Select, SqlType, Statement,
    Table, TransactionError, TransactionErrorKind, Value,
};
pub use unitwork_memory::{MemoryConnection, MemoryEngine};
pub use unitwork_session::{
    FlushResult, IdentityKey, IdentityMap, Instance, InstanceId, InstanceState, Query, Related,
    SessionConfig, SessionEvent, SessionId, SessionState,
};

/// Everything an application usually needs.
///
/// ```
/// use unitwork::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Schema
        Cascade,
        Column,
        // Engines
        Engine,
        EngineConfig,
        // Errors
        Error,
        FlushErrorKind,
        // Instances
        Instance,
        InstanceState,
        MetaData,
        Model,
        Related,
        Relationship,
        Result,
        // Sessions
        Session,
        SessionBuilder,
        SessionConfig,
        SessionState,
        SqlType,
        Table,
        Value,
        create_engine,
    };
}
