//! In-memory store driver for unitwork.
//!
//! [`MemoryEngine`] keeps tables in process memory and implements
//! [`ConnectionSource`](unitwork_core::ConnectionSource). Its connections
//! enforce NOT NULL, primary-key uniqueness and foreign-key integrity,
//! generate keys for autoincrement columns and support transactions through
//! an undo log. Writes made inside a transaction are visible to other
//! connections before commit.

mod change;
pub mod connection;
pub mod engine;
mod storage;

pub use connection::MemoryConnection;
pub use engine::MemoryEngine;
