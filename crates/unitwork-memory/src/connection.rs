//! Connections to a [`MemoryEngine`](crate::MemoryEngine).

use crate::change::Change;
use crate::engine::Shared;
use std::sync::Arc;
use unitwork_core::{
    Connection, Error, ExecResult, Result, Row, Statement, TransactionErrorKind,
};

/// One connection to an in-memory database.
///
/// Outside a transaction every statement commits on its own. Inside one,
/// writes land in the shared tables at once and are logged so that
/// [`Connection::rollback`] can reverse them. Dropping a connection with an
/// open transaction rolls it back.
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    undo: Option<Vec<Change>>,
}

impl MemoryConnection {
    pub(crate) fn new(id: u64, shared: Arc<Shared>) -> Self {
        tracing::debug!(connection = id, "Opened memory connection");
        Self {
            id,
            shared,
            undo: None,
        }
    }

    /// Connection number, unique per engine.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn log(&self, sql: &str) {
        self.shared.echo(self.id, sql);
    }

    fn record(&mut self, changes: impl IntoIterator<Item = Change>) {
        if let Some(undo) = self.undo.as_mut() {
            undo.extend(changes);
        }
    }
}

impl Connection for MemoryConnection {
    fn execute(&mut self, stmt: &Statement) -> Result<ExecResult> {
        let sql = stmt.to_sql();
        self.log(&sql);
        tracing::trace!(connection = self.id, sql = %sql, "Executing");

        let mut db = self.shared.lock();
        let (result, changes) = match stmt {
            Statement::CreateTable(table) => {
                let change = db.create_table(table, &sql)?;
                (ExecResult::affected(0), vec![change])
            }
            Statement::Insert {
                table,
                columns,
                values,
            } => {
                let (result, change) = db.insert(table, columns, values, &sql)?;
                (result, vec![change])
            }
            Statement::Update {
                table,
                assignments,
                predicates,
            } => db.update(table, assignments, predicates, &sql)?,
            Statement::Delete { table, predicates } => db.delete(table, predicates, &sql)?,
            Statement::Select(_) => {
                return Err(Error::Custom(format!(
                    "execute() called with a SELECT; use query() [SQL: {}]",
                    sql
                )));
            }
        };
        drop(db);

        self.record(changes);
        Ok(result)
    }

    fn query(&mut self, stmt: &Statement) -> Result<Vec<Row>> {
        let sql = stmt.to_sql();
        self.log(&sql);
        tracing::trace!(connection = self.id, sql = %sql, "Querying");

        let Statement::Select(select) = stmt else {
            return Err(Error::Custom(format!(
                "query() called with a {} statement; use execute() [SQL: {}]",
                stmt.verb(),
                sql
            )));
        };
        self.shared.lock().select(select, &sql)
    }

    fn begin(&mut self) -> Result<()> {
        if self.undo.is_some() {
            return Err(Error::transaction(
                TransactionErrorKind::AlreadyActive,
                "a transaction is already open on this connection",
            ));
        }
        self.log("BEGIN");
        self.undo = Some(Vec::new());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let Some(undo) = self.undo.take() else {
            return Err(Error::transaction(
                TransactionErrorKind::NotActive,
                "commit without an open transaction",
            ));
        };
        self.log("COMMIT");
        tracing::debug!(connection = self.id, changes = undo.len(), "Committed");
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        let Some(undo) = self.undo.take() else {
            return Err(Error::transaction(
                TransactionErrorKind::NotActive,
                "rollback without an open transaction",
            ));
        };
        self.log("ROLLBACK");
        let reverted = undo.len();
        let mut db = self.shared.lock();
        for change in undo.into_iter().rev() {
            tracing::trace!(table = change.table_name(), "Reverting change");
            db.undo(change);
        }
        tracing::debug!(connection = self.id, reverted, "Rolled back");
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.undo.is_some()
    }

    fn has_table(&mut self, name: &str) -> Result<bool> {
        Ok(self.shared.lock().has_table(name))
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.undo.is_some() {
            tracing::warn!(
                connection = self.id,
                "Connection dropped with an open transaction; rolling back"
            );
            // rollback() only fails when no transaction is open
            let _ = self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryEngine;
    use unitwork_core::{Column, ConnectionSource, MetaData, Predicate, Select, SqlType, Table};

    fn engine() -> MemoryEngine {
        let engine = MemoryEngine::with_echo();
        let mut md = MetaData::new();
        md.add_table(
            Table::builder("user")
                .column(Column::new("id", SqlType::Integer).primary_key())
                .column(Column::new("name", SqlType::Text))
                .build()
                .unwrap(),
        )
        .unwrap();
        let mut conn = engine.connect().unwrap();
        md.create_all(&mut conn).unwrap();
        engine.clear_echo_log();
        engine
    }

    fn insert_user(conn: &mut MemoryConnection, name: &str) -> i64 {
        conn.execute(&Statement::Insert {
            table: "user".into(),
            columns: vec!["name".into()],
            values: vec![name.into()],
        })
        .unwrap()
        .last_insert_id
        .unwrap()
    }

    #[test]
    fn test_autocommit_outside_transaction() {
        let engine = engine();
        let mut conn = engine.connect().unwrap();
        insert_user(&mut conn, "ed");
        drop(conn);
        assert_eq!(engine.row_count("user"), Some(1));
    }

    #[test]
    fn test_rollback_reverts_writes() {
        let engine = engine();
        let mut conn = engine.connect().unwrap();
        let id = insert_user(&mut conn, "ed");

        conn.begin().unwrap();
        insert_user(&mut conn, "wendy");
        conn.execute(&Statement::Update {
            table: "user".into(),
            assignments: vec![("name".into(), "eddie".into())],
            predicates: vec![Predicate::eq("id", id)],
        })
        .unwrap();
        conn.rollback().unwrap();

        let rows = conn.query(&Statement::Select(Select::from("user"))).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_named::<String>("name").unwrap(), "ed");
    }

    #[test]
    fn test_drop_with_open_transaction_rolls_back() {
        let engine = engine();
        let mut conn = engine.connect().unwrap();
        conn.begin().unwrap();
        insert_user(&mut conn, "ed");
        assert_eq!(engine.row_count("user"), Some(1));
        drop(conn);
        assert_eq!(engine.row_count("user"), Some(0));
    }

    #[test]
    fn test_transaction_state_errors() {
        let engine = engine();
        let mut conn = engine.connect().unwrap();
        assert!(conn.commit().is_err());
        conn.begin().unwrap();
        assert!(conn.in_transaction());
        assert!(conn.begin().is_err());
        conn.commit().unwrap();
        assert!(!conn.in_transaction());
    }

    #[test]
    fn test_echo_log_records_statements() {
        let engine = engine();
        let mut conn = engine.connect().unwrap();
        conn.begin().unwrap();
        insert_user(&mut conn, "ed");
        conn.commit().unwrap();
        assert_eq!(
            engine.echo_log(),
            vec![
                "BEGIN".to_string(),
                "INSERT INTO \"user\" (\"name\") VALUES ($1)".to_string(),
                "COMMIT".to_string(),
            ]
        );
    }

    #[test]
    fn test_create_all_is_idempotent() {
        let engine = engine();
        let mut md = MetaData::new();
        md.add_table(
            Table::builder("user")
                .column(Column::new("id", SqlType::Integer).primary_key())
                .build()
                .unwrap(),
        )
        .unwrap();
        let mut conn = engine.connect().unwrap();
        assert_eq!(md.create_all(&mut conn).unwrap(), 0);
        assert_eq!(engine.table_names(), vec!["user".to_string()]);
    }

    #[test]
    fn test_wrong_entry_point() {
        let engine = engine();
        let mut conn = engine.connect().unwrap();
        assert!(conn.execute(&Statement::Select(Select::from("user"))).is_err());
        assert!(
            conn.query(&Statement::Delete {
                table: "user".into(),
                predicates: vec![],
            })
            .is_err()
        );
    }
}
