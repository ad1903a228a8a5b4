//! Table storage and constraint enforcement.

use crate::change::Change;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use unitwork_core::{
    ColumnInfo, Error, ExecResult, Predicate, QueryError, QueryErrorKind, Result, Row, Select,
    Table, Value,
};

fn query_error(kind: QueryErrorKind, message: String, sql: &str) -> Error {
    Error::Query(QueryError {
        kind,
        sql: Some(sql.to_string()),
        message,
        source: None,
    })
}

fn constraint(message: String, sql: &str) -> Error {
    Error::constraint(message, Some(sql.to_string()))
}

/// Rows of one table, keyed by an internal rowid that preserves insert order.
#[derive(Debug)]
pub(crate) struct StoredTable {
    schema: Arc<Table>,
    columns: Arc<ColumnInfo>,
    rows: BTreeMap<u64, Vec<Value>>,
    next_rowid: u64,
}

impl StoredTable {
    fn new(schema: Arc<Table>) -> Self {
        let columns = Arc::new(ColumnInfo::new(
            schema.column_names().map(str::to_string).collect(),
        ));
        Self {
            schema,
            columns,
            rows: BTreeMap::new(),
            next_rowid: 1,
        }
    }

    fn col_index(&self, name: &str, sql: &str) -> Result<usize> {
        self.columns.index_of(name).ok_or_else(|| {
            query_error(
                QueryErrorKind::NotFound,
                format!("no such column: {}.{}", self.schema.name(), name),
                sql,
            )
        })
    }

    fn matching(&self, predicates: &[Predicate], sql: &str) -> Result<Vec<u64>> {
        let mut resolved = Vec::with_capacity(predicates.len());
        for p in predicates {
            resolved.push((self.col_index(p.column(), sql)?, p));
        }
        Ok(self
            .rows
            .iter()
            .filter(|(_, row)| resolved.iter().all(|(i, p)| p.matches(&row[*i])))
            .map(|(id, _)| *id)
            .collect())
    }

    fn pk_of(&self, row: &[Value]) -> Vec<Value> {
        self.schema
            .primary_key()
            .iter()
            .filter_map(|c| self.columns.index_of(c))
            .map(|i| row[i].clone())
            .collect()
    }

    // Next rowid for an autoincrement key: one past the largest stored value.
    fn next_key(&self, idx: usize, sql: &str) -> Result<i64> {
        let Some(max) = self.rows.values().filter_map(|r| r[idx].as_i64()).max() else {
            return Ok(1);
        };
        max.checked_add(1).ok_or_else(|| {
            query_error(
                QueryErrorKind::Database,
                format!("autoincrement key of {} is exhausted", self.schema.name()),
                sql,
            )
        })
    }

    fn check_row(&self, row: &[Value], sql: &str) -> Result<()> {
        for (col, value) in self.schema.columns().iter().zip(row) {
            if value.is_null() && !col.is_nullable() {
                return Err(constraint(
                    format!(
                        "NOT NULL constraint failed: {}.{}",
                        self.schema.name(),
                        col.name()
                    ),
                    sql,
                ));
            }
            if !col.sql_type().accepts(value) {
                return Err(query_error(
                    QueryErrorKind::Database,
                    format!(
                        "datatype mismatch: {}.{} is {} but got {}",
                        self.schema.name(),
                        col.name(),
                        col.sql_type().sql_name(),
                        value.type_name()
                    ),
                    sql,
                ));
            }
        }
        Ok(())
    }

    fn unique_violation(&self, sql: &str) -> Error {
        constraint(
            format!(
                "UNIQUE constraint failed: {}",
                self.schema
                    .primary_key()
                    .iter()
                    .map(|c| format!("{}.{}", self.schema.name(), c))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            sql,
        )
    }
}

/// Every table of one in-memory database.
#[derive(Debug, Default)]
pub(crate) struct Database {
    tables: HashMap<String, StoredTable>,
}

impl Database {
    pub(crate) fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub(crate) fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn row_count(&self, name: &str) -> Option<usize> {
        self.tables.get(name).map(|t| t.rows.len())
    }

    fn table(&self, name: &str, sql: &str) -> Result<&StoredTable> {
        self.tables.get(name).ok_or_else(|| {
            query_error(
                QueryErrorKind::NotFound,
                format!("no such table: {}", name),
                sql,
            )
        })
    }

    fn table_mut(&mut self, name: &str, sql: &str) -> Result<&mut StoredTable> {
        self.tables.get_mut(name).ok_or_else(|| {
            query_error(
                QueryErrorKind::NotFound,
                format!("no such table: {}", name),
                sql,
            )
        })
    }

    pub(crate) fn create_table(&mut self, schema: &Arc<Table>, sql: &str) -> Result<Change> {
        if self.tables.contains_key(schema.name()) {
            return Err(query_error(
                QueryErrorKind::Database,
                format!("table {} already exists", schema.name()),
                sql,
            ));
        }
        self.tables.insert(
            schema.name().to_string(),
            StoredTable::new(Arc::clone(schema)),
        );
        Ok(Change::CreateTable {
            name: schema.name().to_string(),
        })
    }

    /// Foreign-key values in `row` must exist in the referenced tables.
    fn check_references(
        &self,
        table: &StoredTable,
        row: &[Value],
        only: Option<&HashSet<usize>>,
        sql: &str,
    ) -> Result<()> {
        for (idx, col) in table.schema.columns().iter().enumerate() {
            let Some(fk) = col.references() else {
                continue;
            };
            if only.is_some_and(|set| !set.contains(&idx)) || row[idx].is_null() {
                continue;
            }
            let parent = self.table(&fk.table, sql)?;
            let parent_idx = parent.col_index(&fk.column, sql)?;
            let self_match = fk.table == table.schema.name() && row[parent_idx] == row[idx];
            if !self_match && !parent.rows.values().any(|r| r[parent_idx] == row[idx]) {
                return Err(constraint(
                    format!(
                        "FOREIGN KEY constraint failed: {}.{} references missing {} = {}",
                        table.schema.name(),
                        col.name(),
                        fk,
                        row[idx]
                    ),
                    sql,
                ));
            }
        }
        Ok(())
    }

    /// Fails if any row elsewhere still references `row` of `table`.
    ///
    /// Rows listed in `ignoring` (same table) are about to disappear and do
    /// not count.
    fn check_not_referenced(
        &self,
        table: &StoredTable,
        row: &[Value],
        ignoring: &HashSet<u64>,
        sql: &str,
    ) -> Result<()> {
        let name = table.schema.name();
        for child in self.tables.values() {
            for (child_idx, col) in child.schema.columns().iter().enumerate() {
                let Some(fk) = col.references() else {
                    continue;
                };
                if fk.table != name {
                    continue;
                }
                let Some(parent_idx) = table.columns.index_of(&fk.column) else {
                    continue;
                };
                let value = &row[parent_idx];
                if value.is_null() {
                    continue;
                }
                let same_table = child.schema.name() == name;
                let referenced = child.rows.iter().any(|(id, r)| {
                    !(same_table && ignoring.contains(id)) && &r[child_idx] == value
                });
                if referenced {
                    return Err(constraint(
                        format!(
                            "FOREIGN KEY constraint failed: {} = {} is still referenced by {}.{}",
                            fk,
                            value,
                            child.schema.name(),
                            col.name()
                        ),
                        sql,
                    ));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn insert(
        &mut self,
        name: &str,
        columns: &[String],
        values: &[Value],
        sql: &str,
    ) -> Result<(ExecResult, Change)> {
        let table = self.table(name, sql)?;
        if columns.len() != values.len() {
            return Err(query_error(
                QueryErrorKind::Database,
                format!(
                    "{} values for {} columns",
                    values.len(),
                    columns.len()
                ),
                sql,
            ));
        }

        let mut row = vec![Value::Null; table.columns.len()];
        for (col, value) in columns.iter().zip(values) {
            row[table.col_index(col, sql)?] = value.clone();
        }

        let mut generated = None;
        if let Some(auto) = table.schema.autoincrement_column() {
            let idx = table.col_index(auto.name(), sql)?;
            if row[idx].is_null() {
                let key = table.next_key(idx, sql)?;
                row[idx] = Value::BigInt(key);
                generated = Some(key);
            }
        }

        table.check_row(&row, sql)?;
        let pk = table.pk_of(&row);
        if table.rows.values().any(|r| table.pk_of(r) == pk) {
            return Err(table.unique_violation(sql));
        }
        self.check_references(table, &row, None, sql)?;

        let table = self.table_mut(name, sql)?;
        let rowid = table.next_rowid;
        table.next_rowid += 1;
        table.rows.insert(rowid, row);

        Ok((
            ExecResult {
                rows_affected: 1,
                last_insert_id: generated,
            },
            Change::InsertRow {
                table: name.to_string(),
                rowid,
            },
        ))
    }

    pub(crate) fn update(
        &mut self,
        name: &str,
        assignments: &[(String, Value)],
        predicates: &[Predicate],
        sql: &str,
    ) -> Result<(ExecResult, Vec<Change>)> {
        let table = self.table(name, sql)?;
        let mut targets = Vec::with_capacity(assignments.len());
        for (col, value) in assignments {
            targets.push((table.col_index(col, sql)?, value));
        }
        let touched: HashSet<usize> = targets.iter().map(|(i, _)| *i).collect();
        let pk_touched = table
            .schema
            .primary_key()
            .iter()
            .filter_map(|c| table.columns.index_of(c))
            .any(|i| touched.contains(&i));

        let ids = table.matching(predicates, sql)?;
        let id_set: HashSet<u64> = ids.iter().copied().collect();
        let mut updates = Vec::with_capacity(ids.len());
        let mut new_keys = HashSet::new();

        for id in &ids {
            let old_row = &table.rows[id];
            let mut new_row = old_row.clone();
            for (idx, value) in &targets {
                new_row[*idx] = (*value).clone();
            }
            table.check_row(&new_row, sql)?;
            self.check_references(table, &new_row, Some(&touched), sql)?;

            if pk_touched {
                let old_pk = table.pk_of(old_row);
                let new_pk = table.pk_of(&new_row);
                if old_pk != new_pk {
                    self.check_not_referenced(table, old_row, &id_set, sql)?;
                }
                let clash = table
                    .rows
                    .iter()
                    .any(|(other, r)| !id_set.contains(other) && table.pk_of(r) == new_pk);
                if clash || !new_keys.insert(new_pk) {
                    return Err(table.unique_violation(sql));
                }
            }
            updates.push((*id, new_row));
        }

        let table = self.table_mut(name, sql)?;
        let mut changes = Vec::with_capacity(updates.len());
        for (id, new_row) in updates {
            if let Some(old_row) = table.rows.insert(id, new_row) {
                changes.push(Change::UpdateRow {
                    table: name.to_string(),
                    rowid: id,
                    old_row,
                });
            }
        }

        Ok((ExecResult::affected(changes.len() as u64), changes))
    }

    pub(crate) fn delete(
        &mut self,
        name: &str,
        predicates: &[Predicate],
        sql: &str,
    ) -> Result<(ExecResult, Vec<Change>)> {
        let table = self.table(name, sql)?;
        let ids = table.matching(predicates, sql)?;
        let id_set: HashSet<u64> = ids.iter().copied().collect();
        for id in &ids {
            self.check_not_referenced(table, &table.rows[id], &id_set, sql)?;
        }

        let table = self.table_mut(name, sql)?;
        let mut changes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(old_row) = table.rows.remove(&id) {
                changes.push(Change::DeleteRow {
                    table: name.to_string(),
                    rowid: id,
                    old_row,
                });
            }
        }

        Ok((ExecResult::affected(changes.len() as u64), changes))
    }

    pub(crate) fn select(&self, select: &Select, sql: &str) -> Result<Vec<Row>> {
        let table = self.table(&select.table, sql)?;
        let ids = table.matching(&select.predicates, sql)?;
        let mut rows: Vec<&Vec<Value>> = ids.iter().map(|id| &table.rows[id]).collect();

        if !select.order_by.is_empty() {
            let mut keys = Vec::with_capacity(select.order_by.len());
            for term in &select.order_by {
                keys.push((table.col_index(&term.column, sql)?, term.descending));
            }
            rows.sort_by(|a, b| {
                keys.iter()
                    .map(|(i, desc)| {
                        let ord = a[*i].sort_cmp(&b[*i]);
                        if *desc { ord.reverse() } else { ord }
                    })
                    .find(|o| o.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        let offset = usize::try_from(select.offset.unwrap_or(0)).unwrap_or(usize::MAX);
        let limit = select
            .limit
            .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        let page = rows.into_iter().skip(offset).take(limit);

        if select.count_only {
            let count = page.count();
            return Ok(vec![Row::new(
                vec!["count".to_string()],
                vec![Value::BigInt(count as i64)],
            )]);
        }

        Ok(page
            .map(|r| Row::with_columns(Arc::clone(&table.columns), r.clone()))
            .collect())
    }

    /// Reverse one logged change.
    pub(crate) fn undo(&mut self, change: Change) {
        match change {
            Change::InsertRow { table, rowid } => {
                if let Some(t) = self.tables.get_mut(&table) {
                    t.rows.remove(&rowid);
                }
            }
            Change::UpdateRow {
                table,
                rowid,
                old_row,
            }
            | Change::DeleteRow {
                table,
                rowid,
                old_row,
            } => {
                if let Some(t) = self.tables.get_mut(&table) {
                    t.rows.insert(rowid, old_row);
                }
            }
            Change::CreateTable { name } => {
                self.tables.remove(&name);
            }
        }
    }
}
