//! Structured statements handed to a [`Connection`](crate::Connection).
//!
//! The session never builds SQL strings. It builds [`Statement`] values,
//! which stores may interpret directly (the memory store does) or render
//! with [`Statement::to_sql`] and [`Statement::params`].

use crate::identifiers::quote_ident;
use crate::table::Table;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// A WHERE-clause condition. Conditions in a list are ANDed.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `column = value`; a NULL value renders as `column IS NULL`.
    Eq(String, Value),
    /// `column IN (values)`; an empty list matches nothing.
    In(String, Vec<Value>),
}

impl Predicate {
    /// Equality predicate.
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Eq(column.into(), value.into())
    }

    /// Membership predicate.
    pub fn is_in(column: impl Into<String>, values: Vec<Value>) -> Self {
        Predicate::In(column.into(), values)
    }

    pub fn column(&self) -> &str {
        match self {
            Predicate::Eq(c, _) | Predicate::In(c, _) => c,
        }
    }

    /// Whether a stored value satisfies this predicate.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Predicate::Eq(_, expected) => value == expected,
            Predicate::In(_, values) => !value.is_null() && values.contains(value),
        }
    }

    fn render(&self, sql: &mut String, params: &mut Vec<Value>) {
        match self {
            Predicate::Eq(col, Value::Null) => {
                sql.push_str(&format!("{} IS NULL", quote_ident(col)));
            }
            Predicate::Eq(col, value) => {
                params.push(value.clone());
                sql.push_str(&format!("{} = ${}", quote_ident(col), params.len()));
            }
            Predicate::In(_, values) if values.is_empty() => sql.push_str("1 <> 1"),
            Predicate::In(col, values) => {
                let mut marks = Vec::with_capacity(values.len());
                for v in values {
                    params.push(v.clone());
                    marks.push(format!("${}", params.len()));
                }
                sql.push_str(&format!("{} IN ({})", quote_ident(col), marks.join(", ")));
            }
        }
    }
}

/// One ORDER BY term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

/// A single-table SELECT.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: String,
    pub predicates: Vec<Predicate>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Return a single `count` column instead of rows.
    pub count_only: bool,
}

impl Select {
    /// `SELECT * FROM table`.
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            predicates: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            count_only: false,
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            descending,
        });
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn count(mut self) -> Self {
        self.count_only = true;
        self
    }

    fn render(&self, sql: &mut String, params: &mut Vec<Value>) {
        let paged = self.limit.is_some() || self.offset.is_some();
        if self.count_only && paged {
            sql.push_str("SELECT COUNT(*) AS \"count\" FROM (");
        } else if self.count_only {
            sql.push_str("SELECT COUNT(*) AS \"count\"");
        } else {
            sql.push_str("SELECT *");
        }
        if self.count_only && paged {
            sql.push_str("SELECT *");
        }
        sql.push_str(" FROM ");
        sql.push_str(&quote_ident(&self.table));
        render_where(&self.predicates, sql, params);
        if !self.order_by.is_empty() && !(self.count_only && !paged) {
            let terms: Vec<String> = self
                .order_by
                .iter()
                .map(|o| {
                    format!(
                        "{} {}",
                        quote_ident(&o.column),
                        if o.descending { "DESC" } else { "ASC" }
                    )
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&terms.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
        if self.count_only && paged {
            sql.push_str(") AS \"anon_1\"");
        }
    }
}

fn render_where(predicates: &[Predicate], sql: &mut String, params: &mut Vec<Value>) {
    for (i, p) in predicates.iter().enumerate() {
        sql.push_str(if i == 0 { " WHERE " } else { " AND " });
        p.render(sql, params);
    }
}

/// A statement executed against a store.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Create a table from its descriptor.
    CreateTable(Arc<Table>),
    /// Insert one row. Columns not listed take NULL (or a generated key).
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
    },
    /// Update the matching rows.
    Update {
        table: String,
        assignments: Vec<(String, Value)>,
        predicates: Vec<Predicate>,
    },
    /// Delete the matching rows.
    Delete {
        table: String,
        predicates: Vec<Predicate>,
    },
    /// Read rows.
    Select(Select),
}

impl Statement {
    /// The table the statement targets.
    pub fn table(&self) -> &str {
        match self {
            Statement::CreateTable(t) => t.name(),
            Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => table,
            Statement::Select(s) => &s.table,
        }
    }

    /// Short verb for logging.
    pub fn verb(&self) -> &'static str {
        match self {
            Statement::CreateTable(_) => "CREATE TABLE",
            Statement::Insert { .. } => "INSERT",
            Statement::Update { .. } => "UPDATE",
            Statement::Delete { .. } => "DELETE",
            Statement::Select(_) => "SELECT",
        }
    }

    /// Does the statement modify data or schema?
    pub fn is_write(&self) -> bool {
        !matches!(self, Statement::Select(_))
    }

    /// Render ANSI SQL text with `$n` placeholders.
    pub fn to_sql(&self) -> String {
        self.render().0
    }

    /// Bound parameter values, in placeholder order.
    pub fn params(&self) -> Vec<Value> {
        self.render().1
    }

    /// Render SQL text and parameters together.
    pub fn render(&self) -> (String, Vec<Value>) {
        let mut sql = String::new();
        let mut params = Vec::new();
        match self {
            Statement::CreateTable(t) => sql = t.create_sql(),
            Statement::Insert {
                table,
                columns,
                values,
            } => {
                sql.push_str(&format!("INSERT INTO {}", quote_ident(table)));
                if columns.is_empty() {
                    sql.push_str(" DEFAULT VALUES");
                } else {
                    let cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
                    let marks: Vec<String> = (1..=values.len()).map(|i| format!("${}", i)).collect();
                    sql.push_str(&format!(" ({}) VALUES ({})", cols.join(", "), marks.join(", ")));
                    params.extend(values.iter().cloned());
                }
            }
            Statement::Update {
                table,
                assignments,
                predicates,
            } => {
                sql.push_str(&format!("UPDATE {} SET ", quote_ident(table)));
                let mut sets = Vec::with_capacity(assignments.len());
                for (col, value) in assignments {
                    params.push(value.clone());
                    sets.push(format!("{} = ${}", quote_ident(col), params.len()));
                }
                sql.push_str(&sets.join(", "));
                render_where(predicates, &mut sql, &mut params);
            }
            Statement::Delete { table, predicates } => {
                sql.push_str(&format!("DELETE FROM {}", quote_ident(table)));
                render_where(predicates, &mut sql, &mut params);
            }
            Statement::Select(select) => select.render(&mut sql, &mut params),
        }
        (sql, params)
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_sql() {
        let stmt = Statement::Insert {
            table: "user".into(),
            columns: vec!["name".into(), "fullname".into()],
            values: vec!["ed".into(), "Ed Jones".into()],
        };
        assert_eq!(
            stmt.to_sql(),
            "INSERT INTO \"user\" (\"name\", \"fullname\") VALUES ($1, $2)"
        );
        assert_eq!(stmt.params(), vec![Value::from("ed"), Value::from("Ed Jones")]);
    }

    #[test]
    fn test_insert_default_values() {
        let stmt = Statement::Insert {
            table: "t".into(),
            columns: vec![],
            values: vec![],
        };
        assert_eq!(stmt.to_sql(), "INSERT INTO \"t\" DEFAULT VALUES");
    }

    #[test]
    fn test_update_sql_numbers_params_across_clauses() {
        let stmt = Statement::Update {
            table: "user".into(),
            assignments: vec![("fullname".into(), "Ed Jones".into())],
            predicates: vec![Predicate::eq("id", 1i64)],
        };
        assert_eq!(
            stmt.to_sql(),
            "UPDATE \"user\" SET \"fullname\" = $1 WHERE \"id\" = $2"
        );
        assert_eq!(stmt.params().len(), 2);
    }

    #[test]
    fn test_select_with_everything() {
        let stmt = Statement::Select(
            Select::from("user")
                .filter(Predicate::is_in(
                    "name",
                    vec!["wendy".into(), "mary".into()],
                ))
                .filter(Predicate::eq("fullname", Value::Null))
                .order_by("id", false)
                .limit(2)
                .offset(1),
        );
        assert_eq!(
            stmt.to_sql(),
            "SELECT * FROM \"user\" WHERE \"name\" IN ($1, $2) AND \"fullname\" IS NULL \
             ORDER BY \"id\" ASC LIMIT 2 OFFSET 1"
        );
        assert_eq!(stmt.params().len(), 2);
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let p = Predicate::is_in("id", vec![]);
        assert!(!p.matches(&Value::BigInt(1)));
        let stmt = Statement::Select(Select::from("user").filter(p));
        assert_eq!(stmt.to_sql(), "SELECT * FROM \"user\" WHERE 1 <> 1");
    }

    #[test]
    fn test_count_sql() {
        let plain = Statement::Select(Select::from("user").count());
        assert_eq!(plain.to_sql(), "SELECT COUNT(*) AS \"count\" FROM \"user\"");

        let paged = Statement::Select(Select::from("user").limit(3).count());
        assert_eq!(
            paged.to_sql(),
            "SELECT COUNT(*) AS \"count\" FROM (SELECT * FROM \"user\" LIMIT 3) AS \"anon_1\""
        );
    }

    #[test]
    fn test_null_equality_matches_null() {
        let p = Predicate::eq("user_id", Value::Null);
        assert!(p.matches(&Value::Null));
        assert!(!p.matches(&Value::BigInt(1)));
    }
}
