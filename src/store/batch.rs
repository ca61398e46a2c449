//! Array-driven batch updates
//!
//! Updates every row of a column set in one statement. Ids and per-column
//! values travel as JSON arrays and are zipped back together by `json_each`
//! key:
//!
//! ```sql
//! UPDATE blobbers SET total_stake = v.total_stake
//! FROM (SELECT k.value AS _key, c0.value AS total_stake
//!       FROM json_each(?1) AS k
//!       JOIN json_each(?2) AS c0 ON c0.key = k.key) AS v
//! WHERE blobbers.id = v._key
//! ```
//!
//! Column expressions may reference the current row value, e.g.
//! `blobbers.downtime + v.downtime` for accumulating columns. Current-row
//! references must be table-qualified since `v` carries the same names.

use crate::error::Result;
use rusqlite::Connection;
use serde_json::Value;

struct Column {
    name: String,
    /// None means plain assignment from `v.<name>`
    expr: Option<String>,
    values: Vec<Value>,
}

pub struct BatchUpdate {
    table: String,
    key_column: String,
    ids: Vec<String>,
    columns: Vec<Column>,
    extra_set: Vec<String>,
}

impl BatchUpdate {
    pub fn new(table: &str, key_column: &str, ids: Vec<String>) -> Self {
        Self {
            table: table.to_string(),
            key_column: key_column.to_string(),
            ids,
            columns: Vec::new(),
            extra_set: Vec::new(),
        }
    }

    /// `column = v.column`
    pub fn set<T: Into<Value>>(mut self, column: &str, values: Vec<T>) -> Self {
        self.columns.push(Column {
            name: column.to_string(),
            expr: None,
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// `column = <expr>`; the expression sees the batch value as `v.column`
    /// and must qualify current-row columns with the table name
    pub fn set_expr<T: Into<Value>>(mut self, column: &str, expr: &str, values: Vec<T>) -> Self {
        self.columns.push(Column {
            name: column.to_string(),
            expr: Some(expr.to_string()),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// `column += v.column`
    pub fn add<T: Into<Value>>(self, column: &str, values: Vec<T>) -> Self {
        let expr = format!("{}.{} + v.{}", self.table, column, column);
        self.set_expr(column, &expr, values)
    }

    /// Assignment that does not take per-row values, e.g. `updated_at = 123`
    pub fn set_raw(mut self, assignment: impl Into<String>) -> Self {
        self.extra_set.push(assignment.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// SQL text plus its JSON array parameters, in placeholder order
    pub fn build(&self) -> (String, Vec<String>) {
        let mut assignments: Vec<String> = self
            .columns
            .iter()
            .map(|c| match &c.expr {
                Some(expr) => format!("{} = {}", c.name, expr),
                None => format!("{} = v.{}", c.name, c.name),
            })
            .collect();
        assignments.extend(self.extra_set.iter().cloned());

        let mut select = vec!["k.value AS _key".to_string()];
        let mut joins = Vec::new();
        for (i, c) in self.columns.iter().enumerate() {
            select.push(format!("c{}.value AS {}", i, c.name));
            joins.push(format!(
                "JOIN json_each(?{}) AS c{} ON c{}.key = k.key",
                i + 2,
                i,
                i
            ));
        }

        let sql = format!(
            "UPDATE {table} SET {sets} FROM (SELECT {select} FROM json_each(?1) AS k {joins}) AS v WHERE {table}.{key} = v._key",
            table = self.table,
            sets = assignments.join(", "),
            select = select.join(", "),
            joins = joins.join(" "),
            key = self.key_column,
        );

        let mut params = vec![Value::Array(
            self.ids.iter().cloned().map(Value::String).collect(),
        )
        .to_string()];
        for c in &self.columns {
            params.push(Value::Array(c.values.clone()).to_string());
        }

        (sql, params)
    }

    /// Execute and return the number of rows updated
    pub fn execute(&self, conn: &Connection) -> Result<usize> {
        if self.ids.is_empty() {
            return Ok(0);
        }
        debug_assert!(self.columns.iter().all(|c| c.values.len() == self.ids.len()));

        let (sql, params) = self.build();
        let updated = conn.execute(&sql, rusqlite::params_from_iter(params.iter()))?;
        Ok(updated)
    }
}
