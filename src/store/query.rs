//! Query API for access log rows
//!
//! `find` and `sort` are raw SQL fragments supplied by the integrator and are
//! concatenated into the statement as-is. Never build them from client input.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};

use super::database::LogDb;
use crate::error::{LogError, Result};

/// One row as returned by the reader
pub type LogRow = serde_json::Map<String, serde_json::Value>;

/// Filter, ordering and pagination for [`LogDb::find`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindOptions {
    /// WHERE fragments, joined with AND
    #[serde(default)]
    pub find: Vec<String>,

    /// ORDER BY fragments, joined with commas
    #[serde(default)]
    pub sort: Vec<String>,

    #[serde(default = "default_limit")]
    pub limit: u64,

    #[serde(default)]
    pub skip: u64,
}

fn default_limit() -> u64 {
    1000
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            find: Vec::new(),
            sort: Vec::new(),
            limit: default_limit(),
            skip: 0,
        }
    }
}

/// SELECT statement for `options`
pub fn build_select(table: &str, options: &FindOptions) -> String {
    let mut sql = format!("SELECT * FROM {}", table);

    if !options.find.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&options.find.join(" AND "));
    }

    if !options.sort.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&options.sort.join(", "));
    }

    sql.push_str(&format!(
        " LIMIT {} OFFSET {}",
        clamp_to_sql_integer(options.limit),
        clamp_to_sql_integer(options.skip)
    ));
    sql
}

/// SQLite integers are signed 64-bit; larger literals would be read as REAL
fn clamp_to_sql_integer(value: u64) -> u64 {
    value.min(i64::MAX as u64)
}

impl LogDb {
    /// Rows of `table` matching `options`
    ///
    /// # Example
    ///
    /// ```ignore
    /// let options = FindOptions {
    ///     find: vec!["status = 400".to_string()],
    ///     sort: vec!["date DESC".to_string()],
    ///     limit: 10,
    ///     ..Default::default()
    /// };
    /// let rows = db.find("logs", &options).await?;
    /// ```
    pub async fn find(&self, table: &str, options: &FindOptions) -> Result<Vec<LogRow>> {
        let sql = build_select(table, options);

        let read_error = |source| LogError::Read {
            sql: sql.clone(),
            source,
        };

        let rows = sqlx::query(&sql)
            .fetch_all(self.pool())
            .await
            .map_err(read_error)?;

        rows.iter()
            .map(row_to_json)
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(read_error)
    }
}

/// Convert a row using the storage class of each value
fn row_to_json(row: &SqliteRow) -> Result<LogRow, sqlx::Error> {
    let mut map = LogRow::new();

    for (index, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(index)?;
        let value = if raw.is_null() {
            serde_json::Value::Null
        } else {
            let kind = raw.type_info().name().to_ascii_uppercase();
            match kind.as_str() {
                "INTEGER" | "BIGINT" | "INT8" | "BOOLEAN" => {
                    serde_json::Value::from(row.try_get::<i64, _>(index)?)
                }
                "REAL" => serde_json::Value::from(row.try_get::<f64, _>(index)?),
                "BLOB" => serde_json::Value::Null,
                _ => serde_json::Value::from(row.try_get::<String, _>(index)?),
            }
        };

        map.insert(column.name().to_string(), value);
    }

    Ok(map)
}
