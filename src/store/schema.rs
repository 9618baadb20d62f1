//! Schema reconciliation
//!
//! Makes the log table's columns a superset of a format's column set. A missing
//! table is created with a `{table}_id` primary key; an existing one only gets
//! `ALTER TABLE ... ADD COLUMN` for the columns it lacks. Existing columns and
//! their types are never touched.

use std::collections::HashSet;
use std::fmt;

use super::database::LogDb;
use crate::error::{LogError, Result};

/// Storage type of a log column, inferred from its name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Timestamp,
    SmallInt,
    Double,
    Varchar(u16),
}

impl ColumnType {
    /// Closed name -> type rule table
    pub fn infer(column: &str) -> Self {
        match column {
            "date" => Self::Timestamp,
            "status" => Self::SmallInt,
            "response_time" | "http_version" => Self::Double,
            "url" | "user_agent" => Self::Varchar(255),
            "method" => Self::Varchar(10),
            _ => Self::Varchar(50),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timestamp => write!(f, "TIMESTAMP"),
            Self::SmallInt => write!(f, "SMALLINT"),
            Self::Double => write!(f, "DOUBLE PRECISION"),
            Self::Varchar(len) => write!(f, "VARCHAR({})", len),
        }
    }
}

/// Accept only plain identifiers: `[A-Za-z_][A-Za-z0-9_]*`
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(LogError::InvalidIdentifier(name.to_string()))
    }
}

pub fn primary_key_column(table: &str) -> String {
    format!("{}_id", table)
}

pub fn create_table_sql(table: &str, columns: &[String]) -> String {
    let mut definitions = vec![format!(
        "{} INTEGER PRIMARY KEY AUTOINCREMENT",
        primary_key_column(table)
    )];
    definitions.extend(
        columns
            .iter()
            .map(|column| format!("{} {}", column, ColumnType::infer(column))),
    );

    format!("CREATE TABLE {} ({})", table, definitions.join(", "))
}

pub fn add_column_sql(table: &str, column: &str) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        table,
        column,
        ColumnType::infer(column)
    )
}

/// DDL needed to bring a table with `existing` columns up to `columns`.
///
/// No existing columns means the table does not exist.
pub fn plan(table: &str, columns: &[String], existing: &[String]) -> Vec<String> {
    if existing.is_empty() {
        return vec![create_table_sql(table, columns)];
    }

    // SQLite column names are case-insensitive
    let existing: HashSet<String> = existing.iter().map(|c| c.to_ascii_lowercase()).collect();

    columns
        .iter()
        .filter(|column| !existing.contains(&column.to_ascii_lowercase()))
        .map(|column| add_column_sql(table, column))
        .collect()
}

impl LogDb {
    /// Column names of `table` (empty if the table does not exist)
    pub async fn existing_columns(&self, table: &str) -> Result<Vec<String>> {
        const SQL: &str = "SELECT name FROM pragma_table_info(?)";

        sqlx::query_scalar::<_, String>(SQL)
            .bind(table)
            .fetch_all(self.pool())
            .await
            .map_err(|source| LogError::Schema {
                sql: SQL.to_string(),
                source,
            })
    }

    /// Create or extend `table` so it holds every column in `columns`.
    ///
    /// Returns the DDL statements that were executed; running it again against
    /// an up-to-date table returns an empty list.
    pub async fn reconcile(&self, table: &str, columns: &[String]) -> Result<Vec<String>> {
        let existing = self.existing_columns(table).await?;
        let statements = plan(table, columns, &existing);

        for sql in &statements {
            sqlx::query(sql)
                .execute(self.pool())
                .await
                .map_err(|source| LogError::Schema {
                    sql: sql.clone(),
                    source,
                })?;

            tracing::info!(table = %table, sql = %sql, "Access log schema updated");
        }

        if statements.is_empty() {
            tracing::debug!(table = %table, "Access log schema up to date");
        }

        Ok(statements)
    }
}
