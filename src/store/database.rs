//! SQLite database layer for access log rows
//!
//! Owns the connection pool shared by the schema reconciler, the writer and
//! the reader of one logger.

use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::Sqlite;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{LogError, Result};
use crate::format::{sanitize, LogRecord};
use crate::token::Value;

/// Access log database handle
#[derive(Debug, Clone)]
pub struct LogDb {
    pool: SqlitePool,
}

impl LogDb {
    /// Create the connection pool
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite URI (e.g., "sqlite:./data/access.db" or "sqlite::memory:")
    /// * `max_connections` - Pool size
    ///
    /// # Example
    ///
    /// ```ignore
    /// let db = LogDb::connect("sqlite:./data/access.db", 5).await?;
    /// ```
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(LogError::Connect)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal) // concurrent readers while the writer inserts
            .busy_timeout(Duration::from_secs(30))
            .pragma("synchronous", "NORMAL");

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30));

        // An in-memory database lives only as long as its connection
        if database_url.contains(":memory:") {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(LogError::Connect)?;

        tracing::info!(url = %database_url, "Connected to access log database");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert one rendered record into `table`.
    ///
    /// Falsy fields are left out of the statement. A record with no truthy
    /// field at all is not written; `Ok(0)` is returned in that case.
    pub async fn insert(&self, table: &str, record: &LogRecord) -> Result<u64> {
        let Some((sql, values)) = build_insert(table, record) else {
            tracing::debug!(table = %table, "Record has no values, nothing to insert");
            return Ok(0);
        };

        let mut query = sqlx::query(&sql);
        for value in values {
            query = bind_value(query, value);
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|source| LogError::Write {
                sql: sql.clone(),
                source,
            })?;

        Ok(result.rows_affected())
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Build a positional INSERT for the truthy fields of `record`
pub fn build_insert<'r>(table: &str, record: &'r LogRecord) -> Option<(String, Vec<&'r Value>)> {
    let (columns, values): (Vec<String>, Vec<&Value>) = record
        .iter()
        .filter_map(|(column, value)| match value {
            Some(value) if !value.is_falsy() => Some((sanitize(column), value)),
            _ => None,
        })
        .unzip();

    if columns.is_empty() {
        return None;
    }

    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        placeholders
    );

    Some((sql, values))
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Text(text) => query.bind(text.as_str()),
        Value::Integer(int) => query.bind(*int),
        Value::Float(float) => query.bind(*float),
        Value::Bool(flag) => query.bind(*flag),
        Value::Timestamp(ts) => query.bind(*ts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    async fn create_test_db() -> LogDb {
        LogDb::connect("sqlite::memory:", 1).await.unwrap()
    }

    #[test]
    fn test_build_insert_skips_falsy_fields() {
        let mut record = LogRecord::new()
            .with("method", "GET")
            .with("url", "/missing")
            .with("status", 404i64)
            .with("res", "")
            .with("response_time", 0.0);
        record.insert("referrer", None);

        let (sql, values) = build_insert("logs", &record).unwrap();
        assert_eq!(sql, "INSERT INTO logs (method, url, status) VALUES (?, ?, ?)");
        assert_eq!(values.len(), 3);
        assert_eq!(values[2], &Value::Integer(404));
    }

    #[test]
    fn test_build_insert_sanitizes_keys() {
        let record = LogRecord::new().with("user-agent", "curl/8.0");
        let (sql, _) = build_insert("logs", &record).unwrap();
        assert_eq!(sql, "INSERT INTO logs (user_agent) VALUES (?)");
    }

    #[test]
    fn test_build_insert_all_falsy() {
        let record = LogRecord::new().with("status", 0i64).with("flag", false);
        assert!(build_insert("logs", &record).is_none());
    }

    #[tokio::test]
    async fn test_insert_row() {
        let db = create_test_db().await;
        sqlx::query("CREATE TABLE logs (logs_id INTEGER PRIMARY KEY AUTOINCREMENT, method VARCHAR(10), status SMALLINT, response_time DOUBLE PRECISION)")
            .execute(db.pool())
            .await
            .unwrap();

        let record = LogRecord::new()
            .with("method", "POST")
            .with("status", 201i64)
            .with("response_time", 1.25);
        let affected = db.insert("logs", &record).await.unwrap();
        assert_eq!(affected, 1);

        let row = sqlx::query("SELECT method, status, response_time FROM logs")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("method"), "POST");
        assert_eq!(row.get::<i64, _>("status"), 201);
        assert_eq!(row.get::<f64, _>("response_time"), 1.25);
    }

    #[tokio::test]
    async fn test_insert_missing_table_reports_sql() {
        let db = create_test_db().await;
        let record = LogRecord::new().with("method", "GET");

        let err = db.insert("nowhere", &record).await.unwrap_err();
        match err {
            LogError::Write { sql, .. } => {
                assert_eq!(sql, "INSERT INTO nowhere (method) VALUES (?)");
            }
            other => panic!("Expected write error, got {:?}", other),
        }
    }
}
