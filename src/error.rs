use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Access logger error types
#[derive(Debug, Error)]
pub enum LogError {
    /// Format is not usable (unknown preset with no token references, empty pattern)
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Format references a token that was never registered
    #[error("Unknown token: {0}")]
    UnknownToken(String),

    /// Format would declare the same column twice
    #[error("Duplicate column '{0}' in format")]
    DuplicateColumn(String),

    /// Table or column name is not a plain SQL identifier
    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// Logger configuration is incomplete
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection pool could not be created
    #[error("Failed to connect to log database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Metadata query, CREATE TABLE or ALTER TABLE failed
    #[error("Schema error ({sql}): {source}")]
    Schema {
        sql: String,
        #[source]
        source: sqlx::Error,
    },

    /// INSERT failed
    #[error("Write error ({sql}): {source}")]
    Write {
        sql: String,
        #[source]
        source: sqlx::Error,
    },

    /// SELECT failed
    #[error("Read error ({sql}): {source}")]
    Read {
        sql: String,
        #[source]
        source: sqlx::Error,
    },
}

pub type Result<T, E = LogError> = std::result::Result<T, E>;

impl IntoResponse for LogError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidFormat(_)
            | Self::UnknownToken(_)
            | Self::DuplicateColumn(_)
            | Self::InvalidIdentifier(_)
            | Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Connect(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Schema { .. } | Self::Write { .. } | Self::Read { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        // SQL text stays in the server log, never in the response body
        if let Some(sql) = self.sql() {
            tracing::error!(error = %self, sql = %sql, "Access log request failed");
        }

        let body = Json(json!({
            "error": {
                "message": self.public_message(),
                "type": error_type_name(&self),
            }
        }));

        (status, body).into_response()
    }
}

impl LogError {
    /// SQL statement that was being executed, if any
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Schema { sql, .. } | Self::Write { sql, .. } | Self::Read { sql, .. } => {
                Some(sql)
            }
            _ => None,
        }
    }

    fn public_message(&self) -> String {
        match self {
            Self::Schema { source, .. } => format!("Schema error: {}", source),
            Self::Write { source, .. } => format!("Write error: {}", source),
            Self::Read { source, .. } => format!("Read error: {}", source),
            other => other.to_string(),
        }
    }
}

fn error_type_name(error: &LogError) -> &'static str {
    match error {
        LogError::InvalidFormat(_) => "invalid_format",
        LogError::UnknownToken(_) => "unknown_token",
        LogError::DuplicateColumn(_) => "duplicate_column",
        LogError::InvalidIdentifier(_) => "invalid_identifier",
        LogError::Config(_) => "config_error",
        LogError::Connect(_) => "connect_error",
        LogError::Schema { .. } => "schema_error",
        LogError::Write { .. } => "write_error",
        LogError::Read { .. } => "read_error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = LogError::UnknownToken("nope".to_string());
        assert_eq!(error.to_string(), "Unknown token: nope");

        let error = LogError::Read {
            sql: "SELECT * FROM logs".to_string(),
            source: sqlx::Error::RowNotFound,
        };
        assert!(error.to_string().starts_with("Read error (SELECT * FROM logs)"));
    }

    #[test]
    fn test_error_type_name() {
        assert_eq!(
            error_type_name(&LogError::DuplicateColumn("req".to_string())),
            "duplicate_column"
        );
        assert_eq!(
            error_type_name(&LogError::InvalidFormat("".to_string())),
            "invalid_format"
        );
    }

    #[tokio::test]
    async fn test_error_response_hides_sql() {
        let error = LogError::Read {
            sql: "SELECT * FROM secret_table".to_string(),
            source: sqlx::Error::RowNotFound,
        };
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("read_error"));
        assert!(!text.contains("secret_table"));
    }
}
