//! HTTP API for reading the access log back
//!
//! Only pagination is taken from the query string; filter and sort fragments
//! are raw SQL and stay in integrator code (see [`RequestLogger::retrieve`]).

use axum::extract::{Query, State};
use axum::response::Json;
use serde::{Deserialize, Serialize};

use crate::error::LogError;
use crate::middleware::RequestLogger;
use crate::store::{schema::primary_key_column, FindOptions, LogRow};

/// Query parameters for the recent logs API
#[derive(Debug, Deserialize)]
pub struct RecentLogsParams {
    /// Maximum number of results
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Number of newest rows to skip
    #[serde(default)]
    pub skip: u64,
}

fn default_limit() -> u64 {
    100
}

/// Response for the recent logs API
#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub total: usize,
    pub logs: Vec<LogRow>,
}

/// GET /logs - Newest access log rows first
///
/// Example: GET /logs?limit=10&skip=20
pub async fn recent_logs(
    State(logger): State<RequestLogger>,
    Query(params): Query<RecentLogsParams>,
) -> Result<Json<LogsResponse>, LogError> {
    let options = FindOptions {
        find: Vec::new(),
        sort: vec![format!("{} DESC", primary_key_column(logger.table()))],
        limit: params.limit,
        skip: params.skip,
    };

    let logs = logger.retrieve(&options).await?;
    let total = logs.len();

    Ok(Json(LogsResponse { total, logs }))
}
