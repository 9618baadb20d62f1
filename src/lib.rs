//! Access logging middleware for axum that stores one row per request.
//!
//! A format string such as `":method :url :status :response-time"` is compiled
//! into a column set and a renderer. The column set provisions the target
//! table (created or extended on startup); the renderer turns every finished
//! request into a record that is inserted in the background.
//!
//! ```ignore
//! use axum::{middleware, routing::get, Router};
//! use sql_access_log::{log_requests, RequestLogger};
//!
//! let logger = RequestLogger::builder("tiny")
//!     .url("sqlite:./access.db")
//!     .table("logs")
//!     .build()
//!     .await?;
//!
//! let app = Router::new()
//!     .route("/", get(|| async { "ok" }))
//!     .layer(middleware::from_fn_with_state(logger, log_requests));
//! ```

pub mod config;
pub mod error;
pub mod format;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod store;
pub mod token;

pub use config::{load_settings, LoggerSettings};
pub use error::LogError;
pub use format::{compile, CompiledFormat, CustomFormat, FormatRegistry, FormatSpec, LogRecord};
pub use middleware::{log_requests, LoggerBuilder, RequestLogger};
pub use store::{FindOptions, LogDb, LogRow};
pub use token::{ClientIp, RequestContext, ResponseContext, TokenRegistry, Value};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging
///
/// Note: This function can only be called once per process.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();

    crate::metrics::describe_metrics();
}
