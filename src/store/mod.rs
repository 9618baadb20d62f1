//! Relational persistence for access log rows
//!
//! - **Schema**: table provisioning and column reconciliation
//! - **Writer**: fire-and-forget inserts from the request path
//! - **Query**: filtered reads for integrators

pub mod database;
pub mod query;
pub mod schema;
pub mod writer;

pub use database::LogDb;
pub use query::{build_select, FindOptions, LogRow};
pub use schema::{validate_identifier, ColumnType};
pub use writer::AsyncWriter;
