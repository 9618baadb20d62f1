//! Async writer for access log records
//!
//! Request handling never waits on the database: records are pushed onto an
//! unbounded channel and a background task persists them. The task reconciles
//! the table schema before it writes the first record, so early requests are
//! not lost to a table that does not exist yet.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

use super::database::LogDb;
use crate::error::Result;
use crate::format::LogRecord;
use crate::metrics;

/// Message types for the async writer
#[derive(Debug)]
enum WriterMessage {
    Record(LogRecord),
    /// Answered once every earlier message has been processed
    Flush(oneshot::Sender<()>),
}

/// Async writer handle
///
/// Use this to send records to the database without blocking.
/// The actual writes happen in a background task.
#[derive(Clone, Debug)]
pub struct AsyncWriter {
    sender: mpsc::UnboundedSender<WriterMessage>,
}

impl AsyncWriter {
    /// Spawn a new writer task for `table`.
    ///
    /// `columns` is the compiled column set the table must hold. The task
    /// exits once every handle is dropped and the queue is drained.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let writer = AsyncWriter::spawn(db, "logs".to_string(), columns);
    /// writer.write(record);  // Non-blocking
    /// ```
    pub fn spawn(db: Arc<LogDb>, table: String, columns: Vec<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            writer_task(db, rx, table, columns).await;
        });

        Self { sender: tx }
    }

    /// Queue a record (non-blocking)
    pub fn write(&self, record: LogRecord) {
        if self.sender.send(WriterMessage::Record(record)).is_err() {
            tracing::warn!("Access log writer is closed, record dropped");
        }
    }

    /// Wait until every record queued before this call has been processed
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(WriterMessage::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Background writer task
async fn writer_task(
    db: Arc<LogDb>,
    mut rx: mpsc::UnboundedReceiver<WriterMessage>,
    table: String,
    columns: Vec<String>,
) {
    match db.reconcile(&table, &columns).await {
        Ok(statements) => {
            if !statements.is_empty() {
                metrics::record_schema_changes(&table, statements.len());
            }
        }
        Err(e) => {
            tracing::error!(
                table = %table,
                error = %e,
                "Failed to reconcile access log schema"
            );
        }
    }

    while let Some(msg) = rx.recv().await {
        let record = match msg {
            WriterMessage::Record(record) => record,
            WriterMessage::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };

        let start = Instant::now();
        let result = db.insert(&table, &record).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(rows) => {
                tracing::trace!(
                    table = %table,
                    rows = rows,
                    duration_ms = elapsed.as_millis(),
                    "Access log record written"
                );
            }
            Err(e) => {
                tracing::error!(
                    table = %table,
                    error = %e,
                    "Failed to write access log record"
                );
            }
        }

        metrics::record_write(&table, write_outcome(&result), elapsed);
    }

    tracing::info!(table = %table, "Access log writer task shutting down");
}

/// Metric label for an insert result; a record with no truthy field is "empty"
fn write_outcome(result: &Result<u64>) -> &'static str {
    match result {
        Ok(0) => "empty",
        Ok(_) => "ok",
        Err(_) => "error",
    }
}
