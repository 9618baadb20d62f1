//! Request logging middleware
//!
//! Per request: capture the start marks, let the inner service produce the
//! response head, then log once the response body has been fully sent (or
//! dropped). In immediate mode the record is logged on arrival instead. The
//! database write is queued on the logger's [`AsyncWriter`] and never awaited
//! by the request.

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::Response,
};
use http_body::{Body as HttpBody, Frame, SizeHint};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::config::LoggerSettings;
use crate::error::{LogError, Result};
use crate::format::{CompiledFormat, FormatRegistry, FormatSpec, LogRecord};
use crate::metrics;
use crate::store::{validate_identifier, AsyncWriter, FindOptions, LogDb, LogRow};
use crate::token::{RequestContext, ResponseContext, TokenRegistry, Value};

/// Skip predicate: return `true` to leave a request out of the log
pub type SkipFn = Arc<dyn Fn(&RequestContext, &ResponseContext) -> bool + Send + Sync>;

const DEFAULT_TABLE: &str = "logs";

/// Builder for [`RequestLogger`]
///
/// Tokens and presets registered here belong to this logger only.
pub struct LoggerBuilder {
    format: FormatSpec,
    url: Option<String>,
    table: String,
    immediate: bool,
    max_connections: u32,
    skip: Option<SkipFn>,
    tokens: TokenRegistry,
    formats: FormatRegistry,
}

impl LoggerBuilder {
    pub fn new(format: impl Into<FormatSpec>) -> Self {
        Self {
            format: format.into(),
            url: None,
            table: DEFAULT_TABLE.to_string(),
            immediate: false,
            max_connections: 5,
            skip: None,
            tokens: TokenRegistry::new(),
            formats: FormatRegistry::new(),
        }
    }

    pub fn from_settings(settings: LoggerSettings) -> Self {
        Self::new(settings.format)
            .url(settings.url)
            .table(settings.table)
            .immediate(settings.immediate)
            .max_connections(settings.max_connections)
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn skip<F>(mut self, skip: F) -> Self
    where
        F: Fn(&RequestContext, &ResponseContext) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(skip));
        self
    }

    /// Register (or override) a token for this logger
    pub fn token<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&RequestContext, &ResponseContext, Option<&str>) -> Option<Value>
            + Send
            + Sync
            + 'static,
    {
        self.tokens.register(name, f);
        self
    }

    /// Register (or override) a named preset for this logger
    pub fn format(mut self, name: impl Into<String>, spec: impl Into<FormatSpec>) -> Self {
        self.formats.define(name, spec);
        self
    }

    /// Connect to the configured database and start the logger
    pub async fn build(self) -> Result<RequestLogger> {
        let url = self
            .url
            .clone()
            .ok_or_else(|| LogError::Config("no database url configured".to_string()))?;
        let compiled = self.compile()?;
        let db = LogDb::connect(&url, self.max_connections).await?;
        Ok(self.start(compiled, db))
    }

    /// Start the logger on an existing database handle
    ///
    /// Must be called from within a tokio runtime.
    pub fn build_with_db(self, db: LogDb) -> Result<RequestLogger> {
        let compiled = self.compile()?;
        Ok(self.start(compiled, db))
    }

    fn compile(&self) -> Result<CompiledFormat> {
        validate_identifier(&self.table)?;

        let compiled = self.formats.compile(&self.format)?;
        for column in compiled.columns() {
            validate_identifier(column)?;
        }

        let unresolved = compiled.unresolved(&self.tokens);
        if !unresolved.is_empty() {
            tracing::warn!(
                table = %self.table,
                tokens = ?unresolved,
                "Format references unknown tokens; rendering will fail until they are registered"
            );
        }

        Ok(compiled)
    }

    fn start(self, compiled: CompiledFormat, db: LogDb) -> RequestLogger {
        let db = Arc::new(db);
        let writer = AsyncWriter::spawn(db.clone(), self.table.clone(), compiled.columns().to_vec());

        tracing::info!(
            table = %self.table,
            columns = ?compiled.columns(),
            immediate = self.immediate,
            "Access logger configured"
        );

        RequestLogger {
            inner: Arc::new(LoggerInner {
                table: self.table,
                format: compiled,
                tokens: self.tokens,
                immediate: self.immediate,
                skip: self.skip,
                writer,
                db,
            }),
        }
    }
}

struct LoggerInner {
    table: String,
    format: CompiledFormat,
    tokens: TokenRegistry,
    immediate: bool,
    skip: Option<SkipFn>,
    writer: AsyncWriter,
    db: Arc<LogDb>,
}

/// Configured access logger; cheap to clone, use it as middleware state
#[derive(Clone)]
pub struct RequestLogger {
    inner: Arc<LoggerInner>,
}

impl RequestLogger {
    pub fn builder(format: impl Into<FormatSpec>) -> LoggerBuilder {
        LoggerBuilder::new(format)
    }

    pub fn table(&self) -> &str {
        &self.inner.table
    }

    /// Column set of the compiled format
    pub fn columns(&self) -> &[String] {
        self.inner.format.columns()
    }

    pub fn is_immediate(&self) -> bool {
        self.inner.immediate
    }

    pub fn db(&self) -> &LogDb {
        &self.inner.db
    }

    /// Render a record for one exchange without writing it
    pub fn render(&self, req: &RequestContext, res: &ResponseContext) -> Result<Option<LogRecord>> {
        self.inner.format.render(&self.inner.tokens, req, res)
    }

    /// Apply the skip predicate, render and queue the record
    pub fn log(&self, req: &RequestContext, res: &ResponseContext) {
        let inner = &self.inner;

        if let Some(skip) = &inner.skip {
            if skip(req, res) {
                tracing::trace!(table = %inner.table, url = %req.uri, "Request skipped");
                metrics::record_skipped(&inner.table);
                return;
            }
        }

        match self.render(req, res) {
            Ok(Some(record)) => inner.writer.write(record),
            Ok(None) => {
                tracing::trace!(table = %inner.table, "Format produced no record");
            }
            Err(e) => {
                tracing::error!(
                    table = %inner.table,
                    error = %e,
                    "Failed to render access log record"
                );
            }
        }
    }

    /// Read rows back from the log table
    pub async fn retrieve(&self, options: &FindOptions) -> Result<Vec<LogRow>> {
        self.inner.db.find(&self.inner.table, options).await
    }

    /// Wait until every record queued so far has been written
    pub async fn flush(&self) {
        self.inner.writer.flush().await;
    }
}

impl fmt::Debug for RequestLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestLogger")
            .field("table", &self.inner.table)
            .field("format", &self.inner.format)
            .field("immediate", &self.inner.immediate)
            .finish_non_exhaustive()
    }
}

/// Logs the exchange when dropped, i.e. when the response body is finished
struct FinishGuard {
    logger: RequestLogger,
    req: RequestContext,
    res: ResponseContext,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.logger.log(&self.req, &self.res);
    }
}

/// Response body that carries a [`FinishGuard`].
///
/// Frames, size hint and end-of-stream are forwarded untouched, so the
/// served response (including its `Content-Length`) is the same as without
/// the logger.
struct LoggedBody {
    inner: Body,
    _finish: FinishGuard,
}

impl HttpBody for LoggedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Access logging middleware
///
/// # Example
///
/// ```ignore
/// let logger = RequestLogger::builder("tiny").url("sqlite:access.db").build().await?;
/// let app = Router::new()
///     .route("/", get(handler))
///     .layer(middleware::from_fn_with_state(logger, log_requests));
/// ```
pub async fn log_requests(
    State(logger): State<RequestLogger>,
    request: Request,
    next: Next,
) -> Response {
    let req = RequestContext::capture(&request);

    if logger.is_immediate() {
        logger.log(&req, &ResponseContext::pending());
        return next.run(request).await;
    }

    let response = next.run(request).await;

    // Response head is final here; this is the "headers sent" mark
    let mut res = ResponseContext::capture(&response);

    // The server derives Content-Length from an exact body size later on
    if !res.headers.contains_key(header::CONTENT_LENGTH) {
        if let Some(length) = response.body().size_hint().exact() {
            res.headers
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        }
    }

    let (parts, body) = response.into_parts();
    let body = LoggedBody {
        inner: body,
        _finish: FinishGuard { logger, req, res },
    };

    Response::from_parts(parts, Body::new(body))
}
