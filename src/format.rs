//! Format compiler
//!
//! Turns a format string (or the name of a preset) into a [`CompiledFormat`]:
//! the ordered list of token references it contains and the column set those
//! references imply. Rendering is a small interpreter over that list; literal
//! text between tokens only matters to a human reader of the format, since the
//! output is a database row rather than a printed line.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{LogError, Result};
use crate::token::{RequestContext, ResponseContext, TokenRegistry, Value};

/// Apache combined log output
pub const DEFAULT_FORMAT: &str = ":remote-addr - :remote-user [:date[clf]] \":method :url HTTP/:http-version\" :status :res[content-length] \":referrer\" \":user-agent\"";

/// Apache common log output
pub const COMMON_FORMAT: &str =
    ":remote-addr - :remote-user [:date[clf]] \":method :url HTTP/:http-version\" :status :res[content-length]";

pub const SHORT_FORMAT: &str = ":remote-addr :remote-user :method :url HTTP/:http-version :status :res[content-length] - :response-time ms";

pub const TINY_FORMAT: &str = ":method :url :status :res[content-length] - :response-time ms";

/// One rendered log line: ordered column -> value pairs.
///
/// The column list always matches the column set of the format that produced it;
/// fields whose token yielded nothing carry `None`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogRecord {
    fields: Vec<(String, Option<Value>)>,
}

impl LogRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `column`, replacing an existing value of the same column
    pub fn insert(&mut self, column: impl Into<String>, value: Option<Value>) {
        let column = column.into();
        match self.fields.iter_mut().find(|(name, _)| *name == column) {
            Some(field) => field.1 = value,
            None => self.fields.push((column, value)),
        }
    }

    /// Builder-style [`insert`](Self::insert) for a present value
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, Some(value.into()));
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .and_then(|(_, value)| value.as_ref())
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Value>)> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Render function of a custom format
pub type CustomRenderFn =
    Arc<dyn Fn(&RequestContext, &ResponseContext) -> Option<LogRecord> + Send + Sync>;

/// Format implemented in code instead of a pattern string.
///
/// The columns must be declared up front so that the table can be provisioned.
#[derive(Clone)]
pub struct CustomFormat {
    columns: Vec<String>,
    render: CustomRenderFn,
}

impl CustomFormat {
    pub fn new<I, S, F>(columns: I, render: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&RequestContext, &ResponseContext) -> Option<LogRecord> + Send + Sync + 'static,
    {
        Self {
            columns: columns
                .into_iter()
                .map(|column| sanitize(column.as_ref()))
                .collect(),
            render: Arc::new(render),
        }
    }
}

impl fmt::Debug for CustomFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomFormat")
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

/// What a logger is configured with: a preset name / pattern, or a custom format
#[derive(Debug, Clone)]
pub enum FormatSpec {
    Pattern(String),
    Custom(CustomFormat),
}

impl From<&str> for FormatSpec {
    fn from(value: &str) -> Self {
        Self::Pattern(value.to_string())
    }
}

impl From<String> for FormatSpec {
    fn from(value: String) -> Self {
        Self::Pattern(value)
    }
}

impl From<CustomFormat> for FormatSpec {
    fn from(value: CustomFormat) -> Self {
        Self::Custom(value)
    }
}

/// Token reference parsed out of a pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRef {
    /// Registry name, e.g. `response-time`
    pub name: String,
    /// Column name, e.g. `response_time`
    pub column: String,
    /// Bracketed argument, e.g. `content-length` in `:res[content-length]`
    pub argument: Option<String>,
}

#[derive(Clone)]
enum Renderer {
    Tokens(Vec<TokenRef>),
    Custom(CustomRenderFn),
}

/// Executable form of a format
#[derive(Clone)]
pub struct CompiledFormat {
    columns: Vec<String>,
    renderer: Renderer,
}

impl CompiledFormat {
    /// Ordered column set implied by the format
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Token references of a pattern format (empty for custom formats)
    pub fn tokens(&self) -> &[TokenRef] {
        match &self.renderer {
            Renderer::Tokens(tokens) => tokens,
            Renderer::Custom(_) => &[],
        }
    }

    /// Token names the registry cannot resolve
    pub fn unresolved(&self, registry: &TokenRegistry) -> Vec<String> {
        self.tokens()
            .iter()
            .filter(|token| !registry.contains(&token.name))
            .map(|token| token.name.clone())
            .collect()
    }

    /// Render one record.
    ///
    /// Tokens are looked up at render time, so a format referencing an unknown
    /// token compiles fine and fails here with [`LogError::UnknownToken`].
    /// `Ok(None)` means a custom format chose not to produce a record.
    pub fn render(
        &self,
        registry: &TokenRegistry,
        req: &RequestContext,
        res: &ResponseContext,
    ) -> Result<Option<LogRecord>> {
        match &self.renderer {
            Renderer::Tokens(tokens) => {
                let mut record = LogRecord::new();
                for token in tokens {
                    let extract = registry.resolve(&token.name)?;
                    let value = extract(req, res, token.argument.as_deref());
                    record.insert(token.column.clone(), value);
                }
                Ok(Some(record))
            }
            Renderer::Custom(render) => Ok(render(req, res).map(|raw| {
                let mut record = LogRecord::new();
                for column in &self.columns {
                    record.insert(column.clone(), raw.get(column).cloned());
                }
                record
            })),
        }
    }
}

impl fmt::Debug for CompiledFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.renderer {
            Renderer::Tokens(_) => "tokens",
            Renderer::Custom(_) => "custom",
        };
        f.debug_struct("CompiledFormat")
            .field("columns", &self.columns)
            .field("kind", &kind)
            .finish()
    }
}

/// Named presets
#[derive(Debug, Clone)]
pub struct FormatRegistry {
    presets: HashMap<String, FormatSpec>,
}

impl FormatRegistry {
    /// Registry with the built-in presets
    pub fn new() -> Self {
        let mut registry = Self {
            presets: HashMap::new(),
        };
        registry
            .define("default", DEFAULT_FORMAT)
            .define("combined", DEFAULT_FORMAT)
            .define("common", COMMON_FORMAT)
            .define("short", SHORT_FORMAT)
            .define("tiny", TINY_FORMAT);
        registry
    }

    /// Register or replace the preset `name`
    pub fn define(&mut self, name: impl Into<String>, spec: impl Into<FormatSpec>) -> &mut Self {
        let name = name.into();
        if self.presets.insert(name.clone(), spec.into()).is_some() {
            tracing::debug!(format = %name, "Format preset overridden");
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&FormatSpec> {
        self.presets.get(name)
    }

    /// Compile a spec, resolving preset names first
    pub fn compile(&self, spec: &FormatSpec) -> Result<CompiledFormat> {
        match spec {
            FormatSpec::Pattern(pattern) => match self.presets.get(pattern) {
                Some(FormatSpec::Pattern(preset)) => compile(preset),
                Some(FormatSpec::Custom(custom)) => compile_custom(custom),
                None => compile(pattern),
            },
            FormatSpec::Custom(custom) => compile_custom(custom),
        }
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Compile a literal pattern (no preset lookup)
pub fn compile(pattern: &str) -> Result<CompiledFormat> {
    let tokens = parse(pattern);
    if tokens.is_empty() {
        return Err(LogError::InvalidFormat(format!(
            "format {:?} references no tokens",
            pattern
        )));
    }

    let columns = unique_columns(tokens.iter().map(|token| token.column.as_str()))?;

    Ok(CompiledFormat {
        columns,
        renderer: Renderer::Tokens(tokens),
    })
}

fn compile_custom(custom: &CustomFormat) -> Result<CompiledFormat> {
    if custom.columns.is_empty() {
        return Err(LogError::InvalidFormat(
            "custom format declares no columns".to_string(),
        ));
    }

    let columns = unique_columns(custom.columns.iter().map(String::as_str))?;

    Ok(CompiledFormat {
        columns,
        renderer: Renderer::Custom(custom.render.clone()),
    })
}

fn unique_columns<'a>(columns: impl Iterator<Item = &'a str>) -> Result<Vec<String>> {
    let mut unique: Vec<String> = Vec::new();
    for column in columns {
        if unique.iter().any(|seen| seen == column) {
            return Err(LogError::DuplicateColumn(column.to_string()));
        }
        unique.push(column.to_string());
    }
    Ok(unique)
}

/// Column name for a token name: hyphens become underscores
pub fn sanitize(name: &str) -> String {
    name.replace('-', "_")
}

/// Scan a pattern for `:name` and `:name[argument]` references, left to right.
///
/// A name is two or more ASCII letters, digits, `_` or `-`. An opening bracket
/// without a closing one, or with nothing inside, is treated as literal text.
pub fn parse(pattern: &str) -> Vec<TokenRef> {
    let bytes = pattern.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b':' {
            i += 1;
            continue;
        }

        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && is_name_byte(bytes[end]) {
            end += 1;
        }

        if end - start < 2 {
            i += 1;
            continue;
        }

        let name = &pattern[start..end];
        let mut argument = None;
        let mut next = end;

        if bytes.get(end) == Some(&b'[') {
            if let Some(close) = pattern[end + 1..].find(']') {
                if close > 0 {
                    argument = Some(pattern[end + 1..end + 1 + close].to_string());
                    next = end + 1 + close + 1;
                }
            }
        }

        tokens.push(TokenRef {
            name: name.to_string(),
            column: sanitize(name),
            argument,
        });
        i = next;
    }

    tokens
}

fn is_name_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-'
}
