//! Token registry
//!
//! A token is a named extraction rule that produces one field of a log record
//! from the request and response of a single HTTP exchange. Every logger owns
//! its own registry, seeded with the built-in tokens; registering a token under
//! an existing name silently replaces it.

use axum::{
    extract::{ConnectInfo, OriginalUri},
    http::{header, HeaderMap, Method, Request, Response, StatusCode, Uri, Version},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{LogError, Result};

/// Default number of decimals for `:response-time`
const DEFAULT_RESPONSE_TIME_DIGITS: usize = 3;

/// Single field value produced by a token
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Falsy values are never written: empty text, zero, NaN and `false`
    pub fn is_falsy(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::Integer(i) => *i == 0,
            Self::Float(f) => *f == 0.0 || f.is_nan(),
            Self::Bool(b) => !b,
            Self::Timestamp(_) => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

/// Client address resolved by an upstream layer (e.g. a proxy-aware extractor).
///
/// When present in the request extensions it takes precedence over the socket
/// peer address for `:remote-addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// Snapshot of the request, taken when it enters the middleware
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    /// Original URI before any nesting rewrote it
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub client_ip: Option<IpAddr>,
    pub peer_addr: Option<SocketAddr>,
    /// Monotonic start mark used for `:response-time`
    pub started_at: Instant,
    /// Wall-clock start mark
    pub start_time: DateTime<Utc>,
}

impl RequestContext {
    pub fn capture<B>(request: &Request<B>) -> Self {
        let extensions = request.extensions();
        let uri = extensions
            .get::<OriginalUri>()
            .map(|original| original.0.clone())
            .unwrap_or_else(|| request.uri().clone());

        Self {
            method: request.method().clone(),
            uri,
            version: request.version(),
            headers: request.headers().clone(),
            client_ip: extensions.get::<ClientIp>().map(|ip| ip.0),
            peer_addr: extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0),
            started_at: Instant::now(),
            start_time: Utc::now(),
        }
    }
}

/// Snapshot of the response, taken once its head is ready to be sent.
///
/// A pending context (immediate mode) has no status and no headers.
#[derive(Debug, Clone, Default)]
pub struct ResponseContext {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    /// Monotonic mark taken when the response head was produced
    pub headers_sent_at: Option<Instant>,
}

impl ResponseContext {
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn capture<B>(response: &Response<B>) -> Self {
        Self {
            status: Some(response.status()),
            headers: response.headers().clone(),
            headers_sent_at: Some(Instant::now()),
        }
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent_at.is_some()
    }
}

/// Extraction function: (request, response, optional argument) -> value
pub type TokenFn =
    Arc<dyn Fn(&RequestContext, &ResponseContext, Option<&str>) -> Option<Value> + Send + Sync>;

/// Name -> extraction function mapping
#[derive(Clone)]
pub struct TokenRegistry {
    tokens: HashMap<String, TokenFn>,
}

impl TokenRegistry {
    /// Registry seeded with the built-in tokens
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_builtins();
        registry
    }

    /// Registry with no tokens at all
    pub fn empty() -> Self {
        Self {
            tokens: HashMap::new(),
        }
    }

    /// Store `f` under `name`, replacing any earlier token of that name
    pub fn register<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&RequestContext, &ResponseContext, Option<&str>) -> Option<Value>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        if self.tokens.insert(name.clone(), Arc::new(f)).is_some() {
            tracing::debug!(token = %name, "Token overridden");
        }
        self
    }

    pub fn resolve(&self, name: &str) -> Result<&TokenFn> {
        self.tokens
            .get(name)
            .ok_or_else(|| LogError::UnknownToken(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tokens.contains_key(name)
    }

    fn register_builtins(&mut self) {
        self.register("url", |req, _, _| {
            let url = req
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or_else(|| req.uri.path());
            Some(Value::from(url))
        });

        self.register("method", |req, _, _| Some(Value::from(req.method.as_str())));

        self.register("status", |_, res, _| {
            if !res.headers_sent() {
                return None;
            }
            res.status.map(|status| Value::Integer(i64::from(status.as_u16())))
        });

        self.register("response-time", |req, res, digits| {
            let sent = res.headers_sent_at?;
            let digits = digits
                .and_then(|d| d.trim().parse::<usize>().ok())
                .unwrap_or(DEFAULT_RESPONSE_TIME_DIGITS);
            let elapsed = sent.saturating_duration_since(req.started_at);
            Some(Value::Float(elapsed_millis(elapsed, digits)))
        });

        self.register("date", |_, _, _| Some(Value::Timestamp(Utc::now())));

        self.register("referrer", |req, _, _| {
            header_value(&req.headers, "referer").or_else(|| header_value(&req.headers, "referrer"))
        });

        self.register("remote-addr", |req, _, _| {
            req.client_ip
                .or_else(|| req.peer_addr.map(|addr| addr.ip()))
                .map(|ip| Value::Text(ip.to_string()))
        });

        self.register("remote-user", |req, _, _| {
            basic_auth_user(&req.headers).map(Value::Text)
        });

        self.register("http-version", |req, _, _| {
            let (major, minor) = version_parts(req.version)?;
            format!("{}.{}", major, minor).parse::<f64>().ok().map(Value::Float)
        });

        self.register("user-agent", |req, _, _| {
            header_value(&req.headers, header::USER_AGENT.as_str())
        });

        self.register("req", |req, _, name| header_value(&req.headers, name?));

        self.register("res", |_, res, name| {
            if !res.headers_sent() {
                return None;
            }
            header_value(&res.headers, name?)
        });
    }
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TokenRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.tokens.keys().collect();
        names.sort();
        f.debug_struct("TokenRegistry").field("tokens", &names).finish()
    }
}

/// Header value by (case-insensitive) name; repeated headers are joined with ", "
fn header_value(headers: &HeaderMap, name: &str) -> Option<Value> {
    let name = name.trim().to_ascii_lowercase();
    let values: Vec<String> = headers
        .get_all(name.as_str())
        .iter()
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .collect();

    if values.is_empty() {
        None
    } else {
        Some(Value::Text(values.join(", ")))
    }
}

/// Username from `Authorization: Basic ...`
fn basic_auth_user(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (user, _password) = credentials.split_once(':')?;
    Some(user.to_string())
}

fn version_parts(version: Version) -> Option<(u8, u8)> {
    match version {
        Version::HTTP_09 => Some((0, 9)),
        Version::HTTP_10 => Some((1, 0)),
        Version::HTTP_11 => Some((1, 1)),
        Version::HTTP_2 => Some((2, 0)),
        Version::HTTP_3 => Some((3, 0)),
        _ => None,
    }
}

/// Milliseconds truncated to `digits` decimals.
///
/// Truncation happens on the integer nanosecond count so that the result does
/// not depend on floating point rounding of the intermediate product.
fn elapsed_millis(elapsed: Duration, digits: usize) -> f64 {
    let nanos = elapsed.as_nanos();
    if digits >= 6 {
        return nanos as f64 / 1e6;
    }

    let scale = 10u128.pow(6 - digits as u32);
    (nanos / scale) as f64 / 10f64.powi(digits as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(builder: axum::http::request::Builder) -> RequestContext {
        RequestContext::capture(&builder.body(Body::empty()).unwrap())
    }

    fn eval(registry: &TokenRegistry, name: &str, req: &RequestContext, res: &ResponseContext, arg: Option<&str>) -> Option<Value> {
        let token = registry.resolve(name).unwrap();
        token(req, res, arg)
    }

    #[test]
    fn test_unknown_token() {
        let registry = TokenRegistry::new();
        let err = registry.resolve("nope").err().unwrap();
        assert!(matches!(err, LogError::UnknownToken(name) if name == "nope"));
    }

    #[test]
    fn test_register_overrides_builtin() {
        let mut registry = TokenRegistry::new();
        registry.register("method", |_, _, _| Some(Value::from("OVERRIDDEN")));

        let req = request(Request::builder().method("POST").uri("/"));
        let value = eval(&registry, "method", &req, &ResponseContext::pending(), None);
        assert_eq!(value, Some(Value::from("OVERRIDDEN")));
    }

    #[test]
    fn test_url_and_method() {
        let registry = TokenRegistry::new();
        let req = request(Request::builder().method("DELETE").uri("/items/7?force=1"));
        let res = ResponseContext::pending();

        assert_eq!(eval(&registry, "url", &req, &res, None), Some(Value::from("/items/7?force=1")));
        assert_eq!(eval(&registry, "method", &req, &res, None), Some(Value::from("DELETE")));
    }

    #[test]
    fn test_url_prefers_original_uri() {
        let registry = TokenRegistry::new();
        let mut raw = Request::builder().uri("/inner").body(Body::empty()).unwrap();
        raw.extensions_mut()
            .insert(OriginalUri(Uri::from_static("/api/inner")));
        let req = RequestContext::capture(&raw);

        let value = eval(&registry, "url", &req, &ResponseContext::pending(), None);
        assert_eq!(value, Some(Value::from("/api/inner")));
    }

    #[test]
    fn test_status_requires_sent_headers() {
        let registry = TokenRegistry::new();
        let req = request(Request::builder().uri("/"));

        assert_eq!(eval(&registry, "status", &req, &ResponseContext::pending(), None), None);

        let response = Response::builder().status(404).body(Body::empty()).unwrap();
        let res = ResponseContext::capture(&response);
        assert_eq!(eval(&registry, "status", &req, &res, None), Some(Value::Integer(404)));
    }

    #[test]
    fn test_response_time_digits() {
        let registry = TokenRegistry::new();
        let req = request(Request::builder().uri("/"));
        let res = ResponseContext {
            status: Some(StatusCode::OK),
            headers: HeaderMap::new(),
            headers_sent_at: Some(req.started_at + Duration::from_micros(12_345_678)),
        };

        let value = eval(&registry, "response-time", &req, &res, None);
        assert_eq!(value, Some(Value::Float(12345.678)));

        let value = eval(&registry, "response-time", &req, &res, Some("1"));
        assert_eq!(value, Some(Value::Float(12345.6)));

        let value = eval(&registry, "response-time", &req, &res, Some("0"));
        assert_eq!(value, Some(Value::Float(12345.0)));

        let value = eval(&registry, "response-time", &req, &ResponseContext::pending(), None);
        assert_eq!(value, None);
    }

    #[test]
    fn test_referrer_prefers_misspelled_header() {
        let registry = TokenRegistry::new();
        let res = ResponseContext::pending();

        let req = request(
            Request::builder()
                .uri("/")
                .header("referer", "http://a.example")
                .header("referrer", "http://b.example"),
        );
        assert_eq!(eval(&registry, "referrer", &req, &res, None), Some(Value::from("http://a.example")));

        let req = request(Request::builder().uri("/").header("referrer", "http://b.example"));
        assert_eq!(eval(&registry, "referrer", &req, &res, None), Some(Value::from("http://b.example")));

        let req = request(Request::builder().uri("/"));
        assert_eq!(eval(&registry, "referrer", &req, &res, None), None);
    }

    #[test]
    fn test_remote_addr_precedence() {
        let registry = TokenRegistry::new();
        let res = ResponseContext::pending();

        let mut raw = Request::builder().uri("/").body(Body::empty()).unwrap();
        raw.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 2], 4000))));
        let req = RequestContext::capture(&raw);
        assert_eq!(eval(&registry, "remote-addr", &req, &res, None), Some(Value::from("10.0.0.2")));

        raw.extensions_mut()
            .insert(ClientIp(IpAddr::from([203, 0, 113, 9])));
        let req = RequestContext::capture(&raw);
        assert_eq!(eval(&registry, "remote-addr", &req, &res, None), Some(Value::from("203.0.113.9")));

        let req = request(Request::builder().uri("/"));
        assert_eq!(eval(&registry, "remote-addr", &req, &res, None), None);
    }

    #[test]
    fn test_remote_user_from_basic_auth() {
        let registry = TokenRegistry::new();
        let res = ResponseContext::pending();

        // "alice:secret"
        let req = request(
            Request::builder()
                .uri("/")
                .header("authorization", "Basic YWxpY2U6c2VjcmV0"),
        );
        assert_eq!(eval(&registry, "remote-user", &req, &res, None), Some(Value::from("alice")));

        let req = request(Request::builder().uri("/").header("authorization", "Bearer abc"));
        assert_eq!(eval(&registry, "remote-user", &req, &res, None), None);
    }

    #[test]
    fn test_http_version() {
        let registry = TokenRegistry::new();
        let res = ResponseContext::pending();

        let req = request(Request::builder().uri("/").version(Version::HTTP_11));
        assert_eq!(eval(&registry, "http-version", &req, &res, None), Some(Value::Float(1.1)));

        let req = request(Request::builder().uri("/").version(Version::HTTP_2));
        assert_eq!(eval(&registry, "http-version", &req, &res, None), Some(Value::Float(2.0)));
    }

    #[test]
    fn test_header_tokens_join_repeated_values() {
        let registry = TokenRegistry::new();
        let req = request(
            Request::builder()
                .uri("/")
                .header("x-tag", "a")
                .header("x-tag", "b")
                .header("user-agent", "curl/8.0"),
        );
        let response = Response::builder()
            .header("content-length", "42")
            .body(Body::empty())
            .unwrap();
        let res = ResponseContext::capture(&response);

        assert_eq!(eval(&registry, "req", &req, &res, Some("X-Tag")), Some(Value::from("a, b")));
        assert_eq!(eval(&registry, "req", &req, &res, Some("x-missing")), None);
        assert_eq!(eval(&registry, "req", &req, &res, None), None);
        assert_eq!(eval(&registry, "res", &req, &res, Some("content-length")), Some(Value::from("42")));
        assert_eq!(eval(&registry, "user-agent", &req, &res, None), Some(Value::from("curl/8.0")));
    }

    #[test]
    fn test_falsy_values() {
        assert!(Value::from("").is_falsy());
        assert!(Value::Integer(0).is_falsy());
        assert!(Value::Float(0.0).is_falsy());
        assert!(Value::Float(f64::NAN).is_falsy());
        assert!(Value::Bool(false).is_falsy());
        assert!(!Value::from("GET").is_falsy());
        assert!(!Value::Integer(404).is_falsy());
        assert!(!Value::Timestamp(Utc::now()).is_falsy());
    }
}
