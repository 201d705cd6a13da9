//! # Request / Response Adapters
//!
//! The pipeline never hands transport types to user code. Incoming
//! requests are adapted into [`XyRequest`] (lowercased flattened headers,
//! parsed query and cookies, body bytes, derived client IP) and handlers
//! produce an [`XyResponse`] that buffers everything until finalization.
//!
//! Buffering is what makes the framework's intercepts possible: response
//! plugins may rewrite headers or the body, and components such as XEMS
//! register *pre-finalize callbacks* that run, in registration order,
//! before the first byte is written to the wire. This replaces the
//! wrap-and-override style of intercepting `send`/`json` with an explicit
//! hook list.

use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode, Uri};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Adapted view of one incoming request.
#[derive(Debug)]
pub struct XyRequest {
    pub method: Method,
    pub uri: Uri,
    pub path: String,
    /// Lowercased, comma-flattened headers
    pub headers: HashMap<String, String>,
    /// Untouched header map, kept for proxy forwarding
    pub raw_headers: HeaderMap,
    pub query: HashMap<String, String>,
    /// Route parameters, filled in after the router matches
    pub params: HashMap<String, String>,
    pub body: Bytes,
    /// Cookies, parsed once at adaptation time
    cookies: HashMap<String, String>,
    pub remote_addr: SocketAddr,
    trust_proxy: bool,
    /// Negotiated protocol, `http/1.1` or `h2`
    pub protocol: String,
    pub secure: bool,
    /// Session payload attached by the XEMS binding
    pub session: Option<serde_json::Value>,
    /// Plugin attachments keyed by plugin id
    pub extensions: HashMap<String, serde_json::Value>,
}

impl XyRequest {
    /// Adapt transport parts into the pipeline view.
    pub fn adapt(
        method: Method,
        uri: Uri,
        raw_headers: HeaderMap,
        body: Bytes,
        remote_addr: SocketAddr,
        trust_proxy: bool,
        http2: bool,
        secure: bool,
    ) -> Self {
        let mut headers: HashMap<String, String> = HashMap::with_capacity(raw_headers.len());
        for (name, value) in raw_headers.iter() {
            let text = value.to_str().unwrap_or("").to_string();
            headers
                .entry(name.as_str().to_ascii_lowercase())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&text);
                })
                .or_insert(text);
        }

        let path = uri.path().to_string();
        let query = parse_query(uri.query().unwrap_or(""));
        let cookies = parse_cookies(headers.get("cookie").map(String::as_str).unwrap_or(""));

        Self {
            method,
            uri,
            path,
            headers,
            raw_headers,
            query,
            params: HashMap::new(),
            body,
            cookies,
            remote_addr,
            trust_proxy,
            protocol: if http2 { "h2" } else { "http/1.1" }.to_string(),
            secure,
            session: None,
            extensions: HashMap::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Client IP. With trust-proxy on, the first `X-Forwarded-For` entry
    /// wins; otherwise the socket peer address.
    pub fn ip(&self) -> String {
        if self.trust_proxy {
            if let Some(forwarded) = self.header("x-forwarded-for") {
                if let Some(first) = forwarded.split(',').next() {
                    let first = first.trim();
                    if !first.is_empty() {
                        return first.to_string();
                    }
                }
            }
        }
        self.remote_addr.ip().to_string()
    }

    /// Whether this looks like an XMLHttpRequest.
    pub fn xhr(&self) -> bool {
        self.header("x-requested-with")
            .map(|v| v.eq_ignore_ascii_case("xmlhttprequest"))
            .unwrap_or(false)
    }

    pub fn is_http2(&self) -> bool {
        self.protocol == "h2"
    }

    /// Path plus query string, for proxy forwarding.
    pub fn path_and_query(&self) -> String {
        self.uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| self.path.clone())
    }
}

fn parse_query(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or("");
        let value = parts.next().unwrap_or("");
        out.insert(url_decode(key), url_decode(&value.replace('+', " ")));
    }
    out
}

fn parse_cookies(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for pair in raw.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.splitn(2, '=');
        if let (Some(name), Some(value)) = (parts.next(), parts.next()) {
            out.insert(name.trim().to_string(), value.trim().to_string());
        }
    }
    out
}

/// Minimal percent-decoding; malformed escapes pass through untouched.
fn url_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Cookie attributes applied by [`XyResponse::cookie`].
#[derive(Debug, Clone)]
pub struct CookieOptions {
    pub http_only: bool,
    pub secure: bool,
    pub same_site: SameSite,
    pub max_age: Option<Duration>,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            http_only: true,
            secure: true,
            same_site: SameSite::Strict,
            max_age: None,
            path: "/".to_string(),
        }
    }
}

/// Callback run during finalization, before the body reaches the wire.
pub type Finalizer = Box<dyn FnOnce(&mut XyResponse) + Send + 'static>;

/// Buffered programmable response.
pub struct XyResponse {
    status: StatusCode,
    headers: HeaderMap,
    buffer: Vec<u8>,
    ended: bool,
    finalizers: Vec<Finalizer>,
}

impl Default for XyResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for XyResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XyResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("buffered_bytes", &self.buffer.len())
            .field("ended", &self.ended)
            .field("finalizers", &self.finalizers.len())
            .finish()
    }
}

impl XyResponse {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            buffer: Vec::new(),
            ended: false,
            finalizers: Vec::new(),
        }
    }

    pub fn status(&mut self, code: u16) -> &mut Self {
        self.status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn append_header(&mut self, name: &str, value: &str) -> &mut Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn remove_header(&mut self, name: &str) -> &mut Self {
        self.headers.remove(name);
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Append to the buffered body without ending the response.
    pub fn write(&mut self, chunk: &[u8]) -> &mut Self {
        if !self.ended {
            self.buffer.extend_from_slice(chunk);
        }
        self
    }

    /// Mark the body complete. Later writes are ignored.
    pub fn end(&mut self) -> &mut Self {
        self.ended = true;
        self
    }

    /// Replace the body with a serialized JSON payload.
    pub fn json<T: Serialize>(&mut self, value: &T) -> Result<&mut Self, serde_json::Error> {
        self.buffer = serde_json::to_vec(value)?;
        self.headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.ended = true;
        Ok(self)
    }

    /// Replace the body with raw bytes or text.
    pub fn send(&mut self, body: impl Into<Bytes>) -> &mut Self {
        self.buffer = body.into().to_vec();
        if !self.headers.contains_key(axum::http::header::CONTENT_TYPE) {
            self.headers.insert(
                axum::http::header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
        }
        self.ended = true;
        self
    }

    pub fn redirect(&mut self, location: &str) -> &mut Self {
        self.status = StatusCode::FOUND;
        self.set_header("location", location);
        self.ended = true;
        self
    }

    pub fn cookie(&mut self, name: &str, value: &str, options: &CookieOptions) -> &mut Self {
        let mut cookie = format!("{name}={value}; Path={}", options.path);
        if let Some(max_age) = options.max_age {
            cookie.push_str(&format!("; Max-Age={}", max_age.as_secs()));
        }
        if options.http_only {
            cookie.push_str("; HttpOnly");
        }
        if options.secure {
            cookie.push_str("; Secure");
        }
        cookie.push_str(match options.same_site {
            SameSite::Strict => "; SameSite=Strict",
            SameSite::Lax => "; SameSite=Lax",
            SameSite::None => "; SameSite=None",
        });
        self.append_header("set-cookie", &cookie);
        self
    }

    pub fn clear_cookie(&mut self, name: &str) -> &mut Self {
        self.append_header("set-cookie", &format!("{name}=; Path=/; Max-Age=0"));
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.buffer
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.buffer = body;
    }

    pub fn body_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Register a pre-finalize callback. Callbacks run in registration
    /// order during [`finalize`](Self::finalize); callbacks registered
    /// while finalizing are dropped.
    pub fn on_finalize(&mut self, callback: impl FnOnce(&mut XyResponse) + Send + 'static) {
        self.finalizers.push(Box::new(callback));
    }

    /// Run pre-finalize callbacks and hand back the wire parts.
    pub fn finalize(mut self) -> (StatusCode, HeaderMap, Bytes) {
        let finalizers = std::mem::take(&mut self.finalizers);
        for finalizer in finalizers {
            finalizer(&mut self);
        }
        self.finalizers.clear();
        (self.status, self.headers, Bytes::from(self.buffer))
    }

    /// Finalize into a transport response.
    pub fn into_axum(self) -> axum::response::Response {
        let (status, headers, body) = self.finalize();
        let mut response = axum::response::Response::new(axum::body::Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request(headers: &[(&str, &str)]) -> XyRequest {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        XyRequest::adapt(
            Method::GET,
            "/items/42?page=2&q=hello%20world".parse().unwrap(),
            map,
            Bytes::new(),
            "192.0.2.1:4711".parse().unwrap(),
            true,
            false,
            false,
        )
    }

    #[test]
    fn headers_are_lowercased_and_flattened() {
        let req = sample_request(&[("Accept", "text/html"), ("ACCEPT", "application/json")]);
        assert_eq!(req.header("accept"), Some("text/html, application/json"));
    }

    #[test]
    fn query_and_cookies_parse_once() {
        let req = sample_request(&[("Cookie", "a=1; xems_token=tok-123")]);
        assert_eq!(req.query.get("page").map(String::as_str), Some("2"));
        assert_eq!(req.query.get("q").map(String::as_str), Some("hello world"));
        assert_eq!(req.cookie("xems_token"), Some("tok-123"));
    }

    #[test]
    fn ip_honors_forwarded_for_only_with_trust_proxy() {
        let trusted = sample_request(&[("X-Forwarded-For", "203.0.113.5, 10.0.0.1")]);
        assert_eq!(trusted.ip(), "203.0.113.5");

        let mut direct = sample_request(&[("X-Forwarded-For", "203.0.113.5")]);
        direct.trust_proxy = false;
        assert_eq!(direct.ip(), "192.0.2.1");
    }

    #[test]
    fn response_buffers_until_finalize() {
        let mut res = XyResponse::new();
        res.status(201);
        res.write(b"hello ").write(b"world").end();
        res.write(b" ignored");
        let (status, _, body) = res.finalize();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body.as_ref(), b"hello world");
    }

    #[test]
    fn finalizers_run_in_registration_order() {
        let mut res = XyResponse::new();
        res.on_finalize(|r| {
            r.set_header("x-order", "first");
        });
        res.on_finalize(|r| {
            let prior = r.get_header("x-order").unwrap_or("").to_string();
            r.set_header("x-order", &format!("{prior},second"));
        });
        let (_, headers, _) = res.finalize();
        assert_eq!(headers.get("x-order").unwrap(), "first,second");
    }

    #[test]
    fn cookies_carry_configured_attributes() {
        let mut res = XyResponse::new();
        res.cookie("xems_token", "abc", &CookieOptions::default());
        let cookie = res.get_header("set-cookie").unwrap();
        assert!(cookie.contains("xems_token=abc"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Secure"));
        assert!(cookie.contains("SameSite=Strict"));
    }

    #[test]
    fn json_sets_content_type() {
        let mut res = XyResponse::new();
        res.json(&serde_json::json!({"ok": true})).unwrap();
        assert_eq!(res.get_header("content-type"), Some("application/json"));
    }
}
