//! HTTP request and response values exchanged with the network engine.
//!
//! # Design
//! `HttpRequest` is what callers describe: plain owned data, no validation.
//! `HttpRequest::prepare` checks it once, synchronously, and produces a
//! `PreparedRequest` made of typed `http` values, so the worker thread never
//! has to deal with malformed input. Both own all of their data; nothing
//! borrows from the caller past submission.
//!
//! `HttpResponse` owns its body as a `Buffer`. Handing it to the callback
//! hands over the only copy.

use ureq::http::header::{HeaderName, HeaderValue};
use ureq::http::{Method, Uri};

use crate::buffer::Buffer;
use crate::error::{ErrorCode, PlatformError};

/// HTTP method for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    /// Any other method token, e.g. `PATCH` or `PROPFIND`.
    Custom(String),
}

impl HttpMethod {
    pub fn as_str(&self) -> &str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Custom(token) => token,
        }
    }
}

/// An outbound request described as plain data.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Reserved for transport hints; carried through unchanged.
    pub flags: u32,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Vec::new(),
            flags: 0,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Validate and convert into the form the worker executes.
    pub fn prepare(self) -> Result<PreparedRequest, PlatformError> {
        let method = match &self.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
            HttpMethod::Custom(token) => {
                if token.is_empty() {
                    return Err(PlatformError::bad_argument("custom method is empty"));
                }
                Method::from_bytes(token.as_bytes()).map_err(|_| {
                    PlatformError::bad_argument(format!("invalid method token {token:?}"))
                })?
            }
        };

        let uri = parse_target(&self.url)?;

        let mut headers = Vec::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| PlatformError::bad_argument(format!("invalid header name {name:?}")))?;
            let header_value = HeaderValue::from_str(value).map_err(|_| {
                PlatformError::bad_argument(format!("invalid value for header {name:?}"))
            })?;
            headers.push((header_name, header_value));
        }

        Ok(PreparedRequest {
            method,
            uri,
            headers,
            body: self.body,
            flags: self.flags,
        })
    }
}

/// Accept only absolute `http`/`https` URLs with a host.
fn parse_target(url: &str) -> Result<Uri, PlatformError> {
    if url.is_empty() {
        return Err(PlatformError::bad_argument("url is empty"));
    }
    let uri: Uri = url
        .parse()
        .map_err(|_| PlatformError::bad_argument(format!("malformed url {url:?}")))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        Some(other) => {
            return Err(PlatformError::bad_argument(format!("unsupported scheme {other:?}")));
        }
        None => return Err(PlatformError::bad_argument(format!("url {url:?} is not absolute"))),
    }
    if uri.host().map_or(true, str::is_empty) {
        return Err(PlatformError::bad_argument(format!("url {url:?} has no host")));
    }
    Ok(uri)
}

/// A validated request, owned by the worker that executes it.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: Vec<u8>,
    pub flags: u32,
}

/// Result of one request, delivered to the callback.
///
/// `error` is `Ok` when the exchange completed; `status`, `headers` and
/// `body` are meaningful only then. Headers are grouped by name, names in
/// first-seen order; repeated names keep their relative order.
#[derive(Debug)]
pub struct HttpResponse {
    pub error: ErrorCode,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Buffer,
}

impl HttpResponse {
    pub fn failed(error: ErrorCode) -> Self {
        Self {
            error,
            status: 0,
            headers: Vec::new(),
            body: Buffer::empty(),
        }
    }

    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}
