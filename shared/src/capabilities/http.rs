use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::event::Event;
use crate::model::RequestId;

use super::Http;

pub const MAX_URL_LENGTH: usize = 2048;
pub const MAX_REQUEST_BODY_SIZE: usize = 1024 * 1024;
pub const MAX_HEADER_NAME_LENGTH: usize = 256;
pub const MAX_HEADER_VALUE_LENGTH: usize = 8192;
pub const MAX_HEADERS_COUNT: usize = 32;

const REDACTED_HEADERS: &[&str] = &["authorization", "cookie"];

/// Validated header list. `crux_http` panics on malformed header values, so
/// nothing reaches the builder without going through `insert`.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HttpHeaders {
    headers: Vec<(String, String)>,
}

impl HttpHeaders {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), HttpError> {
        let name = name.into();
        let value = value.into();

        Self::validate_header_name(&name)?;
        Self::validate_header_value(&name, &value)?;

        let name_lower = name.to_lowercase();
        self.headers.retain(|(n, _)| n.to_lowercase() != name_lower);

        if self.headers.len() >= MAX_HEADERS_COUNT {
            return Err(HttpError::InvalidHeader {
                name,
                reason: format!("more than {MAX_HEADERS_COUNT} headers"),
            });
        }

        self.headers.push((name, value));
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        let name_lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| n.to_lowercase() == name_lower)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    fn validate_header_name(name: &str) -> Result<(), HttpError> {
        if name.is_empty() {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: "header name cannot be empty".to_string(),
            });
        }

        if name.len() > MAX_HEADER_NAME_LENGTH {
            return Err(HttpError::InvalidHeader {
                name: name.chars().take(50).collect::<String>() + "...",
                reason: format!(
                    "header name exceeds maximum length of {MAX_HEADER_NAME_LENGTH} bytes"
                ),
            });
        }

        if let Some(c) = name
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && *c != '-' && *c != '_')
        {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: format!("invalid character '{c}' in header name"),
            });
        }

        let lower = name.to_lowercase();
        if lower == "host" || lower == "content-length" || lower == "transfer-encoding" {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: "this header is managed automatically".to_string(),
            });
        }

        Ok(())
    }

    fn validate_header_value(name: &str, value: &str) -> Result<(), HttpError> {
        if value.len() > MAX_HEADER_VALUE_LENGTH {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: format!(
                    "header value exceeds maximum length of {MAX_HEADER_VALUE_LENGTH} bytes"
                ),
            });
        }

        if !value.chars().all(|c| c.is_ascii() && (c == '\t' || !c.is_ascii_control())) {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: "header value must be printable ASCII".to_string(),
            });
        }

        Ok(())
    }
}

// Bearer tokens travel in headers; keep them out of logs.
impl fmt::Debug for HttpHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in &self.headers {
            if REDACTED_HEADERS.contains(&name.to_lowercase().as_str()) {
                map.entry(name, &"[REDACTED]");
            } else {
                map.entry(name, value);
            }
        }
        map.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    #[must_use]
    pub const fn has_request_body(self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }

    fn to_crux(self) -> crux_http::http::Method {
        use crux_http::http::Method;
        match self {
            HttpMethod::Get => Method::Get,
            HttpMethod::Post => Method::Post,
            HttpMethod::Put => Method::Put,
            HttpMethod::Patch => Method::Patch,
            HttpMethod::Delete => Method::Delete,
        }
    }
}

/// A request checked and ready to hand to [`Http`]. The response comes back
/// as `Event::HttpResponse` carrying the same id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    id: RequestId,
    method: HttpMethod,
    url: Url,
    headers: HttpHeaders,
    body: Option<Vec<u8>>,
}

impl OutboundRequest {
    pub fn new(id: RequestId, method: HttpMethod, url: &str) -> Result<Self, HttpError> {
        if url.len() > MAX_URL_LENGTH {
            return Err(HttpError::InvalidUrl {
                url: url.chars().take(100).collect(),
                reason: format!("URL exceeds maximum length of {MAX_URL_LENGTH} bytes"),
            });
        }

        let parsed = Url::parse(url).map_err(|e| HttpError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(HttpError::InvalidUrl {
                url: url.to_string(),
                reason: format!(
                    "invalid scheme '{}', only 'http' and 'https' are allowed",
                    parsed.scheme()
                ),
            });
        }

        if parsed.host_str().is_none() {
            return Err(HttpError::InvalidUrl {
                url: url.to_string(),
                reason: "URL must have a host".to_string(),
            });
        }

        Ok(Self {
            id,
            method,
            url: parsed,
            headers: HttpHeaders::new(),
            body: None,
        })
    }

    pub fn get(id: RequestId, url: &str) -> Result<Self, HttpError> {
        Self::new(id, HttpMethod::Get, url)
    }

    pub fn post(id: RequestId, url: &str) -> Result<Self, HttpError> {
        Self::new(id, HttpMethod::Post, url)
    }

    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, HttpError> {
        self.headers.insert(name, value)?;
        Ok(self)
    }

    pub fn with_bearer(self, token: &str) -> Result<Self, HttpError> {
        self.with_header("Authorization", format!("Bearer {token}"))
    }

    pub fn with_json<T: Serialize>(mut self, value: &T) -> Result<Self, HttpError> {
        if !self.method.has_request_body() {
            return Err(HttpError::InvalidRequest {
                reason: format!("{} requests cannot have a body", self.method.as_str()),
            });
        }

        let body = serde_json::to_vec(value).map_err(|e| HttpError::Serialization {
            message: e.to_string(),
        })?;

        if body.len() > MAX_REQUEST_BODY_SIZE {
            return Err(HttpError::InvalidRequest {
                reason: format!(
                    "request body of {} bytes exceeds maximum of {MAX_REQUEST_BODY_SIZE}",
                    body.len()
                ),
            });
        }

        self.headers.insert("Content-Type", "application/json")?;
        self.body = Some(body);
        Ok(self)
    }

    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    #[must_use]
    pub const fn method(&self) -> HttpMethod {
        self.method
    }

    #[must_use]
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    #[must_use]
    pub const fn headers(&self) -> &HttpHeaders {
        &self.headers
    }

    /// Issue the request. Headers go on before the body so the explicit
    /// Content-Type wins over the one inferred from the bytes.
    pub fn send(self, http: &Http<Event>) {
        let Self {
            id,
            method,
            url,
            headers,
            body,
        } = self;
        debug!(request = %id, method = method.as_str(), "sending request");

        let mut builder = http.request(method.to_crux(), url);
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            builder = builder.body_bytes(body);
        }
        builder.send(move |result| Event::HttpResponse {
            id,
            result: Box::new(settle(result)),
        });
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum HttpError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("serialization error: {message}")]
    Serialization { message: String },

    #[error("connection failed: {message}")]
    Connection { message: String },

    #[error("request timed out")]
    Timeout,

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },
}

impl HttpError {
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, HttpError::Connection { .. } | HttpError::Timeout)
    }
}

/// Status and body of a completed exchange, whatever the status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    status: u16,
    body: Vec<u8>,
}

impl HttpReply {
    #[must_use]
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }

    #[must_use]
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::new(status, value.to_string().into_bytes())
    }

    #[must_use]
    pub const fn status(&self) -> u16 {
        self.status
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

pub type HttpOutcome = Result<HttpReply, HttpError>;

/// Fold a `crux_http` result into an outcome. Error statuses arrive from
/// `crux_http` as errors but still carry a body the API layer must read,
/// so they become replies here.
#[must_use]
pub fn settle(result: crux_http::Result<crux_http::Response<Vec<u8>>>) -> HttpOutcome {
    match result {
        Ok(mut response) => {
            let status = response.status() as u16;
            Ok(HttpReply::new(status, response.take_body().unwrap_or_default()))
        }
        Err(crux_http::Error::Http(error)) => Ok(HttpReply::new(
            error.code as u16,
            error.body.unwrap_or_default(),
        )),
        Err(crux_http::Error::Timeout) => Err(HttpError::Timeout),
        Err(crux_http::Error::Io(message)) => Err(HttpError::Connection { message }),
        Err(crux_http::Error::Json(reason)) => Err(HttpError::InvalidResponse { reason }),
        Err(crux_http::Error::Url(reason)) => Err(HttpError::InvalidUrl {
            url: String::new(),
            reason,
        }),
    }
}
