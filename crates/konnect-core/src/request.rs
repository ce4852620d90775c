//! Request descriptors handed to the transfer engine.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use url::Url;

use crate::error::{TransferError, TransferResult};

/// URI schemes the engine is allowed to service.
pub const SUPPORTED_SCHEMES: &[&str] = &["http", "https", "ftp", "ftps"];

/// Request method.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Method {
    /// `GET`
    #[default]
    Get,
    /// `HEAD`
    Head,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `PATCH`
    Patch,
    /// `DELETE`
    Delete,
    /// `OPTIONS`
    Options,
    /// Any other method token.
    Custom(String),
}

impl Method {
    /// Wire representation of the method.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Custom(token) => token,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of the request body.
#[derive(Default)]
pub enum RequestBody {
    /// No body is sent.
    #[default]
    Empty,
    /// A fixed buffer sent as-is.
    Bytes(Bytes),
    /// A lazy sequence of chunks pulled by the engine as it uploads.
    Chunks(Box<dyn Iterator<Item = Bytes> + Send>),
}

impl RequestBody {
    /// Build a lazily pulled body from any chunk iterator.
    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
        I::IntoIter: Send + 'static,
    {
        Self::Chunks(Box::new(chunks.into_iter()))
    }

    /// Whether no body is attached.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Size of the body when known up front.
    #[must_use]
    pub fn known_len(&self) -> Option<u64> {
        match self {
            Self::Empty => Some(0),
            Self::Bytes(bytes) => u64::try_from(bytes.len()).ok(),
            Self::Chunks(_) => None,
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Chunks(_) => f.write_str("Chunks(..)"),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<&'static str> for RequestBody {
    fn from(value: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(value.as_bytes()))
    }
}

impl From<String> for RequestBody {
    fn from(value: String) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

/// Descriptor for a single transfer.
#[derive(Debug, Default)]
pub struct Request {
    /// Request method.
    pub method: Method,
    /// Target URI exactly as supplied by the caller.
    pub target: String,
    /// Header list in send order.
    pub headers: Vec<(String, String)>,
    /// Optional body source.
    pub body: RequestBody,
    /// Overall transfer timeout overriding the bridge default.
    pub timeout: Option<Duration>,
    /// Redirect policy overriding the bridge default.
    pub follow_redirects: Option<bool>,
}

impl Request {
    /// Create a request for the given method and target.
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            ..Self::default()
        }
    }

    /// Shorthand for a `GET` request.
    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::Get, target)
    }

    /// Shorthand for a `POST` request carrying a body.
    pub fn post(target: impl Into<String>, body: impl Into<RequestBody>) -> Self {
        Self::new(Method::Post, target).body(body)
    }

    /// Append a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach a body.
    #[must_use]
    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    /// Override the overall transfer timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the redirect policy.
    #[must_use]
    pub const fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = Some(follow);
        self
    }

    /// Check the descriptor and return the parsed target.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidRequest`] when the target is malformed or uses an
    /// unsupported scheme, when the method or a header is not a valid token, or when a
    /// body is attached to a `HEAD` request.
    pub fn validate(&self) -> TransferResult<Url> {
        if let Method::Custom(token) = &self.method
            && !is_token(token)
        {
            return Err(TransferError::invalid("method", "invalid method token"));
        }

        let url = Url::parse(&self.target)
            .map_err(|_| TransferError::invalid("target", "malformed uri"))?;
        if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
            return Err(TransferError::invalid("target", "unsupported scheme"));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(TransferError::invalid("target", "missing host"));
        }

        for (name, value) in &self.headers {
            if !is_token(name) {
                return Err(TransferError::invalid("headers", "invalid header name"));
            }
            if value.bytes().any(|byte| byte == b'\r' || byte == b'\n' || byte == 0) {
                return Err(TransferError::invalid("headers", "invalid header value"));
            }
        }

        if self.method == Method::Head && !self.body.is_empty() {
            return Err(TransferError::invalid("body", "method does not allow a body"));
        }

        if self.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(TransferError::invalid("timeout", "timeout must be positive"));
        }

        Ok(url)
    }
}

fn is_token(value: &str) -> bool {
    !value.is_empty()
        && value.bytes().all(|byte| {
            byte.is_ascii_alphanumeric()
                || matches!(
                    byte,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_http_request() -> anyhow::Result<()> {
        let request = Request::get("https://example.com/path?q=1").header("Accept", "*/*");
        let url = request.validate()?;
        assert_eq!(url.host_str(), Some("example.com"));
        Ok(())
    }

    #[test]
    fn rejects_unsupported_scheme() {
        let err = Request::get("gopher://example.com/")
            .validate()
            .expect_err("gopher should be rejected");
        assert_eq!(err, TransferError::invalid("target", "unsupported scheme"));
    }

    #[test]
    fn rejects_malformed_uri() {
        let err = Request::get("not a uri")
            .validate()
            .expect_err("garbage should be rejected");
        assert_eq!(err, TransferError::invalid("target", "malformed uri"));
    }

    #[test]
    fn rejects_header_injection() {
        let err = Request::get("http://example.com/")
            .header("X-Test", "a\r\nInjected: yes")
            .validate()
            .expect_err("CRLF in header value should be rejected");
        assert_eq!(err, TransferError::invalid("headers", "invalid header value"));

        let err = Request::get("http://example.com/")
            .header("Bad Name", "x")
            .validate()
            .expect_err("space in header name should be rejected");
        assert_eq!(err, TransferError::invalid("headers", "invalid header name"));
    }

    #[test]
    fn rejects_head_with_body() {
        let err = Request::new(Method::Head, "http://example.com/")
            .body("payload")
            .validate()
            .expect_err("HEAD with body should be rejected");
        assert_eq!(
            err,
            TransferError::invalid("body", "method does not allow a body")
        );
    }

    #[test]
    fn rejects_zero_timeout_and_bad_method() {
        let err = Request::get("http://example.com/")
            .timeout(Duration::ZERO)
            .validate()
            .expect_err("zero timeout should be rejected");
        assert_eq!(err, TransferError::invalid("timeout", "timeout must be positive"));

        let err = Request::new(Method::Custom("GET ME".into()), "http://example.com/")
            .validate()
            .expect_err("method with whitespace should be rejected");
        assert_eq!(err, TransferError::invalid("method", "invalid method token"));
    }

    #[test]
    fn body_length_is_known_only_for_buffers() {
        assert_eq!(RequestBody::Empty.known_len(), Some(0));
        assert_eq!(RequestBody::from("abc").known_len(), Some(3));
        let chunks = RequestBody::from_chunks(vec![Bytes::from_static(b"a")]);
        assert_eq!(chunks.known_len(), None);
        assert_eq!(format!("{chunks:?}"), "Chunks(..)");
    }
}
