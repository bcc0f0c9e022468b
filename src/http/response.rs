//! Response produced by the backend or replayed from the cache.
//!
//! A fluent builder in the style of the rest of the HTTP types. Wire
//! serialization is left to the transport.

use bytes::Bytes;

use super::{Headers, StatusCode};

/// An HTTP response: status, headers, body and optional trailers.
///
/// # Examples
///
/// ```
/// use outcache::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .header("Cache-Control", "public, max-age=60")
///     .body(r#"["sneaker"]"#);
///
/// assert_eq!(response.status(), StatusCode::Ok);
/// assert_eq!(response.headers().get("cache-control"), Some("public, max-age=60"));
/// assert_eq!(response.body_bytes().as_ref(), br#"["sneaker"]"#);
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    trailers: Headers,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
            trailers: Headers::new(),
        }
    }

    /// Assembles a response from already-owned parts.
    pub fn from_parts(status: StatusCode, headers: Headers, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            trailers: Headers::new(),
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place. Intended for middleware pipelines that receive
    /// a `Response` from downstream and need to decorate it without consuming it.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Appends a trailer field.
    #[must_use]
    pub fn trailer(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.trailers.insert(name, value);
        self
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Bytes::from(body.into());
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mutable access to the response headers.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the body. Cloning the returned [`Bytes`] is cheap.
    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// Returns the trailer fields, empty for most responses.
    pub fn trailers(&self) -> &Headers {
        &self.trailers
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_headers_and_body() {
        let r = Response::new(StatusCode::Ok)
            .header("X-Request-Id", "abc-123")
            .body("ok");
        assert_eq!(r.headers().get("x-request-id"), Some("abc-123"));
        assert_eq!(r.body_bytes().as_ref(), b"ok");
        assert!(r.trailers().is_empty());
    }

    #[test]
    fn trailers_are_kept_apart_from_headers() {
        let r = Response::new(StatusCode::Ok).trailer("Server-Timing", "db;dur=53");
        assert!(!r.headers().contains("server-timing"));
        assert_eq!(r.trailers().get("server-timing"), Some("db;dur=53"));
    }

    #[test]
    fn default_is_empty_ok() {
        let r = Response::default();
        assert_eq!(r.status(), StatusCode::Ok);
        assert!(r.body_bytes().is_empty());
    }
}
