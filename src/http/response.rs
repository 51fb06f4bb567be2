//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing HTTP responses and
//! serializing them to a byte buffer for transmission over TCP. A response can
//! also be split into its parts and rebuilt, which is how the cache stage
//! stores and replays generated responses.

use bytes::{BufMut, BytesMut};

use super::{Headers, StatusCode};

// Written by `into_bytes` from the response itself; any stored copy is stale.
const FRAMING_HEADERS: [&str; 2] = ["content-length", "connection"];

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use corral::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/rss+xml")
///     .body("<rss></rss>");
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 11\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Vec<u8>,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self::from_parts(status, Headers::new(), Vec::new())
    }

    /// Assembles a keep-alive response from previously split parts.
    pub fn from_parts(status: StatusCode, headers: Headers, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
            keep_alive: true,
        }
    }

    /// Splits the response into status, headers and body.
    pub fn into_parts(self) -> (StatusCode, Headers, Vec<u8>) {
        (self.status, self.headers, self.body)
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header to a response received from downstream.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into().into_bytes();
        self
    }

    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Controls whether `Connection: keep-alive` or `Connection: close` is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns `false` if the connection will be closed after this response.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn payload(&self) -> &[u8] {
        &self.body
    }

    /// Serializes the response into HTTP/1.1 wire format.
    ///
    /// `Content-Length` and `Connection` are always derived from the response
    /// itself, replacing any copies already in the header map. A non-empty
    /// body without a `Content-Type` is labelled `text/plain; charset=utf-8`.
    pub fn into_bytes(self) -> BytesMut {
        let content_length = self.body.len();
        let mut headers = self.headers.without(&FRAMING_HEADERS);

        if content_length > 0 && !headers.contains("content-type") {
            headers.insert("Content-Type", "text/plain; charset=utf-8");
        }
        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        headers.insert("Connection", connection);

        let estimated_size = 128 + headers.len() * 64 + content_length;
        let mut buf = BytesMut::with_capacity(estimated_size);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );
        for (name, value) in headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }
        // Content-Length is always the last header before the blank line
        buf.put(format!("Content-Length: {content_length}\r\n\r\n").as_bytes());
        buf.put(self.body.as_slice());

        buf
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

    fn wire(r: Response) -> String {
        String::from_utf8(r.into_bytes().to_vec()).unwrap()
    }

    #[test]
    fn feed_response_on_the_wire() {
        let s = wire(
            Response::new(StatusCode::Ok)
                .header("Content-Type", "application/rss+xml")
                .header("X-Cache-Status", "HIT")
                .body("<rss/>"),
        );
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Type: application/rss+xml\r\n"));
        assert!(s.contains("X-Cache-Status: HIT\r\n"));
        assert!(s.contains("Connection: keep-alive\r\n"));
        assert!(s.ends_with("Content-Length: 6\r\n\r\n<rss/>"));
    }

    #[test]
    fn empty_body_gets_no_content_type() {
        let s = wire(Response::new(StatusCode::NoContent));
        assert!(!s.contains("Content-Type"));
        assert!(s.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn stale_framing_headers_are_replaced() {
        let s = wire(
            Response::new(StatusCode::Ok)
                .header("Content-Length", "999")
                .header("Connection", "keep-alive")
                .body("abc")
                .keep_alive(false),
        );
        assert_eq!(s.matches("Content-Length").count(), 1);
        assert!(s.contains("Content-Length: 3\r\n"));
        assert_eq!(s.matches("Connection").count(), 1);
        assert!(s.contains("Connection: close\r\n"));
    }

    #[test]
    fn parts_round_trip_keeps_headers_in_order() {
        let original = Response::new(StatusCode::Accepted)
            .header("Vary", "Accept")
            .header("Cache-Control", "no-cache")
            .body_bytes(vec![1, 2, 3]);
        assert_eq!(original.headers().get("cache-control"), Some("no-cache"));
        assert_eq!(original.payload(), &[1, 2, 3]);

        let (status, headers, body) = original.into_parts();
        let rebuilt = Response::from_parts(status, headers, body);
        assert_eq!(rebuilt.status(), StatusCode::Accepted);
        assert!(rebuilt.is_keep_alive());
        let names: Vec<_> = rebuilt.headers().iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["Vary", "Cache-Control"]);
    }

    #[test]
    fn service_unavailable_reason_phrase() {
        let s = wire(Response::new(StatusCode::ServiceUnavailable).keep_alive(false));
        assert!(s.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
    }
}
