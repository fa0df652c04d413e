//! HTTP request builder with a serialized byte cache.

use std::fmt;

/// An HTTP request under construction.
///
/// Headers and body are appended through the builder methods; the wire form
/// is produced by [`HttpRequest::to_bytes`]. Setting a body records its
/// `Content-Length` automatically.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: String,
    target: String,
    protocol: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpRequest {
    /// Request with the given method and target, speaking HTTP/1.1.
    pub fn new(method: &str, target: &str) -> Self {
        Self {
            method: method.to_uppercase(),
            target: target.to_string(),
            protocol: "HTTP/1.1".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// GET request for `target`.
    pub fn make_get_request(target: &str) -> Self {
        Self::new("GET", target)
    }

    /// HEAD request for `target`.
    pub fn make_head_request(target: &str) -> Self {
        Self::new("HEAD", target)
    }

    /// POST request for `target` carrying `body`.
    pub fn make_post_request(target: &str, body: impl Into<Vec<u8>>) -> Self {
        Self::new("POST", target).with_body(body)
    }

    /// PUT request for `target` carrying `body`.
    pub fn make_put_request(target: &str, body: impl Into<Vec<u8>>) -> Self {
        Self::new("PUT", target).with_body(body)
    }

    /// DELETE request for `target`.
    pub fn make_delete_request(target: &str) -> Self {
        Self::new("DELETE", target)
    }

    /// Append a header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Set the body and its `Content-Length` header.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self.headers
            .push(("Content-Length".to_string(), self.body.len().to_string()));
        self
    }

    /// Request method (upper-cased).
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request target.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Protocol version string.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Headers in insertion order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Request body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Serialize into the on-wire byte form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(128 + self.body.len());
        bytes.extend_from_slice(
            format!("{} {} {}\r\n", self.method, self.target, self.protocol).as_bytes(),
        );
        for (name, value) in &self.headers {
            bytes.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        bytes.extend_from_slice(b"\r\n");
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.method, self.target, self.protocol)
    }
}
