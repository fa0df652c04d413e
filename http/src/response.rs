//! Incremental HTTP response parser.
//!
//! Bytes stream in through [`HttpResponse::advance`]; the head is parsed
//! once its terminator arrives, after which the body is consumed according
//! to `Content-Length`, chunked transfer coding, or until the peer closes
//! the connection.

use bytes::BytesMut;
use thiserror::Error;

const MAX_HEADERS: usize = 64;

/// Parse failures for inbound responses.
#[derive(Error, Debug)]
pub enum HttpError {
    /// The status line or headers are malformed.
    #[error("malformed response header")]
    Header,
    /// The chunked transfer coding is malformed.
    #[error("malformed chunked encoding")]
    Chunk,
}

/// What a call to [`HttpResponse::advance`] made happen.
#[derive(Debug, Clone, Copy, Default)]
pub struct Progress {
    /// The header just completed during this call.
    pub header_complete: bool,
    /// The whole response just completed during this call.
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    Body,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    None,
    Length(usize),
    Chunked,
    UntilClose,
}

/// A response being reassembled from stream bytes.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    buffer: BytesMut,
    phase: Phase,
    protocol: String,
    status: u16,
    status_phrase: String,
    headers: Vec<(String, String)>,
    mode: BodyMode,
    body: Vec<u8>,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpResponse {
    /// Empty response awaiting bytes.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            phase: Phase::Header,
            protocol: String::new(),
            status: 0,
            status_phrase: String::new(),
            headers: Vec::new(),
            mode: BodyMode::UntilClose,
            body: Vec::new(),
        }
    }

    /// Feed received bytes and report what completed.
    ///
    /// Once the response is done, further bytes are ignored.
    pub fn advance(&mut self, data: &[u8]) -> Result<Progress, HttpError> {
        let mut progress = Progress::default();
        if self.phase == Phase::Done {
            return Ok(progress);
        }
        self.buffer.extend_from_slice(data);

        if self.phase == Phase::Header {
            let parsed = {
                let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut response = httparse::Response::new(&mut headers);
                match response.parse(&self.buffer) {
                    Ok(httparse::Status::Complete(header_len)) => Some((
                        header_len,
                        response.version.unwrap_or(1),
                        response.code.unwrap_or(0),
                        response.reason.unwrap_or("").to_string(),
                        response
                            .headers
                            .iter()
                            .map(|h| {
                                (
                                    h.name.to_string(),
                                    String::from_utf8_lossy(h.value).into_owned(),
                                )
                            })
                            .collect::<Vec<_>>(),
                    )),
                    Ok(httparse::Status::Partial) => None,
                    Err(_) => return Err(HttpError::Header),
                }
            };

            let Some((header_len, version, status, phrase, headers)) = parsed else {
                return Ok(progress);
            };
            self.protocol = format!("HTTP/1.{version}");
            self.status = status;
            self.status_phrase = phrase;
            self.headers = headers;
            let _ = self.buffer.split_to(header_len);
            self.mode = self.body_mode();
            self.phase = Phase::Body;
            progress.header_complete = true;
        }

        if self.phase == Phase::Body && self.consume_body()? {
            self.phase = Phase::Done;
            progress.complete = true;
        }
        Ok(progress)
    }

    /// End-of-stream notification. Completes a read-until-close body;
    /// returns whether the response just became complete.
    pub fn finish_on_close(&mut self) -> bool {
        if self.phase == Phase::Body && self.mode == BodyMode::UntilClose {
            self.phase = Phase::Done;
            true
        } else {
            false
        }
    }

    /// Reset for the next response on a kept-alive connection.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Whether the status line and headers are still incomplete.
    pub fn is_pending_header(&self) -> bool {
        self.phase == Phase::Header
    }

    /// Whether the body is still incomplete.
    pub fn is_pending_body(&self) -> bool {
        self.phase == Phase::Body
    }

    /// Whether the response is fully received.
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Protocol version string, e.g. `HTTP/1.1`.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Status reason phrase.
    pub fn status_phrase(&self) -> &str {
        &self.status_phrase
    }

    /// Headers in wire order.
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

    /// Body bytes decoded so far (complete once [`Self::is_done`]).
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    fn body_mode(&self) -> BodyMode {
        if self.status / 100 == 1 || self.status == 204 || self.status == 304 {
            return BodyMode::None;
        }
        if self
            .header("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
        {
            return BodyMode::Chunked;
        }
        if let Some(length) = self.header("content-length").and_then(|v| v.parse().ok()) {
            return BodyMode::Length(length);
        }
        BodyMode::UntilClose
    }

    fn consume_body(&mut self) -> Result<bool, HttpError> {
        match self.mode {
            BodyMode::None => Ok(true),
            BodyMode::Length(length) => {
                if self.buffer.len() >= length {
                    self.body = self.buffer.split_to(length).to_vec();
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            BodyMode::Chunked => self.consume_chunks(),
            BodyMode::UntilClose => {
                let tail = self.buffer.split_to(self.buffer.len());
                self.body.extend_from_slice(&tail);
                Ok(false)
            }
        }
    }

    fn consume_chunks(&mut self) -> Result<bool, HttpError> {
        loop {
            let Some(line_end) = find(&self.buffer, b"\r\n") else {
                return Ok(false);
            };
            let size_text = std::str::from_utf8(&self.buffer[..line_end])
                .map_err(|_| HttpError::Chunk)?;
            let size_text = size_text.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_text, 16).map_err(|_| HttpError::Chunk)?;

            if size == 0 {
                // Terminator, possibly preceded by trailer headers.
                let rest = line_end + 2;
                if self.buffer.len() < rest + 2 {
                    return Ok(false);
                }
                if &self.buffer[rest..rest + 2] == b"\r\n" {
                    let _ = self.buffer.split_to(rest + 2);
                    return Ok(true);
                }
                if let Some(end) = find(&self.buffer[rest..], b"\r\n\r\n") {
                    let _ = self.buffer.split_to(rest + end + 4);
                    return Ok(true);
                }
                return Ok(false);
            }

            let data_start = line_end + 2;
            let data_end = data_start + size;
            if self.buffer.len() < data_end + 2 {
                return Ok(false);
            }
            if &self.buffer[data_end..data_end + 2] != b"\r\n" {
                return Err(HttpError::Chunk);
            }
            self.body.extend_from_slice(&self.buffer[data_start..data_end]);
            let _ = self.buffer.split_to(data_end + 2);
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_length_body_across_feeds() {
        let mut response = HttpResponse::new();

        let progress = response
            .advance(b"HTTP/1.1 200 OK\r\nContent-")
            .unwrap();
        assert!(!progress.header_complete);
        assert!(response.is_pending_header());

        let progress = response
            .advance(b"Length: 10\r\nServer: test\r\n\r\n01234")
            .unwrap();
        assert!(progress.header_complete);
        assert!(!progress.complete);
        assert_eq!(response.status(), 200);
        assert_eq!(response.header("server"), Some("test"));

        let progress = response.advance(b"56789").unwrap();
        assert!(progress.complete);
        assert!(response.is_done());
        assert_eq!(response.body(), b"0123456789");
        assert_eq!(response.protocol(), "HTTP/1.1");
    }

    #[test]
    fn chunked_body_reassembles() {
        let mut response = HttpResponse::new();
        let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert!(response.advance(head).unwrap().header_complete);

        assert!(!response.advance(b"5\r\nhello\r\n").unwrap().complete);
        assert!(!response.advance(b"8\r\n, wor").unwrap().complete);
        let progress = response.advance(b"ld!\r\n0\r\n\r\n").unwrap();
        assert!(progress.complete);
        assert_eq!(response.body(), b"hello, world!");
    }

    #[test]
    fn no_content_completes_without_body() {
        let mut response = HttpResponse::new();
        let progress = response.advance(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap();
        assert!(progress.header_complete);
        assert!(progress.complete);
        assert!(response.body().is_empty());
    }

    #[test]
    fn until_close_body_finishes_on_close() {
        let mut response = HttpResponse::new();
        response.advance(b"HTTP/1.1 200 OK\r\n\r\npartial").unwrap();
        assert!(response.is_pending_body());

        response.advance(b" stream").unwrap();
        assert!(response.finish_on_close());
        assert!(response.is_done());
        assert_eq!(response.body(), b"partial stream");
    }

    #[test]
    fn malformed_header_is_rejected() {
        let mut response = HttpResponse::new();
        assert!(response.advance(b"NOT HTTP AT ALL\r\n\r\n").is_err());
    }
}
