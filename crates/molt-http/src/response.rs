//! HTTP response serialization.
//!
//! [`ResponseWriter`] emits a response in wire order: status line, headers,
//! blank line, body chunks. Connections are never kept alive, so every
//! response carries `Connection: close` and the connection is closed after
//! the body.
//!
//! Interim responses are supported ahead of the final status: a single
//! `100 Continue` (see [`CONTINUE_RESPONSE`]) and any number of
//! `103 Early Hints` blocks. Every interim and final status line carries
//! the full `HTTP/1.1 ` prefix.

use std::io::{self, Write};

/// The raw bytes for an HTTP/1.1 100 Continue interim response.
pub const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Canonical reason phrase for a status code.
#[must_use]
pub const fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        103 => "Early Hints",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// A minimal headerless response for error paths, e.g.
/// `HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n`.
#[must_use]
pub fn simple_response(status: u16) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
        status,
        reason_phrase(status)
    )
    .into_bytes()
}

/// Serializes one response onto a connection.
///
/// The head is staged in an internal buffer and flushed in a single write;
/// body chunks are written through as they arrive.
#[derive(Debug)]
pub struct ResponseWriter<W> {
    out: W,
    buf: Vec<u8>,
    started: bool,
}

impl<W: Write> ResponseWriter<W> {
    /// Wrap the connection's write half.
    #[must_use]
    pub fn new(out: W) -> Self {
        Self {
            out,
            buf: Vec::with_capacity(1024),
            started: false,
        }
    }

    /// True once any byte of the final status line has been written.
    ///
    /// Error handling uses this to decide whether a 500 can still be sent.
    #[inline]
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Send `100 Continue`. Must precede the final head.
    pub fn write_continue(&mut self) -> io::Result<()> {
        debug_assert!(!self.started);
        self.out.write_all(CONTINUE_RESPONSE)
    }

    /// Send one `103 Early Hints` block. May be called repeatedly, but
    /// only before the final head.
    pub fn write_early_hints(&mut self, headers: &[(String, String)]) -> io::Result<()> {
        debug_assert!(!self.started);
        self.buf.clear();
        self.buf.extend_from_slice(b"HTTP/1.1 103 Early Hints\r\n");
        for (name, value) in headers {
            self.push_header(name, value.as_bytes());
        }
        self.buf.extend_from_slice(b"\r\n");
        self.out.write_all(&self.buf)
    }

    /// Write the final status line and headers.
    ///
    /// Application headers are passed through as given, except `Connection`,
    /// which is replaced by the writer's own `Connection: close`. No
    /// `Content-Length` is synthesized: absent one, the body streams until
    /// the connection closes.
    pub fn write_head(&mut self, status: u16, headers: &[(String, Vec<u8>)]) -> io::Result<()> {
        self.buf.clear();
        self.buf.extend_from_slice(b"HTTP/1.1 ");
        self.buf.extend_from_slice(status.to_string().as_bytes());
        self.buf.push(b' ');
        self.buf.extend_from_slice(reason_phrase(status).as_bytes());
        self.buf.extend_from_slice(b"\r\n");

        for (name, value) in headers {
            if name.eq_ignore_ascii_case("connection") {
                continue;
            }
            self.push_header(name, value);
        }
        self.buf.extend_from_slice(b"Connection: close\r\n\r\n");

        self.started = true;
        self.out.write_all(&self.buf)
    }

    /// Write one body chunk.
    pub fn write_body(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.out.write_all(chunk)
    }

    /// Flush the connection after the last body chunk.
    pub fn finish(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    /// Write a complete minimal error response, unless a head already went
    /// out (in which case nothing more can be said on this connection).
    pub fn write_error(&mut self, status: u16) -> io::Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        self.out.write_all(&simple_response(status))
    }

    fn push_header(&mut self, name: &str, value: &[u8]) {
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.extend_from_slice(b": ");
        self.buf.extend_from_slice(value);
        self.buf.extend_from_slice(b"\r\n");
    }
}
