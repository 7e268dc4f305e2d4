//! Staging a request from a freshly accepted connection.
//!
//! [`RequestReader`] drives the head parser over successive socket reads,
//! enforces the header cap, then installs the staged body input and the
//! process-wide environment defaults. The result is a [`RequestEnv`] ready
//! to hand to the application, or an [`Error`] describing how the
//! connection failed.

use crate::env::RequestEnv;
use crate::error::Error;
use crate::listener::Connection;
use crate::tee::{BodyInput, RawBody, StreamInput, TeeInput};
use molt_http::limits::{CHUNK_SIZE, MAX_HEADER};
use molt_http::parser::{HeadParser, HeadStatus};
use std::io::{self, Read};

/// Default in-memory body cap before spilling to a temp file.
pub const DEFAULT_CLIENT_BODY_BUFFER_SIZE: usize = 112 * 1024;

/// Server identification for `SERVER_SOFTWARE`.
pub const SERVER_SOFTWARE: &str = concat!("molt/", env!("CARGO_PKG_VERSION"));

/// Reads one request head and stages its body.
#[derive(Debug, Clone)]
pub struct RequestReader {
    /// Rewindable (tee-backed) body input vs forward-only streaming.
    pub rewindable_input: bool,
    /// In-memory body cap before spilling to disk.
    pub client_body_buffer_size: usize,
    /// Request-head size cap.
    pub max_header: usize,
}

impl Default for RequestReader {
    fn default() -> Self {
        Self {
            rewindable_input: true,
            client_body_buffer_size: DEFAULT_CLIENT_BODY_BUFFER_SIZE,
            max_header: MAX_HEADER,
        }
    }
}

impl RequestReader {
    /// A reader with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the head from `conn` and build the request environment.
    ///
    /// # Errors
    ///
    /// - [`Error::EntityTooLarge`] when the head exceeds the cap
    /// - [`Error::UriTooLong`] / [`Error::Parse`] on grammar violations
    /// - [`Error::ClientDisconnect`] when the peer goes away first
    pub fn read_request(&self, conn: &mut Connection) -> Result<RequestEnv, Error> {
        let mut env = RequestEnv::new();
        let mut parser = HeadParser::new();
        let mut buf: Vec<u8> = Vec::with_capacity(CHUNK_SIZE);
        let mut scratch = [0u8; CHUNK_SIZE];

        loop {
            match parser.execute(&mut env, &buf)? {
                HeadStatus::Complete => break,
                HeadStatus::Incomplete => {
                    if buf.len() > self.max_header {
                        return Err(Error::EntityTooLarge);
                    }
                    let n = read_retrying(conn, &mut scratch)?;
                    if n == 0 {
                        return Err(Error::ClientDisconnect(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "client closed before completing the request head",
                        )));
                    }
                    buf.extend_from_slice(&scratch[..n]);
                }
            }
        }

        env.set("REMOTE_ADDR", conn.remote_addr());
        self.merge_defaults(&mut env);

        let leftover = buf[env.body_offset()..].to_vec();
        let source: Box<dyn Read + Send> = Box::new(conn.try_clone().map_err(Error::Io)?);
        let raw = if parser.is_chunked() {
            RawBody::chunked(source, &leftover)
        } else {
            RawBody::fixed(source, leftover, parser.content_length().unwrap_or(0))
        };

        let input = if self.rewindable_input {
            BodyInput::Rewindable(TeeInput::new(raw, self.client_body_buffer_size))
        } else {
            BodyInput::Forward(StreamInput::new(raw))
        };
        env.set_input(input);

        Ok(env)
    }

    fn merge_defaults(&self, env: &mut RequestEnv) {
        env.set_default("SERVER_SOFTWARE", SERVER_SOFTWARE);
        env.set_default("SCRIPT_NAME", "");
        env.set_default("QUERY_STRING", "");

        // SERVER_NAME/SERVER_PORT from the Host header when present.
        let host = env.get("HTTP_HOST").unwrap_or("localhost").to_string();
        let (name, port) = split_host(&host);
        env.set_default("SERVER_NAME", &name);
        env.set_default("SERVER_PORT", &port);
    }
}

fn split_host(host: &str) -> (String, String) {
    // Bracketed IPv6 hosts keep their brackets in SERVER_NAME.
    if let Some(end) = host.rfind(']') {
        let name = &host[..=end];
        let port = host[end + 1..].strip_prefix(':').unwrap_or("80");
        return (name.to_string(), port.to_string());
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            (name.to_string(), port.to_string())
        }
        _ => (host.to_string(), "80".to_string()),
    }
}

fn read_retrying(conn: &mut Connection, buf: &mut [u8]) -> Result<usize, Error> {
    loop {
        match conn.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    fn pair() -> (Connection, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        (Connection::Unix(a), b)
    }

    #[test]
    fn simple_get_builds_env() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"GET /hello?x=2 HTTP/1.1\r\nHost: example.com:8080\r\n\r\n")
            .unwrap();

        let mut env = RequestReader::new().read_request(&mut conn).unwrap();
        assert_eq!(env.get("REQUEST_METHOD"), Some("GET"));
        assert_eq!(env.get("PATH_INFO"), Some("/hello"));
        assert_eq!(env.get("QUERY_STRING"), Some("x=2"));
        assert_eq!(env.get("REMOTE_ADDR"), Some("127.0.0.1"));
        assert_eq!(env.get("SERVER_NAME"), Some("example.com"));
        assert_eq!(env.get("SERVER_PORT"), Some("8080"));
        assert_eq!(env.get("SCRIPT_NAME"), Some(""));
        assert!(env.get("SERVER_SOFTWARE").unwrap().starts_with("molt/"));

        // No body.
        let mut body = Vec::new();
        env.input().unwrap().read_to_end(&mut body).unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn trickled_head_is_reassembled() {
        let (mut conn, client) = pair();
        let wire = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n".to_vec();
        let writer = std::thread::spawn(move || {
            let mut client = client;
            for byte in wire {
                client.write_all(&[byte]).unwrap();
                client.flush().unwrap();
                std::thread::sleep(Duration::from_millis(1));
            }
        });

        let env = RequestReader::new().read_request(&mut conn).unwrap();
        assert_eq!(env.get("REQUEST_METHOD"), Some("GET"));
        writer.join().unwrap();
    }

    #[test]
    fn fixed_body_is_staged() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"PUT /u HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello world")
            .unwrap();

        let mut env = RequestReader::new().read_request(&mut conn).unwrap();
        let input = env.input().unwrap();
        assert_eq!(input.size().unwrap(), Some(11));
        let mut body = Vec::new();
        input.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"hello world");

        input.rewind().unwrap();
        let mut again = Vec::new();
        input.read_to_end(&mut again).unwrap();
        assert_eq!(again, b"hello world");
    }

    #[test]
    fn chunked_body_is_dechunked() {
        let (mut conn, mut client) = pair();
        client
            .write_all(
                b"PUT /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                  5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
            )
            .unwrap();

        let mut env = RequestReader::new().read_request(&mut conn).unwrap();
        let input = env.input().unwrap();
        let mut body = Vec::new();
        input.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"hello world");
    }

    #[test]
    fn oversized_head_maps_to_413() {
        let (mut conn, client) = pair();
        let writer = std::thread::spawn(move || {
            let mut client = client;
            let _ = client.write_all(b"GET / HTTP/1.1\r\n");
            let line = b"X-Big: stuffstuffstuffstuffstuff\r\n";
            for _ in 0..200 {
                if client.write_all(line).is_err() {
                    return;
                }
            }
        });

        let reader = RequestReader {
            max_header: 4096,
            ..RequestReader::default()
        };
        let err = reader.read_request(&mut conn).unwrap_err();
        assert!(matches!(err, Error::EntityTooLarge));
        assert_eq!(err.response_status(), Some(413));
        writer.join().unwrap();
    }

    #[test]
    fn early_close_is_a_disconnect() {
        let (mut conn, mut client) = pair();
        client.write_all(b"GET / HT").unwrap();
        drop(client);

        let err = RequestReader::new().read_request(&mut conn).unwrap_err();
        assert!(matches!(err, Error::ClientDisconnect(_)));
        assert_eq!(err.response_status(), None);
    }

    #[test]
    fn expect_continue_is_visible() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"PUT /u HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 2\r\n\r\n")
            .unwrap();

        let env = RequestReader::new().read_request(&mut conn).unwrap();
        assert!(env.expects_continue());
        assert_eq!(env.get("HTTP_EXPECT"), Some("100-continue"));
    }

    #[test]
    fn forward_only_mode_installs_stream_input() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"PUT /u HTTP/1.1\r\nContent-Length: 2\r\n\r\nok")
            .unwrap();

        let reader = RequestReader {
            rewindable_input: false,
            ..RequestReader::default()
        };
        let mut env = reader.read_request(&mut conn).unwrap();
        let input = env.input().unwrap();
        assert!(input.rewind().is_err());
        let mut body = Vec::new();
        input.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"ok");
    }

    #[test]
    fn split_host_variants() {
        assert_eq!(split_host("a.example"), ("a.example".into(), "80".into()));
        assert_eq!(split_host("a:81"), ("a".into(), "81".into()));
        assert_eq!(split_host("[::1]:82"), ("[::1]".into(), "82".into()));
        assert_eq!(split_host("[::1]"), ("[::1]".into(), "80".into()));
    }
}
