//! The per-request environment handed to the application.
//!
//! [`RequestEnv`] is a string-keyed mapping in the CGI tradition
//! (`REQUEST_METHOD`, `HTTP_*`, …) plus typed slots the map cannot carry:
//! the staged body input, an error sink, after-reply callbacks, the
//! early-hints emitter, and the hijack escape hatch.
//!
//! The environment doubles as the parser's callout sink: header fields land
//! directly in the map under their CGI names as the head is parsed.

use crate::listener::Connection;
use crate::tee::BodyInput;
use molt_http::parser::HeadSink;
use molt_http::ResponseWriter;
use std::collections::HashMap;
use std::io::{self, Write};

/// Writes `103 Early Hints` blocks to the client ahead of the response.
pub struct EarlyHints {
    out: Box<dyn Write + Send>,
}

impl EarlyHints {
    pub(crate) fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out }
    }

    /// Emit one hints block. May be called repeatedly before the final
    /// response; each block is a full interim response on the wire.
    pub fn send(&mut self, headers: &[(String, String)]) -> io::Result<()> {
        let mut writer = ResponseWriter::new(self.out.as_mut());
        writer.write_early_hints(headers)
    }
}

impl std::fmt::Debug for EarlyHints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EarlyHints").finish_non_exhaustive()
    }
}

/// String-keyed request environment with typed side slots.
#[derive(Default)]
pub struct RequestEnv {
    map: HashMap<String, String>,
    body_offset: usize,
    input: Option<BodyInput>,
    errors: Option<Box<dyn Write + Send>>,
    after_reply: Vec<Box<dyn FnOnce() + Send>>,
    early_hints: Option<EarlyHints>,
    hijack: Option<Connection>,
    hijacked: bool,
}

impl RequestEnv {
    /// Create an empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a CGI key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// Set a CGI key, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    /// Set a key only if absent. Used when merging process-wide defaults.
    pub fn set_default(&mut self, key: &str, value: &str) {
        if !self.map.contains_key(key) {
            self.map.insert(key.to_string(), value.to_string());
        }
    }

    /// True if the key is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Iterate all string entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `REQUEST_METHOD`, or empty before parsing.
    #[must_use]
    pub fn method(&self) -> &str {
        self.get("REQUEST_METHOD").unwrap_or("")
    }

    /// `PATH_INFO`, or empty before parsing.
    #[must_use]
    pub fn path(&self) -> &str {
        self.get("PATH_INFO").unwrap_or("")
    }

    /// `CONTENT_LENGTH` parsed, if present and numeric.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.get("CONTENT_LENGTH")?.parse().ok()
    }

    /// True if the client sent `Expect: 100-continue`.
    #[must_use]
    pub fn expects_continue(&self) -> bool {
        self.get("HTTP_EXPECT")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
    }

    /// Offset of the first body byte in the head buffer.
    #[must_use]
    pub fn body_offset(&self) -> usize {
        self.body_offset
    }

    // ------------------------------------------------------------------
    // Typed slots
    // ------------------------------------------------------------------

    /// The staged request body.
    #[must_use]
    pub fn input(&mut self) -> Option<&mut BodyInput> {
        self.input.as_mut()
    }

    /// Take ownership of the body input.
    pub fn take_input(&mut self) -> Option<BodyInput> {
        self.input.take()
    }

    pub(crate) fn set_input(&mut self, input: BodyInput) {
        self.input = Some(input);
    }

    /// The per-request error sink. Defaults to stderr.
    pub fn errors(&mut self) -> &mut (dyn Write + Send) {
        self.errors
            .get_or_insert_with(|| Box::new(io::stderr()))
            .as_mut()
    }

    /// Replace the error sink.
    pub fn set_errors(&mut self, sink: Box<dyn Write + Send>) {
        self.errors = Some(sink);
    }

    /// Register a callback to run after the response is flushed.
    ///
    /// Callback panics are caught and logged; they never affect the
    /// connection, which has already been answered.
    pub fn after_reply(&mut self, f: impl FnOnce() + Send + 'static) {
        self.after_reply.push(Box::new(f));
    }

    pub(crate) fn take_after_reply(&mut self) -> Vec<Box<dyn FnOnce() + Send>> {
        std::mem::take(&mut self.after_reply)
    }

    /// The early-hints emitter, when enabled in configuration.
    #[must_use]
    pub fn early_hints(&mut self) -> Option<&mut EarlyHints> {
        self.early_hints.as_mut()
    }

    pub(crate) fn set_early_hints(&mut self, hints: EarlyHints) {
        self.early_hints = Some(hints);
    }

    /// Take the raw connection, detaching it from the response cycle.
    ///
    /// After a successful hijack the server writes nothing further; the
    /// application owns the socket and is responsible for closing it.
    pub fn hijack(&mut self) -> Option<Connection> {
        let conn = self.hijack.take();
        if conn.is_some() {
            self.hijacked = true;
        }
        conn
    }

    pub(crate) fn set_hijack(&mut self, conn: Connection) {
        self.hijack = Some(conn);
    }

    /// True once the application has taken the socket.
    #[must_use]
    pub fn is_hijacked(&self) -> bool {
        self.hijacked
    }

    /// Fold chunked-body trailer fields into the map as `HTTP_*` entries.
    pub fn merge_trailers(&mut self, trailers: &[(String, Vec<u8>)]) {
        for (name, value) in trailers {
            let value = String::from_utf8_lossy(value).into_owned();
            self.append_field(name, &value);
        }
    }

    fn append_field(&mut self, name: &str, value: &str) {
        let key = cgi_name(name);
        match self.map.get_mut(&key) {
            Some(existing) => {
                existing.push(',');
                existing.push_str(value);
            }
            None => {
                self.map.insert(key, value.to_string());
            }
        }
    }
}

impl std::fmt::Debug for RequestEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestEnv")
            .field("map", &self.map)
            .field("body_offset", &self.body_offset)
            .field("hijacked", &self.hijacked)
            .finish_non_exhaustive()
    }
}

impl HeadSink for RequestEnv {
    fn request_method(&mut self, method: &str) {
        self.set("REQUEST_METHOD", method);
    }

    fn request_uri(&mut self, uri: &str) {
        self.set("REQUEST_URI", uri);
    }

    fn request_path(&mut self, path: &str) {
        self.set("PATH_INFO", path);
    }

    fn query_string(&mut self, query: &str) {
        self.set("QUERY_STRING", query);
    }

    fn http_version(&mut self, version: &str) {
        self.set("HTTP_VERSION", version);
    }

    fn http_field(&mut self, name: &str, value: &[u8]) {
        let value = String::from_utf8_lossy(value).into_owned();
        self.append_field(name, &value);
    }

    fn header_done(&mut self, body_start: usize) {
        self.body_offset = body_start;
    }
}

/// Translate a wire header name to its CGI key.
///
/// `Content-Length` and `Content-Type` drop the `HTTP_` prefix per CGI;
/// everything else becomes `HTTP_<UPPER_SNAKE>`.
#[must_use]
pub fn cgi_name(header: &str) -> String {
    if header.eq_ignore_ascii_case("content-length") {
        return "CONTENT_LENGTH".to_string();
    }
    if header.eq_ignore_ascii_case("content-type") {
        return "CONTENT_TYPE".to_string();
    }
    let mut key = String::with_capacity(5 + header.len());
    key.push_str("HTTP_");
    for b in header.chars() {
        key.push(match b {
            '-' => '_',
            other => other.to_ascii_uppercase(),
        });
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use molt_http::{HeadParser, HeadStatus};

    #[test]
    fn cgi_names() {
        assert_eq!(cgi_name("Host"), "HTTP_HOST");
        assert_eq!(cgi_name("X-Forwarded-For"), "HTTP_X_FORWARDED_FOR");
        assert_eq!(cgi_name("Content-Length"), "CONTENT_LENGTH");
        assert_eq!(cgi_name("content-type"), "CONTENT_TYPE");
    }

    #[test]
    fn parser_callouts_fill_the_map() {
        let buf = b"POST /submit?a=1 HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nabc";
        let mut parser = HeadParser::new();
        let mut env = RequestEnv::new();
        let status = parser.execute(&mut env, buf).unwrap();

        assert_eq!(status, HeadStatus::Complete);
        assert_eq!(env.get("REQUEST_METHOD"), Some("POST"));
        assert_eq!(env.get("REQUEST_URI"), Some("/submit?a=1"));
        assert_eq!(env.get("PATH_INFO"), Some("/submit"));
        assert_eq!(env.get("QUERY_STRING"), Some("a=1"));
        assert_eq!(env.get("HTTP_VERSION"), Some("HTTP/1.1"));
        assert_eq!(env.get("HTTP_HOST"), Some("x"));
        assert_eq!(env.get("CONTENT_LENGTH"), Some("3"));
        assert_eq!(env.content_length(), Some(3));
        assert_eq!(env.body_offset(), buf.len() - 3);
    }

    #[test]
    fn duplicate_headers_are_comma_joined() {
        let buf = b"GET / HTTP/1.1\r\nAccept: a\r\nAccept: b\r\n\r\n";
        let mut parser = HeadParser::new();
        let mut env = RequestEnv::new();
        parser.execute(&mut env, buf).unwrap();
        assert_eq!(env.get("HTTP_ACCEPT"), Some("a,b"));
    }

    #[test]
    fn expect_continue_detected() {
        let buf = b"PUT / HTTP/1.1\r\nExpect: 100-Continue\r\n\r\n";
        let mut parser = HeadParser::new();
        let mut env = RequestEnv::new();
        parser.execute(&mut env, buf).unwrap();
        assert!(env.expects_continue());
    }

    #[test]
    fn defaults_do_not_clobber() {
        let mut env = RequestEnv::new();
        env.set("SCRIPT_NAME", "/app");
        env.set_default("SCRIPT_NAME", "");
        env.set_default("SERVER_SOFTWARE", "x");
        assert_eq!(env.get("SCRIPT_NAME"), Some("/app"));
        assert_eq!(env.get("SERVER_SOFTWARE"), Some("x"));
    }

    #[test]
    fn trailers_merge_as_http_fields() {
        let mut env = RequestEnv::new();
        env.merge_trailers(&[("X-Sum".to_string(), b"abc".to_vec())]);
        assert_eq!(env.get("HTTP_X_SUM"), Some("abc"));
    }
}
