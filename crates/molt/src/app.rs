//! The application contract.
//!
//! An application is a callable from a request environment to a status,
//! headers, and body. Each worker builds its own application instance from
//! the configured factory after forking, so application state never crosses
//! process boundaries.
//!
//! A response status of `100` is special: the server answers the client's
//! `Expect: 100-continue`, stages the body, and invokes the application a
//! second time for the real response.

use crate::env::RequestEnv;
use std::fmt;

/// Failure escaping the application. Logged with the request context and
/// answered with 500 when the status line has not been written yet.
#[derive(Debug)]
pub struct AppError(Box<dyn std::error::Error + Send + Sync>);

impl AppError {
    /// Wrap any error value.
    pub fn new(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(err.into())
    }

    /// Build from a message.
    #[must_use]
    pub fn msg(msg: impl fmt::Display) -> Self {
        Self(msg.to_string().into())
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

/// Response body shapes.
pub enum AppBody {
    /// No body.
    Empty,
    /// A single in-memory buffer.
    Bytes(Vec<u8>),
    /// Chunks yielded lazily; each is written as produced.
    Chunks(Box<dyn Iterator<Item = Vec<u8>> + Send>),
}

impl fmt::Debug for AppBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Self::Chunks(_) => write!(f, "Chunks(..)"),
        }
    }
}

/// What the application returns: `(status, headers, body)`.
#[derive(Debug)]
pub struct AppResponse {
    /// HTTP status code.
    pub status: u16,
    /// Headers in response order. `Content-Length` is passed through if
    /// present and never synthesized.
    pub headers: Vec<(String, Vec<u8>)>,
    /// The body.
    pub body: AppBody,
}

impl AppResponse {
    /// An empty response with the given status.
    #[must_use]
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: AppBody::Empty,
        }
    }

    /// A `200 OK` text response with `Content-Length` set.
    #[must_use]
    pub fn text(body: impl Into<String>) -> Self {
        let body = body.into().into_bytes();
        Self {
            status: 200,
            headers: vec![
                ("Content-Type".to_string(), b"text/plain".to_vec()),
                ("Content-Length".to_string(), body.len().to_string().into_bytes()),
            ],
            body: AppBody::Bytes(body),
        }
    }

    /// The interim `100 Continue` marker response.
    #[must_use]
    pub fn continue_100() -> Self {
        Self::empty(100)
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body and set `Content-Length` to match.
    #[must_use]
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.headers
            .retain(|(n, _)| !n.eq_ignore_ascii_case("content-length"));
        self.headers.push((
            "Content-Length".to_string(),
            body.len().to_string().into_bytes(),
        ));
        self.body = AppBody::Bytes(body);
        self
    }
}

/// The application callable.
pub trait App: Send + Sync {
    /// Handle one request.
    fn call(&self, env: &mut RequestEnv) -> Result<AppResponse, AppError>;
}

impl<F> App for F
where
    F: Fn(&mut RequestEnv) -> Result<AppResponse, AppError> + Send + Sync,
{
    fn call(&self, env: &mut RequestEnv) -> Result<AppResponse, AppError> {
        self(env)
    }
}

/// Builds the per-worker application instance after fork.
pub type AppFactory = dyn Fn() -> Box<dyn App> + Send + Sync;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_apps() {
        let app = |_env: &mut RequestEnv| Ok(AppResponse::text("hi"));
        let mut env = RequestEnv::new();
        let resp = app.call(&mut env).unwrap();
        assert_eq!(resp.status, 200);
        assert!(matches!(resp.body, AppBody::Bytes(ref b) if b == b"hi"));
    }

    #[test]
    fn with_body_sets_content_length() {
        let resp = AppResponse::empty(201).with_body(b"abcd".to_vec());
        let cl = resp
            .headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
            .unwrap();
        assert_eq!(cl.1, b"4");
    }

    #[test]
    fn text_sets_length_header() {
        let resp = AppResponse::text("hello");
        assert_eq!(resp.status, 200);
        let cl = resp
            .headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
            .unwrap();
        assert_eq!(cl.1, b"5");
    }
}
