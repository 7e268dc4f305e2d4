//! HTTP/1.1 wire protocol for the molt preforking server.
//!
//! This crate owns everything that touches raw HTTP bytes:
//!
//! - [`parser::HeadParser`] — incremental request-head parser with callouts
//! - [`chunked::ChunkedReader`] — streaming `Transfer-Encoding: chunked` decoder
//! - [`response::ResponseWriter`] — response serialization with interim
//!   (`100 Continue` / `103 Early Hints`) support
//! - [`limits`] — the protocol's hard caps
//!
//! It is deliberately free of socket, process, and configuration concerns;
//! those live in the `molt` crate. Everything here works against plain
//! byte slices and `Read`/`Write` implementations, which keeps the wire
//! logic testable without a server around it.
//!
//! The dialect is restricted by design: no keep-alive (every response
//! carries `Connection: close`), no pipelining, chunked transfer coding
//! accepted on requests only.

#![forbid(unsafe_code)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::must_use_candidate)]

pub mod chunked;
pub mod limits;
pub mod parser;
pub mod response;

pub use chunked::ChunkedReader;
pub use limits::{CHUNK_SIZE, MAX_CHUNK_HEAD, MAX_HEADER, MAX_METHOD, MAX_REQUEST_URI};
pub use parser::{HeadParser, HeadSink, HeadStatus, ParseError, RequestHead};
pub use response::{reason_phrase, simple_response, ResponseWriter, CONTINUE_RESPONSE};
