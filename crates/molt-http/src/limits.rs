//! Protocol limits.
//!
//! Hard caps applied while reading a request head. The header-size cap is
//! enforced by the caller that owns the read buffer (the parser itself never
//! copies the head); the request-line caps are enforced inside the parser.

/// Maximum total size of a request head (request line plus headers).
///
/// A head that grows past this without completing is answered with
/// `413 Request Entity Too Large`.
pub const MAX_HEADER: usize = 112 * 1024;

/// Maximum length of the request URI, in bytes.
///
/// Exceeding this maps to `414 Request-URI Too Long`.
pub const MAX_REQUEST_URI: usize = 15 * 1024;

/// Maximum length of a request method token.
pub const MAX_METHOD: usize = 20;

/// Maximum bytes scanned while looking for a chunk-size line.
///
/// A chunk head (size in hex plus optional extensions) that does not
/// terminate within this bound is malformed. Bounds the scratch space an
/// attacker can force the decoder to hold.
pub const MAX_CHUNK_HEAD: usize = 256;

/// Read granularity used by callers staging a request head from a socket.
pub const CHUNK_SIZE: usize = 16 * 1024;
