//! Server-side error taxonomy.
//!
//! Request-handling errors map onto a small set of outcomes: an HTTP error
//! response (when nothing has been written yet), a silent close (client
//! already gone), or propagation to the supervisor. The variants here
//! mirror those outcomes; [`Error::response_status`] picks the wire status.

use molt_http::ParseError;
use std::fmt;
use std::io;

/// Anything that can go wrong while serving one connection or supervising
/// the process tree.
#[derive(Debug)]
pub enum Error {
    /// Malformed request line or headers. Answered with 400.
    Parse(ParseError),
    /// Request URI over the cap. Answered with 414.
    UriTooLong,
    /// Request head grew past `MAX_HEADER`. Answered with 413.
    EntityTooLarge,
    /// The client went away mid-request (EOF, reset, broken pipe).
    /// No response is attempted; logged at debug.
    ClientDisconnect(io::Error),
    /// The application returned an error or panicked. Answered with 500
    /// when the status line has not gone out yet.
    App(Box<dyn std::error::Error + Send + Sync>),
    /// A listener could not be bound after the configured retries.
    Listener { address: String, source: io::Error },
    /// Unexpected I/O talking to sockets, pipes, or temp files.
    Io(io::Error),
}

impl Error {
    /// The HTTP status to answer with, if a response is still possible.
    ///
    /// `None` means close without writing (the client is gone).
    #[must_use]
    pub fn response_status(&self) -> Option<u16> {
        match self {
            Self::Parse(_) => Some(400),
            Self::UriTooLong => Some(414),
            Self::EntityTooLarge => Some(413),
            Self::ClientDisconnect(_) => None,
            Self::App(_) => Some(500),
            Self::Listener { .. } | Self::Io(_) => Some(500),
        }
    }

    /// True when the failure is the client's fault and not worth a warning.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Parse(_) | Self::UriTooLong | Self::EntityTooLarge | Self::ClientDisconnect(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "request parse error: {e}"),
            Self::UriTooLong => write!(f, "request URI too long"),
            Self::EntityTooLarge => write!(f, "request head too large"),
            Self::ClientDisconnect(e) => write!(f, "client disconnected: {e}"),
            Self::App(e) => write!(f, "application error: {e}"),
            Self::Listener { address, source } => {
                write!(f, "failed to bind {address}: {source}")
            }
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(e) => Some(e),
            Self::ClientDisconnect(e) | Self::Io(e) => Some(e),
            Self::App(e) => Some(e.as_ref()),
            Self::Listener { source, .. } => Some(source),
            Self::UriTooLong | Self::EntityTooLarge => None,
        }
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::UriTooLong => Self::UriTooLong,
            other => Self::Parse(other),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if is_disconnect(&e) {
            Self::ClientDisconnect(e)
        } else {
            Self::Io(e)
        }
    }
}

/// Errors that mean "the peer is gone", per the read/write taxonomy.
pub fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_map_to_400() {
        let err = Error::from(ParseError::InvalidHeader);
        assert_eq!(err.response_status(), Some(400));
        assert!(err.is_client_error());
    }

    #[test]
    fn uri_too_long_maps_to_414() {
        let err = Error::from(ParseError::UriTooLong);
        assert_eq!(err.response_status(), Some(414));
    }

    #[test]
    fn oversized_head_maps_to_413() {
        assert_eq!(Error::EntityTooLarge.response_status(), Some(413));
    }

    #[test]
    fn disconnects_get_no_response() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::ClientDisconnect(_)));
        assert_eq!(err.response_status(), None);
    }

    #[test]
    fn other_io_errors_are_not_disconnects() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
    }
}
