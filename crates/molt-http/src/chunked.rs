//! Streaming decoder for `Transfer-Encoding: chunked` request bodies.
//!
//! [`ChunkedReader`] wraps the connection and implements [`Read`], yielding
//! decoded body bytes. The terminating zero-size chunk may be followed by
//! trailer fields, which are captured for the caller to fold into the
//! request environment.
//!
//! Wire grammar (RFC 7230 §4.1): hex chunk size, optional extensions
//! (ignored), CRLF, data, CRLF; a zero-size chunk terminates the body,
//! followed by optional trailers and a final CRLF.

use crate::limits::MAX_CHUNK_HEAD;
use crate::parser::ParseError;
use std::io::{self, Read};

const REFILL: usize = 8 * 1024;
const MAX_TRAILER_LINE: usize = 4 * 1024;
const MAX_TRAILERS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Scanning for the chunk-size line.
    Size,
    /// Inside chunk data; bytes remaining.
    Data(u64),
    /// Expecting the CRLF that closes a data chunk.
    DataEnd,
    /// Reading trailer lines after the zero-size chunk.
    Trailers,
    /// Body fully decoded.
    Done,
}

/// Decodes a chunked body read from `R`.
///
/// The cumulative bytes returned by [`read`](Read::read) over the life of
/// the reader equal the decoded body exactly. After the final chunk,
/// `read` returns 0 and [`trailers`](Self::trailers) exposes any trailer
/// fields that followed it.
#[derive(Debug)]
pub struct ChunkedReader<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    state: ChunkState,
    trailers: Vec<(String, Vec<u8>)>,
}

impl<R: Read> ChunkedReader<R> {
    /// Wrap a source positioned at the first chunk-size line.
    #[must_use]
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
            state: ChunkState::Size,
            trailers: Vec::new(),
        }
    }

    /// Wrap a source, seeding the decode buffer with bytes already read
    /// past the header (the usual case after head parsing).
    #[must_use]
    pub fn with_leftover(inner: R, leftover: &[u8]) -> Self {
        let mut reader = Self::new(inner);
        reader.buf.extend_from_slice(leftover);
        reader
    }

    /// True once the terminating chunk and trailers have been consumed.
    #[inline]
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Trailer fields seen after the final chunk, in wire order.
    #[must_use]
    pub fn trailers(&self) -> &[(String, Vec<u8>)] {
        &self.trailers
    }

    /// Consume the remainder of the body, discarding it.
    ///
    /// Used to drain a request the application did not read fully, so the
    /// trailers are still collected.
    pub fn drain(&mut self) -> io::Result<u64> {
        let mut sink = [0u8; REFILL];
        let mut total = 0u64;
        loop {
            let n = self.read(&mut sink)?;
            if n == 0 {
                return Ok(total);
            }
            total += n as u64;
        }
    }

    fn available(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    fn consume(&mut self, n: usize) {
        self.pos += n;
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
    }

    /// Pull more bytes from the source. Errors on EOF: a chunked body is
    /// self-delimiting, so the source must not end before the last chunk.
    fn refill(&mut self) -> io::Result<()> {
        if self.pos > 0 && self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
        let mut scratch = [0u8; REFILL];
        loop {
            match self.inner.read(&mut scratch) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed inside chunked body",
                    ))
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&scratch[..n]);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn take_line(&mut self, cap: usize) -> io::Result<Option<Vec<u8>>> {
        let avail = self.available();
        match find_crlf(avail) {
            Some(eol) => {
                let line = avail[..eol].to_vec();
                self.consume(eol + 2);
                Ok(Some(line))
            }
            None if avail.len() > cap => Err(bad_chunk()),
            None => Ok(None),
        }
    }

    fn parse_trailer_line(&mut self, line: &[u8]) -> io::Result<()> {
        if self.trailers.len() >= MAX_TRAILERS || line.len() > MAX_TRAILER_LINE {
            return Err(bad_chunk());
        }
        let colon = line.iter().position(|&b| b == b':').ok_or_else(bad_chunk)?;
        let name = std::str::from_utf8(&line[..colon])
            .map_err(|_| bad_chunk())?
            .trim()
            .to_string();
        if name.is_empty() {
            return Err(bad_chunk());
        }
        let mut value = &line[colon + 1..];
        while let [b' ' | b'\t', rest @ ..] = value {
            value = rest;
        }
        self.trailers.push((name, value.to_vec()));
        Ok(())
    }
}

impl<R: Read> Read for ChunkedReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            match self.state {
                ChunkState::Size => match self.take_line(MAX_CHUNK_HEAD)? {
                    Some(line) => {
                        let size = parse_chunk_size(&line)?;
                        self.state = if size == 0 {
                            ChunkState::Trailers
                        } else {
                            ChunkState::Data(size)
                        };
                    }
                    None => self.refill()?,
                },
                ChunkState::Data(left) => {
                    let avail = self.available();
                    if avail.is_empty() {
                        self.refill()?;
                        continue;
                    }
                    let n = avail.len().min(out.len()).min(left as usize);
                    out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
                    self.consume(n);
                    self.state = match left - n as u64 {
                        0 => ChunkState::DataEnd,
                        rest => ChunkState::Data(rest),
                    };
                    return Ok(n);
                }
                ChunkState::DataEnd => {
                    if self.available().len() < 2 {
                        self.refill()?;
                        continue;
                    }
                    if &self.available()[..2] != b"\r\n" {
                        return Err(bad_chunk());
                    }
                    self.consume(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailers => match self.take_line(MAX_TRAILER_LINE)? {
                    Some(line) if line.is_empty() => {
                        self.state = ChunkState::Done;
                        return Ok(0);
                    }
                    Some(line) => self.parse_trailer_line(&line)?,
                    None => self.refill()?,
                },
                ChunkState::Done => return Ok(0),
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn bad_chunk() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, ParseError::InvalidChunkSize)
}

/// Parse a chunk-size line: hex digits, then optional `;extension`s.
fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let size_part = match line.iter().position(|&b| b == b';') {
        Some(semi) => &line[..semi],
        None => line,
    };
    let size_part: &[u8] = match size_part.iter().position(|&b| b == b' ' || b == b'\t') {
        Some(sp) => &size_part[..sp],
        None => size_part,
    };
    if size_part.is_empty() || size_part.len() > 16 {
        return Err(bad_chunk());
    }
    let s = std::str::from_utf8(size_part).map_err(|_| bad_chunk())?;
    u64::from_str_radix(s, 16).map_err(|_| bad_chunk())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn decode_all(wire: &[u8]) -> io::Result<(Vec<u8>, Vec<(String, Vec<u8>)>)> {
        let mut reader = ChunkedReader::new(Cursor::new(wire.to_vec()));
        let mut body = Vec::new();
        reader.read_to_end(&mut body)?;
        Ok((body, reader.trailers().to_vec()))
    }

    #[test]
    fn single_chunk() {
        let (body, trailers) = decode_all(b"5\r\nhello\r\n0\r\n\r\n").unwrap();
        assert_eq!(body, b"hello");
        assert!(trailers.is_empty());
    }

    #[test]
    fn multiple_chunks_preserve_crlf_in_data() {
        let wire = b"4\r\nWiki\r\n5\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\n\r\n";
        let (body, _) = decode_all(wire).unwrap();
        assert_eq!(body, b"Wikipedia in\r\n\r\nchunks.");
    }

    #[test]
    fn empty_body() {
        let (body, _) = decode_all(b"0\r\n\r\n").unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn uppercase_hex_and_extensions() {
        let (body, _) = decode_all(b"A;name=value\r\n0123456789\r\n0\r\n\r\n").unwrap();
        assert_eq!(body, b"0123456789");
    }

    #[test]
    fn trailers_captured() {
        let wire = b"3\r\nabc\r\n0\r\nX-Sum: 900150983\r\nX-Other: t\r\n\r\n";
        let (body, trailers) = decode_all(wire).unwrap();
        assert_eq!(body, b"abc");
        assert_eq!(trailers.len(), 2);
        assert_eq!(trailers[0].0, "X-Sum");
        assert_eq!(trailers[0].1, b"900150983");
    }

    #[test]
    fn cumulative_output_matches_with_small_reads() {
        let wire = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut reader = ChunkedReader::new(Cursor::new(wire.to_vec()));
        let mut body = Vec::new();
        let mut chunk = [0u8; 3];
        loop {
            let n = reader.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(body, b"Wikipedia");
        assert!(reader.is_done());
    }

    #[test]
    fn leftover_bytes_are_decoded_first() {
        let mut reader =
            ChunkedReader::with_leftover(Cursor::new(b"llo\r\n0\r\n\r\n".to_vec()), b"5\r\nhe");
        let mut body = Vec::new();
        reader.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn malformed_size_rejected() {
        let err = decode_all(b"zz\r\nhello\r\n0\r\n\r\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn missing_data_crlf_rejected() {
        let err = decode_all(b"5\r\nhelloX\r\n0\r\n\r\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn premature_eof_reported() {
        let err = decode_all(b"5\r\nhe").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn unterminated_size_line_bounded() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&[b'1'; MAX_CHUNK_HEAD + 2]);
        let err = decode_all(&wire).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn drain_discards_and_keeps_trailers() {
        let wire = b"3\r\nabc\r\n0\r\nX-T: 1\r\n\r\n";
        let mut reader = ChunkedReader::new(Cursor::new(wire.to_vec()));
        let drained = reader.drain().unwrap();
        assert_eq!(drained, 3);
        assert_eq!(reader.trailers().len(), 1);
    }
}
