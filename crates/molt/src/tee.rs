//! Request-body staging.
//!
//! [`TeeInput`] presents a read+rewind interface over a one-shot body
//! stream. Bytes are pulled from the connection lazily and mirrored into a
//! backing store: a memory buffer up to the configured cap, promoted to an
//! unlinked temp file for anything larger. After a rewind, reads replay the
//! exact bytes previously observed.
//!
//! When rewindability is disabled, [`StreamInput`] serves the body
//! forward-only with no backing store at all.

use molt_http::ChunkedReader;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::FileExt;

const PULL_SIZE: usize = 16 * 1024;

/// Boxed connection read half.
pub(crate) type Source = Box<dyn Read + Send>;

/// A body of known length: leftover head-buffer bytes, then the socket,
/// bounded by `Content-Length`.
pub(crate) struct FixedReader {
    leftover: Vec<u8>,
    lpos: usize,
    inner: Source,
    remaining: u64,
}

impl FixedReader {
    pub(crate) fn new(inner: Source, mut leftover: Vec<u8>, length: u64) -> Self {
        if leftover.len() as u64 > length {
            leftover.truncate(length as usize);
        }
        Self {
            leftover,
            lpos: 0,
            inner,
            remaining: length,
        }
    }
}

impl Read for FixedReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || out.is_empty() {
            return Ok(0);
        }
        if self.lpos < self.leftover.len() {
            let n = (self.leftover.len() - self.lpos)
                .min(out.len())
                .min(self.remaining as usize);
            out[..n].copy_from_slice(&self.leftover[self.lpos..self.lpos + n]);
            self.lpos += n;
            self.remaining -= n as u64;
            return Ok(n);
        }
        let want = (out.len() as u64).min(self.remaining) as usize;
        match self.inner.read(&mut out[..want])? {
            0 => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before content-length was satisfied",
            )),
            n => {
                self.remaining -= n as u64;
                Ok(n)
            }
        }
    }
}

/// The undecoded-or-dechunked byte source behind a body input.
pub(crate) enum RawBody {
    /// `Content-Length`-bounded identity body.
    Fixed { reader: FixedReader, length: u64 },
    /// `Transfer-Encoding: chunked` body; length unknown up front.
    Chunked(ChunkedReader<Source>),
}

impl RawBody {
    pub(crate) fn fixed(inner: Source, leftover: Vec<u8>, length: u64) -> Self {
        Self::Fixed {
            reader: FixedReader::new(inner, leftover, length),
            length,
        }
    }

    pub(crate) fn chunked(inner: Source, leftover: &[u8]) -> Self {
        Self::Chunked(ChunkedReader::with_leftover(inner, leftover))
    }

    /// Body length when declared up front.
    fn len_hint(&self) -> Option<u64> {
        match self {
            Self::Fixed { length, .. } => Some(*length),
            Self::Chunked(_) => None,
        }
    }

    fn trailers(&self) -> &[(String, Vec<u8>)] {
        match self {
            Self::Fixed { .. } => &[],
            Self::Chunked(r) => r.trailers(),
        }
    }
}

impl Read for RawBody {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Fixed { reader, .. } => reader.read(out),
            Self::Chunked(reader) => reader.read(out),
        }
    }
}

enum Backing {
    Memory(Vec<u8>),
    Spilled(File),
}

/// Rewindable body input with spill-to-disk backing.
pub struct TeeInput {
    src: RawBody,
    backing: Backing,
    stored: u64,
    pos: u64,
    done: bool,
    buffer_max: usize,
}

impl TeeInput {
    pub(crate) fn new(src: RawBody, buffer_max: usize) -> Self {
        Self {
            src,
            backing: Backing::Memory(Vec::new()),
            stored: 0,
            pos: 0,
            done: false,
            buffer_max,
        }
    }

    /// Total body size in bytes.
    ///
    /// Known up front for `Content-Length` bodies; for chunked bodies this
    /// forces consumption of the remaining stream into the backing store.
    pub fn size(&mut self) -> io::Result<u64> {
        if let Some(length) = self.src.len_hint() {
            return Ok(length);
        }
        while !self.done {
            self.pull()?;
        }
        Ok(self.stored)
    }

    /// Reset the read cursor to the start of the body.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Trailer fields, available once a chunked body has been fully read.
    #[must_use]
    pub fn trailers(&self) -> &[(String, Vec<u8>)] {
        self.src.trailers()
    }

    /// True once the backing store has been promoted to a temp file.
    #[must_use]
    pub fn is_spilled(&self) -> bool {
        matches!(self.backing, Backing::Spilled(_))
    }

    #[cfg(test)]
    pub(crate) fn backing_file(&self) -> Option<&File> {
        match &self.backing {
            Backing::Spilled(f) => Some(f),
            Backing::Memory(_) => None,
        }
    }

    /// Pull one chunk from the source into the backing store.
    fn pull(&mut self) -> io::Result<()> {
        let mut scratch = [0u8; PULL_SIZE];
        match self.src.read(&mut scratch)? {
            0 => {
                self.done = true;
                Ok(())
            }
            n => self.append(&scratch[..n]),
        }
    }

    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        if let Backing::Memory(buf) = &mut self.backing {
            if buf.len() + data.len() <= self.buffer_max {
                buf.extend_from_slice(data);
                self.stored += data.len() as u64;
                return Ok(());
            }
            // Past the memory cap: promote to an unlinked temp file.
            let file = tempfile::tempfile()?;
            file.write_all_at(buf, 0)?;
            self.backing = Backing::Spilled(file);
        }
        if let Backing::Spilled(file) = &self.backing {
            file.write_all_at(data, self.stored)?;
        }
        self.stored += data.len() as u64;
        Ok(())
    }

    fn read_backing(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let avail = (self.stored - self.pos).min(out.len() as u64) as usize;
        match &self.backing {
            Backing::Memory(buf) => {
                let start = self.pos as usize;
                out[..avail].copy_from_slice(&buf[start..start + avail]);
            }
            Backing::Spilled(file) => {
                file.read_exact_at(&mut out[..avail], self.pos)?;
            }
        }
        self.pos += avail as u64;
        Ok(avail)
    }
}

impl Read for TeeInput {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.stored {
                return self.read_backing(out);
            }
            if self.done {
                return Ok(0);
            }
            self.pull()?;
        }
    }
}

/// Forward-only body input; no backing store, no rewind, no size forcing.
pub struct StreamInput {
    src: RawBody,
}

impl StreamInput {
    pub(crate) fn new(src: RawBody) -> Self {
        Self { src }
    }

    /// Declared body size, when `Content-Length` was present.
    #[must_use]
    pub fn size_hint(&self) -> Option<u64> {
        self.src.len_hint()
    }

    /// Trailer fields, available once a chunked body has been fully read.
    #[must_use]
    pub fn trailers(&self) -> &[(String, Vec<u8>)] {
        self.src.trailers()
    }
}

impl Read for StreamInput {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.src.read(out)
    }
}

/// The body object installed in the request environment.
pub enum BodyInput {
    /// Rewindable, tee-backed.
    Rewindable(TeeInput),
    /// Forward-only.
    Forward(StreamInput),
}

impl BodyInput {
    /// Total body size, forcing consumption for rewindable chunked bodies.
    /// Forward-only inputs report the declared length, or `None` when
    /// chunked.
    pub fn size(&mut self) -> io::Result<Option<u64>> {
        match self {
            Self::Rewindable(tee) => tee.size().map(Some),
            Self::Forward(stream) => Ok(stream.size_hint()),
        }
    }

    /// Rewind to the body start.
    ///
    /// # Errors
    ///
    /// Forward-only inputs cannot rewind.
    pub fn rewind(&mut self) -> io::Result<()> {
        match self {
            Self::Rewindable(tee) => {
                tee.rewind();
                Ok(())
            }
            Self::Forward(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "body input is not rewindable",
            )),
        }
    }

    /// Read one line, up to and including `\n`. `None` at end of body.
    pub fn gets(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.read(&mut byte)? {
                0 => break,
                _ => {
                    line.push(byte[0]);
                    if byte[0] == b'\n' {
                        break;
                    }
                }
            }
        }
        Ok(if line.is_empty() { None } else { Some(line) })
    }

    /// Yield the remaining body in chunks.
    pub fn each(&mut self, mut f: impl FnMut(&[u8])) -> io::Result<()> {
        let mut chunk = [0u8; PULL_SIZE];
        loop {
            match self.read(&mut chunk)? {
                0 => return Ok(()),
                n => f(&chunk[..n]),
            }
        }
    }

    /// Trailer fields collected from a chunked body.
    #[must_use]
    pub fn trailers(&self) -> &[(String, Vec<u8>)] {
        match self {
            Self::Rewindable(tee) => tee.trailers(),
            Self::Forward(stream) => stream.trailers(),
        }
    }
}

impl Read for BodyInput {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Rewindable(tee) => tee.read(out),
            Self::Forward(stream) => stream.read(out),
        }
    }
}

impl std::fmt::Debug for BodyInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rewindable(tee) => f
                .debug_struct("BodyInput::Rewindable")
                .field("stored", &tee.stored)
                .field("spilled", &tee.is_spilled())
                .finish(),
            Self::Forward(_) => f.debug_struct("BodyInput::Forward").finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::os::unix::fs::MetadataExt;

    fn fixed_body(data: &[u8], buffer_max: usize) -> BodyInput {
        let src = RawBody::fixed(
            Box::new(Cursor::new(data.to_vec())),
            Vec::new(),
            data.len() as u64,
        );
        BodyInput::Rewindable(TeeInput::new(src, buffer_max))
    }

    #[test]
    fn read_then_rewind_replays_exactly() {
        let body = b"the quick brown fox";
        let mut input = fixed_body(body, 1024);

        let mut first = Vec::new();
        input.read_to_end(&mut first).unwrap();
        assert_eq!(first, body);

        input.rewind().unwrap();
        let mut second = Vec::new();
        input.read_to_end(&mut second).unwrap();
        assert_eq!(second, body);
    }

    #[test]
    fn partial_read_rewind_replays_prefix() {
        let mut input = fixed_body(b"abcdefgh", 1024);
        let mut buf = [0u8; 3];
        input.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");

        input.rewind().unwrap();
        let mut all = Vec::new();
        input.read_to_end(&mut all).unwrap();
        assert_eq!(all, b"abcdefgh");
    }

    #[test]
    fn large_body_spills_and_replays() {
        // 1 MiB body through a 4 KiB memory cap.
        let body: Vec<u8> = (0..1_048_576u32).map(|i| (i % 251) as u8).collect();
        let src = RawBody::fixed(
            Box::new(Cursor::new(body.clone())),
            Vec::new(),
            body.len() as u64,
        );
        let mut tee = TeeInput::new(src, 4096);

        assert_eq!(tee.size().unwrap(), body.len() as u64);
        let mut first = Vec::new();
        tee.read_to_end(&mut first).unwrap();
        assert_eq!(first, body);
        assert!(tee.is_spilled());

        tee.rewind();
        let mut second = Vec::new();
        tee.read_to_end(&mut second).unwrap();
        assert_eq!(second, body);
    }

    #[test]
    fn spill_file_is_unlinked() {
        let body = vec![7u8; 10_000];
        let src = RawBody::fixed(
            Box::new(Cursor::new(body.clone())),
            Vec::new(),
            body.len() as u64,
        );
        let mut tee = TeeInput::new(src, 1024);
        let mut sink = Vec::new();
        tee.read_to_end(&mut sink).unwrap();

        let file = tee.backing_file().expect("spilled");
        assert_eq!(file.metadata().unwrap().nlink(), 0);
    }

    #[test]
    fn size_known_without_consuming_fixed_body() {
        let mut input = fixed_body(b"123456", 1024);
        assert_eq!(input.size().unwrap(), Some(6));
        let mut all = Vec::new();
        input.read_to_end(&mut all).unwrap();
        assert_eq!(all, b"123456");
    }

    #[test]
    fn size_forces_chunked_consumption() {
        let wire = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let src = RawBody::chunked(Box::new(Cursor::new(wire.to_vec())), b"");
        let mut input = BodyInput::Rewindable(TeeInput::new(src, 1024));

        assert_eq!(input.size().unwrap(), Some(11));
        let mut all = Vec::new();
        input.read_to_end(&mut all).unwrap();
        assert_eq!(all, b"hello world");
    }

    #[test]
    fn leftover_bytes_precede_socket_bytes() {
        let src = RawBody::fixed(Box::new(Cursor::new(b"llo".to_vec())), b"he".to_vec(), 5);
        let mut input = BodyInput::Rewindable(TeeInput::new(src, 1024));
        let mut all = Vec::new();
        input.read_to_end(&mut all).unwrap();
        assert_eq!(all, b"hello");
    }

    #[test]
    fn leftover_truncated_to_declared_length() {
        let src = RawBody::fixed(Box::new(Cursor::new(Vec::new())), b"abcXYZ".to_vec(), 3);
        let mut input = BodyInput::Rewindable(TeeInput::new(src, 1024));
        let mut all = Vec::new();
        input.read_to_end(&mut all).unwrap();
        assert_eq!(all, b"abc");
    }

    #[test]
    fn gets_splits_on_newline() {
        let mut input = fixed_body(b"one\ntwo\nthree", 1024);
        assert_eq!(input.gets().unwrap().unwrap(), b"one\n");
        assert_eq!(input.gets().unwrap().unwrap(), b"two\n");
        assert_eq!(input.gets().unwrap().unwrap(), b"three");
        assert!(input.gets().unwrap().is_none());
    }

    #[test]
    fn each_yields_whole_body() {
        let mut input = fixed_body(b"chunky bits", 4);
        let mut seen = Vec::new();
        input.each(|c| seen.extend_from_slice(c)).unwrap();
        assert_eq!(seen, b"chunky bits");
    }

    #[test]
    fn forward_input_refuses_rewind() {
        let src = RawBody::fixed(Box::new(Cursor::new(b"xy".to_vec())), Vec::new(), 2);
        let mut input = BodyInput::Forward(StreamInput::new(src));
        assert_eq!(input.size().unwrap(), Some(2));
        assert!(input.rewind().is_err());
    }

    #[test]
    fn truncated_fixed_body_reports_disconnect() {
        let src = RawBody::fixed(Box::new(Cursor::new(b"ab".to_vec())), Vec::new(), 5);
        let mut input = BodyInput::Rewindable(TeeInput::new(src, 1024));
        let mut all = Vec::new();
        let err = input.read_to_end(&mut all).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
