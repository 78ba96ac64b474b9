//! Transfer codecs: the bounded line reader, `Content-Length` framing,
//! chunked transfer encoding in both directions, and the `transfer` copy
//! utility the connection driver uses to drain leftover body bytes.

use crate::errors::ErrorKind;
use crate::http::headers::Headers;
use crate::http::types::{latin1, parse_uhex};
use memchr::memchr;
use std::io::{self, BufRead, Read, Write};

/// Reads one LF-terminated line, stripping the CR of a CRLF pair, and
/// decodes it as ISO-8859-1.
///
/// Fails with `InvalidData` once the accumulated length exceeds `max`, and
/// with `UnexpectedEof` if the stream ends before the delimiter.
pub(crate) fn read_line(r: &mut dyn BufRead, max: usize) -> io::Result<String> {
    let mut out: Vec<u8> = Vec::new();

    loop {
        let (found, used) = {
            let buf = r.fill_buf()?;
            if buf.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "unexpected end of stream",
                ));
            }

            match memchr(b'\n', buf) {
                Some(i) => {
                    out.extend_from_slice(&buf[..i]);
                    (true, i + 1)
                }
                None => {
                    out.extend_from_slice(buf);
                    (false, buf.len())
                }
            }
        };

        r.consume(used);

        if out.len() > max {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                ErrorKind::TokenTooLarge(out.len()),
            ));
        }

        if found {
            if out.last() == Some(&b'\r') {
                out.pop();
            }
            return Ok(latin1(&out));
        }
    }
}

/// Reads the stream to its end, failing with `InvalidData` if more than
/// `max` bytes arrive.
pub(crate) fn read_until_limit(r: &mut dyn Read, max: usize) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            return Ok(out);
        }

        if out.len() + n > max {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                ErrorKind::TokenTooLarge(out.len() + n),
            ));
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Copies `len` bytes from `src` to `out`.
///
/// A negative `len` means "until end of stream", and `None` as the output
/// discards the bytes; callers rely on `transfer(body, None, -1)` to drain
/// unread body data between requests on a persistent connection.
///
/// Fails if the input ends before a requested positive length is reached.
pub fn transfer(src: &mut dyn Read, mut out: Option<&mut dyn Write>, len: i64) -> io::Result<()> {
    if len == 0 {
        return Ok(());
    }

    let mut buf = [0u8; 4096];
    let mut remaining = len;

    while remaining != 0 {
        let want = if remaining < 0 || remaining > buf.len() as i64 {
            buf.len()
        } else {
            remaining as usize
        };

        let count = src.read(&mut buf[..want])?;
        if count == 0 {
            if remaining > 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "unexpected end of stream",
                ));
            }
            break;
        }

        if let Some(out) = out.as_deref_mut() {
            out.write_all(&buf[..count])?;
        }
        if remaining > 0 {
            remaining -= count as i64;
        }
    }

    Ok(())
}

/// A reader exposing exactly `limit` bytes of the underlying stream, or
/// however many remain before its end when `tolerant` is set.
///
/// Reaching the limit reports end-of-stream without touching the
/// underlying reader, so the next request on the same connection starts
/// cleanly.
pub struct LimitedReader<'a> {
    inner: &'a mut dyn BufRead,
    remaining: u64,
    tolerant: bool,
}

impl<'a> LimitedReader<'a> {
    pub fn new(inner: &'a mut dyn BufRead, limit: u64, tolerant: bool) -> Self {
        Self {
            inner,
            remaining: limit,
            tolerant,
        }
    }
}

impl Read for LimitedReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let want = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let count = self.inner.read(&mut buf[..want])?;

        if count == 0 {
            if !self.tolerant {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "unexpected end of stream",
                ));
            }
            self.remaining = 0;
            return Ok(0);
        }

        self.remaining -= count as u64;
        Ok(count)
    }
}

/// Decodes `Transfer-Encoding: chunked` input. Only the chunk data is
/// exposed to the reader; trailer headers collected after the terminating
/// zero chunk are available through [`take_trailers`](Self::take_trailers).
pub struct ChunkedReader<'a> {
    inner: &'a mut dyn BufRead,
    state: ChunkState,
    initialized: bool,
    trailers: Option<Headers>,
    max_line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkState {
    Size,
    Data(u64),
    Ended,
}

impl<'a> ChunkedReader<'a> {
    /// Wraps a stream carrying chunked-encoded data. `max_line` bounds
    /// chunk size and trailer lines.
    pub fn new(inner: &'a mut dyn BufRead, max_line: usize) -> Self {
        Self {
            inner,
            state: ChunkState::Size,
            initialized: false,
            trailers: None,
            max_line,
        }
    }

    /// Takes the trailer headers read after the terminating chunk, if the
    /// stream has ended and any were present.
    pub fn take_trailers(&mut self) -> Option<Headers> {
        self.trailers.take().filter(|t| !t.is_empty())
    }

    fn next_chunk(&mut self) -> io::Result<()> {
        // each chunk's data is terminated by a CRLF of its own
        if self.initialized && !read_line(self.inner, self.max_line)?.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk data must end with CRLF",
            ));
        }
        self.initialized = true;

        let line = read_line(self.inner, self.max_line)?;
        let size = parse_chunk_size(&line)?;

        if size == 0 {
            // last chunk is followed by optional trailers and a blank line
            self.trailers = Some(Headers::read_from(self.inner, 100, self.max_line)?);
            self.state = ChunkState::Ended;
        } else {
            self.state = ChunkState::Data(size);
        }

        Ok(())
    }
}

fn parse_chunk_size(line: &str) -> io::Result<u64> {
    let size = match line.find(';') {
        Some(pos) => &line[..pos], // ignore chunk extensions
        None => line,
    };

    parse_uhex(size.trim()).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid chunk size line: \"{}\"", line),
        )
    })
}

impl Read for ChunkedReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.state {
                ChunkState::Ended => return Ok(0),
                ChunkState::Size => self.next_chunk()?,
                ChunkState::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(0);
                    }

                    let want = buf.len().min(remaining.min(usize::MAX as u64) as usize);
                    let count = self.inner.read(&mut buf[..want])?;
                    if count == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "chunk data truncated",
                        ));
                    }

                    self.state = match remaining - count as u64 {
                        0 => ChunkState::Size,
                        left => ChunkState::Data(left),
                    };
                    return Ok(count);
                }
            }
        }
    }
}

/// Encodes output with the `chunked` transfer encoding. Every positive-
/// length `write` emits a single chunk; zero-length writes are ignored
/// since a zero-sized chunk would terminate the stream.
///
/// The trailing chunk may be written explicitly (with optional trailer
/// headers) via [`write_trailing_chunk`](Self::write_trailing_chunk), or
/// implicitly by [`finish`](Self::finish).
pub struct ChunkedWriter<W: Write> {
    inner: W,
    state: i8, // 0 = initial, 1 = chunk open, -1 = ended
}

impl<W: Write> ChunkedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, state: 0 }
    }

    fn init_chunk(&mut self, size: usize) -> io::Result<()> {
        match self.state {
            1 => self.inner.write_all(b"\r\n")?, // end previous chunk
            0 => self.state = 1,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "chunked stream has already ended",
                ))
            }
        }

        write!(self.inner, "{:x}\r\n", size)
    }

    /// Writes the zero-sized chunk which marks the end of the stream,
    /// followed by the given trailer headers, if any.
    pub fn write_trailing_chunk(&mut self, trailers: Option<&Headers>) -> io::Result<()> {
        self.init_chunk(0)?;

        match trailers {
            Some(headers) => headers.write_to(&mut self.inner)?,
            None => self.inner.write_all(b"\r\n")?,
        }

        self.state = -1;
        Ok(())
    }

    /// Writes the trailing chunk if it has not been written yet and
    /// returns the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        if self.state > -1 {
            self.write_trailing_chunk(None)?;
        }
        Ok(self.inner)
    }
}

impl<W: Write> Write for ChunkedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !buf.is_empty() {
            self.init_chunk(buf.len())?;
            self.inner.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
