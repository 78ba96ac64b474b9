//! Decoding of `multipart/*` bodies (RFC 2046).
//!
//! [`MultipartReader`] exposes the underlying data of the parts one at a
//! time: the `Read` methods relate only to the current part, and
//! [`next_part`](MultipartReader::next_part) advances across the boundary
//! to the beginning of the next one. [`Multipart`] layers part headers and
//! `Content-Disposition` metadata on top for `multipart/form-data` uploads.

use crate::http::body::read_until_limit;
use crate::http::headers::Headers;
use crate::http::request::Request;
use crate::http::types::latin1;
use std::io::{self, BufRead, Read};

const BUF_SIZE: usize = 4096;

// state bits
const STARTED_DATA: u8 = 1;
const FIRST_BOUNDARY: u8 = 2;
const EOS: u8 = 4;
const LAST_BOUNDARY: u8 = 8;
const EPILOGUE: u8 = 0x10;

/// A boundary-splitting reader over a `multipart/*` body.
pub struct MultipartReader<'a> {
    inner: &'a mut dyn Read,
    boundary: Vec<u8>, // CRLF--boundary
    buf: Box<[u8]>,
    head: usize, // start of the current part's unread data in buf
    tail: usize, // end of the current part's data in buf
    end: usize,  // last index of input data read into buf
    len: usize,  // length of the boundary found at tail
    state: u8,
}

impl<'a> MultipartReader<'a> {
    /// Constructs a reader over the given stream.
    ///
    /// Fails with `InvalidInput` unless the boundary length is between
    /// 1 and 70 bytes (RFC2046#5.1.1).
    pub fn new(inner: &'a mut dyn Read, boundary: &[u8]) -> io::Result<Self> {
        if boundary.is_empty() || boundary.len() > 70 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid boundary length",
            ));
        }

        let mut full = Vec::with_capacity(boundary.len() + 4);
        full.extend_from_slice(b"\r\n--");
        full.extend_from_slice(boundary);

        Ok(Self {
            inner,
            boundary: full,
            buf: vec![0u8; BUF_SIZE].into_boxed_slice(),
            head: 0,
            tail: 0,
            end: 0,
            len: 0,
            state: 0,
        })
    }

    /// Advances the stream position to the beginning of the next part.
    /// Data read before calling this method for the first time is the
    /// preamble, and data read after it returns `false` is the epilogue.
    pub fn next_part(&mut self) -> io::Result<bool> {
        // skip whatever remains of the current part, up to its boundary
        while self.skip_part()? != 0 {}

        self.tail += self.len; // the next part starts right after the boundary
        self.head = self.tail;
        self.state |= STARTED_DATA;

        if self.state >= LAST_BOUNDARY {
            self.state |= EPILOGUE;
            return Ok(false);
        }

        self.find_boundary()?;
        Ok(true)
    }

    fn skip_part(&mut self) -> io::Result<usize> {
        if !self.fill()? {
            return Ok(0);
        }
        let n = self.tail - self.head;
        self.head += n;
        Ok(n)
    }

    /// Fills the buffer with more data from the underlying stream.
    /// Returns whether data is available for the current part.
    fn fill(&mut self) -> io::Result<bool> {
        if self.head != self.tail {
            return Ok(true);
        }

        // no more room: shift unread data to the beginning of the buffer
        // (256 bytes covers the largest boundary line plus whitespace)
        if self.tail > self.buf.len() - 256 {
            let end = self.end;
            self.buf.copy_within(self.tail..end, 0);
            self.end -= self.tail;
            self.head = 0;
            self.tail = 0;
        }

        // read more data and look for a boundary (or a partial one cut off
        // at the end of the data, which forces another read)
        let mut read_n: isize;
        loop {
            read_n = if self.end == self.buf.len() {
                0
            } else {
                match self.inner.read(&mut self.buf[self.end..])? {
                    0 => {
                        self.state |= EOS;
                        -1
                    }
                    n => {
                        self.end += n;
                        n as isize
                    }
                }
            };

            self.find_boundary()?;

            if !(read_n > 0 && self.tail == self.head && self.len == 0) {
                break;
            }
        }

        // update and validate state
        if self.tail != 0 {
            self.state |= STARTED_DATA; // preamble or data after a boundary
        }
        if self.state < LAST_BOUNDARY && self.len > 0 {
            self.state |= FIRST_BOUNDARY;
        }

        let eos_without_first = (self.state & (FIRST_BOUNDARY | EOS)) == EOS;
        let eos_without_more = (self.state & 0xFC) == EOS;
        let oversized = read_n == 0 && self.tail == self.head;
        if eos_without_first || self.len == 0 && (eos_without_more || oversized) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "missing boundary",
            ));
        }

        if self.state >= EPILOGUE {
            self.tail = self.end; // ignore boundaries, return everything
        }

        Ok(self.tail > self.head)
    }

    /// Finds the first (potential) boundary within the buffer's remaining
    /// data, updating `tail`, `len` and `state` accordingly.
    fn find_boundary(&mut self) -> io::Result<()> {
        self.len = 0;

        // the leading CRLF is optional for the very first boundary
        let skip_crlf = (self.state & STARTED_DATA) == 0 && self.buf[0] == b'-';
        let mut off: isize = self.tail as isize - if skip_crlf { 2 } else { 0 };

        let lend = self.end;
        while self.tail < lend {
            let mut j = self.tail;

            while j < lend
                && (j as isize - off) < self.boundary.len() as isize
                && self.buf[j] == self.boundary[(j as isize - off) as usize]
            {
                j += 1;
            }

            // at least two more bytes needed to settle a full boundary
            if j + 1 >= lend {
                return Ok(());
            }

            if (j as isize - off) == self.boundary.len() as isize {
                // a trailing "--" marks the last boundary of the multipart
                if self.buf[j] == b'-' && self.buf[j + 1] == b'-' {
                    j += 2;
                    self.state |= LAST_BOUNDARY;
                }

                // linear whitespace after the boundary is permitted
                while j < lend && (self.buf[j] == b' ' || self.buf[j] == b'\t') {
                    j += 1;
                }

                if j + 1 < lend && self.buf[j] == b'\r' && self.buf[j + 1] == b'\n' {
                    self.len = j - self.tail + 2;
                } else if j + 1 < lend || (self.state & EOS) != 0 && j + 1 == lend {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "boundary must end with CRLF",
                    ));
                } else if (self.state & EOS) != 0 {
                    // the last boundary may end with the stream itself
                    self.len = j - self.tail;
                }

                return Ok(());
            }

            self.tail += 1;
            off = self.tail as isize;
        }

        Ok(())
    }
}

impl Read for MultipartReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || !self.fill()? {
            return Ok(0);
        }

        let n = (self.tail - self.head).min(buf.len());
        buf[..n].copy_from_slice(&self.buf[self.head..self.head + n]);
        self.head += n;
        Ok(n)
    }
}

impl BufRead for MultipartReader<'_> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.fill()? {
            Ok(&self.buf[self.head..self.tail])
        } else {
            Ok(&[])
        }
    }

    fn consume(&mut self, amt: usize) {
        self.head += amt.min(self.tail - self.head);
    }
}

/// Part-by-part access to a `multipart/form-data` request body.
///
/// ```no_run
/// # fn handle(req: &mut ember_web::Request<'_>) -> std::io::Result<()> {
/// let mut form = ember_web::Multipart::from_request(req)?;
/// while let Some(mut part) = form.next_part()? {
///     match part.filename.clone() {
///         Some(name) => { /* stream the uploaded file out of `part` */ }
///         None => println!("{:?} = {}", part.name, part.text()?),
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct Multipart<'a> {
    reader: MultipartReader<'a>,
}

impl<'a> Multipart<'a> {
    /// Creates a part iterator from a `multipart/form-data` request.
    ///
    /// Fails with `InvalidInput` if the request's content type is not
    /// `multipart/form-data` or is missing its boundary parameter.
    pub fn from_request<'c>(req: &'a mut Request<'c>) -> io::Result<Multipart<'a>> {
        let params = req.headers().params("Content-Type");

        if !params
            .first()
            .is_some_and(|(v, _)| v.eq_ignore_ascii_case("multipart/form-data"))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Content-Type is not multipart/form-data",
            ));
        }

        let boundary = params
            .iter()
            .find(|(k, _)| k == "boundary")
            .map(|(_, v)| v.clone())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "Content-Type is missing boundary",
                )
            })?;

        Ok(Multipart {
            reader: MultipartReader::new(req.body_mut(), boundary.as_bytes())?,
        })
    }

    /// Advances to the next part and reads its headers, or returns `None`
    /// once the closing boundary has been crossed.
    pub fn next_part(&mut self) -> io::Result<Option<Part<'_>>> {
        if !self.reader.next_part()? {
            return Ok(None);
        }

        let headers = Headers::read_from(&mut self.reader, 100, 8192)?;
        let disposition = headers.params("Content-Disposition");
        let field = |key: &str| {
            disposition
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };

        Ok(Some(Part {
            name: field("name"),
            filename: field("filename"),
            headers,
            body: &mut self.reader,
        }))
    }
}

/// A single part of a multipart body.
pub struct Part<'p> {
    /// The part's headers.
    pub headers: Headers,
    /// The form field name.
    pub name: Option<String>,
    /// The original filename of a file form field.
    pub filename: Option<String>,
    body: &'p mut (dyn Read + 'p),
}

impl Part<'_> {
    /// Returns the part's body as a string, decoded with the part's
    /// `charset` parameter (UTF-8 if none is given). Capped at 8 KiB;
    /// larger parts should be streamed through the `Read` impl.
    pub fn text(&mut self) -> io::Result<String> {
        let bytes = read_until_limit(&mut *self.body, 8192)?;

        let charset = self
            .headers
            .params("Content-Type")
            .into_iter()
            .find(|(k, _)| k == "charset")
            .map(|(_, v)| v.to_ascii_lowercase());

        Ok(match charset.as_deref() {
            Some("iso-8859-1") | Some("latin1") => latin1(&bytes),
            _ => String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

impl Read for Part<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.body.read(buf)
    }
}
