//! Response emission: status line and header block, `Date`/`Server`
//! stamping, negotiated chunking and gzip/deflate compression, partial
//! content, redirects and default error pages.

use crate::http::body::{transfer, ChunkedWriter};
use crate::http::date::format_date;
use crate::http::headers::Headers;
use crate::http::request::Request;
use crate::http::types::{escape_html, reason_phrase, split_elements, Version};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use std::io::{self, Read, Write};
use std::time::SystemTime;

/// MIME types eligible for compression (prefix/suffix wildcards allowed).
const COMPRESSIBLE_TYPES: [&str; 5] = ["text/*", "*/javascript", "*icon", "*+xml", "*/json"];

/// Bodies of known length at or below this many bytes are sent as-is.
const COMPRESS_THRESHOLD: u64 = 300;

const SERVER_HEADER: &str = concat!("ember_web/", env!("CARGO_PKG_VERSION"));

/// The response side of a transaction.
///
/// Created per request, used by exactly one handler, and closed by the
/// connection driver after the transaction. Headers are staged in memory
/// until the first `send_*` call emits them; the body sink is wrapped in
/// chunked and compression encoders as negotiated by the emitted headers.
pub struct Response<'c> {
    out: Option<&'c mut dyn Write>,
    sink: Option<Sink<'c>>,
    headers: Headers,
    headers_sent: bool,
    discard_body: bool,
    accepts_gzip: bool,
    accepts_deflate: bool,
    accepts_chunked: bool,
}

impl<'c> Response<'c> {
    pub(crate) fn new(out: &'c mut dyn Write) -> Self {
        Self {
            out: Some(out),
            sink: None,
            headers: Headers::new(),
            headers_sent: false,
            discard_body: false,
            accepts_gzip: false,
            accepts_deflate: false,
            accepts_chunked: false,
        }
    }

    /// Discards everything staged so far so an error response can replace
    /// it. Only meaningful while the headers have not been sent.
    pub(crate) fn reset(&mut self) {
        self.headers = Headers::new();
    }

    pub(crate) fn set_client_capabilities(&mut self, req: &Request<'_>) {
        let accepted = split_elements(req.headers().get("Accept-Encoding"), true);
        let has = |name: &str| {
            accepted
                .iter()
                .any(|e| e.split(';').next().unwrap_or("").trim() == name)
        };

        self.accepts_gzip = has("gzip") || has("x-gzip");
        self.accepts_deflate = has("deflate");
        self.accepts_chunked = req.version() == Version::Http11;
    }

    #[inline]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    #[inline]
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Whether the status line and headers have already been written.
    #[inline]
    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Suppresses body output (HEAD processing); headers are unaffected.
    pub fn set_discard_body(&mut self, discard: bool) {
        self.discard_body = discard;
    }

    /// Writes an interim `100 Continue` response and flushes it, leaving
    /// the real response untouched.
    pub(crate) fn send_continue(&mut self) -> io::Result<()> {
        if let Some(out) = self.out.as_deref_mut() {
            out.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
            out.flush()?;
        }
        Ok(())
    }

    /// Writes the status line and the staged headers, adding `Date` and
    /// `Server` if absent. A second call is a no-op.
    pub fn send_headers(&mut self, status: u16) -> io::Result<()> {
        if self.headers_sent {
            return Ok(());
        }

        if !self.headers.contains("Date") {
            if let Ok(date) = format_date(SystemTime::now()) {
                self.headers.add("Date", &date);
            }
        }
        if !self.headers.contains("Server") {
            self.headers.add("Server", SERVER_HEADER);
        }

        let out = self
            .out
            .as_deref_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "response already streaming"))?;

        write!(out, "HTTP/1.1 {} {}\r\n", status, reason_phrase(status))?;
        self.headers.write_to(out)?;
        self.headers_sent = true;
        Ok(())
    }

    /// Sends the response headers for a resource, negotiating the body
    /// framing and encoding:
    ///
    /// - with a `range`, a `Content-Range` is added and a `200` status is
    ///   substituted with `206` (the caller passes the un-adjusted length);
    /// - without a known length, the body is chunked when the client
    ///   speaks HTTP/1.1, otherwise the connection is marked to close;
    /// - compressible content types above the size threshold are wrapped
    ///   in `gzip`/`deflate` when the client accepts one.
    pub fn send_headers_with(
        &mut self,
        status: u16,
        length: Option<u64>,
        last_modified: Option<SystemTime>,
        etag: Option<&str>,
        content_type: Option<&str>,
        range: Option<(u64, u64)>,
    ) -> io::Result<()> {
        if self.headers_sent {
            return Ok(());
        }

        let mut status = status;
        let mut length = length;

        if let Some((lo, hi)) = range {
            let total = match length {
                Some(len) => len.to_string(),
                None => "*".to_string(),
            };
            self.headers
                .add("Content-Range", &format!("bytes {}-{}/{}", lo, hi, total));
            length = Some(hi - lo + 1);
            if status == 200 {
                status = 206;
            }
        }

        let ct = match self.headers.get("Content-Type") {
            Some(ct) => ct.to_string(),
            None => {
                let ct = content_type.unwrap_or("application/octet-stream");
                self.headers.add("Content-Type", ct);
                ct.to_string()
            }
        };

        if !self.headers.contains("Content-Length") && !self.headers.contains("Transfer-Encoding") {
            let compression = if is_compressible(&ct)
                && length.map_or(true, |len| len > COMPRESS_THRESHOLD)
            {
                [("gzip", self.accepts_gzip), ("deflate", self.accepts_deflate)]
                    .into_iter()
                    .find(|(_, ok)| *ok)
                    .map(|(enc, _)| enc)
            } else {
                None
            };

            match compression {
                // compressed output has no predictable length, so it rides
                // on chunked framing
                Some(enc) if self.accepts_chunked => {
                    self.headers.add("Transfer-Encoding", "chunked");
                    self.headers.add("Content-Encoding", enc);
                    if !self.headers.contains("Vary") {
                        self.headers.add("Vary", "Accept-Encoding");
                    }
                }
                _ if length.is_none() => {
                    if self.accepts_chunked {
                        self.headers.add("Transfer-Encoding", "chunked");
                    } else {
                        self.headers.replace("Connection", "close");
                    }
                }
                _ => {
                    let len = length.unwrap_or(0);
                    self.headers.add("Content-Length", &len.to_string());
                }
            }
        }

        if let Some(lm) = last_modified {
            if !self.headers.contains("Last-Modified") {
                let lm = lm.min(SystemTime::now());
                if let Ok(date) = format_date(lm) {
                    self.headers.add("Last-Modified", &date);
                }
            }
        }
        if let Some(etag) = etag {
            if !self.headers.contains("ETag") {
                self.headers.add("ETag", etag);
            }
        }

        self.send_headers(status)
    }

    /// The response body sink, wrapped according to the sent headers.
    /// HEAD processing yields a sink that swallows everything.
    pub fn body(&mut self) -> io::Result<&mut dyn Write> {
        if self.sink.is_none() {
            let sink = if self.discard_body {
                self.out.take();
                Sink::Null
            } else {
                let out = self.out.take().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Other, "response body already taken")
                })?;

                let chunked = self
                    .headers
                    .get("Transfer-Encoding")
                    .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
                let inner = if chunked {
                    SinkInner::Chunked(ChunkedWriter::new(out))
                } else {
                    SinkInner::Bare(out)
                };

                match self.headers.get("Content-Encoding") {
                    Some(enc) if enc.eq_ignore_ascii_case("gzip") => {
                        Sink::Gzip(GzEncoder::new(inner, Compression::default()))
                    }
                    Some(enc) if enc.eq_ignore_ascii_case("deflate") => {
                        Sink::Deflate(ZlibEncoder::new(inner, Compression::default()))
                    }
                    _ => Sink::Identity(inner),
                }
            };
            self.sink = Some(sink);
        }

        match self.sink.as_mut() {
            Some(sink) => Ok(sink),
            None => Err(io::Error::new(io::ErrorKind::Other, "no body sink")),
        }
    }

    /// Streams `src` into the body sink, honoring a range if one was sent.
    /// Suppressed entirely when the body is being discarded (HEAD).
    pub fn send_body(
        &mut self,
        src: &mut dyn Read,
        length: i64,
        range: Option<(u64, u64)>,
    ) -> io::Result<()> {
        if self.discard_body {
            return Ok(());
        }

        let out = self.body()?;
        match range {
            Some((lo, hi)) => {
                transfer(src, None, lo as i64)?;
                transfer(src, Some(out), (hi - lo + 1) as i64)
            }
            None => transfer(src, Some(out), length),
        }
    }

    /// Sends a complete `text/html; charset=utf-8` response with the
    /// given status.
    pub fn send(&mut self, status: u16, text: &str) -> io::Result<()> {
        let content = text.as_bytes().to_vec();
        self.send_headers_with(
            status,
            Some(content.len() as u64),
            None,
            None,
            Some("text/html; charset=utf-8"),
            None,
        )?;

        if !self.discard_body {
            self.body()?.write_all(&content)?;
        }
        Ok(())
    }

    /// Sends a default error page for the given status.
    pub fn send_error(&mut self, status: u16) -> io::Result<()> {
        let text = if status < 400 {
            ":)"
        } else {
            "sorry, it can't be done"
        };
        self.send_error_msg(status, text)
    }

    /// Sends an error page carrying the given (HTML-escaped) text.
    /// Error statuses mark the connection to close.
    pub fn send_error_msg(&mut self, status: u16, text: &str) -> io::Result<()> {
        if status >= 400 {
            self.headers.replace("Connection", "close");
        }

        let reason = reason_phrase(status);
        let page = format!(
            "<!DOCTYPE html>\n<html>\n<head><title>{status} {reason}</title></head>\n\
             <body>\n<h1>{status} {reason}</h1>\n<p>{}</p>\n<hr>\n\
             <p><a href=\"/\">Home</a></p>\n</body>\n</html>",
            escape_html(text),
        );
        self.send(status, &page)
    }

    /// Sends a `301`/`302` redirect to the given URL with an empty body.
    pub fn redirect(&mut self, url: &str, permanent: bool) -> io::Result<()> {
        self.headers.add("Location", url);
        let status = if permanent { 301 } else { 302 };
        self.send_headers_with(
            status,
            Some(0),
            None,
            None,
            Some("text/html; charset=utf-8"),
            None,
        )
    }

    /// Finishes the body sink (writing the trailing chunk and the
    /// compressor epilogue as needed) and flushes the connection. The
    /// underlying socket stays open.
    pub(crate) fn close(&mut self) -> io::Result<()> {
        if let Some(sink) = self.sink.take() {
            sink.finish()?;
        } else if let Some(out) = self.out.as_deref_mut() {
            out.flush()?;
        }
        Ok(())
    }
}

/// Checks whether data of the given content type is worth compressing.
fn is_compressible(content_type: &str) -> bool {
    let ct = content_type
        .split(';') // exclude params
        .next()
        .unwrap_or("")
        .trim();

    COMPRESSIBLE_TYPES.iter().any(|pat| {
        *pat == ct
            || pat.strip_prefix('*').is_some_and(|sfx| ct.ends_with(sfx))
            || pat.strip_suffix('*').is_some_and(|pfx| ct.starts_with(pfx))
    })
}

enum SinkInner<'c> {
    Bare(&'c mut dyn Write),
    Chunked(ChunkedWriter<&'c mut dyn Write>),
}

impl SinkInner<'_> {
    fn finish(self) -> io::Result<()> {
        match self {
            SinkInner::Bare(w) => w.flush(),
            SinkInner::Chunked(cw) => cw.finish()?.flush(),
        }
    }
}

impl Write for SinkInner<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SinkInner::Bare(w) => w.write(buf),
            SinkInner::Chunked(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SinkInner::Bare(w) => w.flush(),
            SinkInner::Chunked(w) => w.flush(),
        }
    }
}

enum Sink<'c> {
    Identity(SinkInner<'c>),
    Gzip(GzEncoder<SinkInner<'c>>),
    Deflate(ZlibEncoder<SinkInner<'c>>),
    Null,
}

impl Sink<'_> {
    fn finish(self) -> io::Result<()> {
        match self {
            Sink::Identity(inner) => inner.finish(),
            Sink::Gzip(gz) => gz.finish()?.finish(),
            Sink::Deflate(z) => z.finish()?.finish(),
            Sink::Null => Ok(()),
        }
    }
}

impl Write for Sink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Identity(w) => w.write(buf),
            Sink::Gzip(w) => w.write(buf),
            Sink::Deflate(w) => w.write(buf),
            Sink::Null => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Identity(w) => w.flush(),
            Sink::Gzip(w) => w.flush(),
            Sink::Deflate(w) => w.flush(),
            Sink::Null => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    fn text_of(out: &[u8]) -> String {
        crate::http::types::latin1(out)
    }

    fn split_head_body(out: &[u8]) -> (String, Vec<u8>) {
        let pos = out
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("no header terminator");
        (text_of(&out[..pos + 4]), out[pos + 4..].to_vec())
    }

    #[test]
    fn plain_send() {
        let mut out: Vec<u8> = Vec::new();
        {
            let mut resp = Response::new(&mut out);
            resp.send(200, "ok").unwrap();
            resp.close().unwrap();
        }

        let (head, body) = split_head_body(&out);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: text/html; charset=utf-8\r\n"));
        assert!(head.contains("Content-Length: 2\r\n"));
        assert!(head.contains("Date: "));
        assert!(head.contains("Server: "));
        assert_eq!(body, b"ok");
    }

    #[test]
    fn headers_idempotent() {
        let mut out: Vec<u8> = Vec::new();
        {
            let mut resp = Response::new(&mut out);
            assert!(!resp.headers_sent());
            resp.send_headers(204).unwrap();
            assert!(resp.headers_sent());
            resp.send_headers(500).unwrap(); // no-op
            resp.close().unwrap();
        }

        let text = text_of(&out);
        assert!(text.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(!text.contains("500"));
    }

    #[test]
    fn range_substitutes_206() {
        let mut out: Vec<u8> = Vec::new();
        {
            let mut resp = Response::new(&mut out);
            resp.send_headers_with(200, Some(100), None, None, None, Some((0, 9)))
                .unwrap();
            let mut src: &[u8] = &[7u8; 100];
            resp.send_body(&mut src, 100, Some((0, 9))).unwrap();
            resp.close().unwrap();
        }

        let (head, body) = split_head_body(&out);
        assert!(head.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(head.contains("Content-Range: bytes 0-9/100\r\n"));
        assert!(head.contains("Content-Length: 10\r\n"));
        assert_eq!(body.len(), 10);
    }

    #[test]
    fn range_skips_to_start() {
        let mut out: Vec<u8> = Vec::new();
        {
            let mut resp = Response::new(&mut out);
            resp.send_headers_with(200, Some(10), None, None, None, Some((4, 6)))
                .unwrap();
            let mut src: &[u8] = b"0123456789";
            resp.send_body(&mut src, 10, Some((4, 6))).unwrap();
            resp.close().unwrap();
        }

        let (head, body) = split_head_body(&out);
        assert!(head.contains("Content-Range: bytes 4-6/10\r\n"));
        assert_eq!(body, b"456");
    }

    #[test]
    fn unknown_length_uses_chunked_for_http11() {
        let mut out: Vec<u8> = Vec::new();
        {
            let mut resp = Response::new(&mut out);
            resp.accepts_chunked = true;
            resp.send_headers_with(200, None, None, None, Some("application/octet-stream"), None)
                .unwrap();
            resp.body().unwrap().write_all(b"stream data").unwrap();
            resp.close().unwrap();
        }

        let (head, body) = split_head_body(&out);
        assert!(head.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!head.contains("Content-Length"));
        assert_eq!(body, b"b\r\nstream data\r\n0\r\n\r\n");
    }

    #[test]
    fn unknown_length_closes_for_http10() {
        let mut out: Vec<u8> = Vec::new();
        {
            let mut resp = Response::new(&mut out);
            resp.send_headers_with(200, None, None, None, None, None).unwrap();
            resp.body().unwrap().write_all(b"data").unwrap();
            resp.close().unwrap();
        }

        let (head, body) = split_head_body(&out);
        assert!(head.contains("Connection: close\r\n"));
        assert!(!head.contains("Transfer-Encoding"));
        assert_eq!(body, b"data");
    }

    #[test]
    fn gzip_round_trip() {
        let payload = "compress me ".repeat(100);
        let mut out: Vec<u8> = Vec::new();
        {
            let mut resp = Response::new(&mut out);
            resp.accepts_gzip = true;
            resp.accepts_chunked = true;
            resp.send(200, &payload).unwrap();
            resp.close().unwrap();
        }

        let (head, body) = split_head_body(&out);
        assert!(head.contains("Content-Encoding: gzip\r\n"));
        assert!(head.contains("Transfer-Encoding: chunked\r\n"));
        assert!(head.contains("Vary: Accept-Encoding\r\n"));
        assert!(!head.contains("Content-Length"));

        // un-chunk, then gunzip
        let mut dechunked = Vec::new();
        {
            let mut src: &[u8] = &body;
            let mut reader = crate::http::body::ChunkedReader::new(&mut src, 8192);
            reader.read_to_end(&mut dechunked).unwrap();
        }
        let mut decoded = String::new();
        GzDecoder::new(&dechunked[..])
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn small_or_binary_bodies_stay_identity() {
        // small text body: under the threshold
        let mut out: Vec<u8> = Vec::new();
        {
            let mut resp = Response::new(&mut out);
            resp.accepts_gzip = true;
            resp.accepts_chunked = true;
            resp.send(200, "tiny").unwrap();
            resp.close().unwrap();
        }
        assert!(!text_of(&out).contains("Content-Encoding"));

        // large but non-compressible type
        let mut out: Vec<u8> = Vec::new();
        {
            let mut resp = Response::new(&mut out);
            resp.accepts_gzip = true;
            resp.accepts_chunked = true;
            resp.headers_mut().add("Content-Type", "image/png");
            resp.send_headers_with(200, Some(100_000), None, None, None, None)
                .unwrap();
            resp.close().unwrap();
        }
        let text = text_of(&out);
        assert!(!text.contains("Content-Encoding"));
        assert!(text.contains("Content-Length: 100000\r\n"));
    }

    #[test]
    fn compressible_patterns() {
        #[rustfmt::skip]
        let cases = [
            ("text/html",                          true),
            ("text/plain; charset=utf-8",          true),
            ("application/javascript",             true),
            ("application/json",                   true),
            ("image/x-icon",                       true),
            ("image/svg+xml",                      true),
            ("image/png",                          false),
            ("application/octet-stream",           false),
            ("video/mp4",                          false),
        ];

        for (ct, expected) in cases {
            assert_eq!(is_compressible(ct), expected, "{}", ct);
        }
    }

    #[test]
    fn validators_and_existing_headers() {
        let lm = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(784_111_777);
        let mut out: Vec<u8> = Vec::new();
        {
            let mut resp = Response::new(&mut out);
            resp.send_headers_with(200, Some(3), Some(lm), Some("W/\"123\""), Some("text/plain"), None)
                .unwrap();
            resp.close().unwrap();
        }

        let text = text_of(&out);
        assert!(text.contains("Last-Modified: Sun, 06 Nov 1994 08:49:37 GMT\r\n"));
        assert!(text.contains("ETag: W/\"123\"\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
    }

    #[test]
    fn error_page() {
        let mut out: Vec<u8> = Vec::new();
        {
            let mut resp = Response::new(&mut out);
            resp.send_error_msg(404, "no <such> file").unwrap();
            resp.close().unwrap();
        }

        let (head, body) = split_head_body(&out);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        let page = String::from_utf8(body).unwrap();
        assert!(page.contains("404 Not Found"));
        assert!(page.contains("no &lt;such&gt; file"));
        assert!(page.contains("<a href=\"/\">"));
    }

    #[test]
    fn redirects() {
        let mut out: Vec<u8> = Vec::new();
        {
            let mut resp = Response::new(&mut out);
            resp.redirect("http://h:80/new/", true).unwrap();
            resp.close().unwrap();
        }

        let (head, body) = split_head_body(&out);
        assert!(head.starts_with("HTTP/1.1 301 Moved Permanently\r\n"));
        assert!(head.contains("Location: http://h:80/new/\r\n"));
        assert!(head.contains("Content-Length: 0\r\n"));
        assert!(body.is_empty());
    }

    #[test]
    fn discarded_body_keeps_headers() {
        let mut out: Vec<u8> = Vec::new();
        {
            let mut resp = Response::new(&mut out);
            resp.set_discard_body(true);
            resp.send(200, "invisible").unwrap();
            resp.close().unwrap();
        }

        let (head, body) = split_head_body(&out);
        assert!(head.contains("Content-Length: 9\r\n"));
        assert!(body.is_empty());
    }

    #[test]
    fn reset_discards_staged_headers() {
        let mut out: Vec<u8> = Vec::new();
        {
            let mut resp = Response::new(&mut out);
            resp.headers_mut().add("X-Stale", "yes");
            resp.reset();
            resp.send_headers(200).unwrap();
            resp.close().unwrap();
        }

        assert!(!text_of(&out).contains("X-Stale"));
    }
}
