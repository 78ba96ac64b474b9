//! An ordered collection of HTTP headers.
//!
//! Header names are treated case-insensitively, although the collection
//! retains their original case. Insertion order is maintained as well.
//! Since the number of headers is generally quite small, a plain vector
//! with linear access proves simpler and faster than the alternatives.

use crate::errors::ErrorKind;
use crate::http::body::read_line;
use crate::http::date::parse_date;
use std::io::{self, BufRead, Write};
use std::time::SystemTime;

/// A single immutable HTTP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    name: String,
    value: String,
}

impl Header {
    /// Constructs a header with the given name and value.
    /// Leading and trailing whitespace are trimmed.
    ///
    /// A header can have an empty value (e.g. `Host`), but never an empty
    /// name; callers validate names before construction.
    pub fn new(name: &str, value: &str) -> Self {
        let name = name.trim();
        debug_assert!(!name.is_empty(), "header name cannot be empty");

        Header {
            name: name.to_string(),
            value: value.trim().to_string(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn value(&self) -> &str {
        &self.value
    }
}

/// An insertion-ordered, case-insensitive header multimap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the headers in their insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    /// Appends a header. Leading and trailing whitespace are trimmed.
    pub fn add(&mut self, name: &str, value: &str) {
        self.0.push(Header::new(name, value));
    }

    /// Appends all given headers, in their original order.
    pub fn add_all(&mut self, headers: Headers) {
        self.0.extend(headers.0);
    }

    /// Returns whether a header with the given name exists.
    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Returns the value of the first header with the given name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Returns the first header value parsed as an HTTP date, trying
    /// RFC 1123, RFC 850 and asctime in turn.
    pub fn get_date(&self, name: &str) -> Option<SystemTime> {
        self.get(name).and_then(parse_date)
    }

    /// Returns a header's parameters. Parameter order is maintained, and
    /// the first pair's key is the bare header value without parameters.
    ///
    /// `v; k1=v1; k2="v2"` parses to `[("v", ""), ("k1", "v1"), ("k2", "v2")]`.
    pub fn params(&self, name: &str) -> Vec<(String, String)> {
        let value = match self.get(name) {
            Some(v) => v,
            None => return Vec::new(),
        };

        value
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (
                    k.trim().to_string(),
                    v.trim().trim_matches('"').to_string(),
                ),
                None => (p.to_string(), String::new()),
            })
            .collect()
    }

    /// Removes all headers with the given name, if any exist.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|h| !h.name.eq_ignore_ascii_case(name));
    }

    /// Replaces the first header with the same name, preserving its
    /// position, and returns the replaced header. If no header with the
    /// name exists, the header is appended and `None` is returned.
    pub fn replace(&mut self, name: &str, value: &str) -> Option<Header> {
        for h in self.0.iter_mut() {
            if h.name.eq_ignore_ascii_case(name) {
                return Some(std::mem::replace(h, Header::new(name, value)));
            }
        }

        self.add(name, value);
        None
    }

    /// Writes the header block to the given stream, including the
    /// terminating blank line.
    pub fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        for h in &self.0 {
            write!(out, "{}: {}\r\n", h.name, h.value)?;
        }
        out.write_all(b"\r\n")
    }

    /// Reads a header block from the given stream, up to and including the
    /// terminating blank line.
    ///
    /// Folded continuation lines are joined with a single space, and
    /// repeated names are concatenated into a single element-list value
    /// (which distinguishes repetition from folding).
    pub(crate) fn read_from(
        r: &mut dyn BufRead,
        max_count: usize,
        max_line: usize,
    ) -> io::Result<Headers> {
        let mut headers = Headers::new();
        let mut prev_line = String::new();
        let mut count = 0;

        loop {
            let raw = read_line(r, max_line)?;
            if raw.is_empty() {
                break;
            }

            let start = raw.len() - raw.trim_start().len();
            let folded = start > 0;
            let line = if folded {
                format!("{} {}", prev_line, raw.trim_start())
            } else {
                raw
            };

            let separator = line.find(':').ok_or_else(|| {
                invalid(format!("invalid header: \"{}\"", line))
            })?;
            let name = &line[..separator];
            if name.trim().is_empty() {
                return Err(invalid("header name cannot be empty".to_string()));
            }
            let value = line[separator + 1..].trim().to_string();

            let replaced = headers.replace(name, &value);

            prev_line = match replaced {
                Some(prev) if !folded => {
                    let joined = format!("{}, {}", prev.value(), value);
                    headers.replace(name, &joined);
                    format!("{}: {}", name, joined)
                }
                _ => line,
            };

            count += 1;
            if count > max_count {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    ErrorKind::TooManyHeaders,
                ));
            }
        }

        Ok(headers)
    }
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn read(input: &str) -> io::Result<Headers> {
        let mut data = input.as_bytes();
        Headers::read_from(&mut data, 100, 8192)
    }

    #[test]
    fn case_insensitive_get() {
        let mut h = Headers::new();
        h.add("Content-Type", "text/plain");

        for name in ["Content-Type", "content-type", "CONTENT-TYPE", "CoNtEnT-tYpE"] {
            assert_eq!(h.get(name), Some("text/plain"));
            assert!(h.contains(name));
        }
        assert_eq!(h.get("Content-Length"), None);
    }

    #[test]
    fn preserves_order_and_case() {
        let mut h = Headers::new();
        h.add("Zebra", "1");
        h.add("alpha", "2");
        h.add("Zebra", "3");

        let names: Vec<&str> = h.iter().map(|h| h.name()).collect();
        assert_eq!(names, ["Zebra", "alpha", "Zebra"]);
        assert_eq!(h.get("zebra"), Some("1")); // first value wins
    }

    #[test]
    fn replace_keeps_position() {
        let mut h = Headers::new();
        h.add("A", "1");
        h.add("B", "2");

        let prev = h.replace("a", "9").unwrap();
        assert_eq!(prev.value(), "1");

        let names: Vec<&str> = h.iter().map(|h| h.name()).collect();
        assert_eq!(names, ["a", "B"]);
        assert_eq!(h.get("A"), Some("9"));

        assert!(h.replace("C", "3").is_none());
        assert_eq!(h.len(), 3);
    }

    #[test]
    fn remove_all_by_name() {
        let mut h = Headers::new();
        h.add("X", "1");
        h.add("Y", "2");
        h.add("x", "3");

        h.remove("X");
        assert_eq!(h.len(), 1);
        assert_eq!(h.get("Y"), Some("2"));
    }

    #[test]
    fn header_params() {
        let mut h = Headers::new();
        h.add("Content-Type", "multipart/form-data; boundary=\"abc\"; charset=utf-8");

        let params = h.params("Content-Type");
        assert_eq!(
            params,
            [
                ("multipart/form-data".to_string(), String::new()),
                ("boundary".to_string(), "abc".to_string()),
                ("charset".to_string(), "utf-8".to_string()),
            ]
        );

        assert!(h.params("Missing").is_empty());
    }

    #[test]
    fn dates() {
        let mut h = Headers::new();
        h.add("If-Modified-Since", "Sun, 06 Nov 1994 08:49:37 GMT");
        h.add("Bogus", "not a date");

        assert_eq!(
            h.get_date("If-Modified-Since"),
            Some(UNIX_EPOCH + Duration::from_secs(784_111_777))
        );
        assert_eq!(h.get_date("Bogus"), None);
        assert_eq!(h.get_date("Missing"), None);
    }

    #[test]
    fn write_round_trip() {
        let mut h = Headers::new();
        h.add("Host", "example.com");
        h.add("X-Test", "value");

        let mut out = Vec::new();
        h.write_to(&mut out).unwrap();
        assert_eq!(out, b"Host: example.com\r\nX-Test: value\r\n\r\n");

        let parsed = read("Host: example.com\r\nX-Test: value\r\n\r\n").unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn read_folding_and_repetition() {
        // folded continuation joins with a single space
        let h = read("X-Long: part one\r\n  part two\r\n\r\n").unwrap();
        assert_eq!(h.get("X-Long"), Some("part one part two"));
        assert_eq!(h.len(), 1);

        // repeated names concatenate with ", "
        let h = read("Accept: text/html\r\nAccept: text/plain\r\n\r\n").unwrap();
        assert_eq!(h.get("Accept"), Some("text/html, text/plain"));
        assert_eq!(h.len(), 1);

        // a fold after a repetition continues the concatenated value
        let h = read("A: 1\r\nA: 2\r\n 3\r\n\r\n").unwrap();
        assert_eq!(h.get("A"), Some("1, 2 3"));
    }

    #[test]
    fn read_rejects_malformed() {
        assert!(read("no colon here\r\n\r\n").is_err());
        assert!(read(": empty name\r\n\r\n").is_err());
        assert!(read("Name: value\r\n").is_err()); // missing blank line

        let mut many = String::new();
        for i in 0..101 {
            many.push_str(&format!("H{}: v\r\n", i));
        }
        many.push_str("\r\n");
        assert!(read(&many).is_err());
    }

    #[test]
    fn read_empty_block() {
        let h = read("\r\n").unwrap();
        assert!(h.is_empty());
    }
}
