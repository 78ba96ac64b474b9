//! URL query string and `application/x-www-form-urlencoded` decoding.

use memchr::memchr;

/// Decodes a percent-encoded string. `+` decodes to a space, `%XX` pairs
/// decode to bytes, and the result is interpreted as UTF-8 (invalid
/// sequences are replaced). Malformed escapes are passed through verbatim.
pub fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                match (hex_val(bytes.get(i + 1)), hex_val(bytes.get(i + 2))) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: Option<&u8>) -> Option<u8> {
    match b {
        Some(b @ b'0'..=b'9') => Some(b - b'0'),
        Some(b @ b'a'..=b'f') => Some(b - b'a' + 10),
        Some(b @ b'A'..=b'F') => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Parses name-value pairs from an `x-www-form-urlencoded` string, as used
/// both for GET query strings and submitted form bodies. UTF-8 is assumed.
///
/// The original parameter order is retained; pairs with an empty name are
/// dropped.
pub fn parse_params(s: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let bytes = s.as_bytes();
    let mut start = 0;

    while start < bytes.len() {
        let end = memchr(b'&', &bytes[start..])
            .map(|pos| start + pos)
            .unwrap_or(bytes.len());
        let pair = &s[start..end];

        let (name, value) = match pair.split_once('=') {
            Some((n, v)) => (n, v),
            None => (pair, ""),
        };

        let name = url_decode(name.trim());
        if !name.is_empty() {
            params.push((name, url_decode(value.trim())));
        }

        start = end + 1;
    }

    params
}

/// Converts a parameter list into a first-occurrence-wins list: duplicate
/// names keep only the first value, order is retained.
pub(crate) fn dedup_params(params: Vec<(String, String)>) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::with_capacity(params.len());

    for (name, value) in params {
        if !out.iter().any(|(n, _)| *n == name) {
            out.push((name, value));
        }
    }

    out
}
