//! Conditional-request and byte-range evaluation.

use crate::http::headers::Headers;
use crate::http::types::{parse_udec, split_elements};
use std::time::SystemTime;

/// Matches an ETag value against a list of ETags from a conditional
/// header. A match is found if the resource's ETag is present, and either
/// the list contains `*` or one of its entries is identical to the ETag.
/// Under strong comparison, tags carrying the weak prefix `W/` never match
/// (RFC7232#2.3.2).
pub(crate) fn match_etags(strong: bool, etags: &[String], etag: Option<&str>) -> bool {
    let etag = match etag {
        Some(e) => e,
        None => return false,
    };
    if strong && etag.starts_with("W/") {
        return false;
    }

    etags
        .iter()
        .any(|e| e == "*" || e == etag && !(strong && e.starts_with("W/")))
}

/// Calculates the appropriate response status for a request based on its
/// conditional headers and the resource's validators (RFC7232#6).
pub(crate) fn conditional_status(
    headers: &Headers,
    method: &str,
    last_modified: Option<SystemTime>,
    etag: Option<&str>,
) -> u16 {
    // If-Match
    if let Some(header) = headers.get("If-Match") {
        if !match_etags(true, &split_elements(Some(header), false), etag) {
            return 412;
        }
    }

    // If-Unmodified-Since
    if let Some(date) = headers.get_date("If-Unmodified-Since") {
        if last_modified.is_some_and(|lm| lm > date) {
            return 412;
        }
    }

    // If-Modified-Since
    let mut status = 200;
    let mut force = false;
    if let Some(date) = headers.get_date("If-Modified-Since") {
        if date <= SystemTime::now() {
            if last_modified.is_some_and(|lm| lm > date) {
                force = true;
            } else {
                status = 304;
            }
        }
    }

    // If-None-Match
    if let Some(header) = headers.get("If-None-Match") {
        // RFC7232#3.2: use weak matching
        if match_etags(false, &split_elements(Some(header), false), etag) {
            status = if method == "GET" || method == "HEAD" {
                304
            } else {
                412
            };
        } else {
            force = true;
        }
    }

    if force {
        200
    } else {
        status
    }
}

/// Returns the absolute (zero-based) content range for the given range
/// spec (the `Range` header value after `bytes=`). If multiple ranges are
/// requested, a single range enclosing all of them is returned.
///
/// Returns `None` if the value is invalid; per RFC7233#3.1 an invalid
/// header is ignored. A satisfiable result holds `0 <= lo <= hi < length`,
/// but the returned start may still be `>= length`, which the caller turns
/// into a 416.
pub(crate) fn parse_range(spec: &str, length: u64) -> Option<(u64, u64)> {
    let length = i64::try_from(length).ok()?;
    let mut min = i64::MAX;
    let mut max = i64::MIN;

    for token in split_elements(Some(spec), false) {
        let dash = token.find('-')?;

        let (start, end) = if dash == 0 {
            // suffix range: last n bytes
            let n = parse_udec(&token[1..])? as i64;
            (length - n, length - 1)
        } else if dash == token.len() - 1 {
            // open range: from start to the end
            (parse_udec(&token[..dash])? as i64, length - 1)
        } else {
            (
                parse_udec(&token[..dash])? as i64,
                parse_udec(&token[dash + 1..])? as i64,
            )
        };

        if end < start {
            return None;
        }
        min = min.min(start);
        max = max.max(end);
    }

    if max < 0 {
        return None; // no tokens
    }
    if max >= length && min < length {
        max = length - 1;
    }

    Some((min.max(0) as u64, max as u64))
}

/// Evaluates `If-Range` (RFC7233#3.2): when the validator is a date and
/// the resource has been modified since, or an ETag that does not equal
/// the resource's, the range is dropped and the whole entity is sent.
pub(crate) fn applicable_range(
    headers: &Headers,
    range: Option<(u64, u64)>,
    length: u64,
    last_modified: Option<SystemTime>,
    etag: &str,
) -> Option<(u64, u64)> {
    let range = range?;

    let if_range = match headers.get("If-Range") {
        Some(v) => v,
        None => return Some(range),
    };

    if range.0 >= length {
        // RFC2616#14.16, 10.4.17: invalid If-Range combination gets everything
        return None;
    }

    if !if_range.starts_with('"') && !if_range.starts_with("W/") {
        if let (Some(date), Some(lm)) = (headers.get_date("If-Range"), last_modified) {
            if lm > date {
                return None; // modified - send everything
            }
        }
        Some(range)
    } else if if_range != etag {
        None // modified - send everything
    } else {
        Some(range)
    }
}
