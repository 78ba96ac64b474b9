//! Server configuration limits and timeouts.
//!
//! Default limits are intentionally conservative: they bound what a single
//! connection can make the server read before the transaction is failed
//! with a `400`, and how long an idle socket may hold a worker.

use std::time::Duration;

/// Per-connection read limits.
///
/// # Examples
///
/// ```no_run
/// use ember_web::{Limits, Server};
/// use std::time::Duration;
///
/// let server = Server::builder()
///     .port(8080)
///     .limits(Limits {
///         read_timeout: Duration::from_secs(5),
///         ..Limits::default()
///     })
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct Limits {
    /// Socket read timeout (default: `1 second`).
    ///
    /// Bounds the time between requests on a persistent connection. A
    /// timeout before the next request line arrives is a quiet disconnect;
    /// a timeout mid-request yields `408`.
    pub read_timeout: Duration,

    /// Maximum length of a single protocol line in bytes (default: `8192`).
    ///
    /// Applies to the request line, each header line, and chunk size lines.
    pub max_line_bytes: usize,

    /// Maximum number of header lines per request (default: `100`).
    pub max_header_count: usize,

    /// Cap on an `application/x-www-form-urlencoded` body read by the
    /// parameter accessors (default: `2 MiB`).
    pub max_form_bytes: usize,

    #[doc(hidden)]
    pub _priv: (),
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(1),
            max_line_bytes: 8192,
            max_header_count: 100,
            max_form_bytes: 2 * 1024 * 1024,

            _priv: (),
        }
    }
}
