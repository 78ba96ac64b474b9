use std::{error, fmt, io};

/// Failures raised while reading a request off the wire, before any handler
/// runs. The connection driver is the only place these become client-visible
/// responses; see `server::connection`.
#[derive(Debug, PartialEq)]
pub(crate) enum ErrorKind {
    /// The connection went idle (or closed) between requests, before a
    /// single byte of the next request line arrived. Not an error on a
    /// persistent connection; the driver disconnects quietly.
    MissingRequestLine,

    InvalidRequestLine(String),
    InvalidHeader(String),
    TooManyHeaders,
    TokenTooLarge(usize),

    UnsupportedVersion(String),
    InvalidContentLength(String),

    Io(IoError),
}

impl ErrorKind {
    /// Recovers a typed parse error the codec layer carried inside an
    /// `io::Error` payload; anything else is kept as an I/O error.
    pub(crate) fn unwrap_io(err: io::Error) -> ErrorKind {
        match err.get_ref().and_then(|e| e.downcast_ref::<ErrorKind>()) {
            Some(ErrorKind::TooManyHeaders) => ErrorKind::TooManyHeaders,
            Some(ErrorKind::TokenTooLarge(len)) => ErrorKind::TokenTooLarge(*len),
            _ => ErrorKind::Io(IoError(err)),
        }
    }

    /// A read that timed out mid-request maps to 408, everything else
    /// protocol-shaped maps to 400.
    pub(crate) fn is_timeout(&self) -> bool {
        matches!(
            self,
            ErrorKind::Io(IoError(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        )
    }
}

impl error::Error for ErrorKind {}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::MissingRequestLine => write!(f, "missing request line"),
            ErrorKind::InvalidRequestLine(line) => {
                write!(f, "invalid request line: \"{}\"", line)
            }
            ErrorKind::InvalidHeader(msg) => write!(f, "{}", msg),
            ErrorKind::TooManyHeaders => write!(f, "too many header lines"),
            ErrorKind::TokenTooLarge(len) => write!(f, "token too large ({})", len),
            ErrorKind::UnsupportedVersion(v) => write!(f, "unknown version: {}", v),
            ErrorKind::InvalidContentLength(v) => {
                write!(f, "invalid Content-Length: \"{}\"", v)
            }
            ErrorKind::Io(IoError(e)) => write!(f, "{}", e),
        }
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

/// Wrapper so the enum stays comparable in table-driven tests.
#[derive(Debug)]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}
