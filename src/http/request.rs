//! A single HTTP request: the request line, the header block, and a body
//! stream framed according to the transfer headers.

use crate::errors::{ErrorKind, IoError};
use crate::http::body::{read_line, read_until_limit, ChunkedReader, LimitedReader};
use crate::http::cond::parse_range;
use crate::http::headers::Headers;
use crate::http::query::{dedup_params, parse_params, url_decode};
use crate::http::types::{parse_udec, split_elements, trim_duplicates, Version};
use crate::server::server::{ContextInfo, ServerState, VirtualHost};
use std::fmt;
use std::io::{self, BufRead, Read};
use std::sync::Arc;

/// An incoming HTTP request.
///
/// The request borrows the connection's input stream for its body; reading
/// the body consumes it destructively. Derived values (base URL, virtual
/// host, matched context, parameters) are computed lazily and cached.
pub struct Request<'c> {
    method: String,
    target: Target,
    version: Version,
    headers: Headers,
    body: Body<'c>,
    state: Arc<ServerState>,

    // lazily computed
    base_url: Option<BaseUrl>,
    host: Option<Arc<VirtualHost>>,
    context: Option<Arc<ContextInfo>>,
    params: Option<Vec<(String, String)>>,
}

impl<'c> Request<'c> {
    /// Reads and parses a request from the connection's input stream,
    /// selecting the body framing mandated by its transfer headers.
    pub(crate) fn parse(
        r: &'c mut dyn BufRead,
        state: &Arc<ServerState>,
    ) -> Result<Request<'c>, ErrorKind> {
        let max_line = state.limits.max_line_bytes;

        let line = read_request_line(r, max_line)?;
        let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
        if tokens.len() != 3 {
            return Err(ErrorKind::InvalidRequestLine(line.clone()));
        }

        let method = tokens[0].to_string();
        let version = Version::from_token(tokens[2])
            .ok_or_else(|| ErrorKind::UnsupportedVersion(tokens[2].to_string()))?;
        let target = Target::parse(tokens[1])
            .ok_or_else(|| ErrorKind::InvalidRequestLine(line.clone()))?;

        let headers = Headers::read_from(r, state.limits.max_header_count, max_line)
            .map_err(|e| {
                // a stalled client mid-request is a timeout, not a syntax error
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) {
                    return ErrorKind::from(e);
                }
                match ErrorKind::unwrap_io(e) {
                    ErrorKind::Io(IoError(e)) => ErrorKind::InvalidHeader(e.to_string()),
                    kind => kind,
                }
            })?;

        // RFC7230#3.3.3: a non-identity Transfer-Encoding must either
        // include "chunked" or run until the connection closes, and in
        // either case Content-Length is ignored; otherwise Content-Length
        // frames the body (no header means no body).
        let te = headers
            .get("Transfer-Encoding")
            .map(|v| v.to_ascii_lowercase());
        let kind = match te {
            Some(te) if te != "identity" => {
                if split_elements(Some(te.as_str()), true).iter().any(|e| e == "chunked") {
                    BodyKind::Chunked(ChunkedReader::new(r, max_line))
                } else {
                    BodyKind::Raw(r)
                }
            }
            _ => {
                let len = match headers.get("Content-Length") {
                    Some(v) => parse_udec(v.trim())
                        .ok_or_else(|| ErrorKind::InvalidContentLength(v.to_string()))?,
                    None => 0,
                };
                BodyKind::Limited(LimitedReader::new(r, len, false))
            }
        };

        Ok(Request {
            method,
            target,
            version,
            headers,
            body: Body(kind),
            state: Arc::clone(state),
            base_url: None,
            host: None,
            context: None,
            params: None,
        })
    }

    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    pub(crate) fn set_method(&mut self, method: &str) {
        self.method = method.to_string();
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// The raw request target as it appeared on the request line
    /// (duplicate slashes collapsed).
    pub fn target(&self) -> &str {
        &self.target.raw
    }

    /// The URL-decoded path component of the request target.
    pub fn path(&self) -> &str {
        &self.target.path
    }

    /// Sets the path component, e.g. for URL rewriting. The cached context
    /// match is invalidated.
    pub fn set_path(&mut self, path: &str) {
        self.target.path = trim_duplicates(path, '/');
        self.context = None;
    }

    /// The raw query component of the request target, if any.
    pub fn query(&self) -> Option<&str> {
        self.target.query.as_deref()
    }

    #[inline]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    #[inline]
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// The request body stream. Reads relate to this request only; the
    /// framing keeps the connection reusable for the next request.
    pub fn body_mut(&mut self) -> &mut Body<'c> {
        &mut self.body
    }

    /// Folds trailer headers of a chunked body into the header collection
    /// once the body has been consumed.
    pub(crate) fn merge_trailers(&mut self) {
        if let Some(trailers) = self.body.take_trailers() {
            self.headers.add_all(trailers);
        }
    }

    /// The scheme, host and port of the requested resource. The host is
    /// taken from the request target's authority, the `Host` header, or
    /// the detected local hostname, in that order (RFC7230#5.5).
    pub fn base_url(&mut self) -> &BaseUrl {
        if self.base_url.is_none() {
            let mut host = self
                .target
                .host
                .clone()
                .or_else(|| self.headers.get("Host").map(str::to_string))
                .unwrap_or_else(|| local_hostname().to_string()); // missing in HTTP/1.0

            host = strip_port_suffix(&host).to_string();

            self.base_url = Some(BaseUrl {
                scheme: if self.state.secure { "https" } else { "http" },
                host,
                port: self.state.port(),
            });
        }

        self.base_url.as_ref().unwrap_or(&FALLBACK_URL)
    }

    /// The virtual host serving this request, or the default host.
    pub fn virtual_host(&mut self) -> Arc<VirtualHost> {
        if self.host.is_none() {
            let name = self.base_url().host().to_string();
            let host = self
                .state
                .virtual_host(Some(&name))
                .or_else(|| self.state.virtual_host(None));
            self.host = host;
        }

        self.host
            .clone()
            .unwrap_or_else(|| Arc::new(VirtualHost::new(None)))
    }

    /// The context matched by the request path: the registered context
    /// whose path is the longest prefix of the request's, or the host's
    /// empty context.
    pub fn context(&mut self) -> Arc<ContextInfo> {
        if self.context.is_none() {
            let host = self.virtual_host();
            self.context = Some(host.get_context(&self.target.path));
        }

        self.context
            .clone()
            .unwrap_or_else(|| Arc::new(ContextInfo::new(None)))
    }

    /// The request parameters in their original order, parsed from the
    /// query and, for an `application/x-www-form-urlencoded` content type,
    /// from the body (consumed destructively, capped by the form limit).
    pub fn params_list(&mut self) -> io::Result<Vec<(String, String)>> {
        let mut params = parse_params(self.target.query.as_deref().unwrap_or(""));

        let form = self
            .headers
            .get("Content-Type")
            .is_some_and(|ct| {
                ct.to_ascii_lowercase()
                    .starts_with("application/x-www-form-urlencoded")
            });
        if form {
            let bytes = read_until_limit(&mut self.body, self.state.limits.max_form_bytes)?;
            params.extend(parse_params(&String::from_utf8_lossy(&bytes)));
        }

        Ok(params)
    }

    /// Like [`params_list`](Self::params_list), but duplicate names keep
    /// only their first value. The result is cached.
    pub fn params(&mut self) -> io::Result<&[(String, String)]> {
        if self.params.is_none() {
            let list = self.params_list()?;
            self.params = Some(dedup_params(list));
        }

        Ok(self.params.as_deref().unwrap_or_default())
    }

    /// The absolute byte range requested by the `Range` header for a
    /// resource of the given length, or `None` if the header is missing
    /// or invalid.
    pub fn range(&self, length: u64) -> Option<(u64, u64)> {
        let header = self.headers.get("Range")?;
        let spec = header.strip_prefix("bytes=")?;
        parse_range(spec, length)
    }
}

impl fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("target", &self.target.raw)
            .field("version", &self.version)
            .field("headers", &self.headers.len())
            .finish()
    }
}

fn read_request_line(r: &mut dyn BufRead, max: usize) -> Result<String, ErrorKind> {
    loop {
        // No pending byte means the next request never began: EOF or an
        // idle timeout here is a quiet disconnect, not a protocol error.
        match r.fill_buf() {
            Ok(buf) if !buf.is_empty() => {}
            _ => return Err(ErrorKind::MissingRequestLine),
        }

        // RFC2616#4.1: tolerate empty lines before the request line
        let line = read_line(r, max).map_err(ErrorKind::unwrap_io)?;
        if !line.is_empty() {
            return Ok(line);
        }
    }
}

/// The machine's auto-detected hostname, with `"localhost"` as the final
/// fallback when no detection source yields one. Resolved once per process.
fn local_hostname() -> &'static str {
    static HOSTNAME: std::sync::OnceLock<String> = std::sync::OnceLock::new();

    HOSTNAME.get_or_init(|| {
        std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .ok()
            .or_else(|| {
                ["/proc/sys/kernel/hostname", "/etc/hostname"]
                    .iter()
                    .find_map(|path| std::fs::read_to_string(path).ok())
            })
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    })
}

fn strip_port_suffix(host: &str) -> &str {
    if let Some(end) = host.find(']') {
        return &host[..=end]; // bracketed IPv6 literal
    }
    match host.find(':') {
        Some(pos) => &host[..pos],
        None => host,
    }
}

/// The parsed request target.
#[derive(Debug, Clone)]
struct Target {
    raw: String,
    path: String,
    query: Option<String>,
    host: Option<String>, // authority of an absolute-form target
}

impl Target {
    fn parse(token: &str) -> Option<Target> {
        if token == "*" {
            return Some(Target {
                raw: "*".to_string(),
                path: "*".to_string(),
                query: None,
                host: None,
            });
        }

        if token.starts_with('/') {
            return Some(Self::origin_form(token, None));
        }

        // absolute-form: scheme "://" authority path-and-query
        let rest = token
            .strip_prefix("http://")
            .or_else(|| token.strip_prefix("https://"))?;
        let (authority, path_part) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return None;
        }

        let host = strip_port_suffix(authority).to_string();
        Some(Self::origin_form(path_part, Some(host)))
    }

    fn origin_form(target: &str, host: Option<String>) -> Target {
        let collapsed = trim_duplicates(target, '/');
        let (path, query) = match collapsed.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (collapsed.clone(), None),
        };

        Target {
            raw: collapsed,
            path: url_decode(&path),
            query,
            host,
        }
    }
}

/// The scheme, host and port of a requested resource.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseUrl {
    scheme: &'static str,
    host: String,
    port: u16,
}

static FALLBACK_URL: BaseUrl = BaseUrl {
    scheme: "http",
    host: String::new(),
    port: 80,
};

impl BaseUrl {
    pub fn scheme(&self) -> &str {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for BaseUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// The request body stream, framed by `Content-Length`, chunked decoding,
/// or connection close.
pub struct Body<'c>(BodyKind<'c>);

enum BodyKind<'c> {
    Limited(LimitedReader<'c>),
    Chunked(ChunkedReader<'c>),
    Raw(&'c mut dyn BufRead),
}

impl Body<'_> {
    fn take_trailers(&mut self) -> Option<Headers> {
        match &mut self.0 {
            BodyKind::Chunked(c) => c.take_trailers(),
            _ => None,
        }
    }
}

impl Read for Body<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.0 {
            BodyKind::Limited(r) => r.read(buf),
            BodyKind::Chunked(r) => r.read(buf),
            BodyKind::Raw(r) => r.read(buf),
        }
    }
}
