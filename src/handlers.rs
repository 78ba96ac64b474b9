//! A conforming static-file context handler.
//!
//! Maps a context to a directory on disk and serves its files with their
//! media types, honoring conditional and partial retrievals. Directories
//! are answered with a generated index page when the virtual host allows
//! one. Doubles as the reference for what a handler implementation owes
//! the core.

use crate::http::cond::{applicable_range, conditional_status};
use crate::http::date::format_date;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::types::{escape_html, format_size, parent_path};
use crate::server::server::Handler;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// A mapping of path suffixes (file extensions) to media types.
///
/// The defaults cover the common web types; embedders can add their own
/// mappings or construct an empty registry. Suffixes are matched
/// case-insensitively.
pub struct MediaTypes {
    map: HashMap<String, String>,
}

impl MediaTypes {
    pub fn empty() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Associates the given suffixes with a content type, replacing any
    /// previous association.
    pub fn add(&mut self, content_type: &str, suffixes: &[&str]) {
        for suffix in suffixes {
            self.map
                .insert(suffix.to_ascii_lowercase(), content_type.to_string());
        }
    }

    /// The content type for the given path according to its suffix, or
    /// the given default if none can be determined.
    pub fn content_type<'s>(&'s self, path: &str, default: &'s str) -> &'s str {
        let suffix = match path.rsplit_once('.') {
            Some((_, sfx)) => sfx.to_ascii_lowercase(),
            None => return default,
        };
        self.map.get(&suffix).map(String::as_str).unwrap_or(default)
    }
}

impl Default for MediaTypes {
    fn default() -> Self {
        let mut types = Self::empty();
        // see http://www.iana.org/assignments/media-types/ for the full list
        types.add("application/font-woff", &["woff"]);
        types.add("application/font-woff2", &["woff2"]);
        types.add("application/java-archive", &["jar"]);
        types.add("application/javascript", &["js"]);
        types.add("application/json", &["json"]);
        types.add("application/octet-stream", &["exe"]);
        types.add("application/pdf", &["pdf"]);
        types.add("application/x-7z-compressed", &["7z"]);
        types.add("application/x-compressed", &["tgz"]);
        types.add("application/x-gzip", &["gz"]);
        types.add("application/x-tar", &["tar"]);
        types.add("application/xhtml+xml", &["xhtml"]);
        types.add("application/zip", &["zip"]);
        types.add("audio/mpeg", &["mp3"]);
        types.add("image/gif", &["gif"]);
        types.add("image/jpeg", &["jpg", "jpeg"]);
        types.add("image/png", &["png"]);
        types.add("image/svg+xml", &["svg"]);
        types.add("image/x-icon", &["ico"]);
        types.add("text/css", &["css"]);
        types.add("text/csv", &["csv"]);
        types.add("text/html; charset=utf-8", &["htm", "html"]);
        types.add("text/plain", &["txt", "text", "log"]);
        types.add("text/xml", &["xml"]);
        types
    }
}

/// Serves a context from a directory on disk (recursively).
pub struct FileHandler {
    base: PathBuf,
    media: MediaTypes,
}

impl FileHandler {
    /// Creates a handler rooted at the given directory.
    pub fn new(dir: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            base: dir.as_ref().canonicalize()?,
            media: MediaTypes::default(),
        })
    }

    pub fn with_media_types(mut self, media: MediaTypes) -> Self {
        self.media = media;
        self
    }
}

impl Handler for FileHandler {
    fn serve(&self, req: &mut Request<'_>, resp: &mut Response<'_>) -> io::Result<u16> {
        let context = req.context();
        let prefix = context.path().unwrap_or("").to_string();
        serve_file(&self.base, &prefix, &self.media, req, resp)
    }
}

/// Serves the file or directory the request path maps to beneath `base`,
/// returning a status code for the dispatcher's default handling, or `0`
/// when a response was written.
fn serve_file(
    base: &Path,
    context: &str,
    media: &MediaTypes,
    req: &mut Request<'_>,
    resp: &mut Response<'_>,
) -> io::Result<u16> {
    let path = req.path().to_string();
    let relative = path.strip_prefix(context).unwrap_or(&path).to_string();

    let file = match base.join(relative.trim_start_matches('/')).canonicalize() {
        Ok(file) => file,
        Err(_) => return Ok(404),
    };

    let hidden = file
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'));
    if hidden {
        return Ok(404);
    }
    if !file.starts_with(base) {
        return Ok(403); // escaped the served directory
    }

    let meta = match fs::metadata(&file) {
        Ok(meta) => meta,
        Err(_) => return Ok(404),
    };

    if meta.is_dir() {
        if relative.ends_with('/') {
            if !req.virtual_host().allow_generated_index() {
                return Ok(403);
            }
            let index = create_index(&file, &path)?;
            resp.send(200, &index)?;
        } else {
            // redirect to the normalized directory URL ending with '/'
            let base_url = req.base_url().to_string();
            resp.redirect(&format!("{}{}/", base_url, path), true)?;
        }
    } else if relative.ends_with('/') {
        return Ok(404); // a file path with a trailing slash names nothing
    } else {
        serve_file_content(&file, media, req, resp)?;
    }

    Ok(0)
}

/// Serves an existing readable file, handling conditional and partial
/// retrievals according to the RFC.
fn serve_file_content(
    file: &Path,
    media: &MediaTypes,
    req: &mut Request<'_>,
    resp: &mut Response<'_>,
) -> io::Result<()> {
    let meta = fs::metadata(file)?;
    let len = meta.len();
    let modified = meta.modified().ok();

    // a weak validator derived from the modification time
    let mtime = modified
        .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let etag = format!("W/\"{}\"", mtime);

    let mut status = 200;
    let mut range = req.range(len);
    if range.is_none() || len == 0 {
        range = None;
        status = conditional_status(req.headers(), req.method(), modified, Some(&etag));
    } else if req.headers().get("If-Range").is_none() {
        if range.is_some_and(|(lo, _)| lo >= len) {
            status = 416; // unsatisfiable
        } else {
            status = conditional_status(req.headers(), req.method(), modified, Some(&etag));
        }
    } else {
        range = applicable_range(req.headers(), range, len, modified, &etag);
    }

    match status {
        304 => {
            // no other headers or body allowed
            resp.headers_mut().add("ETag", &etag);
            resp.headers_mut().add("Vary", "Accept-Encoding");
            if let Some(lm) = modified {
                if let Ok(date) = format_date(lm) {
                    resp.headers_mut().add("Last-Modified", &date);
                }
            }
            resp.send_headers(304)
        }
        412 => resp.send_headers(412),
        416 => {
            resp.headers_mut()
                .add("Content-Range", &format!("bytes */{}", len));
            resp.send_headers(416)
        }
        200 => {
            let name = file.file_name().and_then(|n| n.to_str()).unwrap_or("");
            let ct = media.content_type(name, "application/octet-stream");
            resp.send_headers_with(200, Some(len), modified, Some(&etag), Some(ct), range)?;

            let mut src = File::open(file)?;
            resp.send_body(&mut src, len as i64, range)
        }
        _ => resp.send_headers(500),
    }
}

/// Renders the contents of a directory as an HTML index page.
fn create_index(dir: &Path, path: &str) -> io::Result<String> {
    let path = if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    };

    let mut entries: Vec<(String, bool, u64)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let meta = entry.metadata()?;
        entries.push((name, meta.is_dir(), meta.len()));
    }
    // directories first, each group by name
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let width = entries
        .iter()
        .map(|(name, _, _)| name.len())
        .max()
        .unwrap_or(0)
        .max(21)
        + 2;

    let mut page = format!(
        "<!DOCTYPE html>\n<html><head><title>Index of {path}</title></head>\n\
         <body><h1>Index of {path}</h1>\n<pre> Name{:w$} Size<hr>",
        "",
        w = width - 4,
    );

    if path.len() > 1 {
        if let Some(parent) = parent_path(&path) {
            page.push_str(&format!(
                " <a href=\"{}/\">Parent Directory</a>\n",
                encode_href(parent),
            ));
        }
    }

    for (name, is_dir, size) in entries {
        let display = if is_dir {
            format!("{}/", name)
        } else {
            name.clone()
        };
        let size = if is_dir {
            "- ".to_string()
        } else {
            format_size(size)
        };
        let padding = width.saturating_sub(display.len());
        page.push_str(&format!(
            " <a href=\"{}\">{}</a>{:padding$}{:>6}\n",
            encode_href(&format!("{}{}", path, display)),
            escape_html(&display),
            "",
            size,
        ));
    }

    page.push_str("</pre></body></html>");
    Ok(page)
}

/// Percent-encodes a path for use in a link, leaving the path structure
/// intact.
fn encode_href(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for b in path.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{default_host, run, test_root};

    fn site(files: &[(&str, &str)]) -> PathBuf {
        let root = test_root();
        for (name, content) in files {
            let target = root.join(name);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(target, content).unwrap();
        }
        root
    }

    fn file_state(root: &Path) -> std::sync::Arc<crate::server::server::ServerState> {
        let state = crate::server::server::test_state();
        default_host(&state).add_context("/", &["GET"], FileHandler::new(root).unwrap());
        state
    }

    #[test]
    fn media_type_lookup() {
        let types = MediaTypes::default();

        #[rustfmt::skip]
        let cases = [
            ("index.html",   "text/html; charset=utf-8"),
            ("INDEX.HTML",   "text/html; charset=utf-8"),
            ("app.js",       "application/javascript"),
            ("data.json",    "application/json"),
            ("noext",        "application/octet-stream"),
            ("odd.xyz",      "application/octet-stream"),
        ];

        for (name, expected) in cases {
            assert_eq!(
                types.content_type(name, "application/octet-stream"),
                expected,
                "{}",
                name
            );
        }
    }

    #[test]
    fn serves_file_with_validators() {
        let root = site(&[("hello.txt", "hello world")]);
        let state = file_state(&root);

        let out = run(&state, b"GET /hello.txt HTTP/1.1\r\nHost: h\r\n\r\n");

        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{}", out);
        assert!(out.contains("Content-Type: text/plain\r\n"));
        assert!(out.contains("Content-Length: 11\r\n"));
        assert!(out.contains("ETag: W/\""));
        assert!(out.contains("Last-Modified: "));
        assert!(out.ends_with("hello world"));
    }

    #[test]
    fn missing_file_is_404() {
        let root = site(&[("present.txt", "x")]);
        let state = file_state(&root);

        let out = run(&state, b"GET /absent.txt HTTP/1.1\r\nHost: h\r\n\r\n");
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", out);
    }

    #[test]
    fn dotfiles_are_hidden() {
        let root = site(&[(".secret", "keys")]);
        let state = file_state(&root);

        let out = run(&state, b"GET /.secret HTTP/1.1\r\nHost: h\r\n\r\n");
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", out);
    }

    #[test]
    fn traversal_cannot_escape_base() {
        let root = site(&[("inside.txt", "in")]);
        let state = file_state(&root);

        let out = run(
            &state,
            b"GET /../../etc/passwd HTTP/1.1\r\nHost: h\r\n\r\n",
        );
        let status: String = out.chars().take(12).collect();
        assert!(
            status.contains("404") || status.contains("403"),
            "{}",
            out
        );
    }

    #[test]
    fn conditional_get_not_modified() {
        let root = site(&[("page.html", "<p>cached</p>")]);
        let state = file_state(&root);

        // fetch once to learn the validators
        let first = run(&state, b"GET /page.html HTTP/1.1\r\nHost: h\r\n\r\n");
        let etag_line = first
            .lines()
            .find(|l| l.starts_with("ETag: "))
            .expect("etag header")
            .to_string();
        let etag = etag_line.trim_start_matches("ETag: ").trim();

        let request = format!(
            "GET /page.html HTTP/1.1\r\nHost: h\r\nIf-None-Match: {}\r\n\r\n",
            etag
        );
        let second = run(&state, request.as_bytes());

        assert!(second.starts_with("HTTP/1.1 304 Not Modified\r\n"), "{}", second);
        assert!(second.contains("ETag: "));
        assert!(second.contains("Last-Modified: "));
        assert!(!second.contains("cached"));
    }

    #[test]
    fn byte_ranges() {
        let content = "0123456789".repeat(10); // 100 bytes
        let root = site(&[("big.bin", &content)]);
        let state = file_state(&root);

        let out = run(
            &state,
            b"GET /big.bin HTTP/1.1\r\nHost: h\r\nRange: bytes=0-9\r\n\r\n",
        );
        assert!(out.starts_with("HTTP/1.1 206 Partial Content\r\n"), "{}", out);
        assert!(out.contains("Content-Range: bytes 0-9/100\r\n"));
        assert!(out.contains("Content-Length: 10\r\n"));
        assert!(out.ends_with("0123456789"), "{}", out);

        // unsatisfiable start
        let out = run(
            &state,
            b"GET /big.bin HTTP/1.1\r\nHost: h\r\nRange: bytes=500-600\r\n\r\n",
        );
        assert!(
            out.starts_with("HTTP/1.1 416 Requested Range Not Satisfiable\r\n"),
            "{}",
            out
        );
        assert!(out.contains("Content-Range: bytes */100\r\n"));
    }

    #[test]
    fn directory_index_file_is_served() {
        let root = site(&[("docs/index.html", "<h1>docs</h1>")]);
        let state = file_state(&root);

        let out = run(&state, b"GET /docs/ HTTP/1.1\r\nHost: h\r\n\r\n");
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{}", out);
        assert!(out.ends_with("<h1>docs</h1>"), "{}", out);
    }

    #[test]
    fn generated_index_gated_by_host_flag() {
        let root = site(&[("files/a.txt", "a"), ("files/b.txt", "bb")]);
        let state = file_state(&root);

        // disallowed by default
        let out = run(&state, b"GET /files/ HTTP/1.1\r\nHost: h\r\n\r\n");
        assert!(out.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{}", out);

        default_host(&state).set_allow_generated_index(true);
        let out = run(&state, b"GET /files/ HTTP/1.1\r\nHost: h\r\n\r\n");
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{}", out);
        assert!(out.contains("Index of /files/"));
        assert!(out.contains("a.txt"));
        assert!(out.contains("b.txt"));
    }

    #[test]
    fn directory_without_slash_redirects() {
        let root = site(&[("docs/index.html", "x")]);
        let state = file_state(&root);

        // directory-index rewrite applies to trailing-slash paths only, so
        // the bare directory path reaches the handler and redirects
        let out = run(&state, b"GET /docs HTTP/1.1\r\nHost: h\r\n\r\n");
        assert!(out.starts_with("HTTP/1.1 301 Moved Permanently\r\n"), "{}", out);
        assert!(out.contains("Location: http://h:80/docs/\r\n"), "{}", out);
    }

    #[test]
    fn head_of_file_has_no_body() {
        let root = site(&[("hello.txt", "hello world")]);
        let state = file_state(&root);

        let out = run(&state, b"HEAD /hello.txt HTTP/1.1\r\nHost: h\r\n\r\n");
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{}", out);
        assert!(out.contains("Content-Length: 11\r\n"));
        assert!(out.ends_with("\r\n\r\n"), "{}", out);
    }
}
