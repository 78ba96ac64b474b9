//! The per-connection driver: reads requests off the stream one at a
//! time, dispatches them, and decides whether the connection persists.
//! This is the only place read failures become client-visible errors.

use crate::errors::ErrorKind;
use crate::http::body::transfer;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::types::{split_elements, Version};
use crate::server::server::ServerState;
use log::{debug, error};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::sync::Arc;

const STREAM_BUF_SIZE: usize = 4096;

/// Handles all transactions on one accepted connection until it closes.
pub(crate) fn serve_connection(
    state: &Arc<ServerState>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
) {
    let mut reader = BufReader::with_capacity(STREAM_BUF_SIZE, reader);
    let mut writer = BufWriter::with_capacity(STREAM_BUF_SIZE, writer);

    loop {
        let keep_alive = handle_one(state, &mut reader, &mut writer);
        let _ = writer.flush();
        if !keep_alive {
            break;
        }
    }
}

/// Runs a single transaction. Returns whether the connection persists.
fn handle_one(
    state: &Arc<ServerState>,
    reader: &mut dyn BufRead,
    writer: &mut dyn Write,
) -> bool {
    let mut resp = Response::new(writer);

    let mut req = match Request::parse(reader, state) {
        Ok(req) => req,
        Err(err) => {
            match err {
                // not mid-transaction: the client went away or idled out
                ErrorKind::MissingRequestLine => {}
                ref err if err.is_timeout() => {
                    let _ = resp.send_error_msg(408, "Timeout waiting for client request");
                }
                err => {
                    let _ = resp.send_error_msg(400, &format!("Invalid request: {}", err));
                }
            }
            let _ = resp.close();
            return false;
        }
    };

    let completed = handle_transaction(&mut req, &mut resp);
    if let Err(err) = completed {
        if resp.headers_sent() {
            // mid-body: nothing recoverable to tell the client
            debug!("aborting connection: {}", err);
        } else {
            error!("error processing request: {}", err);
            resp.reset();
            let _ = resp.send_error_msg(500, &format!("Error processing request: {}", err));
        }
        let _ = resp.close();
        return false;
    }
    if resp.close().is_err() {
        return false;
    }

    // consume leftover body data so the next request starts clean
    if transfer(req.body_mut(), None, -1).is_err() {
        return false;
    }
    req.merge_trailers();

    // RFC7230#6.6: persist unless either side said close (or legacy client)
    let said_close = |headers: &crate::http::headers::Headers| {
        headers
            .get("Connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
    };
    !said_close(req.headers()) && !said_close(resp.headers()) && req.version() == Version::Http11
}

/// Handles a single transaction: capability negotiation, preprocessing,
/// then method dispatch.
fn handle_transaction(req: &mut Request<'_>, resp: &mut Response<'_>) -> io::Result<()> {
    resp.set_client_capabilities(req);
    if preprocess(req, resp)? {
        handle_method(req, resp)?;
    }
    Ok(())
}

/// Validates the request and performs the special header handling that
/// must happen before dispatch. Returns whether to continue processing.
fn preprocess(req: &mut Request<'_>, resp: &mut Response<'_>) -> io::Result<bool> {
    match req.version() {
        Version::Http11 => {
            // RFC2616#14.23: missing Host header gets 400
            if !req.headers().contains("Host") {
                resp.send_error_msg(400, "Missing required Host header")?;
                return Ok(false);
            }

            if let Some(expect) = req.headers().get("Expect") {
                if expect.eq_ignore_ascii_case("100-continue") {
                    // return an interim response before reading the body
                    resp.send_continue()?;
                } else {
                    // RFC2616#14.20: unknown expectations get 417
                    resp.send_error(417)?;
                    return Ok(false);
                }
            }
        }
        Version::Http10 | Version::Http09 => {
            // RFC2616#14.10: remove connection-token headers of older versions
            let tokens = split_elements(req.headers().get("Connection"), false);
            for token in tokens {
                req.headers_mut().remove(&token);
            }
        }
    }

    Ok(true)
}

/// Dispatches a transaction according to its method: context handlers
/// first, then the built-in HEAD/TRACE/OPTIONS behaviors, then 405/501.
fn handle_method(req: &mut Request<'_>, resp: &mut Response<'_>) -> io::Result<()> {
    let method = req.method().to_string();
    let context = req.context();

    // RFC2616#5.1.1: GET and HEAD must be supported
    if method == "GET" || context.handler(&method).is_some() {
        serve_context(req, resp)
    } else if method == "HEAD" {
        // identical to GET, with the body discarded
        req.set_method("GET");
        resp.set_discard_body(true);
        serve_context(req, resp)
    } else if method == "TRACE" {
        handle_trace(req, resp)
    } else {
        let mut methods: Vec<String> = ["GET", "HEAD", "TRACE", "OPTIONS"]
            .iter()
            .map(|m| m.to_string())
            .collect();

        // "*" is the special server-wide target supported by OPTIONS
        let host = req.virtual_host();
        let server_wide = req.path() == "*" && method == "OPTIONS";
        let supported = if server_wide {
            host.methods()
        } else {
            context.methods()
        };
        for m in supported {
            if !methods.contains(&m) {
                methods.push(m);
            }
        }
        resp.headers_mut().add("Allow", &methods.join(", "));

        if method == "OPTIONS" {
            // RFC2616#9.2
            resp.headers_mut().add("Content-Length", "0");
            resp.send_headers(200)
        } else if host.methods().contains(&method) {
            // supported by the host, but not by this context nor built-in
            resp.send_headers(405)
        } else {
            resp.send_error(501)
        }
    }
}

/// Invokes the context handler for the request, applying the host's
/// directory-index rewrite to directory paths first.
fn serve_context(req: &mut Request<'_>, resp: &mut Response<'_>) -> io::Result<()> {
    let context = req.context();
    let handler = match context.handler(req.method()) {
        Some(handler) => handler,
        None => return resp.send_error(404),
    };

    let mut status = 404;
    let path = req.path().to_string();
    if path.ends_with('/') {
        if let Some(index) = req.virtual_host().directory_index() {
            req.set_path(&format!("{}{}", path, index));
            status = handler.serve(req, resp)?;
            req.set_path(&path);
        }
    }

    if status == 404 {
        status = handler.serve(req, resp)?;
    }

    if status > 0 {
        resp.send_error(status)?;
    }
    Ok(())
}

/// The default TRACE handler: echoes the request head and body back as
/// `message/http` (RFC2616#9.8).
fn handle_trace(req: &mut Request<'_>, resp: &mut Response<'_>) -> io::Result<()> {
    resp.send_headers_with(200, None, None, None, Some("message/http"), None)?;

    let mut echo = Vec::new();
    write!(echo, "TRACE {} {}\r\n", req.target(), req.version().as_str())?;
    req.headers().write_to(&mut echo)?;

    let out = resp.body()?;
    out.write_all(&echo)?;
    transfer(req.body_mut(), Some(out), -1)
}
