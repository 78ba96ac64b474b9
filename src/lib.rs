//! ember_web - embeddable lightweight HTTP/1.1 server library
//!
//! A small, dependency-light HTTP server meant to be embedded into an
//! application: bind a port, register handlers on paths, start serving.
//! Correctness of the protocol machinery is the point; there is no
//! framework on top of it.
//!
//! # Protocol support
//!
//! - **HTTP/1.1** with persistent connections, `100 Continue`, chunked
//!   transfer encoding in both directions (including trailers), and
//!   `gzip`/`deflate` response compression
//! - **Conditional requests** - `ETag` and the `If-*` header family
//! - **Partial content** - byte-range retrieval and `If-Range`
//! - **Multipart** - streaming `multipart/form-data` decoding for uploads
//! - **Virtual hosts** - multiple domains with aliases per server
//! - **HTTP/1.0** for legacy clients
//!
//! # Quick start
//!
//! ```no_run
//! use ember_web::{Request, Response, Server};
//! use std::io;
//!
//! fn hello(_req: &mut Request<'_>, resp: &mut Response<'_>) -> io::Result<u16> {
//!     resp.send(200, "Hello World!")?;
//!     Ok(0)
//! }
//!
//! let server = Server::builder()
//!     .port(8080)
//!     .context("/hello", &["GET"], hello)
//!     .build();
//! server.start().unwrap();
//! ```
//!
//! A handler returns `0` once it has written a response itself, or a
//! status code to have a default response sent for it. Handlers receive
//! the request (with a streaming body) and a response writer; see
//! [`Handler`] for the full contract and [`FileHandler`] for a complete
//! conforming implementation.
//!
//! # Threading model
//!
//! A dedicated acceptor thread hands each accepted connection to an
//! [`Executor`] (by default a grow-on-demand cached thread pool). Each
//! connection processes its requests strictly in sequence; configuration
//! (contexts, hosts, aliases) must be complete before [`Server::start`].

pub(crate) mod http {
    pub(crate) mod body;
    pub(crate) mod cond;
    pub(crate) mod date;
    pub(crate) mod headers;
    pub(crate) mod multipart;
    pub(crate) mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod server;
}
pub(crate) mod errors;
pub(crate) mod handlers;
pub mod limits;

pub use crate::{
    handlers::{FileHandler, MediaTypes},
    http::{
        body::{transfer, ChunkedReader, ChunkedWriter, LimitedReader},
        date::{format_date, parse_date},
        headers::{Header, Headers},
        multipart::{Multipart, MultipartReader, Part},
        query::{parse_params, url_decode},
        request::{BaseUrl, Body, Request},
        response::Response,
        types::{escape_html, format_size, reason_phrase, Version},
    },
    limits::Limits,
    server::server::{
        ContextInfo, Executor, Handler, Server, ServerBuilder, StreamFactory, VirtualHost,
    },
};
