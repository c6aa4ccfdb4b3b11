// TODO(docs): #![deny(missing_docs)]
#![deny(unsafe_code, single_use_lifetimes, unused_lifetimes)]
#![warn(keyword_idents, let_underscore_drop, unreachable_pub, unused_import_braces)]

#![deny(clippy::suspicious, clippy::cargo)]
#![deny(clippy::exit, clippy::semicolon_inside_block, clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::multiple_crate_versions)]
#![allow(clippy::enum_glob_use, clippy::items_after_statements)]

//! A CGI/1.1 gateway for HTTP/1.x servers.
//!
//! The crate takes an already parsed request head and the connection's
//! reader and writer, runs the request's CGI script and relays its response.
//! Request bodies in `chunked` transfer coding are decoded on the fly and the
//! response is framed by `Content-Length`, `chunked` or connection close,
//! whichever the script output and the client's protocol version allow.
//!
//! See [`Gateway::serve`] for the entry point.

mod macros;

/// Helpful extension traits shared across the crate.
pub(crate) mod ext;

/// `chunked` transfer coding (RFC 9112, Section 7.1).
pub mod chunked;

/// Helpers for CGI/1.1 requests and responses (RFC 3875).
pub mod cgi;

pub mod config;
pub mod request;
pub mod gateway;

pub use config::{ChunkedBody, Config};
pub use gateway::{Completion, Failure, Gateway};
pub use request::{Body, Parts, Request};
