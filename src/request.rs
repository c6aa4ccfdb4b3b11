//! The request as handed over by the HTTP layer.
//!
//! A [`Request`] borrows everything the HTTP layer already parsed and only
//! owns the reader of its body. It lives for exactly one CGI invocation.

use std::net::SocketAddr;
use std::path::Path;

use http::header::{self, HeaderMap};
use http::{Method, Uri, Version};


/// Faults in the body framing headers of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// `Content-Length` is not a decimal number, or is repeated with
    /// differing values.
    #[error("invalid Content-Length header")]
    InvalidContentLength,

    /// `Transfer-Encoding` names a coding other than a final `chunked`.
    #[error("unsupported Transfer-Encoding")]
    UnsupportedTransferCoding,
}


/// The request line, headers, and routing results of a request.
#[derive(Debug, Clone, Copy)]
pub struct Parts<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub version: Version,
    pub headers: &'a HeaderMap,
    /// The URI path of the script itself, as split off by the router.
    pub script_name: &'a str,
    /// The remainder of the URI path after `script_name`, possibly empty.
    pub path_info: &'a str,
    /// The script on the filesystem.
    pub script: &'a Path,
    pub remote_addr: SocketAddr,
}

impl<'a> Parts<'a> {
    /// Borrows the request line and headers of an [`http::Request`]. Routing
    /// information and the peer address must be supplied separately.
    pub fn from_http<T>(
        req: &'a http::Request<T>,
        script: &'a Path,
        script_name: &'a str,
        path_info: &'a str,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            method: req.method(),
            uri: req.uri(),
            version: req.version(),
            headers: req.headers(),
            script_name,
            path_info,
            script,
            remote_addr,
        }
    }

    /// The query component of the request URI, or an empty string.
    #[inline]
    #[must_use]
    pub fn query(&self) -> &'a str {
        self.uri.query().unwrap_or("")
    }

    /// The request target as sent by the client, with path and query.
    #[must_use]
    pub fn request_uri(&self) -> &'a str {
        self.uri.path_and_query().map_or_else(|| self.uri.path(), |pq| pq.as_str())
    }

    /// Tests whether the response to this request can carry a body.
    #[inline]
    #[must_use]
    pub fn expects_body(&self) -> bool {
        *self.method != Method::HEAD
    }
}


/// The body of a request, together with the reader it arrives on.
#[derive(Debug)]
pub enum Body<R> {
    /// The request has no body.
    Empty,
    /// The body is exactly `length` bytes long.
    Fixed { length: u64, reader: R },
    /// The body uses the chunked transfer coding and is read off `R` as is,
    /// framing included.
    Chunked(R),
}

impl<R> Body<R> {
    /// Determines the body framing from the request headers (RFC 9112,
    /// Section 6.3).
    ///
    /// `Transfer-Encoding` takes precedence over `Content-Length`, and must
    /// name `chunked` alone since no other coding can be undone here. A
    /// `Content-Length` of zero yields [`Body::Empty`] and drops the reader.
    ///
    /// # Errors
    /// Returns an [`Error`] if the headers describe a framing that cannot be
    /// decoded. The caller should answer with `400 Bad Request` and close the
    /// connection.
    pub fn from_headers(headers: &HeaderMap, reader: R) -> Result<Self, Error> {
        let values = headers.get_all(header::TRANSFER_ENCODING);
        if values.iter().next().is_some() {
            let mut chunked = 0;
            for value in values {
                let value = value.to_str().map_err(|_| Error::UnsupportedTransferCoding)?;
                for coding in value.split(',').map(str::trim).filter(|c| !c.is_empty()) {
                    if !coding.eq_ignore_ascii_case("chunked") {
                        return Err(Error::UnsupportedTransferCoding);
                    }
                    chunked += 1;
                }
            }
            return match chunked {
                1 => Ok(Body::Chunked(reader)),
                _ => Err(Error::UnsupportedTransferCoding),
            };
        }

        let mut length = None;
        for value in headers.get_all(header::CONTENT_LENGTH) {
            let parsed = value.to_str().ok()
                .filter(|v| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or(Error::InvalidContentLength)?;
            if length.is_some_and(|l| l != parsed) {
                return Err(Error::InvalidContentLength);
            }
            length = Some(parsed);
        }
        Ok(match length {
            None | Some(0) => Body::Empty,
            Some(length) => Body::Fixed { length, reader },
        })
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    #[inline]
    #[must_use]
    pub fn is_chunked(&self) -> bool {
        matches!(self, Body::Chunked(_))
    }
}


/// A request for a single CGI invocation.
#[derive(Debug)]
pub struct Request<'a, R> {
    pub parts: Parts<'a>,
    pub body: Body<R>,
}

impl<'a, R> Request<'a, R> {
    #[inline]
    pub fn new(parts: Parts<'a>, body: Body<R>) -> Self {
        Self { parts, body }
    }

    #[inline]
    pub fn into_parts(self) -> (Parts<'a>, Body<R>) {
        (self.parts, self.body)
    }
}
