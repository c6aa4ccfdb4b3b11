//! Turns the output of a script into an HTTP/1.x response.

use std::future::Future;
use std::io;
use std::ops::Range;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{ready, Context, Poll};

use futures_util::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use http::header::{self, HeaderName};
use http::{StatusCode, Version};
use tracing::debug;

use super::body::write_all;
use super::process::{Phase, PhaseCell};
use super::{Error, Peer};
use crate::cgi::response::{self, Head};
use crate::chunked::ChunkedWriter;
use crate::config::Config;
use crate::macros::retry_interrupted;
use crate::request::Parts;


/// How the response body is delimited towards the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
pub enum Framing {
    /// `Content-Length` from the script; exactly this many bytes are sent.
    Length(u64),
    /// `Transfer-Encoding: chunked`, for HTTP/1.1 clients.
    Chunked,
    /// Delimited by closing the connection, for HTTP/1.0 clients.
    Close,
    /// No body at all, for `HEAD` requests and bodyless status codes.
    Empty,
}

impl Framing {
    /// Picks the framing for a script response to the given request.
    #[must_use]
    pub fn select(head: &Head, parts: &Parts<'_>) -> Self {
        let status = head.status;
        if !parts.expects_body()
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return Framing::Empty;
        }
        match head.content_length {
            Some(len) => Framing::Length(len),
            None if parts.version == Version::HTTP_11 => Framing::Chunked,
            None => Framing::Close,
        }
    }

    /// Tests whether the connection can carry another request after a
    /// response with this framing.
    #[inline]
    #[must_use]
    pub fn keeps_alive(self) -> bool {
        !matches!(self, Framing::Close)
    }
}


/// Hop-by-hop fields describe the script's connection, not the client's.
/// The gateway decides on framing itself.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == header::CONNECTION
        || name == header::TRANSFER_ENCODING
        || name == "keep-alive"
}

#[inline]
fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 { "HTTP/1.0" } else { "HTTP/1.1" }
}

/// Serializes the status line and header section sent to the client.
///
/// Fields are written in the order and spelling the script used, except for
/// `Status` and hop-by-hop fields. The framing field is appended last.
#[must_use]
pub fn write_head(head: &Head, framing: Framing, version: Version) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(version_str(version).as_bytes());
    out.push(b' ');
    out.extend_from_slice(head.status.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(head.reason().as_bytes());
    out.extend_from_slice(b"\r\n");

    let bodyless_status = head.status.is_informational() || head.status == StatusCode::NO_CONTENT;
    for field in &head.fields {
        if is_hop_by_hop(&field.name) || (bodyless_status && field.name == header::CONTENT_LENGTH) {
            continue;
        }
        out.extend_from_slice(field.raw_name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(field.value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    match framing {
        Framing::Chunked => out.extend_from_slice(b"Transfer-Encoding: chunked\r\n"),
        Framing::Close => out.extend_from_slice(b"Connection: close\r\n"),
        Framing::Length(_) | Framing::Empty => {},
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// A complete response for failures before any part of the script's
/// response was sent.
#[must_use]
pub fn error_response(status: StatusCode, version: Version) -> Vec<u8> {
    format!(
        "{} {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        version_str(version),
        status.as_str(),
        status.canonical_reason().unwrap_or("Error"),
    ).into_bytes()
}


/// Copies from `reader` to `writer` through `buf`, flushing `writer`
/// whenever `reader` has nothing to offer.
///
/// `limit` bounds the bytes read; the reader is never polled once it is
/// reached. The bytes in `buf[pos..cap]` are sent first.
struct Pump<'a, R, W> {
    reader: &'a mut R,
    writer: &'a mut W,
    buf: &'a mut [u8],
    pos: usize,
    cap: usize,
    limit: Option<u64>,
    written: u64,
    need_flush: bool,
}

impl<'a, R, W> Pump<'a, R, W> {
    fn new(reader: &'a mut R, writer: &'a mut W, buf: &'a mut [u8], pending: Range<usize>, limit: Option<u64>) -> Self {
        Self {
            reader, writer, buf,
            pos: pending.start, cap: pending.end,
            limit, written: 0, need_flush: false,
        }
    }
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> Future for Pump<'_, R, W> {
    type Output = Result<u64, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();
        let client_err = |source: io::Error| Error::BrokenPipe { peer: Peer::Client, source };

        loop {
            while this.pos < this.cap {
                let res = retry_interrupted!(
                    ready!(Pin::new(&mut *this.writer).poll_write(cx, &this.buf[this.pos..this.cap]))
                );
                let n = res.map_err(client_err)?;
                if n == 0 {
                    return Poll::Ready(Err(client_err(io::ErrorKind::WriteZero.into())));
                }
                this.pos += n;
                this.written += n as u64;
                this.need_flush = true;
            }

            if this.limit == Some(0) {
                break;
            }
            let max = this.limit.map_or(this.buf.len(), |l| {
                usize::try_from(l).map_or(this.buf.len(), |l| l.min(this.buf.len()))
            });
            let res = match Pin::new(&mut *this.reader).poll_read(cx, &mut this.buf[..max]) {
                Poll::Pending => {
                    if this.need_flush {
                        ready!(Pin::new(&mut *this.writer).poll_flush(cx)).map_err(client_err)?;
                        this.need_flush = false;
                    }
                    return Poll::Pending;
                },
                Poll::Ready(res) => res,
            };
            match res {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Poll::Ready(Err(e.into())),
                Ok(0) => {
                    if this.limit.is_some_and(|l| l > 0) {
                        let eof = io::ErrorKind::UnexpectedEof.into();
                        return Poll::Ready(Err(Error::BrokenPipe { peer: Peer::Script, source: eof }));
                    }
                    break;
                },
                Ok(n) => {
                    this.pos = 0;
                    this.cap = n;
                    if let Some(l) = &mut this.limit {
                        *l -= n as u64;
                    }
                },
            }
        }

        ready!(Pin::new(&mut *this.writer).poll_flush(cx)).map_err(client_err)?;
        Poll::Ready(Ok(this.written))
    }
}


/// The result of relaying a script's response.
#[derive(Debug, Clone, Copy)]
pub(super) struct Relayed {
    pub(super) status: StatusCode,
    pub(super) framing: Framing,
    pub(super) body_bytes: u64,
}

/// Reads the script's header block, sends the response head to the client,
/// and streams the body in the selected [`Framing`].
///
/// `committed` is set right before the first byte is sent to the client.
pub(super) async fn relay<S, W>(
    stdout: &mut S,
    client: &mut W,
    parts: &Parts<'_>,
    config: &Config,
    phase: &PhaseCell,
    committed: &AtomicBool,
) -> Result<Relayed, Error>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0; config.buffer_size.max(1)];
    let mut parser = response::Parser::new(config.max_header_size);
    let (head_len, filled) = loop {
        let n = retry_interrupted!(stdout.read(&mut buf).await)?;
        if n == 0 {
            return Err(response::Error::Incomplete.into());
        }
        if let Some(used) = parser.feed(&buf[..n])? {
            break (used, n);
        }
    };
    let head = parser.into_head()?;
    phase.advance(Phase::StreamingBody);

    let framing = Framing::select(&head, parts);
    debug!(status = head.status.as_u16(), framing = <&str>::from(framing), "CGI response head parsed");

    committed.store(true, Ordering::Release);
    let head_bytes = write_head(&head, framing, parts.version);
    let client_err = |source: io::Error| Error::BrokenPipe { peer: Peer::Client, source };
    write_all(client, &head_bytes).await.map_err(client_err)?;

    // Body bytes that arrived together with the header block
    let avail = filled - head_len;
    let (cap, limit) = match framing {
        Framing::Length(len) => {
            let take = usize::try_from(len).map_or(avail, |l| l.min(avail));
            (head_len + take, Some(len - take as u64))
        },
        _ => (filled, None),
    };

    let body_bytes = match framing {
        Framing::Empty => {
            client.flush().await.map_err(client_err)?;
            0
        },
        Framing::Length(_) | Framing::Close => {
            Pump::new(stdout, client, &mut buf, head_len..cap, limit).await?
        },
        Framing::Chunked => {
            let mut writer = ChunkedWriter::with_coalesce(&mut *client, config.coalesce_size);
            let n = Pump::new(stdout, &mut writer, &mut buf, head_len..cap, None).await?;
            writer.close().await.map_err(client_err)?;
            n
        },
    };
    Ok(Relayed { status: head.status, framing, body_bytes })
}
