//! Pumps for the request body into the script, and for the script's stderr
//! into the log.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use super::process::{Phase, PhaseCell};
use super::{Error, Peer};
use crate::chunked::{self, Decoder, Frame};
use crate::config::Config;
use crate::ext::{ascii_escape, ByteSliceExt};
use crate::macros::{retry_interrupted, trace};


/// Longest stderr line logged as one event.
const MAX_LOG_LINE: usize = 4096;


/// A request body ready to be forwarded, after everything that has to
/// happen before spawning the script.
#[derive(Debug)]
pub(super) enum Input<R> {
    None,
    Fixed { reader: R, length: u64 },
    Chunked { reader: R, decoder: Decoder },
    Buffered(Vec<u8>),
}


/// Reads more input, retrying on [`io::ErrorKind::Interrupted`].
async fn fill_buf<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<&[u8]> {
    loop {
        match reader.fill_buf().await {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(e),
            Ok(_) => break,
        }
    }
    reader.fill_buf().await
}

/// Like `fill_buf`, but gives up after `idle` without any progress. Timeouts
/// are reported through `on_idle`, since their meaning depends on where in
/// the body they happen.
async fn fill_buf_idle<R, F>(reader: &mut R, idle: Duration, on_idle: F) -> Result<&[u8], Error>
where
    R: AsyncBufRead + Unpin,
    F: FnOnce() -> Error,
{
    match tokio::time::timeout(idle, fill_buf(reader)).await {
        Ok(Ok(buf)) => Ok(buf),
        Ok(Err(e)) => Err(Error::BrokenPipe { peer: Peer::Client, source: e }),
        Err(_) => Err(on_idle()),
    }
}

/// Writes all of `buf`, retrying on [`io::ErrorKind::Interrupted`].
pub(super) async fn write_all<W: AsyncWrite + Unpin>(w: &mut W, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = retry_interrupted!(w.write(buf).await)?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        buf = &buf[n..];
    }
    Ok(())
}

fn check_limit(config: &Config, total: u64) -> Result<(), Error> {
    match config.max_body_size {
        Some(limit) if total > limit => Err(Error::PayloadTooLarge { limit }),
        _ => Ok(()),
    }
}

fn chunk_idle(decoder: &Decoder, idle: Duration) -> Error {
    if decoder.in_data() {
        chunked::Error::ChunkSizeMismatch.into()
    } else {
        Error::RequestTimeout(idle)
    }
}


/// Parses the first chunk-size line of a chunked body, so that a malformed
/// body is rejected before any process is spawned.
pub(super) async fn prime<R>(reader: &mut R, decoder: &mut Decoder, config: &Config) -> Result<(), Error>
where
    R: AsyncBufRead + Unpin,
{
    let idle = config.body_idle_timeout;
    loop {
        let buf = fill_buf_idle(reader, idle, || Error::RequestTimeout(idle)).await?;
        if buf.is_empty() {
            return Err(chunked::Error::TruncatedStream.into());
        }
        let (used, frame) = decoder.parse(buf)?;
        reader.consume_unpin(used);
        if frame != Frame::NeedInput {
            return Ok(());
        }
    }
}

/// Decodes a whole chunked body into memory.
pub(super) async fn collect_chunked<R>(reader: &mut R, config: &Config) -> Result<Vec<u8>, Error>
where
    R: AsyncBufRead + Unpin,
{
    let idle = config.body_idle_timeout;
    let mut decoder = Decoder::new();
    let mut body = Vec::new();
    while !decoder.is_done() {
        let buf = fill_buf_idle(reader, idle, || chunk_idle(&decoder, idle)).await?;
        if buf.is_empty() {
            decoder.finish()?;
            break;
        }
        let used = decoder.decode_into(buf, &mut body)?;
        reader.consume_unpin(used);
        check_limit(config, body.len() as u64)?;
    }
    debug!(len = body.len(), "chunked request body buffered");
    Ok(body)
}


/// Forwards the request body into the script's stdin, then closes it.
///
/// Returns whether the whole body was read from the client. A script that
/// closes its stdin early stops the forwarding without an error, but leaves
/// the rest of the body unread. `forwarded` counts the bytes the script
/// received and stays valid if this future is dropped.
pub(super) async fn forward<R, W>(
    input: Input<R>,
    mut stdin: W,
    config: &Config,
    phase: &PhaseCell,
    forwarded: &AtomicU64,
) -> Result<bool, Error>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let idle = config.body_idle_timeout;
    let push = |data: &[u8]| {
        forwarded.fetch_add(data.len() as u64, Ordering::Relaxed);
        trace!(len = data.len(), "forwarded request body data");
    };

    let complete = match input {
        Input::None => true,

        Input::Buffered(body) => match write_all(&mut stdin, &body).await {
            Ok(()) => {
                push(&body);
                true
            },
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => false,
            Err(e) => return Err(e.into()),
        },

        Input::Fixed { mut reader, length } => 'fixed: {
            let mut rem = length;
            while rem > 0 {
                let buf = fill_buf_idle(&mut reader, idle, || Error::RequestTimeout(idle)).await?;
                if buf.is_empty() {
                    let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
                    return Err(Error::BrokenPipe { peer: Peer::Client, source: eof });
                }
                let n = usize::try_from(rem).map_or(buf.len(), |r| r.min(buf.len()));
                match write_all(&mut stdin, &buf[..n]).await {
                    Ok(()) => push(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => break 'fixed false,
                    Err(e) => return Err(e.into()),
                }
                reader.consume_unpin(n);
                rem -= n as u64;
            }
            true
        },

        Input::Chunked { mut reader, mut decoder } => 'chunked: {
            loop {
                // Priming may already have consumed an empty body
                if decoder.is_done() {
                    break 'chunked true;
                }
                let buf = fill_buf_idle(&mut reader, idle, || chunk_idle(&decoder, idle)).await?;
                if buf.is_empty() {
                    decoder.finish()?;
                }
                let (used, frame) = decoder.parse(buf)?;
                let data = match frame {
                    Frame::Done => {
                        reader.consume_unpin(used);
                        break 'chunked true;
                    },
                    Frame::NeedInput => &[][..],
                    Frame::Data(rem) => {
                        let avail = &buf[used..];
                        &avail[..usize::try_from(rem).map_or(avail.len(), |r| r.min(avail.len()))]
                    },
                };
                if !data.is_empty() {
                    check_limit(config, decoder.decoded() + data.len() as u64)?;
                    match write_all(&mut stdin, data).await {
                        Ok(()) => push(data),
                        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => break 'chunked false,
                        Err(e) => return Err(e.into()),
                    }
                }
                let n = data.len();
                decoder.advance(n);
                reader.consume_unpin(used + n);
            }
        },
    };

    if !complete {
        debug!("CGI script closed its input early");
    }
    // Dropping stdin delivers end-of-file to the script
    drop(stdin);
    phase.advance(Phase::AwaitingHeaders);
    Ok(complete)
}


/// Logs everything the script writes to stderr, line by line.
pub(super) async fn drain_stderr<R: AsyncRead + Unpin>(stderr: R, pid: Option<u32>) {
    split_lines(stderr, |line| {
        warn!(pid, stderr = %ascii_escape(line), "CGI script error output");
    }).await;
}

/// Feeds `emit` each line of `reader` without its line ending. Lines longer
/// than [`MAX_LOG_LINE`] are cut into pieces of that size.
async fn split_lines<R, F>(reader: R, mut emit: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]),
{
    let mut reader = BufReader::with_capacity(MAX_LOG_LINE, reader);
    let mut line = Vec::new();
    let mut flush = |line: &mut Vec<u8>| {
        let bytes: &[u8] = line;
        emit(bytes.strip_suffix(b"\n").unwrap_or(bytes).strip_cr());
        line.clear();
    };

    loop {
        let buf = match fill_buf(&mut reader).await {
            Ok(buf) => buf,
            Err(e) => {
                debug!(error = %e, "reading CGI stderr failed");
                break;
            },
        };
        if buf.is_empty() {
            break;
        }

        let room = &buf[..buf.len().min(MAX_LOG_LINE - line.len())];
        let (take, complete) = match room.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (room.len(), false),
        };
        line.extend_from_slice(&buf[..take]);
        reader.consume_unpin(take);
        if complete || line.len() >= MAX_LOG_LINE {
            flush(&mut line);
        }
    }
    if !line.is_empty() {
        flush(&mut line);
    }
}
