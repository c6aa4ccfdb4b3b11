use std::io::{self, IoSlice};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures_util::io::AsyncWrite;
use smallvec::SmallVec;

use crate::ext::BytesVec;
use crate::macros::{retry_interrupted, trace};


/// The zero-length last chunk followed by an empty trailer section.
pub const TERMINATOR: &[u8] = b"0\r\n\r\n";

/// Upper bound on the payload of a single chunk emitted by [`ChunkedWriter`].
pub const MAX_CHUNK_LEN: usize = 64 * 1024;

const CRLF: &[u8] = b"\r\n";
const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// The chunk-size line of a chunk with a payload of `len` bytes, i.e.
/// `hex(len)\r\n`.
#[must_use]
pub fn chunk_head(len: usize) -> SmallVec<[u8; 18]> {
    let digits = (usize::BITS - len.leading_zeros()).div_ceil(4).max(1);
    let mut head = SmallVec::new();
    for i in (0..digits).rev() {
        head.push(HEX_DIGITS[(len >> (i * 4)) & 0xf]);
    }
    head.extend_from_slice(CRLF);
    head
}

/// Appends `data` to `out` as a single chunk. Empty data is skipped, since a
/// zero-length chunk would terminate the body.
pub fn encode_chunk(data: &[u8], out: &mut impl BytesVec) {
    if data.is_empty() {
        return;
    }
    out.extend_from_slice(&chunk_head(data.len()));
    out.extend_from_slice(data);
    out.extend_from_slice(CRLF);
}


/// A chunk that is partially written to the inner writer.
#[derive(Debug)]
struct Pending {
    head: SmallVec<[u8; 18]>,
    head_idx: usize,
    payload_idx: usize,
    tail: &'static [u8],
    tail_idx: usize,
}

impl Pending {
    fn chunk(len: usize) -> Self {
        Self { head: chunk_head(len), head_idx: 0, payload_idx: 0, tail: CRLF, tail_idx: 0 }
    }

    fn terminator() -> Self {
        let head = SmallVec::from_slice(TERMINATOR);
        Self { head, head_idx: 0, payload_idx: 0, tail: &[], tail_idx: 0 }
    }
}


/// An `async` writer which frames everything written to it with the chunked
/// transfer coding.
///
/// Small writes are staged until at least `coalesce` bytes are available or
/// the writer is flushed, so a script writing a line at a time does not turn
/// into one chunk per line. A chunk never exceeds [`MAX_CHUNK_LEN`].
///
/// Closing the writer emits [`TERMINATOR`] and flushes the inner writer, but
/// does *not* close it: the connection outlives the message body.
#[derive(Debug)]
pub struct ChunkedWriter<W> {
    inner: W,
    staged: Vec<u8>,
    coalesce: usize,
    pending: Option<Pending>,
    finished: bool,
    payload: u64,
}

impl<W> ChunkedWriter<W> {
    /// Default amount of payload staged before a chunk is emitted.
    pub const DEFAULT_COALESCE: usize = 8 * 1024;

    /// Wraps `inner` with the default coalescing threshold.
    #[inline]
    pub fn new(inner: W) -> Self {
        Self::with_coalesce(inner, Self::DEFAULT_COALESCE)
    }

    /// Wraps `inner`, staging writes until `coalesce` bytes are buffered.
    /// The threshold is clamped to `1..=MAX_CHUNK_LEN`.
    pub fn with_coalesce(inner: W, coalesce: usize) -> Self {
        let coalesce = coalesce.clamp(1, MAX_CHUNK_LEN);
        Self {
            inner,
            staged: Vec::with_capacity(coalesce),
            coalesce,
            pending: None,
            finished: false,
            payload: 0,
        }
    }

    /// Returns the number of payload bytes written to the inner writer so
    /// far, excluding framing.
    #[inline]
    #[must_use]
    pub fn payload_len(&self) -> u64 {
        self.payload
    }

    /// Tests whether the terminating chunk has been queued.
    #[inline]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    #[inline]
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Unwraps the inner writer. Staged payload that was not flushed is lost.
    #[inline]
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> ChunkedWriter<W> {
    /// Writes out the pending chunk, framing the staged payload first if no
    /// chunk is in progress.
    fn poll_drain(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        if self.pending.is_none() && self.staged.is_empty() {
            return Poll::Ready(Ok(()));
        }
        let len = self.staged.len();
        let pending = self.pending.get_or_insert_with(|| Pending::chunk(len));

        loop {
            let iov = [
                IoSlice::new(&pending.head[pending.head_idx..]),
                IoSlice::new(&self.staged[pending.payload_idx..]),
                IoSlice::new(&pending.tail[pending.tail_idx..]),
            ];
            if iov.iter().all(|s| s.is_empty()) {
                break;
            }
            let mut written = retry_interrupted!(
                ready!(Pin::new(&mut self.inner).poll_write_vectored(cx, &iov))
            )?;
            if written == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }

            let mut take = |len: usize| {
                let n = written.min(len);
                written -= n;
                n
            };
            pending.head_idx += take(iov[0].len());
            pending.payload_idx += take(iov[1].len());
            pending.tail_idx += take(iov[2].len());
        }

        trace!(len = self.staged.len(), "chunk written");
        self.payload += self.staged.len() as u64;
        self.staged.clear();
        self.pending = None;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ChunkedWriter<W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(Err(io::Error::other("write after the terminating chunk")));
        } else if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if this.pending.is_some() || this.staged.len() >= this.coalesce {
            ready!(this.poll_drain(cx))?;
        }
        let room = MAX_CHUNK_LEN - this.staged.len();
        let n = buf.len().min(room);
        this.staged.extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.finished {
            ready!(this.poll_drain(cx))?;
            this.pending = Some(Pending::terminator());
            this.finished = true;
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }
}
