use super::{Error, MAX_EXTENSION_LEN, MAX_TRAILER_LEN};
use crate::ext::{hex_value, BytesVec};
use crate::macros::trace;


/// What the [`Decoder`] expects next after `Decoder::parse` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// The next bytes of input, up to the contained count, are payload. They
    /// must be taken by the caller and reported via `Decoder::advance`.
    Data(u64),
    /// All input was framing and has been consumed. More input is needed.
    NeedInput,
    /// The terminating chunk and the trailer section have been consumed.
    /// Anything after it belongs to the next message on the connection.
    Done,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Reading hex digits. `seen` is false until the first digit arrives.
    Size { size: u64, seen: bool },
    /// Whitespace after the size, before an extension or the line end.
    SizeWs { size: u64, len: usize },
    /// Skipping `;name=value` extensions after the size.
    Extension { size: u64, len: usize },
    SizeLf { size: u64 },
    Data { rem: u64 },
    DataCr,
    DataLf,
    /// Inside the trailer section; `line` counts bytes of the current line.
    Trailer { line: usize, total: usize },
    TrailerLf { empty: bool, total: usize },
    Done,
}

impl State {
    const START: Self = State::Size { size: 0, seen: false };

    #[inline]
    fn after_size(size: u64) -> Self {
        if size == 0 {
            State::Trailer { line: 0, total: 0 }
        } else {
            State::Data { rem: size }
        }
    }

    /// Advances the framing by a single byte.
    fn step(self, b: u8) -> Result<Self, Error> {
        use State::*;
        Ok(match self {
            Size { size, seen } => match (hex_value(b), b) {
                (Some(_), _) if size > (u64::MAX >> 4) => return Err(Error::MalformedChunkSize),
                (Some(v), _) => Size { size: (size << 4) | u64::from(v), seen: true },
                (None, _) if !seen => return Err(Error::MalformedChunkSize),
                (None, b';') => Extension { size, len: 1 },
                (None, b' ' | b'\t') => SizeWs { size, len: 1 },
                (None, b'\r') => SizeLf { size },
                (None, b'\n') => Self::after_size(size),
                (None, _) => return Err(Error::MalformedChunkSize),
            },

            SizeWs { size, len } => match b {
                b'\r' => SizeLf { size },
                b'\n' => Self::after_size(size),
                _ if len >= MAX_EXTENSION_LEN => return Err(Error::MalformedChunkSize),
                b' ' | b'\t' => SizeWs { size, len: len + 1 },
                b';' => Extension { size, len: len + 1 },
                _ => return Err(Error::MalformedChunkSize),
            },

            Extension { size, len } => match b {
                b'\r' => SizeLf { size },
                b'\n' => Self::after_size(size),
                _ if len >= MAX_EXTENSION_LEN => return Err(Error::MalformedChunkSize),
                0x00..=0x08 | 0x0a..=0x1f | 0x7f => return Err(Error::MalformedChunkSize),
                _ => Extension { size, len: len + 1 },
            },

            SizeLf { size } if b == b'\n' => Self::after_size(size),
            SizeLf { .. } => return Err(Error::MalformedChunkSize),

            DataCr => match b {
                b'\r' => DataLf,
                b'\n' => Self::START,
                _ => return Err(Error::ChunkSizeMismatch),
            },
            DataLf if b == b'\n' => Self::START,
            DataLf => return Err(Error::ChunkSizeMismatch),

            Trailer { total, .. } if total >= MAX_TRAILER_LEN => {
                return Err(Error::InvalidTrailer);
            },
            Trailer { line, total } => match b {
                b'\r' => TrailerLf { empty: line == 0, total: total + 1 },
                b'\n' if line == 0 => Done,
                b'\n' => Trailer { line: 0, total: total + 1 },
                _ => Trailer { line: line + 1, total: total + 1 },
            },
            TrailerLf { empty: true, .. } if b == b'\n' => Done,
            TrailerLf { empty: false, total } if b == b'\n' => Trailer { line: 0, total: total + 1 },
            TrailerLf { .. } => return Err(Error::InvalidTrailer),

            // Payload bytes and trailing input are never fed through here
            Data { .. } | Done => self,
        })
    }
}


/// A decoder for a single chunked message body.
///
/// The decoder only ever looks at framing bytes. Payload is left in the
/// caller's buffer and its location reported through [`Frame::Data`], so a
/// body can be forwarded chunk by chunk as it arrives without the decoder
/// copying or buffering it. A typical driver looks like this:
///
/// ```
/// use cgi_gateway::chunked::{Decoder, Frame};
///
/// let wire = b"5\r\nHello\r\n0\r\n\r\n";
/// let mut decoder = Decoder::new();
/// let mut input = &wire[..];
/// let mut body = Vec::new();
/// loop {
///     let (consumed, frame) = decoder.parse(input).unwrap();
///     input = &input[consumed..];
///     match frame {
///         Frame::Data(rem) => {
///             let n = input.len().min(rem as usize);
///             body.extend_from_slice(&input[..n]);
///             decoder.advance(n);
///             input = &input[n..];
///         },
///         Frame::NeedInput => unreachable!("the example input is complete"),
///         Frame::Done => break,
///     }
/// }
/// assert_eq!(body, b"Hello");
/// ```
#[derive(Debug, Clone)]
#[must_use = "Decoder must be fed input to decode anything"]
pub struct Decoder {
    state: State,
    decoded: u64,
}

impl Default for Decoder {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    /// Creates a [`Decoder`] positioned before the first chunk-size line.
    #[inline]
    pub fn new() -> Self {
        Self { state: State::START, decoded: 0 }
    }

    /// Resets the decoder so that it can decode another message body.
    #[inline]
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Consumes framing bytes from `input` until payload, the end of the
    /// input, or the end of the body is reached.
    ///
    /// Returns the number of bytes consumed from the start of `input` along
    /// with the [`Frame`] that follows them. For [`Frame::Data`], the payload
    /// starts right after the consumed bytes.
    ///
    /// # Errors
    /// Returns an [`Error`] as soon as a framing byte violates the chunked
    /// coding. The decoder must not be used afterwards.
    pub fn parse(&mut self, input: &[u8]) -> Result<(usize, Frame), Error> {
        let mut pos = 0;
        loop {
            match self.state {
                State::Data { rem } => return Ok((pos, Frame::Data(rem))),
                State::Done => return Ok((pos, Frame::Done)),
                _ => {},
            }
            let Some(&b) = input.get(pos) else {
                return Ok((pos, Frame::NeedInput));
            };
            pos += 1;

            let next = self.state.step(b)?;
            if matches!(next, State::Data { .. }) {
                trace!(state = ?next, "chunk header parsed");
            }
            self.state = next;
        }
    }

    /// Marks `n` payload bytes of the current chunk as taken by the caller.
    ///
    /// # Panics
    /// Panics if the decoder is not positioned at payload or if `n` exceeds
    /// the remaining size of the current chunk.
    pub fn advance(&mut self, n: usize) {
        let State::Data { rem } = self.state else {
            assert_eq!(n, 0, "advance called outside of chunk data");
            return;
        };
        let n = n as u64;
        assert!(n <= rem, "advance past the end of the current chunk");
        self.decoded += n;
        self.state = if n == rem { State::DataCr } else { State::Data { rem: rem - n } };
    }

    /// Decodes as much of `input` as possible, appending payload to `out`.
    ///
    /// Returns the number of bytes consumed from `input`. Unconsumed bytes
    /// only remain once the body is complete; they belong to whatever
    /// follows the body on the connection.
    ///
    /// # Errors
    /// Forwards framing errors from `Decoder::parse`.
    pub fn decode_into(&mut self, input: &[u8], out: &mut impl BytesVec) -> Result<usize, Error> {
        let mut pos = 0;
        loop {
            let (consumed, frame) = self.parse(&input[pos..])?;
            pos += consumed;
            match frame {
                Frame::Data(rem) => {
                    let avail = &input[pos..];
                    if avail.is_empty() {
                        return Ok(pos);
                    }
                    let n = usize::try_from(rem).map_or(avail.len(), |r| r.min(avail.len()));
                    out.extend_from_slice(&avail[..n]);
                    self.advance(n);
                    pos += n;
                },
                Frame::NeedInput | Frame::Done => return Ok(pos),
            }
        }
    }

    /// Checks that the body is complete once the input stream has ended.
    ///
    /// # Errors
    /// Returns [`Error::TruncatedStream`] unless the terminating chunk and the
    /// trailer section were fully decoded.
    #[inline]
    pub fn finish(&self) -> Result<(), Error> {
        if self.is_done() { Ok(()) } else { Err(Error::TruncatedStream) }
    }

    /// Tests whether the whole body, including the trailer section, has been
    /// decoded.
    #[inline]
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Tests whether the decoder is in the middle of a chunk's payload.
    #[inline]
    #[must_use]
    pub fn in_data(&self) -> bool {
        matches!(self.state, State::Data { .. })
    }

    /// Returns the number of payload bytes decoded so far.
    #[inline]
    #[must_use]
    pub fn decoded(&self) -> u64 {
        self.decoded
    }
}
