//! HTTP/1.1 chunked transfer coding (RFC 9112, Section 7.1).
//!
//! [`Decoder`] is a sans-I/O state machine for request bodies: the caller
//! feeds it whatever bytes the connection produced and gets told where the
//! framing ends and the payload begins. It never asks for more input than the
//! current chunk needs. [`ChunkedWriter`] goes the other way and frames an
//! outgoing stream of unknown length.

mod decode;
mod encode;

pub use decode::{Decoder, Frame};
pub use encode::{chunk_head, encode_chunk, ChunkedWriter, MAX_CHUNK_LEN, TERMINATOR};


/// The longest chunk extension (everything between the size and the line
/// end) accepted before the size line is considered malformed.
pub const MAX_EXTENSION_LEN: usize = 4096;

/// The longest trailer section accepted after the last chunk.
pub const MAX_TRAILER_LEN: usize = 8192;


/// Framing faults in a chunked request body.
///
/// All of these are client errors: the body cannot be trusted and the
/// connection cannot be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The chunk-size line is not a hexadecimal number, overflows a [`u64`],
    /// or is followed by garbage.
    #[error("malformed chunk size line")]
    MalformedChunkSize,

    /// The chunk data did not end where its declared size said it would, or
    /// stopped arriving before it was complete.
    #[error("chunk data does not match its declared size")]
    ChunkSizeMismatch,

    /// The connection ended before the zero-length terminator chunk.
    #[error("body ended before the terminating chunk")]
    TruncatedStream,

    /// The trailer section is malformed or exceeds [`MAX_TRAILER_LEN`].
    #[error("malformed or oversized chunked trailer section")]
    InvalidTrailer,
}
