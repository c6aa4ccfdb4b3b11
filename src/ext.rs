use std::io::Write;
use std::ops::DerefMut;

use smallvec::SmallVec;


/// Byte-level helpers for the line-oriented parts of HTTP and CGI/1.1.
pub(crate) trait ByteSliceExt {
    /// Strips leading and trailing optional whitespace (`SP` and `HTAB`).
    #[must_use]
    fn trim_ows(&self) -> &[u8];

    /// Strips a single trailing `\r`, turning a CRLF line into an LF line.
    #[must_use]
    fn strip_cr(&self) -> &[u8];

    /// Splits the slice around the first occurrence of `sep`.
    #[must_use]
    fn split_once_at(&self, sep: u8) -> Option<(&[u8], &[u8])>;
}

impl ByteSliceExt for [u8] {
    fn trim_ows(&self) -> &[u8] {
        let is_ows = |b: &u8| matches!(b, b' ' | b'\t');
        let start = self.iter().position(|b| !is_ows(b)).unwrap_or(self.len());
        let end = self.iter().rposition(|b| !is_ows(b)).map_or(start, |i| i + 1);
        &self[start..end]
    }

    #[inline]
    fn strip_cr(&self) -> &[u8] {
        self.strip_suffix(b"\r").unwrap_or(self)
    }

    #[inline]
    fn split_once_at(&self, sep: u8) -> Option<(&[u8], &[u8])> {
        let idx = self.iter().position(|&b| b == sep)?;
        Some((&self[..idx], &self[(idx + 1)..]))
    }
}


/// Returns the value of an ASCII hexadecimal digit.
#[inline]
#[must_use]
pub(crate) fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Makes arbitrary script output safe to embed in a log line.
#[must_use]
pub(crate) fn ascii_escape(s: &[u8]) -> String {
    s.escape_ascii().to_string()
}


/// A trait for generic abstraction over [`Vec<u8>`]-like output buffers.
pub trait BytesVec: DerefMut<Target = [u8]> + Write {
    /// Copies and appends all bytes from `other` to this [`BytesVec`] in-order.
    fn extend_from_slice(&mut self, other: &[u8]);
}

impl BytesVec for Vec<u8> {
    #[inline]
    fn extend_from_slice(&mut self, other: &[u8]) {
        self.extend(other);
    }
}

impl<const N: usize> BytesVec for SmallVec<[u8; N]> {
    #[inline]
    fn extend_from_slice(&mut self, other: &[u8]) {
        self.extend_from_slice(other);
    }
}
