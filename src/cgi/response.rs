//! Parser for the header block of a CGI/1.1 response (RFC 3875, Section 6).
//!
//! A script starts its output with header fields in the usual `Name: value`
//! form, ending at the first empty line. Lines may end in CRLF or a bare LF,
//! and both may be mixed. Everything after the empty line is the response
//! body and is never touched by the [`Parser`].

use compact_str::CompactString;
use http::header::{self, HeaderName, HeaderValue};
use http::StatusCode;

use crate::ext::ByteSliceExt;


/// Faults in the header block written by a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The header block did not end within the configured limit.
    #[error("CGI header block exceeds {0} bytes")]
    TooLarge(usize),

    /// The script's output ended before the empty line closing the header
    /// block.
    #[error("CGI output ended inside the header block")]
    Incomplete,

    #[error("CGI header line without a colon")]
    MissingColon,

    #[error("CGI continuation line before the first header field")]
    UnexpectedContinuation,

    #[error("invalid CGI header field name")]
    InvalidName,

    #[error("invalid CGI header field value")]
    InvalidValue,

    /// The `Status` field is not a 3-digit code with an optional reason
    /// phrase, or appears more than once.
    #[error("invalid CGI Status field")]
    InvalidStatus,

    /// `Content-Length` is not a decimal number, or is repeated with
    /// differing values.
    #[error("invalid Content-Length in CGI header block")]
    InvalidContentLength,

    /// RFC 3875 requires at least one CGI field.
    #[error("CGI header block contains no fields")]
    NoFields,
}


/// A header field of a CGI response, in the order the script wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// The name exactly as written by the script.
    pub raw_name: CompactString,
    pub name: HeaderName,
    pub value: HeaderValue,
}

/// The parsed head of a CGI response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub status: StatusCode,
    /// The reason phrase from the `Status` field, if it had one.
    pub reason: Option<CompactString>,
    /// All header fields except `Status`. Repeated fields stay repeated.
    pub fields: Vec<Field>,
    /// The value of the `Content-Length` field, if present.
    pub content_length: Option<u64>,
}

impl Head {
    /// Returns the first value of the named field.
    #[must_use]
    pub fn get(&self, name: &HeaderName) -> Option<&HeaderValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    /// Returns the reason phrase for the status line.
    #[must_use]
    pub fn reason(&self) -> &str {
        self.reason.as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or("Unknown")
    }

    fn from_fields(raw: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Self, Error> {
        if raw.is_empty() {
            return Err(Error::NoFields);
        }

        let mut status = None;
        let mut fields = Vec::with_capacity(raw.len());
        for (name, value) in raw {
            let value = HeaderValue::from_bytes(&value).map_err(|_| Error::InvalidValue)?;
            if name.eq_ignore_ascii_case(b"status") {
                if status.is_some() {
                    return Err(Error::InvalidStatus);
                }
                status = Some(parse_status(value.as_bytes())?);
                continue;
            }

            let parsed = HeaderName::from_bytes(&name).map_err(|_| Error::InvalidName)?;
            // HeaderName accepted it, so it is ASCII
            let raw_name = CompactString::from_utf8_lossy(&name);
            fields.push(Field { raw_name, name: parsed, value });
        }

        let mut content_length = None;
        for field in fields.iter().filter(|f| f.name == header::CONTENT_LENGTH) {
            let len = std::str::from_utf8(field.value.as_bytes()).ok()
                .filter(|v| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or(Error::InvalidContentLength)?;
            if content_length.is_some_and(|l| l != len) {
                return Err(Error::InvalidContentLength);
            }
            content_length = Some(len);
        }

        let (status, reason) = match status {
            Some(s) => s,
            None if fields.iter().any(|f| f.name == header::LOCATION) => (StatusCode::FOUND, None),
            None => (StatusCode::OK, None),
        };
        Ok(Self { status, reason, fields, content_length })
    }
}

fn parse_status(value: &[u8]) -> Result<(StatusCode, Option<CompactString>), Error> {
    let code = value.get(..3).ok_or(Error::InvalidStatus)?;
    let status = StatusCode::from_bytes(code).map_err(|_| Error::InvalidStatus)?;
    let reason = match &value[3..] {
        [] => None,
        [b' ' | b'\t', rest @ ..] => {
            let rest = rest.trim_ows();
            (!rest.is_empty()).then(|| CompactString::from_utf8_lossy(rest))
        },
        _ => return Err(Error::InvalidStatus),
    };
    Ok((status, reason))
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Line,
    /// Seen a CR, expecting the LF completing the line.
    Cr,
    Done,
}

/// An incremental parser for a CGI response header block.
///
/// Output of the script is passed to `Parser::feed` as it arrives. Once the
/// header block is complete, `feed` reports how much of the last input
/// belonged to it and `Parser::into_head` yields the parsed [`Head`].
#[derive(Debug, Clone)]
#[must_use = "Parser must be fed input to parse anything"]
pub struct Parser {
    limit: usize,
    seen: usize,
    state: State,
    line: Vec<u8>,
    fields: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Parser {
    /// Creates a parser accepting header blocks of up to `limit` bytes,
    /// including the terminating empty line.
    pub fn new(limit: usize) -> Self {
        Self { limit, seen: 0, state: State::Line, line: Vec::new(), fields: Vec::new() }
    }

    /// Consumes script output until the end of the header block.
    ///
    /// Returns `Some(n)` once the header block is complete, where `n` is the
    /// number of bytes of `input` that belonged to it. The remainder of
    /// `input` is the start of the response body. Returns [`None`] if all of
    /// `input` was consumed without completing the header block.
    ///
    /// # Errors
    /// Fails on lines that cannot be part of a header block and once more
    /// than `limit` bytes were consumed.
    pub fn feed(&mut self, input: &[u8]) -> Result<Option<usize>, Error> {
        if self.state == State::Done {
            return Ok(Some(0));
        }

        for (i, &b) in input.iter().enumerate() {
            self.seen += 1;
            if self.seen > self.limit {
                return Err(Error::TooLarge(self.limit));
            }

            match (self.state, b) {
                (State::Line | State::Cr, b'\n') => {
                    self.state = State::Line;
                    if self.end_line()? {
                        self.state = State::Done;
                        return Ok(Some(i + 1));
                    }
                },
                (State::Line, b'\r') => self.state = State::Cr,
                (State::Line, _) => self.line.push(b),
                // A CR not followed by LF stays part of the line, where the
                // value check rejects it later on
                (State::Cr, _) => {
                    self.line.push(b'\r');
                    if b == b'\r' {
                        continue;
                    }
                    self.line.push(b);
                    self.state = State::Line;
                },
                (State::Done, _) => unreachable!("feed returns once the head is done"),
            }
        }
        Ok(None)
    }

    /// Finishes the current line. Returns `true` if it was the empty line
    /// ending the header block.
    fn end_line(&mut self) -> Result<bool, Error> {
        let line = std::mem::take(&mut self.line);
        match line.first() {
            None => Ok(true),
            Some(b' ' | b'\t') => {
                let (_, value) = self.fields.last_mut().ok_or(Error::UnexpectedContinuation)?;
                let more = line.trim_ows();
                if !more.is_empty() {
                    if !value.is_empty() {
                        value.push(b' ');
                    }
                    value.extend_from_slice(more);
                }
                Ok(false)
            },
            Some(_) => {
                let (name, value) = line.split_once_at(b':').ok_or(Error::MissingColon)?;
                self.fields.push((name.to_vec(), value.trim_ows().to_vec()));
                Ok(false)
            },
        }
    }

    /// Tests whether the end of the header block was found.
    #[inline]
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Returns the number of header bytes consumed so far.
    #[inline]
    #[must_use]
    pub fn consumed(&self) -> usize {
        self.seen
    }

    /// Validates the collected fields and builds the [`Head`].
    ///
    /// # Errors
    /// Returns [`Error::Incomplete`] if the header block has not ended yet,
    /// which is the case when a script exits before finishing it. Invalid
    /// names, values, `Status` or `Content-Length` fields are reported as
    /// their respective errors.
    pub fn into_head(self) -> Result<Head, Error> {
        if self.state != State::Done {
            return Err(Error::Incomplete);
        }
        Head::from_fields(self.fields)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &[u8]) -> Result<(Head, &[u8]), Error> {
        let mut parser = Parser::new(8192);
        let n = parser.feed(input)?.ok_or(Error::Incomplete)?;
        Ok((parser.into_head()?, &input[n..]))
    }

    #[test]
    fn document_response() {
        let (head, body) = parse(b"Content-Type: text/html\r\nX-Test: a:b:c\r\n\r\n<html>").unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.reason(), "OK");
        assert_eq!(head.fields.len(), 2);
        assert_eq!(head.get(&header::CONTENT_TYPE).unwrap(), "text/html");
        assert_eq!(head.fields[1].value, "a:b:c");
        assert_eq!(head.fields[1].raw_name, "X-Test");
        assert_eq!(head.content_length, None);
        assert_eq!(body, b"<html>");
    }

    #[test]
    fn status_and_order() {
        let input = b"Set-Cookie: a=1\nStatus: 404 Gone Fishing\nset-cookie: b=2\nContent-Length: 3\n\nabc";
        let (head, body) = parse(input).unwrap();
        assert_eq!(head.status, StatusCode::NOT_FOUND);
        assert_eq!(head.reason(), "Gone Fishing");
        let cookies: Vec<_> = head.fields.iter()
            .filter(|f| f.name == header::SET_COOKIE)
            .map(|f| (f.raw_name.as_str(), f.value.to_str().unwrap()))
            .collect();
        assert_eq!(cookies, [("Set-Cookie", "a=1"), ("set-cookie", "b=2")]);
        assert_eq!(head.content_length, Some(3));
        assert_eq!(body, b"abc");
    }

    #[test]
    fn status_forms() {
        let (head, _) = parse(b"Status: 201\r\n\r\n").unwrap();
        assert_eq!(head.status, StatusCode::CREATED);
        assert_eq!(head.reason, None);
        assert_eq!(head.reason(), "Created");

        let (head, _) = parse(b"Status: 299 \r\n\r\n").unwrap();
        assert_eq!(head.reason(), "Unknown");

        for bad in [&b"Status: 20\n\n"[..], b"Status: abc\n\n", b"Status: 2000\n\n", b"Status: 099\n\n",
                    b"Status: 200\nStatus: 500\n\n"] {
            assert_eq!(parse(bad).unwrap_err(), Error::InvalidStatus, "input {bad:?}");
        }
    }

    #[test]
    fn location_redirect() {
        let (head, _) = parse(b"Location: http://example.test/\n\n").unwrap();
        assert_eq!(head.status, StatusCode::FOUND);
        let (head, _) = parse(b"Location: /x\nStatus: 301 Moved\n\n").unwrap();
        assert_eq!(head.status, StatusCode::MOVED_PERMANENTLY);
    }

    #[test]
    fn mixed_line_endings_and_folding() {
        let input = b"X-Long: first\r\n  second\n\tthird\nContent-Type: text/plain\n\r\nrest";
        let (head, body) = parse(input).unwrap();
        assert_eq!(head.fields[0].value, "first second third");
        assert_eq!(head.fields[1].value, "text/plain");
        assert_eq!(body, b"rest");
    }

    #[test]
    fn incremental() {
        let input = b"Content-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello";
        for split in 0..input.len() {
            let mut parser = Parser::new(8192);
            let first = parser.feed(&input[..split]).unwrap();
            let body = match first {
                Some(n) => &input[n..],
                None => {
                    let n = parser.feed(&input[split..]).unwrap().unwrap();
                    &input[split + n..]
                },
            };
            assert!(parser.is_done());
            assert_eq!(body, b"hello");
            assert_eq!(parser.into_head().unwrap().content_length, Some(5));
        }
    }

    #[test]
    fn malformed() {
        assert_eq!(parse(b"no colon here\n\n").unwrap_err(), Error::MissingColon);
        assert_eq!(parse(b" folded: first\n\n").unwrap_err(), Error::UnexpectedContinuation);
        assert_eq!(parse(b"Bad Name: x\n\n").unwrap_err(), Error::InvalidName);
        assert_eq!(parse(b"X: a\rb\n\n").unwrap_err(), Error::InvalidValue);
        assert_eq!(parse(b"\r\nbody").unwrap_err(), Error::NoFields);
        assert_eq!(parse(b"Content-Length: 5\nContent-Length: 6\n\n").unwrap_err(),
                   Error::InvalidContentLength);
        assert_eq!(parse(b"Content-Length: -5\n\n").unwrap_err(), Error::InvalidContentLength);
    }

    #[test]
    fn incomplete_and_limit() {
        let mut parser = Parser::new(8192);
        assert_eq!(parser.feed(b"Content-Type: text/plain\r\n").unwrap(), None);
        assert_eq!(parser.into_head().unwrap_err(), Error::Incomplete);

        let mut parser = Parser::new(16);
        assert_eq!(parser.feed(b"X: 0123456789abcdef\n\n").unwrap_err(), Error::TooLarge(16));

        let mut parser = Parser::new(8);
        assert_eq!(parser.feed(b"X: 1\n\nbody").unwrap(), Some(6));
    }
}
