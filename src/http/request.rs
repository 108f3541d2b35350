use crate::{
    errors::ErrorKind,
    http::types::{is_token_byte, HeaderMap, Method, Version},
    limits::ReqLimits,
    memory::channel::ChannelReader,
};
use memchr::memchr;

/// Parsed request line and headers of the current request.
///
/// # Input requirements
///
/// - Lines end with exactly `CRLF`.
/// - The request line is `[METHOD] SP [TARGET] SP HTTP/1.x`; `[TARGET]`
///   must be valid `UTF-8` without whitespace.
/// - Header lines are `[NAME] ":" OWS [VALUE] OWS`, where `[NAME]` is a
///   token. Obsolete line folding is rejected.
///
/// Empty lines before the request line are skipped.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) target: String,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

impl RequestHead {
    #[inline]
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Self {
            method: Method::Get,
            target: String::new(),
            version: Version::Http11,
            headers: HeaderMap::with_capacity(limits.max_header_count.min(32)),
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.method = Method::Get;
        self.target.clear();
        self.version = Version::Http11;
        self.headers.clear();
    }

    /// Target without the query string.
    #[inline]
    pub(crate) fn path(&self) -> &str {
        match self.target.split_once('?') {
            Some((path, _)) => path,
            None => &self.target,
        }
    }

    #[inline]
    pub(crate) fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, query)| query)
    }
}

//

/// Parse buffer between the connection input channel and the parser.
///
/// Holds at most one request head; body bytes are read through it so that
/// bytes already pulled from the channel are not lost.
pub(crate) struct FrameInput {
    reader: ChannelReader,
    buffer: Box<[u8]>,
    start: usize,
    end: usize,
}

impl FrameInput {
    #[inline]
    pub(crate) fn new(reader: ChannelReader, limits: &ReqLimits) -> Self {
        Self {
            reader,
            buffer: vec![0; limits.head_buffer_size()].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    /// Moves channel bytes into the parse buffer.
    ///
    /// Returns `true` when the stream has ended, that is the channel writer
    /// completed and every byte is now in the buffer. A parse attempt made
    /// after such a fill sees the final input.
    pub(crate) fn fill(&mut self) -> bool {
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        } else if self.start > 0 && self.end == self.buffer.len() {
            self.buffer.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }

        self.end += self.reader.read(&mut self.buffer[self.end..]);
        self.reader.is_completed()
    }

    #[inline]
    pub(crate) fn buffered(&self) -> &[u8] {
        &self.buffer[self.start..self.end]
    }

    #[inline]
    pub(crate) fn consume(&mut self, n: usize) {
        debug_assert!(self.start + n <= self.end);
        self.start = (self.start + n).min(self.end);
    }

    /// `true` when nothing is buffered and the channel has ended.
    #[inline]
    pub(crate) fn is_completed(&self) -> bool {
        self.start == self.end && self.reader.is_completed()
    }

    #[inline]
    pub(crate) async fn await_more_data(&self) {
        self.reader.await_more_data().await
    }

    /// Reads buffered bytes first, then straight from the channel.
    pub(crate) fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let buffered = self.buffered();
        if !buffered.is_empty() {
            let n = buffered.len().min(dst.len());
            dst[..n].copy_from_slice(&buffered[..n]);
            self.consume(n);
            return n;
        }

        self.reader.read(dst)
    }

    /// Takes one `CRLF` terminated line, handing it to `f` without the
    /// terminator. Returns `Ok(None)` while the line is incomplete.
    pub(crate) fn take_line<R>(
        &mut self,
        max_len: usize,
        too_long: ErrorKind,
        f: impl FnOnce(&[u8]) -> Result<R, ErrorKind>,
    ) -> Result<Option<R>, ErrorKind> {
        let buffered = self.buffered();

        let Some(lf) = memchr(b'\n', buffered) else {
            if buffered.len() >= max_len {
                return Err(too_long);
            }
            return Ok(None);
        };

        if lf + 1 > max_len {
            return Err(too_long);
        }
        let line = match lf.checked_sub(1) {
            Some(cr) if buffered[cr] == b'\r' => &buffered[..cr],
            _ => return Err(ErrorKind::InvalidHeader),
        };

        let result = f(line)?;
        self.consume(lf + 1);
        Ok(Some(result))
    }

    /// Stops reading; unread bytes are dropped.
    #[inline]
    pub(crate) fn complete(&mut self) {
        self.start = 0;
        self.end = 0;
        self.reader.complete_reading();
    }
}

//

/// Outcome of [`Parser::take_start_line`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestLineStatus {
    /// No byte of a request has been received.
    Empty,
    /// Part of a request line is buffered.
    Incomplete,
    Done,
}

/// Incremental request head parser.
///
/// Every call consumes only complete lines, so it can be retried after
/// more input arrives.
#[derive(Debug, Clone)]
pub(crate) struct Parser {
    limits: ReqLimits,
    header_bytes: usize,
}

impl Parser {
    #[inline]
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Self {
            limits: limits.clone(),
            header_bytes: 0,
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.header_bytes = 0;
    }

    pub(crate) fn take_start_line(
        &mut self,
        input: &mut FrameInput,
        head: &mut RequestHead,
    ) -> Result<RequestLineStatus, ErrorKind> {
        // Empty lines before a request are ignored (RFC 9112, section 2.2).
        while input.buffered().starts_with(b"\r\n") {
            input.consume(2);
        }

        let buffered = input.buffered();
        if buffered.is_empty() || buffered == b"\r" {
            return Ok(RequestLineStatus::Empty);
        }

        let parsed = input.take_line(
            self.limits.max_request_line_size,
            ErrorKind::RequestLineTooLong,
            |line| parse_request_line(line, head),
        );

        match parsed {
            Ok(Some(())) => Ok(RequestLineStatus::Done),
            Ok(None) => Ok(RequestLineStatus::Incomplete),
            Err(ErrorKind::InvalidHeader) => Err(ErrorKind::BadRequestLine),
            Err(err) => Err(err),
        }
    }

    /// Returns `true` once the empty line ending the header block was consumed.
    pub(crate) fn take_message_headers(
        &mut self,
        input: &mut FrameInput,
        headers: &mut HeaderMap,
    ) -> Result<bool, ErrorKind> {
        loop {
            let remaining = self
                .limits
                .max_request_headers_total_size
                .saturating_sub(self.header_bytes);

            let mut line_len = 0;
            let line = input.take_line(remaining, ErrorKind::HeadersTooLarge, |line| {
                line_len = line.len() + 2;

                if line.is_empty() {
                    return Ok(None);
                }
                if headers.len() >= self.limits.max_header_count {
                    return Err(ErrorKind::TooManyHeaders);
                }
                parse_header_line(line).map(Some)
            })?;

            self.header_bytes += line_len;
            match line {
                None => return Ok(false),
                Some(None) => return Ok(true),
                Some(Some((name, value))) => headers.append(name, value),
            }
        }
    }
}

fn parse_request_line(line: &[u8], head: &mut RequestHead) -> Result<(), ErrorKind> {
    let method_end = memchr(b' ', line).ok_or(ErrorKind::BadRequestLine)?;
    let rest = &line[method_end + 1..];
    let target_end = memchr(b' ', rest).ok_or(ErrorKind::BadRequestLine)?;

    let method = &line[..method_end];
    let target = &rest[..target_end];
    let version = &rest[target_end + 1..];

    head.method = Method::from_bytes(method).ok_or(ErrorKind::BadRequestLine)?;

    if target.is_empty() || target.iter().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(ErrorKind::BadRequestLine);
    }
    let target = simdutf8::basic::from_utf8(target).map_err(|_| ErrorKind::BadRequestLine)?;

    head.version = match version {
        b"HTTP/1.1" => Version::Http11,
        b"HTTP/1.0" => Version::Http10,
        [b'H', b'T', b'T', b'P', b'/', major, b'.', minor]
            if major.is_ascii_digit() && minor.is_ascii_digit() =>
        {
            return Err(ErrorKind::UnrecognizedHttpVersion)
        }
        _ => return Err(ErrorKind::BadRequestLine),
    };

    head.target.clear();
    head.target.push_str(target);
    Ok(())
}

fn parse_header_line(line: &[u8]) -> Result<(String, String), ErrorKind> {
    if line[0] == b' ' || line[0] == b'\t' {
        // obs-fold
        return Err(ErrorKind::InvalidHeader);
    }

    let colon = memchr(b':', line).ok_or(ErrorKind::InvalidHeader)?;
    let name = &line[..colon];
    if name.is_empty() || !name.iter().all(|b| is_token_byte(*b)) {
        return Err(ErrorKind::InvalidHeader);
    }

    let value = trim_ows(&line[colon + 1..]);
    if value.iter().any(|b| *b == b'\r' || *b == b'\n' || *b == 0) {
        return Err(ErrorKind::InvalidHeader);
    }

    let name = simdutf8::basic::from_utf8(name).map_err(|_| ErrorKind::InvalidHeader)?;
    let value = simdutf8::basic::from_utf8(value).map_err(|_| ErrorKind::InvalidHeader)?;
    Ok((name.to_owned(), value.to_owned()))
}

#[inline]
fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

#[cfg(test)]
pub(crate) fn test_input(bytes: &[u8], completed: bool, limits: &ReqLimits) -> FrameInput {
    use crate::memory::channel::{byte_channel, test_pool};

    let (writer, reader) = byte_channel(test_pool(), None);
    writer.write(bytes).unwrap();
    if completed {
        writer.complete_writing();
    } else {
        // Keep the writer open.
        std::mem::forget(writer);
    }

    FrameInput::new(reader, limits)
}
