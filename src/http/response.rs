//! Streaming HTTP/1.1 response serialization.

use crate::{
    errors::Error,
    http::types::{HeaderMap, Method, StatusCode, Version},
    memory::channel::ChannelWriter,
};

const SERVER_NAME: &str = "shard_web";

/// Status and headers of a response that has not been sent yet.
///
/// Handed to [`on_starting`](crate::HttpContext::on_starting) callbacks,
/// which may still change it right before it is written.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    /// Response status (default: `200 OK`).
    pub status: StatusCode,
    /// Headers written in insertion order.
    pub headers: HeaderMap,
}

impl Default for ResponseHead {
    #[inline]
    fn default() -> Self {
        Self {
            status: StatusCode::Ok,
            headers: HeaderMap::new(),
        }
    }
}

/// How the response body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    /// `HEAD` responses and statuses without a body; writes are discarded.
    NoBody,
    /// Application supplied `Content-Length`.
    Fixed(u64),
    Chunked,
    /// `HTTP/1.0` response without a length; ends when the connection closes.
    CloseDelimited,
}

#[derive(Debug)]
pub(crate) struct Response {
    pub(crate) head: ResponseHead,
    started: bool,
    framing: BodyFraming,
    written: u64,
}

impl Response {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            head: ResponseHead::default(),
            started: false,
            framing: BodyFraming::NoBody,
            written: 0,
        }
    }

    #[inline]
    pub(crate) fn has_started(&self) -> bool {
        self.started
    }

    #[cfg(test)]
    pub(crate) fn framing(&self) -> BodyFraming {
        self.framing
    }

    /// Chooses the body framing and writes the response head.
    ///
    /// `keep_alive` is cleared when the response cannot be followed by
    /// another one on this connection.
    pub(crate) fn start(
        &mut self,
        version: Version,
        method: &Method,
        keep_alive: &mut bool,
        add_server_header: bool,
        out: &ChannelWriter,
    ) -> Result<(), Error> {
        debug_assert!(!self.started, "response started twice");

        let headers = &self.head.headers;
        if headers
            .get_all("connection")
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("close"))
        {
            *keep_alive = false;
        }

        let length = headers.get("content-length");
        let declared = length.and_then(|value| value.trim().parse::<u64>().ok());
        // An unusable length is dropped rather than sent next to another framing.
        let skip_length = declared.is_none();
        if let (Some(value), None) = (length, declared) {
            tracing::debug!(value, "ignoring invalid response Content-Length");
        }

        self.framing = if *method == Method::Head || !self.head.status.allows_body() {
            BodyFraming::NoBody
        } else if let Some(length) = declared {
            BodyFraming::Fixed(length)
        } else if version == Version::Http11 {
            BodyFraming::Chunked
        } else {
            *keep_alive = false;
            BodyFraming::CloseDelimited
        };

        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(self.head.status.status_line());

        if add_server_header && !headers.contains("server") {
            push_header(&mut buf, "Server", SERVER_NAME);
        }
        for (name, value) in headers.iter() {
            if name.eq_ignore_ascii_case("connection")
                || name.eq_ignore_ascii_case("transfer-encoding")
                || (skip_length && name.eq_ignore_ascii_case("content-length"))
            {
                continue;
            }
            push_header(&mut buf, name, value);
        }

        if !*keep_alive {
            push_header(&mut buf, "Connection", "close");
        } else if version == Version::Http10 {
            push_header(&mut buf, "Connection", "keep-alive");
        }
        if self.framing == BodyFraming::Chunked {
            push_header(&mut buf, "Transfer-Encoding", "chunked");
        }
        buf.extend_from_slice(b"\r\n");

        self.started = true;
        out.write(&buf)
    }

    /// Writes body bytes using the framing chosen by [`start`](Self::start).
    pub(crate) fn write_body(&mut self, out: &ChannelWriter, bytes: &[u8]) -> Result<(), Error> {
        debug_assert!(self.started, "body written before the head");
        if bytes.is_empty() {
            return Ok(());
        }

        match self.framing {
            BodyFraming::NoBody => Ok(()),
            BodyFraming::Fixed(declared) => {
                if self.written + bytes.len() as u64 > declared {
                    return Err(Error::ContentLengthExceeded { declared });
                }
                self.written += bytes.len() as u64;
                out.write(bytes)
            }
            BodyFraming::Chunked => {
                let mut size = [0; 18];
                out.write(chunk_size_line(bytes.len(), &mut size))?;
                out.write(bytes)?;
                out.write(b"\r\n")
            }
            BodyFraming::CloseDelimited => out.write(bytes),
        }
    }

    /// Ends the body. Returns `false` when fewer bytes than the declared
    /// `Content-Length` were written.
    pub(crate) fn finish(&mut self, out: &ChannelWriter) -> Result<bool, Error> {
        match self.framing {
            BodyFraming::Chunked => out.write(b"0\r\n\r\n").map(|()| true),
            BodyFraming::Fixed(declared) => Ok(self.written == declared),
            BodyFraming::NoBody | BodyFraming::CloseDelimited => Ok(true),
        }
    }
}

#[inline]
fn push_header(buf: &mut Vec<u8>, name: &str, value: &str) {
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
}

// e.g. `b"1A2\r\n"`
#[inline]
fn chunk_size_line(mut len: usize, buf: &mut [u8; 18]) -> &[u8] {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";

    buf[16] = b'\r';
    buf[17] = b'\n';

    let mut start = 16;
    loop {
        start -= 1;
        buf[start] = HEX[len & 0xF];
        len >>= 4;
        if len == 0 {
            break;
        }
    }
    &buf[start..]
}
