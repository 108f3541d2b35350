use crate::{
    errors::ErrorKind,
    http::{
        request::FrameInput,
        types::{comma_tokens, parse_decimal, parse_hex, HeaderMap, Version},
    },
};

// Longest accepted chunk-size or trailer line.
const MAX_CHUNK_LINE: usize = 4096;
const DRAIN_SCRATCH: usize = 4096;

/// Request body framing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MessageBody {
    kind: BodyKind,
    keep_alive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BodyKind {
    Empty,
    Length { remaining: u64 },
    Chunked(ChunkState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

impl MessageBody {
    /// Picks the body framing of a request from its headers.
    ///
    /// `Transfer-Encoding` wins over `Content-Length`; such a request closes
    /// the connection afterwards (RFC 9112, section 6.1). Without either
    /// header the body is empty.
    pub(crate) fn for_request(version: Version, headers: &HeaderMap) -> Result<Self, ErrorKind> {
        let mut keep_alive = request_keep_alive(version, headers);

        if headers.contains("transfer-encoding") {
            let last = comma_tokens(headers.get_all("transfer-encoding")).last();
            if !last.is_some_and(|coding| coding.eq_ignore_ascii_case("chunked")) {
                return Err(ErrorKind::InvalidTransferEncoding);
            }

            if headers.contains("content-length") {
                keep_alive = false;
            }
            return Ok(Self {
                kind: BodyKind::Chunked(ChunkState::Size),
                keep_alive,
            });
        }

        let mut length = None;
        for value in headers.get_all("content-length") {
            for item in value.split(',') {
                let item = item.trim_matches(|c| c == ' ' || c == '\t');
                let parsed =
                    parse_decimal(item.as_bytes()).ok_or(ErrorKind::InvalidContentLength)?;

                match length {
                    Some(previous) if previous != parsed => {
                        return Err(ErrorKind::InvalidContentLength)
                    }
                    _ => length = Some(parsed),
                }
            }
        }

        let kind = match length {
            None | Some(0) => BodyKind::Empty,
            Some(remaining) => BodyKind::Length { remaining },
        };
        Ok(Self { kind, keep_alive })
    }

    #[inline]
    pub(crate) fn empty() -> Self {
        Self {
            kind: BodyKind::Empty,
            keep_alive: false,
        }
    }

    /// Whether the request allows another request on the same connection.
    #[inline]
    pub(crate) fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[inline]
    pub(crate) fn is_finished(&self) -> bool {
        matches!(
            self.kind,
            BodyKind::Empty | BodyKind::Length { remaining: 0 } | BodyKind::Chunked(ChunkState::Done)
        )
    }

    /// Reads decoded body bytes into `dst`. Returns `0` at the end of the body.
    pub(crate) async fn read(
        &mut self,
        input: &mut FrameInput,
        dst: &mut [u8],
    ) -> Result<usize, ErrorKind> {
        if dst.is_empty() {
            return Ok(0);
        }

        loop {
            let ended = match &mut self.kind {
                BodyKind::Empty | BodyKind::Length { remaining: 0 } => return Ok(0),
                BodyKind::Length { remaining } => {
                    let max = clamp_len(*remaining, dst.len());
                    let n = input.read_into(&mut dst[..max]);
                    if n > 0 {
                        *remaining -= n as u64;
                        return Ok(n);
                    }
                    input.is_completed()
                }
                BodyKind::Chunked(state) => match read_chunked(state, input, dst)? {
                    Progress::Read(n) => return Ok(n),
                    Progress::Continue => continue,
                    Progress::NeedMore { ended } => ended,
                },
            };

            if ended {
                return Err(ErrorKind::UnexpectedEndOfRequest);
            }
            input.await_more_data().await;
        }
    }

    /// Reads and discards the rest of the body.
    pub(crate) async fn consume(&mut self, input: &mut FrameInput) -> Result<(), ErrorKind> {
        if self.is_finished() {
            return Ok(());
        }

        let mut scratch = [0; DRAIN_SCRATCH];
        while self.read(input, &mut scratch).await? > 0 {}
        Ok(())
    }
}

enum Progress {
    Read(usize),
    Continue,
    NeedMore { ended: bool },
}

fn read_chunked(
    state: &mut ChunkState,
    input: &mut FrameInput,
    dst: &mut [u8],
) -> Result<Progress, ErrorKind> {
    match *state {
        ChunkState::Done => Ok(Progress::Read(0)),

        ChunkState::Data(remaining) => {
            let max = clamp_len(remaining, dst.len());
            let n = input.read_into(&mut dst[..max]);
            if n == 0 {
                return Ok(Progress::NeedMore {
                    ended: input.is_completed(),
                });
            }

            let remaining = remaining - n as u64;
            *state = match remaining {
                0 => ChunkState::DataEnd,
                _ => ChunkState::Data(remaining),
            };
            Ok(Progress::Read(n))
        }

        ChunkState::DataEnd => {
            let ended = input.fill();
            let buffered = input.buffered();

            if buffered.starts_with(b"\r\n") {
                input.consume(2);
                *state = ChunkState::Size;
                Ok(Progress::Continue)
            } else if buffered.is_empty() || buffered == b"\r" {
                Ok(Progress::NeedMore { ended })
            } else {
                Err(ErrorKind::BadChunkedBody)
            }
        }

        ChunkState::Size => {
            let ended = input.fill();
            match chunk_line(input, parse_chunk_size)? {
                Some(0) => *state = ChunkState::Trailers,
                Some(size) => *state = ChunkState::Data(size),
                None => return Ok(Progress::NeedMore { ended }),
            }
            Ok(Progress::Continue)
        }

        ChunkState::Trailers => {
            let ended = input.fill();
            match chunk_line(input, |line| Ok(line.is_empty()))? {
                Some(true) => {
                    *state = ChunkState::Done;
                    Ok(Progress::Read(0))
                }
                // Trailer fields are read and dropped.
                Some(false) => Ok(Progress::Continue),
                None => Ok(Progress::NeedMore { ended }),
            }
        }
    }
}

#[inline]
fn chunk_line<R>(
    input: &mut FrameInput,
    f: impl FnOnce(&[u8]) -> Result<R, ErrorKind>,
) -> Result<Option<R>, ErrorKind> {
    input
        .take_line(MAX_CHUNK_LINE, ErrorKind::BadChunkedBody, f)
        .map_err(|_| ErrorKind::BadChunkedBody)
}

// `chunk-size [ chunk-ext ]`
fn parse_chunk_size(line: &[u8]) -> Result<u64, ErrorKind> {
    let size = match memchr::memchr(b';', line) {
        Some(semicolon) => &line[..semicolon],
        None => line,
    };

    parse_hex(size.trim_ascii_end()).ok_or(ErrorKind::BadChunkedBody)
}

#[inline]
fn clamp_len(remaining: u64, len: usize) -> usize {
    usize::try_from(remaining).map_or(len, |remaining| remaining.min(len))
}

/// `Connection: close` always wins; `HTTP/1.0` needs an explicit `keep-alive`.
pub(crate) fn request_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let mut close = false;
    let mut keep_alive = false;

    for token in comma_tokens(headers.get_all("connection")) {
        if token.eq_ignore_ascii_case("close") {
            close = true;
        } else if token.eq_ignore_ascii_case("keep-alive") {
            keep_alive = true;
        }
    }

    !close && (version == Version::Http11 || keep_alive)
}
