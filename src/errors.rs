use crate::StatusCode;
use std::{error, fmt, io};

/// Failure that ends the request loop of a connection.
///
/// Variants that map to a status code are request rejections: if no
/// response has started yet, the matching minimal response from
/// [`ErrorKind::as_http`] is written before the connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorKind {
    BadRequestLine,
    UnrecognizedHttpVersion,
    RequestLineTooLong,

    InvalidHeader,
    HeadersTooLarge,
    TooManyHeaders,

    InvalidContentLength,
    InvalidTransferEncoding,
    BadChunkedBody,
    UnexpectedEndOfRequest,

    KeepAliveTimeout,
    StreamClosed,
}

macro_rules! http_errors {
    ($($name:ident: $status:ident => $status_line:literal; )*) => {
        pub(crate) const fn as_http(&self) -> Option<&'static [u8]> {
            match self {
                $(
                    Self::$name => Some(concat!(
                        "HTTP/1.1 ", $status_line, "\r\n",
                        "Connection: close\r\n",
                        "Content-Length: 0\r\n\r\n",
                    ).as_bytes()),
                )*
                _ => None,
            }
        }

        pub(crate) const fn status(&self) -> Option<StatusCode> {
            match self {
                $( Self::$name => Some(StatusCode::$status), )*
                _ => None,
            }
        }
    };
}

impl ErrorKind {
    http_errors! {
        BadRequestLine: BadRequest => "400 Bad Request";
        UnrecognizedHttpVersion: HttpVersionNotSupported => "505 HTTP Version Not Supported";
        RequestLineTooLong: UriTooLong => "414 URI Too Long";

        InvalidHeader: BadRequest => "400 Bad Request";
        HeadersTooLarge: RequestHeaderFieldsTooLarge => "431 Request Header Fields Too Large";
        TooManyHeaders: RequestHeaderFieldsTooLarge => "431 Request Header Fields Too Large";

        InvalidContentLength: BadRequest => "400 Bad Request";
        InvalidTransferEncoding: BadRequest => "400 Bad Request";
        BadChunkedBody: BadRequest => "400 Bad Request";
        UnexpectedEndOfRequest: BadRequest => "400 Bad Request";
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::BadRequestLine => "malformed request line",
            Self::UnrecognizedHttpVersion => "unrecognized HTTP version",
            Self::RequestLineTooLong => "request line too long",
            Self::InvalidHeader => "malformed header line",
            Self::HeadersTooLarge => "request headers too large",
            Self::TooManyHeaders => "too many request headers",
            Self::InvalidContentLength => "invalid Content-Length",
            Self::InvalidTransferEncoding => "unsupported Transfer-Encoding",
            Self::BadChunkedBody => "malformed chunked body",
            Self::UnexpectedEndOfRequest => "unexpected end of request content",
            Self::KeepAliveTimeout => "keep-alive timeout",
            Self::StreamClosed => "connection stream closed",
        };
        f.write_str(text)
    }
}

/// Errors returned by the public API.
#[derive(Debug)]
pub enum Error {
    /// An operating system error while binding, accepting or transferring sockets.
    Io(io::Error),
    /// A listening address that cannot be used (for example a relative Unix socket path).
    InvalidAddress(String),
    /// The worker thread is no longer accepting tasks.
    WorkerStopped,
    /// Connections were still running when the shutdown timeout expired.
    ShutdownTimedOut {
        /// Number of connections that were abandoned.
        leaked: usize,
    },
    /// The response head was already handed to the connection; status and
    /// headers can no longer change.
    ResponseStarted,
    /// A `response starting` callback failed, so the response was not started.
    StartingCallback,
    /// More body bytes were written than the declared `Content-Length`.
    ContentLengthExceeded {
        /// Declared response length.
        declared: u64,
    },
    /// The connection is closed or aborted; no more data can be exchanged.
    StreamClosed,
    /// The request body is malformed or ended before it was complete.
    InvalidRequestBody,
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::InvalidAddress(address) => write!(f, "invalid listen address: {address}"),
            Self::WorkerStopped => f.write_str("worker thread has stopped"),
            Self::ShutdownTimedOut { leaked } => {
                write!(f, "shutdown timed out with {leaked} connection(s) still running")
            }
            Self::ResponseStarted => f.write_str("response has already started"),
            Self::StartingCallback => f.write_str("response starting callback failed"),
            Self::ContentLengthExceeded { declared } => {
                write!(f, "response body exceeds declared Content-Length of {declared}")
            }
            Self::StreamClosed => f.write_str("connection stream is closed"),
            Self::InvalidRequestBody => f.write_str("request body is malformed or incomplete"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ErrorKind> for Error {
    fn from(err: ErrorKind) -> Self {
        match err {
            ErrorKind::StreamClosed => Error::StreamClosed,
            _ => Error::InvalidRequestBody,
        }
    }
}
