//! Core HTTP protocol types

use std::fmt;

#[inline]
pub(crate) fn parse_decimal(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: u64 = 0;
    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }

        result = result.checked_mul(10)?.checked_add((byte - b'0') as u64)?;
    }

    Some(result)
}

#[inline]
pub(crate) fn parse_hex(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: u64 = 0;
    for &byte in bytes {
        let digit = match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'f' => byte - b'a' + 10,
            b'A'..=b'F' => byte - b'A' + 10,
            _ => return None,
        };

        result = result.checked_mul(16)?.checked_add(digit as u64)?;
    }

    Some(result)
}

/// `tchar` from RFC 9110, section 5.6.2.
#[inline]
pub(crate) const fn is_token_byte(byte: u8) -> bool {
    matches!(byte,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z'
    )
}

/// Iterates the comma separated tokens of every value, skipping empty ones.
#[inline]
pub(crate) fn comma_tokens<'a, I>(values: I) -> impl Iterator<Item = &'a str>
where
    I: Iterator<Item = &'a str>,
{
    values
        .flat_map(|value| value.split(','))
        .map(|token| token.trim_matches(|c| c == ' ' || c == '\t'))
        .filter(|token| !token.is_empty())
}

// METHOD

/// HTTP request method
///
/// Methods registered in RFC 9110 get their own variant; any other valid
/// token is kept as [`Method::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// `GET`
    Get,
    /// `HEAD`, answered without a response body
    Head,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `DELETE`
    Delete,
    /// `CONNECT`
    Connect,
    /// `OPTIONS`
    Options,
    /// `TRACE`
    Trace,
    /// `PATCH` ([RFC 5789](https://datatracker.ietf.org/doc/html/rfc5789))
    Patch,
    /// Extension method token
    Other(Box<str>),
}

impl Method {
    /// Returns `None` if `src` is not a valid method token.
    #[inline]
    pub(crate) fn from_bytes(src: &[u8]) -> Option<Self> {
        let method = match src {
            b"GET" => Method::Get,
            b"HEAD" => Method::Head,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"CONNECT" => Method::Connect,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"PATCH" => Method::Patch,
            [] => return None,
            other if other.iter().all(|b| is_token_byte(*b)) => {
                // Token bytes are ASCII.
                Method::Other(String::from_utf8_lossy(other).into())
            }
            _ => return None,
        };

        Some(method)
    }

    /// The method as it appears on the request line.
    #[inline]
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
            Method::Other(token) => token,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// VERSION

/// HTTP protocol version of a request.
///
/// Responses are always sent as `HTTP/1.1`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Version {
    /// HTTP/1.0 ([RFC 1945](https://tools.ietf.org/html/rfc1945)), closes by default
    Http10,
    /// HTTP/1.1 ([RFC 9112](https://datatracker.ietf.org/doc/html/rfc9112)), persistent by default
    Http11,
}

impl Version {
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

// STATUS_CODE

macro_rules! set_status_codes {
    ($(
        $(#[$docs:meta])*
        $name:ident = ($num:literal, $str:literal);
    )+) => {
        /// HTTP response status codes
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum StatusCode { $(
            #[doc = concat!("`", stringify!($num), " ", $str, "`")]
            $(#[$docs])*
            $name = $num,
        )+ }

        impl StatusCode {
            /// Numeric value of the status code.
            #[inline]
            pub const fn as_u16(&self) -> u16 {
                *self as u16
            }

            /// Canonical reason phrase.
            #[inline]
            pub const fn reason(&self) -> &'static str {
                match self { $( StatusCode::$name => $str, )+ }
            }

            // e.g. `b"HTTP/1.1 200 OK\r\n"`
            #[inline]
            pub(crate) const fn status_line(&self) -> &'static [u8] {
                match self { $(
                    StatusCode::$name => concat!("HTTP/1.1 ", $num, " ", $str, "\r\n").as_bytes(),
                )+ }
            }
        }
    }
}

set_status_codes! {
    Continue = (100, "Continue");
    SwitchingProtocols = (101, "Switching Protocols");

    Ok = (200, "OK");
    Created = (201, "Created");
    Accepted = (202, "Accepted");
    NoContent = (204, "No Content");
    PartialContent = (206, "Partial Content");

    MovedPermanently = (301, "Moved Permanently");
    Found = (302, "Found");
    SeeOther = (303, "See Other");
    /// Never carries a body.
    NotModified = (304, "Not Modified");
    TemporaryRedirect = (307, "Temporary Redirect");
    PermanentRedirect = (308, "Permanent Redirect");

    BadRequest = (400, "Bad Request");
    Unauthorized = (401, "Unauthorized");
    Forbidden = (403, "Forbidden");
    NotFound = (404, "Not Found");
    MethodNotAllowed = (405, "Method Not Allowed");
    RequestTimeout = (408, "Request Timeout");
    Conflict = (409, "Conflict");
    LengthRequired = (411, "Length Required");
    PayloadTooLarge = (413, "Payload Too Large");
    UriTooLong = (414, "URI Too Long");
    UnsupportedMediaType = (415, "Unsupported Media Type");
    TooManyRequests = (429, "Too Many Requests");
    RequestHeaderFieldsTooLarge = (431, "Request Header Fields Too Large");

    InternalServerError = (500, "Internal Server Error");
    NotImplemented = (501, "Not Implemented");
    BadGateway = (502, "Bad Gateway");
    ServiceUnavailable = (503, "Service Unavailable");
    GatewayTimeout = (504, "Gateway Timeout");
    HttpVersionNotSupported = (505, "HTTP Version Not Supported");
}

impl StatusCode {
    /// `1xx`, `204` and `304` responses never have a body.
    #[inline]
    pub const fn allows_body(&self) -> bool {
        !matches!(self.as_u16(), 100..=199 | 204 | 304)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.reason())
    }
}

// HEADERS

/// Ordered header collection.
///
/// Lookup is ASCII case-insensitive; names keep their original casing and
/// duplicates stay in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// First value of the header `name`.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of the header `name`, in arrival order.
    #[inline]
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Adds a value, keeping existing values of the same header.
    #[inline]
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces every value of `name` with `value`.
    ///
    /// The new entry takes the position of the first replaced one.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        match self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(first) => {
                let mut index = 0;
                self.entries.retain(|(n, _)| {
                    let keep = index <= first || !n.eq_ignore_ascii_case(&name);
                    index += 1;
                    keep
                });

                self.entries[first] = (name, value);
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Removes every value of `name`, returning how many were removed.
    #[inline]
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(name, value)` pairs in insertion order.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    #[inline]
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod header_map_tests {
    use super::*;

    #[test]
    fn case_insensitive_lookup() {
        let mut headers = HeaderMap::new();
        headers.append("Content-Length", "10");
        headers.append("X-Trace", "a");

        for name in ["Content-Length", "content-length", "CONTENT-LENGTH"] {
            assert_eq!(headers.get(name), Some("10"));
            assert!(headers.contains(name));
        }
        assert_eq!(headers.get("content-type"), None);
    }

    #[test]
    fn duplicates_keep_order_and_casing() {
        let mut headers = HeaderMap::new();
        headers.append("Connection", "keep-alive");
        headers.append("Accept", "*/*");
        headers.append("connection", "Upgrade");

        assert_eq!(
            headers.get_all("CONNECTION").collect::<Vec<_>>(),
            ["keep-alive", "Upgrade"]
        );
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            [
                ("Connection", "keep-alive"),
                ("Accept", "*/*"),
                ("connection", "Upgrade")
            ]
        );
    }

    #[test]
    fn insert_replaces_all_values_in_place() {
        let mut headers = HeaderMap::new();
        headers.append("A", "1");
        headers.append("X-Dup", "old");
        headers.append("B", "2");
        headers.append("x-dup", "older");

        headers.insert("X-DUP", "new");
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            [("A", "1"), ("X-DUP", "new"), ("B", "2")]
        );

        headers.insert("C", "3");
        assert_eq!(headers.len(), 4);
        assert_eq!(headers.remove("x-dup"), 1);
        assert_eq!(headers.remove("x-dup"), 0);
    }
}
