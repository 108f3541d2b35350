//! Connection lifecycle notifications.
//!
//! The server reports lifecycle points to an [`EventSink`]. The default
//! sink, [`TracingEvents`], turns them into `tracing` events under the
//! `shard_web::events` target, so they can be enabled on their own:
//!
//! ```text
//! RUST_LOG=shard_web::events=debug
//! ```

use crate::{HandlerError, StatusCode};
use std::{fmt, io, net::SocketAddr, path::PathBuf};

/// Address of one side of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    /// Unix domain socket; unnamed sockets have no path.
    Unix(Option<PathBuf>),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(Some(path)) => write!(f, "unix:{}", path.display()),
            Self::Unix(None) => f.write_str("unix:(unnamed)"),
        }
    }
}

/// Identity of an accepted connection, shared by every event it produces.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub(crate) id: String,
    pub(crate) server_address: String,
    pub(crate) remote: Endpoint,
    pub(crate) local: Endpoint,
}

impl ConnectionInfo {
    /// Process-unique identifier, 13 characters of base-32.
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Listening address the connection was accepted on.
    #[inline]
    pub fn server_address(&self) -> &str {
        &self.server_address
    }

    #[inline]
    pub fn remote_endpoint(&self) -> &Endpoint {
        &self.remote
    }

    #[inline]
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }
}

/// Receiver of connection lifecycle events.
///
/// Methods are called synchronously from worker threads and must not
/// block. Every method has an empty default.
///
/// # Examples
/// ```
/// use shard_web::{ConnectionInfo, EventSink};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// #[derive(Default)]
/// struct Counter {
///     open: AtomicUsize,
/// }
///
/// impl EventSink for Counter {
///     fn connection_start(&self, _: &ConnectionInfo) {
///         self.open.fetch_add(1, Ordering::Relaxed);
///     }
///
///     fn connection_stop(&self, _: &ConnectionInfo) {
///         self.open.fetch_sub(1, Ordering::Relaxed);
///     }
/// }
/// ```
pub trait EventSink: Send + Sync + 'static {
    fn connection_start(&self, info: &ConnectionInfo) {
        let _ = info;
    }

    /// Emitted exactly once per started connection.
    fn connection_stop(&self, info: &ConnectionInfo) {
        let _ = info;
    }

    /// A request was rejected during parsing with `status`.
    fn request_rejected(&self, info: &ConnectionInfo, status: StatusCode) {
        let _ = (info, status);
    }

    /// The application failed while processing a request.
    fn application_error(&self, info: &ConnectionInfo, error: &HandlerError) {
        let _ = (info, error);
    }

    /// A connection could not be handed to a secondary worker.
    fn dispatch_failed(&self, error: &io::Error) {
        let _ = error;
    }
}

/// Default [`EventSink`], forwarding to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEvents;

impl EventSink for TracingEvents {
    fn connection_start(&self, info: &ConnectionInfo) {
        tracing::debug!(
            target: "shard_web::events",
            connection_id = %info.id,
            remote = %info.remote,
            server = %info.server_address,
            "connection start"
        );
    }

    fn connection_stop(&self, info: &ConnectionInfo) {
        tracing::debug!(target: "shard_web::events", connection_id = %info.id, "connection stop");
    }

    fn request_rejected(&self, info: &ConnectionInfo, status: StatusCode) {
        tracing::debug!(
            target: "shard_web::events",
            connection_id = %info.id,
            status = status.as_u16(),
            "request rejected"
        );
    }

    fn application_error(&self, info: &ConnectionInfo, error: &HandlerError) {
        tracing::debug!(
            target: "shard_web::events",
            connection_id = %info.id,
            error = %error,
            "application error"
        );
    }

    fn dispatch_failed(&self, error: &io::Error) {
        tracing::debug!(target: "shard_web::events", %error, "dispatch failed");
    }
}


#[cfg(test)]
mod events_tests {
    use super::*;

    #[test]
    fn endpoint_display() {
        #[rustfmt::skip]
        let cases = [
            (Endpoint::Tcp("127.0.0.1:8080".parse().unwrap()), "127.0.0.1:8080"),
            (Endpoint::Tcp("[::1]:80".parse().unwrap()), "[::1]:80"),
            (Endpoint::Unix(Some("/tmp/app.sock".into())), "unix:/tmp/app.sock"),
            (Endpoint::Unix(None), "unix:(unnamed)"),
        ];

        for (endpoint, expected) in cases {
            assert_eq!(endpoint.to_string(), expected);
        }
    }
}
