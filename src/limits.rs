//! Server configuration limits and timeouts
//!
//! Every structure here has a `Default` implementation with conservative
//! values; override only the fields you need:
//!
//! ```no_run
//! # shard_web::impl_default_application!{MyApp}
//! use shard_web::{ListenOptions, Server, limits::{ConnLimits, ServerLimits}};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::builder()
//!         .listen(ListenOptions::tcp("127.0.0.1:8080".parse().unwrap()))
//!         .application(MyApp)
//!         .server_limits(ServerLimits {
//!             worker_count: 4,
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             keep_alive_timeout: Duration::from_secs(30),
//!             ..ConnLimits::default()
//!         })
//!         .build()
//!         .start()
//!         .await
//!         .unwrap();
//!
//!     server.shutdown().await.unwrap();
//! }
//! ```
//!
//! # Memory Consumption
//!
//! Each active connection holds:
//!
//! `Total` = [`Parse buffer`](ReqLimits::head_buffer_size) +
//!           [`Input channel`](ConnLimits::max_request_buffer_size) +
//!           [`Output channel`](ConnLimits::max_response_buffer_size)
//!
//! Channel memory is leased in [`BufferLimits::block_size`] blocks from a
//! pool shared by all workers.

use std::time::Duration;

/// Server-level worker and shutdown behavior.
///
/// # Worker layout
/// ```text
///              [------------------]
///              [ Listening socket ]
///              [------------------]
///                       ||
///                       \/
///   [-------------------------------------]
///   [ Worker 0 (primary)                  ]   cursor % (N + 1) == N
///   [ accept -> pick next dispatch target ] ===================> handled locally
///   [-------------------------------------]
///            ||                 ||
///            || SCM_RIGHTS      || SCM_RIGHTS
///            \/                 \/
///     [------------]      [------------]
///     [ Worker 1   ] .... [ Worker N   ]
///     [ secondary  ]      [ secondary  ]
///     [------------]      [------------]
/// ```
///
/// With a single worker no transfer pipe is created and the listener
/// serves every connection itself.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Number of reactor worker threads (default: half the available
    /// parallelism, clamped to `1..=16`).
    ///
    /// Values outside `1..=16` are clamped when the server starts.
    pub worker_count: usize,

    /// How long [`RunningServer::shutdown`](crate::RunningServer::shutdown)
    /// waits for in-flight connections before abandoning them (default: `5 seconds`).
    pub shutdown_timeout: Duration,

    /// Whether every response carries a `Server: shard_web` header (default: `true`).
    ///
    /// A `Server` header set by the application always wins.
    pub add_server_header: bool,

    /// File name prefix of the handle-transfer pipes created in
    /// [`std::env::temp_dir`] (default: `"shard_web"`).
    ///
    /// A random hex suffix is appended per listening address.
    pub pipe_prefix: String,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl ServerLimits {
    pub(crate) const MAX_WORKERS: usize = 16;

    #[inline]
    pub(crate) fn clamped_worker_count(&self) -> usize {
        self.worker_count.clamp(1, Self::MAX_WORKERS)
    }

    fn default_worker_count() -> usize {
        let parallelism = std::thread::available_parallelism().map_or(1, |n| n.get());

        (parallelism >> 1).clamp(1, Self::MAX_WORKERS)
    }
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            worker_count: Self::default_worker_count(),
            shutdown_timeout: Duration::from_secs(5),
            add_server_header: true,
            pipe_prefix: String::from("shard_web"),

            _priv: (),
        }
    }
}

/// Connection-level limits and timeouts
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum idle time between requests on a keep-alive connection (default: `130 seconds`)
    ///
    /// The timer runs only while no byte of the next request has arrived.
    /// When it expires the connection is closed without a response.
    pub keep_alive_timeout: Duration,

    /// Maximum number of unread request bytes buffered per connection
    /// (default: `Some(1 MiB)`).
    ///
    /// When the limit is reached the socket is no longer read until the
    /// request processing catches up. `None` disables backpressure.
    pub max_request_buffer_size: Option<usize>,

    /// Number of unsent response bytes after which
    /// [`HttpContext::write`](crate::HttpContext::write) suspends (default: `64 KiB`).
    pub max_response_buffer_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            keep_alive_timeout: Duration::from_secs(130),
            max_request_buffer_size: Some(1024 * 1024),
            max_response_buffer_size: 64 * 1024,

            _priv: (),
        }
    }
}

/// Limits applied while parsing the request head.
///
/// Exceeding a limit rejects the request with the matching status code
/// and closes the connection:
///
/// | Limit                             | Status |
/// |-----------------------------------|--------|
/// | `max_request_line_size`           | `414`  |
/// | `max_request_headers_total_size`  | `431`  |
/// | `max_header_count`                | `431`  |
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum length of the request line including `CRLF` (default: `8 KiB`)
    pub max_request_line_size: usize,

    /// Maximum total length of all header lines including their `CRLF`
    /// and the empty line ending the block (default: `32 KiB`)
    pub max_request_headers_total_size: usize,

    /// Maximum number of header fields (default: `100`)
    pub max_header_count: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl ReqLimits {
    /// Capacity of the per-connection parse buffer, large enough to hold
    /// a complete request head.
    #[inline]
    pub fn head_buffer_size(&self) -> usize {
        self.max_request_line_size + self.max_request_headers_total_size
    }
}

impl Default for ReqLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            max_request_line_size: 8 * 1024,
            max_request_headers_total_size: 32 * 1024,
            max_header_count: 100,

            _priv: (),
        }
    }
}

/// Shared block pool used by the connection byte channels.
#[derive(Debug, Clone)]
pub struct BufferLimits {
    /// Size of a single pooled block (default: `4096`)
    pub block_size: usize,

    /// Number of free blocks kept for reuse (default: `1024`)
    ///
    /// The pool never refuses a lease: when no free block is available a new
    /// one is allocated, and blocks returned to a full pool are freed.
    pub retained_blocks: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for BufferLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            block_size: 4096,
            retained_blocks: 1024,

            _priv: (),
        }
    }
}
