//! shard_web - Thread-per-core HTTP/1.x server core with socket sharding
//!
//! Connections are accepted by one listener and spread over a fixed pool
//! of single-threaded reactor workers. Each connection then runs an
//! incremental request loop on its worker: parse the request line and
//! headers, call the [`Application`], finish the response, and keep the
//! connection alive when HTTP/1.x allows it.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, pipelining, chunked request and
//!   response bodies
//! - **HTTP/1.0**: `Connection: keep-alive` opt-in, close-delimited responses
//!
//! # Architecture
//!
//! - **Workers** - one OS thread and one current-thread Tokio runtime each;
//!   nothing a connection owns ever leaves its worker
//! - **Sharding** - the first worker owns the listening socket and passes
//!   accepted sockets round-robin to the others over a Unix pipe
//!   (`SCM_RIGHTS`); a dead worker is dropped from the rotation
//! - **Byte channels** - bounded, pooled buffers between the socket and the
//!   request loop, in both directions
//! - **Listeners** - TCP, Unix sockets and inherited (systemd) descriptors
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use shard_web::{Application, HandlerError, HttpContext, ListenOptions, Server};
//!
//! struct MyApp;
//!
//! impl Application for MyApp {
//!     type Context = ();
//!
//!     fn create_context(&self, _: &HttpContext) {}
//!
//!     async fn process(&self, _: &mut (), http: &mut HttpContext) -> Result<(), HandlerError> {
//!         http.response_headers_mut()?.insert("Content-Length", "12");
//!         http.write(b"Hello World!").await?;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::builder()
//!         .listen(ListenOptions::tcp("127.0.0.1:8080".parse().unwrap()))
//!         .application(MyApp)
//!         .build()
//!         .start()
//!         .await
//!         .unwrap();
//!
//!     std::future::pending::<()>().await;
//!     server.shutdown().await.unwrap();
//! }
//! ```
//! Per-request state and response callbacks:
//! ```no_run
//! use shard_web::{Application, HandlerError, HttpContext, StatusCode};
//! use std::time::Instant;
//!
//! struct Timed;
//!
//! impl Application for Timed {
//!     type Context = Instant;
//!
//!     fn create_context(&self, _: &HttpContext) -> Instant {
//!         Instant::now()
//!     }
//!
//!     async fn process(&self, started: &mut Instant, http: &mut HttpContext) -> Result<(), HandlerError> {
//!         let started = *started;
//!         http.on_starting(move |head| {
//!             let micros = started.elapsed().as_micros().to_string();
//!             head.headers.insert("X-Elapsed-Micros", micros);
//!             Ok(())
//!         });
//!
//!         match http.path() {
//!             "/" => http.write(b"index").await?,
//!             _ => http.set_status(StatusCode::NotFound)?,
//!         }
//!         Ok(())
//!     }
//!
//!     fn dispose_context(&self, started: Instant, error: Option<&HandlerError>) {
//!         if let Some(error) = error {
//!             eprintln!("failed after {:?}: {error}", started.elapsed());
//!         }
//!     }
//! }
//! ```
//!
//! # Logging
//!
//! The crate logs through [`tracing`](https://docs.rs/tracing) and never
//! installs a subscriber. Connection lifecycle events go to an
//! [`EventSink`], by default [`TracingEvents`].

pub(crate) mod memory {
    pub(crate) mod channel;
    pub(crate) mod pool;
}
pub(crate) mod http {
    pub(crate) mod body;
    pub(crate) mod context;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod frame;
    pub(crate) mod listener;
    pub(crate) mod platform;
    pub(crate) mod server_impl;
    pub(crate) mod sharding;
    pub(crate) mod stream;
    pub(crate) mod transfer;
    pub(crate) mod worker;
}
pub(crate) mod errors;
pub(crate) mod events;
pub mod limits;

pub use crate::{
    errors::Error,
    events::{ConnectionInfo, Endpoint, EventSink, TracingEvents},
    http::{
        context::HttpContext,
        response::ResponseHead,
        types::{HeaderMap, Method, StatusCode, Version},
    },
    server::{
        listener::{ListenAddress, ListenOptions},
        platform::{HandleMigration, NoMigration, Unsupported},
        server_impl::{Application, HandlerError, RunningServer, Server, ServerBuilder},
    },
};

#[doc(hidden)]
#[macro_export]
macro_rules! impl_default_application {
    ($name:ident) => {
        struct $name;

        impl $crate::Application for $name {
            type Context = ();

            fn create_context(&self, _: &$crate::HttpContext) {}

            async fn process(
                &self,
                _: &mut (),
                http: &mut $crate::HttpContext,
            ) -> ::std::result::Result<(), $crate::HandlerError> {
                http.write(b"Hello world!").await?;
                Ok(())
            }
        }
    };
}

#[cfg(test)]
pub mod tools {
    use std::str::from_utf8;

    #[inline]
    pub fn str_op(value: &[u8]) -> &str {
        from_utf8(value).unwrap()
    }
}
