//! Request loop of a single connection.
//!
//! ```text
//!   start line -> headers -> body framing -> application
//!       ^                                       |
//!       |           callbacks, drain body       |
//!       '--------- keep-alive <-----------------'
//! ```

use crate::{
    errors::{Error, ErrorKind},
    http::{
        body::MessageBody,
        context::{HttpContext, StreamState},
        request::{Parser, RequestLineStatus},
    },
    server::{
        server_impl::{Application, ServiceContext},
        worker::ShutdownSignal,
    },
    HandlerError,
};
use std::{
    any::Any,
    future::{poll_fn, Future},
    panic::{self, AssertUnwindSafe},
    pin::pin,
    sync::Arc,
    task::Poll,
};
use tokio::time::{sleep_until, Instant};

pub(crate) struct Frame<A: Application> {
    services: Arc<ServiceContext<A>>,
    http: HttpContext,
    parser: Parser,
    shutdown: ShutdownSignal,
}

impl<A: Application> Frame<A> {
    pub(crate) fn new(
        services: Arc<ServiceContext<A>>,
        http: HttpContext,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            parser: Parser::new(&services.req_limits),
            services,
            http,
            shutdown,
        }
    }

    /// Processes requests until the connection ends, then completes both
    /// channels so the socket pumps can finish.
    pub(crate) async fn run(mut self) {
        let result = self.process_requests().await;
        self.teardown(result).await;
    }

    async fn process_requests(&mut self) -> Result<(), ErrorKind> {
        loop {
            if self.shutdown.is_set() || self.http.abort.is_aborted() {
                return Ok(());
            }
            self.http.reset();
            self.parser.reset();

            if !self.take_start_line().await? || !self.take_headers().await? {
                return Ok(());
            }

            let head = &self.http.head;
            self.http.body = MessageBody::for_request(head.version, &head.headers)?;
            self.http.keep_alive = self.http.body.keep_alive();
            self.http.streams = StreamState::Open;

            if !self.process_request().await? {
                return Ok(());
            }
        }
    }

    /// Returns `false` when the connection ends before a request line
    /// arrived: clean EOF or shutdown.
    async fn take_start_line(&mut self) -> Result<bool, ErrorKind> {
        let deadline = Instant::now() + self.services.conn_limits.keep_alive_timeout;

        loop {
            // After the writer completed every byte is in the parse buffer,
            // so a request sent right before a FIN still gets parsed.
            let ended = self.http.input.fill();
            let status = self
                .parser
                .take_start_line(&mut self.http.input, &mut self.http.head)?;

            match status {
                RequestLineStatus::Done => return Ok(true),
                RequestLineStatus::Empty if ended => return Ok(false),
                RequestLineStatus::Incomplete if ended => return Err(ErrorKind::BadRequestLine),

                // Keep-alive timeout only applies between requests.
                RequestLineStatus::Empty => tokio::select! {
                    biased;
                    _ = self.shutdown.wait() => return Ok(false),
                    _ = sleep_until(deadline) => return Err(ErrorKind::KeepAliveTimeout),
                    _ = self.http.input.await_more_data() => {}
                },
                RequestLineStatus::Incomplete => tokio::select! {
                    biased;
                    _ = self.shutdown.wait() => return Ok(false),
                    _ = self.http.input.await_more_data() => {}
                },
            }
        }
    }

    async fn take_headers(&mut self) -> Result<bool, ErrorKind> {
        loop {
            let ended = self.http.input.fill();
            if self
                .parser
                .take_message_headers(&mut self.http.input, &mut self.http.head.headers)?
            {
                return Ok(true);
            }
            if ended {
                return Err(ErrorKind::InvalidHeader);
            }

            tokio::select! {
                biased;
                _ = self.shutdown.wait() => return Ok(false),
                _ = self.http.input.await_more_data() => {}
            }
        }
    }

    /// Runs the application for the parsed request and finishes the
    /// response. Returns whether the connection stays open.
    async fn process_request(&mut self) -> Result<bool, ErrorKind> {
        let app = &self.services.app;

        match panic::catch_unwind(AssertUnwindSafe(|| app.create_context(&self.http))) {
            Ok(mut context) => {
                let result = {
                    let mut process = pin!(app.process(&mut context, &mut self.http));
                    poll_fn(|cx| {
                        match panic::catch_unwind(AssertUnwindSafe(|| process.as_mut().poll(cx))) {
                            Ok(poll) => poll,
                            Err(payload) => Poll::Ready(Err(panic_error(payload))),
                        }
                    })
                    .await
                };
                if let Err(err) = result {
                    self.http.application_error = Some(err);
                }

                self.finish_application(context);
            }
            // Without a context there is nothing to process or dispose.
            Err(payload) => self.http.application_error = Some(panic_error(payload)),
        }

        if let Some(err) = &self.http.application_error {
            tracing::warn!(
                connection_id = %self.http.info.id,
                error = %err,
                "unhandled application error"
            );
            self.services.events.application_error(&self.http.info, err);
        }

        if !self.http.abort.is_aborted() {
            self.http.streams = StreamState::Open;

            if self.http.keep_alive {
                // Unread body bytes must not be taken for the next request.
                if let Err(kind) = self.http.body.consume(&mut self.http.input).await {
                    self.http.keep_alive = false;
                    if kind != ErrorKind::StreamClosed {
                        self.http.rejection.get_or_insert(kind);
                    }
                }
            }

            self.produce_end();
        }
        self.http.streams = StreamState::Stopped;

        match self.http.rejection {
            Some(kind) => Err(kind),
            None => Ok(self.http.keep_alive),
        }
    }

    /// Runs the response callbacks, then hands the context back to the
    /// application.
    fn finish_application(&mut self, context: A::Context) {
        if !self.http.has_started() && self.http.application_error.is_none() {
            if let Err(err) = self.http.fire_on_starting() {
                self.http.application_error = Some(err);
            }
        }
        self.http.streams = StreamState::Paused;
        self.http.fire_on_completed();

        let app = &self.services.app;
        let error = self.http.application_error.as_ref();
        let disposed = panic::catch_unwind(AssertUnwindSafe(|| app.dispose_context(context, error)));
        if let Err(payload) = disposed {
            tracing::warn!(
                connection_id = %self.http.info.id,
                error = %panic_error(payload),
                "application context disposal failed"
            );
        }
    }

    fn produce_end(&mut self) {
        match self.http.produce_end() {
            Ok(true) => {}
            Ok(false) if self.http.application_error.is_some() || self.http.rejection.is_some() => {
                tracing::debug!(
                    connection_id = %self.http.info.id,
                    "response already started, aborting connection"
                );
                self.http.abort();
            }
            Ok(false) => {
                tracing::warn!(
                    connection_id = %self.http.info.id,
                    "response body shorter than its Content-Length, aborting connection"
                );
                self.http.abort();
            }
            Err(Error::StartingCallback) => {
                // Recorded as an application error, nothing was written.
                self.http.keep_alive = false;
            }
            Err(err) => {
                tracing::debug!(
                    connection_id = %self.http.info.id,
                    error = %err,
                    "failed to end response"
                );
                self.http.keep_alive = false;
            }
        }
    }

    async fn teardown(&mut self, result: Result<(), ErrorKind>) {
        let id = &self.http.info.id;

        match result {
            Ok(()) => {}
            Err(ErrorKind::KeepAliveTimeout) => {
                tracing::debug!(connection_id = %id, "keep-alive timeout");
            }
            Err(kind) => match kind.status() {
                Some(status) => {
                    tracing::debug!(connection_id = %id, %status, error = %kind, "request rejected");
                    self.services.events.request_rejected(&self.http.info, status);

                    if let Err(err) = self.produce_invalid_request_response(kind).await {
                        tracing::warn!(connection_id = %self.http.info.id, error = %err, "connection shutdown abnormally");
                    }
                }
                None => {
                    tracing::warn!(connection_id = %id, error = %kind, "connection processing ended abnormally");
                }
            },
        }

        if !self.http.abort.is_aborted() {
            self.http.output.complete_writing();
        }
        self.http.input.complete();
    }

    async fn produce_invalid_request_response(&mut self, kind: ErrorKind) -> Result<(), Error> {
        if self.http.has_started() || self.http.abort.is_aborted() {
            return Ok(());
        }
        let Some(response) = kind.as_http() else {
            return Ok(());
        };

        self.http.output.write(response)?;
        self.http.output.wait_for_space().await;
        Ok(())
    }
}

pub(crate) fn panic_error(payload: Box<dyn Any + Send>) -> HandlerError {
    let message = match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_owned(),
            Err(_) => "unknown panic payload".to_owned(),
        },
    };

    format!("application panicked: {message}").into()
}


#[cfg(test)]
mod frame_tests {
    use super::{harness::frame, *};
    use crate::{limits::ConnLimits, server::connection::AbortState};
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    /// Echoes method, path and body; `/fail`, `/fail-late`, `/short` and
    /// the `/panic*` paths misbehave.
    #[derive(Default)]
    struct TestApp {
        created: AtomicUsize,
        disposed: AtomicUsize,
        disposed_with_error: AtomicUsize,
    }

    impl Application for TestApp {
        type Context = String;

        fn create_context(&self, http: &HttpContext) -> String {
            self.created.fetch_add(1, Ordering::Relaxed);
            if http.path() == "/panic-create" {
                panic!("no context");
            }
            http.path().to_owned()
        }

        async fn process(&self, _: &mut String, http: &mut HttpContext) -> Result<(), HandlerError> {
            match http.path() {
                "/fail" => return Err("handler failed".into()),
                "/panic" => panic!("boom"),
                "/silent" => return Ok(()),
                "/late-header" => {
                    http.on_starting(|head| {
                        head.headers.append("X-Late", "1");
                        Ok(())
                    });
                    return Ok(());
                }
                "/panic-starting" => {
                    http.on_starting(|_| panic!("starting callback"));
                    return Ok(());
                }
                "/panic-completed" => {
                    http.on_completed(|| panic!("completed callback"));
                    return Ok(());
                }
                "/short" => {
                    http.response_headers_mut()?.insert("Content-Length", "10");
                    http.write(b"abc").await?;
                    return Ok(());
                }
                "/fail-late" => {
                    http.write(b"partial").await?;
                    return Err("failed after write".into());
                }
                _ => {}
            }

            let mut body = Vec::new();
            let mut buf = [0; 64];
            loop {
                match http.read_body(&mut buf).await? {
                    0 => break,
                    n => body.extend_from_slice(&buf[..n]),
                }
            }

            let text = format!("{} {} {}", http.method(), http.path(), String::from_utf8(body)?);
            http.response_headers_mut()?
                .insert("Content-Length", text.len().to_string());
            http.write(text.as_bytes()).await?;
            Ok(())
        }

        fn dispose_context(&self, path: String, error: Option<&HandlerError>) {
            self.disposed.fetch_add(1, Ordering::Relaxed);
            if error.is_some() {
                self.disposed_with_error.fetch_add(1, Ordering::Relaxed);
            }
            if path == "/panic-dispose" {
                panic!("dispose");
            }
        }
    }

    fn ok(body: &str) -> String {
        format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}", body.len())
    }

    #[tokio::test]
    async fn pipelined_requests() {
        let (frame, harness) = frame(TestApp::default(), ConnLimits::default());

        harness
            .input
            .write(
                b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n\
                  POST /b HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello\
                  POST /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
            )
            .unwrap();
        harness.input.complete_writing();
        frame.run().await;

        assert_eq!(
            harness.output(),
            [ok("GET /a "), ok("POST /b hello"), ok("POST /c abc")].concat()
        );
        assert!(harness.events.take().is_empty());
    }

    #[tokio::test]
    async fn unread_body_is_drained() {
        let (frame, harness) = frame(TestApp::default(), ConnLimits::default());

        harness
            .input
            .write(
                b"POST /silent HTTP/1.1\r\nContent-Length: 15\r\n\r\nGET /x HTTP/1.1\
                  GET /y HTTP/1.1\r\n\r\n",
            )
            .unwrap();
        harness.input.complete_writing();
        frame.run().await;

        assert_eq!(
            harness.output(),
            ["HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_owned(), ok("GET /y ")].concat()
        );
    }

    #[tokio::test]
    async fn empty_head_response_has_no_length() {
        let (frame, harness) = frame(TestApp::default(), ConnLimits::default());

        harness
            .input
            .write(b"HEAD /silent HTTP/1.1\r\n\r\nGET /silent HTTP/1.1\r\n\r\n")
            .unwrap();
        harness.input.complete_writing();
        frame.run().await;

        assert_eq!(
            harness.output(),
            "HTTP/1.1 200 OK\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn http10_closes_after_response() {
        let (frame, harness) = frame(TestApp::default(), ConnLimits::default());

        harness
            .input
            .write(b"GET /one HTTP/1.0\r\n\r\nGET /two HTTP/1.0\r\n\r\n")
            .unwrap();
        frame.run().await;

        assert_eq!(
            harness.output(),
            "HTTP/1.1 200 OK\r\nContent-Length: 9\r\nConnection: close\r\n\r\nGET /one "
        );
    }

    #[tokio::test]
    async fn malformed_requests_are_rejected() {
        #[rustfmt::skip]
        let cases: [(&[u8], &str); 4] = [
            (b"GET / HTTP/1.1\r\nbad header\r\n\r\n", "400 Bad Request"),
            (b"GET / HTTP/3.0\r\n\r\n",               "505 HTTP Version Not Supported"),
            (b"GET / HTTP/1.1\r\nHost: x\r\n",        "400 Bad Request"),
            (b"GET /trunc",                           "400 Bad Request"),
        ];

        for (src, status) in cases {
            let (frame, harness) = frame(TestApp::default(), ConnLimits::default());
            harness.input.write(src).unwrap();
            harness.input.complete_writing();
            frame.run().await;

            assert_eq!(
                harness.output(),
                format!("HTTP/1.1 {status}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
            );
            assert_eq!(harness.events.take(), [format!("rejected {}", &status[..3])]);
        }
    }

    #[tokio::test]
    async fn application_failures_close_without_response() {
        for path in ["/fail", "/panic"] {
            let (frame, harness) = frame(TestApp::default(), ConnLimits::default());
            let services = frame.services.clone();

            harness
                .input
                .write(format!("GET {path} HTTP/1.1\r\n\r\nGET /next HTTP/1.1\r\n\r\n").as_bytes())
                .unwrap();
            harness.input.complete_writing();
            frame.run().await;

            assert_eq!(harness.output(), "");
            assert_eq!(services.app.created.load(Ordering::Relaxed), 1);
            assert_eq!(services.app.disposed_with_error.load(Ordering::Relaxed), 1);

            let events = harness.events.take();
            assert_eq!(events.len(), 1);
            assert!(events[0].starts_with("app error"), "{events:?}");
        }
    }

    #[tokio::test]
    async fn panics_outside_process_stay_contained() {
        let empty = "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_owned();
        let next = ok("GET /next ");

        #[rustfmt::skip]
        let cases = [
            // path               output                                disposed  app error
            ("/panic-create",    String::new(),                         0,        true),
            ("/panic-starting",  String::new(),                         1,        true),
            ("/panic-completed", empty + &next,                         2,        false),
            ("/panic-dispose",   ok("GET /panic-dispose ") + &next,     2,        false),
        ];

        for (path, output, disposed, app_error) in cases {
            let (frame, harness) = frame(TestApp::default(), ConnLimits::default());
            let services = frame.services.clone();

            harness
                .input
                .write(format!("GET {path} HTTP/1.1\r\n\r\nGET /next HTTP/1.1\r\n\r\n").as_bytes())
                .unwrap();
            harness.input.complete_writing();
            frame.run().await;

            assert_eq!(harness.output(), output, "{path}");
            assert!(harness.output.is_completed(), "{path}");
            assert_eq!(services.app.disposed.load(Ordering::Relaxed), disposed, "{path}");

            let events = harness.events.take();
            assert_eq!(
                events.iter().any(|event| event.starts_with("app error")),
                app_error,
                "{path}: {events:?}"
            );
        }
    }

    #[tokio::test]
    async fn failure_after_start_aborts() {
        let (frame, harness) = frame(TestApp::default(), ConnLimits::default());

        harness.input.write(b"GET /fail-late HTTP/1.1\r\n\r\n").unwrap();
        harness.input.complete_writing();
        frame.run().await;

        assert_eq!(harness.abort.state(), AbortState::AbortedByApp);
    }

    #[tokio::test]
    async fn short_body_aborts() {
        let (frame, harness) = frame(TestApp::default(), ConnLimits::default());

        harness.input.write(b"GET /short HTTP/1.1\r\n\r\n").unwrap();
        harness.input.complete_writing();
        frame.run().await;

        assert_eq!(harness.abort.state(), AbortState::AbortedByApp);
    }

    #[tokio::test]
    async fn starting_callback_fires_at_finalization() {
        let (frame, harness) = frame(TestApp::default(), ConnLimits::default());

        harness.input.write(b"GET /late-header HTTP/1.1\r\n\r\n").unwrap();
        harness.input.complete_writing();
        frame.run().await;

        assert_eq!(
            harness.output(),
            "HTTP/1.1 200 OK\r\nX-Late: 1\r\nContent-Length: 0\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn idle_connection_times_out() {
        let limits = ConnLimits {
            keep_alive_timeout: Duration::from_millis(50),
            ..ConnLimits::default()
        };
        let (frame, harness) = frame(TestApp::default(), limits);

        tokio::time::timeout(Duration::from_secs(5), frame.run())
            .await
            .expect("keep-alive timeout did not end the connection");
        assert_eq!(harness.output(), "");
        assert!(harness.output.is_completed());
    }

    #[tokio::test]
    async fn shutdown_ends_idle_connection() {
        let (frame, harness) = frame(TestApp::default(), ConnLimits::default());

        harness.input.write(b"GET /a HTTP/1.1\r\n\r\n").unwrap();
        tokio::join!(frame.run(), async {
            tokio::task::yield_now().await;
            let _ = harness.shutdown.send(true);
        });

        // The request that was already buffered is answered first.
        assert_eq!(harness.output(), ok("GET /a "));
    }

    #[test]
    fn panic_messages() {
        #[rustfmt::skip]
        let cases: [(Box<dyn Any + Send>, &str); 3] = [
            (Box::new("static"), "application panicked: static"),
            (Box::new(String::from("owned")), "application panicked: owned"),
            (Box::new(42), "application panicked: unknown panic payload"),
        ];

        for (payload, expected) in cases {
            assert_eq!(panic_error(payload).to_string(), expected);
        }
    }
}
