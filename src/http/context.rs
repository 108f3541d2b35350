use crate::{
    errors::{Error, ErrorKind},
    events::{ConnectionInfo, Endpoint},
    http::{
        body::MessageBody,
        request::{FrameInput, RequestHead},
        response::{Response, ResponseHead},
        types::{HeaderMap, Method, StatusCode, Version},
    },
    limits::ReqLimits,
    memory::channel::ChannelWriter,
    server::{connection::AbortHandle, frame::panic_error},
    HandlerError,
};
use std::{
    panic::{self, AssertUnwindSafe},
    rc::Rc,
};

type StartingCallback = Box<dyn FnOnce(&mut ResponseHead) -> Result<(), HandlerError>>;
type CompletedCallback = Box<dyn FnOnce() -> Result<(), HandlerError>>;

/// Whether the application may use the request and response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    Open,
    /// The handler returned; callbacks are running.
    Paused,
    /// The request is complete.
    Stopped,
}

/// Request and response of the request currently being processed.
///
/// Passed to [`Application::process`](crate::Application::process). Body
/// reads and writes are only possible while the handler runs.
///
/// # Examples
/// ```
/// use shard_web::{Error, HttpContext, StatusCode};
///
/// async fn echo(http: &mut HttpContext) -> Result<(), Error> {
///     http.set_status(StatusCode::Ok)?;
///     http.response_headers_mut()?.insert("Content-Type", "text/plain");
///
///     let mut buf = [0; 1024];
///     loop {
///         match http.read_body(&mut buf).await? {
///             0 => return Ok(()),
///             n => http.write(&buf[..n]).await?,
///         }
///     }
/// }
/// ```
pub struct HttpContext {
    pub(crate) info: Rc<ConnectionInfo>,
    pub(crate) head: RequestHead,
    pub(crate) input: FrameInput,
    pub(crate) body: MessageBody,
    pub(crate) output: ChannelWriter,
    pub(crate) response: Response,

    on_starting: Vec<StartingCallback>,
    on_completed: Vec<CompletedCallback>,

    pub(crate) application_error: Option<HandlerError>,
    /// Malformed request body seen while the application read it.
    pub(crate) rejection: Option<ErrorKind>,
    pub(crate) keep_alive: bool,
    pub(crate) streams: StreamState,
    pub(crate) abort: AbortHandle,
    add_server_header: bool,
}

impl HttpContext {
    pub(crate) fn new(
        info: Rc<ConnectionInfo>,
        input: FrameInput,
        output: ChannelWriter,
        abort: AbortHandle,
        limits: &ReqLimits,
        add_server_header: bool,
    ) -> Self {
        Self {
            info,
            head: RequestHead::new(limits),
            input,
            body: MessageBody::empty(),
            output,
            response: Response::new(),

            on_starting: Vec::new(),
            on_completed: Vec::new(),

            application_error: None,
            rejection: None,
            keep_alive: false,
            streams: StreamState::Stopped,
            abort,
            add_server_header,
        }
    }

    /// Prepares for the next request on the connection. Buffered input is kept.
    pub(crate) fn reset(&mut self) {
        self.head.reset();
        self.body = MessageBody::empty();
        self.response = Response::new();
        self.on_starting.clear();
        self.on_completed.clear();
        self.application_error = None;
        self.rejection = None;
        self.keep_alive = false;
        self.streams = StreamState::Stopped;
    }

    #[inline]
    fn ensure_open(&self) -> Result<(), Error> {
        match self.streams == StreamState::Open && !self.abort.is_aborted() {
            true => Ok(()),
            false => Err(Error::StreamClosed),
        }
    }
}

/// Connection and request line
impl HttpContext {
    #[inline]
    pub fn connection_id(&self) -> &str {
        self.info.id()
    }

    #[inline]
    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.info
    }

    #[inline]
    pub fn remote_endpoint(&self) -> &Endpoint {
        self.info.remote_endpoint()
    }

    #[inline]
    pub fn local_endpoint(&self) -> &Endpoint {
        self.info.local_endpoint()
    }

    #[inline]
    pub fn method(&self) -> &Method {
        &self.head.method
    }

    /// Request target as received, e.g. `/search?q=rust`.
    #[inline]
    pub fn target(&self) -> &str {
        &self.head.target
    }

    /// Target without the query string.
    #[inline]
    pub fn path(&self) -> &str {
        self.head.path()
    }

    /// Text after the first `?` of the target, if any.
    #[inline]
    pub fn query(&self) -> Option<&str> {
        self.head.query()
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.head.version
    }

    #[inline]
    pub fn request_headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// Reads decoded request body bytes. Returns `0` at the end of the body.
    ///
    /// A malformed body ends the connection after the handler returns; if
    /// no response was started the client receives `400 Bad Request`.
    pub async fn read_body(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.ensure_open()?;

        match self.body.read(&mut self.input, buf).await {
            Ok(n) => Ok(n),
            Err(kind) => {
                self.keep_alive = false;
                if kind != ErrorKind::StreamClosed {
                    self.rejection = Some(kind);
                }
                Err(kind.into())
            }
        }
    }
}

/// Response
impl HttpContext {
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.response.head.status
    }

    /// Fails with [`Error::ResponseStarted`] once the head was written.
    #[inline]
    pub fn set_status(&mut self, status: StatusCode) -> Result<(), Error> {
        if self.response.has_started() {
            return Err(Error::ResponseStarted);
        }
        self.response.head.status = status;
        Ok(())
    }

    #[inline]
    pub fn response_headers(&self) -> &HeaderMap {
        &self.response.head.headers
    }

    /// Without a `Content-Length` header an `HTTP/1.1` response body is
    /// sent chunked. `Connection` and `Transfer-Encoding` are managed by
    /// the server; a `Connection: close` value still closes the connection.
    #[inline]
    pub fn response_headers_mut(&mut self) -> Result<&mut HeaderMap, Error> {
        if self.response.has_started() {
            return Err(Error::ResponseStarted);
        }
        Ok(&mut self.response.head.headers)
    }

    /// `true` once the response head was handed to the connection.
    #[inline]
    pub fn has_started(&self) -> bool {
        self.response.has_started()
    }

    /// Registers a callback run right before the response head is written.
    ///
    /// Callbacks run once, most recently registered first. A failing
    /// callback stops the rest and is recorded as an application error.
    pub fn on_starting<F>(&mut self, callback: F)
    where
        F: FnOnce(&mut ResponseHead) -> Result<(), HandlerError> + 'static,
    {
        self.on_starting.push(Box::new(callback));
    }

    /// Registers a callback run after the handler returned, most recently
    /// registered first. Failures are logged.
    pub fn on_completed<F>(&mut self, callback: F)
    where
        F: FnOnce() -> Result<(), HandlerError> + 'static,
    {
        self.on_completed.push(Box::new(callback));
    }

    /// Writes response body bytes, starting the response first if needed.
    ///
    /// Waits while the connection output buffer is full.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.ensure_open()?;
        if !self.response.has_started() {
            self.start_response()?;
        }

        self.response.write_body(&self.output, bytes)?;
        self.output.wait_for_space().await;
        Ok(())
    }

    /// Starts the response if needed and waits until every written byte
    /// was sent to the socket.
    pub async fn flush(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        if !self.response.has_started() {
            self.start_response()?;
        }

        self.output.drained().await;
        match self.abort.is_aborted() {
            true => Err(Error::StreamClosed),
            false => Ok(()),
        }
    }

    /// Drops the connection without completing the response. The peer
    /// sees a reset.
    pub fn abort(&mut self) {
        if self.abort.abort_by_app() {
            tracing::debug!(connection_id = %self.info.id, "connection aborted by application");
        }
        self.keep_alive = false;
        self.output.abort();
    }
}

/// Request loop support
impl HttpContext {
    pub(crate) fn start_response(&mut self) -> Result<(), Error> {
        if let Err(err) = self.fire_on_starting() {
            self.application_error = Some(err);
            return Err(Error::StartingCallback);
        }

        self.response.start(
            self.head.version,
            &self.head.method,
            &mut self.keep_alive,
            self.add_server_header,
            &self.output,
        )
    }

    /// A panicking callback counts as a failed one.
    pub(crate) fn fire_on_starting(&mut self) -> Result<(), HandlerError> {
        while let Some(callback) = self.on_starting.pop() {
            let head = &mut self.response.head;
            let result = panic::catch_unwind(AssertUnwindSafe(|| callback(head)))
                .unwrap_or_else(|payload| Err(panic_error(payload)));

            if let Err(err) = result {
                self.on_starting.clear();
                return Err(err);
            }
        }
        Ok(())
    }

    pub(crate) fn fire_on_completed(&mut self) {
        while let Some(callback) = self.on_completed.pop() {
            let result = panic::catch_unwind(AssertUnwindSafe(callback))
                .unwrap_or_else(|payload| Err(panic_error(payload)));

            if let Err(err) = result {
                tracing::warn!(
                    connection_id = %self.info.id,
                    error = %err,
                    "response completed callback failed"
                );
            }
        }
    }

    /// Writes the end of the response. Returns `false` if the response
    /// could not be completed and the connection has to be dropped.
    pub(crate) fn produce_end(&mut self) -> Result<bool, Error> {
        if self.application_error.is_some() || self.rejection.is_some() {
            if self.response.has_started() {
                // The head is on the wire, nothing can fix it now.
                return Ok(false);
            }
            self.keep_alive = false;
            return Ok(true);
        }

        if !self.response.has_started() {
            if self.response.head.status.allows_body()
                && self.head.method != Method::Head
                && !self.response.head.headers.contains("content-length")
                && !self.response.head.headers.contains("transfer-encoding")
            {
                self.response.head.headers.insert("Content-Length", "0");
            }
            self.start_response()?;
        }

        self.response.finish(&self.output)
    }
}

#[cfg(test)]
mod context_tests {
    use super::*;
    use crate::{
        http::request::test_input,
        memory::channel::{byte_channel, test_pool, ChannelReader},
        tools::str_op,
    };
    use std::{cell::RefCell, path::PathBuf};

    fn context(request: &[u8]) -> (HttpContext, ChannelReader) {
        let limits = ReqLimits::default();
        let (writer, reader) = byte_channel(test_pool(), None);
        let info = Rc::new(ConnectionInfo {
            id: "0000000000001".into(),
            server_address: "unix:/tmp/test.sock".into(),
            remote: Endpoint::Unix(None),
            local: Endpoint::Unix(Some(PathBuf::from("/tmp/test.sock"))),
        });

        let mut http = HttpContext::new(
            info,
            test_input(request, true, &limits),
            writer,
            AbortHandle::default(),
            &limits,
            false,
        );

        let mut parser = crate::http::request::Parser::new(&limits);
        http.input.fill();
        parser.take_start_line(&mut http.input, &mut http.head).unwrap();
        parser
            .take_message_headers(&mut http.input, &mut http.head.headers)
            .unwrap();
        http.body = MessageBody::for_request(http.head.version, &http.head.headers).unwrap();
        http.keep_alive = http.body.keep_alive();
        http.streams = StreamState::Open;

        (http, reader)
    }

    fn output(reader: &ChannelReader) -> String {
        let mut buf = vec![0; 4096];
        let n = reader.read(&mut buf);
        str_op(&buf[..n]).to_owned()
    }

    #[tokio::test]
    async fn request_accessors_and_body() {
        let (mut http, _) = context(b"POST /items?sort=asc HTTP/1.1\r\nContent-Length: 4\r\n\r\ndata");

        assert_eq!(http.method(), &Method::Post);
        assert_eq!(http.path(), "/items");
        assert_eq!(http.query(), Some("sort=asc"));
        assert_eq!(http.request_headers().get("content-length"), Some("4"));
        assert_eq!(http.connection_id(), "0000000000001");
        assert_eq!(http.connection_info().server_address(), "unix:/tmp/test.sock");

        let mut buf = [0; 16];
        assert_eq!(http.read_body(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf[..4], b"data");
        assert_eq!(http.read_body(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn starting_callbacks_run_lifo_once() {
        let (mut http, reader) = context(b"GET / HTTP/1.1\r\n\r\n");
        let order = Rc::new(RefCell::new(Vec::new()));

        for name in ["first", "second"] {
            let order = order.clone();
            http.on_starting(move |head| {
                order.borrow_mut().push(name);
                head.headers.append("X-Callback", name);
                Ok(())
            });
        }

        http.write(b"hi").await.unwrap();
        assert_eq!(*order.borrow(), ["second", "first"]);
        assert!(http.has_started());
        assert!(matches!(http.set_status(StatusCode::NotFound), Err(Error::ResponseStarted)));
        assert!(http.response_headers_mut().is_err());

        assert!(http.produce_end().unwrap());
        assert_eq!(order.borrow().len(), 2);
        assert_eq!(
            output(&reader),
            "HTTP/1.1 200 OK\r\nX-Callback: second\r\nX-Callback: first\r\n\
             Transfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn failing_starting_callback_blocks_response() {
        let (mut http, reader) = context(b"GET / HTTP/1.1\r\n\r\n");
        http.on_starting(|_| Ok(()));
        http.on_starting(|_| Err("no".into()));

        assert!(matches!(http.write(b"x").await, Err(Error::StartingCallback)));
        assert!(!http.has_started());
        assert!(http.application_error.is_some());

        // The request loop turns this into a closed connection.
        assert!(http.produce_end().unwrap());
        assert!(!http.keep_alive);
        assert_eq!(output(&reader), "");
    }

    #[test]
    fn completed_callbacks_all_run() {
        let (mut http, _) = context(b"GET / HTTP/1.1\r\n\r\n");
        let count = Rc::new(RefCell::new(0));

        for fail in [false, true, false] {
            let count = count.clone();
            http.on_completed(move || {
                *count.borrow_mut() += 1;
                match fail {
                    true => Err("callback failed".into()),
                    false => Ok(()),
                }
            });
        }

        http.fire_on_completed();
        assert_eq!(*count.borrow(), 3);
    }

    #[test]
    fn empty_response_gets_length() {
        let (mut http, reader) = context(b"GET / HTTP/1.1\r\n\r\n");
        http.set_status(StatusCode::Accepted).unwrap();

        assert!(http.produce_end().unwrap());
        assert_eq!(output(&reader), "HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\n\r\n");
        assert!(http.keep_alive);
    }

    #[tokio::test]
    async fn flush_waits_for_output() {
        let (mut http, reader) = context(b"GET / HTTP/1.1\r\n\r\n");
        http.response_headers_mut().unwrap().insert("Content-Length", "2");
        http.write(b"ok").await.unwrap();
        assert_eq!(http.response_headers().get("content-length"), Some("2"));

        let (flushed, sent) = tokio::join!(http.flush(), async {
            tokio::task::yield_now().await;
            output(&reader)
        });
        assert!(flushed.is_ok());
        assert_eq!(sent, "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
    }

    #[tokio::test]
    async fn abort_closes_streams() {
        let (mut http, _) = context(b"GET / HTTP/1.1\r\n\r\n");
        http.abort();

        assert!(http.abort.is_aborted());
        assert!(!http.keep_alive);
        assert!(matches!(http.write(b"x").await, Err(Error::StreamClosed)));
    }

    #[tokio::test]
    async fn paused_streams_reject_io() {
        let (mut http, _) = context(b"POST / HTTP/1.1\r\nContent-Length: 1\r\n\r\nx");
        http.streams = StreamState::Paused;

        let mut buf = [0; 1];
        assert!(matches!(http.read_body(&mut buf).await, Err(Error::StreamClosed)));
        assert!(matches!(http.write(b"x").await, Err(Error::StreamClosed)));
    }
}
