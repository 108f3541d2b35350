use crate::{
    errors::Error,
    events::Endpoint,
    server::{
        connection::Connection,
        server_impl::{Application, ServiceContext},
        stream::Stream,
        worker::{Worker, WorkerContext},
    },
};
use socket2::{Domain, SockAddr, Socket, Type};
use std::{
    fmt, fs, io,
    net::SocketAddr,
    os::fd::{FromRawFd, OwnedFd, RawFd},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::{TcpListener, UnixListener},
    sync::{oneshot, watch},
};

const BACKLOG: i32 = 128;
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(10);
/// First descriptor passed by systemd socket activation.
const SD_LISTEN_FDS_START: RawFd = 3;

/// Where a server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    Tcp(SocketAddr),
    /// Unix domain socket at an absolute path. The file is created on start
    /// and removed when the listener is disposed.
    Unix(PathBuf),
    /// An already listening socket inherited from the parent process.
    ///
    /// The server takes ownership of the descriptor and closes it on shutdown.
    Fd(RawFd),
}

impl ListenAddress {
    /// The socket passed by systemd socket activation, if `LISTEN_PID`
    /// names this process.
    pub fn from_systemd() -> Option<Self> {
        let listen_pid = std::env::var("LISTEN_PID").ok();
        systemd_fd(std::process::id(), listen_pid.as_deref()).map(Self::Fd)
    }
}

fn systemd_fd(pid: u32, listen_pid: Option<&str>) -> Option<RawFd> {
    let listen_pid: u32 = listen_pid?.trim().parse().ok()?;
    (listen_pid == pid).then_some(SD_LISTEN_FDS_START)
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Fd(fd) => write!(f, "fd:{fd}"),
        }
    }
}

/// A listening address plus per-listener socket options.
///
/// # Examples
/// ```
/// use shard_web::{ListenAddress, ListenOptions};
///
/// let tcp = ListenOptions::tcp("127.0.0.1:8080".parse().unwrap());
/// assert!(tcp.no_delay);
///
/// let unix = ListenOptions::unix("/run/app.sock");
/// assert_eq!(unix.address, ListenAddress::Unix("/run/app.sock".into()));
/// ```
#[derive(Debug, Clone)]
pub struct ListenOptions {
    pub address: ListenAddress,
    /// Set `TCP_NODELAY` on accepted TCP connections (default: `true`).
    pub no_delay: bool,
}

impl ListenOptions {
    #[inline]
    pub fn new(address: ListenAddress) -> Self {
        Self {
            address,
            no_delay: true,
        }
    }

    #[inline]
    pub fn tcp(addr: SocketAddr) -> Self {
        Self::new(ListenAddress::Tcp(addr))
    }

    #[inline]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::new(ListenAddress::Unix(path.into()))
    }

    #[inline]
    pub fn fd(fd: RawFd) -> Self {
        Self::new(ListenAddress::Fd(fd))
    }
}

//

/// A bound, listening, non-blocking socket not yet owned by any reactor.
struct BoundListener {
    socket: Socket,
    local: Endpoint,
    /// Socket file created by this bind.
    unix_path: Option<PathBuf>,
}

impl BoundListener {
    fn bind(address: &ListenAddress) -> Result<Self, Error> {
        let (socket, unix_path) = match address {
            ListenAddress::Tcp(addr) => {
                let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, None)?;
                socket.set_reuse_address(true)?;
                socket.bind(&(*addr).into())?;
                socket.listen(BACKLOG)?;
                (socket, None)
            }
            ListenAddress::Unix(path) => {
                if !path.is_absolute() {
                    return Err(Error::InvalidAddress(format!(
                        "unix socket path must be absolute: {}",
                        path.display()
                    )));
                }
                let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
                socket.bind(&SockAddr::unix(path)?)?;
                if let Err(err) = socket.listen(BACKLOG) {
                    let _ = fs::remove_file(path);
                    return Err(err.into());
                }
                (socket, Some(path.clone()))
            }
            ListenAddress::Fd(fd) => {
                if *fd < 0 {
                    return Err(Error::InvalidAddress(format!("invalid descriptor: {fd}")));
                }
                // SAFETY: `ListenAddress::Fd` hands ownership of an open
                // listening descriptor to the server.
                (unsafe { Socket::from_raw_fd(*fd) }, None)
            }
        };

        socket.set_nonblocking(true)?;
        let local = endpoint_of(&socket)?;
        Ok(Self {
            socket,
            local,
            unix_path,
        })
    }
}

fn endpoint_of(socket: &Socket) -> io::Result<Endpoint> {
    let addr = socket.local_addr()?;
    Ok(match addr.as_socket() {
        Some(addr) => Endpoint::Tcp(addr),
        None => Endpoint::Unix(addr.as_pathname().map(Path::to_path_buf)),
    })
}

enum AcceptSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl AcceptSocket {
    /// Registers with the current worker's reactor.
    fn register(socket: Socket) -> io::Result<Self> {
        let is_unix = socket.local_addr().as_ref().is_ok_and(SockAddr::is_unix);
        let fd = OwnedFd::from(socket);

        Ok(match is_unix {
            true => Self::Unix(UnixListener::from_std(fd.into())?),
            false => Self::Tcp(TcpListener::from_std(fd.into())?),
        })
    }

    async fn accept(&self) -> io::Result<Stream> {
        match self {
            Self::Tcp(listener) => listener.accept().await.map(|(s, _)| Stream::Tcp(s)),
            Self::Unix(listener) => listener.accept().await.map(|(s, _)| Stream::Unix(s)),
        }
    }
}

//

/// Decides where an accepted connection runs.
pub(crate) trait Dispatch: 'static {
    async fn dispatch(&mut self, stream: Stream);
}

/// Runs every connection on the worker that accepted it.
pub(crate) struct LocalDispatcher<A: Application> {
    ctx: WorkerContext,
    services: Arc<ServiceContext<A>>,
    server_address: String,
}

impl<A: Application> LocalDispatcher<A> {
    pub(crate) fn new(
        ctx: &WorkerContext,
        services: Arc<ServiceContext<A>>,
        server_address: String,
    ) -> Self {
        Self {
            ctx: ctx.clone(),
            services,
            server_address,
        }
    }

    #[inline]
    pub(crate) fn services(&self) -> &Arc<ServiceContext<A>> {
        &self.services
    }

    pub(crate) fn start_connection(&self, stream: Stream) {
        match Connection::new(stream, &self.server_address, self.services.events.clone()) {
            Ok(connection) => connection.start(&self.ctx, self.services.clone()),
            // The peer is already gone.
            Err(err) => tracing::debug!(error = %err, "dropping connection without address"),
        }
    }
}

impl<A: Application> Dispatch for LocalDispatcher<A> {
    #[inline]
    async fn dispatch(&mut self, stream: Stream) {
        self.start_connection(stream);
    }
}

//

/// Asks a worker task to stop and waits until it has.
pub(crate) struct CloseHandle {
    close: watch::Sender<bool>,
    done: Option<oneshot::Receiver<()>>,
}

/// Held by the task; dropping it tells the [`CloseHandle`] the task ended.
pub(crate) struct CloseSignal {
    close: watch::Receiver<bool>,
    _done: oneshot::Sender<()>,
}

pub(crate) fn close_pair() -> (CloseHandle, CloseSignal) {
    let (close_tx, close_rx) = watch::channel(false);
    let (done_tx, done_rx) = oneshot::channel();

    let handle = CloseHandle {
        close: close_tx,
        done: Some(done_rx),
    };
    let signal = CloseSignal {
        close: close_rx,
        _done: done_tx,
    };
    (handle, signal)
}

impl CloseHandle {
    pub(crate) async fn close(&mut self) {
        let _ = self.close.send(true);
        if let Some(done) = self.done.take() {
            // An error means the task was dropped with its worker.
            let _ = done.await;
        }
    }
}

impl CloseSignal {
    /// Resolves once the close was requested or the handle dropped.
    pub(crate) async fn closed(&mut self) {
        let _ = self.close.wait_for(|close| *close).await;
    }
}

//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListenerState {
    Stopped,
    Listening,
    Disposing,
    Disposed,
}

/// Accept loop on one worker, feeding a [`Dispatch`] hook.
pub(crate) struct Listener {
    options: ListenOptions,
    state: ListenerState,
    local: Option<Endpoint>,
    unix_path: Option<PathBuf>,
    close: Option<CloseHandle>,
}

impl Listener {
    pub(crate) fn new(options: ListenOptions) -> Self {
        Self {
            options,
            state: ListenerState::Stopped,
            local: None,
            unix_path: None,
            close: None,
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> ListenerState {
        self.state
    }

    /// Bound address, once listening.
    #[inline]
    pub(crate) fn local_endpoint(&self) -> Option<&Endpoint> {
        self.local.as_ref()
    }

    /// Binds on the calling thread, then runs the accept loop on `worker`
    /// with the dispatcher `make_dispatcher` builds there.
    pub(crate) async fn start<D, F>(&mut self, worker: &Worker, make_dispatcher: F) -> Result<(), Error>
    where
        D: Dispatch,
        F: FnOnce(&WorkerContext, String) -> io::Result<D> + Send + 'static,
    {
        if self.state != ListenerState::Stopped {
            return Err(Error::InvalidAddress(format!(
                "{} is already started",
                self.options.address
            )));
        }

        let BoundListener {
            socket,
            local,
            unix_path,
        } = BoundListener::bind(&self.options.address)?;
        self.unix_path = unix_path;

        let (close, signal) = close_pair();
        let no_delay = self.options.no_delay;
        let server_address = local.to_string();

        let started = worker
            .run(move |ctx| -> io::Result<()> {
                let socket = AcceptSocket::register(socket)?;
                let dispatcher = make_dispatcher(ctx, server_address)?;
                ctx.spawn(accept_loop(socket, dispatcher, no_delay, signal));
                Ok(())
            })
            .await
            .and_then(|started| started.map_err(Error::from));

        if let Err(err) = started {
            self.remove_socket_file();
            self.state = ListenerState::Disposed;
            return Err(err);
        }

        tracing::info!(address = %local, worker = worker.index(), "listening");
        self.local = Some(local);
        self.close = Some(close);
        self.state = ListenerState::Listening;
        Ok(())
    }

    /// Stops accepting and closes the socket. Safe to call more than once.
    pub(crate) async fn dispose(&mut self) {
        match self.state {
            ListenerState::Stopped => {
                self.state = ListenerState::Disposed;
                return;
            }
            ListenerState::Listening => self.state = ListenerState::Disposing,
            ListenerState::Disposing | ListenerState::Disposed => return,
        }

        if let Some(mut close) = self.close.take() {
            close.close().await;
        }
        self.remove_socket_file();

        if let Some(local) = &self.local {
            tracing::debug!(address = %local, "listener disposed");
        }
        self.state = ListenerState::Disposed;
    }

    fn remove_socket_file(&mut self) {
        if let Some(path) = self.unix_path.take() {
            if let Err(err) = fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), error = %err, "failed to remove socket file");
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        // The accept loop sees the dropped close handle and exits.
        self.remove_socket_file();
    }
}

async fn accept_loop<D: Dispatch>(
    socket: AcceptSocket,
    mut dispatcher: D,
    no_delay: bool,
    mut signal: CloseSignal,
) {
    loop {
        // Only checked between dispatches, so a dispatch in flight completes.
        let accepted = tokio::select! {
            biased;
            _ = signal.closed() => break,
            accepted = socket.accept() => accepted,
        };

        match accepted {
            Ok(stream) => {
                if let Err(err) = stream.set_nodelay(no_delay) {
                    tracing::debug!(error = %err, "failed to set TCP_NODELAY");
                }
                dispatcher.dispatch(stream).await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
            }
        }
    }

    drop(socket);
    drop(dispatcher);
    drop(signal);
}

#[cfg(test)]
pub(crate) mod test_client {
    use std::net::SocketAddr;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    /// One `GET /` on a fresh connection; returns everything read until EOF.
    pub(crate) async fn get(addr: SocketAddr) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = b"GET / HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n";
        if stream.write_all(request).await.is_err() {
            return String::new();
        }

        let mut out = Vec::new();
        let _ = stream.read_to_end(&mut out).await;
        String::from_utf8_lossy(&out).into_owned()
    }
}

#[cfg(test)]
mod listener_tests {
    use super::{test_client::get, *};
    use crate::{
        events::recording::RecordingEvents,
        limits::{BufferLimits, ConnLimits},
        memory::pool::MemoryPool,
        server::frame::harness,
        HandlerError, HttpContext,
    };
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::UnixStream,
    };

    struct Hello;

    impl Application for Hello {
        type Context = ();

        fn create_context(&self, _: &HttpContext) {}

        async fn process(&self, _: &mut (), http: &mut HttpContext) -> Result<(), HandlerError> {
            http.response_headers_mut()?.insert("Content-Length", "5");
            http.write(b"hello").await?;
            Ok(())
        }
    }

    fn worker() -> Worker {
        Worker::spawn(0, Arc::new(MemoryPool::new(&BufferLimits::default()))).unwrap()
    }

    fn local(
        events: Arc<RecordingEvents>,
    ) -> impl FnOnce(&WorkerContext, String) -> io::Result<LocalDispatcher<Hello>> + Send + 'static
    {
        let services = harness::services(Hello, ConnLimits::default(), events);
        move |ctx, address| Ok(LocalDispatcher::new(ctx, services, address))
    }

    fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("shard_web-test-{name}-{:x}.sock", fastrand::u64(..)))
    }

    #[test]
    fn systemd_descriptor() {
        #[rustfmt::skip]
        let cases = [
            (42, Some("42"),   Some(3)),
            (42, Some(" 42 "), Some(3)),
            (42, Some("41"),   None),
            (42, Some("abc"),  None),
            (42, None,         None),
        ];

        for (pid, listen_pid, expected) in cases {
            assert_eq!(systemd_fd(pid, listen_pid), expected, "{listen_pid:?}");
        }
    }

    #[test]
    fn address_display() {
        #[rustfmt::skip]
        let cases = [
            (ListenAddress::Tcp("127.0.0.1:80".parse().unwrap()), "127.0.0.1:80"),
            (ListenAddress::Unix("/tmp/a.sock".into()),           "unix:/tmp/a.sock"),
            (ListenAddress::Fd(3),                                "fd:3"),
        ];

        for (address, expected) in cases {
            assert_eq!(address.to_string(), expected);
        }
    }

    #[tokio::test]
    async fn serves_tcp_connections() {
        let mut worker = worker();
        let events = Arc::new(RecordingEvents::default());

        let mut listener = Listener::new(ListenOptions::tcp("127.0.0.1:0".parse().unwrap()));
        listener.start(&worker, local(events.clone())).await.unwrap();
        assert_eq!(listener.state(), ListenerState::Listening);

        let Some(Endpoint::Tcp(addr)) = listener.local_endpoint().cloned() else {
            panic!("expected a tcp endpoint");
        };
        assert_ne!(addr.port(), 0);

        let response = get(addr).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.ends_with("\r\n\r\nhello"), "{response}");

        listener.dispose().await;
        worker.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(events.take(), ["start", "stop"]);
    }

    #[tokio::test]
    async fn unix_listener_removes_file_once() {
        let mut worker = worker();
        let path = socket_path("listener");

        let mut listener = Listener::new(ListenOptions::unix(&path));
        listener
            .start(&worker, local(Arc::default()))
            .await
            .unwrap();
        assert!(path.exists());

        let mut client = UnixStream::connect(&path).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.0\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.ends_with("hello"), "{response}");

        listener.dispose().await;
        assert_eq!(listener.state(), ListenerState::Disposed);
        assert!(!path.exists());
        assert!(UnixStream::connect(&path).await.is_err());

        listener.dispose().await;
        assert_eq!(listener.state(), ListenerState::Disposed);
        worker.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn dispose_closes_tcp_socket() {
        let mut worker = worker();

        let mut listener = Listener::new(ListenOptions::tcp("127.0.0.1:0".parse().unwrap()));
        listener.start(&worker, local(Arc::default())).await.unwrap();
        let Some(Endpoint::Tcp(addr)) = listener.local_endpoint().cloned() else {
            panic!("expected a tcp endpoint");
        };

        listener.dispose().await;
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
        worker.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn bind_errors_are_synchronous() {
        let mut worker = worker();

        let mut relative = Listener::new(ListenOptions::unix("relative.sock"));
        assert!(matches!(
            relative.start(&worker, local(Arc::default())).await,
            Err(Error::InvalidAddress(_))
        ));

        let mut first = Listener::new(ListenOptions::tcp("127.0.0.1:0".parse().unwrap()));
        first.start(&worker, local(Arc::default())).await.unwrap();
        let Some(Endpoint::Tcp(addr)) = first.local_endpoint().cloned() else {
            panic!("expected a tcp endpoint");
        };

        let mut second = Listener::new(ListenOptions::tcp(addr));
        assert!(matches!(
            second.start(&worker, local(Arc::default())).await,
            Err(Error::Io(_))
        ));

        first.dispose().await;
        worker.stop(Duration::from_secs(1)).await.unwrap();
    }
}
