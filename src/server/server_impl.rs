use crate::{
    errors::Error,
    events::{Endpoint, EventSink, TracingEvents},
    http::context::HttpContext,
    limits::{BufferLimits, ConnLimits, ReqLimits, ServerLimits},
    memory::pool::MemoryPool,
    server::{
        listener::{ListenOptions, Listener, LocalDispatcher},
        platform::{HandleMigration, MigrationGate},
        sharding::{ListenerPrimary, ListenerSecondary},
        worker::Worker,
    },
};
use std::{future::Future, sync::Arc, time::Duration};

/// Error returned by [`Application::process`] and by response callbacks.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);

/// The request handler of a server.
///
/// For every request the server calls [`create_context`](Self::create_context),
/// then [`process`](Self::process), then [`dispose_context`](Self::dispose_context),
/// even when `process` fails or panics.
///
/// Handlers run on worker threads that each drive many connections, so
/// `process` must not block.
///
/// # Errors
///
/// An error (or panic) from `process` is reported to the
/// [`EventSink`](crate::EventSink) and closes the connection. Whatever part
/// of the response was already written is all the client gets; a response
/// that never started is not replaced by an error page.
///
/// # Examples
///
/// ```
/// use shard_web::{Application, HandlerError, HttpContext, StatusCode};
///
/// struct Greeter;
///
/// impl Application for Greeter {
///     type Context = ();
///
///     fn create_context(&self, _: &HttpContext) {}
///
///     async fn process(&self, _: &mut (), http: &mut HttpContext) -> Result<(), HandlerError> {
///         if http.path() != "/hello" {
///             http.set_status(StatusCode::NotFound)?;
///             return Ok(());
///         }
///
///         http.response_headers_mut()?.insert("Content-Type", "text/plain");
///         http.write(b"Hello!").await?;
///         Ok(())
///     }
/// }
/// ```
pub trait Application: Send + Sync + 'static {
    /// Per-request state.
    type Context: 'static;

    fn create_context(&self, http: &HttpContext) -> Self::Context;

    fn process(
        &self,
        context: &mut Self::Context,
        http: &mut HttpContext,
    ) -> impl Future<Output = Result<(), HandlerError>>;

    /// Called once the response is complete, with the error `process` (or a
    /// response callback) produced, if any.
    #[inline]
    fn dispose_context(&self, context: Self::Context, error: Option<&HandlerError>) {
        let _ = (context, error);
    }
}

/// Everything a connection needs from the server, shared by all workers.
pub(crate) struct ServiceContext<A: Application> {
    pub(crate) app: A,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) conn_limits: ConnLimits,
    pub(crate) req_limits: ReqLimits,
    pub(crate) add_server_header: bool,
    pub(crate) migration: MigrationGate,
}

/// A configured server, ready to [`start`](Self::start).
///
/// # Examples
///
/// ```no_run
/// # shard_web::impl_default_application!{ MyApp }
/// use shard_web::{ListenOptions, Server};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let server = Server::builder()
///         .listen(ListenOptions::tcp("127.0.0.1:8080".parse().unwrap()))
///         .application(MyApp) // structure with Application implementation
///         .build()
///         .start()
///         .await
///         .unwrap();
///
///     tokio::time::sleep(Duration::from_secs(60)).await;
///     server.shutdown().await.unwrap();
/// }
/// ```
pub struct Server<A: Application> {
    services: Arc<ServiceContext<A>>,
    listen: Vec<ListenOptions>,
    server_limits: ServerLimits,
    buffer_limits: BufferLimits,
}

impl<A: Application> Server<A> {
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder() -> ServerBuilder<A> {
        ServerBuilder {
            listen: Vec::new(),
            application: None,
            events: None,
            migration: None,

            server_limits: None,
            connection_limits: None,
            request_limits: None,
            buffer_limits: None,
        }
    }

    /// Spawns the workers and starts listening on every address.
    ///
    /// With one worker each address gets a plain listener. With more, the
    /// first worker accepts and shares connections with the others; this
    /// call returns once every worker is reachable.
    ///
    /// # Errors
    ///
    /// Bind failures and invalid addresses are returned here; whatever was
    /// already started is shut down again.
    pub async fn start(self) -> Result<RunningServer, Error> {
        let Self {
            services,
            listen,
            server_limits,
            buffer_limits,
        } = self;

        let pool = Arc::new(MemoryPool::new(&buffer_limits));
        let worker_count = server_limits.clamped_worker_count();

        let mut server = RunningServer {
            workers: Vec::with_capacity(worker_count),
            primaries: Vec::new(),
            secondaries: Vec::new(),
            local_addrs: Vec::new(),
            shutdown_timeout: server_limits.shutdown_timeout,
        };
        for index in 0..worker_count {
            server.workers.push(Worker::spawn(index, pool.clone())?);
        }

        for options in listen {
            if let Err(err) = server.listen(options, &services, &server_limits).await {
                tracing::error!(error = %err, "failed to start listener");
                let _ = server.shutdown().await;
                return Err(err);
            }
        }

        tracing::info!(
            workers = worker_count,
            addresses = ?server.local_addrs,
            "server started"
        );
        Ok(server)
    }
}

//

/// Builder for configuring and creating [`Server`] instances.
pub struct ServerBuilder<A: Application> {
    listen: Vec<ListenOptions>,
    application: Option<A>,
    events: Option<Arc<dyn EventSink>>,
    migration: Option<Box<dyn HandleMigration>>,

    server_limits: Option<ServerLimits>,
    connection_limits: Option<ConnLimits>,
    request_limits: Option<ReqLimits>,
    buffer_limits: Option<BufferLimits>,
}

impl<A: Application> ServerBuilder<A> {
    /// Adds an address to listen on. May be called several times.
    ///
    /// **At least one call is required.**
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # shard_web::impl_default_application!{ MyApp }
    /// use shard_web::{ListenAddress, ListenOptions, Server};
    ///
    /// let mut builder = Server::builder()
    ///     .listen(ListenOptions::tcp("0.0.0.0:8080".parse().unwrap()))
    ///     .listen(ListenOptions::unix("/run/my_app.sock"))
    ///     .application(MyApp);
    ///
    /// if let Some(address) = ListenAddress::from_systemd() {
    ///     builder = builder.listen(ListenOptions::new(address));
    /// }
    /// let server = builder.build();
    /// ```
    #[inline(always)]
    pub fn listen(mut self, options: ListenOptions) -> Self {
        self.listen.push(options);
        self
    }

    /// Sets the application that processes requests.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn application(mut self, application: A) -> Self {
        self.application = Some(application);
        self
    }

    /// Replaces the default [`TracingEvents`] sink.
    #[inline(always)]
    pub fn events(mut self, events: impl EventSink) -> Self {
        self.events = Some(Arc::new(events));
        self
    }

    /// Installs a [`HandleMigration`] used when connections move between
    /// workers. Without one, sockets move as they are.
    #[inline(always)]
    pub fn handle_migration(mut self, migration: impl HandleMigration) -> Self {
        self.migration = Some(Box::new(migration));
        self
    }

    /// Configures workers and shutdown.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # shard_web::impl_default_application!{ MyApp }
    /// use shard_web::{ListenOptions, Server, limits::ServerLimits};
    /// use std::time::Duration;
    ///
    /// let server = Server::builder()
    ///     .listen(ListenOptions::tcp("127.0.0.1:8080".parse().unwrap()))
    ///     .application(MyApp)
    ///     .server_limits(ServerLimits {
    ///         // Your changes
    ///         worker_count: 8,
    ///         shutdown_timeout: Duration::from_secs(30),
    ///         ..ServerLimits::default() // Required line
    ///     })
    ///     .build();
    /// ```
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures keep-alive and per-connection buffering.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # shard_web::impl_default_application!{ MyApp }
    /// use shard_web::{ListenOptions, Server, limits::ConnLimits};
    /// use std::time::Duration;
    ///
    /// let server = Server::builder()
    ///     .listen(ListenOptions::tcp("127.0.0.1:8080".parse().unwrap()))
    ///     .application(MyApp)
    ///     .connection_limits(ConnLimits {
    ///         // Your changes
    ///         keep_alive_timeout: Duration::from_secs(10),
    ///         max_request_buffer_size: Some(64 * 1024),
    ///         ..ConnLimits::default() // Required line
    ///     })
    ///     .build();
    /// ```
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Configures request line and header limits.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Configures the shared buffer pool.
    #[inline(always)]
    pub fn buffer_limits(mut self, limits: BufferLimits) -> Self {
        self.buffer_limits = Some(limits);
        self
    }

    /// Finalizes the builder and constructs a [`Server`] instance.
    ///
    /// # Panics
    ///
    /// Error messages:
    /// - ``The `listen` method must be called to create``
    /// - ``The `application` method must be called to create``
    ///
    /// Panics when:
    /// - The `listen` method was not called.
    /// - The `application` method was not called.
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server<A> {
        assert!(
            !self.listen.is_empty(),
            "The `listen` method must be called to create"
        );
        let app = self
            .application
            .expect("The `application` method must be called to create");

        let server_limits = self.server_limits.unwrap_or_default();
        let migration = match self.migration {
            Some(migration) => MigrationGate::new(migration),
            None => MigrationGate::disabled(),
        };

        let services = ServiceContext {
            app,
            events: self.events.unwrap_or_else(|| Arc::new(TracingEvents)),
            conn_limits: self.connection_limits.unwrap_or_default(),
            req_limits: self.request_limits.unwrap_or_default(),
            add_server_header: server_limits.add_server_header,
            migration,
        };

        Server {
            services: Arc::new(services),
            listen: self.listen,
            server_limits,
            buffer_limits: self.buffer_limits.unwrap_or_default(),
        }
    }
}

//

enum PrimaryListener {
    Single(Listener),
    Sharded(ListenerPrimary),
}

impl PrimaryListener {
    async fn dispose(&mut self) {
        match self {
            Self::Single(listener) => listener.dispose().await,
            Self::Sharded(primary) => primary.dispose().await,
        }
    }
}

/// A started server. Dropping it stops the workers without waiting for
/// connections; prefer [`shutdown`](Self::shutdown).
pub struct RunningServer {
    workers: Vec<Worker>,
    primaries: Vec<PrimaryListener>,
    secondaries: Vec<ListenerSecondary>,
    local_addrs: Vec<Endpoint>,
    shutdown_timeout: Duration,
}

impl RunningServer {
    /// Bound addresses, in the order they were added; port `0` is
    /// resolved to the actual port.
    #[inline]
    pub fn local_addrs(&self) -> &[Endpoint] {
        &self.local_addrs
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    async fn listen<A: Application>(
        &mut self,
        options: ListenOptions,
        services: &Arc<ServiceContext<A>>,
        limits: &ServerLimits,
    ) -> Result<(), Error> {
        let Some((first, rest)) = self.workers.split_first() else {
            return Err(Error::WorkerStopped);
        };

        if rest.is_empty() {
            let mut listener = Listener::new(options);
            let services = services.clone();
            listener
                .start(first, move |ctx, address| {
                    Ok(LocalDispatcher::new(ctx, services, address))
                })
                .await?;

            self.local_addrs.extend(listener.local_endpoint().cloned());
            self.primaries.push(PrimaryListener::Single(listener));
            return Ok(());
        }

        let primary = ListenerPrimary::start(options, first, services.clone(), limits).await?;
        let address = primary
            .local_endpoint()
            .map(ToString::to_string)
            .unwrap_or_default();

        let mut secondaries = Vec::with_capacity(rest.len());
        for worker in rest {
            let secondary =
                ListenerSecondary::start(primary.pipe_path(), worker, services.clone(), address.clone())
                    .await?;
            secondaries.push(secondary);
        }

        if !primary.wait_for_targets(rest.len(), REGISTRATION_TIMEOUT).await {
            tracing::warn!(
                expected = rest.len(),
                registered = primary.dispatch_target_count(),
                "not every secondary registered in time"
            );
        }

        self.local_addrs.extend(primary.local_endpoint().cloned());
        self.primaries.push(PrimaryListener::Sharded(primary));
        self.secondaries.extend(secondaries);
        Ok(())
    }

    /// Stops accepting, then gives open connections up to
    /// [`ServerLimits::shutdown_timeout`] to finish.
    ///
    /// # Errors
    ///
    /// [`Error::ShutdownTimedOut`] when connections had to be abandoned.
    pub async fn shutdown(mut self) -> Result<(), Error> {
        // Primaries first: nothing is handed to a secondary that is closing.
        for primary in &mut self.primaries {
            primary.dispose().await;
        }
        for secondary in &mut self.secondaries {
            secondary.dispose().await;
        }

        for worker in &self.workers {
            worker.request_stop(self.shutdown_timeout);
        }

        let mut leaked = 0;
        let mut result = Ok(());
        for worker in &mut self.workers {
            match worker.join().await {
                Ok(()) => {}
                Err(Error::ShutdownTimedOut { leaked: count }) => leaked += count,
                Err(err) => result = Err(err),
            }
        }

        tracing::info!(leaked, "server stopped");
        match leaked {
            0 => result,
            leaked => Err(Error::ShutdownTimedOut { leaked }),
        }
    }
}
