//! One listening socket shared by every worker.
//!
//! The primary listener accepts all connections and hands some of them
//! to secondary workers over a Unix stream pipe (`SCM_RIGHTS`). Each
//! secondary connects to the pipe once at startup; the accepted pipe end
//! becomes its dispatch channel.
//!
//! ```text
//!   accept ──> DispatchTargets::next()
//!                 ├─ Local      -> connection on the primary's worker
//!                 └─ Remote(i)  -> sendmsg(channel i, [1,2,3,4] + fd)
//!                                    ├─ pipe full: serve locally
//!                                    └─ target gone: drop channel i
//! ```
//!
//! A channel whose secondary already closed its end is dropped before
//! anything is sent on it, and the connection goes to the next target.

use crate::{
    errors::Error,
    events::Endpoint,
    limits::ServerLimits,
    server::{
        listener::{
            close_pair, CloseHandle, CloseSignal, Dispatch, ListenOptions, Listener,
            LocalDispatcher,
        },
        server_impl::{Application, ServiceContext},
        stream::Stream,
        transfer::{peer_closed, recv_handles, send_handle, TransferOutcome},
        worker::Worker,
    },
};
use socket2::SockRef;
use std::{
    cell::RefCell,
    fs, io,
    net::Shutdown,
    os::{
        fd::{AsFd, OwnedFd},
        unix::net as std_unix,
    },
    path::{Path, PathBuf},
    rc::Rc,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    net::{UnixListener, UnixStream},
    time::{sleep, Instant},
};

const PIPE_ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(10);
const TARGET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Where the next accepted connection goes.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Target<T> {
    Local,
    Remote(T),
}

/// Live secondary channels plus a round-robin cursor.
///
/// With `n` secondaries the cursor walks `n + 1` slots; the last slot is
/// the primary itself.
#[derive(Debug)]
pub(crate) struct DispatchTargets<T> {
    targets: Vec<T>,
    cursor: usize,
}

impl<T> Default for DispatchTargets<T> {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            cursor: 0,
        }
    }
}

impl<T: Clone> DispatchTargets<T> {
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.targets.len()
    }

    #[inline]
    pub(crate) fn add(&mut self, target: T) {
        self.targets.push(target);
    }

    pub(crate) fn next(&mut self) -> Target<T> {
        let index = self.cursor % (self.targets.len() + 1);
        self.cursor = self.cursor.wrapping_add(1);

        match self.targets.get(index) {
            Some(target) => Target::Remote(target.clone()),
            None => Target::Local,
        }
    }

    /// Drops every target matching `dead`.
    pub(crate) fn remove(&mut self, dead: impl Fn(&T) -> bool) {
        self.targets.retain(|target| !dead(target));
    }

    #[inline]
    pub(crate) fn clear(&mut self) {
        self.targets.clear();
    }
}

type Channels = Rc<RefCell<DispatchTargets<Rc<UnixStream>>>>;

/// Random pipe path in the temp directory.
pub(crate) fn pipe_path(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}-{:016x}.sock", fastrand::u64(..)))
}

//

/// Owner of the real listening socket.
pub(crate) struct ListenerPrimary {
    listener: Listener,
    pipe_path: PathBuf,
    pipe_close: Option<CloseHandle>,
    target_count: Arc<AtomicUsize>,
}

impl ListenerPrimary {
    pub(crate) async fn start<A: Application>(
        options: ListenOptions,
        worker: &Worker,
        services: Arc<ServiceContext<A>>,
        limits: &ServerLimits,
    ) -> Result<Self, Error> {
        let pipe_path = pipe_path(&limits.pipe_prefix);
        let pipe = std_unix::UnixListener::bind(&pipe_path)?;
        pipe.set_nonblocking(true)?;

        let target_count = Arc::new(AtomicUsize::new(0));
        let (pipe_close, pipe_signal) = close_pair();
        let count = target_count.clone();

        let mut listener = Listener::new(options);
        let started = listener
            .start(worker, move |ctx, server_address| {
                let pipe = UnixListener::from_std(pipe)?;
                let channels = Channels::default();
                ctx.spawn(accept_secondaries(pipe, channels.clone(), count.clone(), pipe_signal));

                Ok(PrimaryDispatcher {
                    local: LocalDispatcher::new(ctx, services, server_address),
                    channels,
                    target_count: count,
                })
            })
            .await;

        if let Err(err) = started {
            let _ = fs::remove_file(&pipe_path);
            return Err(err);
        }
        tracing::debug!(pipe = %pipe_path.display(), "handle pipe listening");

        Ok(Self {
            listener,
            pipe_path,
            pipe_close: Some(pipe_close),
            target_count,
        })
    }

    #[inline]
    pub(crate) fn pipe_path(&self) -> &Path {
        &self.pipe_path
    }

    #[inline]
    pub(crate) fn local_endpoint(&self) -> Option<&Endpoint> {
        self.listener.local_endpoint()
    }

    /// Number of live secondaries, as last seen by the primary's worker.
    #[inline]
    pub(crate) fn dispatch_target_count(&self) -> usize {
        self.target_count.load(Ordering::Acquire)
    }

    /// Waits until `expected` secondaries registered, up to `timeout`.
    pub(crate) async fn wait_for_targets(&self, expected: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.dispatch_target_count() >= expected {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(TARGET_POLL_INTERVAL).await;
        }
    }

    /// Closes the listening socket first, then the pipe and every channel.
    pub(crate) async fn dispose(&mut self) {
        self.listener.dispose().await;

        if let Some(mut pipe_close) = self.pipe_close.take() {
            pipe_close.close().await;
            if let Err(err) = fs::remove_file(&self.pipe_path) {
                tracing::debug!(pipe = %self.pipe_path.display(), error = %err, "failed to remove handle pipe");
            }
        }
    }
}

impl Drop for ListenerPrimary {
    fn drop(&mut self) {
        if self.pipe_close.is_some() {
            let _ = fs::remove_file(&self.pipe_path);
        }
    }
}

async fn accept_secondaries(
    pipe: UnixListener,
    channels: Channels,
    target_count: Arc<AtomicUsize>,
    mut signal: CloseSignal,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = signal.closed() => break,
            accepted = pipe.accept() => accepted,
        };

        match accepted {
            Ok((channel, _)) => {
                let mut channels = channels.borrow_mut();
                channels.add(Rc::new(channel));
                target_count.store(channels.len(), Ordering::Release);
                tracing::debug!(targets = channels.len(), "secondary registered");
            }
            Err(err) => {
                tracing::warn!(error = %err, "handle pipe accept failed");
                sleep(PIPE_ACCEPT_ERROR_DELAY).await;
            }
        }
    }

    // Secondaries read end-of-pipe once the last reference is gone.
    channels.borrow_mut().clear();
    target_count.store(0, Ordering::Release);
}

struct PrimaryDispatcher<A: Application> {
    local: LocalDispatcher<A>,
    channels: Channels,
    target_count: Arc<AtomicUsize>,
}

impl<A: Application> PrimaryDispatcher<A> {
    /// Next live channel, or `None` for the primary itself. Channels whose
    /// secondary already closed its end are dropped on the way.
    fn next_target(&self) -> Option<Rc<UnixStream>> {
        loop {
            let channel = match self.channels.borrow_mut().next() {
                Target::Local => return None,
                Target::Remote(channel) => channel,
            };
            if !peer_closed(&channel) {
                return Some(channel);
            }

            let error = io::Error::new(io::ErrorKind::BrokenPipe, "secondary closed its pipe");
            self.remove_target(&channel, &error);
        }
    }

    fn remove_target(&self, channel: &Rc<UnixStream>, error: &io::Error) {
        let remaining = {
            let mut channels = self.channels.borrow_mut();
            channels.remove(|target| Rc::ptr_eq(target, channel));
            channels.len()
        };
        self.target_count.store(remaining, Ordering::Release);

        tracing::warn!(error = %error, remaining, "dispatch target gone, removed");
        self.local.services().events.dispatch_failed(error);
    }

    fn start_local(&self, handle: OwnedFd) {
        match Stream::from_owned_fd(handle) {
            Ok(stream) => self.local.start_connection(stream),
            Err(err) => tracing::warn!(error = %err, "failed to adopt returned socket"),
        }
    }
}

impl<A: Application> Dispatch for PrimaryDispatcher<A> {
    async fn dispatch(&mut self, stream: Stream) {
        let Some(channel) = self.next_target() else {
            return self.local.start_connection(stream);
        };

        let handle = match stream.into_owned_fd() {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(error = %err, "failed to detach accepted socket");
                return;
            }
        };

        let migration = &self.local.services().migration;
        migration.detach(handle.as_fd());

        match send_handle(&channel, handle) {
            TransferOutcome::Sent => tracing::trace!("connection sent to secondary"),
            TransferOutcome::Busy(handle) => {
                migration.reattach(handle.as_fd());
                tracing::debug!("secondary pipe full, serving connection locally");
                self.start_local(handle);
            }
            TransferOutcome::TargetGone { error, handle } => {
                migration.reattach(handle.as_fd());
                self.remove_target(&channel, &error);
                drop(channel);

                let _ = SockRef::from(&handle).shutdown(Shutdown::Write);
            }
        }
    }
}

//

/// Worker that serves connections handed over by the primary.
pub(crate) struct ListenerSecondary {
    close: Option<CloseHandle>,
}

impl ListenerSecondary {
    pub(crate) async fn start<A: Application>(
        pipe_path: &Path,
        worker: &Worker,
        services: Arc<ServiceContext<A>>,
        server_address: String,
    ) -> Result<Self, Error> {
        let pipe = std_unix::UnixStream::connect(pipe_path)?;
        pipe.set_nonblocking(true)?;

        let (close, signal) = close_pair();
        worker
            .run(move |ctx| -> std::io::Result<()> {
                let pipe = UnixStream::from_std(pipe)?;
                let dispatcher = LocalDispatcher::new(ctx, services, server_address);
                ctx.spawn(receive_handles(pipe, dispatcher, signal));
                Ok(())
            })
            .await??;

        tracing::debug!(worker = worker.index(), "secondary listening");
        Ok(Self { close: Some(close) })
    }

    /// Stops receiving; safe to call more than once.
    pub(crate) async fn dispose(&mut self) {
        if let Some(mut close) = self.close.take() {
            close.close().await;
        }
    }
}

async fn receive_handles<A: Application>(
    pipe: UnixStream,
    dispatcher: LocalDispatcher<A>,
    mut signal: CloseSignal,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = signal.closed() => break,
            received = recv_handles(&pipe) => received,
        };

        match received {
            Ok(Some(handles)) => {
                for handle in handles {
                    match Stream::from_owned_fd(handle) {
                        Ok(stream) => dispatcher.start_connection(stream),
                        Err(err) => tracing::warn!(error = %err, "failed to adopt transferred socket"),
                    }
                }
            }
            Ok(None) => {
                tracing::debug!("handle pipe closed by primary");
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, "handle pipe receive failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod sharding_tests {
    use super::*;
    use crate::{
        events::recording::RecordingEvents,
        limits::{BufferLimits, ConnLimits},
        memory::pool::MemoryPool,
        server::{frame::harness, listener::test_client::get},
        HandlerError, HttpContext,
    };
    use std::thread;

    #[test]
    fn round_robin_includes_self() {
        let mut targets = DispatchTargets::default();
        assert_eq!(targets.next(), Target::Local);

        targets.add('a');
        targets.add('b');
        let picks: Vec<_> = (0..6).map(|_| targets.next()).collect();

        // The cursor already advanced once above.
        #[rustfmt::skip]
        let expected = [
            Target::Remote('b'), Target::Local,
            Target::Remote('a'), Target::Remote('b'), Target::Local,
            Target::Remote('a'),
        ];
        assert_eq!(picks, expected);
    }

    #[test]
    fn removed_target_is_never_picked() {
        let mut targets = DispatchTargets::default();
        for target in ['a', 'b', 'c'] {
            targets.add(target);
        }

        targets.next();
        targets.remove(|target| *target == 'b');
        assert_eq!(targets.len(), 2);

        let picks: Vec<_> = (0..30).map(|_| targets.next()).collect();
        assert!(!picks.contains(&Target::Remote('b')));
        assert_eq!(picks.iter().filter(|t| **t == Target::Local).count(), 10);
    }

    struct ThreadName;

    impl Application for ThreadName {
        type Context = ();

        fn create_context(&self, _: &HttpContext) {}

        async fn process(&self, _: &mut (), http: &mut HttpContext) -> Result<(), HandlerError> {
            let name = thread::current().name().unwrap_or_default().to_owned();
            http.response_headers_mut()?
                .insert("Content-Length", name.len().to_string());
            http.write(name.as_bytes()).await?;
            Ok(())
        }
    }

    fn workers(count: usize) -> Vec<Worker> {
        let pool = Arc::new(MemoryPool::new(&BufferLimits::default()));
        (0..count)
            .map(|index| Worker::spawn(index, pool.clone()).unwrap())
            .collect()
    }

    fn served_by(response: &str) -> Option<&str> {
        response.rsplit("\r\n\r\n").next().filter(|body| !body.is_empty())
    }

    #[tokio::test]
    async fn connections_alternate_and_survive_dead_secondary() {
        let mut workers = workers(2);
        let events = Arc::new(RecordingEvents::default());
        let services = harness::services(ThreadName, ConnLimits::default(), events.clone());
        let limits = ServerLimits {
            pipe_prefix: "shard_web-test".into(),
            ..ServerLimits::default()
        };

        let mut primary = ListenerPrimary::start(
            ListenOptions::tcp("127.0.0.1:0".parse().unwrap()),
            &workers[0],
            services.clone(),
            &limits,
        )
        .await
        .unwrap();
        let mut secondary = ListenerSecondary::start(
            primary.pipe_path(),
            &workers[1],
            services.clone(),
            "test".into(),
        )
        .await
        .unwrap();
        assert!(primary.wait_for_targets(1, Duration::from_secs(5)).await);
        assert_eq!(primary.dispatch_target_count(), 1);

        let Some(Endpoint::Tcp(addr)) = primary.local_endpoint().cloned() else {
            panic!("expected a tcp endpoint");
        };

        let mut names = Vec::new();
        for _ in 0..4 {
            names.push(served_by(&get(addr).await).unwrap().to_owned());
        }
        assert_ne!(names[0], names[1]);
        assert_eq!(names[0], names[2]);
        assert_eq!(names[1], names[3]);
        assert!(names.contains(&"shard-worker-0".to_owned()));
        assert!(names.contains(&"shard-worker-1".to_owned()));

        // Kill the secondary's worker; its pipe end closes with it.
        secondary.dispose().await;
        workers[1].stop(Duration::from_secs(1)).await.unwrap();

        for _ in 0..4 {
            let response = get(addr).await;
            assert_eq!(served_by(&response), Some("shard-worker-0"), "{response}");
        }
        assert_eq!(primary.dispatch_target_count(), 0);
        assert!(events.take().iter().any(|event| event == "dispatch failed"));

        let pipe = primary.pipe_path().to_owned();
        primary.dispose().await;
        primary.dispose().await;
        assert!(!pipe.exists());
        workers[0].stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn surviving_targets_keep_rotating() {
        let mut workers = workers(3);
        let events = Arc::new(RecordingEvents::default());
        let services = harness::services(ThreadName, ConnLimits::default(), events.clone());
        let limits = ServerLimits {
            pipe_prefix: "shard_web-test".into(),
            ..ServerLimits::default()
        };

        let mut primary = ListenerPrimary::start(
            ListenOptions::tcp("127.0.0.1:0".parse().unwrap()),
            &workers[0],
            services.clone(),
            &limits,
        )
        .await
        .unwrap();
        let mut secondaries = Vec::new();
        for worker in &workers[1..] {
            let secondary =
                ListenerSecondary::start(primary.pipe_path(), worker, services.clone(), "test".into())
                    .await
                    .unwrap();
            secondaries.push(secondary);
        }
        assert!(primary.wait_for_targets(2, Duration::from_secs(5)).await);

        let Some(Endpoint::Tcp(addr)) = primary.local_endpoint().cloned() else {
            panic!("expected a tcp endpoint");
        };

        let mut names = Vec::new();
        for _ in 0..6 {
            names.push(served_by(&get(addr).await).unwrap().to_owned());
        }
        for i in 0..3 {
            assert_eq!(names[i], names[i + 3], "{names:?}");
        }
        let distinct: std::collections::HashSet<_> = names.iter().collect();
        assert_eq!(distinct.len(), 3, "{names:?}");

        secondaries[1].dispose().await;
        workers[2].stop(Duration::from_secs(1)).await.unwrap();

        // No connection is lost; the primary and the survivor share the load.
        let mut names = Vec::new();
        for _ in 0..6 {
            let response = get(addr).await;
            names.push(served_by(&response).expect("connection lost").to_owned());
        }
        assert!(names.iter().all(|name| name == "shard-worker-0" || name == "shard-worker-1"), "{names:?}");
        // The dead channel is dropped by the third connection at the latest.
        for pair in names[2..].windows(2) {
            assert_ne!(pair[0], pair[1], "{names:?}");
        }
        assert_eq!(primary.dispatch_target_count(), 1);
        assert_eq!(
            events.take().iter().filter(|event| *event == "dispatch failed").count(),
            1
        );

        primary.dispose().await;
        secondaries[0].dispose().await;
        workers[1].stop(Duration::from_secs(1)).await.unwrap();
        workers[0].stop(Duration::from_secs(1)).await.unwrap();
    }
}
