//! Single-threaded reactor that hosts listeners and connections.
//!
//! Each worker is an OS thread running a current-thread Tokio runtime and
//! a `LocalSet`. Everything it owns (connections, channels, dispatch
//! targets) stays on that thread; other threads talk to it by posting
//! closures.

use crate::{errors::Error, memory::pool::MemoryPool};
use std::{
    cell::Cell,
    future::Future,
    rc::Rc,
    sync::Arc,
    thread,
    time::Duration,
};
use tokio::{
    runtime::{Builder, Runtime},
    sync::{mpsc, oneshot, watch, Notify},
    task::{JoinHandle, LocalSet},
};

type Task = Box<dyn FnOnce(&WorkerContext) + Send>;

enum Message {
    Run(Task),
    Stop(Duration),
}

/// Handle to a worker thread, owned by the server.
pub(crate) struct Worker {
    index: usize,
    sender: mpsc::UnboundedSender<Message>,
    thread: Option<thread::JoinHandle<()>>,
    // Number of connections abandoned at shutdown.
    done: Option<oneshot::Receiver<usize>>,
}

impl Worker {
    /// Starts the thread `shard-worker-{index}`.
    pub(crate) fn spawn(index: usize, pool: Arc<MemoryPool>) -> Result<Self, Error> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        let thread = thread::Builder::new()
            .name(format!("shard-worker-{index}"))
            .spawn(move || worker_main(index, runtime, receiver, pool, done_tx))?;

        Ok(Self {
            index,
            sender,
            thread: Some(thread),
            done: Some(done_rx),
        })
    }

    #[inline]
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Queues `task` to run on the worker thread.
    pub(crate) fn post<F>(&self, task: F) -> Result<(), Error>
    where
        F: FnOnce(&WorkerContext) + Send + 'static,
    {
        self.sender
            .send(Message::Run(Box::new(task)))
            .map_err(|_| Error::WorkerStopped)
    }

    /// Runs `f` on the worker thread and returns its result.
    pub(crate) async fn run<F, R>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&WorkerContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.post(move |ctx| {
            let _ = tx.send(f(ctx));
        })?;

        rx.await.map_err(|_| Error::WorkerStopped)
    }

    /// Signals shutdown without waiting; see [`join`](Self::join).
    ///
    /// Tasks posted before this call still run. Connections see the
    /// shutdown signal and get `timeout` to finish.
    pub(crate) fn request_stop(&self, timeout: Duration) {
        let _ = self.sender.send(Message::Stop(timeout));
    }

    /// Waits for the thread to exit after [`request_stop`](Self::request_stop).
    pub(crate) async fn join(&mut self) -> Result<(), Error> {
        let leaked = match self.done.take() {
            Some(done) => done.await.unwrap_or_else(|_| {
                tracing::error!(worker = self.index, "worker thread exited unexpectedly");
                0
            }),
            None => 0,
        };

        if let Some(thread) = self.thread.take() {
            // Already past its last await point, the join is short.
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }

        if leaked > 0 {
            tracing::error!(
                worker = self.index,
                leaked,
                "shutdown timed out, abandoning connections"
            );
            return Err(Error::ShutdownTimedOut { leaked });
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn stop(&mut self, timeout: Duration) -> Result<(), Error> {
        self.request_stop(timeout);
        self.join().await
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.request_stop(Duration::ZERO);
        }
    }
}

fn worker_main(
    index: usize,
    runtime: Runtime,
    mut receiver: mpsc::UnboundedReceiver<Message>,
    pool: Arc<MemoryPool>,
    done: oneshot::Sender<usize>,
) {
    let local = LocalSet::new();
    let (stop_tx, stop_rx) = watch::channel(false);
    let ctx = WorkerContext {
        inner: Rc::new(ContextInner {
            index,
            pool,
            live: Cell::new(0),
            idle: Notify::new(),
            stopping: stop_rx,
        }),
    };
    tracing::debug!(worker = index, "worker started");

    let timeout = local.block_on(&runtime, async {
        while let Some(message) = receiver.recv().await {
            match message {
                Message::Run(task) => task(&ctx),
                Message::Stop(timeout) => return timeout,
            }
        }
        Duration::ZERO
    });

    // Later posts fail with `WorkerStopped`.
    drop(receiver);

    let _ = stop_tx.send(true);
    let leaked = local.block_on(&runtime, async {
        match tokio::time::timeout(timeout, ctx.wait_idle()).await {
            Ok(()) => 0,
            Err(_) => ctx.live_connections(),
        }
    });

    // Cancels whatever is still running.
    drop(local);
    drop(ctx);
    drop(runtime);

    tracing::debug!(worker = index, leaked, "worker stopped");
    let _ = done.send(leaked);
}

//

/// Worker-local services, handed to every posted task.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    inner: Rc<ContextInner>,
}

struct ContextInner {
    index: usize,
    pool: Arc<MemoryPool>,
    live: Cell<usize>,
    idle: Notify,
    stopping: watch::Receiver<bool>,
}

impl WorkerContext {
    #[inline]
    pub(crate) fn index(&self) -> usize {
        self.inner.index
    }

    #[inline]
    pub(crate) fn pool(&self) -> &Arc<MemoryPool> {
        &self.inner.pool
    }

    #[inline]
    pub(crate) fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal::new(self.inner.stopping.clone())
    }

    #[inline]
    pub(crate) fn live_connections(&self) -> usize {
        self.inner.live.get()
    }

    /// Spawns a task on this worker.
    #[inline]
    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        tokio::task::spawn_local(future)
    }

    /// Spawns a connection task; shutdown waits for these to finish.
    pub(crate) fn spawn_connection<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let guard = LiveGuard::new(self.inner.clone());
        tokio::task::spawn_local(async move {
            let _guard = guard;
            future.await;
        });
    }

    async fn wait_idle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.live.get() == 0 {
                return;
            }
            idle.await;
        }
    }
}

struct LiveGuard(Rc<ContextInner>);

impl LiveGuard {
    fn new(inner: Rc<ContextInner>) -> Self {
        inner.live.set(inner.live.get() + 1);
        Self(inner)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let live = self.0.live.get() - 1;
        self.0.live.set(live);
        if live == 0 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Set once the worker begins shutting down.
#[derive(Debug, Clone)]
pub(crate) struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    #[inline]
    pub(crate) fn new(stopping: watch::Receiver<bool>) -> Self {
        Self(stopping)
    }

    #[inline]
    pub(crate) fn is_set(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown began.
    pub(crate) async fn wait(&mut self) {
        let _ = self.0.wait_for(|stopping| *stopping).await;
    }
}

#[cfg(test)]
mod worker_tests {
    use super::*;
    use crate::limits::BufferLimits;
    use std::future::pending;

    fn worker(index: usize) -> Worker {
        Worker::spawn(index, Arc::new(MemoryPool::new(&BufferLimits::default()))).unwrap()
    }

    #[tokio::test]
    async fn runs_tasks_on_named_thread() {
        let mut worker = worker(3);

        let (name, index) = worker
            .run(|ctx| (thread::current().name().map(str::to_owned), ctx.index()))
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some("shard-worker-3"));
        assert_eq!(index, 3);

        worker.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn connections_drain_on_shutdown_signal() {
        let mut worker = worker(0);

        let live = worker
            .run(|ctx| {
                for _ in 0..3 {
                    let mut signal = ctx.shutdown_signal();
                    ctx.spawn_connection(async move { signal.wait().await });
                }
                ctx.live_connections()
            })
            .await
            .unwrap();
        assert_eq!(live, 3);

        worker.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn stuck_connections_are_reported() {
        let mut worker = worker(0);

        worker
            .run(|ctx| {
                ctx.spawn_connection(pending());
                ctx.spawn_connection(async {});
            })
            .await
            .unwrap();

        assert!(matches!(
            worker.stop(Duration::from_millis(50)).await,
            Err(Error::ShutdownTimedOut { leaked: 1 })
        ));
    }

    #[tokio::test]
    async fn stopped_worker_rejects_tasks() {
        let mut worker = worker(0);
        worker.stop(Duration::ZERO).await.unwrap();

        assert!(matches!(worker.post(|_| {}), Err(Error::WorkerStopped)));
        assert!(matches!(worker.run(|_| 1).await, Err(Error::WorkerStopped)));
    }
}
