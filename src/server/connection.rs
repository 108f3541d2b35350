use crate::{
    events::{ConnectionInfo, EventSink},
    http::{context::HttpContext, request::FrameInput},
    memory::channel::{byte_channel, ChannelReader, ChannelWriter},
    server::{
        frame::Frame,
        server_impl::{Application, ServiceContext},
        stream::{ReadHalf, Stream, WriteHalf},
        worker::WorkerContext,
    },
};
use std::{
    cell::Cell,
    io,
    rc::Rc,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Who, if anyone, tore the connection down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum AbortState {
    #[default]
    Running,
    AbortedByApp,
    AbortedByPeer,
}

/// Shared abort flag of one connection. Only the first abort counts.
#[derive(Debug, Clone, Default)]
pub(crate) struct AbortHandle(Rc<Cell<AbortState>>);

impl AbortHandle {
    #[inline]
    pub(crate) fn state(&self) -> AbortState {
        self.0.get()
    }

    #[inline]
    pub(crate) fn is_aborted(&self) -> bool {
        self.state() != AbortState::Running
    }

    /// Returns `true` if this call aborted the connection.
    #[inline]
    pub(crate) fn abort_by_app(&self) -> bool {
        self.transition(AbortState::AbortedByApp)
    }

    #[inline]
    pub(crate) fn abort_by_peer(&self) -> bool {
        self.transition(AbortState::AbortedByPeer)
    }

    #[inline]
    fn transition(&self, to: AbortState) -> bool {
        match self.state() {
            AbortState::Running => {
                self.0.set(to);
                true
            }
            _ => false,
        }
    }
}

// CONNECTION_ID

const ENCODE_32: &[u8; 32] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";

/// Next process-wide connection id: a counter seeded randomly at first use,
/// so ids from different runs rarely collide in aggregated logs.
pub(crate) fn next_connection_id() -> String {
    static LAST: OnceLock<AtomicU64> = OnceLock::new();

    let id = LAST
        .get_or_init(|| AtomicU64::new(fastrand::u64(..)))
        .fetch_add(1, Ordering::Relaxed)
        .wrapping_add(1);
    encode_id(id)
}

// 64 bits as 13 base-32 digits, most significant first.
fn encode_id(id: u64) -> String {
    (0..13)
        .map(|i| ENCODE_32[((id >> (60 - 5 * i)) & 31) as usize] as char)
        .collect()
}

//

/// One accepted socket on its worker.
pub(crate) struct Connection {
    info: Rc<ConnectionInfo>,
    abort: AbortHandle,
    stream: Option<Stream>,
    events: Arc<dyn EventSink>,
    started: bool,
    disposed: bool,
}

impl Connection {
    pub(crate) fn new(
        stream: Stream,
        server_address: &str,
        events: Arc<dyn EventSink>,
    ) -> io::Result<Self> {
        let info = ConnectionInfo {
            id: next_connection_id(),
            server_address: server_address.to_owned(),
            remote: stream.remote_endpoint()?,
            local: stream.local_endpoint()?,
        };

        Ok(Self {
            info: Rc::new(info),
            abort: AbortHandle::default(),
            stream: Some(stream),
            events,
            started: false,
            disposed: false,
        })
    }

    /// Runs the connection as a task of `ctx`'s worker.
    pub(crate) fn start<A: Application>(
        mut self,
        ctx: &WorkerContext,
        services: Arc<ServiceContext<A>>,
    ) {
        self.started = true;
        self.events.connection_start(&self.info);

        let ctx_owned = ctx.clone();
        ctx.spawn_connection(async move { self.run(ctx_owned, services).await });
    }

    async fn run<A: Application>(mut self, ctx: WorkerContext, services: Arc<ServiceContext<A>>) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        let (read, write) = stream.into_split();

        let limits = &services.conn_limits;
        let (input_writer, input_reader) =
            byte_channel(ctx.pool().clone(), limits.max_request_buffer_size);
        let (output_writer, output_reader) =
            byte_channel(ctx.pool().clone(), Some(limits.max_response_buffer_size));

        let http = HttpContext::new(
            self.info.clone(),
            FrameInput::new(input_reader, &services.req_limits),
            output_writer,
            self.abort.clone(),
            &services.req_limits,
            services.add_server_header,
        );
        let frame = Frame::new(services.clone(), http, ctx.shutdown_signal());

        tokio::join!(
            input_pump(read, input_writer, self.abort.clone(), &self.info),
            output_pump(write, output_reader, self.abort.clone(), &self.info),
            frame.run(),
        );

        self.dispose();
    }

    /// Emits `connection_stop` once; safe to call repeatedly.
    pub(crate) fn dispose(&mut self) {
        if self.started && !self.disposed {
            self.disposed = true;
            self.events.connection_stop(&self.info);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Socket to input channel, until EOF or the request loop stops reading.
async fn input_pump(
    mut read: ReadHalf,
    input: ChannelWriter,
    abort: AbortHandle,
    info: &ConnectionInfo,
) {
    loop {
        input.wait_for_space().await;

        let mut block = input.lease();
        let result = tokio::select! {
            biased;
            _ = input.reader_closed() => None,
            result = read.read(block.writable()) => Some(result),
        };

        match result {
            Some(Ok(n)) if n > 0 => {
                block.commit(n);
                if input.push_block(block).is_err() {
                    break;
                }
            }
            Some(Ok(_)) | None => {
                input.release(block);
                break;
            }
            Some(Err(err)) => {
                input.release(block);
                if abort.abort_by_peer() {
                    tracing::debug!(connection_id = %info.id, error = %err, "connection read failed");
                }
                break;
            }
        }
    }

    input.complete_writing();
}

/// Output channel to socket. Ends with a FIN, or a reset if the
/// application aborted.
async fn output_pump(
    mut write: WriteHalf,
    output: ChannelReader,
    abort: AbortHandle,
    info: &ConnectionInfo,
) {
    'pump: loop {
        while let Some(block) = output.pop_block() {
            let result = write.write_all(block.readable()).await;
            output.finish_block(block);

            if let Err(err) = result {
                if abort.abort_by_peer() {
                    tracing::debug!(connection_id = %info.id, error = %err, "connection write failed");
                }
                break 'pump;
            }
        }

        if output.is_completed() || abort.is_aborted() {
            break;
        }
        output.await_more_data().await;
    }

    output.complete_reading();

    match abort.state() {
        AbortState::Running => {
            if let Err(err) = write.shutdown().await {
                tracing::debug!(connection_id = %info.id, error = %err, "connection shutdown failed");
            }
        }
        AbortState::AbortedByApp => write.reset(),
        AbortState::AbortedByPeer => {}
    }
}
