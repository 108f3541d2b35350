//! Single-producer/single-consumer byte pipe built from pooled blocks.
//!
//! Both halves live on the same worker thread. The writer side is fed by a
//! socket pump or by the request loop; the reader side is drained by the
//! other one. Each side has at most one pending waiter.

use crate::{
    errors::Error,
    memory::pool::{Block, MemoryPool},
};
use std::{
    cell::RefCell,
    collections::VecDeque,
    future::poll_fn,
    rc::Rc,
    sync::Arc,
    task::{Poll, Waker},
};

struct Inner {
    blocks: VecDeque<Block>,
    // Bytes queued in `blocks`.
    buffered: usize,
    // Bytes popped by the reader but not finished yet.
    in_flight: usize,
    writer_completed: bool,
    reader_completed: bool,
    reader_waker: Option<Waker>,
    writer_waker: Option<Waker>,
    pool: Arc<MemoryPool>,
    limit: Option<usize>,
}

impl Inner {
    #[inline]
    fn wake_reader(&mut self) {
        if let Some(waker) = self.reader_waker.take() {
            waker.wake();
        }
    }

    #[inline]
    fn wake_writer(&mut self) {
        if let Some(waker) = self.writer_waker.take() {
            waker.wake();
        }
    }

    #[inline]
    fn has_space(&self) -> bool {
        self.limit
            .map_or(true, |limit| self.buffered + self.in_flight < limit)
    }

    fn release_all(&mut self) {
        while let Some(block) = self.blocks.pop_front() {
            self.pool.release(block);
        }
        self.buffered = 0;
    }
}

/// Creates a channel whose writer suspends in
/// [`wait_for_space`](ChannelWriter::wait_for_space) once `limit` unread
/// bytes are queued.
pub(crate) fn byte_channel(
    pool: Arc<MemoryPool>,
    limit: Option<usize>,
) -> (ChannelWriter, ChannelReader) {
    let inner = Rc::new(RefCell::new(Inner {
        blocks: VecDeque::new(),
        buffered: 0,
        in_flight: 0,
        writer_completed: false,
        reader_completed: false,
        reader_waker: None,
        writer_waker: None,
        pool,
        limit,
    }));

    (
        ChannelWriter {
            inner: inner.clone(),
        },
        ChannelReader { inner },
    )
}

pub(crate) struct ChannelWriter {
    inner: Rc<RefCell<Inner>>,
}

impl ChannelWriter {
    /// Appends `bytes`.
    ///
    /// Bytes written after the reader completed are discarded and reported
    /// as [`Error::StreamClosed`], as are writes after `complete_writing`.
    pub(crate) fn write(&self, mut bytes: &[u8]) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        if inner.reader_completed || inner.writer_completed {
            return Err(Error::StreamClosed);
        }
        if bytes.is_empty() {
            return Ok(());
        }

        inner.buffered += bytes.len();

        if let Some(tail) = inner.blocks.back_mut() {
            let n = tail.fill_from(bytes);
            bytes = &bytes[n..];
        }
        while !bytes.is_empty() {
            let mut block = inner.pool.lease();
            let n = block.fill_from(bytes);
            bytes = &bytes[n..];
            inner.blocks.push_back(block);
        }

        inner.wake_reader();
        Ok(())
    }

    /// Appends a block filled by the caller without copying it.
    pub(crate) fn push_block(&self, block: Block) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        if inner.reader_completed || inner.writer_completed {
            inner.pool.release(block);
            return Err(Error::StreamClosed);
        }
        if block.is_empty() {
            inner.pool.release(block);
            return Ok(());
        }

        inner.buffered += block.len();
        inner.blocks.push_back(block);
        inner.wake_reader();
        Ok(())
    }

    #[inline]
    pub(crate) fn lease(&self) -> Block {
        self.inner.borrow().pool.lease()
    }

    #[inline]
    pub(crate) fn release(&self, block: Block) {
        self.inner.borrow().pool.release(block);
    }

    /// No more bytes follow; the reader still drains what is queued.
    pub(crate) fn complete_writing(&self) {
        let mut inner = self.inner.borrow_mut();
        if !inner.writer_completed {
            inner.writer_completed = true;
            inner.wake_reader();
        }
    }

    /// Completes the writer and discards everything not yet read.
    pub(crate) fn abort(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.release_all();
        inner.writer_completed = true;
        inner.wake_reader();
    }

    #[inline]
    pub(crate) fn is_reader_completed(&self) -> bool {
        self.inner.borrow().reader_completed
    }

    /// Resolves once queued bytes drop below the channel limit, or either
    /// half completes.
    pub(crate) async fn wait_for_space(&self) {
        poll_fn(|cx| {
            let mut inner = self.inner.borrow_mut();
            if inner.reader_completed || inner.writer_completed || inner.has_space() {
                Poll::Ready(())
            } else {
                inner.writer_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        })
        .await
    }

    /// Resolves once every queued byte was consumed, or the reader completed.
    pub(crate) async fn drained(&self) {
        poll_fn(|cx| {
            let mut inner = self.inner.borrow_mut();
            if inner.reader_completed || inner.buffered + inner.in_flight == 0 {
                Poll::Ready(())
            } else {
                inner.writer_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        })
        .await
    }

    /// Resolves once the reader half completed.
    pub(crate) async fn reader_closed(&self) {
        poll_fn(|cx| {
            let mut inner = self.inner.borrow_mut();
            if inner.reader_completed {
                Poll::Ready(())
            } else {
                inner.writer_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        })
        .await
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        self.complete_writing();
    }
}

pub(crate) struct ChannelReader {
    inner: Rc<RefCell<Inner>>,
}

impl ChannelReader {
    /// Copies buffered bytes into `dst` without waiting.
    pub(crate) fn read(&self, dst: &mut [u8]) -> usize {
        let mut inner = self.inner.borrow_mut();
        let mut copied = 0;

        while copied < dst.len() {
            let Some(front) = inner.blocks.front_mut() else {
                break;
            };

            let src = front.readable();
            let n = src.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&src[..n]);
            front.advance(n);
            copied += n;

            if front.is_empty() {
                if let Some(block) = inner.blocks.pop_front() {
                    inner.pool.release(block);
                }
            }
        }

        if copied > 0 {
            inner.buffered -= copied;
            inner.wake_writer();
        }
        copied
    }

    /// Takes the oldest block for zero-copy consumption. The bytes count
    /// against the limit until [`finish_block`](Self::finish_block).
    pub(crate) fn pop_block(&self) -> Option<Block> {
        let mut inner = self.inner.borrow_mut();
        let block = inner.blocks.pop_front()?;

        inner.buffered -= block.len();
        inner.in_flight += block.len();
        Some(block)
    }

    pub(crate) fn finish_block(&self, block: Block) {
        let mut inner = self.inner.borrow_mut();

        inner.in_flight = inner.in_flight.saturating_sub(block.len());
        inner.pool.release(block);
        inner.wake_writer();
    }

    #[inline]
    pub(crate) fn buffered(&self) -> usize {
        self.inner.borrow().buffered
    }

    /// `true` when the writer completed and every byte was read.
    #[inline]
    pub(crate) fn is_completed(&self) -> bool {
        let inner = self.inner.borrow();
        inner.writer_completed && inner.buffered == 0
    }

    /// Resolves once bytes are buffered or the writer completed.
    pub(crate) async fn await_more_data(&self) {
        poll_fn(|cx| {
            let mut inner = self.inner.borrow_mut();
            if inner.buffered > 0 || inner.writer_completed {
                Poll::Ready(())
            } else {
                inner.reader_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        })
        .await
    }

    /// No more bytes will be read; queued blocks go back to the pool.
    pub(crate) fn complete_reading(&self) {
        let mut inner = self.inner.borrow_mut();
        if !inner.reader_completed {
            inner.reader_completed = true;
            inner.release_all();
            inner.wake_writer();
        }
    }
}

impl Drop for ChannelReader {
    fn drop(&mut self) {
        self.complete_reading();
    }
}

#[cfg(test)]
pub(crate) fn test_pool() -> Arc<MemoryPool> {
    use crate::limits::BufferLimits;

    Arc::new(MemoryPool::new(&BufferLimits {
        block_size: 8,
        retained_blocks: 16,
        ..BufferLimits::default()
    }))
}
