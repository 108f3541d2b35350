use crate::limits::BufferLimits;
use crossbeam::queue::ArrayQueue;

/// Fixed-size memory block leased from a [`MemoryPool`].
///
/// `data[start..end]` holds the readable bytes; `data[end..]` is free space.
#[derive(Debug)]
pub(crate) struct Block {
    data: Box<[u8]>,
    start: usize,
    end: usize,
}

impl Block {
    #[inline]
    pub(crate) fn readable(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    #[inline]
    pub(crate) fn writable(&mut self) -> &mut [u8] {
        &mut self.data[self.end..]
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Marks `n` bytes of [`writable`](Self::writable) as filled.
    #[inline]
    pub(crate) fn commit(&mut self, n: usize) {
        debug_assert!(self.end + n <= self.data.len());
        self.end = (self.end + n).min(self.data.len());
    }

    /// Drops `n` bytes from the front of [`readable`](Self::readable).
    #[inline]
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(self.start + n <= self.end);
        self.start = (self.start + n).min(self.end);
    }

    /// Copies as much of `src` as fits, returning the copied length.
    #[inline]
    pub(crate) fn fill_from(&mut self, src: &[u8]) -> usize {
        let free = self.writable();
        let n = free.len().min(src.len());
        free[..n].copy_from_slice(&src[..n]);
        self.commit(n);
        n
    }
}

/// Block allocator shared by every worker.
///
/// Free blocks live in a lock-free bounded queue. A lease never fails: an
/// empty queue allocates a new block, and releasing into a full queue frees
/// the block.
#[derive(Debug)]
pub(crate) struct MemoryPool {
    free: ArrayQueue<Box<[u8]>>,
    block_size: usize,
}

impl MemoryPool {
    #[inline]
    pub(crate) fn new(limits: &BufferLimits) -> Self {
        Self {
            free: ArrayQueue::new(limits.retained_blocks.max(1)),
            block_size: limits.block_size.max(1),
        }
    }

    #[inline]
    pub(crate) fn lease(&self) -> Block {
        let data = self
            .free
            .pop()
            .unwrap_or_else(|| vec![0; self.block_size].into_boxed_slice());

        Block {
            data,
            start: 0,
            end: 0,
        }
    }

    #[inline]
    pub(crate) fn release(&self, block: Block) {
        let _ = self.free.push(block.data);
    }

    #[cfg(test)]
    pub(crate) fn free_blocks(&self) -> usize {
        self.free.len()
    }
}
