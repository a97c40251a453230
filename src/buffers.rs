//! Fixed-capacity buffer arena and the FIFO queues that hold buffer handles.
//!
//! All buffers are allocated when a pool is created and recycled afterwards, so steady-state
//!  operation does not allocate. A [BufferId] is the handle to a buffer, and it is deliberately
//!  neither `Clone` nor `Copy`: at any time, a buffer is owned by exactly one of
//!
//! * the pool's free list
//! * a [BufferQueue]
//! * code that allocated it and did not pass it on yet
//!
//! Moving the handle between these owners moves ownership of the buffer.

use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use tracing::trace;

/// Ownership handle for a buffer in a [BufferPool]
#[derive(Eq, PartialEq, Hash)]
pub struct BufferId(u16);

impl Debug for BufferId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl BufferId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// A pre-allocated buffer with a fixed capacity and a used length
pub struct FixedBuf {
    buf: Vec<u8>,
    len: usize,
}

impl FixedBuf {
    pub fn new(capacity: usize) -> FixedBuf {
        FixedBuf {
            buf: vec![0; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Appends a byte, returning false (and dropping the byte) if the buffer is full
    pub fn push(&mut self, byte: u8) -> bool {
        if self.len == self.buf.len() {
            return false;
        }
        self.buf[self.len] = byte;
        self.len += 1;
        true
    }

    /// Replaces the buffer's content. Data exceeding the capacity is a programming error.
    pub fn fill(&mut self, data: &[u8]) {
        assert!(data.len() <= self.capacity(), "{} bytes do not fit into a buffer of {} bytes", data.len(), self.capacity());
        self.buf[..data.len()].copy_from_slice(data);
        self.len = data.len();
    }
}

impl AsRef<[u8]> for FixedBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl AsMut<[u8]> for FixedBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

impl Debug for FixedBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}


pub struct BufferPool {
    name: &'static str,
    buffers: Vec<FixedBuf>,
    free_list: Vec<u16>,
}

impl BufferPool {
    pub fn new(name: &'static str, num_buffers: usize, buf_size: usize) -> BufferPool {
        assert!(num_buffers <= u16::MAX as usize);

        BufferPool {
            name,
            buffers: (0..num_buffers).map(|_| FixedBuf::new(buf_size)).collect(),
            // reversed so that buffers are handed out in index order, which makes traces easier to read
            free_list: (0..num_buffers as u16).rev().collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    /// Takes a cleared buffer from the free list, or returns `None` if all buffers are in use
    pub fn allocate(&mut self) -> Option<BufferId> {
        let result = self.free_list.pop().map(BufferId);
        match &result {
            Some(id) => trace!("{} pool: allocated buffer {:?}, {} free", self.name, id, self.free_list.len()),
            None => trace!("{} pool: exhausted", self.name),
        }
        result
    }

    /// Returns a buffer to the free list. The caller must own the handle, i.e. it must have been
    ///  allocated from this pool and not been freed since. Passing the handle by value makes
    ///  double frees through the same handle impossible.
    pub fn free(&mut self, id: BufferId) {
        debug_assert!(id.index() < self.buffers.len());
        debug_assert!(!self.free_list.contains(&id.0));

        self.buffers[id.index()].clear();
        self.free_list.push(id.0);
        trace!("{} pool: freed buffer {:?}, {} free", self.name, id, self.free_list.len());
    }

    pub fn get(&self, id: &BufferId) -> &FixedBuf {
        &self.buffers[id.index()]
    }

    pub fn get_mut(&mut self, id: &BufferId) -> &mut FixedBuf {
        &mut self.buffers[id.index()]
    }

    /// convenience for `get(id).as_ref()`
    pub fn data(&self, id: &BufferId) -> &[u8] {
        self.buffers[id.index()].as_ref()
    }
}


/// FIFO of buffer handles. Capacity is reserved up front, so pushing never reallocates as long
///  as the queue holds no more handles than its pool has buffers.
pub struct BufferQueue {
    entries: VecDeque<BufferId>,
}

impl BufferQueue {
    pub fn with_capacity(capacity: usize) -> BufferQueue {
        BufferQueue {
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push_back(&mut self, id: BufferId) {
        self.entries.push_back(id);
    }

    pub fn pop_front(&mut self) -> Option<BufferId> {
        self.entries.pop_front()
    }

    pub fn front(&self) -> Option<&BufferId> {
        self.entries.front()
    }

    /// the n-th entry counting from the head, starting at 0
    pub fn nth(&self, n: usize) -> Option<&BufferId> {
        self.entries.get(n)
    }

    /// the n-th entry counting from the tail, where the tail itself is n = 1
    pub fn nth_from_back(&self, n: usize) -> Option<&BufferId> {
        if n == 0 || n > self.entries.len() {
            return None;
        }
        self.entries.get(self.entries.len() - n)
    }

    /// Returns all buffers in the queue to the pool
    pub fn drain_into(&mut self, pool: &mut BufferPool) {
        while let Some(id) = self.entries.pop_front() {
            pool.free(id);
        }
    }
}
