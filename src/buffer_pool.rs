//! Fixed-size reusable byte buffers, lent exclusively and returned on
//! release, to bound peak heap pressure during downloads and transcodes.
//!
//! The pool never blocks a caller: under contention it simply allocates
//! a fresh slot rather than waiting, trading strict bounded memory for
//! availability — the same trade-off the WorkerPool makes on queue
//! overflow.

use std::sync::Mutex;

/// A buffer lent from a [`BufferPool`]. Dropping it without returning it
/// to the pool it came from simply frees the memory; it is not a
/// programming error, just a missed reuse opportunity.
pub struct BufferSlot {
    buf: Vec<u8>,
}

impl BufferSlot {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    fn reset(&mut self, slot_size: usize) {
        self.buf.clear();
        self.buf.resize(slot_size, 0);
    }
}

/// Lends and reclaims fixed-size [`BufferSlot`]s.
pub struct BufferPool {
    slot_size: usize,
    capacity: usize,
    free: Mutex<Vec<BufferSlot>>,
}

impl BufferPool {
    pub fn new(slot_size: usize, capacity: usize) -> Self {
        Self {
            slot_size,
            capacity,
            free: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Returns a buffer of at least the configured slot size. Reuses a
    /// pooled slot when one is free; otherwise allocates fresh rather
    /// than blocking.
    pub fn get(&self) -> BufferSlot {
        let mut free = self.free.lock().expect("buffer pool mutex poisoned");
        match free.pop() {
            Some(slot) => slot,
            None => BufferSlot::new(self.slot_size),
        }
    }

    /// Returns `slot` to the pool for reuse, resetting its length to the
    /// configured slot size first. Oversized/undersized slots (from
    /// [`Self::get_sized`]) and slots beyond the configured capacity are
    /// dropped instead of retained, to keep the pool homogeneous.
    pub fn put(&self, mut slot: BufferSlot) {
        if slot.capacity() != self.slot_size {
            return;
        }
        let mut free = self.free.lock().expect("buffer pool mutex poisoned");
        if free.len() >= self.capacity {
            return;
        }
        slot.reset(self.slot_size);
        free.push(slot);
    }

    /// A one-off buffer of exactly `n` bytes, outside the fixed slot
    /// class. Never drawn from or returned to the homogeneous pool.
    pub fn get_sized(&self, n: usize) -> BufferSlot {
        BufferSlot::new(n)
    }

    /// Counterpart to [`Self::get_sized`]: always discards, since
    /// foreign-sized buffers are never retained.
    pub fn put_sized(&self, _slot: BufferSlot) {}

    /// Number of slots currently idle in the pool (test/diagnostic use).
    pub fn idle_count(&self) -> usize {
        self.free.lock().expect("buffer pool mutex poisoned").len()
    }
}
