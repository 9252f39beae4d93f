//! Reusable read buffers for workers.
//!
//! Every worker performs exactly one bounded read per work item. Handing out
//! fixed-size buffers from a shared free list keeps that read from allocating
//! under steady load.

use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, PoisonError},
};

#[derive(Clone)]
pub struct BufferPool {
    free: Arc<Mutex<Vec<Vec<u8>>>>,
    buffer_size: usize,
    capacity: usize,
}

impl BufferPool {
    /// Creates a pool holding up to `capacity` idle buffers of `buffer_size`
    /// bytes each, all allocated up front.
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        let free = (0..capacity).map(|_| vec![0u8; buffer_size]).collect();
        Self {
            free: Arc::new(Mutex::new(free)),
            buffer_size,
            capacity,
        }
    }

    /// Takes an idle buffer, allocating a fresh one when the pool is empty.
    pub fn acquire(&self) -> PooledBuffer {
        let buffer = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);

        PooledBuffer {
            buffer,
            pool: self.clone(),
        }
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn release(&self, mut buffer: Vec<u8>) {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.capacity {
            buffer.resize(self.buffer_size, 0);
            free.push(buffer);
        }
    }
}

/// A buffer on loan from a [`BufferPool`]; goes back on drop.
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: BufferPool,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buffer));
    }
}
