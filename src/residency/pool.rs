//! Reusable byte buffers for body snapshots and buffered responses.
//!
//! # Design Decisions
//! - Bounded lock-free free list (crossbeam channel); acquire never blocks
//! - A buffer belongs to exactly one request until its guard drops
//! - Buffers are cleared on release; oversized ones are not retained

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use crossbeam_channel::{bounded, Receiver, Sender};

use crate::config::PoolConfig;
use crate::observability::metrics;

/// Pool of reusable `BytesMut` buffers.
#[derive(Clone, Debug)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    free_tx: Sender<BytesMut>,
    free_rx: Receiver<BytesMut>,
    initial_capacity: usize,
    max_retained_capacity: usize,
}

impl BufferPool {
    pub fn new(config: &PoolConfig) -> Self {
        let (free_tx, free_rx) = bounded(config.max_buffers);
        Self {
            inner: Arc::new(PoolInner {
                free_tx,
                free_rx,
                initial_capacity: config.initial_capacity,
                max_retained_capacity: config.max_retained_capacity,
            }),
        }
    }

    /// Take an empty buffer, allocating one when the free list is empty.
    pub fn acquire(&self) -> PooledBuffer {
        let buf = match self.inner.free_rx.try_recv() {
            Ok(buf) => buf,
            Err(_) => {
                metrics::record_pool_miss();
                BytesMut::with_capacity(self.inner.initial_capacity)
            }
        };
        debug_assert!(buf.is_empty(), "pooled buffer returned dirty");

        PooledBuffer {
            buf,
            pool: self.inner.clone(),
        }
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.inner.free_rx.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(&PoolConfig::default())
    }
}

/// Exclusive handle to a pooled buffer. Returns it to the pool on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        if buf.capacity() > self.pool.max_retained_capacity {
            return;
        }
        buf.clear();
        // Full free list: let the buffer go.
        let _ = self.pool.free_tx.try_send(buf);
    }
}
