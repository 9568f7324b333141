//! Fixed pool of firmware block buffers.
//!
//! The device sets aside a handful of block-sized buffers at startup;
//! streaming backpressure is expressed by this pool running dry.
//! Acquisition blocks with a periodic retry rather than failing fast:
//! blocks turn over within one processing cycle, so a free slot is
//! expected shortly, and the retry interval keeps the wait preemptible.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
struct PoolInner {
    free: Mutex<Vec<(usize, Vec<u8>)>>,
    retry: Duration,
}

#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
    slots: usize,
    block_size: usize,
}

impl BufferPool {
    pub fn new(slots: usize, block_size: usize, retry: Duration) -> Self {
        let free = (0..slots)
            .map(|slot| (slot, vec![0u8; block_size]))
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                retry,
            }),
            slots,
            block_size,
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn available(&self) -> usize {
        self.inner
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn try_acquire(&self) -> Option<BufferLease> {
        let mut free = self.inner.free.lock().unwrap_or_else(|e| e.into_inner());
        free.pop().map(|(slot, buf)| BufferLease {
            slot,
            buf: Some(buf),
            pool: self.inner.clone(),
        })
    }

    /// Take a free buffer, waiting for one to be released if the pool
    /// is empty.
    pub async fn acquire(&self) -> BufferLease {
        loop {
            if let Some(lease) = self.try_acquire() {
                return lease;
            }
            tracing::debug!("buffer pool exhausted, waiting for a release");
            tokio::time::sleep(self.inner.retry).await;
        }
    }
}

/// Exclusive use of one pool slot; returns the buffer on drop.
#[derive(Debug)]
pub struct BufferLease {
    slot: usize,
    buf: Option<Vec<u8>>,
    pool: Arc<PoolInner>,
}

impl BufferLease {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Copy `payload` into the buffer, growing it only within the block
    /// size it was allocated with.
    pub fn fill(&mut self, payload: &[u8]) {
        let buf = self.buffer_mut();
        buf.clear();
        buf.extend_from_slice(payload);
    }

    fn buffer_mut(&mut self) -> &mut Vec<u8> {
        // Invariant: `buf` is only None after drop.
        self.buf.get_or_insert_with(Vec::new)
    }
}

impl Deref for BufferLease {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for BufferLease {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self.buf.as_deref_mut() {
            Some(buf) => buf,
            None => &mut [],
        }
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            buf.clear();
            let mut free = self.pool.free.lock().unwrap_or_else(|e| e.into_inner());
            free.push((self.slot, buf));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn pool(slots: usize) -> BufferPool {
        BufferPool::new(slots, 4096, Duration::from_millis(5))
    }

    #[tokio::test]
    async fn all_slots_are_acquirable_and_distinct() {
        let pool = pool(4);
        let mut leases = Vec::new();
        for _ in 0..4 {
            leases.push(pool.acquire().await);
        }
        let slots: HashSet<usize> = leases.iter().map(|l| l.slot()).collect();
        assert_eq!(slots.len(), 4);
        assert_eq!(pool.available(), 0);
    }

    #[tokio::test]
    async fn acquisition_blocks_until_a_release() {
        let pool = pool(2);
        let a = pool.acquire().await;
        let _b = pool.acquire().await;

        let pending = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(pending.is_err(), "third acquire should block");

        drop(a);
        let c = tokio::time::timeout(Duration::from_millis(200), pool.acquire())
            .await
            .expect("acquire after release");
        assert_eq!(pool.available(), 0);
        drop(c);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn fill_replaces_previous_contents() {
        let pool = pool(1);
        let mut lease = pool.acquire().await;
        lease.fill(b"block-one");
        assert_eq!(&*lease, b"block-one");
        lease.fill(b"two");
        assert_eq!(&*lease, b"two");
    }

    #[tokio::test]
    async fn released_buffers_come_back_empty() {
        let pool = pool(1);
        let mut lease = pool.acquire().await;
        lease.fill(b"stale data");
        drop(lease);

        let lease = pool.acquire().await;
        assert!(lease.is_empty());
    }
}
