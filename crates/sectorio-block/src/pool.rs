//! Bounded descriptor pool
//!
//! A fixed set of independently opened descriptors to the same backing
//! store, created at connect time and never grown. Every descriptor is
//! positioned explicitly before each transfer (positioned I/O only, no
//! shared cursor), so descriptors are interchangeable.
//!
//! `acquire` suspends when the pool is empty and resumes when a release
//! signals availability. Acquire order is whatever the semaphore wakes;
//! eventual progress under bounded contention is guaranteed, strict FIFO
//! fairness is not.

use std::fs::File;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::error::{BlockError, BlockResult};

/// Extra descriptors opened at connect, on top of the initial probe
/// descriptor. Bounds the number of in-flight transfers per handle.
pub const POOL_SIZE: usize = 16;

#[derive(Debug)]
pub(crate) struct DescriptorPool {
    free: Mutex<Vec<Arc<File>>>,
    slots: Semaphore,
    drained: AtomicBool,
}

impl DescriptorPool {
    /// Build a pool over descriptors already opened to the same store.
    pub(crate) fn new(descriptors: Vec<Arc<File>>) -> Self {
        let capacity = descriptors.len();
        Self {
            free: Mutex::new(descriptors),
            slots: Semaphore::new(capacity),
            drained: AtomicBool::new(false),
        }
    }

    /// Pop a free descriptor, suspending until one is released if the pool
    /// is empty. Fails with `Disconnected` once the pool has been drained.
    pub(crate) async fn acquire(&self) -> BlockResult<PooledFd<'_>> {
        let permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| BlockError::Disconnected)?;
        // The permit is re-added when the guard drops.
        permit.forget();
        let file = {
            let mut free = self.free.lock();
            free.pop()
        };
        match file {
            Some(file) => Ok(PooledFd {
                file,
                pool: self,
            }),
            // Raced with drain: the permit was granted before close() but the
            // free list is already empty.
            None => Err(BlockError::Disconnected),
        }
    }

    /// Close every pooled descriptor and fail all pending and future
    /// acquires. Descriptors currently held by in-flight operations are
    /// closed when those operations release them.
    pub(crate) fn drain(&self) {
        self.drained.store(true, Ordering::SeqCst);
        self.slots.close();
        let descriptors = {
            let mut free = self.free.lock();
            std::mem::take(&mut *free)
        };
        // Dropping the last Arc closes the file.
        drop(descriptors);
    }
}

/// RAII guard for a pooled descriptor: the descriptor returns to the pool
/// and exactly one waiter is woken on every exit path, success or error.
pub(crate) struct PooledFd<'a> {
    file: Arc<File>,
    pool: &'a DescriptorPool,
}

impl PooledFd<'_> {
    /// Owned reference to the descriptor, movable into a blocking task.
    pub(crate) fn file(&self) -> Arc<File> {
        Arc::clone(&self.file)
    }
}

impl Drop for PooledFd<'_> {
    fn drop(&mut self) {
        if self.pool.drained.load(Ordering::SeqCst) {
            // Pool already torn down; let the descriptor close instead of
            // parking it in the free list forever.
            return;
        }
        self.pool.free.lock().push(Arc::clone(&self.file));
        self.pool.slots.add_permits(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(n: usize) -> DescriptorPool {
        let descriptors = (0..n)
            .map(|_| Arc::new(tempfile::tempfile().unwrap()))
            .collect();
        DescriptorPool::new(descriptors)
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let pool = pool_of(2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        drop(a);
        let c = pool.acquire().await.unwrap();
        drop(b);
        drop(c);
    }

    #[tokio::test]
    async fn test_acquire_suspends_until_release() {
        let pool = Arc::new(pool_of(1));
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let fd = pool.acquire().await.unwrap();
                drop(fd);
            })
        };

        // Give the waiter a chance to park on the semaphore.
        tokio::task::yield_now().await;
        drop(held);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_drained_pool_rejects_acquire() {
        let pool = pool_of(2);
        pool.drain();
        assert!(matches!(
            pool.acquire().await,
            Err(BlockError::Disconnected)
        ));
    }
}
