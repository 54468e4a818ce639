// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Bounded pooling of interchangeable buffers with exclusive ownership.
//!
//! The pool is intentionally simple:
//! - a lock-guarded free list
//! - at most `capacity` items ever exist, created lazily by a factory (or up front)
//! - [`PoolOwner<T>`] returns its item to the free list on drop, exactly once
//!
//! An empty free list with the capacity already reached is backpressure, not an error:
//! [`BufferPool::try_acquire`] returns `None` and the caller decides what to skip.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub created: usize,
    pub available: usize,
    pub outstanding: usize,
    pub acquired: u64,
    pub exhausted: u64,
}

struct PoolInner<T> {
    free: Vec<T>,
    capacity: usize,
    created: usize,
    outstanding: usize,
    acquired: u64,
    exhausted: u64,
}

type SharedInner<T> = Arc<Mutex<PoolInner<T>>>;

fn lock<T>(inner: &Mutex<PoolInner<T>>) -> MutexGuard<'_, PoolInner<T>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Thread-safe bounded pool.
pub struct BufferPool<T> {
    inner: SharedInner<T>,
    factory: Arc<dyn Fn() -> T + Send + Sync>,
}

impl<T> Clone for BufferPool<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), factory: self.factory.clone() }
    }
}

impl<T> BufferPool<T> {
    /// Create a pool that allocates items on demand, up to `capacity` in total.
    pub fn with_factory(capacity: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                free: Vec::with_capacity(capacity),
                capacity,
                created: 0,
                outstanding: 0,
                acquired: 0,
                exhausted: 0,
            })),
            factory: Arc::new(factory),
        }
    }

    /// Create a pool with all `capacity` items allocated up front.
    pub fn preallocated(capacity: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        let pool = Self::with_factory(capacity, factory);
        {
            let mut guard = lock(&pool.inner);
            for _ in 0..capacity {
                guard.free.push((pool.factory)());
            }
            guard.created = capacity;
        }
        pool
    }

    /// Take one item. `None` means every item is currently owned.
    pub fn try_acquire(&self) -> Option<PoolOwner<T>> {
        let reused = {
            let mut guard = lock(&self.inner);
            let reused = guard.free.pop();
            if reused.is_none() {
                if guard.created >= guard.capacity {
                    guard.exhausted += 1;
                    tracing::trace!(capacity = guard.capacity, "Buffer pool exhausted");
                    return None;
                }
                // Reserve the slot now, build the item outside the lock.
                guard.created += 1;
            }
            guard.outstanding += 1;
            guard.acquired += 1;
            reused
        };

        let item = reused.unwrap_or_else(|| (self.factory)());
        Some(PoolOwner { item: Some(item), pool: Arc::downgrade(&self.inner) })
    }

    pub fn capacity(&self) -> usize {
        lock(&self.inner).capacity
    }

    pub fn stats(&self) -> PoolStats {
        let guard = lock(&self.inner);
        PoolStats {
            capacity: guard.capacity,
            created: guard.created,
            available: guard.free.len(),
            outstanding: guard.outstanding,
            acquired: guard.acquired,
            exhausted: guard.exhausted,
        }
    }
}

/// Exclusive owner of one pooled item.
///
/// The item goes back to the pool when the owner is dropped or [`released`](Self::release).
/// If the pool itself is gone the item is simply freed.
pub struct PoolOwner<T> {
    item: Option<T>,
    pool: Weak<Mutex<PoolInner<T>>>,
}

impl<T> PoolOwner<T> {
    /// Return the item to the pool now.
    pub fn release(self) {
        drop(self);
    }

    fn item(&self) -> &T {
        match &self.item {
            Some(item) => item,
            None => unreachable!("pool owner is only emptied on drop"),
        }
    }

    fn item_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("pool owner is only emptied on drop"),
        }
    }
}

impl<T> Deref for PoolOwner<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item()
    }
}

impl<T> DerefMut for PoolOwner<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item_mut()
    }
}

impl<T> Drop for PoolOwner<T> {
    fn drop(&mut self) {
        let Some(item) = self.item.take() else { return };
        let Some(inner) = self.pool.upgrade() else { return };
        let mut guard = lock(&inner);
        guard.outstanding = guard.outstanding.saturating_sub(1);
        guard.free.push(item);
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for PoolOwner<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolOwner")
            .field("item", &self.item)
            .field("pooled", &(self.pool.strong_count() > 0))
            .finish()
    }
}

/// Pool-backed writer into a bounded channel.
///
/// A producer asks for a free item with [`try_get`](Self::try_get), fills it, and hands it
/// downstream with [`send`](Self::send). The receiver releases items by dropping them. When the
/// channel is full or closed the sender releases the item itself and the write is dropped.
pub struct PooledSender<T> {
    pool: BufferPool<T>,
    tx: mpsc::Sender<PoolOwner<T>>,
}

impl<T> Clone for PooledSender<T> {
    fn clone(&self) -> Self {
        Self { pool: self.pool.clone(), tx: self.tx.clone() }
    }
}

impl<T> PooledSender<T> {
    pub const fn new(pool: BufferPool<T>, tx: mpsc::Sender<PoolOwner<T>>) -> Self {
        Self { pool, tx }
    }

    /// Create a pool of `capacity` items and a channel able to hold all of them.
    pub fn channel(
        capacity: usize,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> (Self, mpsc::Receiver<PoolOwner<T>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(BufferPool::with_factory(capacity, factory), tx), rx)
    }

    pub fn try_get(&self) -> Option<PoolOwner<T>> {
        self.pool.try_acquire()
    }

    /// Transfer ownership downstream. Returns `false` if the item was dropped instead.
    pub fn send(&self, owner: PoolOwner<T>) -> bool {
        match self.tx.try_send(owner) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(owner)) => {
                owner.release();
                tracing::warn!("Pooled channel full, dropping item");
                false
            },
            Err(mpsc::error::TrySendError::Closed(owner)) => {
                owner.release();
                tracing::debug!("Pooled channel closed, dropping item");
                false
            },
        }
    }

    pub const fn pool(&self) -> &BufferPool<T> {
        &self.pool
    }
}
