//! Bounded, thread-safe pools of reusable objects.
//!
//! A pool hands out an idle object when it has one and constructs a new one
//! on a miss. Returned objects are kept only if the recycle predicate accepts
//! them and there is room; otherwise they are dropped.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

type Creator<T> = Box<dyn Fn() -> T + Send + Sync>;
type Recycler<T> = Box<dyn Fn(&mut T) -> bool + Send + Sync>;

/// Snapshot of a pool's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Objects constructed because the pool was empty.
    pub created: u64,
    /// Objects accepted back by the recycle predicate.
    pub recycled: u64,
    /// Total `get` calls.
    pub polled: u64,
    /// Total `offer` calls.
    pub offered: u64,
}

impl PoolStats {
    /// Objects currently lent out (polled but not yet offered back).
    pub fn outstanding(&self) -> u64 {
        self.polled.saturating_sub(self.offered)
    }
}

/// Bounded pool with create/recycle counters.
///
/// Idle objects sit on a LIFO free list so the most recently used object,
/// likely still warm in cache, is handed out first.
pub struct ObjectPool<T> {
    free: Mutex<Vec<T>>,
    max_idle: usize,
    creator: Creator<T>,
    recycler: Recycler<T>,
    created: AtomicU64,
    recycled: AtomicU64,
    polled: AtomicU64,
    offered: AtomicU64,
}

impl<T> ObjectPool<T> {
    /// Create a pool holding at most `max_idle` idle objects.
    ///
    /// `recycler` runs on every offered object; it may reset the object and
    /// returns whether the object is fit for reuse.
    pub fn new(
        max_idle: usize,
        creator: impl Fn() -> T + Send + Sync + 'static,
        recycler: impl Fn(&mut T) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_idle: max_idle.max(1),
            creator: Box::new(creator),
            recycler: Box::new(recycler),
            created: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
            polled: AtomicU64::new(0),
            offered: AtomicU64::new(0),
        }
    }

    /// Take an idle object, constructing one if none is available.
    pub fn get(&self) -> T {
        self.polled.fetch_add(1, Ordering::Relaxed);
        let idle = self.free().pop();
        match idle {
            Some(item) => item,
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                (self.creator)()
            }
        }
    }

    /// Return an object to the pool.
    ///
    /// Dropped if the recycle predicate rejects it or the pool is full.
    pub fn offer(&self, mut item: T) {
        self.offered.fetch_add(1, Ordering::Relaxed);
        if !(self.recycler)(&mut item) {
            return;
        }
        self.recycled.fetch_add(1, Ordering::Relaxed);
        let mut free = self.free();
        if free.len() < self.max_idle {
            free.push(item);
        }
    }

    /// Number of idle objects currently pooled.
    pub fn idle(&self) -> usize {
        self.free().len()
    }

    /// Maximum number of idle objects kept.
    pub fn capacity(&self) -> usize {
        self.max_idle
    }

    /// Current counter values.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            polled: self.polled.load(Ordering::Relaxed),
            offered: self.offered.load(Ordering::Relaxed),
        }
    }
}

impl<T> ObjectPool<T> {
    fn free(&self) -> MutexGuard<'_, Vec<T>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("idle", &self.idle())
            .field("capacity", &self.capacity())
            .field("stats", &self.stats())
            .finish()
    }
}
