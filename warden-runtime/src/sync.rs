//! # Synchronization Primitives
//!
//! - [`ProtectedCell`]: a value behind one reader-writer lock, with read,
//!   write, optimistic-update and timed-update operations plus access
//!   counters.
//! - [`OrderedMutex`]: a named mutex whose every acquisition is checked
//!   against a shared [`LockOrderRegistry`].
//!
//! ## Design Notes
//!
//! Both wrap `parking_lot` locks, which release on unwind without
//! poisoning. Closures passed to `read`/`write` may panic; the lock and the
//! live-reader counter are restored either way.
//!
//! `optimistic_update` validates by value equality. A value that changes
//! and then changes back between snapshot and commit is indistinguishable
//! from an unchanged one, so the update commits over it.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::deadlock::{LockOrderRegistry, ScopedLockGuard};
use crate::error::Result;

// ============================================================================
// Protected Cell
// ============================================================================

/// Default retry count for [`ProtectedCell::optimistic_update`].
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base back-off between optimistic attempts; attempt `n` waits `n` times this.
const RETRY_BACKOFF: Duration = Duration::from_micros(100);

/// Access statistics for a [`ProtectedCell`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellStats {
    /// The cell's label.
    pub label: String,
    /// Completed and in-flight reads.
    pub reads: u64,
    /// Committed writes.
    pub writes: u64,
    /// Reads in progress right now.
    pub active_readers: usize,
    /// Time since the cell was created.
    pub lifetime: Duration,
}

/// Decrements the live-reader counter on every exit path.
struct ReaderTally<'a>(&'a AtomicUsize);

impl<'a> ReaderTally<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ReaderTally<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A value shared between threads behind a reader-writer lock.
///
/// Many reads proceed concurrently; a write excludes all reads and writes.
pub struct ProtectedCell<T> {
    value: RwLock<T>,
    label: String,
    reads: AtomicU64,
    writes: AtomicU64,
    active_readers: AtomicUsize,
    created_at: Instant,
}

impl<T> ProtectedCell<T> {
    /// Create a cell holding `value`.
    pub fn new(label: impl Into<String>, value: T) -> Self {
        Self {
            value: RwLock::new(value),
            label: label.into(),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            active_readers: AtomicUsize::new(0),
            created_at: Instant::now(),
        }
    }

    /// The cell's label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run `f` with shared access to the value.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.value.read();
        self.reads.fetch_add(1, Ordering::Relaxed);
        let _tally = ReaderTally::enter(&self.active_readers);
        f(&guard)
    }

    /// Run `f` with exclusive access to the value.
    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.value.write();
        self.writes.fetch_add(1, Ordering::Relaxed);
        f(&mut guard)
    }

    /// Like [`write`](Self::write), but give up after `timeout`.
    ///
    /// Returns false without calling `f` if the lock was not acquired.
    pub fn try_write_for(&self, timeout: Duration, f: impl FnOnce(&mut T)) -> bool {
        match self.value.try_write_for(timeout) {
            Some(mut guard) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                f(&mut guard);
                true
            }
            None => false,
        }
    }

    /// Replace the value.
    pub fn set(&self, value: T) {
        self.write(|v| *v = value);
    }

    /// Access counters and lifetime.
    pub fn stats(&self) -> CellStats {
        CellStats {
            label: self.label.clone(),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            active_readers: self.active_readers.load(Ordering::Acquire),
            lifetime: self.created_at.elapsed(),
        }
    }

    /// Consume the cell, returning the value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Clone> ProtectedCell<T> {
    /// Clone the current value.
    pub fn snapshot(&self) -> T {
        self.read(T::clone)
    }
}

impl<T: Clone + PartialEq> ProtectedCell<T> {
    /// Compute a new value from a snapshot without holding the lock, then
    /// commit it only if the value is still equal to that snapshot.
    ///
    /// Retries up to `max_retries` times with a linear back-off between
    /// attempts. Returns false if no attempt committed.
    ///
    /// Validation is by equality, so a value that was changed and then
    /// changed back between snapshot and commit is not detected.
    pub fn optimistic_update(&self, max_retries: u32, mut f: impl FnMut(&T) -> T) -> bool {
        for attempt in 1..=max_retries {
            let snapshot = self.snapshot();
            let candidate = f(&snapshot);

            {
                let mut guard = self.value.write();
                if *guard == snapshot {
                    *guard = candidate;
                    self.writes.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
            }

            if attempt < max_retries {
                thread::sleep(RETRY_BACKOFF * attempt);
            }
        }
        false
    }
}

impl<T: Default> Default for ProtectedCell<T> {
    fn default() -> Self {
        Self::new("unnamed", T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for ProtectedCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ProtectedCell");
        d.field("label", &self.label);
        match self.value.try_read() {
            Some(guard) => d.field("value", &*guard),
            None => d.field("value", &format_args!("<locked>")),
        };
        d.finish()
    }
}

// ============================================================================
// Ordered Mutex
// ============================================================================

/// A named mutex whose acquisitions go through a [`LockOrderRegistry`].
pub struct OrderedMutex<T> {
    /// Unique mutex ID for debugging.
    id: u64,
    name: String,
    inner: Mutex<T>,
    registry: Arc<LockOrderRegistry>,
}

/// Guard returned by [`OrderedMutex::lock`].
pub struct OrderedMutexGuard<'a, T> {
    inner: ScopedLockGuard<'a, MutexGuard<'a, T>>,
}

impl<T> OrderedMutex<T> {
    /// Create a mutex and register its name with `registry`.
    ///
    /// Mutexes may share a name; they then share a hierarchy level and
    /// each holder is tracked on its own.
    pub fn new(name: impl Into<String>, value: T, registry: Arc<LockOrderRegistry>) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let name = name.into();
        registry.register_lock_type(&name);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name,
            inner: Mutex::new(value),
            registry,
        }
    }

    /// Get the mutex ID for debugging.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The lock name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether the mutex is currently locked.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Acquire the mutex after an ordering check.
    ///
    /// Fails with a Runtime error, without blocking, if acquiring now could
    /// deadlock.
    pub fn lock(&self) -> Result<OrderedMutexGuard<'_, T>> {
        let inner = ScopedLockGuard::acquire(&self.registry, &self.name, || self.inner.lock())?;
        Ok(OrderedMutexGuard { inner })
    }

    /// Acquire the mutex, waiting at most `timeout`.
    ///
    /// `Ok(None)` means the wait timed out.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<Option<OrderedMutexGuard<'_, T>>> {
        let inner = ScopedLockGuard::try_acquire(&self.registry, &self.name, || {
            self.inner.try_lock_for(timeout)
        })?;
        Ok(inner.map(|inner| OrderedMutexGuard { inner }))
    }

    /// Consume the mutex, returning the value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T> Deref for OrderedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for OrderedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: fmt::Debug> fmt::Debug for OrderedMutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T> fmt::Debug for OrderedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedMutex")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("locked", &self.is_locked())
            .finish()
    }
}
