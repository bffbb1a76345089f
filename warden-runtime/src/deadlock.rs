//! # Lock-Order Registry
//!
//! Best-effort deadlock prevention for named locks.
//!
//! ## Design
//!
//! - Every lock name gets a hierarchy level the first time it is seen.
//!   Levels increase monotonically in first-seen order.
//! - Each thread's held locks are kept in acquisition order. A thread may
//!   acquire a lock only if it holds nothing ranked above it.
//! - A second check catches the direct two-thread case: some other owner
//!   of the target lock name holds a lock name the calling thread also
//!   holds. Several locks may share a name; each holder is tracked
//!   separately and a release only drops the releasing thread's entry.
//! - [`ScopedLockGuard`] routes a real lock acquisition through
//!   [`LockOrderRegistry::can_acquire_safely`] and deregisters on drop.
//!
//! ## Limitations
//!
//! The mutual-hold check compares two threads' held-name sets only. Cycles
//! spanning three or more threads are not detected; there is no wait-for
//! graph. [`LockOrderRegistry::analyze`] likewise only looks for adjacent
//! ordering inversions in each thread's held list.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::thread::{self, ThreadId};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{Result, WardenError};

/// One current holder of a named lock.
#[derive(Debug, Clone, Copy)]
struct Ownership {
    thread: ThreadId,
    acquired_at: Instant,
}

#[derive(Debug, Default)]
struct RegistryState {
    hierarchy: HashMap<String, usize>,
    next_level: usize,
    held: HashMap<ThreadId, Vec<String>>,
    owners: HashMap<String, Vec<Ownership>>,
}

impl RegistryState {
    fn register(&mut self, name: &str) -> usize {
        if let Some(&level) = self.hierarchy.get(name) {
            return level;
        }
        let level = self.next_level;
        self.next_level += 1;
        self.hierarchy.insert(name.to_string(), level);
        level
    }

    fn level(&self, name: &str) -> Option<usize> {
        self.hierarchy.get(name).copied()
    }
}

/// Result of [`LockOrderRegistry::analyze`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadlockReport {
    /// Whether any ordering inversion was found.
    pub potential_deadlock: bool,
    /// Lock names involved in inversions, without duplicates.
    pub involved_locks: Vec<String>,
    /// Threads holding inverted locks.
    pub involved_threads: Vec<ThreadId>,
    /// Human-readable summary.
    pub description: String,
}

/// Registry of lock names, hierarchy levels and per-thread holdings.
pub struct LockOrderRegistry {
    state: Mutex<RegistryState>,
}

impl LockOrderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Assign the next hierarchy level to `name` if unseen. Returns its level.
    pub fn register_lock_type(&self, name: &str) -> usize {
        self.state.lock().register(name)
    }

    /// Hierarchy level of `name`, if registered.
    pub fn hierarchy_level(&self, name: &str) -> Option<usize> {
        self.state.lock().level(name)
    }

    /// Whether the calling thread may acquire `name` without risking an
    /// ordering deadlock. Unknown names are registered and always safe.
    pub fn can_acquire_safely(&self, name: &str) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();

        let target = match state.level(name) {
            Some(level) => level,
            None => {
                state.register(name);
                return true;
            }
        };

        let mine = match state.held.get(&me) {
            Some(held) => held,
            None => return true,
        };

        let out_of_order = mine
            .iter()
            .any(|held| state.level(held).map_or(false, |level| level > target));
        if out_of_order {
            warn!(lock = name, "lock hierarchy violation");
            return false;
        }

        let owners = state.owners.get(name).map_or(&[][..], Vec::as_slice);
        let mutual = owners
            .iter()
            .filter(|owner| owner.thread != me)
            .filter_map(|owner| state.held.get(&owner.thread))
            .any(|theirs| theirs.iter().any(|held| mine.contains(held)));
        if mutual {
            warn!(lock = name, "mutual hold between threads");
            return false;
        }

        true
    }

    /// Record that the calling thread acquired `name`.
    pub fn register_lock_acquisition(&self, name: &str) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        state.register(name);
        state.held.entry(me).or_default().push(name.to_string());
        state
            .owners
            .entry(name.to_string())
            .or_default()
            .push(Ownership {
                thread: me,
                acquired_at: Instant::now(),
            });
    }

    /// Record that the calling thread released one hold of `name`.
    pub fn register_lock_release(&self, name: &str) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if let Some(held) = state.held.get_mut(&me) {
            if let Some(pos) = held.iter().rposition(|held| held == name) {
                held.remove(pos);
            }
            if held.is_empty() {
                state.held.remove(&me);
            }
        }
        if let Some(owners) = state.owners.get_mut(name) {
            if let Some(pos) = owners.iter().rposition(|owner| owner.thread == me) {
                owners.remove(pos);
            }
            if owners.is_empty() {
                state.owners.remove(name);
            }
        }
    }

    /// Locks held by `thread`, in acquisition order.
    pub fn held_locks(&self, thread: ThreadId) -> Vec<String> {
        self.state
            .lock()
            .held
            .get(&thread)
            .cloned()
            .unwrap_or_default()
    }

    /// Locks held by the calling thread, in acquisition order.
    pub fn held_by_current(&self) -> Vec<String> {
        self.held_locks(thread::current().id())
    }

    /// Earliest current holder of `name` and how long it has held it.
    pub fn owner(&self, name: &str) -> Option<(ThreadId, std::time::Duration)> {
        self.state
            .lock()
            .owners
            .get(name)
            .and_then(|owners| owners.first())
            .map(|o| (o.thread, o.acquired_at.elapsed()))
    }

    /// Number of current holders of `name`.
    pub fn holder_count(&self, name: &str) -> usize {
        self.state.lock().owners.get(name).map_or(0, Vec::len)
    }

    /// Scan every thread's held list for adjacent ordering inversions.
    pub fn analyze(&self) -> DeadlockReport {
        let state = self.state.lock();
        let mut report = DeadlockReport::default();

        for (thread, held) in &state.held {
            let inverted = held.windows(2).any(|pair| {
                match (state.level(&pair[0]), state.level(&pair[1])) {
                    (Some(first), Some(second)) => first > second,
                    _ => false,
                }
            });
            if inverted {
                report.potential_deadlock = true;
                report.involved_threads.push(*thread);
                for name in held {
                    if !report.involved_locks.contains(name) {
                        report.involved_locks.push(name.clone());
                    }
                }
            }
        }

        report.description = if report.potential_deadlock {
            format!(
                "lock hierarchy violation detected on {} thread(s)",
                report.involved_threads.len()
            )
        } else {
            "no lock ordering violations".to_string()
        };
        report
    }
}

impl Default for LockOrderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockOrderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LockOrderRegistry")
            .field("lock_types", &state.hierarchy.len())
            .field("threads_holding", &state.held.len())
            .finish()
    }
}

// ============================================================================
// Scoped Guard
// ============================================================================

/// A lock guard whose acquisition was checked against a registry.
///
/// Dropping the guard deregisters the name, then releases the inner guard.
pub struct ScopedLockGuard<'r, G> {
    guard: G,
    registry: &'r LockOrderRegistry,
    name: String,
}

impl<'r, G> ScopedLockGuard<'r, G> {
    /// Check `name` against the registry, then acquire with `lock`.
    ///
    /// Fails without calling `lock` if the acquisition is unsafe.
    pub fn acquire<F>(registry: &'r LockOrderRegistry, name: &str, lock: F) -> Result<Self>
    where
        F: FnOnce() -> G,
    {
        if !registry.can_acquire_safely(name) {
            return Err(WardenError::potential_deadlock(name));
        }
        let guard = lock();
        registry.register_lock_acquisition(name);
        Ok(Self {
            guard,
            registry,
            name: name.to_string(),
        })
    }

    /// Check `name`, then attempt a bounded acquisition with `try_lock`.
    ///
    /// Returns `Ok(None)` when `try_lock` gives up.
    pub fn try_acquire<F>(
        registry: &'r LockOrderRegistry,
        name: &str,
        try_lock: F,
    ) -> Result<Option<Self>>
    where
        F: FnOnce() -> Option<G>,
    {
        if !registry.can_acquire_safely(name) {
            return Err(WardenError::potential_deadlock(name));
        }
        Ok(try_lock().map(|guard| {
            registry.register_lock_acquisition(name);
            Self {
                guard,
                registry,
                name: name.to_string(),
            }
        }))
    }

    /// The registered lock name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<G: Deref> Deref for ScopedLockGuard<'_, G> {
    type Target = G::Target;

    fn deref(&self) -> &G::Target {
        &self.guard
    }
}

impl<G: DerefMut> DerefMut for ScopedLockGuard<'_, G> {
    fn deref_mut(&mut self) -> &mut G::Target {
        &mut self.guard
    }
}

impl<G> Drop for ScopedLockGuard<'_, G> {
    fn drop(&mut self) {
        self.registry.register_lock_release(&self.name);
    }
}

impl<G> fmt::Debug for ScopedLockGuard<'_, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedLockGuard")
            .field("name", &self.name)
            .finish()
    }
}

/// Acquire a `parking_lot`-style lock through a registry check.
///
/// Expands to a `Result<ScopedLockGuard<_>, WardenError>`.
///
/// ```rust
/// use parking_lot::Mutex;
/// use warden_runtime::{scoped_lock, LockOrderRegistry};
///
/// let registry = LockOrderRegistry::new();
/// let accounts = Mutex::new(0u32);
/// let mut guard = scoped_lock!(registry, accounts, "accounts").unwrap();
/// *guard += 1;
/// ```
#[macro_export]
macro_rules! scoped_lock {
    ($registry:expr, $lock:expr, $name:expr) => {
        $crate::deadlock::ScopedLockGuard::acquire(&$registry, $name, || $lock.lock())
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_levels_follow_first_seen_order() {
        let registry = LockOrderRegistry::new();
        assert_eq!(registry.register_lock_type("a"), 0);
        assert_eq!(registry.register_lock_type("b"), 1);
        assert_eq!(registry.register_lock_type("a"), 0);
        assert_eq!(registry.hierarchy_level("b"), Some(1));
        assert_eq!(registry.hierarchy_level("c"), None);
    }

    #[test]
    fn test_unknown_name_is_safe_and_registered() {
        let registry = LockOrderRegistry::new();
        assert!(registry.can_acquire_safely("fresh"));
        assert_eq!(registry.hierarchy_level("fresh"), Some(0));
    }

    #[test]
    fn test_ascending_order_allowed() {
        let registry = LockOrderRegistry::new();
        registry.register_lock_type("A");
        registry.register_lock_type("B");

        assert!(registry.can_acquire_safely("A"));
        registry.register_lock_acquisition("A");
        assert!(registry.can_acquire_safely("B"));
        registry.register_lock_acquisition("B");

        assert_eq!(registry.held_by_current(), vec!["A", "B"]);
        registry.register_lock_release("B");
        registry.register_lock_release("A");
        assert!(registry.held_by_current().is_empty());
    }

    #[test]
    fn test_descending_order_refused() {
        let registry = LockOrderRegistry::new();
        registry.register_lock_type("A");
        registry.register_lock_type("B");

        registry.register_lock_acquisition("B");
        assert!(!registry.can_acquire_safely("A"));
        registry.register_lock_release("B");
        assert!(registry.can_acquire_safely("A"));
    }

    #[test]
    fn test_mutual_hold_refused() {
        let registry = Arc::new(LockOrderRegistry::new());
        registry.register_lock_type("shared");
        registry.register_lock_type("target");

        // Another thread holds both "shared" and "target".
        let other = Arc::clone(&registry);
        let (held_tx, held_rx) = crossbeam_channel::bounded(0);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        let holder = thread::spawn(move || {
            other.register_lock_acquisition("shared");
            other.register_lock_acquisition("target");
            held_tx.send(()).unwrap();
            done_rx.recv().unwrap();
            other.register_lock_release("target");
            other.register_lock_release("shared");
        });
        held_rx.recv().unwrap();

        // We also hold "shared", and want "target" from its owner.
        registry.register_lock_acquisition("shared");
        assert!(!registry.can_acquire_safely("target"));
        registry.register_lock_release("shared");

        done_tx.send(()).unwrap();
        holder.join().unwrap();
    }

    #[test]
    fn test_release_of_shared_name_keeps_other_holders() {
        let registry = Arc::new(LockOrderRegistry::new());
        registry.register_lock_type("shared");
        registry.register_lock_type("target");

        let other = Arc::clone(&registry);
        let (held_tx, held_rx) = crossbeam_channel::bounded(0);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        let holder = thread::spawn(move || {
            other.register_lock_acquisition("shared");
            other.register_lock_acquisition("target");
            held_tx.send(()).unwrap();
            done_rx.recv().unwrap();
            other.register_lock_release("target");
            other.register_lock_release("shared");
        });
        held_rx.recv().unwrap();
        let holder_id = holder.thread().id();

        // A second lock instance named "target" is taken and dropped elsewhere.
        let transient = Arc::clone(&registry);
        thread::spawn(move || {
            transient.register_lock_acquisition("target");
            assert_eq!(transient.holder_count("target"), 2);
            transient.register_lock_release("target");
        })
        .join()
        .unwrap();

        assert_eq!(registry.holder_count("target"), 1);
        assert_eq!(registry.owner("target").map(|(id, _)| id), Some(holder_id));
        registry.register_lock_acquisition("shared");
        assert!(!registry.can_acquire_safely("target"));
        registry.register_lock_release("shared");

        done_tx.send(()).unwrap();
        holder.join().unwrap();
        assert_eq!(registry.holder_count("target"), 0);
        assert!(registry.owner("target").is_none());
    }

    #[test]
    fn test_analyze_reports_inversion() {
        let registry = LockOrderRegistry::new();
        registry.register_lock_type("low");
        registry.register_lock_type("high");

        assert!(!registry.analyze().potential_deadlock);

        // Bypass the check to record an inverted acquisition.
        registry.register_lock_acquisition("high");
        registry.register_lock_acquisition("low");

        let report = registry.analyze();
        assert!(report.potential_deadlock);
        assert_eq!(report.involved_locks, vec!["high", "low"]);
        assert_eq!(report.involved_threads, vec![thread::current().id()]);
        assert!(report.description.contains("violation"));

        registry.register_lock_release("low");
        registry.register_lock_release("high");
        assert!(!registry.analyze().potential_deadlock);
    }

    #[test]
    fn test_scoped_guard_registers_and_releases() {
        let registry = LockOrderRegistry::new();
        let data = parking_lot::Mutex::new(5);
        {
            let mut guard = ScopedLockGuard::acquire(&registry, "data", || data.lock()).unwrap();
            *guard += 1;
            assert_eq!(registry.held_by_current(), vec!["data"]);
            assert!(registry.owner("data").is_some());
        }
        assert!(registry.held_by_current().is_empty());
        assert!(registry.owner("data").is_none());
        assert_eq!(*data.lock(), 6);
    }

    #[test]
    fn test_scoped_guard_refuses_without_locking() {
        let registry = LockOrderRegistry::new();
        let low = parking_lot::Mutex::new(());
        let high = parking_lot::Mutex::new(());
        registry.register_lock_type("low");
        registry.register_lock_type("high");

        let _high = ScopedLockGuard::acquire(&registry, "high", || high.lock()).unwrap();
        let mut called = false;
        let err = ScopedLockGuard::acquire(&registry, "low", || {
            called = true;
            low.lock()
        })
        .unwrap_err();
        assert!(err.is_runtime());
        assert!(err.message().contains("low"));
        assert!(!called);
        assert!(!low.is_locked());
    }

    #[test]
    fn test_try_acquire_timeout() {
        let registry = LockOrderRegistry::new();
        let data = parking_lot::Mutex::new(());
        let _held = data.lock();

        let result = ScopedLockGuard::try_acquire(&registry, "busy", || {
            data.try_lock_for(std::time::Duration::from_millis(5))
        })
        .unwrap();
        assert!(result.is_none());
        assert!(registry.held_by_current().is_empty());
    }

    #[test]
    fn test_scoped_lock_macro() {
        let registry = LockOrderRegistry::new();
        let counter = parking_lot::Mutex::new(0);
        {
            let mut guard = scoped_lock!(registry, counter, "counter").unwrap();
            *guard += 2;
        }
        assert_eq!(*counter.lock(), 2);
    }
}
