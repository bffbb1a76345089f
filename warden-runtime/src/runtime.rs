//! # Runtime Context
//!
//! [`Runtime`] owns one instance of every subsystem and is the entry point
//! for client code. There is no process-wide instance: construct one at
//! startup and pass it by reference (or inside an `Arc`) to whatever needs
//! it.
//!
//! ## Ownership
//!
//! ```text
//! Runtime
//!   ├── Arc<GuardedAllocator> ◄── Reclaimer (background thread)
//!   ├── WorkerPool (worker threads)
//!   ├── Arc<LockOrderRegistry> ◄── OrderedMutex handles
//!   └── Arc<PerfCounters> ◄── VectorOps
//! ```
//!
//! ## Shutdown
//!
//! `shutdown` stops the pool first so no new work arrives, then the
//! reclaimer, then releases every block still registered. It is idempotent
//! and also runs on drop. Afterwards, operations that would start new work
//! fail with [`WardenError::shut_down`].

use std::fmt;
use std::ops::{Add, Mul};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::cache;
use crate::config::RuntimeConfig;
use crate::deadlock::{DeadlockReport, LockOrderRegistry};
use crate::error::{Result, WardenError};
use crate::memory::{BlockSnapshot, GuardedAllocator, GuardedHandle, MemoryStats};
use crate::observability::{PerfCounters, PerformanceReport, SystemHealthReport};
use crate::pool::{PoolStats, TaskHandle, WorkerPool};
use crate::reclaimer::{ReclaimStats, Reclaimer};
use crate::simd::VectorOps;
use crate::sync::{OrderedMutex, ProtectedCell};

/// The runtime context.
pub struct Runtime {
    config: RuntimeConfig,
    allocator: Arc<GuardedAllocator>,
    reclaimer: Reclaimer,
    pool: WorkerPool,
    locks: Arc<LockOrderRegistry>,
    counters: Arc<PerfCounters>,
    vectors: VectorOps,
    shut_down: AtomicBool,
}

impl Runtime {
    /// Validate `config` and start every subsystem.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;

        let allocator = Arc::new(GuardedAllocator::new(config.memory.clone()));
        let reclaimer = if config.reclaimer.enabled {
            Reclaimer::start(Arc::clone(&allocator), config.reclaimer.clone())?
        } else {
            Reclaimer::manual(Arc::clone(&allocator), config.reclaimer.clone())
        };
        let pool = WorkerPool::new(config.pool.clone())?;
        let counters = Arc::new(PerfCounters::new());
        let vectors = VectorOps::new(Arc::clone(&counters));

        info!(
            workers = pool.worker_count(),
            simd = %vectors.level(),
            reclaimer = reclaimer.is_running(),
            "runtime started"
        );

        Ok(Self {
            config,
            allocator,
            reclaimer,
            pool,
            locks: Arc::new(LockOrderRegistry::new()),
            counters,
            vectors,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Start a runtime configured from `WARDEN_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(RuntimeConfig::from_env())
    }

    /// The configuration this runtime was started with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The allocator.
    pub fn allocator(&self) -> &Arc<GuardedAllocator> {
        &self.allocator
    }

    /// The worker pool.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// The lock-order registry shared by this runtime's named locks.
    pub fn lock_registry(&self) -> &Arc<LockOrderRegistry> {
        &self.locks
    }

    /// The performance counters owned by this runtime.
    pub fn counters(&self) -> &Arc<PerfCounters> {
        &self.counters
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(WardenError::shut_down())
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Memory
    // ========================================================================

    /// Allocate `count` default-initialized elements.
    pub fn allocate<T>(&self, count: usize, context: &str) -> Result<GuardedHandle<T>>
    where
        T: Default + Send + 'static,
    {
        self.ensure_running()?;
        self.allocator.allocate(count, context)
    }

    /// Allocate `count` elements on a cache line boundary.
    pub fn allocate_cache_aligned<T>(&self, count: usize, context: &str) -> Result<GuardedHandle<T>>
    where
        T: Default + Send + 'static,
    {
        self.ensure_running()?;
        self.allocator.allocate_cache_aligned(count, context)
    }

    /// Release the block behind `handle`. Returns false if it was already
    /// gone.
    pub fn deallocate<T>(&self, handle: GuardedHandle<T>) -> bool {
        self.allocator.deallocate(handle.address())
    }

    /// Release the block at `address`. Outstanding handles to it fail on
    /// their next access.
    pub fn deallocate_address(&self, address: usize) -> bool {
        self.allocator.deallocate(address)
    }

    /// Metadata for a live block.
    pub fn block_info(&self, address: usize) -> Option<BlockSnapshot> {
        self.allocator.block_info(address)
    }

    /// Pin or unpin a block against reclamation.
    pub fn protect(&self, address: usize, protected: bool) -> bool {
        self.allocator.protect(address, protected)
    }

    /// Aggregate allocator statistics.
    pub fn memory_stats(&self) -> MemoryStats {
        self.allocator.stats()
    }

    /// Report current system load in `[0, 1]` to the reclaimer.
    pub fn update_system_load(&self, load: f32) {
        self.reclaimer.update_system_load(load);
    }

    /// Ask the reclaimer for a cycle now.
    ///
    /// With the background thread disabled the cycle runs on the caller.
    pub fn request_reclaim(&self) {
        if self.reclaimer.is_running() {
            self.reclaimer.request_cleanup();
        } else {
            self.reclaimer.run_cycle();
        }
    }

    /// Reclaimer activity so far.
    pub fn reclaim_stats(&self) -> ReclaimStats {
        self.reclaimer.stats()
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Run `task` on the least stressed worker.
    pub fn submit<F, R>(&self, task: F) -> Result<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.ensure_running()?;
        self.pool.submit(task)
    }

    /// Pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Send every worker that is due a break to rest. Returns how many.
    pub fn ensure_wellness(&self) -> usize {
        self.pool.ensure_wellness()
    }

    // ========================================================================
    // Locks
    // ========================================================================

    /// Whether the current thread may take `name` without risking deadlock.
    pub fn can_acquire_safely(&self, name: &str) -> bool {
        self.locks.can_acquire_safely(name)
    }

    /// Record that the current thread holds `name`.
    pub fn register_lock_acquisition(&self, name: &str) {
        self.locks.register_lock_acquisition(name);
    }

    /// Record that the current thread released `name`.
    pub fn register_lock_release(&self, name: &str) {
        self.locks.register_lock_release(name);
    }

    /// Inspect current lock ownership for ordering problems.
    pub fn analyze_deadlocks(&self) -> DeadlockReport {
        self.locks.analyze()
    }

    /// A mutex whose acquisitions are checked against this runtime's
    /// lock order.
    pub fn ordered_mutex<T>(&self, name: impl Into<String>, value: T) -> OrderedMutex<T> {
        OrderedMutex::new(name, value, Arc::clone(&self.locks))
    }

    /// A reader-writer protected cell.
    pub fn shared_cell<T>(&self, label: impl Into<String>, value: T) -> ProtectedCell<T> {
        ProtectedCell::new(label, value)
    }

    // ========================================================================
    // Numeric kernels
    // ========================================================================

    /// `out[i] = a[i] + b[i]`.
    pub fn vector_add(&self, a: &[f32], b: &[f32], out: &mut [f32]) -> Result<()> {
        self.vectors.add(a, b, out)
    }

    /// `out[i] = a[i] * b[i]`.
    pub fn vector_mul(&self, a: &[f32], b: &[f32], out: &mut [f32]) -> Result<()> {
        self.vectors.mul(a, b, out)
    }

    /// Sum of `a[i] * b[i]`.
    pub fn dot_product(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        self.vectors.dot(a, b)
    }

    /// Empty vector whose buffer starts on the configured cache line size.
    pub fn aligned_vec<T: Copy>(&self, capacity: usize) -> cache::AlignedVec<T> {
        cache::AlignedVec::with_line_size(capacity, self.config.cache.line_size)
    }

    /// Accumulate `a * b` into `c` using the configured tile size.
    pub fn matrix_multiply<T>(&self, a: &[T], b: &[T], c: &mut [T], n: usize) -> Result<()>
    where
        T: Copy + Default + Add<Output = T> + Mul<Output = T>,
    {
        cache::matrix_multiply_blocked(a, b, c, n, self.config.cache.block_size)
    }

    /// Chunked reduction using the configured chunk length. `init` must be
    /// an identity of `op`.
    pub fn reduce<T, F>(&self, data: &[T], init: T, op: F) -> T
    where
        T: Copy,
        F: Fn(T, T) -> T,
    {
        cache::blocked_reduce_with(data, self.config.cache.reduce_chunk, init, op)
    }

    // ========================================================================
    // Reports
    // ========================================================================

    /// Counters, SIMD utilization and tuning suggestions.
    pub fn performance_report(&self) -> PerformanceReport {
        self.counters.report(&self.config.health)
    }

    /// Zero the performance counters.
    pub fn reset_performance_counters(&self) {
        self.counters.reset();
    }

    /// Snapshot every subsystem and derive recommendations.
    pub fn system_health(&self) -> SystemHealthReport {
        SystemHealthReport::new(
            self.memory_stats(),
            self.pool_stats(),
            self.analyze_deadlocks(),
            self.performance_report(),
            self.reclaim_stats(),
            &self.config.health,
        )
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop the pool, then the reclaimer, then release all blocks.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.shutdown();
        self.reclaimer.shutdown();
        let released = self.allocator.close();
        info!(released_blocks = released, "runtime shut down");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.pool.worker_count())
            .field("simd", &self.vectors.level())
            .field("blocks", &self.allocator.block_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn test_runtime(workers: usize) -> Runtime {
        let config = RuntimeConfig::builder()
            .num_workers(workers)
            .rest_duration(Duration::from_millis(10))
            .reclaimer(false)
            .build()
            .unwrap();
        Runtime::new(config).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RuntimeConfig::builder()
            .stress_threshold(2.0)
            .build_unchecked();
        let err = Runtime::new(config).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_squares_across_two_workers() {
        let rt = test_runtime(2);
        let handles: Vec<_> = (0..10u64)
            .map(|i| rt.submit(move || i * i).unwrap())
            .collect();
        let results: BTreeSet<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let expected: BTreeSet<u64> = (0..10u64).map(|i| i * i).collect();
        assert_eq!(results, expected);
        assert_eq!(rt.pool_stats().total_tasks_completed, 10);
    }

    #[test]
    fn test_allocate_scenario() {
        let rt = test_runtime(1);
        let mut handle = rt.allocate::<f32>(1000, "t").unwrap();
        assert_eq!(handle.len(), 1000);
        assert!(handle.try_index(2000).is_none());
        handle.set(999, 3.5).unwrap();
        assert_eq!(handle.get(999).unwrap(), 3.5);

        let stats = rt.memory_stats();
        assert_eq!(stats.total_allocated, 1000 * 4);
        assert_eq!(stats.block_count, 1);

        assert!(rt.deallocate(handle));
        assert_eq!(rt.memory_stats().total_allocated, 0);
    }

    #[test]
    fn test_deallocate_address_invalidates_handle() {
        let rt = test_runtime(1);
        let handle = rt.allocate::<u32>(4, "t").unwrap();
        assert!(rt.block_info(handle.address()).is_some());
        assert!(rt.deallocate_address(handle.address()));
        assert!(!handle.is_live());
        assert!(handle.get(0).is_err());
        assert!(!rt.deallocate_address(handle.address()));
    }

    #[test]
    fn test_cache_aligned_allocation() {
        let rt = test_runtime(1);
        let handle = rt.allocate_cache_aligned::<u8>(10, "line").unwrap();
        assert_eq!(handle.address() % 64, 0);
    }

    #[test]
    fn test_manual_reclaim_respects_handles() {
        let config = RuntimeConfig::builder()
            .num_workers(1)
            .reclaimer(false)
            .grace_period(Duration::ZERO)
            .build()
            .unwrap();
        let rt = Runtime::new(config).unwrap();

        let kept = rt.allocate::<u64>(8, "kept").unwrap();
        let orphan = rt.allocate::<u64>(8, "orphan").unwrap().address();
        rt.request_reclaim();

        assert!(rt.block_info(kept.address()).is_some());
        assert!(rt.block_info(orphan).is_none());
        assert_eq!(rt.reclaim_stats().blocks_reclaimed, 1);
    }

    #[test]
    fn test_counters_owned_and_reset() {
        let rt = test_runtime(1);
        let a = vec![1.0f32; 32];
        let b = vec![2.0f32; 32];
        let mut out = vec![0.0f32; 32];
        rt.vector_add(&a, &b, &mut out).unwrap();
        rt.vector_mul(&a, &b, &mut out).unwrap();
        assert_eq!(rt.dot_product(&a, &b).unwrap(), 64.0);

        let snapshot = rt.performance_report().counters;
        assert_eq!(snapshot.simd_ops + snapshot.scalar_ops, 3);

        // A second runtime has its own counters.
        let other = test_runtime(1);
        let other_ops = other.performance_report().counters;
        assert_eq!(other_ops.simd_ops + other_ops.scalar_ops, 0);

        rt.reset_performance_counters();
        let snapshot = rt.performance_report().counters;
        assert_eq!(snapshot.simd_ops + snapshot.scalar_ops, 0);
    }

    #[test]
    fn test_kernels_use_configured_geometry() {
        let rt = test_runtime(1);
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [1.0, 0.0, 0.0, 1.0];
        let mut c = [0.0; 4];
        rt.matrix_multiply(&a, &b, &mut c, 2).unwrap();
        assert_eq!(c, a);

        let data: Vec<u32> = (0..3000).collect();
        assert_eq!(rt.reduce(&data, 0, |x, y| x + y), 2999 * 3000 / 2);
    }

    #[test]
    fn test_lock_pass_throughs() {
        let rt = test_runtime(1);
        let first = rt.ordered_mutex("first", 0u32);
        let second = rt.ordered_mutex("second", 0u32);

        {
            let _a = first.lock().unwrap();
            let _b = second.lock().unwrap();
            assert_eq!(rt.lock_registry().held_by_current().len(), 2);
        }

        rt.register_lock_acquisition("second");
        assert!(!rt.can_acquire_safely("first"));
        rt.register_lock_release("second");
        assert!(rt.can_acquire_safely("first"));
        assert!(!rt.analyze_deadlocks().potential_deadlock);
    }

    #[test]
    fn test_shared_cell() {
        let rt = test_runtime(1);
        let cell = rt.shared_cell("counter", 1u32);
        assert!(cell.optimistic_update(3, |v| v + 1));
        assert_eq!(cell.snapshot(), 2);
    }

    #[test]
    fn test_quiet_runtime_is_healthy() {
        let rt = test_runtime(2);
        let health = rt.system_health();
        assert!(health.is_healthy(), "{}", health);
        assert_eq!(health.threading.worker_count, 2);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let rt = test_runtime(2);
        let _handle = rt.allocate::<u8>(16, "t").unwrap();
        rt.shutdown();
        rt.shutdown();

        assert!(rt.is_shut_down());
        assert_eq!(rt.memory_stats().block_count, 0);
        assert!(rt.allocate::<u8>(1, "late").is_err());
        let err = rt.submit(|| 1).unwrap_err();
        assert!(err.is_runtime());
    }

    #[test]
    fn test_aligned_vec_follows_configured_line_size() {
        let config = RuntimeConfig::builder()
            .num_workers(1)
            .reclaimer(false)
            .cache_line_size(128)
            .build()
            .unwrap();
        let rt = Runtime::new(config).unwrap();

        let mut values = rt.aligned_vec::<f32>(10);
        assert_eq!(values.alignment(), 128);
        values.extend([1.0, 2.0, 3.0]);
        assert_eq!(values.as_ptr() as usize % 128, 0);
        assert_eq!(rt.aligned_vec::<u8>(0).alignment(), 128);
    }

    #[test]
    fn test_allocation_racing_shutdown_leaves_no_blocks() {
        let rt = Arc::new(test_runtime(1));
        let allocators: Vec<_> = (0..4)
            .map(|_| {
                let rt = Arc::clone(&rt);
                std::thread::spawn(move || {
                    let mut kept = Vec::new();
                    while let Ok(handle) = rt.allocate::<u32>(4, "race") {
                        kept.push(handle);
                    }
                    kept
                })
            })
            .collect();

        std::thread::sleep(Duration::from_millis(5));
        rt.shutdown();
        for thread in allocators {
            assert!(thread.join().unwrap().iter().all(|h| !h.is_live()));
        }
        assert_eq!(rt.memory_stats().block_count, 0);
    }

    #[test]
    fn test_drop_stops_workers() {
        let rt = test_runtime(2);
        let handle = rt.submit(|| 7).unwrap();
        assert_eq!(handle.join().unwrap(), 7);
        drop(rt);
    }
}
