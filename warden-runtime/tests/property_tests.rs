//! Property-based tests for the Warden runtime.
//!
//! Uses proptest to generate random inputs and verify invariants hold.

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;
use warden_runtime::cache::{blocked_reduce_with, matrix_multiply_blocked, AlignedVec};
use warden_runtime::config::MemoryConfig;
use warden_runtime::memory::GuardedAllocator;
use warden_runtime::observability::PerfCounters;
use warden_runtime::simd::{SimdLevel, VectorOps};
use warden_runtime::{LockOrderRegistry, ProtectedCell};

/// One step of an allocate/deallocate interleaving.
#[derive(Debug, Clone)]
enum AllocOp {
    /// Allocate this many `u32` elements.
    Allocate(usize),
    /// Deallocate the live block at this position (modulo live count).
    Deallocate(usize),
}

fn alloc_op() -> impl Strategy<Value = AllocOp> {
    prop_oneof![
        (0usize..512).prop_map(AllocOp::Allocate),
        any::<usize>().prop_map(AllocOp::Deallocate),
    ]
}

/// Vectors of equal length in a range where f32 error stays small.
fn vector_pair() -> impl Strategy<Value = (Vec<f32>, Vec<f32>)> {
    (1usize..10_000).prop_flat_map(|len| {
        (
            prop::collection::vec(-1.0f32..1.0, len),
            prop::collection::vec(-1.0f32..1.0, len),
        )
    })
}

fn kernels() -> (VectorOps, VectorOps) {
    let counters = Arc::new(PerfCounters::new());
    (
        VectorOps::new(Arc::clone(&counters)),
        VectorOps::with_level(SimdLevel::Scalar, counters),
    )
}

proptest! {
    /// Live-byte total equals the sum of live block sizes after every step.
    #[test]
    fn stats_track_live_blocks(ops in prop::collection::vec(alloc_op(), 1..60)) {
        let allocator = GuardedAllocator::new(MemoryConfig::default());
        let mut live: Vec<(usize, usize)> = Vec::new();

        for op in ops {
            match op {
                AllocOp::Allocate(count) => {
                    let handle = allocator.allocate::<u32>(count, "prop").unwrap();
                    live.push((handle.address(), count * 4));
                }
                AllocOp::Deallocate(pick) => {
                    if !live.is_empty() {
                        let (address, _) = live.remove(pick % live.len());
                        prop_assert!(allocator.deallocate(address));
                    }
                }
            }
            let stats = allocator.stats();
            let expected: usize = live.iter().map(|(_, size)| size).sum();
            prop_assert_eq!(stats.total_allocated, expected);
            prop_assert_eq!(stats.block_count, live.len());
        }
    }

    /// In-range indices return the stored value; out-of-range ones fail.
    #[test]
    fn handle_access_is_bounds_checked(len in 1usize..256, index in 0usize..512) {
        let allocator = GuardedAllocator::default();
        let mut handle = allocator.allocate::<u64>(len, "bounds").unwrap();

        if index < len {
            handle.set(index, index as u64 * 3).unwrap();
            prop_assert_eq!(handle.get(index).unwrap(), index as u64 * 3);
            prop_assert_eq!(handle.try_index(index).copied(), Some(index as u64 * 3));
        } else {
            let err = handle.index(index).unwrap_err();
            prop_assert!(err.is_memory());
            prop_assert!(handle.try_index(index).is_none());
            prop_assert!(handle.set(index, 1).is_err());
        }
    }

    /// Vector and scalar add agree elementwise.
    #[test]
    fn simd_add_matches_scalar((a, b) in vector_pair()) {
        let (fast, slow) = kernels();
        let mut x = vec![0.0; a.len()];
        let mut y = vec![0.0; a.len()];
        fast.add(&a, &b, &mut x).unwrap();
        slow.add(&a, &b, &mut y).unwrap();
        prop_assert_eq!(x, y);
    }

    /// Vector and scalar dot products agree within f32 tolerance.
    #[test]
    fn simd_dot_matches_scalar((a, b) in vector_pair()) {
        let (fast, slow) = kernels();
        let x = fast.dot(&a, &b).unwrap();
        let y = slow.dot(&a, &b).unwrap();
        let magnitude: f32 = a.iter().zip(&b).map(|(p, q)| (p * q).abs()).sum();
        prop_assert!((x - y).abs() <= 1e-5 * magnitude + 1e-4, "{} vs {}", x, y);
    }

    /// Registration order defines the permitted acquisition order.
    #[test]
    fn lock_order_follows_registration(count in 2usize..8, pick in any::<(usize, usize)>()) {
        let registry = LockOrderRegistry::new();
        let names: Vec<String> = (0..count).map(|i| format!("lock-{}", i)).collect();
        for (level, name) in names.iter().enumerate() {
            prop_assert_eq!(registry.register_lock_type(name), level);
        }

        let low = pick.0 % (count - 1);
        let high = low + 1 + pick.1 % (count - 1 - low);

        prop_assert!(registry.can_acquire_safely(&names[low]));
        registry.register_lock_acquisition(&names[low]);
        prop_assert!(registry.can_acquire_safely(&names[high]));
        registry.register_lock_release(&names[low]);

        registry.register_lock_acquisition(&names[high]);
        prop_assert!(!registry.can_acquire_safely(&names[low]));
        registry.register_lock_release(&names[high]);
        prop_assert!(registry.held_by_current().is_empty());
    }

    /// Blocked matrix multiply matches the naive triple loop.
    #[test]
    fn blocked_matmul_matches_naive(n in 1usize..24, block in 1usize..16, seed in any::<u64>()) {
        let a: Vec<i64> = (0..n * n).map(|i| ((i as u64 ^ seed) % 17) as i64 - 8).collect();
        let b: Vec<i64> = (0..n * n).map(|i| ((i as u64).wrapping_mul(31) ^ seed) as i64 % 11).collect();

        let mut blocked = vec![0i64; n * n];
        matrix_multiply_blocked(&a, &b, &mut blocked, n, block).unwrap();

        let mut naive = vec![0i64; n * n];
        for i in 0..n {
            for j in 0..n {
                for k in 0..n {
                    naive[i * n + j] += a[i * n + k] * b[k * n + j];
                }
            }
        }
        prop_assert_eq!(blocked, naive);
    }

    /// Chunked reduction equals a plain fold for any chunk length.
    #[test]
    fn blocked_reduce_matches_fold(data in prop::collection::vec(any::<u32>(), 0..5000), chunk in 1usize..2048) {
        let expected = data.iter().fold(0u32, |acc, &x| acc.wrapping_add(x));
        prop_assert_eq!(blocked_reduce_with(&data, chunk, 0, u32::wrapping_add), expected);
    }

    /// Aligned vectors stay aligned and keep their contents across growth.
    #[test]
    fn aligned_vec_growth(values in prop::collection::vec(any::<u16>(), 0..2000)) {
        let vec: AlignedVec<u16> = values.iter().copied().collect();
        prop_assert_eq!(vec.as_ptr() as usize % 64, 0);
        prop_assert_eq!(vec.as_slice(), values.as_slice());
        prop_assert_eq!(vec.capacity() * 2 % 64, 0);
    }

    /// With no contention one optimistic attempt commits `f(old)`.
    #[test]
    fn optimistic_update_applies_function(start in any::<i32>(), delta in any::<i32>()) {
        let cell = ProtectedCell::new("prop", start);
        prop_assert!(cell.optimistic_update(3, |v| v.wrapping_add(delta)));
        prop_assert_eq!(cell.snapshot(), start.wrapping_add(delta));
    }
}

#[cfg(test)]
mod stress_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use warden_runtime::{Runtime, RuntimeConfig};

    /// Concurrent allocate/deallocate keeps the registry consistent.
    #[test]
    fn stress_concurrent_allocation() {
        const NUM_THREADS: usize = 4;
        const ITERATIONS: usize = 500;

        let allocator = Arc::new(GuardedAllocator::default());
        let handles: Vec<_> = (0..NUM_THREADS)
            .map(|t| {
                let allocator = Arc::clone(&allocator);
                thread::spawn(move || {
                    let mut kept = HashMap::new();
                    for i in 0..ITERATIONS {
                        let mut handle = allocator.allocate::<u32>(16, "stress").unwrap();
                        handle.set(15, (t * ITERATIONS + i) as u32).unwrap();
                        if i % 2 == 0 {
                            assert!(allocator.deallocate(handle.address()));
                        } else {
                            kept.insert(handle.address(), handle);
                        }
                    }
                    for (address, handle) in &kept {
                        assert!(handle.is_live());
                        assert!(allocator.contains(*address));
                    }
                    kept.len()
                })
            })
            .collect();

        let kept: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        let stats = allocator.stats();
        assert_eq!(stats.block_count, kept);
        assert_eq!(stats.total_allocated, kept * 16 * 4);
    }

    /// Writers serialize; readers never observe a torn pair.
    #[test]
    fn stress_protected_cell() {
        const NUM_THREADS: usize = 4;
        const ITERATIONS: usize = 2_000;

        let cell = Arc::new(ProtectedCell::new("pair", (0u64, 0u64)));
        let torn = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..NUM_THREADS)
            .map(|t| {
                let cell = Arc::clone(&cell);
                let torn = Arc::clone(&torn);
                thread::spawn(move || {
                    for _ in 0..ITERATIONS {
                        if t % 2 == 0 {
                            cell.write(|(a, b)| {
                                *a += 1;
                                *b += 1;
                            });
                        } else if cell.read(|(a, b)| a != b) {
                            torn.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(torn.load(Ordering::Relaxed), 0);
        let (a, b) = cell.snapshot();
        assert_eq!(a, (NUM_THREADS / 2 * ITERATIONS) as u64);
        assert_eq!(a, b);
        assert_eq!(cell.stats().active_readers, 0);
    }

    /// Many submitters share one runtime without losing results.
    #[test]
    fn stress_concurrent_submission() {
        const NUM_THREADS: usize = 4;
        const TASKS: usize = 100;

        let config = RuntimeConfig::builder()
            .num_workers(4)
            .stress_steps(0.0, 0.0)
            .max_consecutive_tasks(100_000)
            .rest_duration(Duration::from_millis(1))
            .reclaimer(false)
            .build()
            .unwrap();
        let runtime = Arc::new(Runtime::new(config).unwrap());

        let handles: Vec<_> = (0..NUM_THREADS)
            .map(|t| {
                let runtime = Arc::clone(&runtime);
                thread::spawn(move || {
                    let tasks: Vec<_> = (0..TASKS)
                        .map(|i| runtime.submit(move || t * TASKS + i).unwrap())
                        .collect();
                    tasks.into_iter().map(|h| h.join().unwrap()).sum::<usize>()
                })
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        let n = NUM_THREADS * TASKS;
        assert_eq!(total, n * (n - 1) / 2);
        assert_eq!(runtime.pool_stats().total_tasks_completed, n as u64);
    }

    /// Ordered locks taken in registration order never refuse.
    #[test]
    fn stress_ordered_locks() {
        const NUM_THREADS: usize = 4;
        const ITERATIONS: usize = 1_000;

        let config = RuntimeConfig::builder()
            .num_workers(1)
            .reclaimer(false)
            .build()
            .unwrap();
        let runtime = Runtime::new(config).unwrap();
        let outer = Arc::new(runtime.ordered_mutex("outer", 0u64));
        let inner = Arc::new(runtime.ordered_mutex("inner", 0u64));

        let handles: Vec<_> = (0..NUM_THREADS)
            .map(|_| {
                let outer = Arc::clone(&outer);
                let inner = Arc::clone(&inner);
                thread::spawn(move || {
                    for _ in 0..ITERATIONS {
                        let mut a = outer.lock().unwrap();
                        let mut b = inner.lock().unwrap();
                        *a += 1;
                        *b += 1;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let expected = (NUM_THREADS * ITERATIONS) as u64;
        assert_eq!(*outer.lock().unwrap(), expected);
        assert_eq!(*inner.lock().unwrap(), expected);
        assert!(!runtime.analyze_deadlocks().potential_deadlock);
    }
}
