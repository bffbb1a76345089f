//! # Warden Runtime Library
//!
//! The Warden runtime provides:
//!
//! - **Guarded Memory**: registry-backed allocation with index-only,
//!   bounds-checked handles and a load-aware background reclaimer
//! - **Worker Pool**: OS worker threads with per-worker stress tracking,
//!   admission control and mandatory rest breaks
//! - **Synchronization**: reader-writer protected cells with optimistic
//!   update, and named mutexes checked against a global lock order
//! - **Numeric Kernels**: SIMD add/multiply/dot with a scalar fallback,
//!   cache-blocked matrix multiply and chunked reduction
//! - **Observability**: performance counters and system health reports
//!
//! ## Technical Standards
//!
//! - **Channels**: per-worker FIFO queues per
//!   [crossbeam-channel](https://docs.rs/crossbeam-channel)
//! - **Locks**: [parking_lot](https://docs.rs/parking_lot) `Mutex`, `RwLock`
//!   and `Condvar`
//! - **Logging**: [tracing](https://docs.rs/tracing) with an `EnvFilter`
//!   subscriber
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         WARDEN RUNTIME                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Allocator  │  │  Worker Pool │  │  Lock Order  │           │
//! │  │ (memory.rs)  │  │  (pool.rs)   │  │(deadlock.rs) │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │         │                 │                 │                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │  Reclaimer   │  │   Wellness   │  │  Sync Cells  │           │
//! │  │(reclaimer.rs)│  │(wellness.rs) │  │  (sync.rs)   │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │         └─────────────────┼─────────────────┘                   │
//! │                   ┌──────────────┐                              │
//! │                   │   Runtime    │ ◄── SIMD / cache kernels     │
//! │                   │ (runtime.rs) │ ◄── performance counters     │
//! │                   └──────────────┘                              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use warden_runtime::{Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::default())?;
//! let handle = runtime.submit(|| 6 * 7)?;
//! assert_eq!(handle.join()?, 42);
//! runtime.shutdown();
//! # Ok::<(), warden_runtime::WardenError>(())
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cache;
pub mod config;
pub mod deadlock;
pub mod error;
pub mod log;
pub mod memory;
pub mod observability;
pub mod panic;
pub mod pool;
pub mod reclaimer;
pub mod runtime;
pub mod simd;
pub mod sync;
pub mod wellness;

// Re-exports
pub use cache::{blocked_reduce, matrix_multiply, AlignedVec};
pub use config::{ConfigError, LogLevel, RuntimeConfig, RuntimeConfigBuilder};
pub use deadlock::{DeadlockReport, LockOrderRegistry, ScopedLockGuard};
pub use error::{ErrorKind, Result, WardenError};
pub use memory::{BlockSnapshot, GuardedAllocator, GuardedHandle, MemoryStats};
pub use observability::{PerfCounters, PerformanceReport, SystemHealthReport};
pub use panic::PanicInfo;
pub use pool::{PoolStats, TaskHandle, WorkerPool, WorkerState};
pub use reclaimer::{ReclaimStats, Reclaimer};
pub use runtime::Runtime;
pub use simd::{cpu_features, safe_dot_product, safe_vector_add, CpuFeatures, SimdLevel};
pub use sync::{CellStats, OrderedMutex, OrderedMutexGuard, ProtectedCell};
pub use wellness::WellnessSnapshot;

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install logging and start a runtime with the default configuration.
pub fn init() -> Result<Runtime> {
    init_with(RuntimeConfig::default())
}

/// Install logging per `config.log` and start a runtime.
///
/// Logging is installed at most once per process; later calls keep the
/// existing subscriber.
pub fn init_with(config: RuntimeConfig) -> Result<Runtime> {
    log::init_logging(&config.log);
    Runtime::new(config)
}

/// Install logging and start a runtime configured from `WARDEN_*`
/// environment variables.
pub fn init_from_env() -> Result<Runtime> {
    init_with(RuntimeConfig::from_env())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_with() {
        let config = RuntimeConfig::builder()
            .num_workers(1)
            .reclaimer(false)
            .log_level(LogLevel::Off)
            .build()
            .unwrap();
        let runtime = init_with(config).unwrap();
        assert_eq!(runtime.pool_stats().worker_count, 1);
    }

    #[test]
    fn test_init_from_env() {
        let runtime = init_from_env().unwrap();
        assert!(runtime.pool_stats().worker_count >= 1);
        runtime.shutdown();
    }
}
