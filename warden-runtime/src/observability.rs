//! # Observability
//!
//! Counters and reports describing how the runtime is doing.
//!
//! ## Components
//!
//! - [`PerfCounters`]: atomic tallies of cache misses, branch
//!   mispredictions, and SIMD and scalar kernel calls. A runtime owns one
//!   set and shares it with its kernels; `reset` clears it.
//! - [`PerformanceReport`]: counters plus SIMD utilization and tuning
//!   suggestions derived from [`HealthConfig`] thresholds.
//! - [`SystemHealthReport`]: memory, pool, lock-order and performance
//!   snapshots with textual recommendations.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::HealthConfig;
use crate::deadlock::DeadlockReport;
use crate::memory::MemoryStats;
use crate::pool::PoolStats;
use crate::reclaimer::ReclaimStats;
use crate::simd::{cpu_features, CpuFeatures};

// ============================================================================
// Performance Counters
// ============================================================================

/// Atomic performance tallies.
#[derive(Debug, Default)]
pub struct PerfCounters {
    cache_misses: AtomicU64,
    branch_mispredictions: AtomicU64,
    simd_ops: AtomicU64,
    scalar_ops: AtomicU64,
}

/// Point-in-time copy of [`PerfCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfSnapshot {
    /// Recorded cache misses.
    pub cache_misses: u64,
    /// Recorded branch mispredictions.
    pub branch_mispredictions: u64,
    /// Kernel calls that took a vector path.
    pub simd_ops: u64,
    /// Kernel calls that took the scalar path.
    pub scalar_ops: u64,
}

impl PerfSnapshot {
    /// Fraction of kernel calls that were vectorized; 0 when none ran.
    pub fn simd_utilization(&self) -> f64 {
        let total = self.simd_ops + self.scalar_ops;
        if total == 0 {
            0.0
        } else {
            self.simd_ops as f64 / total as f64
        }
    }
}

impl PerfCounters {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one cache miss.
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one branch misprediction.
    pub fn record_branch_misprediction(&self) {
        self.branch_mispredictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one vectorized kernel call.
    pub fn record_simd_op(&self) {
        self.simd_ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one scalar kernel call.
    pub fn record_scalar_op(&self) {
        self.scalar_ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters.
    pub fn snapshot(&self) -> PerfSnapshot {
        PerfSnapshot {
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            branch_mispredictions: self.branch_mispredictions.load(Ordering::Relaxed),
            simd_ops: self.simd_ops.load(Ordering::Relaxed),
            scalar_ops: self.scalar_ops.load(Ordering::Relaxed),
        }
    }

    /// Zero all counters.
    pub fn reset(&self) {
        self.cache_misses.store(0, Ordering::Relaxed);
        self.branch_mispredictions.store(0, Ordering::Relaxed);
        self.simd_ops.store(0, Ordering::Relaxed);
        self.scalar_ops.store(0, Ordering::Relaxed);
    }

    /// Build a report with suggestions from `thresholds`.
    pub fn report(&self, thresholds: &HealthConfig) -> PerformanceReport {
        PerformanceReport::from_snapshot(self.snapshot(), thresholds)
    }
}

/// Counters with derived utilization and tuning suggestions.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceReport {
    /// Raw counters.
    pub counters: PerfSnapshot,
    /// `simd_ops / (simd_ops + scalar_ops)`.
    pub simd_utilization: f64,
    /// Vector features of this CPU.
    pub features: CpuFeatures,
    /// Tuning suggestions, empty when nothing crossed a threshold.
    pub suggestions: Vec<String>,
}

impl PerformanceReport {
    /// Derive a report from a counter snapshot.
    pub fn from_snapshot(counters: PerfSnapshot, thresholds: &HealthConfig) -> Self {
        let simd_utilization = counters.simd_utilization();
        let mut suggestions = Vec::new();

        if counters.cache_misses > thresholds.cache_miss_warning {
            suggestions.push("Consider using cache-friendly data layouts".to_string());
            suggestions.push("Add prefetch hints for predictable access patterns".to_string());
        }

        let total_ops = counters.simd_ops + counters.scalar_ops;
        if simd_utilization < thresholds.simd_utilization_floor
            && total_ops > thresholds.simd_min_ops
        {
            suggestions.push("Vectorize loops using SIMD operations".to_string());
            suggestions.push(
                "Use aligned memory allocation for better SIMD performance".to_string(),
            );
        }

        if counters.branch_mispredictions > thresholds.branch_miss_warning {
            suggestions.push("Add branch prediction hints".to_string());
            suggestions.push("Consider branchless algorithms".to_string());
        }

        Self {
            counters,
            simd_utilization,
            features: cpu_features(),
            suggestions,
        }
    }
}

// ============================================================================
// System Health
// ============================================================================

/// Aggregated health of a runtime.
#[derive(Debug, Clone)]
pub struct SystemHealthReport {
    /// Allocator statistics.
    pub memory: MemoryStats,
    /// Worker pool statistics.
    pub threading: PoolStats,
    /// Lock-order analysis.
    pub deadlock: DeadlockReport,
    /// Performance counters and suggestions.
    pub performance: PerformanceReport,
    /// Reclaimer activity.
    pub reclaimer: ReclaimStats,
    /// Recommendations, empty when every metric is within bounds.
    pub recommendations: Vec<String>,
}

impl SystemHealthReport {
    /// Assemble a report and derive its recommendations.
    pub fn new(
        memory: MemoryStats,
        threading: PoolStats,
        deadlock: DeadlockReport,
        performance: PerformanceReport,
        reclaimer: ReclaimStats,
        thresholds: &HealthConfig,
    ) -> Self {
        let mut recommendations = Vec::new();

        if memory.total_allocated > thresholds.memory_warning_bytes {
            recommendations
                .push("High memory usage detected - consider memory optimization".to_string());
        }
        if threading.average_stress > thresholds.stress_warning {
            recommendations
                .push("Thread pool stress is high - reduce task submission rate".to_string());
        }
        if deadlock.potential_deadlock {
            recommendations
                .push("Potential deadlock detected - review lock acquisition order".to_string());
        }
        if performance.counters.cache_misses > thresholds.cache_miss_warning {
            recommendations.push(
                "High cache miss rate - optimize data layout and access patterns".to_string(),
            );
        }

        Self {
            memory,
            threading,
            deadlock,
            performance,
            reclaimer,
            recommendations,
        }
    }

    /// True when no recommendation was raised.
    pub fn is_healthy(&self) -> bool {
        self.recommendations.is_empty()
    }
}

impl fmt::Display for SystemHealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "memory: {} bytes in {} blocks",
            self.memory.total_allocated, self.memory.block_count
        )?;
        writeln!(
            f,
            "workers: {} (mean stress {:.2}, {} completed)",
            self.threading.worker_count,
            self.threading.average_stress,
            self.threading.total_tasks_completed
        )?;
        writeln!(f, "locks: {}", self.deadlock.description)?;
        writeln!(
            f,
            "simd utilization: {:.0}%",
            self.performance.simd_utilization * 100.0
        )?;
        for rec in &self.recommendations {
            writeln!(f, "- {}", rec)?;
        }
        Ok(())
    }
}
