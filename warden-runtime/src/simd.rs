//! # SIMD Kernels
//!
//! Elementwise `f32` arithmetic and dot products with a vectorized path
//! and a scalar fallback.
//!
//! ## Design
//!
//! - CPU features are probed once per process into an immutable
//!   [`CpuFeatures`] set. A [`SimdLevel`] chosen from it selects the code
//!   path; nothing re-detects per call.
//! - The AVX2 path processes [`LANES`] (8) elements per step with unaligned
//!   loads and finishes the remainder with a scalar loop.
//! - Every kernel call records one SIMD or one scalar operation in the
//!   caller's [`PerfCounters`].
//!
//! ## Technical References
//!
//! - [Intel Intrinsics Guide](https://www.intel.com/content/www/us/en/docs/intrinsics-guide/)
//! - [`std::arch`](https://doc.rust-lang.org/std/arch/index.html)

use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::error::{Result, WardenError};
use crate::observability::PerfCounters;

/// Single-precision elements per vector step.
pub const LANES: usize = 8;

// ============================================================================
// Feature Detection
// ============================================================================

/// Vector instruction sets available on this CPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuFeatures {
    /// 256-bit integer and float vectors.
    pub avx2: bool,
    /// Fused multiply-add.
    pub fma: bool,
    /// Legacy 128-bit string and integer extensions.
    pub sse42: bool,
    /// 512-bit foundation instructions.
    pub avx512f: bool,
}

impl CpuFeatures {
    /// Probe the current CPU.
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Self {
                avx2: is_x86_feature_detected!("avx2"),
                fma: is_x86_feature_detected!("fma"),
                sse42: is_x86_feature_detected!("sse4.2"),
                avx512f: is_x86_feature_detected!("avx512f"),
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            Self::default()
        }
    }
}

/// The process-wide feature set, probed on first use.
pub fn cpu_features() -> CpuFeatures {
    static FEATURES: OnceLock<CpuFeatures> = OnceLock::new();
    *FEATURES.get_or_init(CpuFeatures::detect)
}

/// Code path used by the kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimdLevel {
    /// 8-lane AVX2 kernels.
    Avx2,
    /// Plain loops.
    Scalar,
}

impl SimdLevel {
    /// Best level supported by this CPU.
    pub fn detect() -> Self {
        if cpu_features().avx2 {
            SimdLevel::Avx2
        } else {
            SimdLevel::Scalar
        }
    }

    /// `self`, downgraded to scalar if this CPU cannot run it.
    pub fn supported(self) -> Self {
        match self {
            SimdLevel::Avx2 if cpu_features().avx2 => SimdLevel::Avx2,
            _ => SimdLevel::Scalar,
        }
    }

    /// Whether this level uses vector instructions.
    pub fn is_vectorized(self) -> bool {
        self != SimdLevel::Scalar
    }
}

impl fmt::Display for SimdLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimdLevel::Avx2 => f.write_str("avx2"),
            SimdLevel::Scalar => f.write_str("scalar"),
        }
    }
}

// ============================================================================
// Prefetch
// ============================================================================

/// Cache residency hint for prefetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locality {
    /// Data will be reused; keep it in all cache levels.
    Temporal,
    /// Data is used once; minimize cache pollution.
    NonTemporal,
}

/// Hint that `ptr` will be read soon. No-op off x86_64.
#[inline(always)]
pub fn prefetch_read<T>(ptr: *const T, locality: Locality) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: prefetch never faults, whatever the address.
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_NTA, _MM_HINT_T0};
        match locality {
            Locality::Temporal => _mm_prefetch(ptr as *const i8, _MM_HINT_T0),
            Locality::NonTemporal => _mm_prefetch(ptr as *const i8, _MM_HINT_NTA),
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (ptr, locality);
    }
}

/// Hint that `ptr` will be written soon. No-op off x86_64.
#[inline(always)]
pub fn prefetch_write<T>(ptr: *const T) {
    prefetch_read(ptr, Locality::Temporal);
}

// ============================================================================
// Kernels
// ============================================================================

mod scalar {
    pub fn add(a: &[f32], b: &[f32], out: &mut [f32]) {
        for ((o, x), y) in out.iter_mut().zip(a).zip(b) {
            *o = x + y;
        }
    }

    pub fn mul(a: &[f32], b: &[f32], out: &mut [f32]) {
        for ((o, x), y) in out.iter_mut().zip(a).zip(b) {
            *o = x * y;
        }
    }

    pub fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }
}

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use std::arch::x86_64::*;

    use super::LANES;

    /// # Safety
    /// The CPU must support AVX2; slices must have equal length.
    #[target_feature(enable = "avx2")]
    pub unsafe fn add(a: &[f32], b: &[f32], out: &mut [f32]) {
        let n = out.len();
        let body = n - n % LANES;
        let mut i = 0;
        while i < body {
            let va = _mm256_loadu_ps(a.as_ptr().add(i));
            let vb = _mm256_loadu_ps(b.as_ptr().add(i));
            _mm256_storeu_ps(out.as_mut_ptr().add(i), _mm256_add_ps(va, vb));
            i += LANES;
        }
        super::scalar::add(&a[body..], &b[body..], &mut out[body..]);
    }

    /// # Safety
    /// The CPU must support AVX2; slices must have equal length.
    #[target_feature(enable = "avx2")]
    pub unsafe fn mul(a: &[f32], b: &[f32], out: &mut [f32]) {
        let n = out.len();
        let body = n - n % LANES;
        let mut i = 0;
        while i < body {
            let va = _mm256_loadu_ps(a.as_ptr().add(i));
            let vb = _mm256_loadu_ps(b.as_ptr().add(i));
            _mm256_storeu_ps(out.as_mut_ptr().add(i), _mm256_mul_ps(va, vb));
            i += LANES;
        }
        super::scalar::mul(&a[body..], &b[body..], &mut out[body..]);
    }

    /// # Safety
    /// The CPU must support AVX2; slices must have equal length.
    #[target_feature(enable = "avx2")]
    pub unsafe fn dot(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len();
        let body = n - n % LANES;
        let mut acc = _mm256_setzero_ps();
        let mut i = 0;
        while i < body {
            let va = _mm256_loadu_ps(a.as_ptr().add(i));
            let vb = _mm256_loadu_ps(b.as_ptr().add(i));
            acc = _mm256_add_ps(acc, _mm256_mul_ps(va, vb));
            i += LANES;
        }
        let mut lanes = [0.0f32; LANES];
        _mm256_storeu_ps(lanes.as_mut_ptr(), acc);
        lanes.iter().sum::<f32>() + super::scalar::dot(&a[body..], &b[body..])
    }
}

fn check_len(operation: &str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(WardenError::length_mismatch(operation, expected, actual))
    }
}

/// Vector kernels bound to one code path and one counter set.
#[derive(Clone)]
pub struct VectorOps {
    level: SimdLevel,
    counters: Arc<PerfCounters>,
}

impl VectorOps {
    /// Kernels using the best path this CPU supports.
    pub fn new(counters: Arc<PerfCounters>) -> Self {
        Self::with_level(SimdLevel::detect(), counters)
    }

    /// Kernels using `level`, or scalar if the CPU cannot run it.
    pub fn with_level(level: SimdLevel, counters: Arc<PerfCounters>) -> Self {
        Self {
            level: level.supported(),
            counters,
        }
    }

    /// The selected code path.
    pub fn level(&self) -> SimdLevel {
        self.level
    }

    /// The counters this instance records into.
    pub fn counters(&self) -> &Arc<PerfCounters> {
        &self.counters
    }

    /// `out[i] = a[i] + b[i]`. All slices must have the same length.
    pub fn add(&self, a: &[f32], b: &[f32], out: &mut [f32]) -> Result<()> {
        check_len("vector add", a.len(), b.len())?;
        check_len("vector add", a.len(), out.len())?;
        match self.level {
            #[cfg(target_arch = "x86_64")]
            // SAFETY: `supported()` confirmed AVX2; lengths checked above.
            SimdLevel::Avx2 => unsafe { avx2::add(a, b, out) },
            _ => scalar::add(a, b, out),
        }
        self.record();
        Ok(())
    }

    /// `out[i] = a[i] * b[i]`. All slices must have the same length.
    pub fn mul(&self, a: &[f32], b: &[f32], out: &mut [f32]) -> Result<()> {
        check_len("vector multiply", a.len(), b.len())?;
        check_len("vector multiply", a.len(), out.len())?;
        match self.level {
            #[cfg(target_arch = "x86_64")]
            // SAFETY: as in `add`.
            SimdLevel::Avx2 => unsafe { avx2::mul(a, b, out) },
            _ => scalar::mul(a, b, out),
        }
        self.record();
        Ok(())
    }

    /// Sum of `a[i] * b[i]`. Both slices must have the same length.
    pub fn dot(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        check_len("dot product", a.len(), b.len())?;
        let sum = match self.level {
            #[cfg(target_arch = "x86_64")]
            // SAFETY: as in `add`.
            SimdLevel::Avx2 => unsafe { avx2::dot(a, b) },
            _ => scalar::dot(a, b),
        };
        self.record();
        Ok(sum)
    }

    fn record(&self) {
        if self.level.is_vectorized() {
            self.counters.record_simd_op();
        } else {
            self.counters.record_scalar_op();
        }
    }
}

impl fmt::Debug for VectorOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VectorOps").field("level", &self.level).finish()
    }
}

/// Add two vectors on the best available path, recording into `counters`.
pub fn safe_vector_add(
    counters: &Arc<PerfCounters>,
    a: &[f32],
    b: &[f32],
    out: &mut [f32],
) -> Result<()> {
    VectorOps::new(Arc::clone(counters)).add(a, b, out)
}

/// Dot product on the best available path, recording into `counters`.
pub fn safe_dot_product(counters: &Arc<PerfCounters>, a: &[f32], b: &[f32]) -> Result<f32> {
    VectorOps::new(Arc::clone(counters)).dot(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize, scale: f32) -> Vec<f32> {
        (0..n).map(|i| (i % 17) as f32 * scale).collect()
    }

    #[test]
    fn test_detection_is_stable() {
        assert_eq!(cpu_features(), cpu_features());
        assert_eq!(SimdLevel::detect().is_vectorized(), cpu_features().avx2);
        assert_eq!(SimdLevel::Scalar.supported(), SimdLevel::Scalar);
    }

    #[test]
    fn test_add_and_mul_with_tail() {
        let counters = Arc::new(PerfCounters::new());
        let ops = VectorOps::new(Arc::clone(&counters));
        let a = ramp(19, 1.0);
        let b = ramp(19, 0.5);
        let mut sum = vec![0.0; 19];
        let mut product = vec![0.0; 19];

        ops.add(&a, &b, &mut sum).unwrap();
        ops.mul(&a, &b, &mut product).unwrap();
        for i in 0..19 {
            assert_eq!(sum[i], a[i] + b[i]);
            assert_eq!(product[i], a[i] * b[i]);
        }
    }

    #[test]
    fn test_dot_matches_scalar() {
        let counters = Arc::new(PerfCounters::new());
        let fast = VectorOps::new(Arc::clone(&counters));
        let slow = VectorOps::with_level(SimdLevel::Scalar, Arc::clone(&counters));
        let a = ramp(1003, 0.25);
        let b = ramp(1003, 0.5);

        let x = fast.dot(&a, &b).unwrap();
        let y = slow.dot(&a, &b).unwrap();
        assert!((x - y).abs() <= 1e-5 * y.abs());
    }

    #[test]
    fn test_length_mismatch() {
        let counters = Arc::new(PerfCounters::new());
        let ops = VectorOps::new(Arc::clone(&counters));
        let mut out = [0.0; 3];
        let err = ops.add(&[1.0; 3], &[1.0; 2], &mut out).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
        assert!(ops.dot(&[1.0], &[]).is_err());
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.simd_ops + snapshot.scalar_ops, 0);
    }

    #[test]
    fn test_empty_vectors() {
        let counters = Arc::new(PerfCounters::new());
        assert_eq!(safe_dot_product(&counters, &[], &[]).unwrap(), 0.0);
        safe_vector_add(&counters, &[], &[], &mut []).unwrap();
    }

    #[test]
    fn test_calls_are_counted() {
        let counters = Arc::new(PerfCounters::new());
        let scalar = VectorOps::with_level(SimdLevel::Scalar, Arc::clone(&counters));
        scalar.dot(&[1.0, 2.0], &[3.0, 4.0]).unwrap();
        scalar.dot(&[1.0], &[1.0]).unwrap();
        assert_eq!(counters.snapshot().scalar_ops, 2);

        let detected = VectorOps::new(Arc::clone(&counters));
        detected.dot(&[1.0], &[1.0]).unwrap();
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.simd_ops + snapshot.scalar_ops, 3);
    }

    #[test]
    fn test_prefetch_is_harmless() {
        let data = [1u64; 32];
        prefetch_read(data.as_ptr(), Locality::Temporal);
        prefetch_read(data.as_ptr().wrapping_add(16), Locality::NonTemporal);
        prefetch_write(data.as_ptr());
        assert_eq!(data[0], 1);
    }
}
