//! # Cache-Aware Containers and Kernels
//!
//! - [`AlignedVec`]: a growable buffer whose storage starts on a cache line
//!   and spans whole cache lines.
//! - [`matrix_multiply`]: tiled square matrix multiply with software
//!   prefetch.
//! - [`blocked_reduce`]: chunked reduction with next-chunk prefetch.
//!
//! ## Technical References
//!
//! - [What Every Programmer Should Know About Memory](https://people.freebsd.org/~lstewart/articles/cpumemory.pdf)

use std::alloc::{self, Layout};
use std::fmt;
use std::mem;
use std::ops::{Add, Deref, DerefMut, Mul};
use std::ptr::{self, NonNull};

use crate::error::{Result, WardenError};
use crate::simd::{prefetch_read, Locality, LANES};

/// Cache line size assumed by default.
pub const CACHE_LINE_SIZE: usize = 64;

/// Default tile edge for [`matrix_multiply`].
pub const DEFAULT_BLOCK_SIZE: usize = 64;

/// Default chunk length for [`blocked_reduce`].
pub const DEFAULT_REDUCE_CHUNK: usize = 1024;

const DEFAULT_CAPACITY: usize = 16;

// ============================================================================
// Aligned Vector
// ============================================================================

/// Growable buffer of `Copy` values aligned to a cache line.
///
/// Capacity always fills whole cache lines and doubles on overflow, with
/// existing elements moved by a bulk copy.
pub struct AlignedVec<T: Copy> {
    ptr: NonNull<T>,
    len: usize,
    capacity: usize,
    line: usize,
}

// SAFETY: AlignedVec owns its elements like Vec<T>.
unsafe impl<T: Copy + Send> Send for AlignedVec<T> {}
unsafe impl<T: Copy + Sync> Sync for AlignedVec<T> {}

impl<T: Copy> AlignedVec<T> {
    /// Empty buffer with room for 16 elements, rounded up to a full line.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Empty buffer with room for at least `capacity` elements.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_line_size(capacity, CACHE_LINE_SIZE)
    }

    /// Empty buffer aligned to `line` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `line` is not a power of two.
    pub fn with_line_size(capacity: usize, line: usize) -> Self {
        assert!(line.is_power_of_two(), "cache line size must be a power of two");
        let mut vec = Self {
            ptr: NonNull::dangling(),
            len: 0,
            capacity: 0,
            line,
        };
        if mem::size_of::<T>() == 0 {
            vec.capacity = usize::MAX;
        } else {
            vec.reallocate(capacity.max(1));
        }
        vec
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Elements that fit without growing.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Alignment of the storage in bytes.
    pub fn alignment(&self) -> usize {
        self.line.max(mem::align_of::<T>())
    }

    /// Append `value`, doubling capacity if full.
    pub fn push(&mut self, value: T) {
        if self.len == self.capacity {
            let doubled = self
                .capacity
                .checked_mul(2)
                .unwrap_or_else(|| capacity_overflow());
            self.reallocate(doubled);
        }
        // SAFETY: len < capacity after growth.
        unsafe { self.ptr.as_ptr().add(self.len).write(value) };
        self.len += 1;
    }

    /// Remove and return the last element.
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        // SAFETY: the slot at the old `len - 1` is initialized.
        Some(unsafe { self.ptr.as_ptr().add(self.len).read() })
    }

    /// Remove all elements, keeping the storage.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Borrow the elements.
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: the first `len` elements are initialized.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutably borrow the elements.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: as above, and `&mut self` is unique.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Layout covering at least `min_capacity` elements in whole lines.
    fn layout_for(&self, min_capacity: usize) -> (Layout, usize) {
        let size = mem::size_of::<T>();
        let bytes = min_capacity
            .checked_mul(size)
            .and_then(|b| b.checked_add(self.line - 1))
            .map(|b| b / self.line * self.line)
            .unwrap_or_else(|| capacity_overflow());
        let layout = match Layout::from_size_align(bytes, self.alignment()) {
            Ok(layout) => layout,
            Err(_) => capacity_overflow(),
        };
        (layout, bytes / size)
    }

    fn reallocate(&mut self, min_capacity: usize) {
        let (layout, capacity) = self.layout_for(min_capacity);
        // SAFETY: layout size is non-zero because size_of::<T>() > 0 and
        // min_capacity >= 1.
        let raw = unsafe { alloc::alloc(layout) };
        let new_ptr = match NonNull::new(raw.cast::<T>()) {
            Some(p) => p,
            None => alloc::handle_alloc_error(layout),
        };

        if self.capacity > 0 {
            // SAFETY: both regions are valid for `len` elements and distinct.
            unsafe {
                ptr::copy_nonoverlapping(self.ptr.as_ptr(), new_ptr.as_ptr(), self.len);
                let (old, _) = self.layout_for(self.capacity);
                alloc::dealloc(self.ptr.as_ptr().cast(), old);
            }
        }
        self.ptr = new_ptr;
        self.capacity = capacity;
    }
}

#[cold]
fn capacity_overflow() -> ! {
    panic!("AlignedVec capacity overflow")
}

impl<T: Copy> Drop for AlignedVec<T> {
    fn drop(&mut self) {
        if mem::size_of::<T>() != 0 && self.capacity > 0 {
            let (layout, _) = self.layout_for(self.capacity);
            // SAFETY: allocated with the same layout in `reallocate`.
            unsafe { alloc::dealloc(self.ptr.as_ptr().cast(), layout) };
        }
    }
}

impl<T: Copy> Default for AlignedVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy> Deref for AlignedVec<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Copy> DerefMut for AlignedVec<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T: Copy> Clone for AlignedVec<T> {
    fn clone(&self) -> Self {
        let mut copy = Self::with_line_size(self.len, self.line);
        copy.extend(self.iter().copied());
        copy
    }
}

impl<T: Copy> Extend<T> for AlignedVec<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for value in iter {
            self.push(value);
        }
    }
}

impl<T: Copy> FromIterator<T> for AlignedVec<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut vec = Self::new();
        vec.extend(iter);
        vec
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for AlignedVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

// ============================================================================
// Kernels
// ============================================================================

/// Add `a * b` into `c` for `n x n` row-major matrices, with 64-element tiles.
///
/// `c` is accumulated into, not overwritten; zero it first for a plain
/// product.
pub fn matrix_multiply<T>(a: &[T], b: &[T], c: &mut [T], n: usize) -> Result<()>
where
    T: Copy + Default + Add<Output = T> + Mul<Output = T>,
{
    matrix_multiply_blocked(a, b, c, n, DEFAULT_BLOCK_SIZE)
}

/// [`matrix_multiply`] with an explicit tile edge.
pub fn matrix_multiply_blocked<T>(
    a: &[T],
    b: &[T],
    c: &mut [T],
    n: usize,
    block: usize,
) -> Result<()>
where
    T: Copy + Default + Add<Output = T> + Mul<Output = T>,
{
    let expected = n
        .checked_mul(n)
        .ok_or_else(|| WardenError::length_mismatch("matrix multiply", usize::MAX, a.len()))?;
    for len in [a.len(), b.len(), c.len()] {
        if len != expected {
            return Err(WardenError::length_mismatch("matrix multiply", expected, len));
        }
    }
    let block = block.max(1);

    for i0 in (0..n).step_by(block) {
        let i_end = (i0 + block).min(n);
        for j0 in (0..n).step_by(block) {
            let j_end = (j0 + block).min(n);
            for k0 in (0..n).step_by(block) {
                let k_end = (k0 + block).min(n);

                for i in i0..i_end {
                    for j in j0..j_end {
                        if j + LANES < j_end {
                            prefetch_read(&b[k0 * n + j + LANES], Locality::Temporal);
                        }
                        let mut sum = T::default();
                        for k in k0..k_end {
                            sum = sum + a[i * n + k] * b[k * n + j];
                        }
                        c[i * n + j] = c[i * n + j] + sum;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Fold `data` in 1024-element chunks and combine the chunk results.
///
/// Each chunk starts from `init`, and the chunk results are folded starting
/// from `init` again, so `init` must be an identity of `op`.
pub fn blocked_reduce<T, F>(data: &[T], init: T, op: F) -> T
where
    T: Copy,
    F: Fn(T, T) -> T,
{
    blocked_reduce_with(data, DEFAULT_REDUCE_CHUNK, init, op)
}

/// [`blocked_reduce`] with an explicit chunk length.
pub fn blocked_reduce_with<T, F>(data: &[T], chunk: usize, init: T, op: F) -> T
where
    T: Copy,
    F: Fn(T, T) -> T,
{
    let chunk = chunk.max(1);
    let mut result = init;
    for (index, block) in data.chunks(chunk).enumerate() {
        let next = (index + 1) * chunk;
        if next < data.len() {
            prefetch_read(&data[next], Locality::Temporal);
        }
        let partial = block.iter().fold(init, |acc, &x| op(acc, x));
        result = op(result, partial);
    }
    result
}
