//! # Guarded Memory
//!
//! Bounds-checked allocation for runtime clients.
//!
//! ## Design
//!
//! - Every allocation becomes a [`MemoryBlock`] registered in the
//!   allocator's address-keyed registry. An entry exists iff the block is
//!   live from the allocator's point of view.
//! - Clients receive a [`GuardedHandle<T>`]: an index-only view with no
//!   pointer arithmetic. Each access checks the index against the element
//!   count and `offset + size_of::<T>() <= block.size`.
//! - Blocks are shared through `Arc`. Deallocation removes the registry
//!   entry and marks the block released; the backing memory is returned to
//!   the system when the last `Arc` drops. A handle used after its block
//!   was deallocated reports [`WardenError::use_after_free`] instead of
//!   touching freed memory.
//! - A block with no outstanding handle is unreferenced. The reclaimer may
//!   remove such blocks once they have been idle for the grace period.
//!
//! ## Technical References
//!
//! - [`std::alloc::Layout`](https://doc.rust-lang.org/std/alloc/struct.Layout.html)
//! - [Handles are the better pointers](https://floooh.github.io/2018/06/17/handles-vs-pointers.html)

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::config::MemoryConfig;
use crate::error::{Result, WardenError};

// ============================================================================
// Memory Block
// ============================================================================

/// Drops `len` initialized elements of the type the block was created for.
type DropElements = unsafe fn(*mut u8, usize);

unsafe fn drop_elements<T>(ptr: *mut u8, len: usize) {
    std::ptr::drop_in_place(std::ptr::slice_from_raw_parts_mut(ptr.cast::<T>(), len));
}

/// One registered allocation.
pub struct MemoryBlock {
    ptr: NonNull<u8>,
    /// Layout passed to the system allocator (size is at least 1).
    layout: Layout,
    /// Requested size in bytes.
    size: usize,
    /// Number of initialized elements.
    elements: usize,
    drop_fn: Option<DropElements>,
    allocated_at: Instant,
    /// Nanoseconds after `allocated_at` of the most recent access.
    last_access: AtomicU64,
    context: String,
    protected: AtomicBool,
    released: AtomicBool,
}

// SAFETY: element data is only reached through the block's single
// `GuardedHandle`, whose own auto traits follow `T`. The registry touches
// metadata only. Element types are `Send + 'static`, so dropping them on
// whichever thread releases the last `Arc` is sound.
unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

impl MemoryBlock {
    /// Start address of the block.
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Requested size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Alignment of the block's start address.
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// Context label supplied at allocation.
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Time since allocation.
    pub fn age(&self) -> Duration {
        self.allocated_at.elapsed()
    }

    /// Time since the block was last accessed through its handle.
    pub fn idle(&self) -> Duration {
        let last = Duration::from_nanos(self.last_access.load(Ordering::Relaxed));
        self.allocated_at.elapsed().saturating_sub(last)
    }

    /// Whether the block is pinned against reclamation.
    pub fn is_protected(&self) -> bool {
        self.protected.load(Ordering::Acquire)
    }

    /// Whether the block has been removed from its allocator.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Check that `access` bytes starting at `offset` lie inside the block.
    pub fn check_access(&self, offset: usize, access: usize) -> bool {
        offset
            .checked_add(access)
            .map_or(false, |end| end <= self.size)
    }

    fn touch(&self) {
        let nanos = self.allocated_at.elapsed().as_nanos().min(u64::MAX as u128) as u64;
        self.last_access.store(nanos, Ordering::Relaxed);
    }

    fn release(&self) {
        self.released.store(true, Ordering::Release);
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from `alloc::alloc(self.layout)` and holds
        // `elements` initialized values of the type `drop_fn` was built for.
        unsafe {
            if let Some(drop_fn) = self.drop_fn {
                drop_fn(self.ptr.as_ptr(), self.elements);
            }
            alloc::dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("size", &self.size)
            .field("alignment", &self.alignment())
            .field("context", &self.context)
            .field("protected", &self.is_protected())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Point-in-time copy of a block's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSnapshot {
    /// Start address.
    pub address: usize,
    /// Size in bytes.
    pub size: usize,
    /// Alignment in bytes.
    pub alignment: usize,
    /// Time since allocation.
    pub age: Duration,
    /// Time since last handle access.
    pub idle: Duration,
    /// Context label.
    pub context: String,
    /// Outstanding handles referring to the block.
    pub references: usize,
    /// Whether the block is pinned against reclamation.
    pub protected: bool,
}

impl BlockSnapshot {
    fn of(block: &Arc<MemoryBlock>) -> Self {
        Self {
            address: block.address(),
            size: block.size,
            alignment: block.alignment(),
            age: block.age(),
            idle: block.idle(),
            context: block.context.clone(),
            references: Arc::strong_count(block).saturating_sub(1),
            protected: block.is_protected(),
        }
    }
}

/// Aggregate allocator statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Sum of the sizes of all live blocks.
    pub total_allocated: usize,
    /// Number of live blocks.
    pub block_count: usize,
    /// Size of the largest live block.
    pub largest_block: usize,
    /// Age of the oldest live block.
    pub oldest_allocation: Duration,
}

/// Result of one reclamation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimOutcome {
    /// Blocks removed.
    pub blocks: usize,
    /// Bytes removed.
    pub bytes: usize,
}

// ============================================================================
// Guarded Handle
// ============================================================================

/// Bounds-checked, index-only access to the elements of one block.
///
/// Handles are not `Clone`: each block has at most one, so `&`/`&mut`
/// borrows of the handle govern element access.
pub struct GuardedHandle<T> {
    block: Arc<MemoryBlock>,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T> GuardedHandle<T> {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the handle has no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the underlying block, the allocator's registry key.
    pub fn address(&self) -> usize {
        self.block.address()
    }

    /// Context label of the underlying block.
    pub fn context(&self) -> &str {
        self.block.context()
    }

    /// Alignment of the underlying block.
    pub fn alignment(&self) -> usize {
        self.block.alignment()
    }

    /// Whether the underlying block is still registered.
    pub fn is_live(&self) -> bool {
        !self.block.is_released()
    }

    /// Borrow element `index`.
    ///
    /// Fails with a Memory error when `index` is out of range or the block
    /// was deallocated.
    pub fn index(&self, index: usize) -> Result<&T> {
        let ptr = self.checked_ptr(index)?;
        // SAFETY: `checked_ptr` verified the element lies inside the live
        // block, which holds `len` initialized `T`s.
        Ok(unsafe { &*ptr })
    }

    /// Mutably borrow element `index`.
    pub fn index_mut(&mut self, index: usize) -> Result<&mut T> {
        let ptr = self.checked_ptr(index)?;
        // SAFETY: as in `index`; `&mut self` makes this borrow unique.
        Ok(unsafe { &mut *ptr })
    }

    /// Borrow element `index`, or `None` instead of an error.
    pub fn try_index(&self, index: usize) -> Option<&T> {
        self.index(index).ok()
    }

    /// Mutably borrow element `index`, or `None` instead of an error.
    pub fn try_index_mut(&mut self, index: usize) -> Option<&mut T> {
        self.index_mut(index).ok()
    }

    /// Overwrite element `index`.
    pub fn set(&mut self, index: usize, value: T) -> Result<()> {
        *self.index_mut(index)? = value;
        Ok(())
    }

    fn checked_ptr(&self, index: usize) -> Result<*mut T> {
        if self.block.is_released() {
            return Err(WardenError::use_after_free(self.block.address()));
        }
        let elem = mem::size_of::<T>();
        let in_block = index
            .checked_mul(elem)
            .map_or(false, |offset| self.block.check_access(offset, elem));
        if index >= self.len || !in_block {
            return Err(WardenError::out_of_bounds(index, self.len));
        }
        self.block.touch();
        // SAFETY: index < len, so the offset stays within the allocation.
        Ok(unsafe { self.block.ptr.as_ptr().cast::<T>().add(index) })
    }
}

impl<T: Copy> GuardedHandle<T> {
    /// Copy out element `index`.
    pub fn get(&self, index: usize) -> Result<T> {
        self.index(index).copied()
    }
}

impl<T> fmt::Debug for GuardedHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedHandle")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("len", &self.len)
            .field("live", &self.is_live())
            .finish()
    }
}

// ============================================================================
// Guarded Allocator
// ============================================================================

/// Allocator that registers every block and hands out guarded handles.
pub struct GuardedAllocator {
    config: MemoryConfig,
    blocks: RwLock<HashMap<usize, Arc<MemoryBlock>>>,
    /// Set under the `blocks` write lock; no block is registered after it.
    closed: AtomicBool,
}

impl GuardedAllocator {
    /// Create an allocator with the given limits.
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            blocks: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// The allocator's configuration.
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Allocate `count` default-initialized elements at the default alignment.
    pub fn allocate<T>(&self, count: usize, context: &str) -> Result<GuardedHandle<T>>
    where
        T: Default + Send + 'static,
    {
        self.allocate_aligned(count, self.config.default_alignment, context)
    }

    /// Allocate `count` elements aligned to the cache alignment (64 bytes).
    pub fn allocate_cache_aligned<T>(&self, count: usize, context: &str) -> Result<GuardedHandle<T>>
    where
        T: Default + Send + 'static,
    {
        self.allocate_aligned(count, self.config.cache_alignment, context)
    }

    /// Allocate `count` elements aligned to at least `align` bytes.
    ///
    /// The effective alignment is the largest of `align` and `T`'s own
    /// alignment. Fails when `align` is not a power of two, when the
    /// request exceeds `max_allocation`, when the system allocator fails,
    /// or once the allocator has been [closed](Self::close).
    pub fn allocate_aligned<T>(
        &self,
        count: usize,
        align: usize,
        context: &str,
    ) -> Result<GuardedHandle<T>>
    where
        T: Default + Send + 'static,
    {
        if !align.is_power_of_two() {
            return Err(WardenError::invalid_alignment(align));
        }

        let limit = self.config.max_allocation;
        let size = match count.checked_mul(mem::size_of::<T>()) {
            Some(size) if size <= limit => size,
            other => {
                let requested = other.unwrap_or(usize::MAX);
                warn!(requested, limit, context, "allocation refused");
                return Err(WardenError::allocation_too_large(requested, limit));
            }
        };

        let align = align.max(mem::align_of::<T>());
        let layout = Layout::from_size_align(size.max(1), align)
            .map_err(|_| WardenError::allocation_too_large(size, limit))?;

        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| WardenError::allocation_failed(size))?;

        let typed = ptr.as_ptr().cast::<T>();
        for i in 0..count {
            // SAFETY: `i < count` and the allocation holds `count` `T`s at
            // an alignment of at least `align_of::<T>()`.
            unsafe { typed.add(i).write(T::default()) };
        }

        let block = Arc::new(MemoryBlock {
            ptr,
            layout,
            size,
            elements: count,
            drop_fn: if mem::needs_drop::<T>() {
                Some(drop_elements::<T> as DropElements)
            } else {
                None
            },
            allocated_at: Instant::now(),
            last_access: AtomicU64::new(0),
            context: context.to_string(),
            protected: AtomicBool::new(false),
            released: AtomicBool::new(false),
        });

        {
            let mut blocks = self.blocks.write();
            if self.closed.load(Ordering::Acquire) {
                // `block` is dropped unregistered, returning its memory.
                return Err(WardenError::shut_down());
            }
            blocks.insert(block.address(), Arc::clone(&block));
        }
        trace!(address = block.address(), size, align, context, "block allocated");

        Ok(GuardedHandle {
            block,
            len: count,
            _marker: PhantomData,
        })
    }

    /// Remove a block from the registry.
    ///
    /// Returns false if the address is unknown. Memory is returned to the
    /// system once no handle refers to the block.
    pub fn deallocate(&self, address: usize) -> bool {
        let removed = {
            let mut blocks = self.blocks.write();
            let removed = blocks.remove(&address);
            if let Some(block) = &removed {
                block.release();
            }
            removed
        };
        match removed {
            Some(block) => {
                trace!(address, size = block.size, "block deallocated");
                true
            }
            None => false,
        }
    }

    /// Whether `address` is a live block.
    pub fn contains(&self, address: usize) -> bool {
        self.blocks.read().contains_key(&address)
    }

    /// Metadata for the block at `address`, if live.
    pub fn block_info(&self, address: usize) -> Option<BlockSnapshot> {
        self.blocks.read().get(&address).map(BlockSnapshot::of)
    }

    /// Pin or unpin a block against reclamation.
    ///
    /// Returns false if the address is unknown.
    pub fn protect(&self, address: usize, protected: bool) -> bool {
        match self.blocks.read().get(&address) {
            Some(block) => {
                block.protected.store(protected, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Number of live blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    /// Sum of the sizes of all live blocks.
    pub fn live_bytes(&self) -> usize {
        self.blocks.read().values().map(|b| b.size).sum()
    }

    /// Scan the registry and compute aggregate statistics.
    pub fn stats(&self) -> MemoryStats {
        let blocks = self.blocks.read();
        let mut stats = MemoryStats {
            block_count: blocks.len(),
            ..MemoryStats::default()
        };
        for block in blocks.values() {
            stats.total_allocated += block.size;
            stats.largest_block = stats.largest_block.max(block.size);
            stats.oldest_allocation = stats.oldest_allocation.max(block.age());
        }
        stats
    }

    /// Remove up to `budget` unreferenced, unprotected blocks idle for at
    /// least `grace`. Longest-idle blocks go first.
    pub fn reclaim(&self, budget: usize, grace: Duration) -> ReclaimOutcome {
        let mut blocks = self.blocks.write();

        let mut candidates: Vec<(Duration, usize)> = blocks
            .values()
            .filter(|b| Arc::strong_count(b) == 1 && !b.is_protected())
            .map(|b| (b.idle(), b.address()))
            .filter(|(idle, _)| *idle >= grace)
            .collect();
        candidates.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        let mut outcome = ReclaimOutcome::default();
        for (_, address) in candidates.into_iter().take(budget) {
            if let Some(block) = blocks.remove(&address) {
                block.release();
                outcome.blocks += 1;
                outcome.bytes += block.size;
            }
        }
        if outcome.blocks > 0 {
            debug!(blocks = outcome.blocks, bytes = outcome.bytes, "reclaimed idle blocks");
        }
        outcome
    }

    /// Refuse all further allocations and remove every block. Outstanding
    /// handles become invalid. Returns the number of blocks removed.
    pub fn close(&self) -> usize {
        let mut blocks = self.blocks.write();
        self.closed.store(true, Ordering::Release);
        for block in blocks.values() {
            block.release();
        }
        let count = blocks.len();
        blocks.clear();
        count
    }
}

impl Default for GuardedAllocator {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl fmt::Debug for GuardedAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("GuardedAllocator")
            .field("block_count", &stats.block_count)
            .field("total_allocated", &stats.total_allocated)
            .field("max_allocation", &self.config.max_allocation)
            .finish()
    }
}
