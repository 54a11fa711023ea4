//! # Linear (bump) allocator
//!
//! Monotonic bump-pointer allocation: `used` only ever grows until a
//! whole-arena [`LinearAllocator::reset`]. O(1) allocation, zero
//! fragmentation within one epoch, no per-block free — a single
//! pre-reserved region bumped forward instead of growing the heap
//! segment via `sbrk`.

use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{error, trace, warn};

use crate::align_up;
use crate::block::Alignment;
use crate::error::{AllocError, Result};
use crate::raw;

/// A monotonic bump allocator over one pre-reserved region.
pub struct LinearAllocator {
  base: NonNull<u8>,
  size: u64,
  used: AtomicU64,
  lock: Mutex<()>,
}

// SAFETY: `base` is exclusively owned by this allocator; all mutating
// access to the region it points at goes through `lock`.
unsafe impl Send for LinearAllocator {}
unsafe impl Sync for LinearAllocator {}

impl LinearAllocator {
  /// Reserves a region of `size` bytes. Fails if `size == 0` or the
  /// backing allocation fails.
  pub fn create(size: u64) -> Result<Self> {
    if size == 0 {
      error!("linear_allocator_create: invalid params");
      return Err(AllocError::InvalidParams("size must be non-zero"));
    }
    let base = raw::raw_allocate(size).ok_or(AllocError::PlatformFailure("raw_allocate failed"))?;
    trace!(size, "linear_allocator_create");
    Ok(Self { base, size, used: AtomicU64::new(0), lock: Mutex::new(()) })
  }

  /// Reserves `n` bytes aligned to `alignment`. Returns `None` on
  /// invalid parameters or when the region has no room left.
  pub fn allocate_aligned(&self, n: u64, alignment: Alignment) -> Option<NonNull<u8>> {
    if n == 0 || n > self.size {
      error!(n, "linear_allocator_allocate: invalid params");
      return None;
    }
    let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

    let used = self.used.load(Ordering::Relaxed);
    let curr_addr = self.base.as_ptr() as u64 + used;
    let aligned_addr = align_up!(curr_addr, alignment.bytes());
    let padding = aligned_addr - curr_addr;

    if used + padding + n > self.size {
      warn!(n, padding, available = self.size - used, "linear_allocator_allocate: no free space");
      return None;
    }

    self.used.store(used + padding + n, Ordering::Relaxed);
    NonNull::new(aligned_addr as *mut u8)
  }

  /// Releases the whole arena for reuse in one step; `used` returns to `0`.
  pub fn reset(&self) {
    let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
    self.used.store(0, Ordering::Relaxed);
    trace!("linear_allocator_reset");
  }

  /// Bytes currently in use. May be stale by one concurrent operation.
  pub fn used_memory(&self) -> u64 {
    self.used.load(Ordering::Relaxed)
  }

  /// Bytes still available. May be stale by one concurrent operation.
  pub fn unused_memory(&self) -> u64 {
    self.size - self.used_memory()
  }

  /// Total region capacity.
  pub fn capacity(&self) -> u64 {
    self.size
  }
}

impl Drop for LinearAllocator {
  fn drop(&mut self) {
    // SAFETY: `base` was allocated by `raw_allocate(self.size)` in `create`
    // and this is the only place it is ever freed.
    unsafe { raw::raw_free(self.base, self.size) };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn is_aligned(ptr: NonNull<u8>, align: u64) -> bool {
    (ptr.as_ptr() as u64) % align == 0
  }

  #[test]
  fn invalid_size_fails_construction() {
    assert!(LinearAllocator::create(0).is_err());
  }

  // End-to-end lifecycle: allocate, align, reset.
  #[test]
  fn allocate_align_then_reset_lifecycle() {
    let allocator = LinearAllocator::create(1024).unwrap();
    let base = allocator.base.as_ptr() as u64;

    let p1 = allocator.allocate_aligned(256, Alignment::Eight).unwrap();
    assert_eq!(p1.as_ptr() as u64, base);
    assert_eq!(allocator.used_memory(), 256);

    let p2 = allocator.allocate_aligned(10, Alignment::Sixteen).unwrap();
    assert_eq!(p2.as_ptr() as u64 % 16, 0);
    assert!(allocator.used_memory() >= 266);

    allocator.reset();
    assert_eq!(allocator.used_memory(), 0);
  }

  #[test]
  fn n_allocations_occupy_exactly_n_times_aligned_k() {
    let allocator = LinearAllocator::create(4096).unwrap();
    let k = 13u64;
    let n = 20u64;
    for _ in 0..n {
      allocator.allocate_aligned(k, Alignment::Eight).unwrap();
    }
    assert_eq!(allocator.used_memory(), n * align_up!(k, 8));
  }

  #[test]
  fn allocations_respect_requested_alignment() {
    let allocator = LinearAllocator::create(4096).unwrap();
    for &align in &[Alignment::Eight, Alignment::Sixteen, Alignment::ThirtyTwo, Alignment::SixtyFour] {
      let ptr = allocator.allocate_aligned(3, align).unwrap();
      assert!(is_aligned(ptr, align.bytes()));
    }
  }

  #[test]
  fn allocation_beyond_capacity_fails() {
    let allocator = LinearAllocator::create(64).unwrap();
    assert!(allocator.allocate_aligned(128, Alignment::Eight).is_none());
    assert_eq!(allocator.used_memory(), 0);
  }

  #[test]
  fn used_plus_unused_equals_capacity() {
    let allocator = LinearAllocator::create(512).unwrap();
    allocator.allocate_aligned(100, Alignment::Eight).unwrap();
    assert_eq!(allocator.used_memory() + allocator.unused_memory(), allocator.capacity());
  }

  #[test]
  fn destroy_returns_region_to_process() {
    let before = raw::allocated_memory();
    {
      let allocator = LinearAllocator::create(2048).unwrap();
      allocator.allocate_aligned(64, Alignment::Eight).unwrap();
    }
    assert_eq!(raw::allocated_memory(), before);
  }
}
