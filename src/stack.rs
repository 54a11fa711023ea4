//! # Stack allocator
//!
//! LIFO allocation with a trailing 8-byte header: the bytes
//! immediately before the end of each block record the `used` value
//! that existed before that allocation, so `free()` can pop the most
//! recent block in O(1) without a separate header record. Callers
//! must free in strictly reverse allocation order — misuse is not
//! detected. Unlike the other four variants this one gains a mutex
//! deliberately (see DESIGN.md) for uniform thread safety.

use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{error, trace, warn};

use crate::align_up;
use crate::block::{Alignment, STACK_TRAILER_SIZE};
use crate::error::{AllocError, Result};
use crate::raw;

/// A LIFO stack allocator over one pre-reserved region.
pub struct StackAllocator {
  base: NonNull<u8>,
  size: u64,
  used: AtomicU64,
  lock: Mutex<()>,
}

// SAFETY: see `LinearAllocator`.
unsafe impl Send for StackAllocator {}
unsafe impl Sync for StackAllocator {}

impl StackAllocator {
  /// Reserves a region of `size` bytes.
  pub fn create(size: u64) -> Result<Self> {
    if size == 0 {
      error!("stack_allocator_create: invalid params");
      return Err(AllocError::InvalidParams("size must be non-zero"));
    }
    let base = raw::raw_allocate(size).ok_or(AllocError::PlatformFailure("raw_allocate failed"))?;
    trace!(size, "stack_allocator_create");
    Ok(Self { base, size, used: AtomicU64::new(0), lock: Mutex::new(()) })
  }

  /// Reserves `n + 8` bytes aligned to `alignment`; the trailing 8
  /// bytes record the `used` value to restore on `free`.
  pub fn allocate_aligned(&self, n: u64, alignment: Alignment) -> Option<NonNull<u8>> {
    if n == 0 || n > self.size {
      error!(n, "stack_allocator_allocate: invalid params");
      return None;
    }
    let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

    let needed = n + STACK_TRAILER_SIZE;
    let used = self.used.load(Ordering::Relaxed);
    let curr_addr = self.base.as_ptr() as u64 + used;
    let aligned_addr = align_up!(curr_addr, alignment.bytes());
    let padding = aligned_addr - curr_addr;

    if used + padding + needed > self.size {
      warn!(n, padding, available = self.size - used, "stack_allocator_allocate: no free space");
      return None;
    }

    let trailer_addr = (aligned_addr + needed - STACK_TRAILER_SIZE) as *mut u64;
    // SAFETY: `trailer_addr` falls within the region we just reserved above.
    unsafe { trailer_addr.write_unaligned(used) };

    self.used.store(used + padding + needed, Ordering::Relaxed);
    NonNull::new(aligned_addr as *mut u8)
  }

  /// Pops the most recent block, restoring `used` to the value
  /// recorded before it was allocated. A no-op when `used == 0`.
  pub fn free(&self) {
    let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
    let used = self.used.load(Ordering::Relaxed);
    if used == 0 {
      return;
    }
    let trailer_addr = (self.base.as_ptr() as u64 + used - STACK_TRAILER_SIZE) as *const u64;
    // SAFETY: `trailer_addr` lies within the live region because `used > 0`.
    let prior_used = unsafe { trailer_addr.read_unaligned() };
    self.used.store(prior_used, Ordering::Relaxed);
  }

  /// Discards every live block at once; `used` returns to `0`.
  pub fn reset(&self) {
    let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
    self.used.store(0, Ordering::Relaxed);
    trace!("stack_allocator_reset");
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

impl Drop for StackAllocator {
  fn drop(&mut self) {
    // SAFETY: `base` was allocated by `raw_allocate(self.size)` in `create`.
    unsafe { raw::raw_free(self.base, self.size) };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  // End-to-end LIFO lifecycle: three allocations, three frees, reuse.
  #[test]
  fn lifo_free_then_reallocate_returns_same_pointer() {
    let allocator = StackAllocator::create(1024).unwrap();
    let a = allocator.allocate_aligned(64, Alignment::Eight).unwrap();
    let _b = allocator.allocate_aligned(128, Alignment::Eight).unwrap();
    let _c = allocator.allocate_aligned(256, Alignment::Eight).unwrap();

    allocator.free();
    allocator.free();
    allocator.free();

    assert_eq!(allocator.used_memory(), 0);

    let reallocated = allocator.allocate_aligned(64, Alignment::Eight).unwrap();
    assert_eq!(reallocated, a);
  }

  #[test]
  fn free_when_empty_is_noop() {
    let allocator = StackAllocator::create(256).unwrap();
    allocator.free();
    assert_eq!(allocator.used_memory(), 0);
  }

  #[test]
  fn k_allocations_then_k_frees_restores_zero() {
    let allocator = StackAllocator::create(4096).unwrap();
    for i in 0..10u64 {
      allocator.allocate_aligned(8 + i, Alignment::Eight).unwrap();
    }
    for _ in 0..10 {
      allocator.free();
    }
    assert_eq!(allocator.used_memory(), 0);
  }

  #[test]
  fn allocate_then_free_restores_prior_used_for_varied_sizes() {
    let allocator = StackAllocator::create(4096).unwrap();
    for n in [1u64, 7, 8, 63, 200] {
      let before = allocator.used_memory();
      allocator.allocate_aligned(n, Alignment::Eight).unwrap();
      allocator.free();
      assert_eq!(allocator.used_memory(), before);
    }
  }

  #[test]
  fn reset_zeroes_used() {
    let allocator = StackAllocator::create(512).unwrap();
    allocator.allocate_aligned(32, Alignment::Eight).unwrap();
    allocator.reset();
    assert_eq!(allocator.used_memory(), 0);
  }
}
