//! # Pool allocator
//!
//! Fixed-size chunks threaded as a singleton free list: every chunk
//! begins with a [`PoolHeader`], all chunks are linked at
//! construction, `allocate` pops the head, `free` pushes it back.
//! O(1) allocate and free, no splitting, no fragmentation.

use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{error, trace};

use crate::align::is_power_of_two;
use crate::block::{CANARY, POOL_HEADER_SIZE, PoolHeader};
use crate::error::{AllocError, Result};
use crate::raw;

struct PoolState {
  head: Option<NonNull<PoolHeader>>,
}

/// A fixed-chunk-size pool allocator over one pre-reserved region.
pub struct PoolAllocator {
  base: NonNull<u8>,
  size: u64,
  chunk_size: u64,
  used: AtomicU64,
  state: Mutex<PoolState>,
}

// SAFETY: see `LinearAllocator`.
unsafe impl Send for PoolAllocator {}
unsafe impl Sync for PoolAllocator {}

impl PoolAllocator {
  /// Reserves a region of `size` bytes sliced into chunks of
  /// `chunk_size` bytes. `chunk_size` must be a power of two greater
  /// than the pool header size.
  pub fn create(size: u64, chunk_size: u64) -> Result<Self> {
    if size == 0
      || chunk_size == 0
      || !is_power_of_two(chunk_size)
      || chunk_size <= POOL_HEADER_SIZE
      || size <= POOL_HEADER_SIZE
    {
      error!("pool_allocator_create: invalid params");
      return Err(AllocError::InvalidParams("chunk_size must be a power of two exceeding the header size"));
    }
    let base = raw::raw_allocate(size).ok_or(AllocError::PlatformFailure("raw_allocate failed"))?;
    let head = unsafe { Self::thread_free_chunks(base, size, chunk_size) };
    trace!(size, chunk_size, "pool_allocator_create");
    Ok(Self { base, size, chunk_size, used: AtomicU64::new(0), state: Mutex::new(PoolState { head }) })
  }

  /// # Safety
  /// `base` must be valid for `size` bytes and exclusively owned.
  unsafe fn thread_free_chunks(base: NonNull<u8>, size: u64, chunk_size: u64) -> Option<NonNull<PoolHeader>> {
    let count = size / chunk_size;
    if count == 0 {
      return None;
    }
    for i in 0..count {
      let addr = base.as_ptr() as u64 + i * chunk_size;
      let next = if i + 1 < count { NonNull::new((addr + chunk_size) as *mut PoolHeader) } else { None };
      // SAFETY: `addr` is within `[base, base + size)` by construction.
      unsafe { (addr as *mut PoolHeader).write(PoolHeader { next, canary: 0 }) };
    }
    NonNull::new(base.as_ptr() as *mut PoolHeader)
  }

  /// Pops the head chunk from the free list. Returns `None` when the
  /// pool is exhausted.
  pub fn allocate(&self) -> Option<NonNull<u8>> {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    let chunk = state.head?;
    // SAFETY: `chunk` came from the free list, which only ever holds
    // live headers within this region.
    let next = unsafe { (*chunk.as_ptr()).next };
    state.head = next;
    drop(state);

    // SAFETY: `chunk` is a valid `PoolHeader` within the region.
    unsafe {
      (*chunk.as_ptr()).next = None;
      (*chunk.as_ptr()).canary = CANARY;
    }
    self.used.fetch_add(self.chunk_size, Ordering::Relaxed);

    let payload = chunk.as_ptr() as u64 + POOL_HEADER_SIZE;
    NonNull::new(payload as *mut u8)
  }

  /// Returns `ptr` (as returned by [`PoolAllocator::allocate`]) to the
  /// free list. Logs and no-ops on an out-of-range pointer or missing
  /// canary (double free or foreign pointer).
  pub fn free(&self, ptr: NonNull<u8>) {
    let base_addr = self.base.as_ptr() as u64;
    let ptr_addr = ptr.as_ptr() as u64;
    if ptr_addr < base_addr + POOL_HEADER_SIZE || ptr_addr >= base_addr + self.size + POOL_HEADER_SIZE {
      error!("pool_allocator_free: invalid memory address");
      return;
    }
    let header_addr = ptr_addr - POOL_HEADER_SIZE;
    let header = header_addr as *mut PoolHeader;
    // SAFETY: `header_addr` is within the region, validated above.
    let canary = unsafe { (*header).canary };
    if canary != CANARY {
      error!("pool_allocator_free: invalid memory address");
      return;
    }

    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    // SAFETY: `header` is a valid `PoolHeader` within the region.
    unsafe {
      (*header).canary = 0;
      (*header).next = state.head;
    }
    state.head = NonNull::new(header);
    drop(state);
    self.used.fetch_sub(self.chunk_size, Ordering::Relaxed);
  }

  /// Re-threads the whole region from scratch, discarding any outstanding pointers.
  pub fn reset(&self) {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    // SAFETY: `self.base` is valid for `self.size` bytes, exclusively owned.
    state.head = unsafe { Self::thread_free_chunks(self.base, self.size, self.chunk_size) };
    drop(state);
    self.used.store(0, Ordering::Relaxed);
    trace!("pool_allocator_reset");
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

  /// Maximum number of chunks this pool can hand out concurrently.
  pub fn chunk_count(&self) -> u64 {
    self.size / self.chunk_size
  }
}

impl Drop for PoolAllocator {
  fn drop(&mut self) {
    // SAFETY: `base` was allocated by `raw_allocate(self.size)` in `create`.
    unsafe { raw::raw_free(self.base, self.size) };
  }
}
