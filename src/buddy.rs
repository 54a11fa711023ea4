//! # Buddy allocator
//!
//! Power-of-two block sizes arranged in per-class free lists indexed
//! by `log2(size)`. Allocation repeatedly halves the smallest
//! available class down to the requested size; `free` computes the
//! buddy address by XORing the block's offset with its size and
//! merges as long as the buddy is itself free and unsplit — fully
//! unlinking the buddy from its free list on every merge (the original
//! C source only partially unlinks, corrupting the list on repeated
//! merges; see DESIGN.md).

use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{error, trace, warn};

use crate::align::{is_power_of_two, next_pow2};
use crate::block::{BUDDY_HEADER_SIZE, BuddyHeader, CANARY};
use crate::error::{AllocError, Result};
use crate::raw;

const MAX_CLASSES: usize = 64;

struct BuddyState {
  /// `free_lists[k]` holds blocks of size `2^k`.
  free_lists: [Option<NonNull<BuddyHeader>>; MAX_CLASSES],
}

/// A binary-buddy allocator over one power-of-two-sized pre-reserved region.
pub struct BuddyAllocator {
  base: NonNull<u8>,
  size: u64,
  min_class: u32,
  max_class: u32,
  used: AtomicU64,
  state: Mutex<BuddyState>,
}

// SAFETY: see `LinearAllocator`.
unsafe impl Send for BuddyAllocator {}
unsafe impl Sync for BuddyAllocator {}

impl BuddyAllocator {
  /// Reserves a region of `size` bytes, rounded up to the next power
  /// of two, split no finer than `min_block_size` (itself rounded up
  /// to a power of two and to at least the buddy header size).
  pub fn create(size: u64, min_block_size: u64) -> Result<Self> {
    if size == 0 || min_block_size == 0 {
      error!("buddy_allocator_create: invalid params");
      return Err(AllocError::InvalidParams("size and min_block_size must be non-zero"));
    }
    let min_block_size = next_pow2(min_block_size.max(BUDDY_HEADER_SIZE));
    let total = next_pow2(size);
    if min_block_size > total {
      error!("buddy_allocator_create: invalid params");
      return Err(AllocError::InvalidParams("min_block_size exceeds total size"));
    }
    let base = raw::raw_allocate(total).ok_or(AllocError::PlatformFailure("raw_allocate failed"))?;

    let min_class = min_block_size.trailing_zeros();
    let max_class = total.trailing_zeros();
    if max_class as usize >= MAX_CLASSES {
      error!("buddy_allocator_create: size exceeds supported class range");
      return Err(AllocError::InvalidParams("size too large"));
    }

    let head_addr = base.as_ptr() as u64;
    // SAFETY: `head_addr` is the start of the region we just reserved.
    unsafe { (head_addr as *mut BuddyHeader).write(BuddyHeader { size: total, prev: None, next: None, canary: 0 }) };
    let mut free_lists: [Option<NonNull<BuddyHeader>>; MAX_CLASSES] = [None; MAX_CLASSES];
    free_lists[max_class as usize] = NonNull::new(head_addr as *mut BuddyHeader);

    trace!(size = total, min_block_size, "buddy_allocator_create");
    Ok(Self { base, size: total, min_class, max_class, used: AtomicU64::new(0), state: Mutex::new(BuddyState { free_lists }) })
  }

  fn class_for(&self, n: u64) -> Option<u32> {
    let needed = next_pow2((n + BUDDY_HEADER_SIZE).max(1 << self.min_class));
    let class = needed.trailing_zeros();
    if class > self.max_class { None } else { Some(class.max(self.min_class)) }
  }

  /// Splits the smallest available class that can satisfy `n` down to
  /// the target class, returning a freshly carved block of exactly
  /// `2^class` bytes.
  pub fn allocate(&self, n: u64) -> Option<NonNull<u8>> {
    if n == 0 {
      error!("buddy_allocator_allocate: invalid params");
      return None;
    }
    let Some(target_class) = self.class_for(n) else {
      error!(n, "buddy_allocator_allocate: request exceeds arena size");
      return None;
    };

    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

    let mut source_class = target_class;
    while source_class <= self.max_class && state.free_lists[source_class as usize].is_none() {
      source_class += 1;
    }
    if source_class > self.max_class {
      warn!(n, "buddy_allocator_allocate: no free space");
      return None;
    }

    let mut block = state.free_lists[source_class as usize].take().unwrap();
    // SAFETY: `block` is live, just unlinked from its class list.
    state.free_lists[source_class as usize] = unsafe { block.as_ref().next };
    if let Some(mut next) = state.free_lists[source_class as usize] {
      // SAFETY: `next` is a live chain member.
      unsafe { next.as_mut().prev = None };
    }

    for class in (target_class..source_class).rev() {
      let half_size = 1u64 << class;
      let buddy_addr = block.as_ptr() as u64 + half_size;
      // SAFETY: `buddy_addr` lands strictly inside the block being split.
      unsafe { (buddy_addr as *mut BuddyHeader).write(BuddyHeader { size: half_size, prev: None, next: None, canary: 0 }) };
      let mut buddy = NonNull::new(buddy_addr as *mut BuddyHeader).unwrap();
      // SAFETY: `buddy` was just constructed above.
      unsafe {
        buddy.as_mut().next = state.free_lists[class as usize];
      }
      if let Some(mut old_head) = state.free_lists[class as usize] {
        // SAFETY: `old_head` is a live chain member.
        unsafe { old_head.as_mut().prev = Some(buddy) };
      }
      state.free_lists[class as usize] = Some(buddy);
      // SAFETY: `block` is live; we are only shrinking its recorded size.
      unsafe { block.as_mut().size = half_size };
    }

    drop(state);
    // SAFETY: `block` is the header being handed out.
    unsafe {
      block.as_mut().canary = CANARY;
      block.as_mut().prev = None;
      block.as_mut().next = None;
    }
    self.used.fetch_add(1u64 << target_class, Ordering::Relaxed);

    let payload = block.as_ptr() as u64 + BUDDY_HEADER_SIZE;
    NonNull::new(payload as *mut u8)
  }

  fn buddy_address(&self, block_addr: u64, class: u32) -> u64 {
    let base_addr = self.base.as_ptr() as u64;
    let offset = block_addr - base_addr;
    base_addr + (offset ^ (1u64 << class))
  }

  fn unlink(&self, state: &mut BuddyState, class: u32, mut block: NonNull<BuddyHeader>) {
    // SAFETY: `block` is a live member of `state.free_lists[class]`.
    let (prev, next) = unsafe { (block.as_ref().prev, block.as_ref().next) };
    match prev {
      Some(mut p) => unsafe { p.as_mut().next = next },
      None => state.free_lists[class as usize] = next,
    }
    if let Some(mut n) = next {
      unsafe { n.as_mut().prev = prev };
    }
    unsafe {
      block.as_mut().prev = None;
      block.as_mut().next = None;
    }
  }

  /// Validates range and canary, then merges `p`'s block upward with
  /// its buddy for as long as the buddy is itself free at the same
  /// class, fully unlinking the buddy from its free list each time.
  pub fn free(&self, p: NonNull<u8>) {
    let base_addr = self.base.as_ptr() as u64;
    let p_addr = p.as_ptr() as u64;
    if p_addr < base_addr + BUDDY_HEADER_SIZE || p_addr >= base_addr + self.size + BUDDY_HEADER_SIZE {
      error!("buddy_allocator_free: invalid memory address");
      return;
    }
    let header_addr = p_addr - BUDDY_HEADER_SIZE;
    let mut block = NonNull::new(header_addr as *mut BuddyHeader).unwrap();
    // SAFETY: `header_addr` is within the region, validated above.
    if unsafe { block.as_ref().canary } != CANARY {
      error!("buddy_allocator_free: invalid memory address");
      return;
    }

    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    // SAFETY: `block` is a valid, live `BuddyHeader`.
    let mut class = unsafe { block.as_ref().size.trailing_zeros() };
    self.used.fetch_sub(1u64 << class, Ordering::Relaxed);
    unsafe { block.as_mut().canary = 0 };

    while class < self.max_class {
      let buddy_addr = self.buddy_address(block.as_ptr() as u64, class);
      let Some(mut buddy) = NonNull::new(buddy_addr as *mut BuddyHeader) else { break };
      // SAFETY: `buddy_addr` is within the region; we only read its header
      // once we confirm it is currently a free block of the same class
      // by walking this class's free list below.
      let buddy_is_free_here = {
        let mut cursor = state.free_lists[class as usize];
        let mut found = false;
        while let Some(candidate) = cursor {
          if candidate.as_ptr() as u64 == buddy_addr {
            found = true;
            break;
          }
          // SAFETY: every chain member is live.
          cursor = unsafe { candidate.as_ref().next };
        }
        found
      };
      if !buddy_is_free_here {
        break;
      }
      self.unlink(&mut state, class, buddy);
      unsafe { buddy.as_mut().canary = 0 };

      let merged_addr = block.as_ptr().min(buddy.as_ptr()) as u64;
      class += 1;
      block = NonNull::new(merged_addr as *mut BuddyHeader).unwrap();
      // SAFETY: `merged_addr` is the lower of the two buddies, now
      // representing one block of the combined size.
      unsafe { block.as_mut().size = 1u64 << class };
    }

    // SAFETY: `block` is the final merged header.
    unsafe {
      block.as_mut().next = state.free_lists[class as usize];
      block.as_mut().prev = None;
    }
    if let Some(mut old_head) = state.free_lists[class as usize] {
      unsafe { old_head.as_mut().prev = Some(block) };
    }
    state.free_lists[class as usize] = Some(block);

    trace!(header_addr, "buddy_allocator_free");
  }

  /// Collapses the whole region back into one free block at the top class.
  pub fn reset(&self) {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    state.free_lists = [None; MAX_CLASSES];
    let head_addr = self.base.as_ptr() as u64;
    // SAFETY: the allocator exclusively owns `[base, base+size)`.
    unsafe { (head_addr as *mut BuddyHeader).write(BuddyHeader { size: self.size, prev: None, next: None, canary: 0 }) };
    state.free_lists[self.max_class as usize] = NonNull::new(head_addr as *mut BuddyHeader);
    drop(state);
    self.used.store(0, Ordering::Relaxed);
    trace!("buddy_allocator_reset");
  }

  /// Bytes currently in use. May be stale by one concurrent operation.
  pub fn used_memory(&self) -> u64 {
    self.used.load(Ordering::Relaxed)
  }

  /// Bytes still available. May be stale by one concurrent operation.
  pub fn unused_memory(&self) -> u64 {
    self.size - self.used_memory()
  }

  /// Total region capacity (rounded up to a power of two at construction).
  pub fn capacity(&self) -> u64 {
    self.size
  }

  /// `true` iff the free list holds exactly one block, at the top class.
  pub fn is_fully_merged(&self) -> bool {
    let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    let top_occupied = state.free_lists[self.max_class as usize].is_some();
    let others_empty = state.free_lists[self.min_class as usize..self.max_class as usize].iter().all(|c| c.is_none());
    top_occupied && others_empty
  }
}

impl Drop for BuddyAllocator {
  fn drop(&mut self) {
    // SAFETY: `base` was allocated by `raw_allocate(self.size)` in `create`.
    unsafe { raw::raw_free(self.base, self.size) };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn is_power_of_two_usize(n: usize) -> bool {
    is_power_of_two(n as u64)
  }

  #[test]
  fn invalid_params_fail_construction() {
    assert!(BuddyAllocator::create(0, 64).is_err());
    assert!(BuddyAllocator::create(64, 0).is_err());
  }

  #[test]
  fn rounds_size_up_to_power_of_two() {
    let allocator = BuddyAllocator::create(1000, 32).unwrap();
    assert!(is_power_of_two_usize(allocator.capacity() as usize));
    assert!(allocator.capacity() >= 1000);
  }

  // Split two blocks out of one class, then merge them back.
  #[test]
  fn split_two_blocks_then_merge_back_to_top_class() {
    let allocator = BuddyAllocator::create(1024, 32).unwrap();
    let a = allocator.allocate(50).unwrap();
    let b = allocator.allocate(50).unwrap();
    assert!(!allocator.is_fully_merged());

    allocator.free(a);
    allocator.free(b);
    assert!(allocator.is_fully_merged());
  }

  #[test]
  fn after_freeing_all_allocations_free_list_has_one_top_class_block() {
    let allocator = BuddyAllocator::create(2048, 64).unwrap();
    let mut pointers = Vec::new();
    while let Some(p) = allocator.allocate(64) {
      pointers.push(p);
    }
    for p in pointers {
      allocator.free(p);
    }
    assert!(allocator.is_fully_merged());
    assert_eq!(allocator.used_memory(), 0);
  }

  #[test]
  fn bad_canary_free_is_noop() {
    let allocator = BuddyAllocator::create(1024, 32).unwrap();
    let p = allocator.allocate(50).unwrap();
    let used_before = allocator.used_memory();
    // SAFETY: test-only corruption confined to this allocator's region.
    unsafe {
      let header = (p.as_ptr() as u64 - BUDDY_HEADER_SIZE) as *mut BuddyHeader;
      (*header).canary = 0;
    }
    allocator.free(p);
    assert_eq!(allocator.used_memory(), used_before);
  }

  #[test]
  fn request_larger_than_arena_fails() {
    let allocator = BuddyAllocator::create(256, 32).unwrap();
    assert!(allocator.allocate(4096).is_none());
  }

  #[test]
  fn reset_collapses_to_top_class() {
    let allocator = BuddyAllocator::create(1024, 32).unwrap();
    allocator.allocate(50).unwrap();
    allocator.reset();
    assert!(allocator.is_fully_merged());
    assert_eq!(allocator.used_memory(), 0);
  }
}
