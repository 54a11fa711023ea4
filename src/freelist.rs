//! # Free-list allocator
//!
//! Best-fit search over a doubly-linked free chain, splitting blocks
//! that overshoot the request and merging adjacent free neighbours on
//! `free`. A [`PtrHashSet`] tracks every free block's address so a
//! block can ask "is my neighbour free?" in O(1) instead of walking
//! the chain, per the hash-set-coalescing variant of the original.

use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{error, trace, warn};

use crate::align_up;
use crate::block::{CANARY, FREELIST_HEADER_SIZE, FreelistHeader};
use crate::error::{AllocError, Result};
use crate::hash_set::PtrHashSet;
use crate::raw;

struct FreelistState {
  head: Option<NonNull<FreelistHeader>>,
  free_set: PtrHashSet,
}

/// A best-fit free-list allocator over one pre-reserved region.
pub struct FreelistAllocator {
  base: NonNull<u8>,
  size: u64,
  used: AtomicU64,
  state: Mutex<FreelistState>,
}

// SAFETY: see `LinearAllocator`.
unsafe impl Send for FreelistAllocator {}
unsafe impl Sync for FreelistAllocator {}

impl FreelistAllocator {
  /// Reserves a region of `size` bytes as one large free block.
  pub fn create(size: u64) -> Result<Self> {
    if size <= FREELIST_HEADER_SIZE {
      error!("freelist_allocator_create: invalid params");
      return Err(AllocError::InvalidParams("size must exceed the free-list header size"));
    }
    let base = raw::raw_allocate(size).ok_or(AllocError::PlatformFailure("raw_allocate failed"))?;
    let head_addr = base.as_ptr() as u64;
    // SAFETY: `head_addr` is the start of the region we just reserved.
    unsafe {
      (head_addr as *mut FreelistHeader).write(FreelistHeader { size, prev: None, next: None, canary: 0 })
    };
    let mut free_set = PtrHashSet::new();
    free_set.insert(head_addr as usize);
    trace!(size, "freelist_allocator_create");
    Ok(Self {
      base,
      size,
      used: AtomicU64::new(0),
      state: Mutex::new(FreelistState { head: NonNull::new(head_addr as *mut FreelistHeader), free_set }),
    })
  }

  fn best_fit(&self, state: &FreelistState, needed: u64) -> Option<NonNull<FreelistHeader>> {
    let mut best: Option<NonNull<FreelistHeader>> = None;
    let mut cursor = state.head;
    while let Some(block) = cursor {
      // SAFETY: every node reachable from `head` is a live `FreelistHeader`.
      let b = unsafe { block.as_ref() };
      if b.size >= needed && best.map(|cur| unsafe { cur.as_ref().size } > b.size).unwrap_or(true) {
        best = Some(block);
      }
      cursor = b.next;
    }
    best
  }

  /// Walks the whole free chain merging every physically adjacent pair
  /// the hash set can confirm, repeating until a full pass finds
  /// nothing left to merge. Run under allocation pressure to recover
  /// blocks the opportunistic merge in `free` didn't have to find.
  fn sweep(&self, state: &mut FreelistState) {
    loop {
      let mut merged_any = false;
      let mut cursor = state.head;
      while let Some(block) = cursor {
        // SAFETY: every node reachable from `head` is a live `FreelistHeader`.
        let b = unsafe { block.as_ref() };
        let next_addr = block.as_ptr() as u64 + b.size;
        cursor = b.next;
        if next_addr != block.as_ptr() as u64 && state.free_set.contains(next_addr as usize) {
          if let Some(neighbor) = NonNull::new(next_addr as *mut FreelistHeader) {
            if neighbor != block {
              // SAFETY: `neighbor` is confirmed free and physically adjacent.
              let absorbed_size = unsafe { neighbor.as_ref().size };
              self.replace_in_chain(state, neighbor, None);
              state.free_set.remove(next_addr as usize);
              // SAFETY: `block` is still a live chain member.
              unsafe {
                (*block.as_ptr()).size += absorbed_size;
                (*neighbor.as_ptr()).canary = 0;
              }
              merged_any = true;
              cursor = state.head;
            }
          }
        }
      }
      if !merged_any {
        break;
      }
    }
  }

  /// Best-fit search: walks the free chain and keeps the smallest
  /// block that still fits `needed` bytes. Splits it in place when the
  /// remainder can itself hold a header plus one byte of payload. If no
  /// block fits, runs a coalescing sweep over the whole free chain and
  /// retries once before giving up.
  pub fn allocate(&self, n: u64) -> Option<NonNull<u8>> {
    if n == 0 {
      error!("freelist_allocator_allocate: invalid params");
      return None;
    }
    let needed = FREELIST_HEADER_SIZE + align_up!(n, 8);
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

    let mut best = self.best_fit(&state, needed);
    if best.is_none() {
      self.sweep(&mut state);
      best = self.best_fit(&state, needed);
    }

    let Some(block) = best else {
      warn!(n, "freelist_allocator_allocate: no free space");
      return None;
    };

    // SAFETY: `block` is live and was just selected above.
    let block_size = unsafe { block.as_ref().size };
    let remainder = block_size - needed;
    if remainder > FREELIST_HEADER_SIZE {
      let new_block_addr = block.as_ptr() as u64 + needed;
      // SAFETY: `new_block_addr` lands strictly inside `block`'s span.
      unsafe {
        (new_block_addr as *mut FreelistHeader)
          .write(FreelistHeader { size: remainder, prev: None, next: None, canary: 0 })
      };
      let new_block = NonNull::new(new_block_addr as *mut FreelistHeader);
      self.replace_in_chain(&mut state, block, new_block);
      state.free_set.insert(new_block_addr as usize);
      // SAFETY: `block` is still live; we are only shrinking its recorded size.
      unsafe { (*block.as_ptr()).size = needed };
    } else {
      self.replace_in_chain(&mut state, block, unsafe { block.as_ref().next });
    }
    state.free_set.remove(block.as_ptr() as usize);
    // SAFETY: `block` is the header we are handing out.
    unsafe {
      (*block.as_ptr()).canary = CANARY;
      (*block.as_ptr()).prev = None;
      (*block.as_ptr()).next = None;
    }
    drop(state);
    // `free` later subtracts the block's full recorded `size`, so the
    // no-split branch must add that same full size here, not `needed`.
    let consumed = if remainder > FREELIST_HEADER_SIZE { needed } else { block_size };
    self.used.fetch_add(consumed, Ordering::Relaxed);

    let payload = block.as_ptr() as u64 + FREELIST_HEADER_SIZE;
    NonNull::new(payload as *mut u8)
  }

  /// Unlinks `old` from the free chain, splicing `replacement` (if
  /// any) into its place.
  fn replace_in_chain(
    &self,
    state: &mut FreelistState,
    old: NonNull<FreelistHeader>,
    replacement: Option<NonNull<FreelistHeader>>,
  ) {
    // SAFETY: `old` is a live member of the chain guarded by `state`.
    let (prev, next) = unsafe { (old.as_ref().prev, old.as_ref().next) };
    if let Some(mut r) = replacement {
      // SAFETY: `r` was just constructed above and is not yet linked.
      unsafe {
        r.as_mut().prev = prev;
        r.as_mut().next = next;
      }
    }
    match prev {
      // SAFETY: `p` is a live chain member.
      Some(mut p) => unsafe { p.as_mut().next = replacement.or(next) },
      None => state.head = replacement.or(next),
    }
    if let Some(mut n) = next {
      // SAFETY: `n` is a live chain member.
      unsafe { n.as_mut().prev = replacement.or(prev) };
    }
  }

  /// Validates range and canary, then returns `p` to the free chain,
  /// coalescing with a physically adjacent free neighbour when the
  /// hash set shows one exists.
  pub fn free(&self, p: NonNull<u8>) {
    let base_addr = self.base.as_ptr() as u64;
    let p_addr = p.as_ptr() as u64;
    if p_addr < base_addr + FREELIST_HEADER_SIZE || p_addr >= base_addr + self.size + FREELIST_HEADER_SIZE {
      error!("freelist_allocator_free: invalid memory address");
      return;
    }
    let header_addr = p_addr - FREELIST_HEADER_SIZE;
    let mut block = header_addr as *mut FreelistHeader;
    // SAFETY: `header_addr` is within the region, validated above.
    if unsafe { (*block).canary } != CANARY {
      error!("freelist_allocator_free: invalid memory address");
      return;
    }

    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    // SAFETY: `block` is a valid, live `FreelistHeader`.
    let block_size = unsafe { (*block).size };
    self.used.fetch_sub(block_size, Ordering::Relaxed);

    // Coalesce with the block physically preceding this one, if free.
    // (A double free is already ruled out by the canary check above: a
    // block that's on the free chain has a cleared canary.)
    let mut merged_with_prev = false;

    // Find whether a free block ends exactly at `header_addr` (prior neighbour).
    let mut cursor = state.head;
    while let Some(candidate) = cursor {
      // SAFETY: every chain member is live.
      let c = unsafe { candidate.as_ref() };
      if candidate.as_ptr() as u64 + c.size == header_addr {
        // SAFETY: merging two adjacent live headers into one.
        unsafe { (*candidate.as_ptr()).size += block_size };
        state.free_set.remove(header_addr as usize);
        merged_with_prev = true;
        block = candidate.as_ptr();
        break;
      }
      cursor = c.next;
    }

    if !merged_with_prev {
      // SAFETY: `block` is the header being freed.
      unsafe {
        (*block).canary = 0;
        (*block).prev = None;
      }
      match state.head {
        Some(mut h) => {
          // SAFETY: `h` is the current head, a live chain member.
          unsafe {
            h.as_mut().prev = NonNull::new(block);
            (*block).next = Some(h);
          }
          state.head = NonNull::new(block);
        }
        None => {
          // The free list is empty: this block becomes the sole member.
          unsafe { (*block).next = None };
          state.head = NonNull::new(block);
        }
      }
      state.free_set.insert(block as usize);
    }

    // Coalesce with the block physically following this one, if free.
    let merged_addr = block as u64;
    let merged_size = unsafe { (*block).size };
    let next_addr = merged_addr + merged_size;
    if state.free_set.contains(next_addr as usize) {
      let mut cursor = state.head;
      while let Some(candidate) = cursor {
        if candidate.as_ptr() as u64 == next_addr {
          // SAFETY: `candidate` is the live neighbour immediately following `block`.
          let absorbed_size = unsafe { candidate.as_ref().size };
          self.replace_in_chain(&mut state, candidate, None);
          state.free_set.remove(next_addr as usize);
          unsafe {
            (*block).size += absorbed_size;
            (*candidate.as_ptr()).canary = 0;
          }
          break;
        }
        // SAFETY: every chain member is live.
        cursor = unsafe { candidate.as_ref().next };
      }
    }

    trace!(header_addr, "freelist_allocator_free");
  }

  /// Collapses the whole region back into one free block.
  pub fn reset(&self) {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    let head_addr = self.base.as_ptr() as u64;
    // SAFETY: the allocator exclusively owns `[base, base+size)`.
    unsafe {
      (head_addr as *mut FreelistHeader).write(FreelistHeader { size: self.size, prev: None, next: None, canary: 0 })
    };
    state.head = NonNull::new(head_addr as *mut FreelistHeader);
    state.free_set = PtrHashSet::new();
    state.free_set.insert(head_addr as usize);
    drop(state);
    self.used.store(0, Ordering::Relaxed);
    trace!("freelist_allocator_reset");
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

  /// Number of distinct free blocks currently in the chain.
  pub fn free_block_count(&self) -> usize {
    let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    let mut count = 0;
    let mut cursor = state.head;
    while let Some(block) = cursor {
      count += 1;
      // SAFETY: every chain member is live.
      cursor = unsafe { block.as_ref().next };
    }
    count
  }
}

impl Drop for FreelistAllocator {
  fn drop(&mut self) {
    // SAFETY: `base` was allocated by `raw_allocate(self.size)` in `create`.
    unsafe { raw::raw_free(self.base, self.size) };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn invalid_size_fails_construction() {
    assert!(FreelistAllocator::create(4).is_err());
  }

  // End-to-end fragmentation scenario: split, free every other block, coalesce.
  #[test]
  fn split_fragment_and_coalesce_frees_back_to_one_block() {
    let allocator = FreelistAllocator::create(1024).unwrap();
    let a = allocator.allocate(64).unwrap();
    let b = allocator.allocate(64).unwrap();
    let c = allocator.allocate(64).unwrap();
    assert_eq!(allocator.free_block_count(), 1); // remainder of the original block

    allocator.free(b);
    assert_eq!(allocator.free_block_count(), 2); // b's slot is isolated between a and c

    allocator.free(a);
    assert_eq!(allocator.free_block_count(), 2); // a merges with freed b

    allocator.free(c);
    assert_eq!(allocator.free_block_count(), 1); // everything merges back into one block
  }

  #[test]
  fn free_middle_block_then_allocate_double_size_succeeds() {
    let allocator = FreelistAllocator::create(1024).unwrap();
    let a = allocator.allocate(128).unwrap();
    let b = allocator.allocate(128).unwrap();
    let c = allocator.allocate(128).unwrap();
    allocator.free(b);
    assert!(allocator.allocate(256).is_some());
    allocator.free(a);
    allocator.free(c);
    assert!(allocator.allocate(256).is_some());
  }

  // A corrupted header canary must make free a no-op.
  #[test]
  fn bad_canary_free_is_noop() {
    let allocator = FreelistAllocator::create(1024).unwrap();
    let p = allocator.allocate(64).unwrap();
    let used_before = allocator.used_memory();
    // SAFETY: test-only corruption of the header canary, confined to this allocator's region.
    unsafe {
      let header = (p.as_ptr() as u64 - crate::block::FREELIST_HEADER_SIZE) as *mut crate::block::FreelistHeader;
      (*header).canary = 0;
    }
    allocator.free(p);
    assert_eq!(allocator.used_memory(), used_before);
  }

  #[test]
  fn out_of_range_free_is_noop() {
    let allocator = FreelistAllocator::create(1024).unwrap();
    let bogus = NonNull::new(0x1usize as *mut u8).unwrap();
    allocator.free(bogus);
    assert_eq!(allocator.used_memory(), 0);
  }

  #[test]
  fn allocation_beyond_capacity_fails() {
    let allocator = FreelistAllocator::create(128).unwrap();
    assert!(allocator.allocate(4096).is_none());
  }

  #[test]
  fn freeing_into_empty_list_then_reallocating_succeeds() {
    let allocator = FreelistAllocator::create(256).unwrap();
    let p = allocator.allocate(64).unwrap();
    assert_eq!(allocator.free_block_count(), 1);
    allocator.free(p);
    assert_eq!(allocator.free_block_count(), 1);
    assert!(allocator.allocate(64).is_some());
  }

  #[test]
  fn reset_collapses_to_single_free_block() {
    let allocator = FreelistAllocator::create(1024).unwrap();
    allocator.allocate(64).unwrap();
    allocator.allocate(128).unwrap();
    allocator.reset();
    assert_eq!(allocator.free_block_count(), 1);
    assert_eq!(allocator.used_memory(), 0);
  }
}
