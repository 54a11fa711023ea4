//! # regionalloc - Region-Backed Sub-Allocator Library
//!
//! Five allocation strategies, each carving allocations out of one
//! pre-reserved contiguous region instead of talking to the system
//! allocator per call:
//!
//! ```text
//!   One region, five ways to slice it:
//!
//!   linear   [ A1 | A2 | A3 |        free space        ]   bump pointer, no free
//!   stack    [ A1 | A2 | A3 |        free space        ]   LIFO free only
//!   pool     [ C | C | C | C | C | C | C | C | C | C ]     fixed-size chunks
//!   freelist [ A1 | free | A2 |  free (merged)          ]  best-fit, splits, merges
//!   buddy    [   A1   |   A2   |        free            ]  power-of-two classes
//! ```
//!
//! ## Crate structure
//!
//! ```text
//!   regionalloc
//!   ├── align      - alignment/bit utilities (align_up!, is_power_of_two, next_pow2)
//!   ├── error      - AllocError and the crate Result alias
//!   ├── raw        - libc-backed region acquisition + allocated_memory() counter
//!   ├── platform   - monotonic time, sleep, thread spawn/join, Semaphore
//!   ├── hash_set   - intrusive pointer-keyed chained hash set (freelist coalescing)
//!   ├── block      - header layouts and the live-block canary
//!   ├── linear     - LinearAllocator (bump)
//!   ├── stack      - StackAllocator (LIFO)
//!   ├── pool       - PoolAllocator (fixed chunks)
//!   ├── freelist   - FreelistAllocator (best-fit, split/coalesce)
//!   └── buddy      - BuddyAllocator (power-of-two splitting)
//! ```
//!
//! ## Quick start
//!
//! ```rust
//! use regionalloc::{LinearAllocator, block::Alignment};
//!
//! let arena = LinearAllocator::create(4096).unwrap();
//! let ptr = arena.allocate_aligned(64, Alignment::Sixteen).unwrap();
//! assert_eq!(ptr.as_ptr() as usize % 16, 0);
//! arena.reset();
//! ```
//!
//! ## Design
//!
//! The five allocators are structurally similar but nominally
//! distinct: each owns its region, embeds its own locking, and frees
//! the region back via `Drop`. They deliberately do not share one
//! "universal" implementation — each algorithm's data layout is
//! fundamental to its performance — but they do share the
//! [`Allocator`] capability set for the operations common to all five:
//! `used_memory`, `unused_memory`, `capacity`, `reset`. `allocate` and
//! `free` are left off that trait because their signatures differ per
//! variant (pool's `allocate` takes no size; linear and stack take an
//! alignment; freelist and buddy don't expose LIFO-only `free`).
//!
//! Every header carries a fixed canary ([`block::CANARY`]) that marks
//! a block as currently live; it's cleared the moment a block returns
//! to a free list and re-set the moment one is handed back out, so
//! `free` can always tell a genuine live pointer from a stale or
//! foreign one.
//!
//! ## Safety
//!
//! This crate manages raw memory directly. Allocation, header
//! placement and pointer arithmetic are confined to narrow `unsafe`
//! blocks inside each module; the public API surface (`allocate`,
//! `free`, `reset`, the accessors) is entirely safe to call.

pub mod align;
pub mod block;
pub mod buddy;
pub mod error;
pub mod freelist;
pub mod hash_set;
pub mod linear;
pub mod platform;
pub mod pool;
pub mod raw;
pub mod stack;

pub use block::{Alignment, CANARY};
pub use buddy::BuddyAllocator;
pub use error::{AllocError, Result};
pub use freelist::FreelistAllocator;
pub use hash_set::PtrHashSet;
pub use linear::LinearAllocator;
pub use pool::PoolAllocator;
pub use stack::StackAllocator;

/// The capability set common to all five allocator variants.
///
/// Deliberately excludes `allocate`/`free`: their signatures vary by
/// variant (pool takes no size, linear/stack take an alignment,
/// freelist/buddy take a byte count), and forcing a single shape onto
/// them would obscure what each algorithm actually does.
pub trait Allocator {
  /// Bytes currently in use. May be stale by one concurrent operation.
  fn used_memory(&self) -> u64;
  /// Bytes still available. May be stale by one concurrent operation.
  fn unused_memory(&self) -> u64;
  /// Total region capacity.
  fn capacity(&self) -> u64;
  /// Discards every live allocation at once, returning the region to its initial state.
  fn reset(&self);
}

macro_rules! impl_allocator {
  ($ty:ty) => {
    impl Allocator for $ty {
      fn used_memory(&self) -> u64 {
        self.used_memory()
      }
      fn unused_memory(&self) -> u64 {
        self.unused_memory()
      }
      fn capacity(&self) -> u64 {
        self.capacity()
      }
      fn reset(&self) {
        self.reset()
      }
    }
  };
}

impl_allocator!(LinearAllocator);
impl_allocator!(StackAllocator);
impl_allocator!(PoolAllocator);
impl_allocator!(FreelistAllocator);
impl_allocator!(BuddyAllocator);

#[cfg(test)]
mod tests {
  use super::*;

  fn exercise(a: &impl Allocator) {
    assert_eq!(a.used_memory() + a.unused_memory(), a.capacity());
    a.reset();
    assert_eq!(a.used_memory(), 0);
  }

  #[test]
  fn every_variant_implements_the_shared_capability_set() {
    exercise(&LinearAllocator::create(1024).unwrap());
    exercise(&StackAllocator::create(1024).unwrap());
    exercise(&PoolAllocator::create(1024, 32).unwrap());
    exercise(&FreelistAllocator::create(1024).unwrap());
    exercise(&BuddyAllocator::create(1024, 32).unwrap());
  }
}
