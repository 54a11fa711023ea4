//! Shared header layouts and the canary used to validate a live block
//! on free. Each allocator variant places one of these headers
//! immediately before the payload it describes; the arithmetic that
//! walks from a payload pointer back to its header lives in the
//! owning allocator module, never here.

use std::ptr::NonNull;

/// Marks a live block. Cleared (set to `0`) when a block is freed.
pub const CANARY: u64 = 0xF7B3D591E6A4C208;

/// Alignments accepted by `allocate_aligned` on the linear and stack
/// allocators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
  Eight = 8,
  Sixteen = 16,
  ThirtyTwo = 32,
  SixtyFour = 64,
}

impl Alignment {
  pub const fn bytes(self) -> u64 {
    self as u64
  }
}

impl TryFrom<u64> for Alignment {
  type Error = ();

  fn try_from(value: u64) -> Result<Self, Self::Error> {
    match value {
      8 => Ok(Alignment::Eight),
      16 => Ok(Alignment::Sixteen),
      32 => Ok(Alignment::ThirtyTwo),
      64 => Ok(Alignment::SixtyFour),
      _ => Err(()),
    }
  }
}

/// Header for a free-list block: size (including header and trailing
/// pad), and the doubly-linked free-chain pointers.
#[repr(C)]
pub struct FreelistHeader {
  pub size: u64,
  pub prev: Option<NonNull<FreelistHeader>>,
  pub next: Option<NonNull<FreelistHeader>>,
  pub canary: u64,
}

/// Header for a buddy block: power-of-two size (including header),
/// and the doubly-linked free-list pointers for its size class.
#[repr(C)]
pub struct BuddyHeader {
  pub size: u64,
  pub prev: Option<NonNull<BuddyHeader>>,
  pub next: Option<NonNull<BuddyHeader>>,
  pub canary: u64,
}

/// Header for a pool chunk: a singly-linked free-chain pointer. Size
/// is implicit — the pool's fixed chunk size.
#[repr(C)]
pub struct PoolHeader {
  pub next: Option<NonNull<PoolHeader>>,
  pub canary: u64,
}

pub const FREELIST_HEADER_SIZE: u64 = std::mem::size_of::<FreelistHeader>() as u64;
pub const BUDDY_HEADER_SIZE: u64 = std::mem::size_of::<BuddyHeader>() as u64;
pub const POOL_HEADER_SIZE: u64 = std::mem::size_of::<PoolHeader>() as u64;
/// Stack allocator: no header struct, just the trailing 8-byte prior-`used` word.
pub const STACK_TRAILER_SIZE: u64 = 8;
