//! Error types surfaced at the allocator boundary.
//!
//! Matches the three failure kinds in the design: parameter errors,
//! capacity errors, and platform errors. `allocate` itself still
//! returns `Option<NonNull<u8>>` rather than `Result` — running out of
//! space is routine control flow, not an exceptional condition.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocError {
  #[error("invalid construction parameters: {0}")]
  InvalidParams(&'static str),

  #[error("no free block large enough after pressure response")]
  Capacity,

  #[error("invalid free: {0}")]
  InvalidFree(&'static str),

  #[error("allocator mutex was poisoned by a panicking thread")]
  LockPoisoned,

  #[error("platform facade call failed: {0}")]
  PlatformFailure(&'static str),
}

pub type Result<T> = std::result::Result<T, AllocError>;
