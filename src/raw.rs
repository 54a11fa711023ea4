//! Raw memory facade: page/region-granularity allocation on top of
//! `libc`, plus the process-wide `allocated_memory` counter the test
//! suite inspects to confirm every allocator gives its region back on
//! `destroy`.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;

use tracing::{error, trace};

static ALLOCATED_MEMORY: Mutex<u64> = Mutex::new(0);

/// Current number of bytes handed out by [`raw_allocate`] and not yet
/// returned via [`raw_free`]. Read-only; used by tests to assert that
/// `destroy` returns a region's bytes to the process.
pub fn allocated_memory() -> u64 {
  *ALLOCATED_MEMORY.lock().unwrap_or_else(|e| e.into_inner())
}

/// Allocates `bytes` zeroed bytes from the system allocator.
///
/// Returns `None` on allocation failure or when `bytes == 0`.
pub fn raw_allocate(bytes: u64) -> Option<NonNull<u8>> {
  if bytes == 0 {
    return None;
  }
  // SAFETY: libc::malloc is always safe to call with a plain size.
  let ptr = unsafe { libc::malloc(bytes as usize) } as *mut u8;
  let ptr = NonNull::new(ptr)?;
  // SAFETY: `ptr` was just allocated with `bytes` capacity.
  unsafe { mem_set_zero(ptr, bytes) };
  let mut counter = ALLOCATED_MEMORY.lock().unwrap_or_else(|e| e.into_inner());
  *counter += bytes;
  trace!(bytes, "raw_allocate");
  Some(ptr)
}

/// Releases a region previously returned by [`raw_allocate`].
///
/// # Safety
///
/// `ptr` must have been returned by `raw_allocate(bytes)` with the
/// same `bytes`, and must not already have been freed.
pub unsafe fn raw_free(ptr: NonNull<u8>, bytes: u64) {
  // SAFETY: forwarded from the caller's contract.
  unsafe { libc::free(ptr.as_ptr() as *mut c_void) };
  let mut counter = ALLOCATED_MEMORY.lock().unwrap_or_else(|e| e.into_inner());
  match counter.checked_sub(bytes) {
    Some(v) => *counter = v,
    None => {
      error!(bytes, "raw_free: counter underflow, clamping to 0");
      *counter = 0;
    }
  }
  trace!(bytes, "raw_free");
}

/// Sets `size` bytes starting at `ptr` to `value`.
///
/// # Safety
///
/// `ptr` must be valid for writes of `size` bytes.
pub unsafe fn mem_set(ptr: NonNull<u8>, value: u8, size: u64) {
  // SAFETY: forwarded from the caller's contract.
  unsafe { libc::memset(ptr.as_ptr() as *mut c_void, value as i32, size as usize) };
}

/// Zeroes `size` bytes starting at `ptr`.
///
/// # Safety
///
/// `ptr` must be valid for writes of `size` bytes.
pub unsafe fn mem_set_zero(ptr: NonNull<u8>, size: u64) {
  // SAFETY: forwarded from the caller's contract.
  unsafe { mem_set(ptr, 0, size) };
}

/// Copies `size` non-overlapping bytes from `src` to `dest`.
///
/// # Safety
///
/// `dest` and `src` must each be valid for `size` bytes and must not overlap.
pub unsafe fn mem_copy(dest: NonNull<u8>, src: NonNull<u8>, size: u64) {
  // SAFETY: forwarded from the caller's contract.
  unsafe { libc::memcpy(dest.as_ptr() as *mut c_void, src.as_ptr() as *const c_void, size as usize) };
}

/// Copies `size` possibly-overlapping bytes from `src` to `dest`.
///
/// # Safety
///
/// `dest` and `src` must each be valid for `size` bytes.
pub unsafe fn mem_move(dest: NonNull<u8>, src: NonNull<u8>, size: u64) {
  // SAFETY: forwarded from the caller's contract.
  unsafe { libc::memmove(dest.as_ptr() as *mut c_void, src.as_ptr() as *const c_void, size as usize) };
}

/// Lexicographically compares `size` bytes at `a` and `b`.
///
/// # Safety
///
/// `a` and `b` must each be valid for `size` bytes.
pub unsafe fn mem_compare(a: NonNull<u8>, b: NonNull<u8>, size: u64) -> i32 {
  // SAFETY: forwarded from the caller's contract.
  unsafe { libc::memcmp(a.as_ptr() as *const c_void, b.as_ptr() as *const c_void, size as usize) }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn raw_allocate_zeroes_and_tracks_counter() {
    let before = allocated_memory();
    let region = raw_allocate(256).expect("allocation should succeed");
    assert_eq!(allocated_memory(), before + 256);

    // SAFETY: region is valid for 256 bytes, just allocated.
    unsafe {
      let mut buf = [0u8; 256];
      std::ptr::copy_nonoverlapping(region.as_ptr(), buf.as_mut_ptr(), 256);
      assert!(buf.iter().all(|&b| b == 0));
      raw_free(region, 256);
    }
    assert_eq!(allocated_memory(), before);
  }

  #[test]
  fn raw_allocate_zero_bytes_fails() {
    assert!(raw_allocate(0).is_none());
  }

  #[test]
  fn mem_copy_and_compare_round_trip() {
    let a = raw_allocate(16).unwrap();
    let b = raw_allocate(16).unwrap();
    unsafe {
      mem_set(a, 0xAB, 16);
      mem_copy(b, a, 16);
      assert_eq!(mem_compare(a, b, 16), 0);
      raw_free(a, 16);
      raw_free(b, 16);
    }
  }
}
