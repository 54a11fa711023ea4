//! Platform facade: monotonic time, sleep, threads, and a counting
//! semaphore. The allocators themselves only depend on the mutex each
//! one embeds directly (`std::sync::Mutex`); this module exists for
//! callers building concurrency tests and harnesses on top of this
//! crate, mirroring the collaborator contract the allocators assume.

use std::sync::{Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Instant;

/// Monotonic seconds since an arbitrary epoch fixed at first call.
pub fn now() -> f64 {
  static EPOCH: OnceLock<Instant> = OnceLock::new();
  EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Suspends the current thread for at least `ms` milliseconds.
pub fn sleep(ms: u64) {
  std::thread::sleep(std::time::Duration::from_millis(ms));
}

/// Spawns `f` on a new OS thread, returning a handle to join it.
pub fn thread_spawn<F, T>(f: F) -> JoinHandle<T>
where
  F: FnOnce() -> T + Send + 'static,
  T: Send + 'static,
{
  std::thread::spawn(f)
}

/// Joins a single thread, propagating a panic message as an `Err`.
pub fn thread_join<T>(handle: JoinHandle<T>) -> Result<T, String> {
  handle.join().map_err(|_| "thread panicked".to_string())
}

/// Joins every handle in order, returning the first panic encountered, if any.
pub fn thread_join_all<T>(handles: Vec<JoinHandle<T>>) -> Result<Vec<T>, String> {
  handles.into_iter().map(thread_join).collect()
}

/// A counting semaphore built on a condition variable, standing in
/// for the platform facade's `zsemaphore_*` family.
pub struct Semaphore {
  state: Mutex<u32>,
  condvar: Condvar,
}

impl Semaphore {
  /// Creates a semaphore with `max_count` initial permits.
  pub fn new(max_count: u32) -> Self {
    Self { state: Mutex::new(max_count), condvar: Condvar::new() }
  }

  /// Releases one permit, waking a waiter if one is blocked.
  pub fn signal(&self) {
    let mut count = self.state.lock().unwrap_or_else(|e| e.into_inner());
    *count += 1;
    self.condvar.notify_one();
  }

  /// Blocks until a permit is available, then consumes it.
  pub fn wait(&self) {
    let mut count = self.state.lock().unwrap_or_else(|e| e.into_inner());
    while *count == 0 {
      count = self.condvar.wait(count).unwrap_or_else(|e| e.into_inner());
    }
    *count -= 1;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[test]
  fn now_is_monotonic() {
    let a = now();
    sleep(1);
    let b = now();
    assert!(b >= a);
  }

  #[test]
  fn semaphore_blocks_until_signaled() {
    let sem = Arc::new(Semaphore::new(0));
    let sem2 = Arc::clone(&sem);
    let handle = thread_spawn(move || {
      sem2.wait();
      42
    });
    sleep(10);
    sem.signal();
    assert_eq!(thread_join(handle).unwrap(), 42);
  }

  #[test]
  fn thread_join_all_collects_results() {
    let handles: Vec<_> = (0..4).map(|i| thread_spawn(move || i * 2)).collect();
    let results = thread_join_all(handles).unwrap();
    assert_eq!(results, vec![0, 2, 4, 6]);
  }
}
