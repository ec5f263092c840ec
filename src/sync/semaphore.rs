use std::sync::atomic::{AtomicI32, Ordering};

use crate::sync::event::ManualResetEvent;

/// Bounded permit counter for worker threads.
///
/// `try_enter` never blocks; the interesting wait is the opposite one:
/// `wait_empty` blocks until every permit has been returned, which is how
/// the scheduler knows all workers have wound down.
#[derive(Debug)]
pub struct SimpleSemaphore {
  count: AtomicI32,
  capacity: i32,
  empty: ManualResetEvent,
}

impl SimpleSemaphore {
  pub fn new(capacity: usize) -> SimpleSemaphore {
    SimpleSemaphore {
      count: AtomicI32::new(0),
      capacity: capacity.min(i32::MAX as usize) as i32,
      empty: ManualResetEvent::new(true),
    }
  }

  /// Takes a permit if one is available.
  pub fn try_enter(&self) -> bool {
    let prev = self.count.fetch_add(1, Ordering::AcqRel);
    if prev >= self.capacity {
      // Over capacity; undo.
      if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
        self.empty.set();
      }
      false
    } else {
      if prev == 0 {
        self.empty.reset();
      }
      true
    }
  }

  /// Returns a permit taken with `try_enter`.
  pub fn exit(&self) {
    let prev = self.count.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev > 0, "SimpleSemaphore::exit without matching try_enter");
    if prev == 1 {
      self.empty.set();
    }
  }

  pub fn count(&self) -> i32 {
    self.count.load(Ordering::Acquire)
  }

  /// Blocks until all permits have been returned.
  pub fn wait_empty(&self) {
    self.empty.wait();
  }
}
