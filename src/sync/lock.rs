use std::sync::atomic::{AtomicI32, Ordering};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

/// A component's exclusivity token.
///
/// Not a blocking mutex: the only acquisition is `try_lock`, and the whole
/// scheduler is built on the "try-lock or queue" pattern, which is also what
/// makes the lock non-reentrant by construction. `hold` bumps the count
/// without acquiring, which is how back-pressure freezes an upstream
/// emitter.
#[derive(Debug, Default)]
pub struct SynchronizationLock {
  count: AtomicI32,
}

impl SynchronizationLock {
  pub fn new() -> SynchronizationLock {
    SynchronizationLock {
      count: AtomicI32::new(0),
    }
  }

  /// Attempts to take the lock. Succeeds only when no-one holds it.
  pub fn try_lock(&self) -> bool {
    self
      .count
      .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  /// Unconditionally adds a hold, preventing `try_lock` from succeeding
  /// until a matching `release`. Used by `Scheduler::freeze`.
  pub fn hold(&self) {
    self.count.fetch_add(1, Ordering::AcqRel);
  }

  /// Releases one hold.
  ///
  /// Panics on over-release: the count going negative means the core has
  /// unbalanced lock bookkeeping, which is never recoverable.
  pub fn release(&self) {
    let prev = self.count.fetch_sub(1, Ordering::AcqRel);
    if prev <= 0 {
      error!("SynchronizationLock over-released (count was {prev})");
      panic!("{}", crate::error::PipelineError::LockReleaseImbalance);
    }
  }

  pub fn is_held(&self) -> bool {
    self.count.load(Ordering::Acquire) > 0
  }
}
